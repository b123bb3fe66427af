//! Property-Based Tests for the MME core
//!
//! Identifier uniqueness, bearer pool conservation, TFT precedence
//! freedom, AMBR bound, idempotent release and handover atomicity.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    use proptest::prelude::*;

    use crate::config::MmeConfig;
    use crate::connection::{UeRef, UeState};
    use crate::context::{
        AssocId, Bitrate, Ebi, EnbUeS1apId, EpsTai, MmeContext, MmeUeS1apId, Paa, PlmnId, Qos,
        Tunnel, UeLocation,
    };
    use crate::event::{AppIndication, AppRequest, S1apInbound};
    use crate::s1ap_build::{ErabSetupItem, ReleaseCause, S1apCause, S1apOutbound};
    use crate::s1ap_handler::{
        HandoverCancelData, HandoverFailureData, HandoverNotifyData,
        HandoverRequestAcknowledgeData, InitialContextSetupResponseData, InitialUeMessageData,
        S1SetupRequestData, UeContextReleaseCompleteData,
    };
    use crate::session::{
        AmbrPolicy, PdnRequest, ProcedureId, ReleaseScope, SessionPool, SlotOwner,
    };
    use crate::tft::{FilterComponent, PacketFilter, Tft, TftEdit};
    use crate::timer::ManualTimerService;

    const IMSI: &str = "001010123456789";
    const SOURCE: AssocId = 1;
    const TARGET: AssocId = 2;

    // ========================================================================
    // Fixtures
    // ========================================================================

    fn tunnel(teid: u32) -> Tunnel {
        Tunnel::new(teid, IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)))
    }

    fn pdn_request(ambr: Bitrate) -> PdnRequest {
        PdnRequest {
            apn: "internet".into(),
            paa: Paa::default(),
            ambr,
            default_qos: Qos::non_gbr(9),
            core_tunnel: Some(tunnel(1)),
            anchor_tunnel: Some(tunnel(2)),
        }
    }

    fn mme() -> (MmeContext, ManualTimerService) {
        let timers = ManualTimerService::new();
        let mut ctx = MmeContext::new(MmeConfig::default(), Box::new(timers.clone()));
        let plmn = PlmnId::new("001", "01");
        for (assoc_id, enb_id) in [(SOURCE, 0x100), (TARGET, 0x200)] {
            ctx.handle_association_up(assoc_id, 2, 4, None).unwrap();
            ctx.handle_s1ap(
                assoc_id,
                0,
                S1apInbound::S1SetupRequest(S1SetupRequestData {
                    enb_id,
                    plmn_id: plmn,
                    supported_ta_list: vec![EpsTai::new(plmn, 1)],
                    ..Default::default()
                }),
            )
            .unwrap();
        }
        ctx.conn.take_outbox();
        (ctx, timers)
    }

    fn initial_ue(ctx: &mut MmeContext, assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId) {
        ctx.handle_s1ap(
            assoc_id,
            1,
            S1apInbound::InitialUeMessage(InitialUeMessageData {
                enb_ue_s1ap_id,
                nas_pdu: vec![0x07],
                location: UeLocation::default(),
            }),
        )
        .unwrap();
    }

    /// Connected UE at the source with an active default bearer
    fn connected_ue(ctx: &mut MmeContext) -> (MmeUeS1apId, Ebi) {
        initial_ue(ctx, SOURCE, 7);
        let ue_id = ctx.conn.find_by_pair(SOURCE, 7).unwrap();
        let core_id = ctx.conn.get(ue_id).unwrap().mme_ue_s1ap_id.unwrap();
        ctx.handle_app_request(AppRequest::BindSubscriber {
            mme_ue_s1ap_id: core_id,
            subscriber: IMSI.into(),
            ue_ambr: Bitrate::new(1000, 1000),
        })
        .unwrap();
        let ebi = ctx
            .sessions
            .pool_mut(IMSI)
            .unwrap()
            .create_pdn_connection(pdn_request(Bitrate::new(100, 100)), AmbrPolicy::Reject)
            .unwrap()
            .default_ebi;
        ctx.handle_s1ap(
            SOURCE,
            1,
            S1apInbound::InitialContextSetupResponse(InitialContextSetupResponseData {
                mme_ue_s1ap_id: core_id,
                enb_ue_s1ap_id: 7,
                e_rab_setup: vec![ErabSetupItem {
                    ebi,
                    tunnel: tunnel(3),
                }],
                e_rab_failed: vec![],
            }),
        )
        .unwrap();
        ctx.conn.take_outbox();
        (core_id, ebi)
    }

    fn filter(identifier: u8, precedence: u8) -> PacketFilter {
        PacketFilter::new(
            identifier,
            precedence,
            vec![FilterComponent::ProtocolIdentifier(6)],
        )
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    #[derive(Debug, Clone)]
    enum ConnOp {
        Access { assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId },
        Release { assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId },
        Complete { assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId },
        Expire,
    }

    fn arb_conn_op() -> impl Strategy<Value = ConnOp> {
        let pair = (1u64..=2, 0u32..6);
        prop_oneof![
            3 => pair.clone().prop_map(|(assoc_id, enb_ue_s1ap_id)| ConnOp::Access { assoc_id, enb_ue_s1ap_id }),
            2 => pair.clone().prop_map(|(assoc_id, enb_ue_s1ap_id)| ConnOp::Release { assoc_id, enb_ue_s1ap_id }),
            2 => pair.prop_map(|(assoc_id, enb_ue_s1ap_id)| ConnOp::Complete { assoc_id, enb_ue_s1ap_id }),
            1 => Just(ConnOp::Expire),
        ]
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        CreatePdn { ambr: u64, clamp: bool },
        Dedicated { pdn_id: u8, precedence: u8 },
        Activate { ebi: Ebi },
        Complete,
        Abort,
        Release { pdn_id: u8 },
        TearDown { pdn_id: u8 },
    }

    fn arb_pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            (0u64..800, any::<bool>()).prop_map(|(ambr, clamp)| PoolOp::CreatePdn { ambr, clamp }),
            (1u8..=3, 0u8..8).prop_map(|(pdn_id, precedence)| PoolOp::Dedicated { pdn_id, precedence }),
            (5u8..=15).prop_map(|ebi| PoolOp::Activate { ebi }),
            Just(PoolOp::Complete),
            Just(PoolOp::Abort),
            (1u8..=3).prop_map(|pdn_id| PoolOp::Release { pdn_id }),
            (1u8..=3).prop_map(|pdn_id| PoolOp::TearDown { pdn_id }),
        ]
    }

    fn arb_filters() -> impl Strategy<Value = Vec<PacketFilter>> {
        prop::collection::vec((0u8..16, 0u8..6), 1..4)
            .prop_map(|pairs| pairs.into_iter().map(|(id, prec)| filter(id, prec)).collect())
    }

    fn arb_tft_edit() -> impl Strategy<Value = TftEdit> {
        prop_oneof![
            arb_filters().prop_map(TftEdit::Create),
            arb_filters().prop_map(TftEdit::Add),
            arb_filters().prop_map(TftEdit::Replace),
            prop::collection::vec(0u8..16, 0..3).prop_map(TftEdit::Delete),
            Just(TftEdit::DeleteExisting),
            Just(TftEdit::NoOperation),
        ]
    }

    #[derive(Debug, Clone, Copy)]
    enum Interruption {
        TargetFailure,
        SourceCancel,
        RelocTimeout,
        TargetTransportLost,
        None,
    }

    fn arb_interruption() -> impl Strategy<Value = Interruption> {
        prop_oneof![
            Just(Interruption::TargetFailure),
            Just(Interruption::SourceCancel),
            Just(Interruption::RelocTimeout),
            Just(Interruption::TargetTransportLost),
            Just(Interruption::None),
        ]
    }

    // ========================================================================
    // Connection Registry Properties
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Live MME UE S1AP IDs and eNB-side pairs stay unique, and every
        /// core ID resolves to the record carrying it
        #[test]
        fn prop_identifiers_unique(ops in prop::collection::vec(arb_conn_op(), 1..40)) {
            let (mut ctx, timers) = mme();
            for op in ops {
                match op {
                    ConnOp::Access { assoc_id, enb_ue_s1ap_id } => {
                        initial_ue(&mut ctx, assoc_id, enb_ue_s1ap_id);
                    }
                    ConnOp::Release { assoc_id, enb_ue_s1ap_id } => {
                        ctx.handle_app_request(AppRequest::UeContextRelease {
                            target: UeRef::Pair { assoc_id, enb_ue_s1ap_id },
                            cause: ReleaseCause::Normal,
                        }).unwrap();
                    }
                    ConnOp::Complete { assoc_id, enb_ue_s1ap_id } => {
                        ctx.handle_s1ap(
                            assoc_id,
                            1,
                            S1apInbound::UeContextReleaseComplete(UeContextReleaseCompleteData {
                                mme_ue_s1ap_id: 0,
                                enb_ue_s1ap_id,
                            }),
                        ).unwrap();
                    }
                    ConnOp::Expire => {
                        if let Some(handle) = timers.pending().first().copied() {
                            ctx.handle_timer_expired(handle);
                        }
                    }
                }
                ctx.conn.take_outbox();

                let mut core_ids = HashSet::new();
                let mut pairs = HashSet::new();
                for ue in ctx.conn.iter() {
                    if let Some(id) = ue.mme_ue_s1ap_id {
                        prop_assert!(core_ids.insert(id));
                        prop_assert_eq!(ctx.conn.find_by_core_id(id), Some(ue.id));
                    }
                    if let Some(enb_ue_s1ap_id) = ue.enb_ue_s1ap_id {
                        prop_assert!(pairs.insert((ue.assoc_id, enb_ue_s1ap_id)));
                    }
                }
                prop_assert_eq!(ctx.conn.core_ids().len(), core_ids.len());
            }
        }

        /// Repeated release commands and completes yield one command on the
        /// wire and one release complete upward
        #[test]
        fn prop_release_idempotent(commands in 1usize..4, completes in 1usize..4) {
            let (mut ctx, _) = mme();
            initial_ue(&mut ctx, SOURCE, 3);
            ctx.conn.take_outbox();

            let mut sent = 0;
            let mut indicated = 0;
            for _ in 0..commands {
                ctx.handle_app_request(AppRequest::UeContextRelease {
                    target: UeRef::Pair { assoc_id: SOURCE, enb_ue_s1ap_id: 3 },
                    cause: ReleaseCause::Detach,
                }).unwrap();
                sent += ctx.conn.take_outbox().s1ap.iter()
                    .filter(|out| matches!(out.message, S1apOutbound::UeContextReleaseCommand { .. }))
                    .count();
            }
            for _ in 0..completes {
                ctx.handle_s1ap(
                    SOURCE,
                    1,
                    S1apInbound::UeContextReleaseComplete(UeContextReleaseCompleteData {
                        mme_ue_s1ap_id: 0,
                        enb_ue_s1ap_id: 3,
                    }),
                ).unwrap();
                indicated += ctx.conn.take_outbox().app.iter()
                    .filter(|ind| matches!(ind, AppIndication::ReleaseComplete { .. }))
                    .count();
            }

            prop_assert_eq!(sent, 1);
            prop_assert_eq!(indicated, 1);
            prop_assert!(ctx.conn.is_empty());
            prop_assert!(ctx.conn.core_ids().is_empty());
        }
    }

    // ========================================================================
    // Session Pool Properties
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Free plus assigned always equals capacity, and each assigned slot
        /// belongs to exactly the PDN connection that lists it
        #[test]
        fn prop_pool_conserved(ops in prop::collection::vec(arb_pool_op(), 1..40)) {
            let mut pool = SessionPool::new(Bitrate::new(1000, 1000), 3, 16);
            let mut procedures: Vec<ProcedureId> = Vec::new();

            for op in ops {
                match op {
                    PoolOp::CreatePdn { ambr, clamp } => {
                        let policy = if clamp { AmbrPolicy::ClampToHeadroom } else { AmbrPolicy::Reject };
                        let _ = pool.create_pdn_connection(pdn_request(Bitrate::new(ambr, ambr)), policy);
                    }
                    PoolOp::Dedicated { pdn_id, precedence } => {
                        if let Some(default_ebi) = pool.pdn(pdn_id).map(|pdn| pdn.default_ebi) {
                            let edit = TftEdit::Create(vec![filter(1, precedence)]);
                            if let Ok(allocation) = pool.allocate_dedicated_bearer(pdn_id, default_ebi, Qos::non_gbr(8), edit) {
                                procedures.push(allocation.procedure);
                            }
                        }
                    }
                    PoolOp::Activate { ebi } => {
                        let _ = pool.mark_access_plane_updated(ebi, tunnel(u32::from(ebi)));
                    }
                    PoolOp::Complete => {
                        if let Some(id) = procedures.pop() {
                            let _ = pool.complete_procedure(id);
                        }
                    }
                    PoolOp::Abort => {
                        if let Some(id) = procedures.pop() {
                            let _ = pool.abort_procedure(id);
                        }
                    }
                    PoolOp::Release { pdn_id } => {
                        let _ = pool.release_bearers(ReleaseScope::Pdn(pdn_id));
                    }
                    PoolOp::TearDown { pdn_id } => {
                        let _ = pool.tear_down_pdn_connection(pdn_id);
                    }
                }

                prop_assert!(pool.is_conserved());
                let mut listed = 0;
                for pdn in pool.pdns() {
                    prop_assert!(pdn.bearers.contains(&pdn.default_ebi));
                    for ebi in &pdn.bearers {
                        prop_assert_eq!(pool.bearer(*ebi).map(|b| b.owner), Some(SlotOwner::Pdn(pdn.id)));
                    }
                    listed += pdn.bearers.len();
                }
                prop_assert_eq!(listed, pool.assigned_count());
            }
        }

        /// Committed APN-AMBRs never exceed the UE-AMBR
        #[test]
        fn prop_ambr_bound(
            ue_ambr in (1u64..2000, 1u64..2000),
            requests in prop::collection::vec((0u64..1500, 0u64..1500, any::<bool>(), any::<bool>()), 1..8),
        ) {
            let ue_ambr = Bitrate::new(ue_ambr.0, ue_ambr.1);
            let mut pool = SessionPool::new(ue_ambr, 4, 16);
            for (downlink, uplink, clamp, modify) in requests {
                let policy = if clamp { AmbrPolicy::ClampToHeadroom } else { AmbrPolicy::Reject };
                let ambr = Bitrate::new(downlink, uplink);
                let first_pdn = pool.pdns().next().map(|pdn| pdn.id);
                match first_pdn {
                    Some(pdn_id) if modify => {
                        let _ = pool.modify_pdn_ambr(pdn_id, ambr, policy);
                    }
                    _ => {
                        let _ = pool.create_pdn_connection(pdn_request(ambr), policy);
                    }
                }
                prop_assert!(pool.aggregate_bitrate(None).fits_within(&ue_ambr));
            }
        }

        /// Whatever sequence of edits is applied, an accepted template has
        /// pairwise distinct precedences and stays within the filter limit
        #[test]
        fn prop_tft_precedence_free(
            edits in prop::collection::vec(arb_tft_edit(), 1..12),
            is_default in any::<bool>(),
        ) {
            let mut current: Option<Tft> = None;
            for edit in edits {
                // A rejected edit leaves the template as it was
                if let Ok(next) = Tft::apply(current.as_ref(), edit, is_default, 8) {
                    if let Some(tft) = &next {
                        prop_assert!(tft.precedences_distinct());
                        prop_assert!(tft.len() <= 8);
                        prop_assert!(!tft.is_empty());
                        let ids: HashSet<u8> = tft.filters().iter().map(|f| f.identifier).collect();
                        prop_assert_eq!(ids.len(), tft.len());
                    }
                    current = next;
                }
            }
        }
    }

    // ========================================================================
    // Mobility Properties
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A handover either commits (core ID on the target, source
        /// released) or leaves the source untouched; no tentative record
        /// survives an abort
        #[test]
        fn prop_handover_atomic(acknowledged in any::<bool>(), interruption in arb_interruption()) {
            let (mut ctx, timers) = mme();
            let (core_id, ebi) = connected_ue(&mut ctx);
            let source = ctx.conn.find_by_core_id(core_id).unwrap();

            ctx.handle_app_request(AppRequest::HandoverRequest {
                source_mme_ue_s1ap_id: core_id,
                target_enb_id: 0x200,
                cause: S1apCause::default(),
                bearers: vec![ebi],
                container: vec![],
            }).unwrap();
            let target = ctx.mobility.target_of(core_id).unwrap();

            let acknowledged = acknowledged || matches!(interruption, Interruption::None);
            if acknowledged {
                ctx.handle_s1ap(
                    TARGET,
                    1,
                    S1apInbound::HandoverRequestAcknowledge(HandoverRequestAcknowledgeData {
                        mme_ue_s1ap_id: core_id,
                        enb_ue_s1ap_id: 9,
                        admitted: vec![ErabSetupItem { ebi, tunnel: tunnel(9) }],
                        not_admitted: vec![],
                        container: vec![],
                    }),
                ).unwrap();
            }
            // The source keeps the core ID throughout preparation
            prop_assert_eq!(ctx.conn.find_by_core_id(core_id), Some(source));

            match interruption {
                Interruption::TargetFailure => {
                    ctx.handle_s1ap(
                        TARGET,
                        1,
                        S1apInbound::HandoverFailure(HandoverFailureData {
                            mme_ue_s1ap_id: core_id,
                            cause: S1apCause::default(),
                        }),
                    ).unwrap();
                }
                Interruption::SourceCancel => {
                    ctx.handle_s1ap(
                        SOURCE,
                        1,
                        S1apInbound::HandoverCancel(HandoverCancelData {
                            mme_ue_s1ap_id: core_id,
                            enb_ue_s1ap_id: 7,
                            cause: S1apCause::default(),
                        }),
                    ).unwrap();
                }
                Interruption::RelocTimeout => {
                    for handle in timers.pending() {
                        ctx.handle_timer_expired(handle);
                    }
                }
                Interruption::TargetTransportLost => ctx.handle_association_down(TARGET, false),
                Interruption::None => {
                    ctx.handle_s1ap(
                        TARGET,
                        1,
                        S1apInbound::HandoverNotify(HandoverNotifyData {
                            mme_ue_s1ap_id: core_id,
                            enb_ue_s1ap_id: 9,
                            location: UeLocation::default(),
                        }),
                    ).unwrap();
                }
            }

            prop_assert_eq!(ctx.mobility.in_progress(), 0);
            match interruption {
                Interruption::None => {
                    prop_assert_eq!(ctx.conn.find_by_core_id(core_id), Some(target));
                    prop_assert_eq!(ctx.conn.get(target).map(|ue| ue.state), Some(UeState::Connected));
                    prop_assert_eq!(
                        ctx.conn.get(source).map(|ue| ue.state),
                        Some(UeState::AwaitingReleaseComplete)
                    );
                }
                _ => {
                    prop_assert_eq!(ctx.conn.find_by_core_id(core_id), Some(source));
                    prop_assert!(ctx.conn.get(target).is_none());
                    let ue = ctx.conn.get(source).unwrap();
                    prop_assert_eq!(ue.state, UeState::Connected);
                    prop_assert!(ue.handover.is_none());
                    prop_assert_eq!(ctx.conn.len(), 1);
                }
            }
        }
    }
}
