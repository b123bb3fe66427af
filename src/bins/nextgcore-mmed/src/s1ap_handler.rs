//! S1AP Message Handling
//!
//! Decoded S1AP payloads and their handlers. Handlers run on `MmeContext`
//! since most of them touch more than one registry.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use crate::association::DownOutcome;
use crate::connection::{HandoverLeg, RemovedUe};
use crate::context::{
    AssocId, Ebi, EnbId, EnbUeS1apId, EpsTai, MmeContext, MmeUeS1apId, PlmnId, UeId, UeLocation,
};
use crate::error::MmeResult;
use crate::event::{route, AppIndication, AppRequest, DispatchOutcome, HandoverFailureReason, S1apInbound};
use crate::mobility::MobilityError;
use crate::s1ap_build::{
    build_enb_configuration_update_failure, build_paging, build_setup_failure,
    build_setup_response, misc_cause, protocol_cause, radio_network_cause, ErabSetupItem,
    S1apCause, S1apCauseGroup, S1apOutbound, NON_UE_SIGNALLING_STREAM,
};

// ============================================================================
// S1 Setup Request Data
// ============================================================================

/// S1 Setup Request data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S1SetupRequestData {
    /// Global eNB ID
    pub enb_id: EnbId,
    /// PLMN of the global eNB ID
    pub plmn_id: PlmnId,
    /// eNB name (optional)
    pub enb_name: Option<String>,
    /// Supported TAs, one entry per (broadcast PLMN, TAC)
    pub supported_ta_list: Vec<EpsTai>,
    /// Default paging DRX
    pub default_paging_drx: Option<u8>,
}

/// eNB Configuration Update data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnbConfigurationUpdateData {
    pub enb_name: Option<String>,
    pub supported_ta_list: Option<Vec<EpsTai>>,
    pub default_paging_drx: Option<u8>,
}

/// UE-associated logical S1 connection named in a reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetItem {
    pub mme_ue_s1ap_id: Option<MmeUeS1apId>,
    pub enb_ue_s1ap_id: Option<EnbUeS1apId>,
}

/// Reset type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResetScope {
    /// S1 interface
    #[default]
    All,
    /// Part of S1 interface
    Partial(Vec<ResetItem>),
}

/// Reset data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetData {
    pub cause: S1apCause,
    pub scope: ResetScope,
}

// ============================================================================
// NAS Transport Data
// ============================================================================

/// Initial UE Message data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialUeMessageData {
    /// eNB UE S1AP ID
    pub enb_ue_s1ap_id: EnbUeS1apId,
    /// NAS PDU
    pub nas_pdu: Vec<u8>,
    /// TAI and E-CGI
    pub location: UeLocation,
}

/// Uplink NAS Transport data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkNasTransportData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub nas_pdu: Vec<u8>,
    pub location: UeLocation,
}

/// UE Capability Info Indication data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeCapabilityInfoIndicationData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub ue_radio_capability: Vec<u8>,
}

// ============================================================================
// UE Context Data
// ============================================================================

/// UE Context Release Request data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeContextReleaseRequestData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub cause: S1apCause,
}

/// UE Context Release Complete data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeContextReleaseCompleteData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
}

/// Initial Context Setup Response data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialContextSetupResponseData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    /// E-RAB Setup List
    pub e_rab_setup: Vec<ErabSetupItem>,
    /// E-RAB Failed to Setup List
    pub e_rab_failed: Vec<Ebi>,
}

/// Initial Context Setup Failure data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialContextSetupFailureData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub cause: S1apCause,
}

// ============================================================================
// E-RAB Management Data
// ============================================================================

/// E-RAB Setup Response data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErabSetupResponseData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub setup: Vec<ErabSetupItem>,
    pub failed: Vec<Ebi>,
}

/// E-RAB Modify Response data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErabModifyResponseData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub modified: Vec<Ebi>,
    pub failed: Vec<Ebi>,
}

/// E-RAB Release Response data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErabReleaseResponseData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub released: Vec<Ebi>,
    pub failed: Vec<Ebi>,
}

// ============================================================================
// Mobility Data
// ============================================================================

/// Path Switch Request data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSwitchRequestData {
    /// eNB UE S1AP ID at the new eNB
    pub enb_ue_s1ap_id: EnbUeS1apId,
    /// MME UE S1AP ID the UE had at the source
    pub source_mme_ue_s1ap_id: MmeUeS1apId,
    /// E-RAB To Be Switched in Downlink List
    pub e_rab_to_be_switched: Vec<ErabSetupItem>,
    pub location: UeLocation,
}

/// Handover Required data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverRequiredData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub target_enb_id: EnbId,
    pub target_tai: Option<EpsTai>,
    pub cause: S1apCause,
    /// Source to Target Transparent Container
    pub container: Vec<u8>,
}

/// Handover Request Acknowledge data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverRequestAcknowledgeData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    /// eNB UE S1AP ID allocated by the target
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub admitted: Vec<ErabSetupItem>,
    pub not_admitted: Vec<Ebi>,
    /// Target to Source Transparent Container
    pub container: Vec<u8>,
}

/// Handover Failure data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverFailureData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub cause: S1apCause,
}

/// Handover Notify data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverNotifyData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub location: UeLocation,
}

/// Handover Cancel data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverCancelData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub cause: S1apCause,
}

/// eNB Status Transfer data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnbStatusTransferData {
    pub mme_ue_s1ap_id: MmeUeS1apId,
    pub enb_ue_s1ap_id: EnbUeS1apId,
    pub container: Vec<u8>,
}

// ============================================================================
// Transport Events
// ============================================================================

impl MmeContext {
    /// SCTP association up
    pub fn handle_association_up(
        &mut self,
        assoc_id: AssocId,
        inbound_streams: u16,
        outbound_streams: u16,
        addr: Option<SocketAddr>,
    ) -> MmeResult<()> {
        self.conn
            .associations()
            .on_association_up(assoc_id, inbound_streams, outbound_streams, addr)?;
        Ok(())
    }

    /// SCTP association down: abort handovers touching it, then fan out
    /// release to the UEs still anchored there
    pub fn handle_association_down(&mut self, assoc_id: AssocId, is_reset: bool) {
        let outcome = self.conn.associations().on_association_down(assoc_id, is_reset);
        self.mobility.on_association_down(&mut self.conn, assoc_id);
        match outcome {
            DownOutcome::Draining(ues) => self.conn.on_association_down(&ues),
            DownOutcome::Removed | DownOutcome::Reinitialized | DownOutcome::Unknown => {}
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route one decoded S1AP message to its handler
    pub fn handle_s1ap(
        &mut self,
        assoc_id: AssocId,
        stream_id: u16,
        message: S1apInbound,
    ) -> MmeResult<DispatchOutcome> {
        let code = message.procedure_code();
        let direction = message.direction();
        match route(code, direction) {
            DispatchOutcome::Handled => {}
            DispatchOutcome::NoHandler => {
                log::warn!(
                    "[assoc:{}] no handler for procedure {} ({:?})",
                    assoc_id,
                    code,
                    direction
                );
                return Ok(DispatchOutcome::NoHandler);
            }
            DispatchOutcome::OutOfRange => {
                log::error!("[assoc:{}] procedure code {} out of range", assoc_id, code);
                return Ok(DispatchOutcome::OutOfRange);
            }
        }

        match message {
            S1apInbound::S1SetupRequest(data) => self.handle_s1_setup_request(assoc_id, data)?,
            S1apInbound::InitialUeMessage(data) => {
                self.conn.on_initial_access(
                    assoc_id,
                    stream_id,
                    data.enb_ue_s1ap_id,
                    data.nas_pdu,
                    data.location,
                )?;
            }
            S1apInbound::UplinkNasTransport(data) => {
                self.conn.on_uplink(
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    Some(data.mme_ue_s1ap_id),
                    data.nas_pdu,
                    data.location,
                );
            }
            S1apInbound::UeContextReleaseRequest(data) => {
                self.conn.on_context_release_request(
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.cause,
                );
            }
            S1apInbound::UeContextReleaseComplete(data) => {
                if let Some(ue_id) = self.conn.find_by_pair(assoc_id, data.enb_ue_s1ap_id) {
                    self.abort_handover_from_source(ue_id);
                }
                if let Some(removed) = self.conn.on_release_complete(assoc_id, data.enb_ue_s1ap_id)
                {
                    self.release_access_planes(&removed);
                }
            }
            S1apInbound::InitialContextSetupResponse(data) => {
                self.handle_initial_context_setup_response(assoc_id, data)?
            }
            S1apInbound::InitialContextSetupFailure(data) => {
                self.conn.on_context_setup_failure(
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.cause,
                );
            }
            S1apInbound::UeCapabilityInfoIndication(data) => {
                self.conn.on_ue_capability_info(
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.ue_radio_capability,
                );
            }
            S1apInbound::ErabSetupResponse(data) => self.handle_erab_setup_response(assoc_id, data)?,
            S1apInbound::ErabModifyResponse(data) => {
                if self
                    .conn
                    .resolve_uplink(assoc_id, data.enb_ue_s1ap_id, Some(data.mme_ue_s1ap_id))
                    .is_some()
                {
                    self.conn
                        .outbox_mut()
                        .indicate(AppIndication::ErabModifyConfirmed {
                            mme_ue_s1ap_id: data.mme_ue_s1ap_id,
                            modified: data.modified,
                            failed: data.failed,
                        });
                }
            }
            S1apInbound::ErabReleaseResponse(data) => {
                if self
                    .conn
                    .resolve_uplink(assoc_id, data.enb_ue_s1ap_id, Some(data.mme_ue_s1ap_id))
                    .is_some()
                {
                    self.conn
                        .outbox_mut()
                        .indicate(AppIndication::ErabReleaseConfirmed {
                            mme_ue_s1ap_id: data.mme_ue_s1ap_id,
                            released: data.released,
                        });
                }
            }
            S1apInbound::PathSwitchRequest(data) => {
                self.handle_path_switch_request(assoc_id, stream_id, data)?
            }
            S1apInbound::HandoverRequired(data) => self.handle_handover_required(assoc_id, data)?,
            S1apInbound::HandoverRequestAcknowledge(data) => {
                self.handle_handover_request_acknowledge(assoc_id, data)?
            }
            S1apInbound::HandoverFailure(data) => {
                self.mobility
                    .on_handover_failure(&mut self.conn, data.mme_ue_s1ap_id, data.cause)?;
            }
            S1apInbound::HandoverNotify(data) => {
                self.mobility.on_handover_notify(
                    &mut self.conn,
                    &mut self.sessions,
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.location,
                )?;
            }
            S1apInbound::HandoverCancel(data) => {
                self.mobility.on_handover_cancel(
                    &mut self.conn,
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.cause,
                )?;
            }
            S1apInbound::EnbStatusTransfer(data) => {
                self.mobility.on_enb_status_transfer(
                    &mut self.conn,
                    assoc_id,
                    data.enb_ue_s1ap_id,
                    data.mme_ue_s1ap_id,
                    data.container,
                )?;
            }
            S1apInbound::Reset(data) => self.handle_reset(assoc_id, data),
            S1apInbound::EnbConfigurationUpdate(data) => {
                self.handle_enb_configuration_update(assoc_id, data)?
            }
            S1apInbound::Unknown { .. } => {
                log::warn!("[assoc:{}] undecoded procedure {} dropped", assoc_id, code);
                return Ok(DispatchOutcome::NoHandler);
            }
        }
        Ok(DispatchOutcome::Handled)
    }

    // ========================================================================
    // Non-UE Associated Procedures
    // ========================================================================

    /// S1 Setup Request
    pub fn handle_s1_setup_request(
        &mut self,
        assoc_id: AssocId,
        data: S1SetupRequestData,
    ) -> MmeResult<()> {
        let associations = self.conn.associations();
        let Some(enb) = associations.find_by_assoc_id(assoc_id) else {
            log::warn!("[assoc:{}] S1 setup on unknown association", assoc_id);
            return Ok(());
        };
        let time_to_wait = Some(self.config.time_to_wait());

        if !enb.is_ready() && associations.ready_count() >= self.config.max_enb {
            log::warn!(
                "[assoc:{}] S1 setup rejected, {} eNB(s) connected",
                assoc_id,
                self.config.max_enb
            );
            self.conn.outbox_mut().send(
                assoc_id,
                NON_UE_SIGNALLING_STREAM,
                build_setup_failure(S1apCause::congestion(), time_to_wait),
            );
            return Ok(());
        }

        if let Some(other) = associations.enb_id_bound_elsewhere(data.enb_id, assoc_id) {
            log::warn!(
                "[assoc:{}] eNB {:#x} already connected on assoc:{}, closing",
                assoc_id,
                data.enb_id,
                other
            );
            self.conn.outbox_mut().send(
                assoc_id,
                NON_UE_SIGNALLING_STREAM,
                build_setup_failure(
                    S1apCause::misc(misc_cause::CONTROL_PROCESSING_OVERLOAD),
                    None,
                ),
            );
            self.conn.outbox_mut().send(
                assoc_id,
                NON_UE_SIGNALLING_STREAM,
                S1apOutbound::CloseAssociation,
            );
            self.handle_association_down(assoc_id, false);
            return Ok(());
        }

        if !self.config.served_tai.is_empty()
            && !data
                .supported_ta_list
                .iter()
                .any(|tai| self.config.is_served_tai(tai))
        {
            log::warn!("[assoc:{}] S1 setup rejected, no served TAI", assoc_id);
            self.conn.outbox_mut().send(
                assoc_id,
                NON_UE_SIGNALLING_STREAM,
                build_setup_failure(S1apCause::misc(misc_cause::UNKNOWN_PLMN), time_to_wait),
            );
            return Ok(());
        }

        associations.mark_ready(
            assoc_id,
            data.enb_id,
            data.plmn_id,
            data.enb_name.clone(),
            data.supported_ta_list,
            data.default_paging_drx,
        )?;
        log::info!(
            "[assoc:{}] S1 setup complete (eNB {:#x} {:?})",
            assoc_id,
            data.enb_id,
            data.enb_name
        );
        self.conn.outbox_mut().send(
            assoc_id,
            NON_UE_SIGNALLING_STREAM,
            build_setup_response(self.config.mme_name.as_deref(), self.config.relative_capacity),
        );
        Ok(())
    }

    /// eNB Configuration Update
    pub fn handle_enb_configuration_update(
        &mut self,
        assoc_id: AssocId,
        data: EnbConfigurationUpdateData,
    ) -> MmeResult<()> {
        let associations = self.conn.associations();
        if !associations.is_ready(assoc_id) {
            log::warn!("[assoc:{}] configuration update before S1 setup", assoc_id);
            self.conn.outbox_mut().send(
                assoc_id,
                NON_UE_SIGNALLING_STREAM,
                build_enb_configuration_update_failure(
                    S1apCause::new(
                        S1apCauseGroup::Protocol,
                        protocol_cause::MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE,
                    ),
                    Some(self.config.time_to_wait()),
                ),
            );
            return Ok(());
        }

        associations.update_configuration(
            assoc_id,
            data.enb_name,
            data.supported_ta_list,
            data.default_paging_drx,
        )?;
        self.conn.outbox_mut().send(
            assoc_id,
            NON_UE_SIGNALLING_STREAM,
            S1apOutbound::EnbConfigurationUpdateAcknowledge,
        );
        Ok(())
    }

    /// Reset from the eNB. Each named UE is dropped on its own; unknown
    /// entries are skipped.
    pub fn handle_reset(&mut self, assoc_id: AssocId, data: ResetData) {
        log::info!("[assoc:{}] reset [{}]", assoc_id, data.cause);

        let (targets, acknowledged): (Vec<UeId>, Vec<(Option<MmeUeS1apId>, Option<EnbUeS1apId>)>) =
            match &data.scope {
                ResetScope::All => {
                    let ues = self
                        .conn
                        .associations()
                        .find_by_assoc_id(assoc_id)
                        .map(|enb| enb.ue_set.iter().copied().collect())
                        .unwrap_or_default();
                    (ues, Vec::new())
                }
                ResetScope::Partial(items) => {
                    let ues = items
                        .iter()
                        .filter_map(|item| self.resolve_reset_item(assoc_id, item))
                        .collect();
                    let echoed = items
                        .iter()
                        .map(|item| (item.mme_ue_s1ap_id, item.enb_ue_s1ap_id))
                        .collect();
                    (ues, echoed)
                }
            };

        for ue_id in targets {
            self.mobility
                .abort_handover_of(&mut self.conn, ue_id, HandoverFailureReason::TransportLost);
            let Some(removed) = self.conn.destroy(ue_id) else {
                continue;
            };
            if let Some(mme_ue_s1ap_id) = removed.owned_core_id {
                self.conn
                    .outbox_mut()
                    .indicate(AppIndication::ImplicitRelease { mme_ue_s1ap_id });
            }
            self.release_access_planes(&removed);
        }

        self.conn.outbox_mut().send(
            assoc_id,
            NON_UE_SIGNALLING_STREAM,
            S1apOutbound::ResetAcknowledge {
                connections: acknowledged,
            },
        );
    }

    fn resolve_reset_item(&self, assoc_id: AssocId, item: &ResetItem) -> Option<UeId> {
        item.enb_ue_s1ap_id
            .and_then(|enb_ue_s1ap_id| self.conn.find_by_pair(assoc_id, enb_ue_s1ap_id))
            .or_else(|| {
                let ue_id = self.conn.find_by_core_id(item.mme_ue_s1ap_id?)?;
                let ue = self.conn.get(ue_id)?;
                (ue.assoc_id == assoc_id).then_some(ue_id)
            })
    }

    /// Paging towards every ready eNB serving one of the TAIs
    pub fn handle_paging(&mut self, m_tmsi: u32, tai_list: &[EpsTai]) -> usize {
        let associations = self.conn.associations();
        let targets: BTreeSet<AssocId> = tai_list
            .iter()
            .flat_map(|tai| associations.find_by_tracking_area(tai))
            .map(|enb| enb.assoc_id)
            .collect();

        for assoc_id in &targets {
            self.conn.outbox_mut().send(
                *assoc_id,
                NON_UE_SIGNALLING_STREAM,
                build_paging(m_tmsi, tai_list),
            );
        }
        log::debug!("paging M-TMSI[{:#x}] to {} eNB(s)", m_tmsi, targets.len());
        targets.len()
    }

    // ========================================================================
    // UE Associated Procedures
    // ========================================================================

    /// Initial Context Setup Response: connect the UE and record the eNB
    /// S1-U endpoints
    fn handle_initial_context_setup_response(
        &mut self,
        assoc_id: AssocId,
        data: InitialContextSetupResponseData,
    ) -> MmeResult<()> {
        let Some(ue_id) = self.conn.confirm_context_setup(
            assoc_id,
            data.enb_ue_s1ap_id,
            data.mme_ue_s1ap_id,
            data.e_rab_setup.clone(),
            data.e_rab_failed,
        ) else {
            return Ok(());
        };
        self.apply_access_tunnels(ue_id, &data.e_rab_setup)?;
        Ok(())
    }

    /// E-RAB Setup Response
    fn handle_erab_setup_response(
        &mut self,
        assoc_id: AssocId,
        data: ErabSetupResponseData,
    ) -> MmeResult<()> {
        let Some(ue_id) =
            self.conn
                .resolve_uplink(assoc_id, data.enb_ue_s1ap_id, Some(data.mme_ue_s1ap_id))
        else {
            log::warn!(
                "[assoc:{}] E-RAB setup response for unknown ENB_UE_S1AP_ID[{}]",
                assoc_id,
                data.enb_ue_s1ap_id
            );
            return Ok(());
        };
        let mut failed = data.failed;
        failed.extend(self.apply_access_tunnels(ue_id, &data.setup)?);
        let setup = data
            .setup
            .iter()
            .map(|item| item.ebi)
            .filter(|ebi| !failed.contains(ebi))
            .collect();
        self.conn
            .outbox_mut()
            .indicate(AppIndication::ErabSetupConfirmed {
                mme_ue_s1ap_id: data.mme_ue_s1ap_id,
                setup,
                failed,
            });
        Ok(())
    }

    /// Record eNB S1-U endpoints in the UE's session pool. Returns the
    /// bearers that could not be updated.
    fn apply_access_tunnels(&mut self, ue_id: UeId, items: &[ErabSetupItem]) -> MmeResult<Vec<Ebi>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let Some(subscriber) = self.conn.get(ue_id).and_then(|ue| ue.subscriber.clone()) else {
            log::warn!("[ue:{}] E-RAB endpoints without subscriber", ue_id);
            return Ok(items.iter().map(|item| item.ebi).collect());
        };
        let pool = match self.sessions.pool_mut(&subscriber) {
            Ok(pool) => pool,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                log::warn!("[ue:{}] {}", ue_id, e);
                return Ok(items.iter().map(|item| item.ebi).collect());
            }
        };

        let mut rejected = Vec::new();
        for item in items {
            match pool.mark_access_plane_updated(item.ebi, item.tunnel) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    log::warn!("[ue:{}] EBI[{}]: {}", ue_id, item.ebi, e);
                    rejected.push(item.ebi);
                }
            }
        }
        Ok(rejected)
    }

    /// S1 released while the sessions stay: the eNB endpoints are gone.
    /// Skipped when the UE no longer owned its MME UE S1AP ID (handover
    /// source), since the bearers now belong to the target.
    /// A source leaving the MME takes its tentative handover target along
    pub(crate) fn abort_handover_from_source(&mut self, ue_id: UeId) {
        let is_source = matches!(
            self.conn.get(ue_id).and_then(|ue| ue.handover.as_ref()),
            Some(HandoverLeg::Source { .. })
        );
        if is_source {
            log::info!("[ue:{}] released during handover preparation", ue_id);
            self.mobility
                .abort_handover_of(&mut self.conn, ue_id, HandoverFailureReason::Cancelled);
        }
    }

    pub(crate) fn release_access_planes(&mut self, removed: &RemovedUe) {
        if removed.owned_core_id.is_none() {
            return;
        }
        if let Some(subscriber) = removed.ue.subscriber.as_deref() {
            if let Ok(pool) = self.sessions.pool_mut(subscriber) {
                pool.mark_all_access_planes_released();
            }
        }
    }

    /// Path Switch Request
    fn handle_path_switch_request(
        &mut self,
        assoc_id: AssocId,
        stream_id: u16,
        data: PathSwitchRequestData,
    ) -> MmeResult<()> {
        let result = self.mobility.on_path_switch_request(
            &mut self.conn,
            &mut self.sessions,
            assoc_id,
            stream_id,
            data.enb_ue_s1ap_id,
            data.source_mme_ue_s1ap_id,
            data.location,
            data.e_rab_to_be_switched,
        );
        match result {
            Ok(_) | Err(MobilityError::UnknownSource(_)) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                log::warn!("[assoc:{}] path switch failed: {}", assoc_id, e);
                self.conn.outbox_mut().send(
                    assoc_id,
                    stream_id,
                    S1apOutbound::PathSwitchRequestFailure {
                        mme_ue_s1ap_id: data.source_mme_ue_s1ap_id,
                        enb_ue_s1ap_id: data.enb_ue_s1ap_id,
                        cause: S1apCause::misc(misc_cause::UNSPECIFIED),
                    },
                );
                Ok(())
            }
        }
    }

    /// Handover Required
    fn handle_handover_required(
        &mut self,
        assoc_id: AssocId,
        data: HandoverRequiredData,
    ) -> MmeResult<()> {
        let result = self.mobility.on_handover_required(
            &mut self.conn,
            assoc_id,
            data.enb_ue_s1ap_id,
            data.mme_ue_s1ap_id,
            data.target_enb_id,
            data.target_tai,
            data.cause,
            data.container,
        );
        let cause = match result {
            Ok(_) => return Ok(()),
            Err(MobilityError::Connection(_)) => {
                S1apCause::radio_network(radio_network_cause::UNKNOWN_PAIR_UE_S1AP_ID)
            }
            Err(e) => {
                log::warn!("[assoc:{}] handover required rejected: {}", assoc_id, e);
                S1apCause::new(
                    S1apCauseGroup::Protocol,
                    protocol_cause::MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE,
                )
            }
        };
        let stream_id = self
            .conn
            .resolve_uplink(assoc_id, data.enb_ue_s1ap_id, None)
            .and_then(|ue_id| self.conn.get(ue_id))
            .map_or(NON_UE_SIGNALLING_STREAM, |ue| ue.enb_ostream_id);
        self.conn.outbox_mut().send(
            assoc_id,
            stream_id,
            S1apOutbound::HandoverPreparationFailure {
                mme_ue_s1ap_id: data.mme_ue_s1ap_id,
                enb_ue_s1ap_id: data.enb_ue_s1ap_id,
                cause,
            },
        );
        Ok(())
    }

    /// Handover Request Acknowledge
    fn handle_handover_request_acknowledge(
        &mut self,
        assoc_id: AssocId,
        data: HandoverRequestAcknowledgeData,
    ) -> MmeResult<()> {
        if !data.not_admitted.is_empty() {
            log::info!(
                "MME_UE_S1AP_ID[{}] E-RAB not admitted: {:?}",
                data.mme_ue_s1ap_id,
                data.not_admitted
            );
        }
        let result = self.mobility.on_handover_request_acknowledge(
            &mut self.conn,
            assoc_id,
            data.enb_ue_s1ap_id,
            data.mme_ue_s1ap_id,
            data.admitted,
            data.container,
        );
        match result {
            Ok(_) => Ok(()),
            Err(MobilityError::AdmissionFailed(reason)) => {
                log::warn!("MME_UE_S1AP_ID[{}] handover admission failed: {}", data.mme_ue_s1ap_id, reason);
                self.conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                    mme_ue_s1ap_id: data.mme_ue_s1ap_id,
                    reason: HandoverFailureReason::AdmissionFailed,
                });
                self.mobility.send_handover_preparation_failure(
                    &mut self.conn,
                    data.mme_ue_s1ap_id,
                    S1apCause::radio_network(
                        radio_network_cause::NO_RADIO_RESOURCES_AVAILABLE_IN_TARGET_CELL,
                    ),
                )?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Application Requests
    // ========================================================================

    /// Request from the application layer
    pub fn handle_app_request(&mut self, request: AppRequest) -> MmeResult<()> {
        match request {
            AppRequest::UeContextRelease { target, cause } => {
                if let Some(ue_id) = self.conn.resolve(&target) {
                    self.abort_handover_from_source(ue_id);
                }
                if let Some(removed) = self.conn.release_command(&target, cause) {
                    self.release_access_planes(&removed);
                }
            }
            AppRequest::InitialContextSetup {
                mme_ue_s1ap_id,
                ue_ambr,
                e_rabs,
                nas_pdu,
            } => {
                self.conn
                    .send_initial_context_setup(mme_ue_s1ap_id, ue_ambr, e_rabs, nas_pdu)?;
            }
            AppRequest::DownlinkNas {
                mme_ue_s1ap_id,
                nas_pdu,
            } => {
                self.conn.send_downlink_nas(mme_ue_s1ap_id, nas_pdu)?;
            }
            AppRequest::BindSubscriber {
                mme_ue_s1ap_id,
                subscriber,
                ue_ambr,
            } => {
                self.conn.bind_subscriber(mme_ue_s1ap_id, subscriber.clone())?;
                self.sessions.allocate(&subscriber, ue_ambr)?;
            }
            AppRequest::HandoverCommand {
                mme_ue_s1ap_id,
                container,
            } => {
                self.mobility
                    .send_handover_command(&mut self.conn, mme_ue_s1ap_id, container)?;
            }
            AppRequest::HandoverPreparationFailure {
                mme_ue_s1ap_id,
                cause,
            } => {
                self.mobility.send_handover_preparation_failure(
                    &mut self.conn,
                    mme_ue_s1ap_id,
                    cause,
                )?;
            }
            AppRequest::HandoverRequest {
                source_mme_ue_s1ap_id,
                target_enb_id,
                cause,
                bearers,
                container,
            } => {
                let result = self.mobility.on_handover_request_at_target(
                    &mut self.conn,
                    &self.sessions,
                    source_mme_ue_s1ap_id,
                    target_enb_id,
                    cause,
                    bearers,
                    container,
                );
                if let Err(e) = result {
                    let Some(reason) = e.failure_reason() else {
                        return Err(e.into());
                    };
                    log::warn!(
                        "MME_UE_S1AP_ID[{}] handover preparation failed: {}",
                        source_mme_ue_s1ap_id,
                        e
                    );
                    self.conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                        mme_ue_s1ap_id: source_mme_ue_s1ap_id,
                        reason,
                    });
                }
            }
            AppRequest::Paging { m_tmsi, tai_list } => {
                self.handle_paging(m_tmsi, &tai_list);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
