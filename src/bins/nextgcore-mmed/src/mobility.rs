//! MME Mobility Coordinator
//!
//! S1 handover (prepare at the target, commit on handover notify, abort on
//! cancel/failure/TS1RELOCOverall) and path switch. During a handover the
//! source keeps the MME UE S1AP ID; the tentative target record is reached
//! through `handover_targets` until the commit moves the index entry.

use std::collections::HashMap;

use thiserror::Error;

use crate::connection::{ConnectionError, ConnectionRegistry, HandoverLeg, UeRef, UeState};
use crate::context::{AssocId, Ebi, EnbId, EnbUeS1apId, EpsTai, MmeUeS1apId, UeId, UeLocation};
use crate::event::{AppIndication, HandoverFailureReason};
use crate::s1ap_build::{
    misc_cause, radio_network_cause, ErabSetupItem, ErabToBeSetup, ReleaseCause, S1apCause,
    S1apOutbound, NON_UE_SIGNALLING_STREAM,
};
use crate::session::{SessionError, SessionManager};
use crate::timer::MmeTimerId;

/// Mobility errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MobilityError {
    #[error("target eNB {0} not connected")]
    NoTargetAssociation(EnbId),
    #[error("bearer admission failed: {0}")]
    AdmissionFailed(String),
    #[error("unknown source MME_UE_S1AP_ID[{0}]")]
    UnknownSource(MmeUeS1apId),
    #[error("source UE {ue_id} is {state}")]
    SourceNotConnected { ue_id: UeId, state: UeState },
    #[error("handover already in progress for MME_UE_S1AP_ID[{0}]")]
    HandoverInProgress(MmeUeS1apId),
    #[error("no handover in progress for MME_UE_S1AP_ID[{0}]")]
    NoHandover(MmeUeS1apId),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl MobilityError {
    pub fn is_fatal(&self) -> bool {
        match self {
            MobilityError::Session(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Reason reported upward when preparation fails
    pub fn failure_reason(&self) -> Option<HandoverFailureReason> {
        match self {
            MobilityError::NoTargetAssociation(_) => Some(HandoverFailureReason::NoTargetAssociation),
            MobilityError::AdmissionFailed(_) => Some(HandoverFailureReason::AdmissionFailed),
            _ => None,
        }
    }
}

/// Result of a path switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSwitchOutcome {
    pub ue_id: UeId,
    pub switched: Vec<Ebi>,
    pub released: Vec<Ebi>,
}

/// Handover and path switch coordinator
#[derive(Debug, Default)]
pub struct MobilityCoordinator {
    /// MME UE S1AP ID -> tentative target record
    handover_targets: HashMap<MmeUeS1apId, UeId>,
}

impl MobilityCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tentative target of an in-flight handover
    pub fn target_of(&self, mme_ue_s1ap_id: MmeUeS1apId) -> Option<UeId> {
        self.handover_targets.get(&mme_ue_s1ap_id).copied()
    }

    /// Number of handovers in flight
    pub fn in_progress(&self) -> usize {
        self.handover_targets.len()
    }

    fn connected_source(
        conn: &ConnectionRegistry,
        ue_id: UeId,
    ) -> Result<(), MobilityError> {
        let ue = conn.get(ue_id).ok_or(ConnectionError::UnknownUe(ue_id))?;
        if ue.state != UeState::Connected {
            return Err(MobilityError::SourceNotConnected {
                ue_id,
                state: ue.state,
            });
        }
        Ok(())
    }

    fn source_by_pair(
        conn: &ConnectionRegistry,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
    ) -> Result<UeId, MobilityError> {
        conn.resolve_uplink(assoc_id, enb_ue_s1ap_id, Some(mme_ue_s1ap_id))
            .ok_or(MobilityError::Connection(ConnectionError::UnknownPair {
                assoc_id,
                enb_ue_s1ap_id,
            }))
    }

    // ========================================================================
    // Handover preparation
    // ========================================================================

    /// Handover required from the source eNB
    #[allow(clippy::too_many_arguments)]
    pub fn on_handover_required(
        &mut self,
        conn: &mut ConnectionRegistry,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        target_enb_id: EnbId,
        target_tai: Option<EpsTai>,
        cause: S1apCause,
        container: Vec<u8>,
    ) -> Result<UeId, MobilityError> {
        let source = Self::source_by_pair(conn, assoc_id, enb_ue_s1ap_id, mme_ue_s1ap_id)?;
        Self::connected_source(conn, source)?;
        if self.handover_targets.contains_key(&mme_ue_s1ap_id) {
            return Err(MobilityError::HandoverInProgress(mme_ue_s1ap_id));
        }

        log::info!(
            "[ue:{}] handover required to eNB {} [{}]",
            source,
            target_enb_id,
            cause
        );
        conn.outbox_mut().indicate(AppIndication::HandoverRequired {
            mme_ue_s1ap_id,
            target_enb_id,
            target_tai,
            cause,
            container,
        });
        Ok(source)
    }

    /// Handover command towards the source eNB
    pub fn send_handover_command(
        &mut self,
        conn: &mut ConnectionRegistry,
        mme_ue_s1ap_id: MmeUeS1apId,
        container: Vec<u8>,
    ) -> Result<(), MobilityError> {
        if !self.handover_targets.contains_key(&mme_ue_s1ap_id) {
            return Err(MobilityError::NoHandover(mme_ue_s1ap_id));
        }
        let source = conn
            .find_by_core_id(mme_ue_s1ap_id)
            .ok_or(MobilityError::UnknownSource(mme_ue_s1ap_id))?;
        Self::connected_source(conn, source)?;
        let (assoc_id, stream_id, enb_ue_s1ap_id) = match conn.get(source) {
            Some(ue) => (
                ue.assoc_id,
                ue.enb_ostream_id,
                ue.enb_ue_s1ap_id.ok_or(ConnectionError::NoLocalId(source))?,
            ),
            None => return Err(ConnectionError::UnknownUe(source).into()),
        };

        log::info!("[ue:{}] handover command", source);
        conn.outbox_mut().send(
            assoc_id,
            stream_id,
            S1apOutbound::HandoverCommand {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id,
                container,
            },
        );
        Ok(())
    }

    /// Handover preparation failure towards the source eNB. A tentative
    /// target, if any, is released.
    pub fn send_handover_preparation_failure(
        &mut self,
        conn: &mut ConnectionRegistry,
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    ) -> Result<(), MobilityError> {
        self.abort(conn, mme_ue_s1ap_id);

        let source = conn
            .find_by_core_id(mme_ue_s1ap_id)
            .ok_or(MobilityError::UnknownSource(mme_ue_s1ap_id))?;
        let ue = conn.get(source).ok_or(ConnectionError::UnknownUe(source))?;
        let enb_ue_s1ap_id = ue.enb_ue_s1ap_id.ok_or(ConnectionError::NoLocalId(source))?;
        let (assoc_id, stream_id) = (ue.assoc_id, ue.enb_ostream_id);

        log::warn!("[ue:{}] handover preparation failure [{}]", source, cause);
        conn.outbox_mut().send(
            assoc_id,
            stream_id,
            S1apOutbound::HandoverPreparationFailure {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id,
                cause,
            },
        );
        Ok(())
    }

    /// Reserve resources at the target eNB.
    ///
    /// Creates the tentative target record (no eNB UE S1AP ID, not indexed),
    /// arms TS1RELOCOverall on it and sends the handover request. Nothing is
    /// created when the target is unknown or no bearer can be admitted.
    #[allow(clippy::too_many_arguments)]
    pub fn on_handover_request_at_target(
        &mut self,
        conn: &mut ConnectionRegistry,
        sessions: &SessionManager,
        source_mme_ue_s1ap_id: MmeUeS1apId,
        target_enb_id: EnbId,
        cause: S1apCause,
        bearers: Vec<Ebi>,
        container: Vec<u8>,
    ) -> Result<UeId, MobilityError> {
        let source = conn
            .find_by_core_id(source_mme_ue_s1ap_id)
            .ok_or(MobilityError::UnknownSource(source_mme_ue_s1ap_id))?;
        Self::connected_source(conn, source)?;
        if self.handover_targets.contains_key(&source_mme_ue_s1ap_id) {
            return Err(MobilityError::HandoverInProgress(source_mme_ue_s1ap_id));
        }

        let target_enb = conn
            .associations()
            .find_by_enb_id(target_enb_id)
            .filter(|enb| enb.is_ready())
            .ok_or(MobilityError::NoTargetAssociation(target_enb_id))?;

        let subscriber = conn
            .get(source)
            .and_then(|ue| ue.subscriber.clone())
            .ok_or_else(|| MobilityError::AdmissionFailed("no subscriber bound".into()))?;
        let pool = sessions
            .pool(&subscriber)
            .map_err(|e| MobilityError::AdmissionFailed(e.to_string()))?;
        if bearers.is_empty() {
            return Err(MobilityError::AdmissionFailed("no bearer to hand over".into()));
        }
        let mut e_rabs = Vec::with_capacity(bearers.len());
        for ebi in &bearers {
            let bearer = pool
                .bearer(*ebi)
                .filter(|bearer| !bearer.is_free() && bearer.core_tunnel.is_some())
                .ok_or_else(|| {
                    MobilityError::AdmissionFailed(format!("EBI[{}] not established", ebi))
                })?;
            e_rabs.push(ErabToBeSetup {
                ebi: *ebi,
                qos: bearer.qos,
                core_tunnel: bearer.core_tunnel,
            });
        }
        let ue_ambr = pool.ue_ambr();

        let target = conn.create_ue(target_enb.assoc_id, None, 0)?;
        if let Some(ue) = conn.get_mut(target) {
            ue.subscriber = Some(subscriber);
            ue.handover = Some(HandoverLeg::Target {
                source,
                mme_ue_s1ap_id: source_mme_ue_s1ap_id,
                bearers,
                admitted: Vec::new(),
            });
        }
        if let Some(ue) = conn.get_mut(source) {
            ue.handover = Some(HandoverLeg::Source { target });
        }
        conn.arm_timer(target, MmeTimerId::S1RelocOverall);
        self.handover_targets.insert(source_mme_ue_s1ap_id, target);

        let stream_id = conn.get(target).map_or(0, |ue| ue.enb_ostream_id);
        log::info!(
            "[ue:{}] handover request to eNB {} (assoc:{}, tentative UE {})",
            source,
            target_enb_id,
            target_enb.assoc_id,
            target
        );
        conn.outbox_mut().send(
            target_enb.assoc_id,
            stream_id,
            S1apOutbound::HandoverRequest {
                mme_ue_s1ap_id: source_mme_ue_s1ap_id,
                cause,
                ue_ambr,
                e_rabs,
                container,
            },
        );
        Ok(target)
    }

    /// Handover request acknowledge from the target eNB
    pub fn on_handover_request_acknowledge(
        &mut self,
        conn: &mut ConnectionRegistry,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        admitted: Vec<ErabSetupItem>,
        container: Vec<u8>,
    ) -> Result<UeId, MobilityError> {
        let target = self
            .target_of(mme_ue_s1ap_id)
            .filter(|target| conn.get(*target).map_or(false, |ue| ue.assoc_id == assoc_id))
            .ok_or(MobilityError::NoHandover(mme_ue_s1ap_id))?;

        if admitted.is_empty() {
            log::warn!("[ue:{}] target admitted no E-RAB", target);
            self.abort(conn, mme_ue_s1ap_id);
            return Err(MobilityError::AdmissionFailed("no E-RAB admitted".into()));
        }

        if let Err(e) = conn.bind_local_id(target, enb_ue_s1ap_id) {
            log::warn!("[ue:{}] ENB_UE_S1AP_ID[{}] rejected: {}", target, enb_ue_s1ap_id, e);
            conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                mme_ue_s1ap_id,
                reason: HandoverFailureReason::AdmissionFailed,
            });
            self.send_handover_preparation_failure(
                conn,
                mme_ue_s1ap_id,
                S1apCause::radio_network(radio_network_cause::UNKNOWN_ENB_UE_S1AP_ID),
            )?;
            return Err(e.into());
        }
        if let Some(ue) = conn.get_mut(target) {
            if let Some(HandoverLeg::Target { admitted: stored, .. }) = ue.handover.as_mut() {
                *stored = admitted.clone();
            }
        }

        log::info!(
            "[ue:{}] handover request acknowledge (ENB_UE_S1AP_ID[{}], {} E-RAB)",
            target,
            enb_ue_s1ap_id,
            admitted.len()
        );
        conn.outbox_mut()
            .indicate(AppIndication::HandoverRequestAcknowledged {
                mme_ue_s1ap_id,
                admitted,
                container,
            });
        Ok(target)
    }

    /// Handover failure from the target eNB
    pub fn on_handover_failure(
        &mut self,
        conn: &mut ConnectionRegistry,
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    ) -> Result<(), MobilityError> {
        if self.abort(conn, mme_ue_s1ap_id).is_none() {
            return Err(MobilityError::NoHandover(mme_ue_s1ap_id));
        }
        conn.outbox_mut().indicate(AppIndication::HandoverFailure {
            mme_ue_s1ap_id,
            reason: HandoverFailureReason::AdmissionFailed,
        });
        self.send_handover_preparation_failure(conn, mme_ue_s1ap_id, cause)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// eNB status transfer from the source, relayed to the target
    pub fn on_enb_status_transfer(
        &mut self,
        conn: &mut ConnectionRegistry,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        container: Vec<u8>,
    ) -> Result<(), MobilityError> {
        Self::source_by_pair(conn, assoc_id, enb_ue_s1ap_id, mme_ue_s1ap_id)?;
        let target = self
            .target_of(mme_ue_s1ap_id)
            .ok_or(MobilityError::NoHandover(mme_ue_s1ap_id))?;
        let ue = conn.get(target).ok_or(ConnectionError::UnknownUe(target))?;
        let target_enb_ue_s1ap_id = ue.enb_ue_s1ap_id.ok_or(ConnectionError::NoLocalId(target))?;
        let (target_assoc, stream_id) = (ue.assoc_id, ue.enb_ostream_id);

        conn.outbox_mut().send(
            target_assoc,
            stream_id,
            S1apOutbound::MmeStatusTransfer {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id: target_enb_ue_s1ap_id,
                container,
            },
        );
        Ok(())
    }

    /// Handover notify from the target eNB: commit.
    ///
    /// The target becomes `Connected` and takes over the MME UE S1AP ID, the
    /// admitted S1-U endpoints are applied to the session pool, and the
    /// source is released with `SuccessfulHandover`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_handover_notify(
        &mut self,
        conn: &mut ConnectionRegistry,
        sessions: &mut SessionManager,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        location: UeLocation,
    ) -> Result<UeId, MobilityError> {
        let target = conn
            .find_by_pair(assoc_id, enb_ue_s1ap_id)
            .filter(|target| self.target_of(mme_ue_s1ap_id) == Some(*target))
            .ok_or(MobilityError::NoHandover(mme_ue_s1ap_id))?;

        let source_connected = match conn.get(target).and_then(|ue| ue.handover.as_ref()) {
            Some(HandoverLeg::Target { source, .. }) => conn
                .get(*source)
                .map_or(false, |ue| ue.state == UeState::Connected),
            _ => false,
        };
        if !source_connected {
            log::warn!("[ue:{}] handover notify without a connected source, aborted", target);
            self.abort(conn, mme_ue_s1ap_id);
            conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                mme_ue_s1ap_id,
                reason: HandoverFailureReason::Cancelled,
            });
            return Err(MobilityError::NoHandover(mme_ue_s1ap_id));
        }
        self.handover_targets.remove(&mme_ue_s1ap_id);

        conn.cancel_timer(target, MmeTimerId::S1RelocOverall);
        let (source, admitted, subscriber) = match conn.get_mut(target) {
            Some(ue) => {
                ue.location = location;
                let leg = ue.handover.take();
                match leg {
                    Some(HandoverLeg::Target {
                        source, admitted, ..
                    }) => (source, admitted, ue.subscriber.clone()),
                    _ => return Err(MobilityError::NoHandover(mme_ue_s1ap_id)),
                }
            }
            None => return Err(ConnectionError::UnknownUe(target).into()),
        };

        let capability = conn.get(source).and_then(|ue| ue.ue_radio_capability.clone());
        if let Some(ue) = conn.get_mut(target) {
            ue.ue_radio_capability = capability;
        }
        conn.transition(target, UeState::Connected);
        conn.index_core_id(target, mme_ue_s1ap_id)?;

        if let Some(subscriber) = subscriber {
            match sessions.pool_mut(&subscriber) {
                Ok(pool) => {
                    for item in &admitted {
                        if let Err(e) = pool.mark_access_plane_updated(item.ebi, item.tunnel) {
                            if e.is_fatal() {
                                return Err(e.into());
                            }
                            log::warn!("[ue:{}] EBI[{}] not switched: {}", target, item.ebi, e);
                        }
                    }
                }
                Err(e) => log::warn!("[ue:{}] no session pool: {}", target, e),
            }
        }

        log::info!(
            "[ue:{}] handover complete, MME_UE_S1AP_ID[{}] moved from UE {}",
            target,
            mme_ue_s1ap_id,
            source
        );
        if let Some(ue) = conn.get_mut(source) {
            ue.handover = None;
        }
        conn.release_command(&UeRef::Ue(source), ReleaseCause::SuccessfulHandover);
        conn.outbox_mut().indicate(AppIndication::HandoverNotify {
            mme_ue_s1ap_id,
            location,
        });
        Ok(target)
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Handover cancel from the source eNB
    pub fn on_handover_cancel(
        &mut self,
        conn: &mut ConnectionRegistry,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    ) -> Result<(), MobilityError> {
        let source = Self::source_by_pair(conn, assoc_id, enb_ue_s1ap_id, mme_ue_s1ap_id)?;
        log::info!("[ue:{}] handover cancel [{}]", source, cause);

        if self.abort(conn, mme_ue_s1ap_id).is_some() {
            conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                mme_ue_s1ap_id,
                reason: HandoverFailureReason::Cancelled,
            });
        }

        let stream_id = conn.get(source).map_or(0, |ue| ue.enb_ostream_id);
        conn.outbox_mut().send(
            assoc_id,
            stream_id,
            S1apOutbound::HandoverCancelAcknowledge {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id,
            },
        );
        Ok(())
    }

    /// TS1RELOCOverall expired on a tentative target
    pub fn on_handover_timeout(&mut self, conn: &mut ConnectionRegistry, target: UeId) {
        let mme_ue_s1ap_id = match conn.get(target).and_then(|ue| ue.handover.as_ref()) {
            Some(HandoverLeg::Target { mme_ue_s1ap_id, .. }) => *mme_ue_s1ap_id,
            _ => {
                log::debug!("[ue:{}] S1_RELOC_OVERALL expired without handover", target);
                return;
            }
        };
        log::warn!("[ue:{}] S1_RELOC_OVERALL expired, handover aborted", target);
        self.abort(conn, mme_ue_s1ap_id);
        conn.outbox_mut().indicate(AppIndication::HandoverFailure {
            mme_ue_s1ap_id,
            reason: HandoverFailureReason::Timeout,
        });
    }

    /// Abort handovers touching an association that went down. Must run
    /// before the connection registry processes the same event.
    pub fn on_association_down(&mut self, conn: &mut ConnectionRegistry, assoc_id: AssocId) {
        let mut affected: Vec<MmeUeS1apId> = self
            .handover_targets
            .iter()
            .filter(|(_, target)| {
                let target_here = conn.get(**target).map_or(true, |ue| ue.assoc_id == assoc_id);
                let source_here = match conn.get(**target).and_then(|ue| ue.handover.as_ref()) {
                    Some(HandoverLeg::Target { source, .. }) => {
                        conn.get(*source).map_or(true, |ue| ue.assoc_id == assoc_id)
                    }
                    _ => true,
                };
                target_here || source_here
            })
            .map(|(id, _)| *id)
            .collect();
        affected.sort_unstable();

        for mme_ue_s1ap_id in affected {
            log::warn!(
                "[assoc:{}] handover of MME_UE_S1AP_ID[{}] aborted, transport lost",
                assoc_id,
                mme_ue_s1ap_id
            );
            self.abort(conn, mme_ue_s1ap_id);
            conn.outbox_mut().indicate(AppIndication::HandoverFailure {
                mme_ue_s1ap_id,
                reason: HandoverFailureReason::TransportLost,
            });
        }
    }

    /// Abort the handover `ue_id` takes part in, on either leg
    pub fn abort_handover_of(
        &mut self,
        conn: &mut ConnectionRegistry,
        ue_id: UeId,
        reason: HandoverFailureReason,
    ) -> bool {
        let mme_ue_s1ap_id = match conn.get(ue_id) {
            Some(ue) => match &ue.handover {
                Some(HandoverLeg::Target { mme_ue_s1ap_id, .. }) => *mme_ue_s1ap_id,
                Some(HandoverLeg::Source { .. }) => match ue.mme_ue_s1ap_id {
                    Some(id) => id,
                    None => return false,
                },
                None => return false,
            },
            None => return false,
        };
        if self.abort(conn, mme_ue_s1ap_id).is_none() {
            return false;
        }
        conn.outbox_mut().indicate(AppIndication::HandoverFailure {
            mme_ue_s1ap_id,
            reason,
        });
        true
    }

    /// Drop the tentative target of a handover; the source is left as is.
    /// A target the eNB already acknowledged gets a release command that
    /// expects no answer.
    fn abort(&mut self, conn: &mut ConnectionRegistry, mme_ue_s1ap_id: MmeUeS1apId) -> Option<UeId> {
        let target = self.handover_targets.remove(&mme_ue_s1ap_id)?;
        conn.cancel_timer(target, MmeTimerId::S1RelocOverall);

        let (source, acknowledged) = match conn.get(target) {
            Some(ue) => {
                let source = match &ue.handover {
                    Some(HandoverLeg::Target { source, .. }) => Some(*source),
                    _ => None,
                };
                (source, ue.enb_ue_s1ap_id.is_some())
            }
            None => (None, false),
        };
        if let Some(ue) = source.and_then(|source| conn.get_mut(source)) {
            if matches!(ue.handover, Some(HandoverLeg::Source { target: t }) if t == target) {
                ue.handover = None;
            }
        }

        if acknowledged {
            conn.release_command(&UeRef::Ue(target), ReleaseCause::HandoverCancelled);
        } else {
            conn.destroy(target);
        }
        log::info!("[ue:{}] tentative handover target released", target);
        Some(target)
    }

    // ========================================================================
    // Path Switch
    // ========================================================================

    /// Path switch request: the eNB already moved the UE. The old record is
    /// replaced by a `Connected` one under the new pair with the same MME UE
    /// S1AP ID.
    #[allow(clippy::too_many_arguments)]
    pub fn on_path_switch_request(
        &mut self,
        conn: &mut ConnectionRegistry,
        sessions: &mut SessionManager,
        assoc_id: AssocId,
        stream_id: u16,
        enb_ue_s1ap_id: EnbUeS1apId,
        source_mme_ue_s1ap_id: MmeUeS1apId,
        location: UeLocation,
        e_rabs: Vec<ErabSetupItem>,
    ) -> Result<PathSwitchOutcome, MobilityError> {
        let Some(old) = conn.find_by_core_id(source_mme_ue_s1ap_id) else {
            log::warn!(
                "[assoc:{}] path switch for unknown MME_UE_S1AP_ID[{}]",
                assoc_id,
                source_mme_ue_s1ap_id
            );
            let stream = conn
                .associations()
                .next_ostream_id(assoc_id)
                .unwrap_or(NON_UE_SIGNALLING_STREAM);
            conn.outbox_mut().send(
                assoc_id,
                stream,
                S1apOutbound::PathSwitchRequestFailure {
                    mme_ue_s1ap_id: source_mme_ue_s1ap_id,
                    enb_ue_s1ap_id,
                    cause: S1apCause::misc(misc_cause::UNSPECIFIED),
                },
            );
            return Err(MobilityError::UnknownSource(source_mme_ue_s1ap_id));
        };

        if self.target_of(source_mme_ue_s1ap_id).is_some() {
            self.abort(conn, source_mme_ue_s1ap_id);
        }

        let new = conn.create_ue(assoc_id, Some(enb_ue_s1ap_id), stream_id)?;
        let (subscriber, capability) = match conn.get(old) {
            Some(ue) => (ue.subscriber.clone(), ue.ue_radio_capability.clone()),
            None => (None, None),
        };
        if let Some(ue) = conn.get_mut(new) {
            ue.subscriber = subscriber.clone();
            ue.ue_radio_capability = capability;
            ue.location = location;
        }
        conn.transition(new, UeState::Connected);
        conn.index_core_id(new, source_mme_ue_s1ap_id)?;
        conn.destroy(old);

        let mut switched = Vec::new();
        let mut released = Vec::new();
        let pool = match subscriber.as_deref() {
            Some(subscriber) => sessions.pool_mut(subscriber).ok(),
            None => None,
        };
        match pool {
            Some(pool) => {
                for item in &e_rabs {
                    match pool.mark_access_plane_updated(item.ebi, item.tunnel) {
                        Ok(_) => switched.push(item.ebi),
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => {
                            log::warn!("[ue:{}] EBI[{}] not switched: {}", new, item.ebi, e);
                            released.push(item.ebi);
                        }
                    }
                }
            }
            None => released.extend(e_rabs.iter().map(|item| item.ebi)),
        }

        log::info!(
            "[ue:{}] path switch from UE {} (MME_UE_S1AP_ID[{}], {} switched, {} released)",
            new,
            old,
            source_mme_ue_s1ap_id,
            switched.len(),
            released.len()
        );
        let ostream_id = conn.get(new).map_or(0, |ue| ue.enb_ostream_id);
        conn.outbox_mut().send(
            assoc_id,
            ostream_id,
            S1apOutbound::PathSwitchRequestAcknowledge {
                mme_ue_s1ap_id: source_mme_ue_s1ap_id,
                enb_ue_s1ap_id,
                e_rabs_released: released.clone(),
            },
        );
        conn.outbox_mut().indicate(AppIndication::PathSwitch {
            mme_ue_s1ap_id: source_mme_ue_s1ap_id,
            location,
            switched: switched.clone(),
            released: released.clone(),
        });
        Ok(PathSwitchOutcome {
            ue_id: new,
            switched,
            released,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use crate::association::AssociationRegistry;
    use crate::config::MmeConfig;
    use crate::connection::CoreIdIndex;
    use crate::context::{Bitrate, Paa, PlmnId, Qos, Tunnel};
    use crate::session::{AmbrPolicy, PdnRequest};
    use crate::timer::ManualTimerService;

    const SOURCE_ASSOC: AssocId = 1;
    const TARGET_ASSOC: AssocId = 2;
    const TARGET_ENB: EnbId = 0x200;
    const IMSI: &str = "001010000000001";

    struct Fixture {
        conn: ConnectionRegistry,
        sessions: SessionManager,
        mobility: MobilityCoordinator,
        timers: ManualTimerService,
        source: UeId,
        core_id: MmeUeS1apId,
        default_ebi: Ebi,
    }

    fn tunnel(teid: u32) -> Tunnel {
        Tunnel::new(teid, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    fn fixture() -> Fixture {
        let plmn = PlmnId::new("001", "01");
        let associations = Arc::new(AssociationRegistry::new());
        for (assoc_id, enb_id) in [(SOURCE_ASSOC, 0x100), (TARGET_ASSOC, TARGET_ENB)] {
            associations.on_association_up(assoc_id, 2, 4, None).unwrap();
            associations
                .mark_ready(assoc_id, enb_id, plmn, None, vec![EpsTai::new(plmn, 1)], None)
                .unwrap();
        }
        let timers = ManualTimerService::new();
        let mut conn = ConnectionRegistry::new(
            Arc::new(MmeConfig::default()),
            associations,
            Arc::new(CoreIdIndex::new()),
            Box::new(timers.clone()),
        );

        let source = conn
            .on_initial_access(SOURCE_ASSOC, 1, 10, vec![], UeLocation::default())
            .unwrap()
            .unwrap();
        let core_id = conn.get(source).unwrap().mme_ue_s1ap_id.unwrap();
        conn.bind_subscriber(core_id, IMSI.to_string()).unwrap();
        conn.confirm_context_setup(SOURCE_ASSOC, 10, core_id, vec![], vec![]);
        conn.take_outbox();

        let mut sessions = SessionManager::new(4, 4, 16);
        sessions.allocate(IMSI, Bitrate::new(1000, 1000)).unwrap();
        let pool = sessions.pool_mut(IMSI).unwrap();
        let created = pool
            .create_pdn_connection(
                PdnRequest {
                    apn: "internet".into(),
                    paa: Paa::default(),
                    ambr: Bitrate::new(500, 500),
                    default_qos: Qos::non_gbr(9),
                    core_tunnel: Some(tunnel(1)),
                    anchor_tunnel: Some(tunnel(2)),
                },
                AmbrPolicy::Reject,
            )
            .unwrap();
        pool.mark_access_plane_updated(created.default_ebi, tunnel(3)).unwrap();

        Fixture {
            conn,
            sessions,
            mobility: MobilityCoordinator::new(),
            timers,
            source,
            core_id,
            default_ebi: created.default_ebi,
        }
    }

    fn prepare(f: &mut Fixture) -> UeId {
        f.mobility
            .on_handover_request_at_target(
                &mut f.conn,
                &f.sessions,
                f.core_id,
                TARGET_ENB,
                S1apCause::default(),
                vec![f.default_ebi],
                vec![0xaa],
            )
            .unwrap()
    }

    #[test]
    fn test_request_at_target_creates_tentative_record() {
        let mut f = fixture();
        let target = prepare(&mut f);

        let ue = f.conn.get(target).unwrap();
        assert_eq!(ue.assoc_id, TARGET_ASSOC);
        assert_eq!(ue.state, UeState::AwaitingContextSetup);
        assert!(ue.mme_ue_s1ap_id.is_none());
        assert!(f.timers.is_armed(ue.t_handover.unwrap()));
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(f.source));

        let outbox = f.conn.take_outbox();
        assert_eq!(outbox.s1ap[0].assoc_id, TARGET_ASSOC);
        assert!(matches!(
            &outbox.s1ap[0].message,
            S1apOutbound::HandoverRequest { e_rabs, .. } if e_rabs.len() == 1
        ));
    }

    #[test]
    fn test_unknown_target_creates_nothing() {
        let mut f = fixture();
        let count = f.conn.len();
        let err = f
            .mobility
            .on_handover_request_at_target(
                &mut f.conn,
                &f.sessions,
                f.core_id,
                0x999,
                S1apCause::default(),
                vec![f.default_ebi],
                vec![],
            )
            .unwrap_err();
        assert_eq!(err, MobilityError::NoTargetAssociation(0x999));
        assert_eq!(err.failure_reason(), Some(HandoverFailureReason::NoTargetAssociation));
        assert_eq!(f.conn.len(), count);
    }

    #[test]
    fn test_admission_failure_creates_nothing() {
        let mut f = fixture();
        let count = f.conn.len();
        let err = f
            .mobility
            .on_handover_request_at_target(
                &mut f.conn,
                &f.sessions,
                f.core_id,
                TARGET_ENB,
                S1apCause::default(),
                vec![9],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, MobilityError::AdmissionFailed(_)));
        assert_eq!(f.conn.len(), count);
        assert_eq!(f.mobility.in_progress(), 0);
    }

    #[test]
    fn test_notify_commits() {
        let mut f = fixture();
        let target = prepare(&mut f);
        f.mobility
            .on_handover_request_acknowledge(
                &mut f.conn,
                TARGET_ASSOC,
                77,
                f.core_id,
                vec![ErabSetupItem {
                    ebi: f.default_ebi,
                    tunnel: tunnel(40),
                }],
                vec![],
            )
            .unwrap();
        f.mobility
            .send_handover_command(&mut f.conn, f.core_id, vec![0xbb])
            .unwrap();
        f.conn.take_outbox();

        let committed = f
            .mobility
            .on_handover_notify(
                &mut f.conn,
                &mut f.sessions,
                TARGET_ASSOC,
                77,
                f.core_id,
                UeLocation::default(),
            )
            .unwrap();
        assert_eq!(committed, target);
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(target));
        assert_eq!(f.conn.get(target).unwrap().state, UeState::Connected);
        assert_eq!(
            f.conn.get(f.source).unwrap().state,
            UeState::AwaitingReleaseComplete
        );
        let source_timer = f.conn.get(f.source).unwrap().t_release.unwrap();
        assert_eq!(f.timers.pending(), vec![source_timer]);

        let pool = f.sessions.pool(IMSI).unwrap();
        assert_eq!(pool.bearer(f.default_ebi).unwrap().access_tunnel, Some(tunnel(40)));

        let outbox = f.conn.take_outbox();
        assert!(outbox.s1ap.iter().any(|m| m.assoc_id == SOURCE_ASSOC
            && matches!(
                m.message,
                S1apOutbound::UeContextReleaseCommand {
                    cause: ReleaseCause::SuccessfulHandover,
                    ..
                }
            )));

        // Source release complete leaves the target's index entry alone
        let removed = f.conn.on_release_complete(SOURCE_ASSOC, 10).unwrap();
        assert_eq!(removed.owned_core_id, None);
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(target));
    }

    #[test]
    fn test_acknowledge_with_taken_local_id_fails_preparation() {
        let mut f = fixture();
        let target = prepare(&mut f);
        f.conn
            .on_initial_access(TARGET_ASSOC, 1, 77, vec![], UeLocation::default())
            .unwrap()
            .unwrap();
        f.conn.take_outbox();

        let result = f.mobility.on_handover_request_acknowledge(
            &mut f.conn,
            TARGET_ASSOC,
            77,
            f.core_id,
            vec![ErabSetupItem {
                ebi: f.default_ebi,
                tunnel: tunnel(40),
            }],
            vec![],
        );
        assert!(matches!(
            result,
            Err(MobilityError::Connection(ConnectionError::Association(_)))
        ));

        assert!(f.conn.get(target).is_none());
        assert_eq!(f.mobility.in_progress(), 0);
        assert!(f.conn.get(f.source).unwrap().handover.is_none());
        let outbox = f.conn.take_outbox();
        assert_eq!(outbox.s1ap.len(), 1);
        assert_eq!(outbox.s1ap[0].assoc_id, SOURCE_ASSOC);
        assert_eq!(
            outbox.s1ap[0].message,
            S1apOutbound::HandoverPreparationFailure {
                mme_ue_s1ap_id: f.core_id,
                enb_ue_s1ap_id: 10,
                cause: S1apCause::radio_network(radio_network_cause::UNKNOWN_ENB_UE_S1AP_ID),
            }
        );
        assert!(outbox.app.contains(&AppIndication::HandoverFailure {
            mme_ue_s1ap_id: f.core_id,
            reason: HandoverFailureReason::AdmissionFailed,
        }));
    }

    #[test]
    fn test_notify_refused_once_source_is_releasing() {
        let mut f = fixture();
        let target = prepare(&mut f);
        f.mobility
            .on_handover_request_acknowledge(
                &mut f.conn,
                TARGET_ASSOC,
                77,
                f.core_id,
                vec![ErabSetupItem {
                    ebi: f.default_ebi,
                    tunnel: tunnel(40),
                }],
                vec![],
            )
            .unwrap();
        f.conn.transition(f.source, UeState::AwaitingReleaseComplete);
        f.conn.take_outbox();

        let result = f.mobility.on_handover_notify(
            &mut f.conn,
            &mut f.sessions,
            TARGET_ASSOC,
            77,
            f.core_id,
            UeLocation::default(),
        );
        assert_eq!(result, Err(MobilityError::NoHandover(f.core_id)));
        assert!(f.conn.get(target).is_none());
        assert_eq!(f.mobility.in_progress(), 0);
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(f.source));
        let bearer = f.sessions.pool(IMSI).unwrap().bearer(f.default_ebi).unwrap();
        assert_eq!(bearer.access_tunnel, Some(tunnel(3)));
    }

    #[test]
    fn test_cancel_aborts_and_keeps_source() {
        let mut f = fixture();
        let target = prepare(&mut f);
        f.conn.take_outbox();

        f.mobility
            .on_handover_cancel(&mut f.conn, SOURCE_ASSOC, 10, f.core_id, S1apCause::default())
            .unwrap();
        assert!(f.conn.get(target).is_none());
        assert_eq!(f.conn.get(f.source).unwrap().state, UeState::Connected);
        assert!(f.conn.get(f.source).unwrap().handover.is_none());
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(f.source));
        assert!(f.timers.pending().is_empty());

        let outbox = f.conn.take_outbox();
        assert!(matches!(
            outbox.s1ap.last().unwrap().message,
            S1apOutbound::HandoverCancelAcknowledge { .. }
        ));
    }

    #[test]
    fn test_timeout_aborts_acknowledged_target() {
        let mut f = fixture();
        let target = prepare(&mut f);
        f.mobility
            .on_handover_request_acknowledge(
                &mut f.conn,
                TARGET_ASSOC,
                77,
                f.core_id,
                vec![ErabSetupItem {
                    ebi: f.default_ebi,
                    tunnel: tunnel(40),
                }],
                vec![],
            )
            .unwrap();
        f.conn.take_outbox();

        let handle = f.conn.get(target).unwrap().t_handover.unwrap();
        let owner = f.conn.resolve_timer(handle).unwrap();
        f.mobility.on_handover_timeout(&mut f.conn, owner.ue_id);

        assert!(f.conn.get(target).is_none());
        assert_eq!(f.conn.get(f.source).unwrap().state, UeState::Connected);
        let outbox = f.conn.take_outbox();
        assert!(outbox.s1ap.iter().any(|m| m.assoc_id == TARGET_ASSOC
            && matches!(
                m.message,
                S1apOutbound::UeContextReleaseCommand {
                    cause: ReleaseCause::HandoverCancelled,
                    ..
                }
            )));
        assert!(outbox.app.contains(&AppIndication::HandoverFailure {
            mme_ue_s1ap_id: f.core_id,
            reason: HandoverFailureReason::Timeout,
        }));
    }

    #[test]
    fn test_path_switch_moves_record() {
        let mut f = fixture();
        let outcome = f
            .mobility
            .on_path_switch_request(
                &mut f.conn,
                &mut f.sessions,
                TARGET_ASSOC,
                1,
                55,
                f.core_id,
                UeLocation::default(),
                vec![ErabSetupItem {
                    ebi: f.default_ebi,
                    tunnel: tunnel(60),
                }],
            )
            .unwrap();

        assert!(f.conn.get(f.source).is_none());
        assert!(f.conn.find_by_pair(SOURCE_ASSOC, 10).is_none());
        assert_eq!(f.conn.find_by_pair(TARGET_ASSOC, 55), Some(outcome.ue_id));
        assert_eq!(f.conn.find_by_core_id(f.core_id), Some(outcome.ue_id));
        assert_eq!(outcome.switched, vec![f.default_ebi]);
        assert!(outcome.released.is_empty());
    }

    #[test]
    fn test_path_switch_unknown_source_fails() {
        let mut f = fixture();
        f.conn.take_outbox();
        let err = f
            .mobility
            .on_path_switch_request(
                &mut f.conn,
                &mut f.sessions,
                TARGET_ASSOC,
                1,
                55,
                4242,
                UeLocation::default(),
                vec![],
            )
            .unwrap_err();
        assert_eq!(err, MobilityError::UnknownSource(4242));
        let outbox = f.conn.take_outbox();
        assert!(matches!(
            outbox.s1ap[0].message,
            S1apOutbound::PathSwitchRequestFailure { mme_ue_s1ap_id: 4242, .. }
        ));
    }
}
