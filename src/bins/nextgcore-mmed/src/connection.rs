//! UE Connection Registry
//!
//! Per-UE S1 connection state machine
//! (`AwaitingContextSetup -> Connected -> AwaitingReleaseComplete`) on top of
//! the association registry, plus the MME UE S1AP ID index that other tasks
//! read for downlink routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::association::{AssociationError, AssociationRegistry, DetachOutcome};
use crate::config::MmeConfig;
use crate::context::{
    AssocId, Bitrate, Ebi, EnbUeS1apId, MmeUeS1apId, SubscriberId, UeId, UeLocation,
};
use crate::event::{AppIndication, Outbox};
use crate::s1ap_build::{
    build_ue_context_release_command, ErabSetupItem, ErabToBeSetup, ReleaseCause, S1apCause,
    S1apOutbound,
};
use crate::timer::{MmeTimerId, TimerHandle, TimerIndex, TimerOwner, TimerService};

// ============================================================================
// Errors
// ============================================================================

/// Connection registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("unknown UE {0}")]
    UnknownUe(UeId),
    #[error("unknown MME_UE_S1AP_ID[{0}]")]
    UnknownCoreId(MmeUeS1apId),
    #[error("unknown UE S1AP ID pair (assoc:{assoc_id} ENB_UE_S1AP_ID[{enb_ue_s1ap_id}])")]
    UnknownPair {
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
    },
    #[error("UE {0} has no ENB_UE_S1AP_ID yet")]
    NoLocalId(UeId),
    #[error("UE {ue_id} is {state}")]
    InvalidState { ue_id: UeId, state: UeState },
    #[error("no free MME_UE_S1AP_ID")]
    CoreIdExhausted,
    #[error(transparent)]
    Association(#[from] AssociationError),
}

// ============================================================================
// UE Connection
// ============================================================================

/// S1 connection state of a UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeState {
    AwaitingContextSetup,
    Connected,
    AwaitingReleaseComplete,
}

impl fmt::Display for UeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UeState::AwaitingContextSetup => write!(f, "AWAITING_CONTEXT_SETUP"),
            UeState::Connected => write!(f, "CONNECTED"),
            UeState::AwaitingReleaseComplete => write!(f, "AWAITING_RELEASE_COMPLETE"),
        }
    }
}

/// Role of a UE connection in an in-flight handover
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoverLeg {
    /// Live anchor at the source eNB
    Source { target: UeId },
    /// Tentative record at the target eNB, not indexed by MME UE S1AP ID
    Target {
        source: UeId,
        mme_ue_s1ap_id: MmeUeS1apId,
        /// Bearers requested from the target
        bearers: Vec<Ebi>,
        /// Bearers the target admitted, with their S1-U endpoints
        admitted: Vec<ErabSetupItem>,
    },
}

/// UE connection (one per UE per eNB association)
#[derive(Debug, Clone)]
pub struct UeConnection {
    /// Pool ID
    pub id: UeId,
    /// Association the UE is anchored at
    pub assoc_id: AssocId,
    /// eNB UE S1AP ID (unknown for a tentative handover target)
    pub enb_ue_s1ap_id: Option<EnbUeS1apId>,
    /// MME UE S1AP ID
    pub mme_ue_s1ap_id: Option<MmeUeS1apId>,
    /// Subscriber bound by the application layer
    pub subscriber: Option<SubscriberId>,
    pub enb_istream_id: u16,
    pub enb_ostream_id: u16,
    pub state: UeState,
    /// Cause of the outstanding release command
    pub relcause: Option<ReleaseCause>,
    /// S1 holding timer
    pub t_release: Option<TimerHandle>,
    /// TS1RELOCOverall
    pub t_handover: Option<TimerHandle>,
    pub handover: Option<HandoverLeg>,
    pub location: UeLocation,
    pub ue_radio_capability: Option<Vec<u8>>,
}

impl UeConnection {
    fn new(id: UeId, assoc_id: AssocId, enb_ue_s1ap_id: Option<EnbUeS1apId>) -> Self {
        Self {
            id,
            assoc_id,
            enb_ue_s1ap_id,
            mme_ue_s1ap_id: None,
            subscriber: None,
            enb_istream_id: 0,
            enb_ostream_id: 0,
            state: UeState::AwaitingContextSetup,
            relcause: None,
            t_release: None,
            t_handover: None,
            handover: None,
            location: UeLocation::default(),
            ue_radio_capability: None,
        }
    }

    /// MME UE S1AP ID used in signalling: the indexed one, or the one a
    /// tentative target is being prepared under
    pub fn signalling_core_id(&self) -> Option<MmeUeS1apId> {
        match (&self.mme_ue_s1ap_id, &self.handover) {
            (Some(id), _) => Some(*id),
            (None, Some(HandoverLeg::Target { mme_ue_s1ap_id, .. })) => Some(*mme_ue_s1ap_id),
            _ => None,
        }
    }

    pub fn is_handover_target(&self) -> bool {
        matches!(self.handover, Some(HandoverLeg::Target { .. }))
    }

    fn timer_slot(&mut self, timer_id: MmeTimerId) -> &mut Option<TimerHandle> {
        match timer_id {
            MmeTimerId::S1Holding => &mut self.t_release,
            MmeTimerId::S1RelocOverall => &mut self.t_handover,
        }
    }
}

/// How a UE is addressed by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeRef {
    /// MME UE S1AP ID (authoritative for application requests)
    Core(MmeUeS1apId),
    /// (association, eNB UE S1AP ID) pair
    Pair {
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
    },
    /// Pool ID
    Ue(UeId),
}

// ============================================================================
// MME UE S1AP ID Index
// ============================================================================

/// Where an MME UE S1AP ID currently points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreIdEntry {
    pub ue_id: UeId,
    pub assoc_id: AssocId,
    pub enb_ue_s1ap_id: Option<EnbUeS1apId>,
    pub stream_id: u16,
}

/// MME UE S1AP ID -> UE connection, readable from other tasks
#[derive(Debug, Default)]
pub struct CoreIdIndex {
    entries: DashMap<MmeUeS1apId, CoreIdEntry>,
}

impl CoreIdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current anchor of an MME UE S1AP ID
    pub fn lookup(&self, mme_ue_s1ap_id: MmeUeS1apId) -> Option<CoreIdEntry> {
        self.entries.get(&mme_ue_s1ap_id).map(|entry| *entry.value())
    }

    pub fn contains(&self, mme_ue_s1ap_id: MmeUeS1apId) -> bool {
        self.entries.contains_key(&mme_ue_s1ap_id)
    }

    /// Point an ID at a UE, returning the previous entry
    fn insert(&self, mme_ue_s1ap_id: MmeUeS1apId, entry: CoreIdEntry) -> Option<CoreIdEntry> {
        self.entries.insert(mme_ue_s1ap_id, entry)
    }

    /// Remove the entry only while it still points at `ue_id`
    fn remove_if_points_at(&self, mme_ue_s1ap_id: MmeUeS1apId, ue_id: UeId) -> bool {
        self.entries
            .remove_if(&mme_ue_s1ap_id, |_, entry| entry.ue_id == ue_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Connection Registry
// ============================================================================

/// Result of destroying a UE connection
#[derive(Debug, Clone)]
pub struct RemovedUe {
    pub ue: UeConnection,
    /// MME UE S1AP ID whose index entry went away with the record
    pub owned_core_id: Option<MmeUeS1apId>,
}

/// UE connection registry, owned by the MME task
pub struct ConnectionRegistry {
    config: Arc<MmeConfig>,
    associations: Arc<AssociationRegistry>,
    core_ids: Arc<CoreIdIndex>,
    timers: TimerIndex,
    ues: HashMap<UeId, UeConnection>,
    next_ue_id: UeId,
    next_mme_ue_s1ap_id: MmeUeS1apId,
    outbox: Outbox,
}

impl ConnectionRegistry {
    pub fn new(
        config: Arc<MmeConfig>,
        associations: Arc<AssociationRegistry>,
        core_ids: Arc<CoreIdIndex>,
        timers: Box<dyn TimerService>,
    ) -> Self {
        Self {
            config,
            associations,
            core_ids,
            timers: TimerIndex::new(timers),
            ues: HashMap::new(),
            next_ue_id: 1,
            next_mme_ue_s1ap_id: 1,
            outbox: Outbox::default(),
        }
    }

    pub fn associations(&self) -> Arc<AssociationRegistry> {
        Arc::clone(&self.associations)
    }

    pub fn core_ids(&self) -> Arc<CoreIdIndex> {
        Arc::clone(&self.core_ids)
    }

    pub fn config(&self) -> &MmeConfig {
        &self.config
    }

    pub fn timers(&self) -> &TimerIndex {
        &self.timers
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub fn take_outbox(&mut self) -> Outbox {
        self.outbox.take()
    }

    pub fn get(&self, ue_id: UeId) -> Option<&UeConnection> {
        self.ues.get(&ue_id)
    }

    pub fn get_mut(&mut self, ue_id: UeId) -> Option<&mut UeConnection> {
        self.ues.get_mut(&ue_id)
    }

    pub fn len(&self) -> usize {
        self.ues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UeConnection> {
        self.ues.values()
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn find_by_pair(&self, assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId) -> Option<UeId> {
        self.associations
            .find_ue(assoc_id, enb_ue_s1ap_id)
            .filter(|ue_id| self.ues.contains_key(ue_id))
    }

    pub fn find_by_core_id(&self, mme_ue_s1ap_id: MmeUeS1apId) -> Option<UeId> {
        self.core_ids
            .lookup(mme_ue_s1ap_id)
            .map(|entry| entry.ue_id)
            .filter(|ue_id| self.ues.contains_key(ue_id))
    }

    /// Resolve uplink traffic. The pair wins over the MME UE S1AP ID; a
    /// disagreement is logged since the ID may be stale mid-handover.
    pub fn resolve_uplink(
        &self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: Option<MmeUeS1apId>,
    ) -> Option<UeId> {
        let ue_id = self.find_by_pair(assoc_id, enb_ue_s1ap_id)?;
        if let Some(mme_ue_s1ap_id) = mme_ue_s1ap_id {
            match self.find_by_core_id(mme_ue_s1ap_id) {
                Some(indexed) if indexed == ue_id => {}
                other => log::warn!(
                    "[assoc:{}] ENB_UE_S1AP_ID[{}] resolves to UE {} but MME_UE_S1AP_ID[{}] to {:?}",
                    assoc_id,
                    enb_ue_s1ap_id,
                    ue_id,
                    mme_ue_s1ap_id,
                    other
                ),
            }
        }
        Some(ue_id)
    }

    pub fn resolve(&self, target: &UeRef) -> Option<UeId> {
        match *target {
            UeRef::Core(mme_ue_s1ap_id) => self.find_by_core_id(mme_ue_s1ap_id),
            UeRef::Pair {
                assoc_id,
                enb_ue_s1ap_id,
            } => self.find_by_pair(assoc_id, enb_ue_s1ap_id),
            UeRef::Ue(ue_id) => self.ues.contains_key(&ue_id).then_some(ue_id),
        }
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Create a UE connection anchored at `assoc_id`
    pub fn create_ue(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: Option<EnbUeS1apId>,
        istream_id: u16,
    ) -> Result<UeId, ConnectionError> {
        let ue_id = self.next_ue_id;
        let ostream_id = self.associations.attach_ue(assoc_id, ue_id, enb_ue_s1ap_id)?;
        self.next_ue_id += 1;

        let mut ue = UeConnection::new(ue_id, assoc_id, enb_ue_s1ap_id);
        ue.enb_istream_id = istream_id;
        ue.enb_ostream_id = ostream_id;
        self.ues.insert(ue_id, ue);

        log::debug!(
            "[ue:{}] UE connection added (assoc:{} ENB_UE_S1AP_ID[{:?}])",
            ue_id,
            assoc_id,
            enb_ue_s1ap_id
        );
        Ok(ue_id)
    }

    /// Allocate an MME UE S1AP ID and index it. IDs still in the index are
    /// skipped after wrap-around.
    pub fn assign_core_id(&mut self, ue_id: UeId) -> Result<MmeUeS1apId, ConnectionError> {
        if !self.ues.contains_key(&ue_id) {
            return Err(ConnectionError::UnknownUe(ue_id));
        }

        let attempts = self.core_ids.len() + 1;
        for _ in 0..attempts {
            let candidate = self.next_mme_ue_s1ap_id;
            self.next_mme_ue_s1ap_id = self.next_mme_ue_s1ap_id.wrapping_add(1);
            if !self.core_ids.contains(candidate) {
                self.index_core_id(ue_id, candidate)?;
                return Ok(candidate);
            }
        }
        Err(ConnectionError::CoreIdExhausted)
    }

    /// Point an MME UE S1AP ID at `ue_id`, taking the entry over from
    /// whichever UE held it. Returns the previous holder.
    pub fn index_core_id(
        &mut self,
        ue_id: UeId,
        mme_ue_s1ap_id: MmeUeS1apId,
    ) -> Result<Option<UeId>, ConnectionError> {
        let ue = self
            .ues
            .get_mut(&ue_id)
            .ok_or(ConnectionError::UnknownUe(ue_id))?;
        ue.mme_ue_s1ap_id = Some(mme_ue_s1ap_id);

        let previous = self.core_ids.insert(
            mme_ue_s1ap_id,
            CoreIdEntry {
                ue_id,
                assoc_id: ue.assoc_id,
                enb_ue_s1ap_id: ue.enb_ue_s1ap_id,
                stream_id: ue.enb_ostream_id,
            },
        );
        let previous = previous.map(|entry| entry.ue_id).filter(|prev| *prev != ue_id);
        if let Some(prev) = previous {
            log::info!(
                "[ue:{}] MME_UE_S1AP_ID[{}] taken over from UE {}",
                ue_id,
                mme_ue_s1ap_id,
                prev
            );
        }
        Ok(previous)
    }

    /// Bind the eNB UE S1AP ID of a UE created without one
    pub fn bind_local_id(
        &mut self,
        ue_id: UeId,
        enb_ue_s1ap_id: EnbUeS1apId,
    ) -> Result<(), ConnectionError> {
        let ue = self
            .ues
            .get_mut(&ue_id)
            .ok_or(ConnectionError::UnknownUe(ue_id))?;
        self.associations
            .bind_local_id(ue.assoc_id, ue_id, enb_ue_s1ap_id)?;
        ue.enb_ue_s1ap_id = Some(enb_ue_s1ap_id);

        if let Some(mme_ue_s1ap_id) = ue.mme_ue_s1ap_id {
            if let Some(mut entry) = self.core_ids.lookup(mme_ue_s1ap_id) {
                if entry.ue_id == ue_id {
                    entry.enb_ue_s1ap_id = Some(enb_ue_s1ap_id);
                    self.core_ids.insert(mme_ue_s1ap_id, entry);
                }
            }
        }
        Ok(())
    }

    pub fn transition(&mut self, ue_id: UeId, new_state: UeState) {
        if let Some(ue) = self.ues.get_mut(&ue_id) {
            if ue.state != new_state {
                log::debug!("UE FSM [{}]: {} -> {}", ue_id, ue.state, new_state);
                ue.state = new_state;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Arm (or re-arm) a timer on a UE and store its handle on the record
    pub fn arm_timer(&mut self, ue_id: UeId, timer_id: MmeTimerId) -> Option<TimerHandle> {
        let duration = match timer_id {
            MmeTimerId::S1Holding => self.config.s1_holding(),
            MmeTimerId::S1RelocOverall => self.config.s1_reloc_overall(),
        };
        let ue = self.ues.get_mut(&ue_id)?;
        if let Some(stale) = ue.timer_slot(timer_id).take() {
            self.timers.cancel(stale);
        }
        let handle = self.timers.arm(ue_id, timer_id, duration);
        *ue.timer_slot(timer_id) = Some(handle);
        Some(handle)
    }

    pub fn cancel_timer(&mut self, ue_id: UeId, timer_id: MmeTimerId) {
        if let Some(ue) = self.ues.get_mut(&ue_id) {
            if let Some(handle) = ue.timer_slot(timer_id).take() {
                self.timers.cancel(handle);
            }
        }
    }

    /// Resolve a fired timer to its owner. Stale expiries (cancelled, owner
    /// gone, or handle superseded) resolve to `None`.
    pub fn resolve_timer(&mut self, handle: TimerHandle) -> Option<TimerOwner> {
        let Some(owner) = self.timers.resolve(handle) else {
            log::debug!("{} fired after cancel, ignored", handle);
            return None;
        };
        let Some(ue) = self.ues.get_mut(&owner.ue_id) else {
            log::debug!("[ue:{}] {} fired for a removed UE", owner.ue_id, owner.timer_id);
            return None;
        };
        let slot = ue.timer_slot(owner.timer_id);
        if *slot != Some(handle) {
            log::debug!("[ue:{}] {} superseded, ignored", owner.ue_id, handle);
            return None;
        }
        *slot = None;
        Some(owner)
    }

    // ------------------------------------------------------------------------
    // Inbound S1AP
    // ------------------------------------------------------------------------

    /// Initial UE message. Returns the new UE, or `None` when dropped.
    pub fn on_initial_access(
        &mut self,
        assoc_id: AssocId,
        stream_id: u16,
        enb_ue_s1ap_id: EnbUeS1apId,
        nas_pdu: Vec<u8>,
        location: UeLocation,
    ) -> Result<Option<UeId>, ConnectionError> {
        if !self.associations.is_ready(assoc_id) {
            log::warn!(
                "[assoc:{}] initial UE message before S1 setup, dropped (ENB_UE_S1AP_ID[{}])",
                assoc_id,
                enb_ue_s1ap_id
            );
            return Ok(None);
        }
        if let Some(existing) = self.find_by_pair(assoc_id, enb_ue_s1ap_id) {
            log::warn!(
                "[assoc:{}] duplicate initial UE message for ENB_UE_S1AP_ID[{}] (UE {}), ignored",
                assoc_id,
                enb_ue_s1ap_id,
                existing
            );
            return Ok(None);
        }

        let ue_id = self.create_ue(assoc_id, Some(enb_ue_s1ap_id), stream_id)?;
        let mme_ue_s1ap_id = match self.assign_core_id(ue_id) {
            Ok(id) => id,
            Err(e) => {
                self.destroy(ue_id);
                return Err(e);
            }
        };
        if let Some(ue) = self.ues.get_mut(&ue_id) {
            ue.location = location;
        }

        log::info!(
            "[ue:{}] initial UE message (ENB_UE_S1AP_ID[{}] MME_UE_S1AP_ID[{}] TAC[{}])",
            ue_id,
            enb_ue_s1ap_id,
            mme_ue_s1ap_id,
            location.tai.tac
        );
        self.outbox.indicate(AppIndication::InitialUe {
            ue_id,
            mme_ue_s1ap_id,
            nas_pdu,
            location,
        });
        Ok(Some(ue_id))
    }

    /// Uplink NAS transport
    pub fn on_uplink(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: Option<MmeUeS1apId>,
        nas_pdu: Vec<u8>,
        location: UeLocation,
    ) -> Option<UeId> {
        let Some(ue_id) = self.resolve_uplink(assoc_id, enb_ue_s1ap_id, mme_ue_s1ap_id) else {
            log::warn!(
                "[assoc:{}] uplink for unknown ENB_UE_S1AP_ID[{}], dropped",
                assoc_id,
                enb_ue_s1ap_id
            );
            return None;
        };
        let ue = self.ues.get_mut(&ue_id)?;
        ue.location = location;
        let Some(core_id) = ue.mme_ue_s1ap_id else {
            log::warn!("[ue:{}] uplink before MME_UE_S1AP_ID, dropped", ue_id);
            return None;
        };
        self.outbox.indicate(AppIndication::UplinkNas {
            mme_ue_s1ap_id: core_id,
            nas_pdu,
            location,
        });
        Some(ue_id)
    }

    /// UE context release request from the eNB. Returns whether it was
    /// forwarded to the application layer.
    pub fn on_context_release_request(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    ) -> bool {
        let Some(ue_id) = self.resolve_uplink(assoc_id, enb_ue_s1ap_id, Some(mme_ue_s1ap_id))
        else {
            log::warn!(
                "[assoc:{}] release request for unknown ENB_UE_S1AP_ID[{}]",
                assoc_id,
                enb_ue_s1ap_id
            );
            return false;
        };
        if cause.is_user_inactivity() {
            log::debug!("[ue:{}] release request for user inactivity ignored", ue_id);
            return false;
        }
        let Some(core_id) = self.ues.get(&ue_id).and_then(|ue| ue.mme_ue_s1ap_id) else {
            return false;
        };

        log::info!("[ue:{}] UE context release request [{}]", ue_id, cause);
        self.outbox.indicate(AppIndication::ReleaseRequest {
            mme_ue_s1ap_id: core_id,
            cause,
        });
        true
    }

    /// Send a UE context release command.
    ///
    /// An unknown UE is answered with a synthesized release complete. Causes
    /// that expect no answer destroy the record at once and return it; the
    /// others wait in `AwaitingReleaseComplete` under the S1 holding timer.
    pub fn release_command(&mut self, target: &UeRef, cause: ReleaseCause) -> Option<RemovedUe> {
        let Some(ue_id) = self.resolve(target) else {
            log::info!("{:?} already gone, release [{}] acknowledged locally", target, cause);
            let mme_ue_s1ap_id = match target {
                UeRef::Core(id) => Some(*id),
                _ => None,
            };
            self.outbox.indicate(AppIndication::ReleaseComplete {
                ue_id: None,
                mme_ue_s1ap_id,
                synthesized: true,
            });
            return None;
        };

        let (assoc_id, stream_id, enb_ue_s1ap_id, core_id, state) = match self.ues.get(&ue_id) {
            Some(ue) => (
                ue.assoc_id,
                ue.enb_ostream_id,
                ue.enb_ue_s1ap_id,
                ue.signalling_core_id(),
                ue.state,
            ),
            None => return None,
        };

        if state == UeState::AwaitingReleaseComplete && cause.expects_release_complete() {
            log::debug!("[ue:{}] release already pending, [{}] ignored", ue_id, cause);
            return None;
        }

        let reachable = self
            .associations
            .find_by_assoc_id(assoc_id)
            .map_or(false, |enb| enb.is_reachable());
        if reachable && (enb_ue_s1ap_id.is_some() || core_id.is_some()) {
            log::info!(
                "[ue:{}] UE context release command [{}] (ENB_UE_S1AP_ID[{:?}] MME_UE_S1AP_ID[{:?}])",
                ue_id,
                cause,
                enb_ue_s1ap_id,
                core_id
            );
            self.outbox.send(
                assoc_id,
                stream_id,
                build_ue_context_release_command(enb_ue_s1ap_id, core_id, cause),
            );
        }

        if !cause.expects_release_complete() {
            return self.finish_release(ue_id, true);
        }

        if let Some(ue) = self.ues.get_mut(&ue_id) {
            ue.relcause = Some(cause);
        }
        self.transition(ue_id, UeState::AwaitingReleaseComplete);
        self.arm_timer(ue_id, MmeTimerId::S1Holding);
        None
    }

    /// UE context release complete, matched by pair. A second delivery is a
    /// no-op.
    pub fn on_release_complete(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
    ) -> Option<RemovedUe> {
        let Some(ue_id) = self.find_by_pair(assoc_id, enb_ue_s1ap_id) else {
            log::debug!(
                "[assoc:{}] release complete for ENB_UE_S1AP_ID[{}] already handled",
                assoc_id,
                enb_ue_s1ap_id
            );
            return None;
        };
        if let Some(ue) = self.ues.get(&ue_id) {
            if ue.state != UeState::AwaitingReleaseComplete {
                log::warn!("[ue:{}] release complete in {}", ue_id, ue.state);
            }
        }
        self.finish_release(ue_id, false)
    }

    /// S1 holding timer expired: act as if release complete had arrived
    pub fn on_release_timeout(&mut self, ue_id: UeId) -> Option<RemovedUe> {
        let state = self.ues.get(&ue_id)?.state;
        if state != UeState::AwaitingReleaseComplete {
            log::debug!("[ue:{}] S1_HOLDING expired in {}, ignored", ue_id, state);
            return None;
        }
        log::warn!("[ue:{}] no UE context release complete, removing", ue_id);
        self.finish_release(ue_id, true)
    }

    fn finish_release(&mut self, ue_id: UeId, synthesized: bool) -> Option<RemovedUe> {
        let removed = self.destroy(ue_id)?;
        self.outbox.indicate(AppIndication::ReleaseComplete {
            ue_id: Some(ue_id),
            mme_ue_s1ap_id: removed.owned_core_id,
            synthesized,
        });
        Some(removed)
    }

    /// Remove a UE connection: cancel its timers, detach it from its
    /// association and drop its index entry if it still owns it.
    pub fn destroy(&mut self, ue_id: UeId) -> Option<RemovedUe> {
        let ue = self.ues.remove(&ue_id)?;
        for handle in [ue.t_release, ue.t_handover].into_iter().flatten() {
            self.timers.cancel(handle);
        }

        match self
            .associations
            .detach_ue(ue.assoc_id, ue_id, ue.enb_ue_s1ap_id)
        {
            DetachOutcome::Removed => {
                log::info!("[assoc:{}] last UE gone, association removed", ue.assoc_id)
            }
            DetachOutcome::Reinitialized => {
                log::info!("[assoc:{}] last UE gone, association re-initialized", ue.assoc_id)
            }
            DetachOutcome::Remaining | DetachOutcome::Unknown => {}
        }

        let owned_core_id = ue
            .mme_ue_s1ap_id
            .filter(|id| self.core_ids.remove_if_points_at(*id, ue_id));

        log::debug!("[ue:{}] UE connection removed", ue_id);
        Some(RemovedUe { ue, owned_core_id })
    }

    /// Association lost: UEs owning an MME UE S1AP ID wait for the
    /// application to release them, the rest are removed at once. A UE
    /// already waiting for its release complete keeps its S1 holding timer.
    pub fn on_association_down(&mut self, ues: &[UeId]) {
        for &ue_id in ues {
            let (core_id, state) = match self.ues.get(&ue_id) {
                Some(ue) => (ue.mme_ue_s1ap_id, ue.state),
                None => continue,
            };
            if state == UeState::AwaitingReleaseComplete {
                log::debug!("[ue:{}] release already pending, left to S1_HOLDING", ue_id);
                continue;
            }
            let owned = core_id.filter(|id| {
                self.core_ids.lookup(*id).map(|entry| entry.ue_id) == Some(ue_id)
            });
            match owned {
                Some(mme_ue_s1ap_id) => {
                    if let Some(ue) = self.ues.get_mut(&ue_id) {
                        ue.relcause = Some(ReleaseCause::TransportLost);
                    }
                    self.transition(ue_id, UeState::AwaitingReleaseComplete);
                    self.arm_timer(ue_id, MmeTimerId::S1Holding);
                    self.outbox.indicate(AppIndication::ReleaseRequest {
                        mme_ue_s1ap_id,
                        cause: ReleaseCause::TransportLost.to_s1ap_cause(),
                    });
                }
                None => {
                    self.destroy(ue_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Application-driven
    // ------------------------------------------------------------------------

    fn connected_target(
        &self,
        mme_ue_s1ap_id: MmeUeS1apId,
    ) -> Result<(UeId, AssocId, u16, EnbUeS1apId), ConnectionError> {
        let ue_id = self
            .find_by_core_id(mme_ue_s1ap_id)
            .ok_or(ConnectionError::UnknownCoreId(mme_ue_s1ap_id))?;
        let ue = self.ues.get(&ue_id).ok_or(ConnectionError::UnknownUe(ue_id))?;
        if ue.state == UeState::AwaitingReleaseComplete {
            return Err(ConnectionError::InvalidState {
                ue_id,
                state: ue.state,
            });
        }
        let enb_ue_s1ap_id = ue.enb_ue_s1ap_id.ok_or(ConnectionError::NoLocalId(ue_id))?;
        Ok((ue_id, ue.assoc_id, ue.enb_ostream_id, enb_ue_s1ap_id))
    }

    /// Initial context setup request
    pub fn send_initial_context_setup(
        &mut self,
        mme_ue_s1ap_id: MmeUeS1apId,
        ue_ambr: Bitrate,
        e_rabs: Vec<ErabToBeSetup>,
        nas_pdu: Option<Vec<u8>>,
    ) -> Result<(), ConnectionError> {
        let (ue_id, assoc_id, stream_id, enb_ue_s1ap_id) = self.connected_target(mme_ue_s1ap_id)?;
        log::info!("[ue:{}] initial context setup request ({} E-RAB)", ue_id, e_rabs.len());
        self.outbox.send(
            assoc_id,
            stream_id,
            S1apOutbound::InitialContextSetupRequest {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id,
                ue_ambr,
                e_rabs,
                nas_pdu,
            },
        );
        Ok(())
    }

    /// Initial context setup response: the UE is connected
    pub fn confirm_context_setup(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        e_rabs: Vec<ErabSetupItem>,
        failed: Vec<Ebi>,
    ) -> Option<UeId> {
        let Some(ue_id) = self.resolve_uplink(assoc_id, enb_ue_s1ap_id, Some(mme_ue_s1ap_id))
        else {
            log::warn!(
                "[assoc:{}] context setup response for unknown ENB_UE_S1AP_ID[{}]",
                assoc_id,
                enb_ue_s1ap_id
            );
            return None;
        };
        let state = self.ues.get(&ue_id)?.state;
        if state == UeState::AwaitingReleaseComplete {
            log::warn!("[ue:{}] context setup response while releasing, ignored", ue_id);
            return None;
        }
        self.transition(ue_id, UeState::Connected);
        self.outbox.indicate(AppIndication::ContextSetupConfirmed {
            mme_ue_s1ap_id,
            e_rabs,
            failed,
        });
        Some(ue_id)
    }

    /// Initial context setup failure: reported upward, the application
    /// decides about the release
    pub fn on_context_setup_failure(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    ) -> Option<UeId> {
        let ue_id = self.resolve_uplink(assoc_id, enb_ue_s1ap_id, Some(mme_ue_s1ap_id))?;
        log::warn!("[ue:{}] initial context setup failure [{}]", ue_id, cause);
        self.outbox.indicate(AppIndication::ContextSetupFailed {
            mme_ue_s1ap_id,
            cause,
        });
        Some(ue_id)
    }

    /// Downlink NAS transport
    pub fn send_downlink_nas(
        &mut self,
        mme_ue_s1ap_id: MmeUeS1apId,
        nas_pdu: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let (_, assoc_id, stream_id, enb_ue_s1ap_id) = self.connected_target(mme_ue_s1ap_id)?;
        self.outbox.send(
            assoc_id,
            stream_id,
            S1apOutbound::DownlinkNasTransport {
                mme_ue_s1ap_id,
                enb_ue_s1ap_id,
                nas_pdu,
            },
        );
        Ok(())
    }

    /// UE capability info indication: stored and forwarded
    pub fn on_ue_capability_info(
        &mut self,
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
        mme_ue_s1ap_id: MmeUeS1apId,
        ue_radio_capability: Vec<u8>,
    ) -> Option<UeId> {
        let ue_id = self.resolve_uplink(assoc_id, enb_ue_s1ap_id, Some(mme_ue_s1ap_id))?;
        let ue = self.ues.get_mut(&ue_id)?;
        ue.ue_radio_capability = Some(ue_radio_capability.clone());
        self.outbox.indicate(AppIndication::UeCapability {
            mme_ue_s1ap_id,
            ue_radio_capability,
        });
        Some(ue_id)
    }

    /// Bind the subscriber identified by the application layer
    pub fn bind_subscriber(
        &mut self,
        mme_ue_s1ap_id: MmeUeS1apId,
        subscriber: SubscriberId,
    ) -> Result<UeId, ConnectionError> {
        let ue_id = self
            .find_by_core_id(mme_ue_s1ap_id)
            .ok_or(ConnectionError::UnknownCoreId(mme_ue_s1ap_id))?;
        if let Some(ue) = self.ues.get_mut(&ue_id) {
            log::debug!("[ue:{}] subscriber [{}]", ue_id, subscriber);
            ue.subscriber = Some(subscriber);
        }
        Ok(ue_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
