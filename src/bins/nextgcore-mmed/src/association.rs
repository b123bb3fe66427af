//! eNB Association Registry
//!
//! One `EnbAssociation` per SCTP association. The registry is shared with
//! other tasks (downlink delivery, paging) through `Arc`, so both maps are
//! concurrent. Only the MME task mutates it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;

use dashmap::DashMap;
use thiserror::Error;

use crate::context::{AssocId, EnbId, EnbUeS1apId, EpsTai, PlmnId, UeId};
use crate::s1ap_build::NON_UE_SIGNALLING_STREAM;

/// Association registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssociationError {
    #[error("unknown association {0}")]
    UnknownAssociation(AssocId),
    #[error("association {assoc_id} is {state}; teardown must finish first")]
    TeardownInProgress { assoc_id: AssocId, state: EnbState },
    #[error("ENB_UE_S1AP_ID[{enb_ue_s1ap_id}] already in use on association {assoc_id}")]
    DuplicateLocalId {
        assoc_id: AssocId,
        enb_ue_s1ap_id: EnbUeS1apId,
    },
}

/// eNB association lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnbState {
    /// Transport up, S1 setup not yet accepted
    Initializing,
    /// Transport restarted while UEs were still attached
    Resetting,
    /// S1 setup accepted
    Ready,
    /// Transport closed, waiting for the last UE to detach
    ShuttingDown,
}

impl fmt::Display for EnbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnbState::Initializing => write!(f, "INITIALIZING"),
            EnbState::Resetting => write!(f, "RESETTING"),
            EnbState::Ready => write!(f, "READY"),
            EnbState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
        }
    }
}

/// eNB association
#[derive(Debug, Clone)]
pub struct EnbAssociation {
    /// SCTP association ID
    pub assoc_id: AssocId,
    /// Remote address (informational)
    pub addr: Option<SocketAddr>,
    /// Global eNB ID, set by S1 setup
    pub enb_id: Option<EnbId>,
    /// PLMN of the global eNB ID
    pub plmn_id: PlmnId,
    /// eNB name
    pub name: Option<String>,
    /// Inbound stream count
    pub max_num_of_istreams: u16,
    /// Outbound stream count
    pub max_num_of_ostreams: u16,
    /// Next UE-associated outbound stream
    pub next_ostream_id: u16,
    /// Supported TA list
    pub supported_ta_list: Vec<EpsTai>,
    /// Default paging DRX
    pub default_paging_drx: Option<u8>,
    /// Lifecycle state
    pub state: EnbState,
    /// UEs anchored on this association
    pub ue_set: BTreeSet<UeId>,
    /// ENB_UE_S1AP_ID -> UE
    pub ue_by_local_id: HashMap<EnbUeS1apId, UeId>,
}

impl EnbAssociation {
    pub fn new(assoc_id: AssocId, inbound_streams: u16, outbound_streams: u16) -> Self {
        Self {
            assoc_id,
            addr: None,
            enb_id: None,
            plmn_id: PlmnId::default(),
            name: None,
            max_num_of_istreams: inbound_streams,
            max_num_of_ostreams: outbound_streams,
            next_ostream_id: 1,
            supported_ta_list: Vec::new(),
            default_paging_drx: None,
            state: EnbState::Initializing,
            ue_set: BTreeSet::new(),
            ue_by_local_id: HashMap::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == EnbState::Ready
    }

    /// Whether UE-associated signalling may be sent on this association
    pub fn is_reachable(&self) -> bool {
        matches!(self.state, EnbState::Ready | EnbState::Initializing)
    }

    pub fn serves(&self, tai: &EpsTai) -> bool {
        self.supported_ta_list.contains(tai)
    }

    /// Hand out the next outbound stream for a UE.
    ///
    /// Stream 0 carries non-UE signalling and is skipped unless it is the
    /// only stream.
    pub fn take_ostream_id(&mut self) -> u16 {
        if self.max_num_of_ostreams <= 1 {
            return NON_UE_SIGNALLING_STREAM;
        }
        let stream = self.next_ostream_id;
        self.next_ostream_id = if stream + 1 >= self.max_num_of_ostreams {
            1
        } else {
            stream + 1
        };
        stream
    }
}

/// Result of detaching a UE from its association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Association still has UEs or is not closing
    Remaining,
    /// Last UE left a closing association; association removed
    Removed,
    /// Last UE left a resetting association; back to Initializing
    Reinitialized,
    /// Association no longer exists
    Unknown,
}

/// Result of an association going down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownOutcome {
    /// No UEs were attached; association removed
    Removed,
    /// No UEs were attached; association back to Initializing
    Reinitialized,
    /// UEs still attached; they must be released first
    Draining(Vec<UeId>),
    /// Association was not known
    Unknown,
}

/// Concurrent registry of eNB associations
#[derive(Debug, Default)]
pub struct AssociationRegistry {
    by_assoc: DashMap<AssocId, EnbAssociation>,
    by_enb_id: DashMap<EnbId, AssocId>,
}

impl AssociationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Transport association established (or restarted)
    pub fn on_association_up(
        &self,
        assoc_id: AssocId,
        inbound_streams: u16,
        outbound_streams: u16,
        addr: Option<SocketAddr>,
    ) -> Result<(), AssociationError> {
        if let Some(mut enb) = self.by_assoc.get_mut(&assoc_id) {
            if matches!(enb.state, EnbState::ShuttingDown | EnbState::Resetting) {
                log::warn!(
                    "[assoc:{}] association up rejected while {}",
                    assoc_id,
                    enb.state
                );
                return Err(AssociationError::TeardownInProgress {
                    assoc_id,
                    state: enb.state,
                });
            }
            enb.max_num_of_istreams = inbound_streams;
            enb.max_num_of_ostreams = outbound_streams;
            enb.next_ostream_id = 1;
            if addr.is_some() {
                enb.addr = addr;
            }
            log::info!(
                "[assoc:{}] streams updated (in:{} out:{})",
                assoc_id,
                inbound_streams,
                outbound_streams
            );
            return Ok(());
        }

        let mut enb = EnbAssociation::new(assoc_id, inbound_streams, outbound_streams);
        enb.addr = addr;
        self.by_assoc.insert(assoc_id, enb);
        log::info!(
            "[assoc:{}] eNB association added (in:{} out:{})",
            assoc_id,
            inbound_streams,
            outbound_streams
        );
        Ok(())
    }

    /// Transport association closed (or reset by the peer)
    pub fn on_association_down(&self, assoc_id: AssocId, is_reset: bool) -> DownOutcome {
        let ues: Vec<UeId> = {
            let Some(mut enb) = self.by_assoc.get_mut(&assoc_id) else {
                log::debug!("[assoc:{}] association down for unknown association", assoc_id);
                return DownOutcome::Unknown;
            };
            if !enb.ue_set.is_empty() {
                enb.state = if is_reset {
                    EnbState::Resetting
                } else {
                    EnbState::ShuttingDown
                };
                log::info!(
                    "[assoc:{}] association down, {} UE(s) to release ({})",
                    assoc_id,
                    enb.ue_set.len(),
                    enb.state
                );
                enb.ue_set.iter().copied().collect()
            } else {
                Vec::new()
            }
        };

        if !ues.is_empty() {
            return DownOutcome::Draining(ues);
        }

        if is_reset {
            self.reinitialize(assoc_id);
            DownOutcome::Reinitialized
        } else {
            self.remove(assoc_id);
            DownOutcome::Removed
        }
    }

    /// Remove an association and its eNB ID binding
    pub fn remove(&self, assoc_id: AssocId) -> Option<EnbAssociation> {
        let (_, enb) = self.by_assoc.remove(&assoc_id)?;
        if let Some(enb_id) = enb.enb_id {
            self.by_enb_id.remove_if(&enb_id, |_, bound| *bound == assoc_id);
        }
        log::info!("[assoc:{}] eNB association removed", assoc_id);
        Some(enb)
    }

    fn reinitialize(&self, assoc_id: AssocId) {
        let enb_id = match self.by_assoc.get_mut(&assoc_id) {
            Some(mut enb) => {
                enb.state = EnbState::Initializing;
                enb.next_ostream_id = 1;
                enb.enb_id.take()
            }
            None => return,
        };
        if let Some(enb_id) = enb_id {
            self.by_enb_id.remove_if(&enb_id, |_, bound| *bound == assoc_id);
        }
        log::info!("[assoc:{}] eNB association re-initialized", assoc_id);
    }

    // ------------------------------------------------------------------------
    // S1 setup bookkeeping
    // ------------------------------------------------------------------------

    /// Association currently bound to `enb_id`, if any other than `assoc_id`
    pub fn enb_id_bound_elsewhere(&self, enb_id: EnbId, assoc_id: AssocId) -> Option<AssocId> {
        let bound = *self.by_enb_id.get(&enb_id)?;
        if bound == assoc_id {
            return None;
        }
        // A binding to an association that no longer exists is stale
        if self.by_assoc.contains_key(&bound) {
            Some(bound)
        } else {
            None
        }
    }

    /// Record a successful S1 setup
    pub fn mark_ready(
        &self,
        assoc_id: AssocId,
        enb_id: EnbId,
        plmn_id: PlmnId,
        name: Option<String>,
        supported_ta_list: Vec<EpsTai>,
        default_paging_drx: Option<u8>,
    ) -> Result<(), AssociationError> {
        let previous = {
            let mut enb = self
                .by_assoc
                .get_mut(&assoc_id)
                .ok_or(AssociationError::UnknownAssociation(assoc_id))?;
            let previous = enb.enb_id.replace(enb_id);
            enb.plmn_id = plmn_id;
            enb.name = name;
            enb.supported_ta_list = supported_ta_list;
            enb.default_paging_drx = default_paging_drx;
            enb.state = EnbState::Ready;
            previous
        };
        if let Some(previous) = previous.filter(|previous| *previous != enb_id) {
            self.by_enb_id.remove_if(&previous, |_, bound| *bound == assoc_id);
        }
        self.by_enb_id.insert(enb_id, assoc_id);
        Ok(())
    }

    /// Update name and/or TA list (eNB configuration update)
    pub fn update_configuration(
        &self,
        assoc_id: AssocId,
        name: Option<String>,
        supported_ta_list: Option<Vec<EpsTai>>,
        default_paging_drx: Option<u8>,
    ) -> Result<(), AssociationError> {
        let mut enb = self
            .by_assoc
            .get_mut(&assoc_id)
            .ok_or(AssociationError::UnknownAssociation(assoc_id))?;
        if name.is_some() {
            enb.name = name;
        }
        if let Some(list) = supported_ta_list {
            enb.supported_ta_list = list;
        }
        if default_paging_drx.is_some() {
            enb.default_paging_drx = default_paging_drx;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn find_by_assoc_id(&self, assoc_id: AssocId) -> Option<EnbAssociation> {
        self.by_assoc.get(&assoc_id).map(|enb| enb.value().clone())
    }

    pub fn find_by_enb_id(&self, enb_id: EnbId) -> Option<EnbAssociation> {
        let assoc_id = *self.by_enb_id.get(&enb_id)?;
        self.find_by_assoc_id(assoc_id)
    }

    /// Ready associations serving `tai`, ordered by association ID
    pub fn find_by_tracking_area(&self, tai: &EpsTai) -> Vec<EnbAssociation> {
        let mut found: Vec<EnbAssociation> = self
            .by_assoc
            .iter()
            .filter(|enb| enb.is_ready() && enb.serves(tai))
            .map(|enb| enb.value().clone())
            .collect();
        found.sort_by_key(|enb| enb.assoc_id);
        found
    }

    pub fn state_of(&self, assoc_id: AssocId) -> Option<EnbState> {
        self.by_assoc.get(&assoc_id).map(|enb| enb.state)
    }

    pub fn is_ready(&self, assoc_id: AssocId) -> bool {
        self.state_of(assoc_id) == Some(EnbState::Ready)
    }

    pub fn ready_count(&self) -> usize {
        self.by_assoc.iter().filter(|enb| enb.is_ready()).count()
    }

    pub fn len(&self) -> usize {
        self.by_assoc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_assoc.is_empty()
    }

    // ------------------------------------------------------------------------
    // UE anchoring
    // ------------------------------------------------------------------------

    pub fn find_ue(&self, assoc_id: AssocId, enb_ue_s1ap_id: EnbUeS1apId) -> Option<UeId> {
        self.by_assoc
            .get(&assoc_id)
            .and_then(|enb| enb.ue_by_local_id.get(&enb_ue_s1ap_id).copied())
    }

    /// Anchor a UE; returns the outbound stream assigned to it
    pub fn attach_ue(
        &self,
        assoc_id: AssocId,
        ue_id: UeId,
        enb_ue_s1ap_id: Option<EnbUeS1apId>,
    ) -> Result<u16, AssociationError> {
        let mut enb = self
            .by_assoc
            .get_mut(&assoc_id)
            .ok_or(AssociationError::UnknownAssociation(assoc_id))?;
        if let Some(local_id) = enb_ue_s1ap_id {
            if enb.ue_by_local_id.contains_key(&local_id) {
                return Err(AssociationError::DuplicateLocalId {
                    assoc_id,
                    enb_ue_s1ap_id: local_id,
                });
            }
            enb.ue_by_local_id.insert(local_id, ue_id);
        }
        enb.ue_set.insert(ue_id);
        Ok(enb.take_ostream_id())
    }

    /// Bind the eNB-local ID of an already anchored UE
    pub fn bind_local_id(
        &self,
        assoc_id: AssocId,
        ue_id: UeId,
        enb_ue_s1ap_id: EnbUeS1apId,
    ) -> Result<(), AssociationError> {
        let mut enb = self
            .by_assoc
            .get_mut(&assoc_id)
            .ok_or(AssociationError::UnknownAssociation(assoc_id))?;
        match enb.ue_by_local_id.get(&enb_ue_s1ap_id) {
            Some(existing) if *existing != ue_id => Err(AssociationError::DuplicateLocalId {
                assoc_id,
                enb_ue_s1ap_id,
            }),
            _ => {
                enb.ue_by_local_id.insert(enb_ue_s1ap_id, ue_id);
                Ok(())
            }
        }
    }

    /// Remove a UE from its association, completing a pending teardown
    /// once the UE set is empty.
    pub fn detach_ue(
        &self,
        assoc_id: AssocId,
        ue_id: UeId,
        enb_ue_s1ap_id: Option<EnbUeS1apId>,
    ) -> DetachOutcome {
        let state = {
            let Some(mut enb) = self.by_assoc.get_mut(&assoc_id) else {
                return DetachOutcome::Unknown;
            };
            enb.ue_set.remove(&ue_id);
            if let Some(local_id) = enb_ue_s1ap_id {
                if enb.ue_by_local_id.get(&local_id) == Some(&ue_id) {
                    enb.ue_by_local_id.remove(&local_id);
                }
            }
            if !enb.ue_set.is_empty() {
                return DetachOutcome::Remaining;
            }
            enb.state
        };

        match state {
            EnbState::ShuttingDown => {
                self.remove(assoc_id);
                DetachOutcome::Removed
            }
            EnbState::Resetting => {
                self.reinitialize(assoc_id);
                DetachOutcome::Reinitialized
            }
            _ => DetachOutcome::Remaining,
        }
    }

    /// Next UE-associated outbound stream of an association
    pub fn next_ostream_id(&self, assoc_id: AssocId) -> Option<u16> {
        self.by_assoc
            .get_mut(&assoc_id)
            .map(|mut enb| enb.take_ostream_id())
    }
}

// ============================================================================
// Tests
// ============================================================================
