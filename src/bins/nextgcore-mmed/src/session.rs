//! Session and Bearer Pools
//!
//! One `SessionPool` per subscriber holds the eleven EPS bearer records
//! (EBI 5..=15), the PDN connections and the outstanding bearer procedures.
//! Pools live in a fixed-capacity arena (`SessionManager`) addressed by
//! generation-checked handles, independent of the association that
//! currently carries the UE.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::context::{
    Bitrate, Ebi, Paa, PdnId, Qos, SubscriberId, Tunnel, MIN_EPS_BEARER_ID, NUM_OF_EPS_BEARER,
};
use crate::tft::{Tft, TftEdit, TftError, TftOperation};

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),
    #[error("stale session handle")]
    StaleHandle,
    #[error("unknown PDN connection {0}")]
    UnknownPdn(PdnId),
    #[error("unknown bearer EBI[{0}]")]
    UnknownBearer(Ebi),
    #[error("unknown procedure {0}")]
    UnknownProcedure(ProcedureId),
    #[error("default bearer EBI[{ebi}] of PDN {pdn_id} missing or not active")]
    NoDefaultBearer { pdn_id: PdnId, ebi: Ebi },
    #[error("no free bearer")]
    PoolExhausted,
    #[error("session arena exhausted")]
    ArenaExhausted,
    #[error("PDN connection limit ({0}) reached")]
    PdnLimitReached(usize),
    #[error("invalid QoS: {0}")]
    InvalidQos(String),
    #[error("default bearer EBI[{0}] can only be released by tearing down its PDN connection")]
    DefaultBearerRelease(Ebi),
    #[error("procedure pending on PDN connection {0}")]
    ProcedurePending(PdnId),
    #[error("session pool of {0} still holds PDN connections or procedures")]
    PoolBusy(SubscriberId),
    #[error("APN-AMBR exceeds UE-AMBR headroom (requested {requested:?}, headroom {headroom:?})")]
    AmbrExceeded { requested: Bitrate, headroom: Bitrate },
    #[error(transparent)]
    Tft(#[from] TftError),
    #[error("session pool corrupted: {0}")]
    PoolCorrupted(String),
}

impl SessionError {
    /// Pool corruption is unrecoverable
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::PoolCorrupted(_))
    }
}

// ============================================================================
// QoS validation
// ============================================================================

/// Standardized QCIs (TS 23.203 table 6.1.7)
const STANDARD_QCI: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 65, 66, 67, 69, 70, 75, 79, 80, 82, 83, 84, 85];

/// GBR QCIs
const GBR_QCI: &[u8] = &[1, 2, 3, 4, 65, 66, 67, 75, 82, 83, 84, 85];

pub fn is_gbr_qci(qci: u8) -> bool {
    GBR_QCI.contains(&qci)
}

/// Check QCI, ARP and rate consistency
pub fn validate_qos(qos: &Qos) -> Result<(), SessionError> {
    if !STANDARD_QCI.contains(&qos.qci) {
        return Err(SessionError::InvalidQos(format!("QCI {} not supported", qos.qci)));
    }
    if !(1..=15).contains(&qos.arp.priority_level) {
        return Err(SessionError::InvalidQos(format!(
            "ARP priority level {} out of range",
            qos.arp.priority_level
        )));
    }
    if is_gbr_qci(qos.qci) {
        if !qos.gbr.fits_within(&qos.mbr) {
            return Err(SessionError::InvalidQos(format!(
                "GBR {:?} above MBR {:?}",
                qos.gbr, qos.mbr
            )));
        }
    } else if !qos.gbr.is_zero() {
        return Err(SessionError::InvalidQos(format!(
            "non-GBR QCI {} with GBR {:?}",
            qos.qci, qos.gbr
        )));
    }
    Ok(())
}

// ============================================================================
// Bearer Record
// ============================================================================

/// Bearer state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BearerState(u8);

impl BearerState {
    pub const ANCHOR_CREATED: BearerState = BearerState(0x01);
    pub const CORE_CREATED: BearerState = BearerState(0x02);
    pub const ACCESS_CREATED: BearerState = BearerState(0x04);
    pub const ACTIVE: BearerState = BearerState(0x08);
    pub const ACCESS_RELEASED: BearerState = BearerState(0x10);

    pub const fn empty() -> Self {
        BearerState(0)
    }

    pub fn contains(&self, other: BearerState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: BearerState) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: BearerState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BearerState) {
        self.0 &= !other.0;
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for BearerState {
    type Output = BearerState;

    fn bitor(self, rhs: BearerState) -> BearerState {
        BearerState(self.0 | rhs.0)
    }
}

/// Who holds a bearer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotOwner {
    #[default]
    Free,
    Pdn(PdnId),
}

/// Whether the bearer's traffic steering is in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterState {
    #[default]
    Inactive,
    Active,
}

/// EPS bearer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerRecord {
    /// EPS bearer identity, fixed per slot
    pub ebi: Ebi,
    /// Slot ownership
    pub owner: SlotOwner,
    /// Linked default bearer (own EBI for a default bearer)
    pub linked_ebi: Option<Ebi>,
    /// SGW S1-U endpoint
    pub core_tunnel: Option<Tunnel>,
    /// eNB S1-U endpoint
    pub access_tunnel: Option<Tunnel>,
    /// PGW S5/S8 endpoint
    pub anchor_tunnel: Option<Tunnel>,
    /// Bearer QoS
    pub qos: Qos,
    /// State bits
    pub state: BearerState,
    /// Traffic flow template
    pub tft: Option<Tft>,
    /// Filter state
    pub filter_state: FilterState,
}

impl BearerRecord {
    fn new(ebi: Ebi) -> Self {
        Self {
            ebi,
            owner: SlotOwner::Free,
            linked_ebi: None,
            core_tunnel: None,
            access_tunnel: None,
            anchor_tunnel: None,
            qos: Qos::default(),
            state: BearerState::empty(),
            tft: None,
            filter_state: FilterState::Inactive,
        }
    }

    /// Reset every field except the EBI
    fn reset(&mut self) {
        *self = BearerRecord::new(self.ebi);
    }

    pub fn is_free(&self) -> bool {
        self.owner == SlotOwner::Free
    }

    pub fn is_active(&self) -> bool {
        self.state.contains(BearerState::ACTIVE)
    }

    pub fn is_default(&self) -> bool {
        self.linked_ebi == Some(self.ebi)
    }

    pub fn pdn_id(&self) -> Option<PdnId> {
        match self.owner {
            SlotOwner::Pdn(pdn_id) => Some(pdn_id),
            SlotOwner::Free => None,
        }
    }

    fn raise_active_if_ready(&mut self) -> bool {
        if self.is_active() {
            return false;
        }
        if self.filter_state == FilterState::Active
            && self.state.contains(BearerState::ACCESS_CREATED)
            && self.state.contains(BearerState::ANCHOR_CREATED)
        {
            self.state.insert(BearerState::ACTIVE);
            self.state.remove(BearerState::ACCESS_RELEASED);
            return true;
        }
        false
    }
}

// ============================================================================
// PDN Connection
// ============================================================================

/// PDN connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnConnection {
    /// Context identifier within the subscriber
    pub id: PdnId,
    /// APN
    pub apn: String,
    /// PDN address allocation
    pub paa: Paa,
    /// APN-AMBR committed against the UE-AMBR
    pub subscribed_ambr: Bitrate,
    /// APN-AMBR requested by the network before headroom clamping
    pub negotiated_ambr: Bitrate,
    /// Default bearer EBI
    pub default_ebi: Ebi,
    /// Bearers, default included
    pub bearers: BTreeSet<Ebi>,
}

/// What to do when an APN-AMBR does not fit the remaining UE-AMBR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbrPolicy {
    /// Additional PDN while registered: commit the remaining headroom
    ClampToHeadroom,
    /// Single PDN or mobility: refuse
    Reject,
}

/// PDN connectivity accepted by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnRequest {
    pub apn: String,
    pub paa: Paa,
    pub ambr: Bitrate,
    pub default_qos: Qos,
    /// SGW S1-U endpoint
    pub core_tunnel: Option<Tunnel>,
    /// PGW S5/S8 endpoint
    pub anchor_tunnel: Option<Tunnel>,
}

/// Created PDN connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdnCreated {
    pub pdn_id: PdnId,
    pub default_ebi: Ebi,
    pub ambr: Bitrate,
}

// ============================================================================
// Procedures
// ============================================================================

/// Procedure identifier, unique within one pool
pub type ProcedureId = u32;

/// Kind of outstanding bearer procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    /// Dedicated bearer allocation
    Allocation { ebi: Ebi },
    /// TFT edit
    FilterEdit { ebi: Ebi },
    /// QoS update
    Modification { ebi: Ebi },
}

impl ProcedureKind {
    pub fn ebi(&self) -> Ebi {
        match self {
            ProcedureKind::Allocation { ebi }
            | ProcedureKind::FilterEdit { ebi }
            | ProcedureKind::Modification { ebi } => *ebi,
        }
    }
}

/// Outstanding procedure record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureRecord {
    pub id: ProcedureId,
    pub pdn_id: PdnId,
    pub kind: ProcedureKind,
}

/// Dedicated bearer allocation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerAllocation {
    pub ebi: Ebi,
    pub procedure: ProcedureId,
}

/// Scope of `release_bearers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseScope {
    /// Dedicated bearers of one PDN connection
    Pdn(PdnId),
    /// Explicit bearers
    Bearers(Vec<Ebi>),
    /// Dedicated bearers of every PDN connection
    All,
}

/// Bearers released and skipped by `release_bearers`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<Ebi>,
    pub skipped: Vec<Ebi>,
}

// ============================================================================
// Session Pool
// ============================================================================

/// Per-subscriber bearer/PDN pool
#[derive(Debug, Clone)]
pub struct SessionPool {
    /// UE-AMBR ceiling
    ue_ambr: Bitrate,
    max_pdn: usize,
    max_filters: usize,
    bearers: [BearerRecord; NUM_OF_EPS_BEARER],
    /// Unassigned bearers, reused FIFO
    free: VecDeque<Ebi>,
    pdns: BTreeMap<PdnId, PdnConnection>,
    procedures: BTreeMap<ProcedureId, ProcedureRecord>,
    next_procedure_id: ProcedureId,
}

impl SessionPool {
    pub fn new(ue_ambr: Bitrate, max_pdn: usize, max_filters: usize) -> Self {
        let bearers: [BearerRecord; NUM_OF_EPS_BEARER] =
            std::array::from_fn(|index| BearerRecord::new(MIN_EPS_BEARER_ID + index as u8));
        Self {
            ue_ambr,
            max_pdn,
            max_filters,
            free: bearers.iter().map(|b| b.ebi).collect(),
            bearers,
            pdns: BTreeMap::new(),
            procedures: BTreeMap::new(),
            next_procedure_id: 1,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn ue_ambr(&self) -> Bitrate {
        self.ue_ambr
    }

    pub fn set_ue_ambr(&mut self, ue_ambr: Bitrate) {
        self.ue_ambr = ue_ambr;
    }

    pub fn capacity(&self) -> usize {
        NUM_OF_EPS_BEARER
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Free list in reuse order
    pub fn free_list(&self) -> impl Iterator<Item = Ebi> + '_ {
        self.free.iter().copied()
    }

    /// Bearers held by PDN connections
    pub fn assigned_count(&self) -> usize {
        self.pdns.values().map(|pdn| pdn.bearers.len()).sum()
    }

    pub fn bearer(&self, ebi: Ebi) -> Option<&BearerRecord> {
        let index = ebi.checked_sub(MIN_EPS_BEARER_ID)? as usize;
        self.bearers.get(index)
    }

    fn bearer_mut(&mut self, ebi: Ebi) -> Option<&mut BearerRecord> {
        let index = ebi.checked_sub(MIN_EPS_BEARER_ID)? as usize;
        self.bearers.get_mut(index)
    }

    fn assigned_bearer_mut(&mut self, ebi: Ebi) -> Result<&mut BearerRecord, SessionError> {
        match self.bearer_mut(ebi) {
            Some(bearer) if !bearer.is_free() => Ok(bearer),
            _ => Err(SessionError::UnknownBearer(ebi)),
        }
    }

    pub fn pdn(&self, pdn_id: PdnId) -> Option<&PdnConnection> {
        self.pdns.get(&pdn_id)
    }

    /// PDN connections in ascending ID order
    pub fn pdns(&self) -> impl Iterator<Item = &PdnConnection> {
        self.pdns.values()
    }

    pub fn pdn_count(&self) -> usize {
        self.pdns.len()
    }

    pub fn procedure(&self, id: ProcedureId) -> Option<&ProcedureRecord> {
        self.procedures.get(&id)
    }

    pub fn procedure_count(&self) -> usize {
        self.procedures.len()
    }

    pub fn has_pending_procedure(&self, pdn_id: PdnId) -> bool {
        self.procedures.values().any(|p| p.pdn_id == pdn_id)
    }

    fn has_pending_procedure_on(&self, ebi: Ebi) -> bool {
        self.procedures.values().any(|p| p.kind.ebi() == ebi)
    }

    /// Free bearers plus assigned bearers equals capacity
    pub fn is_conserved(&self) -> bool {
        self.free_count() + self.assigned_count() == self.capacity()
    }

    /// Nothing left to tear down
    pub fn is_idle(&self) -> bool {
        self.pdns.is_empty() && self.procedures.is_empty()
    }

    // ------------------------------------------------------------------------
    // Slot management
    // ------------------------------------------------------------------------

    fn pop_free_bearer(&mut self, pdn_id: PdnId) -> Result<Ebi, SessionError> {
        let ebi = self.free.pop_front().ok_or(SessionError::PoolExhausted)?;
        let bearer = self
            .bearer_mut(ebi)
            .ok_or_else(|| SessionError::PoolCorrupted(format!("EBI[{}] not in pool", ebi)))?;
        if !bearer.is_free() {
            return Err(SessionError::PoolCorrupted(format!(
                "EBI[{}] on free list but owned by {:?}",
                ebi, bearer.owner
            )));
        }
        bearer.owner = SlotOwner::Pdn(pdn_id);
        Ok(ebi)
    }

    /// Reset a bearer and return it to the free list tail
    fn release_slot(&mut self, ebi: Ebi) -> Result<(), SessionError> {
        let pdn_id = {
            let bearer = self
                .bearer_mut(ebi)
                .ok_or_else(|| SessionError::PoolCorrupted(format!("EBI[{}] not in pool", ebi)))?;
            let pdn_id = bearer.pdn_id().ok_or_else(|| {
                SessionError::PoolCorrupted(format!("EBI[{}] released twice", ebi))
            })?;
            bearer.reset();
            pdn_id
        };
        if let Some(pdn) = self.pdns.get_mut(&pdn_id) {
            pdn.bearers.remove(&ebi);
        }
        self.procedures.retain(|_, p| p.kind.ebi() != ebi);
        self.free.push_back(ebi);
        log::debug!("EBI[{}] released to free list", ebi);
        Ok(())
    }

    fn open_procedure(&mut self, pdn_id: PdnId, kind: ProcedureKind) -> ProcedureId {
        let id = self.next_procedure_id;
        self.next_procedure_id = self.next_procedure_id.wrapping_add(1).max(1);
        self.procedures.insert(id, ProcedureRecord { id, pdn_id, kind });
        id
    }

    fn complete_allocation_of(&mut self, ebi: Ebi) {
        self.procedures
            .retain(|_, p| p.kind != ProcedureKind::Allocation { ebi });
    }

    // ------------------------------------------------------------------------
    // AMBR
    // ------------------------------------------------------------------------

    /// Sum of committed APN-AMBR in ascending PDN order
    pub fn aggregate_bitrate(&self, excluding: Option<PdnId>) -> Bitrate {
        self.pdns
            .values()
            .filter(|pdn| Some(pdn.id) != excluding)
            .fold(Bitrate::ZERO, |sum, pdn| sum.saturating_add(pdn.subscribed_ambr))
    }

    fn admit_ambr(
        &self,
        requested: Bitrate,
        excluding: Option<PdnId>,
        policy: AmbrPolicy,
    ) -> Result<Bitrate, SessionError> {
        let headroom = self.ue_ambr.saturating_sub(self.aggregate_bitrate(excluding));
        if requested.fits_within(&headroom) {
            return Ok(requested);
        }
        match policy {
            AmbrPolicy::ClampToHeadroom if !headroom.is_zero() => {
                let clamped = requested.min(headroom);
                log::info!(
                    "APN-AMBR clamped from {:?} to {:?} (UE-AMBR {:?})",
                    requested,
                    clamped,
                    self.ue_ambr
                );
                Ok(clamped)
            }
            _ => Err(SessionError::AmbrExceeded { requested, headroom }),
        }
    }

    // ------------------------------------------------------------------------
    // PDN connections
    // ------------------------------------------------------------------------

    fn lowest_free_pdn_id(&self) -> Option<PdnId> {
        (1..=PdnId::MAX).find(|id| !self.pdns.contains_key(id))
    }

    /// Create a PDN connection and its default bearer
    pub fn create_pdn_connection(
        &mut self,
        request: PdnRequest,
        policy: AmbrPolicy,
    ) -> Result<PdnCreated, SessionError> {
        if self.pdns.len() >= self.max_pdn {
            return Err(SessionError::PdnLimitReached(self.max_pdn));
        }
        if self.free.is_empty() {
            return Err(SessionError::PoolExhausted);
        }
        validate_qos(&request.default_qos)?;
        let ambr = self.admit_ambr(request.ambr, None, policy)?;
        let pdn_id = self
            .lowest_free_pdn_id()
            .ok_or(SessionError::PdnLimitReached(self.max_pdn))?;

        let ebi = self.pop_free_bearer(pdn_id)?;
        if let Some(bearer) = self.bearer_mut(ebi) {
            bearer.linked_ebi = Some(ebi);
            bearer.qos = request.default_qos;
            bearer.core_tunnel = request.core_tunnel;
            bearer.anchor_tunnel = request.anchor_tunnel;
            bearer.state = BearerState::CORE_CREATED;
            if request.anchor_tunnel.is_some() {
                bearer.state.insert(BearerState::ANCHOR_CREATED);
            }
            bearer.filter_state = FilterState::Active;
        }

        self.pdns.insert(
            pdn_id,
            PdnConnection {
                id: pdn_id,
                apn: request.apn,
                paa: request.paa,
                subscribed_ambr: ambr,
                negotiated_ambr: request.ambr,
                default_ebi: ebi,
                bearers: BTreeSet::from([ebi]),
            },
        );
        log::info!("PDN[{}] created, default EBI[{}]", pdn_id, ebi);
        Ok(PdnCreated {
            pdn_id,
            default_ebi: ebi,
            ambr,
        })
    }

    /// Change the APN-AMBR of a PDN connection
    pub fn modify_pdn_ambr(
        &mut self,
        pdn_id: PdnId,
        ambr: Bitrate,
        policy: AmbrPolicy,
    ) -> Result<Bitrate, SessionError> {
        if !self.pdns.contains_key(&pdn_id) {
            return Err(SessionError::UnknownPdn(pdn_id));
        }
        let committed = self.admit_ambr(ambr, Some(pdn_id), policy)?;
        if let Some(pdn) = self.pdns.get_mut(&pdn_id) {
            pdn.subscribed_ambr = committed;
            pdn.negotiated_ambr = ambr;
        }
        Ok(committed)
    }

    /// Release every bearer of a PDN connection, dedicated ascending and
    /// default last, then remove the connection.
    pub fn tear_down_pdn_connection(&mut self, pdn_id: PdnId) -> Result<Vec<Ebi>, SessionError> {
        let pdn = self.pdns.get(&pdn_id).ok_or(SessionError::UnknownPdn(pdn_id))?;
        if self.has_pending_procedure(pdn_id) {
            return Err(SessionError::ProcedurePending(pdn_id));
        }

        let default_ebi = pdn.default_ebi;
        let mut order: Vec<Ebi> = pdn
            .bearers
            .iter()
            .copied()
            .filter(|ebi| *ebi != default_ebi)
            .collect();
        order.push(default_ebi);

        for ebi in &order {
            self.release_slot(*ebi)?;
        }
        self.pdns.remove(&pdn_id);
        log::info!("PDN[{}] removed, released {:?}", pdn_id, order);
        Ok(order)
    }

    // ------------------------------------------------------------------------
    // Bearers
    // ------------------------------------------------------------------------

    /// Allocate a dedicated bearer on an active default bearer
    pub fn allocate_dedicated_bearer(
        &mut self,
        pdn_id: PdnId,
        default_ebi: Ebi,
        qos: Qos,
        tft: TftEdit,
    ) -> Result<BearerAllocation, SessionError> {
        let pdn = self.pdns.get(&pdn_id).ok_or(SessionError::UnknownPdn(pdn_id))?;
        let default_active = pdn.default_ebi == default_ebi
            && self.bearer(default_ebi).map_or(false, |b| b.is_active());
        if !default_active {
            return Err(SessionError::NoDefaultBearer {
                pdn_id,
                ebi: default_ebi,
            });
        }
        if self.free.is_empty() {
            return Err(SessionError::PoolExhausted);
        }
        validate_qos(&qos)?;
        let filters = match tft {
            TftEdit::Create(filters) => filters,
            other => return Err(TftError::InvalidOperation(other.operation()).into()),
        };
        let tft = Tft::create(filters, self.max_filters)?;

        let ebi = self.pop_free_bearer(pdn_id)?;
        let core_tunnel = self.bearer(default_ebi).and_then(|b| b.core_tunnel);
        if let Some(bearer) = self.bearer_mut(ebi) {
            bearer.linked_ebi = Some(default_ebi);
            bearer.qos = qos;
            bearer.core_tunnel = core_tunnel;
            bearer.state = BearerState::ANCHOR_CREATED | BearerState::CORE_CREATED;
            bearer.tft = Some(tft);
            bearer.filter_state = FilterState::Active;
        }
        if let Some(pdn) = self.pdns.get_mut(&pdn_id) {
            pdn.bearers.insert(ebi);
        }
        let procedure = self.open_procedure(pdn_id, ProcedureKind::Allocation { ebi });
        log::info!(
            "PDN[{}] dedicated EBI[{}] allocated (linked EBI[{}], QCI {})",
            pdn_id,
            ebi,
            default_ebi,
            qos.qci
        );
        Ok(BearerAllocation { ebi, procedure })
    }

    /// Add, replace or delete packet filters of a bearer
    pub fn apply_traffic_filter_edit(
        &mut self,
        ebi: Ebi,
        edit: TftEdit,
    ) -> Result<ProcedureId, SessionError> {
        let max_filters = self.max_filters;
        let operation = edit.operation();
        let (pdn_id, tft) = {
            let bearer = self.assigned_bearer_mut(ebi)?;
            let pdn_id = bearer
                .pdn_id()
                .ok_or_else(|| SessionError::PoolCorrupted(format!("EBI[{}] unowned", ebi)))?;
            let tft = Tft::apply(bearer.tft.as_ref(), edit, bearer.is_default(), max_filters)?;
            (pdn_id, tft)
        };

        if let Some(bearer) = self.bearer_mut(ebi) {
            bearer.tft = tft;
        }
        log::debug!("EBI[{}] TFT {} applied", ebi, operation);
        if operation == TftOperation::NoTftOperation {
            return Ok(self.open_procedure(pdn_id, ProcedureKind::Modification { ebi }));
        }
        Ok(self.open_procedure(pdn_id, ProcedureKind::FilterEdit { ebi }))
    }

    /// Change a bearer's QoS
    pub fn update_bearer_qos(&mut self, ebi: Ebi, qos: Qos) -> Result<ProcedureId, SessionError> {
        validate_qos(&qos)?;
        let bearer = self.assigned_bearer_mut(ebi)?;
        let pdn_id = bearer
            .pdn_id()
            .ok_or_else(|| SessionError::PoolCorrupted(format!("EBI[{}] unowned", ebi)))?;
        bearer.qos = qos;
        Ok(self.open_procedure(pdn_id, ProcedureKind::Modification { ebi }))
    }

    /// eNB side endpoint known. Returns true when the bearer became active.
    pub fn mark_access_plane_updated(&mut self, ebi: Ebi, tunnel: Tunnel) -> Result<bool, SessionError> {
        let bearer = self.assigned_bearer_mut(ebi)?;
        bearer.access_tunnel = Some(tunnel);
        bearer.state.insert(BearerState::ACCESS_CREATED);
        bearer.state.remove(BearerState::ACCESS_RELEASED);
        let activated = bearer.raise_active_if_ready();
        if activated {
            self.complete_allocation_of(ebi);
            log::debug!("EBI[{}] active", ebi);
        }
        Ok(activated)
    }

    /// Anchor side endpoint known. Returns true when the bearer became active.
    pub fn mark_anchor_plane_updated(&mut self, ebi: Ebi, tunnel: Tunnel) -> Result<bool, SessionError> {
        let bearer = self.assigned_bearer_mut(ebi)?;
        bearer.anchor_tunnel = Some(tunnel);
        bearer.state.insert(BearerState::ANCHOR_CREATED);
        let activated = bearer.raise_active_if_ready();
        if activated {
            self.complete_allocation_of(ebi);
            log::debug!("EBI[{}] active", ebi);
        }
        Ok(activated)
    }

    /// eNB side gone (S1 release while the session stays)
    pub fn mark_access_plane_released(&mut self, ebi: Ebi) -> Result<(), SessionError> {
        let bearer = self.assigned_bearer_mut(ebi)?;
        bearer.access_tunnel = None;
        bearer.state.remove(BearerState::ACCESS_CREATED | BearerState::ACTIVE);
        bearer.state.insert(BearerState::ACCESS_RELEASED);
        Ok(())
    }

    /// Access side released for every assigned bearer
    pub fn mark_all_access_planes_released(&mut self) {
        for bearer in self.bearers.iter_mut().filter(|b| !b.is_free()) {
            bearer.access_tunnel = None;
            bearer.state.remove(BearerState::ACCESS_CREATED | BearerState::ACTIVE);
            bearer.state.insert(BearerState::ACCESS_RELEASED);
        }
    }

    /// Release dedicated bearers. Only bearers in `Active` or
    /// `AccessCreated` without a pending procedure are released; the rest
    /// are reported as skipped.
    pub fn release_bearers(&mut self, scope: ReleaseScope) -> Result<ReleaseReport, SessionError> {
        let candidates: Vec<Ebi> = match scope {
            ReleaseScope::Pdn(pdn_id) => {
                let pdn = self.pdns.get(&pdn_id).ok_or(SessionError::UnknownPdn(pdn_id))?;
                pdn.bearers
                    .iter()
                    .copied()
                    .filter(|ebi| *ebi != pdn.default_ebi)
                    .collect()
            }
            ReleaseScope::Bearers(list) => {
                for ebi in &list {
                    let bearer = match self.bearer(*ebi) {
                        Some(bearer) if !bearer.is_free() => bearer,
                        _ => return Err(SessionError::UnknownBearer(*ebi)),
                    };
                    if bearer.is_default() {
                        return Err(SessionError::DefaultBearerRelease(*ebi));
                    }
                }
                let mut list = list;
                list.sort_unstable();
                list.dedup();
                list
            }
            ReleaseScope::All => self
                .pdns
                .values()
                .flat_map(|pdn| {
                    let default_ebi = pdn.default_ebi;
                    pdn.bearers.iter().copied().filter(move |ebi| *ebi != default_ebi)
                })
                .collect(),
        };

        let releasable = BearerState::ACTIVE | BearerState::ACCESS_CREATED;
        let mut report = ReleaseReport::default();
        for ebi in candidates {
            let eligible = self.bearer(ebi).map_or(false, |b| b.state.intersects(releasable))
                && !self.has_pending_procedure_on(ebi);
            if eligible {
                self.release_slot(ebi)?;
                report.released.push(ebi);
            } else {
                report.skipped.push(ebi);
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------------

    /// Procedure confirmed by the network
    pub fn complete_procedure(&mut self, id: ProcedureId) -> Result<ProcedureRecord, SessionError> {
        self.procedures
            .remove(&id)
            .ok_or(SessionError::UnknownProcedure(id))
    }

    /// Procedure rejected; an aborted allocation gives its bearer back
    pub fn abort_procedure(&mut self, id: ProcedureId) -> Result<ProcedureRecord, SessionError> {
        let record = self
            .procedures
            .remove(&id)
            .ok_or(SessionError::UnknownProcedure(id))?;
        if let ProcedureKind::Allocation { ebi } = record.kind {
            self.release_slot(ebi)?;
        }
        Ok(record)
    }
}

// ============================================================================
// Session Manager (arena)
// ============================================================================

/// Generation-checked handle to an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot {
    Free {
        generation: u32,
    },
    Assigned {
        generation: u32,
        subscriber: SubscriberId,
        pool: Box<SessionPool>,
    },
}

/// Fixed-capacity arena of session pools
#[derive(Debug)]
pub struct SessionManager {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    by_subscriber: HashMap<SubscriberId, SessionHandle>,
    max_pdn: usize,
    max_filters: usize,
}

impl SessionManager {
    pub fn new(capacity: usize, max_pdn: usize, max_filters: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: (0..capacity).map(|_| Slot::Free { generation: 0 }).collect(),
            free: (0..capacity as u32).collect(),
            by_subscriber: HashMap::new(),
            max_pdn,
            max_filters,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_subscriber.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subscriber.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn find(&self, subscriber: &str) -> Option<SessionHandle> {
        self.by_subscriber.get(subscriber).copied()
    }

    /// Pool for `subscriber`, allocated on first use. An existing pool is
    /// kept and only its UE-AMBR updated.
    pub fn allocate(&mut self, subscriber: &str, ue_ambr: Bitrate) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.find(subscriber) {
            if let Some(pool) = self.get_mut(handle) {
                pool.set_ue_ambr(ue_ambr);
            }
            return Ok(handle);
        }

        let index = self.free.pop_front().ok_or(SessionError::ArenaExhausted)?;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| SessionError::PoolCorrupted(format!("arena slot {} missing", index)))?;
        let generation = match slot {
            Slot::Free { generation } => generation.wrapping_add(1),
            Slot::Assigned { subscriber, .. } => {
                return Err(SessionError::PoolCorrupted(format!(
                    "arena slot {} on free list but held by {}",
                    index, subscriber
                )))
            }
        };
        *slot = Slot::Assigned {
            generation,
            subscriber: subscriber.to_string(),
            pool: Box::new(SessionPool::new(ue_ambr, self.max_pdn, self.max_filters)),
        };

        let handle = SessionHandle { index, generation };
        self.by_subscriber.insert(subscriber.to_string(), handle);
        log::debug!("[{}] session pool allocated ({})", subscriber, handle);
        Ok(handle)
    }

    /// Return a pool to the arena once it holds nothing
    pub fn release(&mut self, subscriber: &str) -> Result<(), SessionError> {
        let handle = self
            .find(subscriber)
            .ok_or_else(|| SessionError::UnknownSubscriber(subscriber.to_string()))?;
        match self.get(handle) {
            Some(pool) if !pool.is_idle() => {
                return Err(SessionError::PoolBusy(subscriber.to_string()))
            }
            Some(_) => {}
            None => return Err(SessionError::StaleHandle),
        }

        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            *slot = Slot::Free {
                generation: handle.generation,
            };
        }
        self.free.push_back(handle.index);
        self.by_subscriber.remove(subscriber);
        log::debug!("[{}] session pool released ({})", subscriber, handle);
        Ok(())
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&SessionPool> {
        match self.slots.get(handle.index as usize)? {
            Slot::Assigned { generation, pool, .. } if *generation == handle.generation => {
                Some(pool.as_ref())
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut SessionPool> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Assigned { generation, pool, .. } if *generation == handle.generation => {
                Some(pool.as_mut())
            }
            _ => None,
        }
    }

    pub fn pool(&self, subscriber: &str) -> Result<&SessionPool, SessionError> {
        let handle = self
            .find(subscriber)
            .ok_or_else(|| SessionError::UnknownSubscriber(subscriber.to_string()))?;
        self.get(handle).ok_or(SessionError::StaleHandle)
    }

    pub fn pool_mut(&mut self, subscriber: &str) -> Result<&mut SessionPool, SessionError> {
        let handle = self
            .find(subscriber)
            .ok_or_else(|| SessionError::UnknownSubscriber(subscriber.to_string()))?;
        self.get_mut(handle).ok_or(SessionError::StaleHandle)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tft::{FilterComponent, PacketFilter};
    use std::net::{IpAddr, Ipv4Addr};

    fn tunnel(teid: u32) -> Tunnel {
        Tunnel::new(teid, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    fn request(apn: &str, ambr: Bitrate) -> PdnRequest {
        PdnRequest {
            apn: apn.to_string(),
            paa: Paa::default(),
            ambr,
            default_qos: Qos::non_gbr(9),
            core_tunnel: Some(tunnel(100)),
            anchor_tunnel: Some(tunnel(200)),
        }
    }

    fn create_filter(identifier: u8, precedence: u8) -> TftEdit {
        TftEdit::Create(vec![PacketFilter::new(
            identifier,
            precedence,
            vec![FilterComponent::ProtocolIdentifier(17)],
        )])
    }

    fn pool_with_active_default() -> (SessionPool, PdnCreated) {
        let mut pool = SessionPool::new(Bitrate::new(1000, 1000), 4, 16);
        let pdn = pool
            .create_pdn_connection(request("internet", Bitrate::new(500, 500)), AmbrPolicy::Reject)
            .unwrap();
        assert!(pool.mark_access_plane_updated(pdn.default_ebi, tunnel(1)).unwrap());
        (pool, pdn)
    }

    fn activate(pool: &mut SessionPool, ebi: Ebi) {
        assert!(pool.mark_access_plane_updated(ebi, tunnel(ebi as u32)).unwrap());
    }

    #[test]
    fn test_new_pool() {
        let pool = SessionPool::new(Bitrate::ZERO, 4, 16);
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER);
        assert_eq!(pool.free_list().next(), Some(5));
        assert!(pool.is_conserved());
        assert_eq!(pool.bearer(15).unwrap().ebi, 15);
        assert!(pool.bearer(4).is_none());
        assert!(pool.bearer(16).is_none());
    }

    #[test]
    fn test_create_pdn_connection() {
        let (pool, pdn) = pool_with_active_default();
        assert_eq!(pdn.pdn_id, 1);
        assert_eq!(pdn.default_ebi, 5);
        let bearer = pool.bearer(5).unwrap();
        assert!(bearer.is_default());
        assert!(bearer.is_active());
        assert!(bearer.state.contains(BearerState::CORE_CREATED));
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER - 1);
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_pdn_limit() {
        let mut pool = SessionPool::new(Bitrate::new(1000, 1000), 1, 16);
        pool.create_pdn_connection(request("a", Bitrate::new(1, 1)), AmbrPolicy::Reject)
            .unwrap();
        let err = pool
            .create_pdn_connection(request("b", Bitrate::new(1, 1)), AmbrPolicy::Reject)
            .unwrap_err();
        assert_eq!(err, SessionError::PdnLimitReached(1));
    }

    #[test]
    fn test_ambr_policy() {
        let (mut pool, _) = pool_with_active_default();

        let err = pool
            .create_pdn_connection(request("ims", Bitrate::new(600, 100)), AmbrPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, SessionError::AmbrExceeded { .. }));

        let created = pool
            .create_pdn_connection(request("ims", Bitrate::new(600, 100)), AmbrPolicy::ClampToHeadroom)
            .unwrap();
        assert_eq!(created.ambr, Bitrate::new(500, 100));
        assert_eq!(pool.pdn(created.pdn_id).unwrap().negotiated_ambr, Bitrate::new(600, 100));
        assert!(pool.aggregate_bitrate(None).fits_within(&pool.ue_ambr()));
        assert_eq!(pool.aggregate_bitrate(Some(created.pdn_id)), Bitrate::new(500, 500));
    }

    #[test]
    fn test_modify_pdn_ambr_excludes_itself() {
        let (mut pool, pdn) = pool_with_active_default();
        assert_eq!(
            pool.modify_pdn_ambr(pdn.pdn_id, Bitrate::new(1000, 1000), AmbrPolicy::Reject),
            Ok(Bitrate::new(1000, 1000))
        );
        assert!(matches!(
            pool.modify_pdn_ambr(pdn.pdn_id, Bitrate::new(1001, 1), AmbrPolicy::Reject),
            Err(SessionError::AmbrExceeded { .. })
        ));
        assert_eq!(pool.modify_pdn_ambr(9, Bitrate::ZERO, AmbrPolicy::Reject), Err(SessionError::UnknownPdn(9)));
    }

    #[test]
    fn test_allocate_dedicated_bearer() {
        let (mut pool, pdn) = pool_with_active_default();
        let allocation = pool
            .allocate_dedicated_bearer(pdn.pdn_id, pdn.default_ebi, Qos::non_gbr(8), create_filter(1, 10))
            .unwrap();
        assert_eq!(allocation.ebi, 6);

        let bearer = pool.bearer(6).unwrap();
        assert_eq!(bearer.linked_ebi, Some(5));
        assert!(bearer.state.contains(BearerState::ANCHOR_CREATED | BearerState::CORE_CREATED));
        assert!(!bearer.is_active());
        assert!(pool.has_pending_procedure(pdn.pdn_id));

        // Active completes the allocation procedure
        activate(&mut pool, 6);
        assert!(pool.procedure(allocation.procedure).is_none());
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_allocate_requires_create_new_tft() {
        let (mut pool, pdn) = pool_with_active_default();
        let err = pool
            .allocate_dedicated_bearer(pdn.pdn_id, pdn.default_ebi, Qos::non_gbr(8), TftEdit::Delete(vec![1]))
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::Tft(TftError::InvalidOperation(TftOperation::DeletePacketFiltersFromExistingTft))
        );
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER - 1);
    }

    #[test]
    fn test_allocate_validates_qos() {
        let (mut pool, pdn) = pool_with_active_default();
        let bad_gbr = Qos::gbr(1, Bitrate::new(10, 10), Bitrate::new(5, 5));
        assert!(matches!(
            pool.allocate_dedicated_bearer(pdn.pdn_id, 5, bad_gbr, create_filter(1, 1)),
            Err(SessionError::InvalidQos(_))
        ));
        assert!(matches!(
            pool.allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(42), create_filter(1, 1)),
            Err(SessionError::InvalidQos(_))
        ));
        let mut arp = Qos::non_gbr(8);
        arp.arp.priority_level = 0;
        assert!(matches!(
            pool.allocate_dedicated_bearer(pdn.pdn_id, 5, arp, create_filter(1, 1)),
            Err(SessionError::InvalidQos(_))
        ));
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER - 1);
    }

    #[test]
    fn test_pool_exhausted() {
        let (mut pool, pdn) = pool_with_active_default();
        for i in 0..(NUM_OF_EPS_BEARER - 1) as u8 {
            pool.allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, i))
                .unwrap();
        }
        assert_eq!(pool.free_count(), 0);
        assert_eq!(
            pool.allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, 99)),
            Err(SessionError::PoolExhausted)
        );
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_traffic_filter_edit_opens_procedure() {
        let (mut pool, pdn) = pool_with_active_default();
        let allocation = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, 10))
            .unwrap();
        activate(&mut pool, allocation.ebi);

        let add = TftEdit::Add(vec![PacketFilter::new(
            2,
            20,
            vec![FilterComponent::SingleRemotePort(80)],
        )]);
        let procedure = pool.apply_traffic_filter_edit(allocation.ebi, add).unwrap();
        assert_eq!(
            pool.procedure(procedure).unwrap().kind,
            ProcedureKind::FilterEdit { ebi: allocation.ebi }
        );
        assert_eq!(pool.bearer(allocation.ebi).unwrap().tft.as_ref().unwrap().len(), 2);

        // Collision leaves the template unchanged
        let clash = TftEdit::Add(vec![PacketFilter::new(
            3,
            20,
            vec![FilterComponent::SingleRemotePort(443)],
        )]);
        assert_eq!(
            pool.apply_traffic_filter_edit(allocation.ebi, clash),
            Err(SessionError::Tft(TftError::PrecedenceCollision(20)))
        );
        assert_eq!(pool.bearer(allocation.ebi).unwrap().tft.as_ref().unwrap().len(), 2);
        assert_eq!(pool.procedure_count(), 1);
    }

    #[test]
    fn test_release_bearers_skips_inactive() {
        let (mut pool, pdn) = pool_with_active_default();
        let a = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, 10))
            .unwrap();
        let b = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(7), create_filter(1, 11))
            .unwrap();
        activate(&mut pool, a.ebi);

        let report = pool.release_bearers(ReleaseScope::Pdn(pdn.pdn_id)).unwrap();
        assert_eq!(report.released, vec![a.ebi]);
        assert_eq!(report.skipped, vec![b.ebi]);
        assert!(pool.bearer(a.ebi).unwrap().is_free());
        assert_eq!(pool.free_list().last(), Some(a.ebi));
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_release_bearers_refuses_default() {
        let (mut pool, pdn) = pool_with_active_default();
        assert_eq!(
            pool.release_bearers(ReleaseScope::Bearers(vec![pdn.default_ebi])),
            Err(SessionError::DefaultBearerRelease(pdn.default_ebi))
        );
        assert_eq!(
            pool.release_bearers(ReleaseScope::Bearers(vec![12])),
            Err(SessionError::UnknownBearer(12))
        );
        assert!(pool.bearer(pdn.default_ebi).unwrap().is_active());
    }

    #[test]
    fn test_default_bearer_release_cascades_to_dedicated() {
        let (mut pool, pdn) = pool_with_active_default();
        let a = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, 10))
            .unwrap();
        let b = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(7), create_filter(1, 11))
            .unwrap();
        activate(&mut pool, a.ebi);
        activate(&mut pool, b.ebi);
        assert_eq!(pool.procedure_count(), 0);

        assert_eq!(
            pool.tear_down_pdn_connection(pdn.pdn_id),
            Ok(vec![a.ebi, b.ebi, pdn.default_ebi])
        );
        for ebi in [a.ebi, b.ebi, pdn.default_ebi] {
            assert!(pool.bearer(ebi).unwrap().is_free());
        }
        assert_eq!(pool.pdn_count(), 0);
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER);
        assert!(pool.is_conserved());
    }

    #[test]
    fn test_tear_down_refused_while_procedure_pending() {
        let (mut pool, pdn) = pool_with_active_default();
        let allocation = pool
            .allocate_dedicated_bearer(pdn.pdn_id, 5, Qos::non_gbr(8), create_filter(1, 10))
            .unwrap();
        assert_eq!(
            pool.tear_down_pdn_connection(pdn.pdn_id),
            Err(SessionError::ProcedurePending(pdn.pdn_id))
        );

        // Aborting the allocation returns the bearer
        pool.abort_procedure(allocation.procedure).unwrap();
        assert!(pool.bearer(allocation.ebi).unwrap().is_free());
        assert_eq!(pool.tear_down_pdn_connection(pdn.pdn_id), Ok(vec![5]));
        assert_eq!(pool.pdn_count(), 0);
        assert_eq!(pool.free_count(), NUM_OF_EPS_BEARER);
    }

    #[test]
    fn test_access_plane_released() {
        let (mut pool, pdn) = pool_with_active_default();
        pool.mark_access_plane_released(pdn.default_ebi).unwrap();
        let bearer = pool.bearer(pdn.default_ebi).unwrap();
        assert!(!bearer.is_active());
        assert!(bearer.state.contains(BearerState::ACCESS_RELEASED));

        // Re-establishing the access side reactivates
        activate(&mut pool, pdn.default_ebi);
        assert!(!pool.bearer(pdn.default_ebi).unwrap().state.contains(BearerState::ACCESS_RELEASED));
    }

    #[test]
    fn test_update_bearer_qos() {
        let (mut pool, pdn) = pool_with_active_default();
        let procedure = pool.update_bearer_qos(pdn.default_ebi, Qos::non_gbr(6)).unwrap();
        assert_eq!(pool.bearer(5).unwrap().qos.qci, 6);
        assert_eq!(pool.complete_procedure(procedure).unwrap().kind, ProcedureKind::Modification { ebi: 5 });
        assert_eq!(pool.complete_procedure(procedure), Err(SessionError::UnknownProcedure(procedure)));
        assert_eq!(pool.update_bearer_qos(9, Qos::non_gbr(6)), Err(SessionError::UnknownBearer(9)));
    }

    #[test]
    fn test_manager_allocate_release() {
        let mut manager = SessionManager::new(2, 4, 16);
        let a = manager.allocate("001010000000001", Bitrate::new(10, 10)).unwrap();
        let b = manager.allocate("001010000000002", Bitrate::new(10, 10)).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.allocate("001010000000001", Bitrate::new(20, 20)).unwrap(), a);
        assert_eq!(manager.get(a).unwrap().ue_ambr(), Bitrate::new(20, 20));
        assert_eq!(
            manager.allocate("001010000000003", Bitrate::ZERO),
            Err(SessionError::ArenaExhausted)
        );

        manager.release("001010000000001").unwrap();
        assert!(manager.get(a).is_none());
        assert_eq!(manager.free_count(), 1);

        // Slot reuse bumps the generation; the old handle stays stale
        let c = manager.allocate("001010000000003", Bitrate::ZERO).unwrap();
        assert!(manager.get(a).is_none());
        assert!(manager.get(c).is_some());
    }

    #[test]
    fn test_manager_release_refused_while_busy() {
        let mut manager = SessionManager::new(1, 4, 16);
        manager.allocate("001010000000001", Bitrate::new(10, 10)).unwrap();
        manager
            .pool_mut("001010000000001")
            .unwrap()
            .create_pdn_connection(request("internet", Bitrate::new(1, 1)), AmbrPolicy::Reject)
            .unwrap();
        assert_eq!(
            manager.release("001010000000001"),
            Err(SessionError::PoolBusy("001010000000001".to_string()))
        );
        assert_eq!(
            manager.release("001019999999999"),
            Err(SessionError::UnknownSubscriber("001019999999999".to_string()))
        );
    }
}
