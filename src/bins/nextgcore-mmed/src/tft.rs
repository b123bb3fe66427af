//! Traffic Flow Template
//!
//! TFT model (TS 24.008 10.5.6.12) and the edit operations applied to a
//! bearer's template. Every edit is computed on a copy and returned whole,
//! so a rejected edit leaves the bearer untouched.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Highest packet filter identifier (4 bits)
pub const MAX_PACKET_FILTER_IDENTIFIER: u8 = 15;

/// TFT errors. All but `InvalidOperation` and `Syntax` are semantic errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TftError {
    #[error("TFT operation {0} not allowed here")]
    InvalidOperation(TftOperation),
    #[error("syntactical error in packet filter list: {0}")]
    Syntax(String),
    #[error("packet filter precedence {0} already in use")]
    PrecedenceCollision(u8),
    #[error("packet filter identifier {0} already in use")]
    IdentifierCollision(u8),
    #[error("too many packet filters ({count} > {max})")]
    TooManyFilters { count: usize, max: usize },
    #[error("unknown packet filter identifier {0}")]
    UnknownFilter(u8),
    #[error("dedicated bearer would be left without packet filters")]
    EmptyTemplate,
    #[error("bearer has no TFT")]
    NoTemplate,
}

impl TftError {
    pub fn is_semantic(&self) -> bool {
        !matches!(self, TftError::InvalidOperation(_) | TftError::Syntax(_))
    }
}

/// TFT operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TftOperation {
    CreateNewTft = 1,
    DeleteExistingTft = 2,
    AddPacketFiltersToExistingTft = 3,
    ReplacePacketFiltersInExistingTft = 4,
    DeletePacketFiltersFromExistingTft = 5,
    NoTftOperation = 6,
}

impl fmt::Display for TftOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TftOperation::CreateNewTft => "create-new-tft",
            TftOperation::DeleteExistingTft => "delete-existing-tft",
            TftOperation::AddPacketFiltersToExistingTft => "add-packet-filters",
            TftOperation::ReplacePacketFiltersInExistingTft => "replace-packet-filters",
            TftOperation::DeletePacketFiltersFromExistingTft => "delete-packet-filters",
            TftOperation::NoTftOperation => "no-tft-operation",
        };
        f.write_str(name)
    }
}

/// Packet filter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowDirection {
    DownlinkOnly = 1,
    UplinkOnly = 2,
    #[default]
    Bidirectional = 3,
}

/// Packet filter component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterComponent {
    ProtocolIdentifier(u8),
    Ipv4RemoteAddress { addr: [u8; 4], mask: [u8; 4] },
    Ipv4LocalAddress { addr: [u8; 4], mask: [u8; 4] },
    Ipv6RemoteAddress { addr: [u8; 16], prefix_len: u8 },
    SingleLocalPort(u16),
    LocalPortRange { low: u16, high: u16 },
    SingleRemotePort(u16),
    RemotePortRange { low: u16, high: u16 },
    SecurityParameterIndex(u32),
    TypeOfService { value: u8, mask: u8 },
    FlowLabel(u32),
}

impl FilterComponent {
    fn check(&self) -> Result<(), TftError> {
        match self {
            FilterComponent::LocalPortRange { low, high }
            | FilterComponent::RemotePortRange { low, high }
                if low > high =>
            {
                Err(TftError::Syntax(format!("port range {}-{} inverted", low, high)))
            }
            FilterComponent::Ipv6RemoteAddress { prefix_len, .. } if *prefix_len > 128 => Err(
                TftError::Syntax(format!("IPv6 prefix length {} out of range", prefix_len)),
            ),
            FilterComponent::FlowLabel(label) if *label > 0x000f_ffff => {
                Err(TftError::Syntax(format!("flow label {:#x} out of range", label)))
            }
            _ => Ok(()),
        }
    }
}

/// Packet filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFilter {
    /// Packet filter identifier (0-15)
    pub identifier: u8,
    /// Evaluation precedence
    pub precedence: u8,
    /// Direction
    pub direction: FlowDirection,
    /// Components (at least one)
    pub components: Vec<FilterComponent>,
}

impl PacketFilter {
    pub fn new(identifier: u8, precedence: u8, components: Vec<FilterComponent>) -> Self {
        Self {
            identifier,
            precedence,
            direction: FlowDirection::Bidirectional,
            components,
        }
    }

    fn check(&self) -> Result<(), TftError> {
        if self.identifier > MAX_PACKET_FILTER_IDENTIFIER {
            return Err(TftError::Syntax(format!(
                "packet filter identifier {} out of range",
                self.identifier
            )));
        }
        if self.components.is_empty() {
            return Err(TftError::Syntax(format!(
                "packet filter {} has no components",
                self.identifier
            )));
        }
        self.components.iter().try_for_each(FilterComponent::check)
    }
}

/// Requested change to a bearer's TFT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftEdit {
    Create(Vec<PacketFilter>),
    DeleteExisting,
    Add(Vec<PacketFilter>),
    Replace(Vec<PacketFilter>),
    Delete(Vec<u8>),
    NoOperation,
}

impl TftEdit {
    pub fn operation(&self) -> TftOperation {
        match self {
            TftEdit::Create(_) => TftOperation::CreateNewTft,
            TftEdit::DeleteExisting => TftOperation::DeleteExistingTft,
            TftEdit::Add(_) => TftOperation::AddPacketFiltersToExistingTft,
            TftEdit::Replace(_) => TftOperation::ReplacePacketFiltersInExistingTft,
            TftEdit::Delete(_) => TftOperation::DeletePacketFiltersFromExistingTft,
            TftEdit::NoOperation => TftOperation::NoTftOperation,
        }
    }
}

/// Traffic flow template; filters kept ordered by precedence
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tft {
    filters: Vec<PacketFilter>,
}

impl Tft {
    /// New template from a "create new TFT" filter list
    pub fn create(filters: Vec<PacketFilter>, max_filters: usize) -> Result<Self, TftError> {
        if filters.is_empty() {
            return Err(TftError::Syntax("create new TFT without packet filters".into()));
        }
        let mut tft = Tft::default();
        tft.insert_all(filters, max_filters)?;
        Ok(tft)
    }

    pub fn filters(&self) -> &[PacketFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn contains(&self, identifier: u8) -> bool {
        self.filters.iter().any(|f| f.identifier == identifier)
    }

    /// Precedences in use are pairwise distinct
    pub fn precedences_distinct(&self) -> bool {
        let unique: BTreeSet<u8> = self.filters.iter().map(|f| f.precedence).collect();
        unique.len() == self.filters.len()
    }

    /// Apply an edit. `Ok(None)` means the bearer no longer has a TFT.
    pub fn apply(
        current: Option<&Tft>,
        edit: TftEdit,
        is_default_bearer: bool,
        max_filters: usize,
    ) -> Result<Option<Tft>, TftError> {
        match edit {
            TftEdit::Create(filters) => {
                if current.is_some() {
                    log::debug!("create new TFT replaces the existing template");
                }
                Tft::create(filters, max_filters).map(Some)
            }
            TftEdit::DeleteExisting => {
                if current.is_none() {
                    return Err(TftError::NoTemplate);
                }
                if !is_default_bearer {
                    return Err(TftError::EmptyTemplate);
                }
                Ok(None)
            }
            TftEdit::Add(filters) => {
                let mut tft = current.cloned().ok_or(TftError::NoTemplate)?;
                tft.insert_all(filters, max_filters)?;
                Ok(Some(tft))
            }
            TftEdit::Replace(filters) => {
                let mut tft = current.cloned().ok_or(TftError::NoTemplate)?;
                for filter in &filters {
                    if !tft.contains(filter.identifier) {
                        return Err(TftError::UnknownFilter(filter.identifier));
                    }
                }
                tft.filters
                    .retain(|f| !filters.iter().any(|r| r.identifier == f.identifier));
                tft.insert_all(filters, max_filters)?;
                Ok(Some(tft))
            }
            TftEdit::Delete(identifiers) => {
                let mut tft = current.cloned().ok_or(TftError::NoTemplate)?;
                if identifiers.is_empty() {
                    return Err(TftError::Syntax("delete without identifiers".into()));
                }
                for identifier in &identifiers {
                    if !tft.contains(*identifier) {
                        return Err(TftError::UnknownFilter(*identifier));
                    }
                }
                tft.filters.retain(|f| !identifiers.contains(&f.identifier));
                if tft.filters.is_empty() {
                    if !is_default_bearer {
                        return Err(TftError::EmptyTemplate);
                    }
                    return Ok(None);
                }
                Ok(Some(tft))
            }
            TftEdit::NoOperation => Ok(current.cloned()),
        }
    }

    fn insert_all(&mut self, filters: Vec<PacketFilter>, max_filters: usize) -> Result<(), TftError> {
        let count = self.filters.len() + filters.len();
        if count > max_filters {
            return Err(TftError::TooManyFilters {
                count,
                max: max_filters,
            });
        }
        for filter in filters {
            filter.check()?;
            if self.contains(filter.identifier) {
                return Err(TftError::IdentifierCollision(filter.identifier));
            }
            if self.filters.iter().any(|f| f.precedence == filter.precedence) {
                return Err(TftError::PrecedenceCollision(filter.precedence));
            }
            let at = self
                .filters
                .partition_point(|f| f.precedence < filter.precedence);
            self.filters.insert(at, filter);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
