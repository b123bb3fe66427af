//! MME Context
//!
//! Identifier types, basic value types shared by every component, and
//! `MmeContext`, the explicit bundle of registries owned by the MME task.

use std::net::IpAddr;
use std::sync::Arc;

use crate::association::AssociationRegistry;
use crate::config::MmeConfig;
use crate::connection::{ConnectionRegistry, CoreIdIndex};
use crate::mobility::MobilityCoordinator;
use crate::session::SessionManager;
use crate::timer::TimerService;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of sessions (PDN connections) per UE
pub const OGS_MAX_NUM_OF_SESS: usize = 4;
/// Maximum number of served TAI
pub const OGS_MAX_NUM_OF_TAI: usize = 16;
/// Maximum number of packet filters in one TFT
pub const OGS_MAX_NUM_OF_PACKET_FILTER: usize = 16;

/// Minimum EPS bearer ID
pub const MIN_EPS_BEARER_ID: u8 = 5;
/// Maximum EPS bearer ID
pub const MAX_EPS_BEARER_ID: u8 = 15;
/// Number of EPS bearer records held by one session pool
pub const NUM_OF_EPS_BEARER: usize = (MAX_EPS_BEARER_ID - MIN_EPS_BEARER_ID + 1) as usize;

// ============================================================================
// Identifiers
// ============================================================================

/// SCTP association identifier
pub type AssocId = u64;
/// eNB UE S1AP ID (chosen by the eNB, unique within one association)
pub type EnbUeS1apId = u32;
/// MME UE S1AP ID (assigned by the MME, unique system-wide)
pub type MmeUeS1apId = u32;
/// Global eNB ID (macro/home eNB id)
pub type EnbId = u32;
/// Pool ID of a UE connection record
pub type UeId = u64;
/// EPS bearer identity
pub type Ebi = u8;
/// PDN connection identifier (context identifier within one subscriber)
pub type PdnId = u8;
/// Subscriber identity (IMSI BCD)
pub type SubscriberId = String;

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    /// MCC digit 1
    pub mcc1: u8,
    /// MCC digit 2
    pub mcc2: u8,
    /// MCC digit 3
    pub mcc3: u8,
    /// MNC digit 1
    pub mnc1: u8,
    /// MNC digit 2
    pub mnc2: u8,
    /// MNC digit 3 (0xf if 2-digit MNC)
    pub mnc3: u8,
}

impl PlmnId {
    /// Create a new PLMN ID from decimal strings
    pub fn new(mcc: &str, mnc: &str) -> Self {
        let mcc: Vec<u8> = mcc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();
        let mnc: Vec<u8> = mnc.chars().filter_map(|c| c.to_digit(10).map(|d| d as u8)).collect();

        Self {
            mcc1: mcc.first().copied().unwrap_or(0),
            mcc2: mcc.get(1).copied().unwrap_or(0),
            mcc3: mcc.get(2).copied().unwrap_or(0),
            mnc1: mnc.first().copied().unwrap_or(0),
            mnc2: mnc.get(1).copied().unwrap_or(0),
            mnc3: mnc.get(2).copied().unwrap_or(0xf),
        }
    }

    /// Convert to BCD string
    pub fn to_bcd(&self) -> String {
        if self.mnc3 == 0xf {
            format!("{}{}{}{}{}", self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2)
        } else {
            format!(
                "{}{}{}{}{}{}",
                self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2, self.mnc3
            )
        }
    }
}

/// EPS TAI (Tracking Area Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// TAC (16 bits for EPS)
    pub tac: u16,
}

impl EpsTai {
    pub fn new(plmn_id: PlmnId, tac: u16) -> Self {
        Self { plmn_id, tac }
    }
}

/// E-CGI (E-UTRAN Cell Global Identity)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ECgi {
    /// PLMN ID
    pub plmn_id: PlmnId,
    /// E-UTRAN Cell ID (28 bits)
    pub cell_id: u32,
}

/// Last location reported by the eNB for a UE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UeLocation {
    /// TAI
    pub tai: EpsTai,
    /// E-CGI
    pub e_cgi: ECgi,
}

/// Bitrate (bps)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitrate {
    /// Downlink bitrate (bps)
    pub downlink: u64,
    /// Uplink bitrate (bps)
    pub uplink: u64,
}

impl Bitrate {
    pub const ZERO: Bitrate = Bitrate { downlink: 0, uplink: 0 };

    pub fn new(downlink: u64, uplink: u64) -> Self {
        Self { downlink, uplink }
    }

    pub fn saturating_add(self, other: Bitrate) -> Bitrate {
        Bitrate {
            downlink: self.downlink.saturating_add(other.downlink),
            uplink: self.uplink.saturating_add(other.uplink),
        }
    }

    pub fn saturating_sub(self, other: Bitrate) -> Bitrate {
        Bitrate {
            downlink: self.downlink.saturating_sub(other.downlink),
            uplink: self.uplink.saturating_sub(other.uplink),
        }
    }

    /// Both directions are within `ceiling`
    pub fn fits_within(&self, ceiling: &Bitrate) -> bool {
        self.downlink <= ceiling.downlink && self.uplink <= ceiling.uplink
    }

    /// Per-direction minimum
    pub fn min(self, other: Bitrate) -> Bitrate {
        Bitrate {
            downlink: self.downlink.min(other.downlink),
            uplink: self.uplink.min(other.uplink),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.downlink == 0 && self.uplink == 0
    }
}

/// ARP (Allocation and Retention Priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arp {
    /// Priority level (1-15)
    pub priority_level: u8,
    /// Pre-emption capability
    pub pre_emption_capability: bool,
    /// Pre-emption vulnerability
    pub pre_emption_vulnerability: bool,
}

impl Default for Arp {
    fn default() -> Self {
        Self {
            priority_level: 8,
            pre_emption_capability: false,
            pre_emption_vulnerability: true,
        }
    }
}

/// Bearer level QoS parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    /// QCI (QoS Class Identifier)
    pub qci: u8,
    /// ARP
    pub arp: Arp,
    /// MBR (Maximum Bit Rate)
    pub mbr: Bitrate,
    /// GBR (Guaranteed Bit Rate)
    pub gbr: Bitrate,
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            qci: 9,
            arp: Arp::default(),
            mbr: Bitrate::ZERO,
            gbr: Bitrate::ZERO,
        }
    }
}

impl Qos {
    /// Non-GBR QoS with the given QCI
    pub fn non_gbr(qci: u8) -> Self {
        Self { qci, ..Default::default() }
    }

    /// GBR QoS with the given QCI and rates
    pub fn gbr(qci: u8, gbr: Bitrate, mbr: Bitrate) -> Self {
        Self {
            qci,
            arp: Arp::default(),
            mbr,
            gbr,
        }
    }
}

/// GTP-U tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    /// TEID
    pub teid: u32,
    /// Transport layer address
    pub addr: IpAddr,
}

impl Tunnel {
    pub fn new(teid: u32, addr: IpAddr) -> Self {
        Self { teid, addr }
    }
}

/// PDN type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdnType {
    #[default]
    Ipv4,
    Ipv6,
    Ipv4v6,
}

/// PDN address allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Paa {
    /// PDN type
    pub pdn_type: PdnType,
    /// IPv4 address
    pub addr: Option<std::net::Ipv4Addr>,
    /// IPv6 address
    pub addr6: Option<std::net::Ipv6Addr>,
}

// ============================================================================
// MME Context (Main)
// ============================================================================

/// Handles to the registries other tasks are allowed to read.
#[derive(Clone)]
pub struct SharedRegistries {
    /// eNB associations
    pub associations: Arc<AssociationRegistry>,
    /// MME UE S1AP ID -> UE location
    pub core_ids: Arc<CoreIdIndex>,
}

/// Main MME context
///
/// One instance per MME task. Constructed once at startup and passed
/// explicitly; tests build as many independent instances as they need.
pub struct MmeContext {
    /// Configuration
    pub config: Arc<MmeConfig>,
    /// Connection registry (eNB UE state machine, owns timers and outbox)
    pub conn: ConnectionRegistry,
    /// Handover / path switch coordinator
    pub mobility: MobilityCoordinator,
    /// Session/bearer pools
    pub sessions: SessionManager,
}

impl MmeContext {
    /// Create a new MME context
    pub fn new(config: MmeConfig, timers: Box<dyn TimerService>) -> Self {
        let config = Arc::new(config);
        let associations = Arc::new(AssociationRegistry::new());
        let core_ids = Arc::new(CoreIdIndex::new());

        Self {
            conn: ConnectionRegistry::new(Arc::clone(&config), associations, core_ids, timers),
            mobility: MobilityCoordinator::new(),
            sessions: SessionManager::new(
                config.max_ue,
                config.max_pdn_per_ue,
                config.max_packet_filters,
            ),
            config,
        }
    }

    /// Registries readable from other tasks
    pub fn shared(&self) -> SharedRegistries {
        SharedRegistries {
            associations: self.conn.associations(),
            core_ids: self.conn.core_ids(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
