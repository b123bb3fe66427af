//! S1AP Message Building
//!
//! Outbound S1AP messages as produced by the MME core. The ASN.1 PER codec
//! lives outside this crate; messages here carry the decoded IE values and
//! the association/stream they must be sent on.

use std::fmt;

use crate::context::{AssocId, Bitrate, Ebi, EnbUeS1apId, EpsTai, MmeUeS1apId, Qos, Tunnel};

// ============================================================================
// S1AP Constants
// ============================================================================

/// S1AP Procedure Codes
pub mod procedure_code {
    pub const HANDOVER_PREPARATION: u8 = 0;
    pub const HANDOVER_RESOURCE_ALLOCATION: u8 = 1;
    pub const HANDOVER_NOTIFICATION: u8 = 2;
    pub const PATH_SWITCH_REQUEST: u8 = 3;
    pub const HANDOVER_CANCEL: u8 = 4;
    pub const E_RAB_SETUP: u8 = 5;
    pub const E_RAB_MODIFY: u8 = 6;
    pub const E_RAB_RELEASE: u8 = 7;
    pub const INITIAL_CONTEXT_SETUP: u8 = 9;
    pub const PAGING: u8 = 10;
    pub const DOWNLINK_NAS_TRANSPORT: u8 = 11;
    pub const INITIAL_UE_MESSAGE: u8 = 12;
    pub const UPLINK_NAS_TRANSPORT: u8 = 13;
    pub const RESET: u8 = 14;
    pub const ERROR_INDICATION: u8 = 15;
    pub const S1_SETUP: u8 = 17;
    pub const UE_CONTEXT_RELEASE_REQUEST: u8 = 18;
    pub const UE_CAPABILITY_INFO_INDICATION: u8 = 22;
    pub const UE_CONTEXT_RELEASE: u8 = 23;
    pub const ENB_STATUS_TRANSFER: u8 = 24;
    pub const MME_STATUS_TRANSFER: u8 = 25;
    pub const ENB_CONFIGURATION_UPDATE: u8 = 29;
    pub const MME_CONFIGURATION_UPDATE: u8 = 30;

    /// Size of the procedure routing table
    pub const MAX_PROCEDURE_CODE: u8 = 63;
}

/// Stream used for non-UE-associated signalling
pub const NON_UE_SIGNALLING_STREAM: u16 = 0;

/// S1AP PDU Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    InitiatingMessage = 0,
    SuccessfulOutcome = 1,
    UnsuccessfulOutcome = 2,
}

impl PduType {
    pub const ALL: [PduType; 3] = [
        PduType::InitiatingMessage,
        PduType::SuccessfulOutcome,
        PduType::UnsuccessfulOutcome,
    ];
}

/// Time to wait values
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TimeToWait {
    V1s = 0,
    V2s = 1,
    V5s = 2,
    V10s = 3,
    V20s = 4,
    V60s = 5,
}

impl TimeToWait {
    /// Smallest enumerated value not below `secs` (60s caps the range)
    pub fn from_secs(secs: u8) -> Self {
        match secs {
            0..=1 => TimeToWait::V1s,
            2 => TimeToWait::V2s,
            3..=5 => TimeToWait::V5s,
            6..=10 => TimeToWait::V10s,
            11..=20 => TimeToWait::V20s,
            _ => TimeToWait::V60s,
        }
    }

    pub fn as_secs(&self) -> u8 {
        match self {
            TimeToWait::V1s => 1,
            TimeToWait::V2s => 2,
            TimeToWait::V5s => 5,
            TimeToWait::V10s => 10,
            TimeToWait::V20s => 20,
            TimeToWait::V60s => 60,
        }
    }
}

// ============================================================================
// S1AP Cause Codes
// ============================================================================

/// Radio Network cause values
pub mod radio_network_cause {
    pub const UNSPECIFIED: i64 = 0;
    pub const SUCCESSFUL_HANDOVER: i64 = 2;
    pub const RELEASE_DUE_TO_EUTRAN_GENERATED_REASON: i64 = 3;
    pub const HANDOVER_CANCELLED: i64 = 4;
    pub const HO_FAILURE_IN_TARGET_EPC_ENB_OR_TARGET_SYSTEM: i64 = 6;
    pub const TS1_RELOCOVERALL_EXPIRY: i64 = 8;
    pub const UNKNOWN_TARGET_ID: i64 = 11;
    pub const NO_RADIO_RESOURCES_AVAILABLE_IN_TARGET_CELL: i64 = 12;
    pub const UNKNOWN_MME_UE_S1AP_ID: i64 = 13;
    pub const UNKNOWN_ENB_UE_S1AP_ID: i64 = 14;
    pub const UNKNOWN_PAIR_UE_S1AP_ID: i64 = 15;
    pub const USER_INACTIVITY: i64 = 20;
    pub const RADIO_CONNECTION_WITH_UE_LOST: i64 = 21;
    pub const UNKNOWN_E_RAB_ID: i64 = 30;
}

/// Transport cause values
pub mod transport_cause {
    pub const TRANSPORT_RESOURCE_UNAVAILABLE: i64 = 0;
    pub const UNSPECIFIED: i64 = 1;
}

/// NAS cause values
pub mod nas_cause {
    pub const NORMAL_RELEASE: i64 = 0;
    pub const AUTHENTICATION_FAILURE: i64 = 1;
    pub const DETACH: i64 = 2;
    pub const UNSPECIFIED: i64 = 3;
}

/// Protocol cause values
pub mod protocol_cause {
    pub const MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE: i64 = 3;
    pub const SEMANTIC_ERROR: i64 = 4;
    pub const UNSPECIFIED: i64 = 6;
}

/// Misc cause values
pub mod misc_cause {
    pub const CONTROL_PROCESSING_OVERLOAD: i64 = 0;
    pub const NOT_ENOUGH_USER_PLANE_PROCESSING_RESOURCES: i64 = 1;
    pub const HARDWARE_FAILURE: i64 = 2;
    pub const OM_INTERVENTION: i64 = 3;
    pub const UNSPECIFIED: i64 = 4;
    pub const UNKNOWN_PLMN: i64 = 5;
}

/// S1AP Cause group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum S1apCauseGroup {
    #[default]
    Nothing,
    RadioNetwork,
    Transport,
    Nas,
    Protocol,
    Misc,
}

/// S1AP Cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct S1apCause {
    /// Cause group
    pub group: S1apCauseGroup,
    /// Cause value
    pub cause: i64,
}

impl S1apCause {
    pub const fn new(group: S1apCauseGroup, cause: i64) -> Self {
        Self { group, cause }
    }

    pub const fn radio_network(cause: i64) -> Self {
        Self::new(S1apCauseGroup::RadioNetwork, cause)
    }

    pub const fn misc(cause: i64) -> Self {
        Self::new(S1apCauseGroup::Misc, cause)
    }

    /// Congestion-class cause used when the MME is at capacity
    pub const fn congestion() -> Self {
        Self::misc(misc_cause::CONTROL_PROCESSING_OVERLOAD)
    }

    pub fn is_user_inactivity(&self) -> bool {
        self.group == S1apCauseGroup::RadioNetwork
            && self.cause == radio_network_cause::USER_INACTIVITY
    }
}

impl fmt::Display for S1apCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.group, self.cause)
    }
}

// ============================================================================
// UE Context Release Cause
// ============================================================================

/// Cause of a UE context release command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseCause {
    /// NAS normal release
    Normal,
    /// NAS detach
    Detach,
    /// Release requested by the eNB for a radio reason
    RadioGenerated,
    /// Source side released after a committed handover
    SuccessfulHandover,
    /// Handover failed with no target context
    HandoverFailure,
    /// Handover cancelled, tentative target released
    HandoverCancelled,
    /// Implicit detach
    Implicit,
    /// Transport association lost
    TransportLost,
}

impl ReleaseCause {
    /// Whether the eNB is expected to answer with release complete.
    /// Without an answer the record is destroyed as soon as the command
    /// has been handed to the transport.
    pub fn expects_release_complete(&self) -> bool {
        !matches!(
            self,
            ReleaseCause::HandoverCancelled
                | ReleaseCause::HandoverFailure
                | ReleaseCause::TransportLost
        )
    }

    /// S1AP cause carried in the release command
    pub fn to_s1ap_cause(&self) -> S1apCause {
        match self {
            ReleaseCause::Normal => S1apCause::new(S1apCauseGroup::Nas, nas_cause::NORMAL_RELEASE),
            ReleaseCause::Detach => S1apCause::new(S1apCauseGroup::Nas, nas_cause::DETACH),
            ReleaseCause::RadioGenerated => S1apCause::radio_network(
                radio_network_cause::RELEASE_DUE_TO_EUTRAN_GENERATED_REASON,
            ),
            ReleaseCause::SuccessfulHandover => {
                S1apCause::radio_network(radio_network_cause::SUCCESSFUL_HANDOVER)
            }
            ReleaseCause::HandoverFailure => S1apCause::radio_network(
                radio_network_cause::HO_FAILURE_IN_TARGET_EPC_ENB_OR_TARGET_SYSTEM,
            ),
            ReleaseCause::HandoverCancelled => {
                S1apCause::radio_network(radio_network_cause::HANDOVER_CANCELLED)
            }
            ReleaseCause::Implicit => S1apCause::new(S1apCauseGroup::Nas, nas_cause::UNSPECIFIED),
            ReleaseCause::TransportLost => S1apCause::new(
                S1apCauseGroup::Transport,
                transport_cause::TRANSPORT_RESOURCE_UNAVAILABLE,
            ),
        }
    }
}

impl fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseCause::Normal => "normal",
            ReleaseCause::Detach => "detach",
            ReleaseCause::RadioGenerated => "radio-generated",
            ReleaseCause::SuccessfulHandover => "successful-handover",
            ReleaseCause::HandoverFailure => "handover-failure",
            ReleaseCause::HandoverCancelled => "handover-cancelled",
            ReleaseCause::Implicit => "implicit",
            ReleaseCause::TransportLost => "transport-lost",
        };
        f.write_str(name)
    }
}

// ============================================================================
// E-RAB Items
// ============================================================================

/// E-RAB to be set up (context setup, handover request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErabToBeSetup {
    /// E-RAB ID (EPS bearer identity)
    pub ebi: Ebi,
    /// E-RAB level QoS
    pub qos: Qos,
    /// SGW S1-U endpoint
    pub core_tunnel: Option<Tunnel>,
}

/// E-RAB set up by the eNB, with its S1-U endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErabSetupItem {
    /// E-RAB ID
    pub ebi: Ebi,
    /// eNB S1-U endpoint
    pub tunnel: Tunnel,
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// S1AP message produced by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apOutbound {
    S1SetupResponse {
        mme_name: Option<String>,
        relative_capacity: u8,
    },
    S1SetupFailure {
        cause: S1apCause,
        time_to_wait: Option<TimeToWait>,
    },
    UeContextReleaseCommand {
        mme_ue_s1ap_id: Option<MmeUeS1apId>,
        enb_ue_s1ap_id: Option<EnbUeS1apId>,
        cause: ReleaseCause,
    },
    InitialContextSetupRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        ue_ambr: Bitrate,
        e_rabs: Vec<ErabToBeSetup>,
        nas_pdu: Option<Vec<u8>>,
    },
    DownlinkNasTransport {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        nas_pdu: Vec<u8>,
    },
    HandoverCommand {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        container: Vec<u8>,
    },
    HandoverPreparationFailure {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        cause: S1apCause,
    },
    HandoverRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
        ue_ambr: Bitrate,
        e_rabs: Vec<ErabToBeSetup>,
        container: Vec<u8>,
    },
    HandoverCancelAcknowledge {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
    },
    PathSwitchRequestAcknowledge {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        /// E-RABs the MME could not switch
        e_rabs_released: Vec<Ebi>,
    },
    PathSwitchRequestFailure {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        cause: S1apCause,
    },
    Paging {
        /// S-TMSI (M-TMSI part)
        m_tmsi: u32,
        tai_list: Vec<EpsTai>,
    },
    MmeStatusTransfer {
        mme_ue_s1ap_id: MmeUeS1apId,
        enb_ue_s1ap_id: EnbUeS1apId,
        container: Vec<u8>,
    },
    ResetAcknowledge {
        /// Empty when the whole interface was reset
        connections: Vec<(Option<MmeUeS1apId>, Option<EnbUeS1apId>)>,
    },
    EnbConfigurationUpdateAcknowledge,
    EnbConfigurationUpdateFailure {
        cause: S1apCause,
        time_to_wait: Option<TimeToWait>,
    },
    /// Ask the transport to close the association
    CloseAssociation,
}

impl S1apOutbound {
    /// Procedure code, or `None` for transport-only actions
    pub fn procedure_code(&self) -> Option<u8> {
        let code = match self {
            S1apOutbound::S1SetupResponse { .. } | S1apOutbound::S1SetupFailure { .. } => {
                procedure_code::S1_SETUP
            }
            S1apOutbound::UeContextReleaseCommand { .. } => procedure_code::UE_CONTEXT_RELEASE,
            S1apOutbound::InitialContextSetupRequest { .. } => procedure_code::INITIAL_CONTEXT_SETUP,
            S1apOutbound::DownlinkNasTransport { .. } => procedure_code::DOWNLINK_NAS_TRANSPORT,
            S1apOutbound::HandoverCommand { .. } | S1apOutbound::HandoverPreparationFailure { .. } => {
                procedure_code::HANDOVER_PREPARATION
            }
            S1apOutbound::HandoverRequest { .. } => procedure_code::HANDOVER_RESOURCE_ALLOCATION,
            S1apOutbound::HandoverCancelAcknowledge { .. } => procedure_code::HANDOVER_CANCEL,
            S1apOutbound::PathSwitchRequestAcknowledge { .. }
            | S1apOutbound::PathSwitchRequestFailure { .. } => procedure_code::PATH_SWITCH_REQUEST,
            S1apOutbound::Paging { .. } => procedure_code::PAGING,
            S1apOutbound::MmeStatusTransfer { .. } => procedure_code::MME_STATUS_TRANSFER,
            S1apOutbound::ResetAcknowledge { .. } => procedure_code::RESET,
            S1apOutbound::EnbConfigurationUpdateAcknowledge
            | S1apOutbound::EnbConfigurationUpdateFailure { .. } => {
                procedure_code::ENB_CONFIGURATION_UPDATE
            }
            S1apOutbound::CloseAssociation => return None,
        };
        Some(code)
    }

    /// PDU type, or `None` for transport-only actions
    pub fn pdu_type(&self) -> Option<PduType> {
        let pdu_type = match self {
            S1apOutbound::S1SetupResponse { .. }
            | S1apOutbound::HandoverCommand { .. }
            | S1apOutbound::HandoverCancelAcknowledge { .. }
            | S1apOutbound::PathSwitchRequestAcknowledge { .. }
            | S1apOutbound::ResetAcknowledge { .. }
            | S1apOutbound::EnbConfigurationUpdateAcknowledge => PduType::SuccessfulOutcome,
            S1apOutbound::S1SetupFailure { .. }
            | S1apOutbound::HandoverPreparationFailure { .. }
            | S1apOutbound::PathSwitchRequestFailure { .. }
            | S1apOutbound::EnbConfigurationUpdateFailure { .. } => PduType::UnsuccessfulOutcome,
            S1apOutbound::UeContextReleaseCommand { .. }
            | S1apOutbound::InitialContextSetupRequest { .. }
            | S1apOutbound::DownlinkNasTransport { .. }
            | S1apOutbound::HandoverRequest { .. }
            | S1apOutbound::Paging { .. }
            | S1apOutbound::MmeStatusTransfer { .. } => PduType::InitiatingMessage,
            S1apOutbound::CloseAssociation => return None,
        };
        Some(pdu_type)
    }
}

/// Outbound S1AP message addressed to an association and stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundS1ap {
    pub assoc_id: AssocId,
    pub stream_id: u16,
    pub message: S1apOutbound,
}

// ============================================================================
// Builders
// ============================================================================

/// Build S1 Setup Response
pub fn build_setup_response(mme_name: Option<&str>, relative_capacity: u8) -> S1apOutbound {
    S1apOutbound::S1SetupResponse {
        mme_name: mme_name.map(str::to_string),
        relative_capacity,
    }
}

/// Build S1 Setup Failure
pub fn build_setup_failure(cause: S1apCause, time_to_wait: Option<TimeToWait>) -> S1apOutbound {
    S1apOutbound::S1SetupFailure { cause, time_to_wait }
}

/// Build eNB Configuration Update Failure
pub fn build_enb_configuration_update_failure(
    cause: S1apCause,
    time_to_wait: Option<TimeToWait>,
) -> S1apOutbound {
    S1apOutbound::EnbConfigurationUpdateFailure { cause, time_to_wait }
}

/// Build UE Context Release Command
///
/// The IE carries the UE S1AP ID pair when the eNB id is known, the MME id
/// alone otherwise.
pub fn build_ue_context_release_command(
    enb_ue_s1ap_id: Option<EnbUeS1apId>,
    mme_ue_s1ap_id: Option<MmeUeS1apId>,
    cause: ReleaseCause,
) -> S1apOutbound {
    S1apOutbound::UeContextReleaseCommand {
        mme_ue_s1ap_id,
        enb_ue_s1ap_id,
        cause,
    }
}

/// Build Paging
pub fn build_paging(m_tmsi: u32, tai_list: &[EpsTai]) -> S1apOutbound {
    S1apOutbound::Paging {
        m_tmsi,
        tai_list: tai_list.to_vec(),
    }
}

// ============================================================================
// Tests
// ============================================================================
