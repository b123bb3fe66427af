//! MME Events
//!
//! Everything the MME task consumes arrives as an `MmeEvent`; everything it
//! produces is collected in an `Outbox` and drained after each event.

use std::net::SocketAddr;

use crate::connection::UeRef;
use crate::context::{
    AssocId, Bitrate, Ebi, EnbId, EpsTai, MmeUeS1apId, SubscriberId, UeId, UeLocation,
};
use crate::s1ap_build::{
    procedure_code, ErabSetupItem, ErabToBeSetup, OutboundS1ap, PduType, ReleaseCause, S1apCause,
    S1apOutbound,
};
use crate::s1ap_handler::{
    EnbConfigurationUpdateData, EnbStatusTransferData, ErabModifyResponseData,
    ErabReleaseResponseData, ErabSetupResponseData, HandoverCancelData, HandoverFailureData,
    HandoverNotifyData, HandoverRequestAcknowledgeData, HandoverRequiredData,
    InitialContextSetupFailureData, InitialContextSetupResponseData, InitialUeMessageData,
    PathSwitchRequestData, ResetData, S1SetupRequestData, UeCapabilityInfoIndicationData,
    UeContextReleaseCompleteData, UeContextReleaseRequestData, UplinkNasTransportData,
};
use crate::timer::TimerHandle;

// ============================================================================
// Inbound
// ============================================================================

/// Event consumed by the MME task
#[derive(Debug, Clone)]
pub enum MmeEvent {
    /// SCTP association established
    AssociationUp {
        assoc_id: AssocId,
        inbound_streams: u16,
        outbound_streams: u16,
        addr: Option<SocketAddr>,
    },
    /// SCTP association closed or reset by the peer
    AssociationDown { assoc_id: AssocId, is_reset: bool },
    /// Decoded S1AP message
    S1ap {
        assoc_id: AssocId,
        stream_id: u16,
        message: S1apInbound,
    },
    /// Request from the application layer (EMM/ESM)
    App(AppRequest),
    /// Timer fired
    TimerExpired { handle: TimerHandle },
}

/// Decoded S1AP message received from an eNB
#[derive(Debug, Clone)]
pub enum S1apInbound {
    S1SetupRequest(S1SetupRequestData),
    InitialUeMessage(InitialUeMessageData),
    UplinkNasTransport(UplinkNasTransportData),
    UeContextReleaseRequest(UeContextReleaseRequestData),
    UeContextReleaseComplete(UeContextReleaseCompleteData),
    InitialContextSetupResponse(InitialContextSetupResponseData),
    InitialContextSetupFailure(InitialContextSetupFailureData),
    UeCapabilityInfoIndication(UeCapabilityInfoIndicationData),
    ErabSetupResponse(ErabSetupResponseData),
    ErabModifyResponse(ErabModifyResponseData),
    ErabReleaseResponse(ErabReleaseResponseData),
    PathSwitchRequest(PathSwitchRequestData),
    HandoverRequired(HandoverRequiredData),
    HandoverRequestAcknowledge(HandoverRequestAcknowledgeData),
    HandoverFailure(HandoverFailureData),
    HandoverNotify(HandoverNotifyData),
    HandoverCancel(HandoverCancelData),
    EnbStatusTransfer(EnbStatusTransferData),
    Reset(ResetData),
    EnbConfigurationUpdate(EnbConfigurationUpdateData),
    /// Message the codec could decode only as far as its header
    Unknown { procedure_code: u8, direction: PduType },
}

impl S1apInbound {
    pub fn procedure_code(&self) -> u8 {
        match self {
            S1apInbound::S1SetupRequest(_) => procedure_code::S1_SETUP,
            S1apInbound::InitialUeMessage(_) => procedure_code::INITIAL_UE_MESSAGE,
            S1apInbound::UplinkNasTransport(_) => procedure_code::UPLINK_NAS_TRANSPORT,
            S1apInbound::UeContextReleaseRequest(_) => procedure_code::UE_CONTEXT_RELEASE_REQUEST,
            S1apInbound::UeContextReleaseComplete(_) => procedure_code::UE_CONTEXT_RELEASE,
            S1apInbound::InitialContextSetupResponse(_)
            | S1apInbound::InitialContextSetupFailure(_) => procedure_code::INITIAL_CONTEXT_SETUP,
            S1apInbound::UeCapabilityInfoIndication(_) => {
                procedure_code::UE_CAPABILITY_INFO_INDICATION
            }
            S1apInbound::ErabSetupResponse(_) => procedure_code::E_RAB_SETUP,
            S1apInbound::ErabModifyResponse(_) => procedure_code::E_RAB_MODIFY,
            S1apInbound::ErabReleaseResponse(_) => procedure_code::E_RAB_RELEASE,
            S1apInbound::PathSwitchRequest(_) => procedure_code::PATH_SWITCH_REQUEST,
            S1apInbound::HandoverRequired(_) => procedure_code::HANDOVER_PREPARATION,
            S1apInbound::HandoverRequestAcknowledge(_) | S1apInbound::HandoverFailure(_) => {
                procedure_code::HANDOVER_RESOURCE_ALLOCATION
            }
            S1apInbound::HandoverNotify(_) => procedure_code::HANDOVER_NOTIFICATION,
            S1apInbound::HandoverCancel(_) => procedure_code::HANDOVER_CANCEL,
            S1apInbound::EnbStatusTransfer(_) => procedure_code::ENB_STATUS_TRANSFER,
            S1apInbound::Reset(_) => procedure_code::RESET,
            S1apInbound::EnbConfigurationUpdate(_) => procedure_code::ENB_CONFIGURATION_UPDATE,
            S1apInbound::Unknown { procedure_code, .. } => *procedure_code,
        }
    }

    pub fn direction(&self) -> PduType {
        match self {
            S1apInbound::UeContextReleaseComplete(_)
            | S1apInbound::InitialContextSetupResponse(_)
            | S1apInbound::ErabSetupResponse(_)
            | S1apInbound::ErabModifyResponse(_)
            | S1apInbound::ErabReleaseResponse(_)
            | S1apInbound::HandoverRequestAcknowledge(_) => PduType::SuccessfulOutcome,
            S1apInbound::InitialContextSetupFailure(_) | S1apInbound::HandoverFailure(_) => {
                PduType::UnsuccessfulOutcome
            }
            S1apInbound::Unknown { direction, .. } => *direction,
            _ => PduType::InitiatingMessage,
        }
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Result of looking a message up in the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler exists
    Handled,
    /// Valid procedure/direction without a handler in the MME
    NoHandler,
    /// Procedure code beyond the table
    OutOfRange,
}

/// (procedure code, direction) pairs the MME handles
const HANDLED: &[(u8, PduType)] = &[
    (procedure_code::HANDOVER_PREPARATION, PduType::InitiatingMessage),
    (procedure_code::HANDOVER_RESOURCE_ALLOCATION, PduType::SuccessfulOutcome),
    (procedure_code::HANDOVER_RESOURCE_ALLOCATION, PduType::UnsuccessfulOutcome),
    (procedure_code::HANDOVER_NOTIFICATION, PduType::InitiatingMessage),
    (procedure_code::PATH_SWITCH_REQUEST, PduType::InitiatingMessage),
    (procedure_code::HANDOVER_CANCEL, PduType::InitiatingMessage),
    (procedure_code::E_RAB_SETUP, PduType::SuccessfulOutcome),
    (procedure_code::E_RAB_MODIFY, PduType::SuccessfulOutcome),
    (procedure_code::E_RAB_RELEASE, PduType::SuccessfulOutcome),
    (procedure_code::INITIAL_CONTEXT_SETUP, PduType::SuccessfulOutcome),
    (procedure_code::INITIAL_CONTEXT_SETUP, PduType::UnsuccessfulOutcome),
    (procedure_code::INITIAL_UE_MESSAGE, PduType::InitiatingMessage),
    (procedure_code::UPLINK_NAS_TRANSPORT, PduType::InitiatingMessage),
    (procedure_code::RESET, PduType::InitiatingMessage),
    (procedure_code::S1_SETUP, PduType::InitiatingMessage),
    (procedure_code::UE_CONTEXT_RELEASE_REQUEST, PduType::InitiatingMessage),
    (procedure_code::UE_CAPABILITY_INFO_INDICATION, PduType::InitiatingMessage),
    (procedure_code::UE_CONTEXT_RELEASE, PduType::SuccessfulOutcome),
    (procedure_code::ENB_STATUS_TRANSFER, PduType::InitiatingMessage),
    (procedure_code::ENB_CONFIGURATION_UPDATE, PduType::InitiatingMessage),
];

/// Look up the handler for a decoded message header
pub fn route(code: u8, direction: PduType) -> DispatchOutcome {
    if code > procedure_code::MAX_PROCEDURE_CODE {
        return DispatchOutcome::OutOfRange;
    }
    if HANDLED.contains(&(code, direction)) {
        DispatchOutcome::Handled
    } else {
        DispatchOutcome::NoHandler
    }
}

// ============================================================================
// Application layer
// ============================================================================

/// Request from the application layer
#[derive(Debug, Clone)]
pub enum AppRequest {
    /// Release a UE context
    UeContextRelease { target: UeRef, cause: ReleaseCause },
    /// Establish the UE context at the eNB
    InitialContextSetup {
        mme_ue_s1ap_id: MmeUeS1apId,
        ue_ambr: Bitrate,
        e_rabs: Vec<ErabToBeSetup>,
        nas_pdu: Option<Vec<u8>>,
    },
    /// Deliver a NAS PDU
    DownlinkNas {
        mme_ue_s1ap_id: MmeUeS1apId,
        nas_pdu: Vec<u8>,
    },
    /// Subscriber identified (attach accepted)
    BindSubscriber {
        mme_ue_s1ap_id: MmeUeS1apId,
        subscriber: SubscriberId,
        ue_ambr: Bitrate,
    },
    /// Handover prepared, command the source eNB
    HandoverCommand {
        mme_ue_s1ap_id: MmeUeS1apId,
        container: Vec<u8>,
    },
    /// Handover could not be prepared
    HandoverPreparationFailure {
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    },
    /// Ask the target eNB to reserve resources
    HandoverRequest {
        source_mme_ue_s1ap_id: MmeUeS1apId,
        target_enb_id: EnbId,
        cause: S1apCause,
        bearers: Vec<Ebi>,
        container: Vec<u8>,
    },
    /// Page a UE in a list of tracking areas
    Paging { m_tmsi: u32, tai_list: Vec<EpsTai> },
}

/// Why a handover did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverFailureReason {
    /// Target eNB unknown or not ready
    NoTargetAssociation,
    /// Target could not admit the bearers
    AdmissionFailed,
    /// Source eNB cancelled
    Cancelled,
    /// TS1RELOCOverall expired
    Timeout,
    /// Target association lost
    TransportLost,
}

/// Indication towards the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppIndication {
    InitialUe {
        ue_id: UeId,
        mme_ue_s1ap_id: MmeUeS1apId,
        nas_pdu: Vec<u8>,
        location: UeLocation,
    },
    UplinkNas {
        mme_ue_s1ap_id: MmeUeS1apId,
        nas_pdu: Vec<u8>,
        location: UeLocation,
    },
    UeCapability {
        mme_ue_s1ap_id: MmeUeS1apId,
        ue_radio_capability: Vec<u8>,
    },
    ReleaseRequest {
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    },
    /// UE context gone. `mme_ue_s1ap_id` is set only when the context still
    /// owned its MME UE S1AP ID (not after a handover moved it).
    ReleaseComplete {
        ue_id: Option<UeId>,
        mme_ue_s1ap_id: Option<MmeUeS1apId>,
        /// Produced locally (UE unknown or timer expiry)
        synthesized: bool,
    },
    /// eNB reset dropped the context
    ImplicitRelease { mme_ue_s1ap_id: MmeUeS1apId },
    ContextSetupConfirmed {
        mme_ue_s1ap_id: MmeUeS1apId,
        e_rabs: Vec<ErabSetupItem>,
        failed: Vec<Ebi>,
    },
    ContextSetupFailed {
        mme_ue_s1ap_id: MmeUeS1apId,
        cause: S1apCause,
    },
    ErabSetupConfirmed {
        mme_ue_s1ap_id: MmeUeS1apId,
        setup: Vec<Ebi>,
        failed: Vec<Ebi>,
    },
    ErabModifyConfirmed {
        mme_ue_s1ap_id: MmeUeS1apId,
        modified: Vec<Ebi>,
        failed: Vec<Ebi>,
    },
    ErabReleaseConfirmed {
        mme_ue_s1ap_id: MmeUeS1apId,
        released: Vec<Ebi>,
    },
    HandoverRequired {
        mme_ue_s1ap_id: MmeUeS1apId,
        target_enb_id: EnbId,
        target_tai: Option<EpsTai>,
        cause: S1apCause,
        container: Vec<u8>,
    },
    HandoverRequestAcknowledged {
        mme_ue_s1ap_id: MmeUeS1apId,
        admitted: Vec<ErabSetupItem>,
        container: Vec<u8>,
    },
    HandoverNotify {
        mme_ue_s1ap_id: MmeUeS1apId,
        location: UeLocation,
    },
    HandoverFailure {
        mme_ue_s1ap_id: MmeUeS1apId,
        reason: HandoverFailureReason,
    },
    PathSwitch {
        mme_ue_s1ap_id: MmeUeS1apId,
        location: UeLocation,
        switched: Vec<Ebi>,
        released: Vec<Ebi>,
    },
}

// ============================================================================
// Outbox
// ============================================================================

/// Messages produced while handling one event
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outbox {
    pub s1ap: Vec<OutboundS1ap>,
    pub app: Vec<AppIndication>,
}

impl Outbox {
    pub fn send(&mut self, assoc_id: AssocId, stream_id: u16, message: S1apOutbound) {
        self.s1ap.push(OutboundS1ap {
            assoc_id,
            stream_id,
            message,
        });
    }

    pub fn indicate(&mut self, indication: AppIndication) {
        self.app.push(indication);
    }

    pub fn is_empty(&self) -> bool {
        self.s1ap.is_empty() && self.app.is_empty()
    }

    pub fn take(&mut self) -> Outbox {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_three_outcomes() {
        assert_eq!(
            route(procedure_code::S1_SETUP, PduType::InitiatingMessage),
            DispatchOutcome::Handled
        );
        assert_eq!(
            route(procedure_code::S1_SETUP, PduType::SuccessfulOutcome),
            DispatchOutcome::NoHandler
        );
        assert_eq!(
            route(procedure_code::MME_CONFIGURATION_UPDATE, PduType::InitiatingMessage),
            DispatchOutcome::NoHandler
        );
        assert_eq!(route(200, PduType::InitiatingMessage), DispatchOutcome::OutOfRange);
    }

    #[test]
    fn test_every_message_is_routed() {
        let message = S1apInbound::HandoverFailure(HandoverFailureData {
            mme_ue_s1ap_id: 1,
            cause: S1apCause::default(),
        });
        assert_eq!(
            route(message.procedure_code(), message.direction()),
            DispatchOutcome::Handled
        );

        let unknown = S1apInbound::Unknown {
            procedure_code: procedure_code::ERROR_INDICATION,
            direction: PduType::InitiatingMessage,
        };
        assert_eq!(
            route(unknown.procedure_code(), unknown.direction()),
            DispatchOutcome::NoHandler
        );
    }

    #[test]
    fn test_outbox_take() {
        let mut outbox = Outbox::default();
        outbox.send(1, 0, S1apOutbound::CloseAssociation);
        outbox.indicate(AppIndication::ImplicitRelease { mme_ue_s1ap_id: 3 });
        let taken = outbox.take();
        assert!(outbox.is_empty());
        assert_eq!(taken.s1ap.len(), 1);
        assert_eq!(taken.app.len(), 1);
    }
}
