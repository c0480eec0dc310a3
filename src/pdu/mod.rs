//! Protocol data unit module.
//!
//! This module comprises the data structures for the seven PDU kinds
//! of the upper layer protocol, their nested sub-items,
//! and the binary codec converting them to and from the wire
//! ([`read_pdu`], [`write_pdu`]).

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The per-PDV overhead inside a P-DATA-TF PDU:
/// item length (4 bytes), presentation context ID (1 byte)
/// and message control header (1 byte).
pub const PDV_HEADER_SIZE: u32 = 6;

/// The application context name for the DICOM application context.
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// A presentation context as proposed by the association requestor:
/// one abstract syntax paired with the transfer syntaxes
/// which the requestor is able to use for it.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number
    pub id: u8,
    /// the abstract syntax (SOP class) UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context result as returned by the acceptor.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax UID chosen by the acceptor
    /// (only significant on acceptance)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// combining the requestor's abstract syntax
/// with the acceptor's verdict.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the abstract syntax (SOP class) UID
    pub abstract_syntax: String,
    /// the accorded transfer syntax UID
    pub transfer_syntax: String,
}

/// The reason field of a presentation context result.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an association rejection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AssociationRjResult {
    Permanent,
    Transient,
}

impl AssociationRjResult {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRjResult::Permanent),
            2 => Some(AssociationRjResult::Transient),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            AssociationRjResult::Permanent => 1,
            AssociationRjResult::Transient => 2,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AssociationRjSource {
    /// rejected by the DICOM UL service user
    ServiceUser(AssociationRjServiceUserReason),
    /// rejected by the DICOM UL service provider (ACSE related function)
    ServiceProviderAcse(AssociationRjServiceProviderAcseReason),
    /// rejected by the DICOM UL service provider
    /// (presentation related function)
    ServiceProviderPresentation(AssociationRjServiceProviderPresentationReason),
}

impl AssociationRjSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => AssociationRjServiceUserReason::from(reason).map(AssociationRjSource::ServiceUser),
            2 => AssociationRjServiceProviderAcseReason::from(reason)
                .map(AssociationRjSource::ServiceProviderAcse),
            3 => AssociationRjServiceProviderPresentationReason::from(reason)
                .map(AssociationRjSource::ServiceProviderPresentation),
            _ => None,
        }
    }

    fn codes(self) -> (u8, u8) {
        match self {
            AssociationRjSource::ServiceUser(reason) => (1, reason.code()),
            AssociationRjSource::ServiceProviderAcse(reason) => (2, reason.code()),
            AssociationRjSource::ServiceProviderPresentation(reason) => (3, reason.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AssociationRjServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

impl AssociationRjServiceUserReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            1 => Some(AssociationRjServiceUserReason::NoReasonGiven),
            2 => Some(AssociationRjServiceUserReason::ApplicationContextNameNotSupported),
            3 => Some(AssociationRjServiceUserReason::CallingAeTitleNotRecognized),
            7 => Some(AssociationRjServiceUserReason::CalledAeTitleNotRecognized),
            4..=6 | 8..=10 => Some(AssociationRjServiceUserReason::Reserved(reason)),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            AssociationRjServiceUserReason::NoReasonGiven => 1,
            AssociationRjServiceUserReason::ApplicationContextNameNotSupported => 2,
            AssociationRjServiceUserReason::CallingAeTitleNotRecognized => 3,
            AssociationRjServiceUserReason::CalledAeTitleNotRecognized => 7,
            AssociationRjServiceUserReason::Reserved(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AssociationRjServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl AssociationRjServiceProviderAcseReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            1 => Some(AssociationRjServiceProviderAcseReason::NoReasonGiven),
            2 => Some(AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            AssociationRjServiceProviderAcseReason::NoReasonGiven => 1,
            AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AssociationRjServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl AssociationRjServiceProviderPresentationReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            1 => Some(AssociationRjServiceProviderPresentationReason::TemporaryCongestion),
            2 => Some(AssociationRjServiceProviderPresentationReason::LocalLimitExceeded),
            0 | 3..=7 => Some(AssociationRjServiceProviderPresentationReason::Reserved(
                reason,
            )),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            AssociationRjServiceProviderPresentationReason::TemporaryCongestion => 1,
            AssociationRjServiceProviderPresentationReason::LocalLimitExceeded => 2,
            AssociationRjServiceProviderPresentationReason::Reserved(code) => code,
        }
    }
}

/// A presentation data value item inside a P-DATA-TF PDU:
/// one fragment of a DIMSE command set or data set.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PDataValue {
    /// the presentation context under which the fragment travels
    pub presentation_context_id: u8,
    /// whether the fragment carries command or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its kind
    /// for the current message
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of payload carried by a presentation data value.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source and reason of an A-ABORT PDU.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AbortRqSource {
    /// abort initiated by the DICOM UL service user
    ServiceUser,
    /// abort initiated by the DICOM UL service provider
    ServiceProvider(AbortRqServiceProviderReason),
    /// reserved source value
    Reserved,
}

impl AbortRqSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(AbortRqSource::ServiceUser),
            1 => Some(AbortRqSource::Reserved),
            2 => AbortRqServiceProviderReason::from(reason).map(AbortRqSource::ServiceProvider),
            _ => None,
        }
    }

    fn codes(self) -> (u8, u8) {
        match self {
            AbortRqSource::ServiceUser => (0, 0),
            AbortRqSource::Reserved => (1, 0),
            AbortRqSource::ServiceProvider(reason) => (2, reason.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AbortRqServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameterValue,
}

impl AbortRqServiceProviderReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(AbortRqServiceProviderReason::ReasonNotSpecified),
            1 => Some(AbortRqServiceProviderReason::UnrecognizedPdu),
            2 => Some(AbortRqServiceProviderReason::UnexpectedPdu),
            4 => Some(AbortRqServiceProviderReason::UnrecognizedPduParameter),
            5 => Some(AbortRqServiceProviderReason::UnexpectedPduParameter),
            6 => Some(AbortRqServiceProviderReason::InvalidPduParameterValue),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            AbortRqServiceProviderReason::ReasonNotSpecified => 0,
            AbortRqServiceProviderReason::UnrecognizedPdu => 1,
            AbortRqServiceProviderReason::UnexpectedPdu => 2,
            AbortRqServiceProviderReason::UnrecognizedPduParameter => 4,
            AbortRqServiceProviderReason::UnexpectedPduParameter => 5,
            AbortRqServiceProviderReason::InvalidPduParameterValue => 6,
        }
    }
}

/// A variable item found at the top level of an association PDU.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
///
/// Item types which this engine does not interpret are preserved
/// as opaque blobs in the [`Unknown`](UserVariableItem::Unknown) variant.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum UserVariableItem {
    /// (0x51) the maximum PDU length the emitter is willing to receive
    MaxLength(u32),
    /// (0x52) the implementation class UID of the emitter
    ImplementationClassUid(String),
    /// (0x55) the implementation version name of the emitter
    ImplementationVersionName(String),
    /// (0x53) the asynchronous operations window
    AsyncOperationsWindow {
        max_operations_invoked: u16,
        max_operations_performed: u16,
    },
    /// (0x54) an SCP/SCU role selection for one SOP class
    RoleSelection {
        sop_class_uid: String,
        scu_role: bool,
        scp_role: bool,
    },
    /// any other sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// A protocol data unit of the upper layer protocol.
///
/// On the wire, every PDU is framed as a 1-byte type code,
/// 1 reserved byte, a 4-byte big-endian payload length,
/// and that many payload bytes.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Pdu {
    /// an A-ASSOCIATE-RQ PDU (type 0x01)
    AssociationRq {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    /// an A-ASSOCIATE-AC PDU (type 0x02)
    AssociationAc {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    /// an A-ASSOCIATE-RJ PDU (type 0x03)
    AssociationRj {
        result: AssociationRjResult,
        source: AssociationRjSource,
    },
    /// a P-DATA-TF PDU (type 0x04)
    PData { data: Vec<PDataValue> },
    /// an A-RELEASE-RQ PDU (type 0x05)
    ReleaseRq,
    /// an A-RELEASE-RP PDU (type 0x06)
    ReleaseRp,
    /// an A-ABORT PDU (type 0x07)
    AbortRq { source: AbortRqSource },
    /// a PDU of an unrecognized type, kept as raw bytes.
    /// This variant is produced on decoding only;
    /// trying to encode it is an error.
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short description of the PDU kind, suitable for log messages.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRq { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAc { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRj { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::AbortRq { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "unknown PDU",
        }
    }
}
