//! DIMSE-C message types and the command set codec.
//!
//! The message service element exchanges typed request/response
//! messages (PS3.7): C-STORE, C-FIND, C-GET, C-MOVE and C-ECHO,
//! each in a request and a response form.
//! A message travels as a _command set_,
//! a sequence of group 0x0000 data elements
//! always encoded in Implicit VR Little Endian,
//! preceded by a _Command Group Length_ (0000,0000) element.
//!
//! The command set codec is built on [`dicom_object`];
//! data set payloads are opaque at this layer.

pub mod assembler;
pub mod dataset;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{mem::InMemElement, InMemDicomObject};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

/// The value of _Command Data Set Type_ (0000,0800) which announces
/// that no data set follows the command set.
/// Any other value means that a data set follows.
pub const NO_DATA_SET: u16 = 0x0101;

/// The conventional _Command Data Set Type_ value
/// announcing that a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// Command field values of the DIMSE-C messages (PS3.7 annex E).
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_GET_RQ: u16 = 0x0010;
    pub const C_GET_RSP: u16 = 0x8010;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_FIND_RSP: u16 = 0x8020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_MOVE_RSP: u16 = 0x8021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// Priority values for request messages.
pub mod priority {
    pub const MEDIUM: u16 = 0x0000;
    pub const HIGH: u16 = 0x0001;
    pub const LOW: u16 = 0x0002;
}

/// Status code values (PS3.7 annex C and PS3.4).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;

    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0112;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const NOT_AUTHORIZED: u16 = 0x0124;

    // C-STORE
    pub const STORE_OUT_OF_RESOURCES: u16 = 0xA700;
    pub const STORE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    pub const STORE_CANNOT_UNDERSTAND: u16 = 0xC000;

    // C-FIND
    pub const FIND_UNABLE_TO_PROCESS: u16 = 0xC000;

    // C-MOVE / C-GET
    pub const MOVE_OUT_OF_RESOURCES_NUMBER_OF_MATCHES: u16 = 0xA701;
    pub const MOVE_OUT_OF_RESOURCES_SUB_OPERATIONS: u16 = 0xA702;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
}

/// The outcome of a DIMSE operation,
/// carried by every response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// the status code
    pub code: u16,
    /// optional error comment, encoded as (0000,0902)
    pub error_comment: Option<String>,
}

impl Status {
    /// A plain success status.
    pub fn success() -> Self {
        Status {
            code: status::SUCCESS,
            error_comment: None,
        }
    }

    /// A pending status, announcing that more responses will follow.
    pub fn pending() -> Self {
        Status {
            code: status::PENDING,
            error_comment: None,
        }
    }

    /// A status with the given code and no comment.
    pub fn new(code: u16) -> Self {
        Status {
            code,
            error_comment: None,
        }
    }

    /// A status with the given code and error comment.
    pub fn with_comment(code: u16, comment: impl Into<String>) -> Self {
        Status {
            code,
            error_comment: Some(comment.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }

    /// Whether this is an interim status:
    /// more responses to the same request will follow.
    pub fn is_pending(&self) -> bool {
        // 0xFF01 is the "pending with warnings" variant used by C-FIND
        self.code == status::PENDING || self.code == 0xFF01
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_comment {
            Some(comment) => write!(f, "{:#06X} ({})", self.code, comment),
            None => write!(f, "{:#06X}", self.code),
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not read command set"))]
    ReadCommandSet {
        #[snafu(source(from(dicom_object::ReadError, Box::from)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("Could not write command set"))]
    WriteCommandSet {
        #[snafu(source(from(dicom_object::WriteError, Box::from)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("Missing required command element {}", tag))]
    MissingField { tag: Tag },

    #[snafu(display("Could not read value of command element {}", tag))]
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("Unknown command field {:#06X}", value))]
    UnknownCommandField { value: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A C-STORE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub priority: u16,
    pub command_data_set_type: u16,
    /// AE title of the C-MOVE originator,
    /// when this store is a C-MOVE sub-operation
    pub move_originator_ae_title: Option<String>,
    /// message ID of the originating C-MOVE request
    pub move_originator_message_id: Option<u16>,
}

/// A C-STORE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub command_data_set_type: u16,
    pub status: Status,
}

/// A C-FIND request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: u16,
    pub command_data_set_type: u16,
}

/// A C-FIND response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub command_data_set_type: u16,
    pub status: Status,
}

/// A C-GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGetRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: u16,
    pub command_data_set_type: u16,
}

/// A C-GET response, carrying the running sub-operation counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGetRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub command_data_set_type: u16,
    pub status: Status,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

/// A C-MOVE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: u16,
    pub command_data_set_type: u16,
    /// AE title of the destination node
    pub move_destination: String,
}

/// A C-MOVE response, carrying the running sub-operation counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub command_data_set_type: u16,
    pub status: Status,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

/// A C-ECHO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRq {
    pub message_id: u16,
    pub command_data_set_type: u16,
}

/// A C-ECHO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRsp {
    pub message_id_being_responded_to: u16,
    pub command_data_set_type: u16,
    pub status: Status,
}

/// A typed DIMSE-C message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CStoreRq(CStoreRq),
    CStoreRsp(CStoreRsp),
    CFindRq(CFindRq),
    CFindRsp(CFindRsp),
    CGetRq(CGetRq),
    CGetRsp(CGetRsp),
    CMoveRq(CMoveRq),
    CMoveRsp(CMoveRsp),
    CEchoRq(CEchoRq),
    CEchoRsp(CEchoRsp),
}

impl Message {
    /// The command field value identifying this message kind.
    pub fn command_field(&self) -> u16 {
        use command_field::*;
        match self {
            Message::CStoreRq(_) => C_STORE_RQ,
            Message::CStoreRsp(_) => C_STORE_RSP,
            Message::CFindRq(_) => C_FIND_RQ,
            Message::CFindRsp(_) => C_FIND_RSP,
            Message::CGetRq(_) => C_GET_RQ,
            Message::CGetRsp(_) => C_GET_RSP,
            Message::CMoveRq(_) => C_MOVE_RQ,
            Message::CMoveRsp(_) => C_MOVE_RSP,
            Message::CEchoRq(_) => C_ECHO_RQ,
            Message::CEchoRsp(_) => C_ECHO_RSP,
        }
    }

    /// Whether this is a response message.
    pub fn is_response(&self) -> bool {
        self.command_field() & 0x8000 != 0
    }

    /// The identifying message ID:
    /// _Message ID_ (0000,0110) for requests,
    /// _Message ID Being Responded To_ (0000,0120) for responses.
    pub fn message_id(&self) -> u16 {
        match self {
            Message::CStoreRq(m) => m.message_id,
            Message::CStoreRsp(m) => m.message_id_being_responded_to,
            Message::CFindRq(m) => m.message_id,
            Message::CFindRsp(m) => m.message_id_being_responded_to,
            Message::CGetRq(m) => m.message_id,
            Message::CGetRsp(m) => m.message_id_being_responded_to,
            Message::CMoveRq(m) => m.message_id,
            Message::CMoveRsp(m) => m.message_id_being_responded_to,
            Message::CEchoRq(m) => m.message_id,
            Message::CEchoRsp(m) => m.message_id_being_responded_to,
        }
    }

    /// The status carried by this message.
    /// `None` for request messages.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Message::CStoreRsp(m) => Some(&m.status),
            Message::CFindRsp(m) => Some(&m.status),
            Message::CGetRsp(m) => Some(&m.status),
            Message::CMoveRsp(m) => Some(&m.status),
            Message::CEchoRsp(m) => Some(&m.status),
            _ => None,
        }
    }

    /// Whether a data set follows this message in subsequent P-DATA PDVs.
    pub fn has_data(&self) -> bool {
        let command_data_set_type = match self {
            Message::CStoreRq(m) => m.command_data_set_type,
            Message::CStoreRsp(m) => m.command_data_set_type,
            Message::CFindRq(m) => m.command_data_set_type,
            Message::CFindRsp(m) => m.command_data_set_type,
            Message::CGetRq(m) => m.command_data_set_type,
            Message::CGetRsp(m) => m.command_data_set_type,
            Message::CMoveRq(m) => m.command_data_set_type,
            Message::CMoveRsp(m) => m.command_data_set_type,
            Message::CEchoRq(m) => m.command_data_set_type,
            Message::CEchoRsp(m) => m.command_data_set_type,
        };
        command_data_set_type != NO_DATA_SET
    }

    /// The affected SOP class UID, when the message kind carries one.
    pub fn affected_sop_class_uid(&self) -> Option<&str> {
        match self {
            Message::CStoreRq(m) => Some(&m.affected_sop_class_uid),
            Message::CStoreRsp(m) => Some(&m.affected_sop_class_uid),
            Message::CFindRq(m) => Some(&m.affected_sop_class_uid),
            Message::CFindRsp(m) => Some(&m.affected_sop_class_uid),
            Message::CGetRq(m) => Some(&m.affected_sop_class_uid),
            Message::CGetRsp(m) => Some(&m.affected_sop_class_uid),
            Message::CMoveRq(m) => Some(&m.affected_sop_class_uid),
            Message::CMoveRsp(m) => Some(&m.affected_sop_class_uid),
            Message::CEchoRq(_) | Message::CEchoRsp(_) => None,
        }
    }

    /// Encode this message as a command set
    /// in Implicit VR Little Endian,
    /// preceded by the _Command Group Length_ element.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut elements = vec![DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field()]),
        )];
        self.push_elements(&mut elements);

        let obj = InMemDicomObject::command_from_element_iter(elements);
        let mut buffer = Vec::with_capacity(128);
        obj.write_dataset_with_ts(&mut buffer, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(WriteCommandSetSnafu)?;
        Ok(buffer)
    }

    fn push_elements(&self, elements: &mut Vec<InMemElement>) {
        match self {
            Message::CStoreRq(m) => {
                push_u16(elements, tags::MESSAGE_ID, m.message_id);
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_str(
                    elements,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    &m.affected_sop_instance_uid,
                );
                push_u16(elements, tags::PRIORITY, m.priority);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                if let Some(ae_title) = &m.move_originator_ae_title {
                    push_str(
                        elements,
                        tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                        VR::AE,
                        ae_title,
                    );
                }
                if let Some(id) = m.move_originator_message_id {
                    push_u16(elements, tags::MOVE_ORIGINATOR_MESSAGE_ID, id);
                }
            }
            Message::CStoreRsp(m) => {
                push_u16(
                    elements,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    m.message_id_being_responded_to,
                );
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_str(
                    elements,
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    &m.affected_sop_instance_uid,
                );
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                push_status(elements, &m.status);
            }
            Message::CFindRq(m) => {
                push_u16(elements, tags::MESSAGE_ID, m.message_id);
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::PRIORITY, m.priority);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
            }
            Message::CFindRsp(m) => {
                push_u16(
                    elements,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    m.message_id_being_responded_to,
                );
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                push_status(elements, &m.status);
            }
            Message::CGetRq(m) => {
                push_u16(elements, tags::MESSAGE_ID, m.message_id);
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::PRIORITY, m.priority);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
            }
            Message::CGetRsp(m) => {
                push_u16(
                    elements,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    m.message_id_being_responded_to,
                );
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                push_status(elements, &m.status);
                push_counts(elements, m.remaining, m.completed, m.failed, m.warning);
            }
            Message::CMoveRq(m) => {
                push_u16(elements, tags::MESSAGE_ID, m.message_id);
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::PRIORITY, m.priority);
                push_str(elements, tags::MOVE_DESTINATION, VR::AE, &m.move_destination);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
            }
            Message::CMoveRsp(m) => {
                push_u16(
                    elements,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    m.message_id_being_responded_to,
                );
                push_str(elements, tags::AFFECTED_SOP_CLASS_UID, VR::UI, &m.affected_sop_class_uid);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                push_status(elements, &m.status);
                push_counts(elements, m.remaining, m.completed, m.failed, m.warning);
            }
            Message::CEchoRq(m) => {
                push_u16(elements, tags::MESSAGE_ID, m.message_id);
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
            }
            Message::CEchoRsp(m) => {
                push_u16(
                    elements,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    m.message_id_being_responded_to,
                );
                push_u16(elements, tags::COMMAND_DATA_SET_TYPE, m.command_data_set_type);
                push_status(elements, &m.status);
            }
        }
    }

    /// Decode a command set into a typed message,
    /// dispatching on the _Command Field_ (0000,0100) element.
    pub fn decode(data: &[u8]) -> Result<Message> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            data,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(ReadCommandSetSnafu)?;

        let command_field = require_u16(&obj, tags::COMMAND_FIELD)?;
        let command_data_set_type = require_u16(&obj, tags::COMMAND_DATA_SET_TYPE)?;

        use command_field::*;
        match command_field {
            C_STORE_RQ => Ok(Message::CStoreRq(CStoreRq {
                message_id: require_u16(&obj, tags::MESSAGE_ID)?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                affected_sop_instance_uid: require_str(&obj, tags::AFFECTED_SOP_INSTANCE_UID)?,
                priority: optional_u16(&obj, tags::PRIORITY)?.unwrap_or(priority::MEDIUM),
                command_data_set_type,
                move_originator_ae_title: optional_str(
                    &obj,
                    tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                )?,
                move_originator_message_id: optional_u16(&obj, tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
            })),
            C_STORE_RSP => Ok(Message::CStoreRsp(CStoreRsp {
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                )?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                affected_sop_instance_uid: require_str(&obj, tags::AFFECTED_SOP_INSTANCE_UID)?,
                command_data_set_type,
                status: read_status(&obj)?,
            })),
            C_FIND_RQ => Ok(Message::CFindRq(CFindRq {
                message_id: require_u16(&obj, tags::MESSAGE_ID)?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                priority: optional_u16(&obj, tags::PRIORITY)?.unwrap_or(priority::MEDIUM),
                command_data_set_type,
            })),
            C_FIND_RSP => Ok(Message::CFindRsp(CFindRsp {
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                )?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                command_data_set_type,
                status: read_status(&obj)?,
            })),
            C_GET_RQ => Ok(Message::CGetRq(CGetRq {
                message_id: require_u16(&obj, tags::MESSAGE_ID)?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                priority: optional_u16(&obj, tags::PRIORITY)?.unwrap_or(priority::MEDIUM),
                command_data_set_type,
            })),
            C_GET_RSP => Ok(Message::CGetRsp(CGetRsp {
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                )?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                command_data_set_type,
                status: read_status(&obj)?,
                remaining: optional_u16(&obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
                completed: optional_u16(&obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
                failed: optional_u16(&obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS)?,
                warning: optional_u16(&obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS)?,
            })),
            C_MOVE_RQ => Ok(Message::CMoveRq(CMoveRq {
                message_id: require_u16(&obj, tags::MESSAGE_ID)?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                priority: optional_u16(&obj, tags::PRIORITY)?.unwrap_or(priority::MEDIUM),
                command_data_set_type,
                move_destination: require_str(&obj, tags::MOVE_DESTINATION)?,
            })),
            C_MOVE_RSP => Ok(Message::CMoveRsp(CMoveRsp {
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                )?,
                affected_sop_class_uid: require_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
                command_data_set_type,
                status: read_status(&obj)?,
                remaining: optional_u16(&obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
                completed: optional_u16(&obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
                failed: optional_u16(&obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS)?,
                warning: optional_u16(&obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS)?,
            })),
            C_ECHO_RQ => Ok(Message::CEchoRq(CEchoRq {
                message_id: require_u16(&obj, tags::MESSAGE_ID)?,
                command_data_set_type,
            })),
            C_ECHO_RSP => Ok(Message::CEchoRsp(CEchoRsp {
                message_id_being_responded_to: require_u16(
                    &obj,
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                )?,
                command_data_set_type,
                status: read_status(&obj)?,
            })),
            value => UnknownCommandFieldSnafu { value }.fail(),
        }
    }
}

/// Build the error response matching a request message,
/// with no data set and the given status.
///
/// Returns `None` if `request` is not a request message.
pub fn error_response(request: &Message, status: Status) -> Option<Message> {
    match request {
        Message::CStoreRq(rq) => Some(Message::CStoreRsp(CStoreRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: rq.affected_sop_instance_uid.clone(),
            command_data_set_type: NO_DATA_SET,
            status,
        })),
        Message::CFindRq(rq) => Some(Message::CFindRsp(CFindRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
            command_data_set_type: NO_DATA_SET,
            status,
        })),
        Message::CGetRq(rq) => Some(Message::CGetRsp(CGetRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
            command_data_set_type: NO_DATA_SET,
            status,
            remaining: None,
            completed: None,
            failed: None,
            warning: None,
        })),
        Message::CMoveRq(rq) => Some(Message::CMoveRsp(CMoveRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
            command_data_set_type: NO_DATA_SET,
            status,
            remaining: None,
            completed: None,
            failed: None,
            warning: None,
        })),
        Message::CEchoRq(rq) => Some(Message::CEchoRsp(CEchoRsp {
            message_id_being_responded_to: rq.message_id,
            command_data_set_type: NO_DATA_SET,
            status,
        })),
        _ => None,
    }
}

fn push_u16(elements: &mut Vec<InMemElement>, tag: Tag, value: u16) {
    elements.push(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
}

fn push_str(elements: &mut Vec<InMemElement>, tag: Tag, vr: VR, value: &str) {
    elements.push(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn push_status(elements: &mut Vec<InMemElement>, status: &Status) {
    push_u16(elements, tags::STATUS, status.code);
    if let Some(comment) = &status.error_comment {
        push_str(elements, tags::ERROR_COMMENT, VR::LO, comment);
    }
}

fn push_counts(
    elements: &mut Vec<InMemElement>,
    remaining: Option<u16>,
    completed: Option<u16>,
    failed: Option<u16>,
    warning: Option<u16>,
) {
    if let Some(value) = remaining {
        push_u16(elements, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, value);
    }
    if let Some(value) = completed {
        push_u16(elements, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, value);
    }
    if let Some(value) = failed {
        push_u16(elements, tags::NUMBER_OF_FAILED_SUBOPERATIONS, value);
    }
    if let Some(value) = warning {
        push_u16(elements, tags::NUMBER_OF_WARNING_SUBOPERATIONS, value);
    }
}

fn require_u16(obj: &InMemDicomObject, tag: Tag) -> Result<u16> {
    obj.get(tag)
        .context(MissingFieldSnafu { tag })?
        .to_int::<u16>()
        .context(ConvertFieldSnafu { tag })
}

fn optional_u16(obj: &InMemDicomObject, tag: Tag) -> Result<Option<u16>> {
    obj.get(tag)
        .map(|elem| elem.to_int::<u16>().context(ConvertFieldSnafu { tag }))
        .transpose()
}

fn require_str(obj: &InMemDicomObject, tag: Tag) -> Result<String> {
    Ok(obj
        .get(tag)
        .context(MissingFieldSnafu { tag })?
        .to_str()
        .context(ConvertFieldSnafu { tag })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn optional_str(obj: &InMemDicomObject, tag: Tag) -> Result<Option<String>> {
    obj.get(tag)
        .map(|elem| {
            Ok(elem
                .to_str()
                .context(ConvertFieldSnafu { tag })?
                .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string())
        })
        .transpose()
}

fn read_status(obj: &InMemDicomObject) -> Result<Status> {
    Ok(Status {
        code: require_u16(obj, tags::STATUS)?,
        error_comment: optional_str(obj, tags::ERROR_COMMENT)?
            .filter(|comment| !comment.is_empty()),
    })
}
