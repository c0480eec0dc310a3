//! This crate contains the types and methods needed to act as a
//! DICOM network peer: a full protocol engine for the upper layer
//! protocol (PS3.8) and the DIMSE-C services built on top of it (PS3.7).
//!
//! The engine is organized in layers, leaves first:
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their binary codec.
//! - The [`association`] module
//!   drives one side of an association through the upper layer
//!   state machine, owning the TCP connection.
//! - The [`dimse`] module
//!   holds the typed DIMSE-C messages, the command set codec,
//!   and the assembler which rebuilds messages from P-DATA fragments.
//! - The [`dispatcher`] module
//!   multiplexes requests and responses over one association,
//!   correlating them by message ID.
//! - The [`service`] module
//!   offers the two end-user facades:
//!   [`ServiceUser`](service::user::ServiceUser) for the client role and
//!   [`ServiceProvider`](service::provider::ServiceProvider) for the
//!   server role.
//!
//! The data-set codec is deliberately out of scope:
//! command sets are read and written through [`dicom_object`],
//! and data-set payloads are carried as opaque byte streams
//! already encoded in the negotiated transfer syntax.
//!
//! ## Features
//! * `tls`: enables associations over TLS with a pre-built
//!   `rustls` configuration.

pub mod address;
pub mod association;
pub mod context;
pub mod dimse;
pub mod dispatcher;
pub mod pdu;
pub mod service;

/// The implementation class UID generically referring to this engine.
///
/// Automatically generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.306741358176273285009060619754457594269";

/// The implementation version name advertised during negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE-RS 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use context::{ContextEntry, ContextManager};
pub use dimse::dataset::DataSetHandle;
pub use dimse::{Message, Status};
pub use dispatcher::Reply;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use service::provider::{ServiceProvider, ServiceProviderOptions};
pub use service::user::{ServiceUser, ServiceUserOptions};
pub use service::{CancelToken, ConnectionState};
