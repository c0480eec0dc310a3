//! Service endpoints: the user-facing facades of the engine.
//!
//! The [`user`] module holds the client role
//! (initiates associations, issues requests, awaits responses);
//! the [`provider`] module holds the server role
//! (accepts connections, hosts handler callbacks).
//! This module carries the types shared between the two:
//! handler signatures, the per-connection state handed to callbacks,
//! and the cancellation token.

pub mod provider;
pub mod user;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use tracing::warn;

use crate::dimse::dataset::DataSetHandle;
use crate::dimse::{CStoreRsp, Message, Status, NO_DATA_SET};
use crate::dispatcher::HandlerFn;

/// Session state handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// AE title of the remote node (the association requestor)
    pub calling_ae_title: String,
    /// AE title which the requestor addressed
    pub called_ae_title: String,
    /// network address of the remote node
    pub peer_addr: Option<SocketAddr>,
    /// whether the association runs over TLS
    pub secure: bool,
}

/// A cooperative cancellation token.
///
/// Cloning shares the token: cancelling any clone cancels all.
/// Cancellation is advisory; handlers observe it to abandon
/// in-flight work promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// The identity of one C-STORE operation as seen by its handler.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// the transfer syntax the data set is encoded in
    pub transfer_syntax_uid: String,
    /// the SOP class of the stored instance
    pub sop_class_uid: String,
    /// the SOP instance UID
    pub sop_instance_uid: String,
}

/// A C-FIND, C-MOVE or C-GET identifier as seen by its handler.
#[derive(Debug, Clone)]
pub struct Query {
    /// the transfer syntax the identifier is encoded in
    pub transfer_syntax_uid: String,
    /// the SOP class of the query model
    pub sop_class_uid: String,
    /// the encoded identifier data set
    pub identifier: Vec<u8>,
}

/// One C-STORE sub-operation produced by a C-MOVE or C-GET handler.
#[derive(Debug, Clone)]
pub struct SubOperation {
    /// number of sub-operations still to come, when known
    pub remaining: Option<u16>,
    /// the SOP class of the instance to store
    pub sop_class_uid: String,
    /// the SOP instance UID
    pub sop_instance_uid: String,
    /// the encoded data set
    pub data: Vec<u8>,
}

/// One C-FIND handler emission:
/// a matching data set, or a failure status ending the operation.
pub type FindResult = Result<Vec<u8>, Status>;

/// One C-MOVE / C-GET handler emission:
/// a sub-operation to perform, or a failure status ending the operation.
pub type RetrieveResult = Result<SubOperation, Status>;

/// Handler for C-ECHO requests.
pub type CEchoHandler = dyn Fn(ConnectionState) -> Status + Send + Sync;

/// Handler for C-STORE requests.
///
/// The handler owns the data set handle and must acknowledge it
/// exactly once with [`DataSetHandle::ack`].
pub type CStoreHandler =
    dyn Fn(ConnectionState, CancelToken, StoreRequest, Option<DataSetHandle>) -> Status
        + Send
        + Sync;

/// Handler for C-FIND requests.
///
/// The handler streams matches through the sender
/// and signals completion by dropping it (or returning).
pub type CFindHandler =
    dyn Fn(ConnectionState, CancelToken, Query, SyncSender<FindResult>) + Send + Sync;

/// Handler for C-MOVE and C-GET requests.
///
/// The handler streams the matched instances through the sender
/// and signals completion by dropping it (or returning).
pub type CRetrieveHandler =
    dyn Fn(ConnectionState, CancelToken, Query, SyncSender<RetrieveResult>) + Send + Sync;

/// Wrap a C-STORE handler into a dispatcher-level handler.
///
/// Used on the provider side, and on the user side
/// for the sub-operations of a C-GET.
pub(crate) fn store_handler_adapter(
    handler: Arc<CStoreHandler>,
    connection: ConnectionState,
    cancel: CancelToken,
) -> Arc<HandlerFn> {
    Arc::new(move |message, data, handle| {
        let rq = match message {
            Message::CStoreRq(rq) => rq,
            _ => return,
        };
        let request = StoreRequest {
            transfer_syntax_uid: handle.context().transfer_syntax.clone(),
            sop_class_uid: rq.affected_sop_class_uid.clone(),
            sop_instance_uid: rq.affected_sop_instance_uid.clone(),
        };
        let status = handler(connection.clone(), cancel.clone(), request, data);
        let rsp = Message::CStoreRsp(CStoreRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid,
            affected_sop_instance_uid: rq.affected_sop_instance_uid,
            command_data_set_type: NO_DATA_SET,
            status,
        });
        if let Err(e) = handle.send_response(&rsp) {
            warn!("could not send C-STORE response: {}", e);
        }
    })
}
