//! The service user: the client role of the engine.
//!
//! A [`ServiceUser`] is obtained by configuring
//! [`ServiceUserOptions`] and calling
//! [`connect`](ServiceUserOptions::connect),
//! which blocks until the association is established or refused.
//! The established value exposes one method per DIMSE-C service;
//! multi-response operations (C-FIND, C-MOVE, C-GET)
//! return a blocking [`ResponseStream`].
//!
//! # Example
//!
//! ```no_run
//! # use dicom_dimse::ServiceUserOptions;
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scu = ServiceUserOptions::new()
//!     .calling_ae_title("THIS-SCU")
//!     .called_ae_title("MAIN-PACS")
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .connect("192.168.1.99:104")?;
//! let status = scu.c_echo()?;
//! assert!(status.is_success());
//! scu.release()?;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::{
    establish_requestor, ConnectSnafu, NegotiatedOptions, RequestorOptions, SetSocketOptionSnafu,
    SpawnDriverSnafu, Transport,
};
use crate::context::{ContextEntry, ContextManager};
use crate::dimse::dataset::DEFAULT_SPOOL_THRESHOLD;
use crate::dimse::{
    command_field, priority, CEchoRq, CFindRq, CGetRq, CMoveRq, CStoreRq, Message, Status,
    DATA_SET_PRESENT, NO_DATA_SET,
};
use crate::dispatcher::{
    run_upcall_loop, ClosedReason, Dispatcher, PendingCommand, Reply,
};
use crate::pdu::{
    PresentationContextProposed, DEFAULT_MAX_PDU, DICOM_APPLICATION_CONTEXT_NAME,
};
use crate::service::{store_handler_adapter, CStoreHandler, CancelToken, ConnectionState};

/// The Verification SOP class, served by C-ECHO.
const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Capacity of the upcall (driver to dispatcher) queue.
const UPCALL_QUEUE_SIZE: usize = 64;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not establish the association
    Establish {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// could not resolve the peer address
    Resolve {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the peer address resolved to nothing
    NoAddress { backtrace: Backtrace },

    /// failure in the service dispatcher
    Dispatch {
        #[snafu(backtrace)]
        source: crate::dispatcher::Error,
    },

    #[snafu(display("no accepted presentation context for SOP class `{}`", sop_class_uid))]
    ContextNotNegotiated {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    /// the peer answered with a response of an unexpected kind
    UnexpectedResponse { backtrace: Backtrace },

    #[snafu(display("cannot propose {} presentation contexts (at most 128)", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    /// the association did not close in time
    ReleaseTimeout { backtrace: Backtrace },

    /// the TLS server name is missing or invalid
    #[cfg(feature = "tls")]
    TlsServerName { backtrace: Backtrace },

    /// TLS layer failure
    #[cfg(feature = "tls")]
    Tls {
        source: rustls::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A builder for the client side of an association.
#[derive(Clone)]
pub struct ServiceUserOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    max_pdu_length: u32,
    strict: bool,
    establishment_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    spool_threshold: usize,
    store_handler: Option<Arc<CStoreHandler>>,
    #[cfg(feature = "tls")]
    tls: Option<(Arc<rustls::ClientConfig>, String)>,
}

impl std::fmt::Debug for ServiceUserOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceUserOptions")
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("abstract_syntax_uids", &self.abstract_syntax_uids)
            .field("max_pdu_length", &self.max_pdu_length)
            .finish()
    }
}

impl Default for ServiceUserOptions {
    fn default() -> Self {
        ServiceUserOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            establishment_timeout: Some(Duration::from_secs(30)),
            read_timeout: Some(Duration::from_secs(30)),
            response_timeout: Some(Duration::from_secs(30)),
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            store_handler: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl ServiceUserOptions {
    /// Create a new set of options for requesting an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling AE title, referring to this node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called AE title, referring to the target node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context for this abstract syntax.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids.push(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax in every proposed context.
    ///
    /// When none is given, Explicit and Implicit VR Little Endian
    /// are proposed.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids.push(transfer_syntax_uid.into());
        self
    }

    /// Override the maximum PDU length this node is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode: whether inbound PDUs must not surpass
    /// the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bound the time spent connecting and negotiating.
    pub fn establishment_timeout(mut self, timeout: Duration) -> Self {
        self.establishment_timeout = Some(timeout);
        self
    }

    /// Bound how long a partially received PDU may stall.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Bound the wait for each response message.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Size above which received data sets spill to a temporary file.
    pub fn spool_threshold(mut self, threshold: usize) -> Self {
        self.spool_threshold = threshold;
        self
    }

    /// Install a C-STORE handler on this client,
    /// for receiving the sub-operations of a C-GET.
    pub fn on_c_store<F>(mut self, handler: F) -> Self
    where
        F: Fn(
                ConnectionState,
                CancelToken,
                crate::service::StoreRequest,
                Option<crate::dimse::dataset::DataSetHandle>,
            ) -> Status
            + Send
            + Sync
            + 'static,
    {
        self.store_handler = Some(Arc::new(handler));
        self
    }

    /// Request the association over TLS,
    /// verifying the peer as `server_name`.
    #[cfg(feature = "tls")]
    pub fn tls_config(
        mut self,
        config: impl Into<Arc<rustls::ClientConfig>>,
        server_name: impl Into<String>,
    ) -> Self {
        self.tls = Some((config.into(), server_name.into()));
        self
    }

    /// Open a TCP connection to `address` and establish an association,
    /// blocking until the data transfer state is reached or negotiation
    /// fails.
    pub fn connect<A: ToSocketAddrs>(self, address: A) -> Result<ServiceUser> {
        let count = self.abstract_syntax_uids.len();
        ensure!(count <= 128, TooManyPresentationContextsSnafu { count });

        let mut transfer_syntaxes: Vec<String> = self
            .transfer_syntax_uids
            .iter()
            .map(|uid| uid.to_string())
            .collect();
        if transfer_syntaxes.is_empty() {
            // Explicit VR Little Endian
            transfer_syntaxes.push("1.2.840.10008.1.2.1".to_string());
            // Implicit VR Little Endian
            transfer_syntaxes.push("1.2.840.10008.1.2".to_string());
        }

        let presentation_contexts: Vec<_> = self
            .abstract_syntax_uids
            .iter()
            .enumerate()
            .map(|(i, abstract_syntax)| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.clone(),
            })
            .collect();

        let socket_addr = address
            .to_socket_addrs()
            .context(ResolveSnafu)?
            .next()
            .context(NoAddressSnafu)?;
        let stream = match self.establishment_timeout {
            Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
            None => TcpStream::connect(socket_addr),
        }
        .context(ConnectSnafu)
        .context(EstablishSnafu)?;
        stream
            .set_read_timeout(self.establishment_timeout)
            .context(SetSocketOptionSnafu)
            .context(EstablishSnafu)?;

        let transport = self.wrap_transport(stream)?;

        let options = RequestorOptions {
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts,
            max_pdu_length: self.max_pdu_length,
            strict: self.strict,
        };
        let established = establish_requestor(&options, transport).context(EstablishSnafu)?;

        let contexts = Arc::new(established.context_manager.clone());
        let negotiated = established.negotiated.clone();
        let peer_addr = established.transport.peer_addr().ok();
        let secure = established.transport.secure();

        let connection = ConnectionState {
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            peer_addr,
            secure,
        };
        let cancel = CancelToken::new();

        let mut handlers = HashMap::new();
        if let Some(handler) = &self.store_handler {
            handlers.insert(
                command_field::C_STORE_RQ,
                store_handler_adapter(Arc::clone(handler), connection.clone(), cancel.clone()),
            );
        }

        let (upcall_tx, upcall_rx) = std::sync::mpsc::sync_channel(UPCALL_QUEUE_SIZE);
        let handle = established
            .spawn(upcall_tx, self.read_timeout)
            .context(EstablishSnafu)?;

        let dispatcher = Dispatcher::new(
            format!("scu/{}", self.calling_ae_title),
            handle.downcall_tx.clone(),
            negotiated.peer_max_pdu_length,
            Arc::clone(&contexts),
            handlers,
        );

        let (lifecycle_tx, lifecycle_rx) = std::sync::mpsc::sync_channel(4);
        let loop_dispatcher = Arc::clone(&dispatcher);
        let spool_threshold = self.spool_threshold;
        let dispatcher_thread = std::thread::Builder::new()
            .name("dicom-dimse-dispatcher".to_string())
            .spawn(move || {
                run_upcall_loop(
                    &loop_dispatcher,
                    upcall_rx,
                    spool_threshold,
                    Some(lifecycle_tx),
                )
            })
            .context(SpawnDriverSnafu)
            .context(EstablishSnafu)?;

        debug!(
            "association established with {} ({} accepted contexts)",
            negotiated.peer_ae_title,
            contexts.accepted().count()
        );

        Ok(ServiceUser {
            dispatcher,
            contexts,
            negotiated,
            cancel,
            response_timeout: self.response_timeout,
            lifecycle_rx: Mutex::new(lifecycle_rx),
            driver: Some(handle.join),
            dispatcher_thread: Some(dispatcher_thread),
            closed: false,
        })
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_transport(&self, stream: TcpStream) -> Result<Transport> {
        Ok(Transport::Plain(stream))
    }

    #[cfg(feature = "tls")]
    fn wrap_transport(&self, stream: TcpStream) -> Result<Transport> {
        match &self.tls {
            None => Ok(Transport::Plain(stream)),
            Some((config, server_name)) => {
                let name = rustls::pki_types::ServerName::try_from(server_name.clone())
                    .map_err(|_| TlsServerNameSnafu.build())?;
                let conn = rustls::ClientConnection::new(Arc::clone(config), name)
                    .context(TlsSnafu)?;
                Ok(Transport::ClientTls(Box::new(rustls::StreamOwned::new(
                    conn, stream,
                ))))
            }
        }
    }
}

/// An established association from the client perspective.
///
/// All service methods take `&self`;
/// concurrent requests from multiple threads are correlated
/// by message ID.
#[derive(Debug)]
pub struct ServiceUser {
    dispatcher: Arc<Dispatcher>,
    contexts: Arc<ContextManager>,
    negotiated: NegotiatedOptions,
    cancel: CancelToken,
    response_timeout: Option<Duration>,
    lifecycle_rx: Mutex<Receiver<ClosedReason>>,
    driver: Option<std::thread::JoinHandle<()>>,
    dispatcher_thread: Option<std::thread::JoinHandle<()>>,
    closed: bool,
}

impl ServiceUser {
    /// The AE title of the peer.
    pub fn peer_ae_title(&self) -> &str {
        &self.negotiated.peer_ae_title
    }

    /// The negotiated presentation contexts.
    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// The maximum PDU length the peer is willing to receive.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.negotiated.peer_max_pdu_length
    }

    /// Verify the connection with a C-ECHO.
    ///
    /// Requires a negotiated presentation context
    /// for the Verification SOP class.
    pub fn c_echo(&self) -> Result<Status> {
        let context = self.context_for(VERIFICATION_SOP_CLASS)?;
        let command = self
            .dispatcher
            .new_command(context)
            .context(DispatchSnafu)?;
        let message = Message::CEchoRq(CEchoRq {
            message_id: command.message_id(),
            command_data_set_type: NO_DATA_SET,
        });
        command.send_command(&message).context(DispatchSnafu)?;

        let reply = command.recv(self.response_timeout).context(DispatchSnafu)?;
        match reply.message {
            Message::CEchoRsp(rsp) => Ok(rsp.status),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Store one SOP instance on the peer.
    ///
    /// `data` must yield the instance's data set
    /// already encoded in the transfer syntax
    /// negotiated for `sop_class_uid`;
    /// it is streamed to the peer in PDU-sized fragments.
    pub fn c_store<R: Read>(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        data: &mut R,
    ) -> Result<Status> {
        self.c_store_with_originator(sop_class_uid, sop_instance_uid, data, None, None)
    }

    /// Store one SOP instance on the peer
    /// on behalf of a C-MOVE originator.
    pub fn c_store_with_originator<R: Read>(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        data: &mut R,
        move_originator_ae_title: Option<&str>,
        move_originator_message_id: Option<u16>,
    ) -> Result<Status> {
        let context = self.context_for(sop_class_uid)?;
        let command = self
            .dispatcher
            .new_command(context)
            .context(DispatchSnafu)?;
        let message = Message::CStoreRq(CStoreRq {
            message_id: command.message_id(),
            affected_sop_class_uid: sop_class_uid.to_string(),
            affected_sop_instance_uid: sop_instance_uid.to_string(),
            priority: priority::MEDIUM,
            command_data_set_type: DATA_SET_PRESENT,
            move_originator_ae_title: move_originator_ae_title.map(str::to_string),
            move_originator_message_id,
        });
        command.send_command(&message).context(DispatchSnafu)?;
        command.send_payload_from(data).context(DispatchSnafu)?;

        let reply = command.recv(self.response_timeout).context(DispatchSnafu)?;
        match reply.message {
            Message::CStoreRsp(rsp) => Ok(rsp.status),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Query the peer with a C-FIND.
    ///
    /// `identifier` is the encoded query data set.
    /// The returned stream yields every pending match response
    /// and ends after the terminal response.
    pub fn c_find(&self, sop_class_uid: &str, identifier: &[u8]) -> Result<ResponseStream<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let command = self
            .dispatcher
            .new_command(context)
            .context(DispatchSnafu)?;
        let message = Message::CFindRq(CFindRq {
            message_id: command.message_id(),
            affected_sop_class_uid: sop_class_uid.to_string(),
            priority: priority::MEDIUM,
            command_data_set_type: DATA_SET_PRESENT,
        });
        command.send_command(&message).context(DispatchSnafu)?;
        command.send_payload(identifier).context(DispatchSnafu)?;

        Ok(ResponseStream::new(command, self.response_timeout))
    }

    /// Ask the peer to send matched instances
    /// to another application entity with a C-MOVE.
    pub fn c_move(
        &self,
        sop_class_uid: &str,
        destination_ae_title: &str,
        identifier: &[u8],
    ) -> Result<ResponseStream<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let command = self
            .dispatcher
            .new_command(context)
            .context(DispatchSnafu)?;
        let message = Message::CMoveRq(CMoveRq {
            message_id: command.message_id(),
            affected_sop_class_uid: sop_class_uid.to_string(),
            priority: priority::MEDIUM,
            command_data_set_type: DATA_SET_PRESENT,
            move_destination: destination_ae_title.to_string(),
        });
        command.send_command(&message).context(DispatchSnafu)?;
        command.send_payload(identifier).context(DispatchSnafu)?;

        Ok(ResponseStream::new(command, self.response_timeout))
    }

    /// Retrieve matched instances over this same association
    /// with a C-GET.
    ///
    /// The incoming C-STORE sub-operations are served by the handler
    /// installed with [`ServiceUserOptions::on_c_store`].
    pub fn c_get(&self, sop_class_uid: &str, identifier: &[u8]) -> Result<ResponseStream<'_>> {
        let context = self.context_for(sop_class_uid)?;
        let command = self
            .dispatcher
            .new_command(context)
            .context(DispatchSnafu)?;
        let message = Message::CGetRq(CGetRq {
            message_id: command.message_id(),
            affected_sop_class_uid: sop_class_uid.to_string(),
            priority: priority::MEDIUM,
            command_data_set_type: DATA_SET_PRESENT,
        });
        command.send_command(&message).context(DispatchSnafu)?;
        command.send_payload(identifier).context(DispatchSnafu)?;

        Ok(ResponseStream::new(command, self.response_timeout))
    }

    /// Gracefully release the association,
    /// waiting for the peer's confirmation.
    pub fn release(mut self) -> Result<()> {
        self.release_in_place()
    }

    /// Abort the association immediately.
    pub fn abort(mut self) -> Result<()> {
        self.closed = true;
        self.cancel.cancel();
        let _ = self
            .dispatcher
            .abort(crate::pdu::AbortRqSource::ServiceUser);
        self.join_workers();
        Ok(())
    }

    fn context_for(&self, sop_class_uid: &str) -> Result<ContextEntry> {
        self.contexts
            .find_abstract_syntax(sop_class_uid)
            .cloned()
            .context(ContextNotNegotiatedSnafu { sop_class_uid })
    }

    fn release_in_place(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();

        self.dispatcher.release().context(DispatchSnafu)?;
        let wait = self.response_timeout.unwrap_or(Duration::from_secs(10));
        let outcome = {
            let lifecycle_rx = self
                .lifecycle_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match lifecycle_rx.recv_timeout(wait) {
                Ok(ClosedReason::Released) => Ok(()),
                Ok(ClosedReason::Aborted(_)) => Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    // force the association down
                    let _ = self
                        .dispatcher
                        .abort(crate::pdu::AbortRqSource::ServiceUser);
                    ReleaseTimeoutSnafu.fail()
                }
                Err(RecvTimeoutError::Disconnected) => Ok(()),
            }
        };
        self.join_workers();
        outcome
    }

    fn join_workers(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        if let Some(dispatcher_thread) = self.dispatcher_thread.take() {
            let _ = dispatcher_thread.join();
        }
    }
}

impl Drop for ServiceUser {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.release_in_place() {
                warn!("association release on drop failed: {}", e);
            }
        } else {
            self.join_workers();
        }
    }
}

/// A blocking stream of responses to one C-FIND, C-MOVE or C-GET.
///
/// Yields zero or more pending responses
/// followed by exactly one terminal response,
/// then ends.
#[derive(Debug)]
pub struct ResponseStream<'a> {
    command: PendingCommand,
    timeout: Option<Duration>,
    done: bool,
    _association: std::marker::PhantomData<&'a ServiceUser>,
}

impl ResponseStream<'_> {
    fn new(command: PendingCommand, timeout: Option<Duration>) -> Self {
        ResponseStream {
            command,
            timeout,
            done: false,
            _association: std::marker::PhantomData,
        }
    }
}

impl Iterator for ResponseStream<'_> {
    type Item = Result<Reply>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.command.recv(self.timeout) {
            Ok(reply) => {
                let terminal = reply
                    .message
                    .status()
                    .map(|status| !status.is_pending())
                    .unwrap_or(true);
                if terminal {
                    self.done = true;
                }
                Some(Ok(reply))
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::Dispatch { source: e }))
            }
        }
    }
}
