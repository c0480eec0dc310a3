//! The service provider: the server role of the engine.
//!
//! A [`ServiceProvider`] is configured with [`ServiceProviderOptions`]
//! (AE title, served SOP classes, handler callbacks, remote AE table)
//! and bound to a listening socket.
//! [`run`](ServiceProvider::run) accepts incoming connections and
//! spawns an independent association thread per connection;
//! it returns once the given cancellation token fires.
//! Associations in flight keep running until their peer
//! releases or aborts.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::association::negotiation::AcceptorPolicy;
use crate::association::{establish_acceptor, Transport};
use crate::context::ContextManager;
use crate::dimse::dataset::{DataSetHandle, DEFAULT_SPOOL_THRESHOLD};
use crate::dimse::{
    command_field, priority, status, CFindRsp, CGetRsp, CMoveRsp, CStoreRq, Message, Status,
    DATA_SET_PRESENT, NO_DATA_SET,
};
use crate::dispatcher::{run_upcall_loop, CommandHandle, Dispatcher, HandlerFn};
use crate::pdu::DEFAULT_MAX_PDU;
use crate::service::user::ServiceUserOptions;
use crate::service::{
    store_handler_adapter, CEchoHandler, CFindHandler, CRetrieveHandler, CStoreHandler,
    CancelToken, ConnectionState, FindResult, Query, RetrieveResult, SubOperation,
};

/// Capacity of the upcall (driver to dispatcher) queue.
const UPCALL_QUEUE_SIZE: usize = 64;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not bind the listening socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the listening socket
    Configure {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) struct ProviderConfig {
    ae_title: String,
    require_called_ae_title: bool,
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    promiscuous: bool,
    max_pdu_length: u32,
    strict: bool,
    spool_threshold: usize,
    establishment_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    sub_operation_timeout: Option<Duration>,
    remote_aes: HashMap<String, String>,
    on_c_echo: Option<Arc<CEchoHandler>>,
    on_c_store: Option<Arc<CStoreHandler>>,
    on_c_find: Option<Arc<CFindHandler>>,
    on_c_move: Option<Arc<CRetrieveHandler>>,
    on_c_get: Option<Arc<CRetrieveHandler>>,
    #[cfg(feature = "tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

/// A builder for the server side.
pub struct ServiceProviderOptions {
    config: ProviderConfig,
}

impl Default for ServiceProviderOptions {
    fn default() -> Self {
        ServiceProviderOptions {
            config: ProviderConfig {
                ae_title: "THIS-SCP".to_string(),
                require_called_ae_title: false,
                abstract_syntax_uids: Vec::new(),
                transfer_syntax_uids: Vec::new(),
                promiscuous: false,
                max_pdu_length: DEFAULT_MAX_PDU,
                strict: true,
                spool_threshold: DEFAULT_SPOOL_THRESHOLD,
                establishment_timeout: Some(Duration::from_secs(30)),
                read_timeout: Some(Duration::from_secs(30)),
                sub_operation_timeout: Some(Duration::from_secs(30)),
                remote_aes: HashMap::new(),
                on_c_echo: None,
                on_c_store: None,
                on_c_find: None,
                on_c_move: None,
                on_c_get: None,
                #[cfg(feature = "tls")]
                tls_config: None,
            },
        }
    }
}

impl std::fmt::Debug for ServiceProviderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProviderOptions")
            .field("ae_title", &self.config.ae_title)
            .field("abstract_syntax_uids", &self.config.abstract_syntax_uids)
            .field("max_pdu_length", &self.config.max_pdu_length)
            .finish()
    }
}

impl ServiceProviderOptions {
    /// Create a new set of options for accepting associations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the AE title of this node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.config.ae_title = ae_title.into();
        self
    }

    /// Only accept associations whose called AE title
    /// matches this node's AE title.
    pub fn accept_called_ae_title(mut self) -> Self {
        self.config.require_called_ae_title = true;
        self
    }

    /// Serve this abstract syntax.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.config
            .abstract_syntax_uids
            .push(abstract_syntax_uid.into());
        self
    }

    /// Admit this transfer syntax.
    ///
    /// When none is given, anything the transfer syntax registry
    /// can decode is admitted.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.config
            .transfer_syntax_uids
            .push(transfer_syntax_uid.into());
        self
    }

    /// Accept abstract syntaxes which are not on the served list.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.config.promiscuous = promiscuous;
        self
    }

    /// Override the maximum PDU length this node is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.config.max_pdu_length = value;
        self
    }

    /// Override strict mode: whether inbound PDUs must not surpass
    /// the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Size above which received data sets spill to a temporary file.
    pub fn spool_threshold(mut self, threshold: usize) -> Self {
        self.config.spool_threshold = threshold;
        self
    }

    /// Bound the time spent negotiating an incoming association.
    pub fn establishment_timeout(mut self, timeout: Duration) -> Self {
        self.config.establishment_timeout = Some(timeout);
        self
    }

    /// Bound how long a partially received PDU may stall.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Register a C-MOVE destination:
    /// an AE title and the `host:port` it listens on.
    pub fn remote_ae(mut self, ae_title: impl Into<String>, address: impl Into<String>) -> Self {
        self.config.remote_aes.insert(ae_title.into(), address.into());
        self
    }

    /// Serve C-ECHO requests with this handler.
    pub fn on_c_echo<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState) -> Status + Send + Sync + 'static,
    {
        self.config.on_c_echo = Some(Arc::new(handler));
        self
    }

    /// Serve C-STORE requests with this handler.
    pub fn on_c_store<F>(mut self, handler: F) -> Self
    where
        F: Fn(
                ConnectionState,
                CancelToken,
                crate::service::StoreRequest,
                Option<DataSetHandle>,
            ) -> Status
            + Send
            + Sync
            + 'static,
    {
        self.config.on_c_store = Some(Arc::new(handler));
        self
    }

    /// Serve C-FIND requests with this handler.
    pub fn on_c_find<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, CancelToken, Query, SyncSender<FindResult>)
            + Send
            + Sync
            + 'static,
    {
        self.config.on_c_find = Some(Arc::new(handler));
        self
    }

    /// Serve C-MOVE requests with this handler.
    pub fn on_c_move<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, CancelToken, Query, SyncSender<RetrieveResult>)
            + Send
            + Sync
            + 'static,
    {
        self.config.on_c_move = Some(Arc::new(handler));
        self
    }

    /// Serve C-GET requests with this handler.
    pub fn on_c_get<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, CancelToken, Query, SyncSender<RetrieveResult>)
            + Send
            + Sync
            + 'static,
    {
        self.config.on_c_get = Some(Arc::new(handler));
        self
    }

    /// Accept associations over TLS with this server configuration.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ServerConfig>>) -> Self {
        self.config.tls_config = Some(config.into());
        self
    }

    /// Bind the listening socket.
    pub fn bind<A: ToSocketAddrs>(self, address: A) -> Result<ServiceProvider> {
        let listener = TcpListener::bind(address).context(BindSnafu)?;
        info!(
            "{} listening on {:?}",
            self.config.ae_title,
            listener.local_addr().ok()
        );
        Ok(ServiceProvider {
            listener,
            config: Arc::new(self.config),
            shutdown: CancelToken::new(),
        })
    }
}

/// A running DICOM server.
pub struct ServiceProvider {
    listener: TcpListener,
    config: Arc<ProviderConfig>,
    shutdown: CancelToken,
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("ae_title", &self.config.ae_title)
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl ServiceProvider {
    /// The address the provider is listening on.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve incoming connections
    /// until `cancel` fires or [`close`](Self::close) is called.
    ///
    /// Each accepted connection is served
    /// on an independent thread which keeps running
    /// until the peer releases or aborts its association.
    pub fn run(&self, cancel: &CancelToken) -> Result<()> {
        self.listener.set_nonblocking(true).context(ConfigureSnafu)?;

        loop {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                debug!("{}: stopping accept loop", self.config.ae_title);
                return Ok(());
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("{}: accepted connection from {}", self.config.ae_title, peer);
                    let config = Arc::clone(&self.config);
                    let cancel = cancel.clone();
                    let spawned = std::thread::Builder::new()
                        .name("dicom-dimse-connection".to_string())
                        .spawn(move || run_connection(stream, config, cancel));
                    if let Err(e) = spawned {
                        warn!("could not spawn association thread: {}", e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("{}: accept failed: {}", self.config.ae_title, e);
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    /// Stop accepting new connections.
    ///
    /// Associations already in flight are left to finish.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

fn run_connection(stream: TcpStream, config: Arc<ProviderConfig>, cancel: CancelToken) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("could not configure connection socket: {}", e);
        return;
    }
    if let Err(e) = stream.set_read_timeout(config.establishment_timeout) {
        warn!("could not configure connection socket: {}", e);
        return;
    }

    let transport = match wrap_transport(&config, stream) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("could not set up transport: {}", e);
            return;
        }
    };

    let policy = AcceptorPolicy {
        ae_title: config.ae_title.clone(),
        require_called_ae_title: config.require_called_ae_title,
        abstract_syntax_uids: config.abstract_syntax_uids.clone(),
        transfer_syntax_uids: config.transfer_syntax_uids.clone(),
        promiscuous: config.promiscuous,
        max_pdu_length: config.max_pdu_length,
    };

    let established = match establish_acceptor(&policy, config.strict, transport) {
        Ok(established) => established,
        Err(e) => {
            debug!("{}: association not established: {}", config.ae_title, e);
            return;
        }
    };

    let connection = ConnectionState {
        calling_ae_title: established.negotiated.peer_ae_title.clone(),
        called_ae_title: established.negotiated.called_ae_title.clone(),
        peer_addr: established.transport.peer_addr().ok(),
        secure: established.transport.secure(),
    };
    debug!(
        "{}: association established with {}",
        config.ae_title, connection.calling_ae_title
    );

    let contexts = Arc::new(established.context_manager.clone());
    let peer_max_pdu_length = established.negotiated.peer_max_pdu_length;

    let (upcall_tx, upcall_rx) = std::sync::mpsc::sync_channel(UPCALL_QUEUE_SIZE);
    let handle = match established.spawn(upcall_tx, config.read_timeout) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("{}: could not start association driver: {}", config.ae_title, e);
            return;
        }
    };

    let handlers = build_handlers(&config, &connection, &cancel, &contexts);
    let dispatcher = Dispatcher::new(
        format!("scp/{}", config.ae_title),
        handle.downcall_tx.clone(),
        peer_max_pdu_length,
        Arc::clone(&contexts),
        handlers,
    );

    run_upcall_loop(&dispatcher, upcall_rx, config.spool_threshold, None);
    let _ = handle.join.join();
    debug!(
        "{}: finished connection with {}",
        config.ae_title, connection.calling_ae_title
    );
}

#[cfg(not(feature = "tls"))]
fn wrap_transport(
    _config: &ProviderConfig,
    stream: TcpStream,
) -> std::result::Result<Transport, crate::association::Error> {
    Ok(Transport::Plain(stream))
}

#[cfg(feature = "tls")]
fn wrap_transport(
    config: &ProviderConfig,
    stream: TcpStream,
) -> std::result::Result<Transport, crate::association::Error> {
    match &config.tls_config {
        None => Ok(Transport::Plain(stream)),
        Some(tls_config) => {
            let conn = rustls::ServerConnection::new(Arc::clone(tls_config))
                .context(crate::association::TlsSnafu)?;
            Ok(Transport::ServerTls(Box::new(rustls::StreamOwned::new(
                conn, stream,
            ))))
        }
    }
}

fn build_handlers(
    config: &Arc<ProviderConfig>,
    connection: &ConnectionState,
    cancel: &CancelToken,
    contexts: &Arc<ContextManager>,
) -> HashMap<u16, Arc<HandlerFn>> {
    let mut handlers: HashMap<u16, Arc<HandlerFn>> = HashMap::new();

    if let Some(echo) = &config.on_c_echo {
        let echo = Arc::clone(echo);
        let connection = connection.clone();
        handlers.insert(
            command_field::C_ECHO_RQ,
            Arc::new(move |message, data, handle| {
                let rq = match message {
                    Message::CEchoRq(rq) => rq,
                    _ => return,
                };
                let status = echo(connection.clone());
                let rsp = Message::CEchoRsp(crate::dimse::CEchoRsp {
                    message_id_being_responded_to: rq.message_id,
                    command_data_set_type: NO_DATA_SET,
                    status,
                });
                if let Err(e) = handle.send_response(&rsp) {
                    warn!("could not send C-ECHO response: {}", e);
                }
                if let Some(data) = data {
                    let _ = data.ack();
                }
            }),
        );
    }

    if let Some(store) = &config.on_c_store {
        handlers.insert(
            command_field::C_STORE_RQ,
            store_handler_adapter(Arc::clone(store), connection.clone(), cancel.clone()),
        );
    }

    if let Some(find) = &config.on_c_find {
        let find = Arc::clone(find);
        let connection = connection.clone();
        let cancel = cancel.clone();
        handlers.insert(
            command_field::C_FIND_RQ,
            Arc::new(move |message, data, handle| {
                let rq = match message {
                    Message::CFindRq(rq) => rq,
                    _ => return,
                };
                handle_c_find(&find, &connection, &cancel, rq, data, handle);
            }),
        );
    }

    if let Some(mover) = &config.on_c_move {
        let mover = Arc::clone(mover);
        let config = Arc::clone(config);
        let connection = connection.clone();
        let cancel = cancel.clone();
        handlers.insert(
            command_field::C_MOVE_RQ,
            Arc::new(move |message, data, handle| {
                let rq = match message {
                    Message::CMoveRq(rq) => rq,
                    _ => return,
                };
                handle_c_move(&mover, &config, &connection, &cancel, rq, data, handle);
            }),
        );
    }

    if let Some(getter) = &config.on_c_get {
        let getter = Arc::clone(getter);
        let config = Arc::clone(config);
        let connection = connection.clone();
        let cancel = cancel.clone();
        let contexts = Arc::clone(contexts);
        handlers.insert(
            command_field::C_GET_RQ,
            Arc::new(move |message, data, handle| {
                let rq = match message {
                    Message::CGetRq(rq) => rq,
                    _ => return,
                };
                handle_c_get(&getter, &config, &connection, &cancel, &contexts, rq, data, handle);
            }),
        );
    }

    handlers
}

/// Read the identifier payload out of the data set handle,
/// releasing its storage.
fn take_identifier(data: Option<DataSetHandle>) -> std::io::Result<Vec<u8>> {
    match data {
        None => Ok(Vec::new()),
        Some(mut handle) => {
            let bytes = handle.read_all()?;
            let _ = handle.ack();
            Ok(bytes)
        }
    }
}

fn handle_c_find(
    handler: &Arc<CFindHandler>,
    connection: &ConnectionState,
    cancel: &CancelToken,
    rq: crate::dimse::CFindRq,
    data: Option<DataSetHandle>,
    handle: CommandHandle,
) {
    let identifier = match take_identifier(data) {
        Ok(identifier) => identifier,
        Err(e) => {
            let rsp = Message::CFindRsp(CFindRsp {
                message_id_being_responded_to: rq.message_id,
                affected_sop_class_uid: rq.affected_sop_class_uid,
                command_data_set_type: NO_DATA_SET,
                status: Status::with_comment(status::FIND_UNABLE_TO_PROCESS, e.to_string()),
            });
            let _ = handle.send_response(&rsp);
            return;
        }
    };

    let query = Query {
        transfer_syntax_uid: handle.context().transfer_syntax.clone(),
        sop_class_uid: rq.affected_sop_class_uid.clone(),
        identifier,
    };

    let (tx, rx) = std::sync::mpsc::sync_channel::<FindResult>(16);
    let producer = {
        let handler = Arc::clone(handler);
        let connection = connection.clone();
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("dicom-dimse-cfind".to_string())
            .spawn(move || handler(connection, cancel, query, tx))
    };
    let producer = match producer {
        Ok(producer) => producer,
        Err(e) => {
            let rsp = Message::CFindRsp(CFindRsp {
                message_id_being_responded_to: rq.message_id,
                affected_sop_class_uid: rq.affected_sop_class_uid,
                command_data_set_type: NO_DATA_SET,
                status: Status::with_comment(status::FIND_UNABLE_TO_PROCESS, e.to_string()),
            });
            let _ = handle.send_response(&rsp);
            return;
        }
    };

    let mut outcome = Status::success();
    for item in rx.iter() {
        match item {
            Ok(dataset) => {
                let rsp = Message::CFindRsp(CFindRsp {
                    message_id_being_responded_to: rq.message_id,
                    affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                    command_data_set_type: DATA_SET_PRESENT,
                    status: Status::pending(),
                });
                if let Err(e) = handle.send_response_with_payload(&rsp, &dataset) {
                    warn!("could not send C-FIND match: {}", e);
                    outcome = Status::new(status::FIND_UNABLE_TO_PROCESS);
                    break;
                }
            }
            Err(failure) => {
                outcome = failure;
                break;
            }
        }
    }
    // drain whatever the handler still emits so it can finish
    for _ in rx.iter() {}

    let terminal = Message::CFindRsp(CFindRsp {
        message_id_being_responded_to: rq.message_id,
        affected_sop_class_uid: rq.affected_sop_class_uid,
        command_data_set_type: NO_DATA_SET,
        status: outcome,
    });
    if let Err(e) = handle.send_response(&terminal) {
        warn!("could not send C-FIND completion: {}", e);
    }
    let _ = producer.join();
}

#[allow(clippy::too_many_arguments)]
fn handle_c_move(
    handler: &Arc<CRetrieveHandler>,
    config: &Arc<ProviderConfig>,
    connection: &ConnectionState,
    cancel: &CancelToken,
    rq: crate::dimse::CMoveRq,
    data: Option<DataSetHandle>,
    handle: CommandHandle,
) {
    let send_terminal = |status: Status, completed: u16, failed: u16, warning: u16| {
        let rsp = Message::CMoveRsp(CMoveRsp {
            message_id_being_responded_to: rq.message_id,
            affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
            command_data_set_type: NO_DATA_SET,
            status,
            remaining: None,
            completed: Some(completed),
            failed: Some(failed),
            warning: Some(warning),
        });
        if let Err(e) = handle.send_response(&rsp) {
            warn!("could not send C-MOVE completion: {}", e);
        }
    };

    let destination = match config.remote_aes.get(&rq.move_destination) {
        Some(address) => address.clone(),
        None => {
            debug!(
                "{}: unknown C-MOVE destination `{}`",
                config.ae_title, rq.move_destination
            );
            let _ = take_identifier(data);
            send_terminal(
                Status::with_comment(
                    status::MOVE_DESTINATION_UNKNOWN,
                    format!("destination `{}` is not registered", rq.move_destination),
                ),
                0,
                0,
                0,
            );
            return;
        }
    };

    let identifier = match take_identifier(data) {
        Ok(identifier) => identifier,
        Err(e) => {
            send_terminal(
                Status::with_comment(status::FIND_UNABLE_TO_PROCESS, e.to_string()),
                0,
                0,
                0,
            );
            return;
        }
    };

    let query = Query {
        transfer_syntax_uid: handle.context().transfer_syntax.clone(),
        sop_class_uid: rq.affected_sop_class_uid.clone(),
        identifier,
    };

    let (tx, rx) = std::sync::mpsc::sync_channel::<RetrieveResult>(16);
    let producer = {
        let handler = Arc::clone(handler);
        let connection = connection.clone();
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("dicom-dimse-cmove".to_string())
            .spawn(move || handler(connection, cancel, query, tx))
    };
    let producer = match producer {
        Ok(producer) => producer,
        Err(e) => {
            send_terminal(
                Status::with_comment(status::MOVE_OUT_OF_RESOURCES_SUB_OPERATIONS, e.to_string()),
                0,
                0,
                0,
            );
            return;
        }
    };

    let mut outcome = Status::success();
    let mut completed: u16 = 0;
    let mut failed: u16 = 0;
    let warning: u16 = 0;

    for item in rx.iter() {
        match item {
            Ok(sub) => {
                if store_on_new_association(config, &rq.move_destination, &destination, rq.message_id, &sub)
                {
                    completed = completed.saturating_add(1);
                } else {
                    failed = failed.saturating_add(1);
                }
                let rsp = Message::CMoveRsp(CMoveRsp {
                    message_id_being_responded_to: rq.message_id,
                    affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                    command_data_set_type: NO_DATA_SET,
                    status: Status::pending(),
                    remaining: sub.remaining,
                    completed: Some(completed),
                    failed: Some(failed),
                    warning: Some(warning),
                });
                if let Err(e) = handle.send_response(&rsp) {
                    warn!("could not send C-MOVE progress: {}", e);
                    outcome = Status::new(status::MOVE_OUT_OF_RESOURCES_SUB_OPERATIONS);
                    break;
                }
            }
            Err(failure) => {
                outcome = failure;
                break;
            }
        }
    }
    for _ in rx.iter() {}

    send_terminal(outcome, completed, failed, warning);
    let _ = producer.join();
}

#[allow(clippy::too_many_arguments)]
fn handle_c_get(
    handler: &Arc<CRetrieveHandler>,
    config: &Arc<ProviderConfig>,
    connection: &ConnectionState,
    cancel: &CancelToken,
    contexts: &Arc<ContextManager>,
    rq: crate::dimse::CGetRq,
    data: Option<DataSetHandle>,
    handle: CommandHandle,
) {
    let send_terminal =
        |status: Status, completed: u16, failed: u16, warning: u16| {
            let rsp = Message::CGetRsp(CGetRsp {
                message_id_being_responded_to: rq.message_id,
                affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                command_data_set_type: NO_DATA_SET,
                status,
                remaining: None,
                completed: Some(completed),
                failed: Some(failed),
                warning: Some(warning),
            });
            if let Err(e) = handle.send_response(&rsp) {
                warn!("could not send C-GET completion: {}", e);
            }
        };

    let identifier = match take_identifier(data) {
        Ok(identifier) => identifier,
        Err(e) => {
            send_terminal(
                Status::with_comment(status::FIND_UNABLE_TO_PROCESS, e.to_string()),
                0,
                0,
                0,
            );
            return;
        }
    };

    let query = Query {
        transfer_syntax_uid: handle.context().transfer_syntax.clone(),
        sop_class_uid: rq.affected_sop_class_uid.clone(),
        identifier,
    };

    let (tx, rx) = std::sync::mpsc::sync_channel::<RetrieveResult>(16);
    let producer = {
        let handler = Arc::clone(handler);
        let connection = connection.clone();
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("dicom-dimse-cget".to_string())
            .spawn(move || handler(connection, cancel, query, tx))
    };
    let producer = match producer {
        Ok(producer) => producer,
        Err(e) => {
            send_terminal(
                Status::with_comment(status::MOVE_OUT_OF_RESOURCES_SUB_OPERATIONS, e.to_string()),
                0,
                0,
                0,
            );
            return;
        }
    };

    let mut outcome = Status::success();
    let mut completed: u16 = 0;
    let mut failed: u16 = 0;
    let warning: u16 = 0;

    for item in rx.iter() {
        match item {
            Ok(sub) => {
                if store_on_same_association(config, contexts, &handle, &sub) {
                    completed = completed.saturating_add(1);
                } else {
                    failed = failed.saturating_add(1);
                }
                let rsp = Message::CGetRsp(CGetRsp {
                    message_id_being_responded_to: rq.message_id,
                    affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                    command_data_set_type: NO_DATA_SET,
                    status: Status::pending(),
                    remaining: sub.remaining,
                    completed: Some(completed),
                    failed: Some(failed),
                    warning: Some(warning),
                });
                if let Err(e) = handle.send_response(&rsp) {
                    warn!("could not send C-GET progress: {}", e);
                    outcome = Status::new(status::MOVE_OUT_OF_RESOURCES_SUB_OPERATIONS);
                    break;
                }
            }
            Err(failure) => {
                outcome = failure;
                break;
            }
        }
    }
    for _ in rx.iter() {}

    send_terminal(outcome, completed, failed, warning);
    let _ = producer.join();
}

/// Perform one C-STORE sub-operation of a C-MOVE,
/// over a fresh association to the destination node.
fn store_on_new_association(
    config: &ProviderConfig,
    destination_ae_title: &str,
    address: &str,
    originator_message_id: u16,
    sub: &SubOperation,
) -> bool {
    let outcome = (|| -> std::result::Result<Status, crate::service::user::Error> {
        let user = ServiceUserOptions::new()
            .calling_ae_title(config.ae_title.clone())
            .called_ae_title(destination_ae_title.to_string())
            .with_abstract_syntax(sub.sop_class_uid.clone())
            .connect(address)?;
        let status = user.c_store_with_originator(
            &sub.sop_class_uid,
            &sub.sop_instance_uid,
            &mut &sub.data[..],
            Some(&config.ae_title),
            Some(originator_message_id),
        )?;
        let _ = user.release();
        Ok(status)
    })();

    match outcome {
        Ok(status) if status.is_success() => true,
        Ok(status) => {
            warn!(
                "C-STORE of {} to {} failed with status {}",
                sub.sop_instance_uid, destination_ae_title, status
            );
            false
        }
        Err(e) => {
            warn!(
                "C-STORE of {} to {} failed: {}",
                sub.sop_instance_uid, destination_ae_title, e
            );
            false
        }
    }
}

/// Perform one C-STORE sub-operation of a C-GET,
/// back over the same association.
fn store_on_same_association(
    config: &ProviderConfig,
    contexts: &ContextManager,
    handle: &CommandHandle,
    sub: &SubOperation,
) -> bool {
    let context = match contexts.find_abstract_syntax(&sub.sop_class_uid) {
        Some(context) => context.clone(),
        None => {
            warn!(
                "no accepted presentation context for sub-operation SOP class {}",
                sub.sop_class_uid
            );
            return false;
        }
    };

    let command = match handle.dispatcher.new_command(context) {
        Ok(command) => command,
        Err(e) => {
            warn!("could not allocate sub-operation command: {}", e);
            return false;
        }
    };
    let message = Message::CStoreRq(CStoreRq {
        message_id: command.message_id(),
        affected_sop_class_uid: sub.sop_class_uid.clone(),
        affected_sop_instance_uid: sub.sop_instance_uid.clone(),
        priority: priority::MEDIUM,
        command_data_set_type: DATA_SET_PRESENT,
        move_originator_ae_title: None,
        move_originator_message_id: None,
    });
    if let Err(e) = command
        .send_command(&message)
        .and_then(|_| command.send_payload(&sub.data))
    {
        warn!("could not send sub-operation: {}", e);
        return false;
    }

    match command.recv(config.sub_operation_timeout) {
        Ok(reply) => {
            matches!(reply.message, Message::CStoreRsp(rsp) if rsp.status.is_success())
        }
        Err(e) => {
            warn!("sub-operation store failed: {}", e);
            false
        }
    }
}
