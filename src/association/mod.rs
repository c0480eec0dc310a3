//! DICOM association module.
//!
//! An association is the lifecycle object binding a TCP connection,
//! the upper layer state [`machine`], and the negotiated presentation
//! contexts. Establishment happens synchronously
//! ([`establish_requestor`] / [`establish_acceptor`]);
//! the established association is then handed to a driver thread
//! which owns the socket for the rest of the conversation:
//! it decodes inbound PDUs into [`UpcallEvent`]s for the dispatcher
//! and serializes outbound [`Downcall`]s from it,
//! with bounded queues providing backpressure in both directions.

pub mod machine;
pub(crate) mod negotiation;
pub(crate) mod uid;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::context::ContextManager;
use crate::pdu::{
    read_pdu, write_pdu, AbortRqServiceProviderReason, AbortRqSource, AssociationRjResult,
    AssociationRjSource, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use machine::{Action, Event, Machine, Role, State};

/// How often the driver interleaves socket reads
/// with servicing local requests.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the downcall (dispatcher to driver) queue.
const DOWNCALL_QUEUE_SIZE: usize = 64;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to the peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the TCP stream
    SetSocketOption {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not spawn the association driver thread
    SpawnDriver {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// timed out waiting for the peer
    Timeout { backtrace: Backtrace },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch { expected: u16, got: u16 },

    /// the association request was rejected by the peer
    #[snafu(display("association rejected: {:?}, {:?}", result, source))]
    Rejected {
        result: AssociationRjResult,
        #[snafu(source(false))]
        source: AssociationRjSource,
    },

    /// the association was aborted
    Aborted { backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// invalid negotiated presentation contexts
    InvalidContexts {
        #[snafu(source(from(crate::context::Error, Box::from)))]
        source: Box<crate::context::Error>,
    },

    /// TLS layer failure
    #[cfg(feature = "tls")]
    Tls {
        source: rustls::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reason an association came down without a clean release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// the peer sent an A-ABORT
    PeerRequested,
    /// the transport connection failed or closed unexpectedly
    TransportFailure,
    /// a protocol violation was detected locally
    ProtocolViolation,
    /// no bytes arrived within the configured read timeout
    ReadTimeout,
    /// this side requested the abort
    LocalRequest,
}

/// An event delivered from the association driver
/// up to the service dispatcher.
#[derive(Debug)]
pub enum UpcallEvent {
    /// P-DATA values arrived
    Data(Vec<crate::pdu::PDataValue>),
    /// the association was released cleanly
    Released,
    /// the association was aborted
    Aborted(AbortReason),
}

/// A request sent from the service dispatcher
/// down to the association driver.
#[derive(Debug)]
pub(crate) enum Downcall {
    /// send a P-DATA-TF PDU carrying these values
    SendPData(Vec<crate::pdu::PDataValue>),
    /// initiate a graceful release
    Release,
    /// abort the association
    Abort(AbortRqSource),
}

/// The outcome of association negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedOptions {
    /// maximum PDU length the peer is willing to receive
    pub peer_max_pdu_length: u32,
    /// every presentation context of the association,
    /// accepted or not
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// AE title of the remote node
    pub peer_ae_title: String,
    /// AE title which the requestor addressed
    pub called_ae_title: String,
    /// the user information items received from the peer
    pub user_variables: Vec<UserVariableItem>,
}

/// The stream an association runs on.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    ClientTls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    #[cfg(feature = "tls")]
    ServerTls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            #[cfg(feature = "tls")]
            Transport::ClientTls(_) => f.write_str("Transport::ClientTls"),
            #[cfg(feature = "tls")]
            Transport::ServerTls(_) => f.write_str("Transport::ServerTls"),
        }
    }
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            Transport::ClientTls(stream) => &stream.sock,
            #[cfg(feature = "tls")]
            Transport::ServerTls(stream) => &stream.sock,
        }
    }

    /// Whether the stream runs over TLS.
    pub(crate) fn secure(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            #[cfg(feature = "tls")]
            _ => true,
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.tcp().set_write_timeout(timeout)
    }

    pub(crate) fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp().peer_addr()
    }

    pub(crate) fn shutdown(&self) -> std::io::Result<()> {
        self.tcp().shutdown(Shutdown::Both)
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Transport::ClientTls(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Transport::ServerTls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Transport::ClientTls(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Transport::ServerTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Transport::ClientTls(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Transport::ServerTls(stream) => stream.flush(),
        }
    }
}

/// Options for requesting an association (the client side).
#[derive(Debug, Clone)]
pub(crate) struct RequestorOptions {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub max_pdu_length: u32,
    pub strict: bool,
}

/// An established association, in the data transfer state,
/// not yet handed to a driver thread.
#[derive(Debug)]
pub(crate) struct Established {
    pub transport: Transport,
    pub machine: Machine,
    pub context_manager: ContextManager,
    pub negotiated: NegotiatedOptions,
    pub our_max_pdu_length: u32,
    pub strict: bool,
}

/// The driver side handle of a running association.
pub(crate) struct AssociationHandle {
    pub downcall_tx: SyncSender<Downcall>,
    pub join: std::thread::JoinHandle<()>,
}

/// Send an association request over `transport`
/// and negotiate until established or failed.
pub(crate) fn establish_requestor(
    options: &RequestorOptions,
    mut transport: Transport,
) -> Result<Established> {
    ensure!(
        !options.presentation_contexts.is_empty(),
        MissingAbstractSyntaxSnafu
    );

    let mut machine = Machine::new(Role::Requestor);
    machine.step(Event::AssociateRequest);
    let actions = machine.step(Event::TransportConnected);
    debug_assert_eq!(actions, vec![Action::SendAssociateRq]);

    let rq = Pdu::AssociationRq {
        protocol_version: 1,
        calling_ae_title: options.calling_ae_title.clone(),
        called_ae_title: options.called_ae_title.clone(),
        application_context_name: options.application_context_name.clone(),
        presentation_contexts: options.presentation_contexts.clone(),
        user_variables: vec![
            UserVariableItem::MaxLength(options.max_pdu_length),
            UserVariableItem::ImplementationClassUid(crate::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ],
    };
    send_pdu_now(&mut transport, &rq)?;

    let pdu = receive_pdu_now(&mut transport, options.max_pdu_length, options.strict)?;
    match pdu {
        Pdu::AssociationAc {
            protocol_version,
            presentation_contexts: results,
            user_variables,
            called_ae_title,
            ..
        } => {
            machine.step(Event::AssociateAcReceived);

            if protocol_version & 0x0001 == 0 {
                abort_and_close(&mut transport);
                return ProtocolVersionMismatchSnafu {
                    expected: 1_u16,
                    got: protocol_version,
                }
                .fail();
            }

            let context_manager =
                ContextManager::from_proposal(&options.presentation_contexts, &results)
                    .context(InvalidContextsSnafu)?;
            if !context_manager.has_accepted() {
                abort_and_close(&mut transport);
                return NoAcceptedPresentationContextsSnafu.fail();
            }

            let peer_max_pdu_length = user_variables
                .iter()
                .find_map(|item| match item {
                    UserVariableItem::MaxLength(len) => Some(*len),
                    _ => None,
                })
                .unwrap_or(DEFAULT_MAX_PDU);
            let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                u32::MAX
            } else {
                peer_max_pdu_length
            };

            let presentation_contexts = context_manager
                .accepted()
                .map(|entry| PresentationContextNegotiated {
                    id: entry.id,
                    reason: crate::pdu::PresentationContextResultReason::Acceptance,
                    abstract_syntax: entry.abstract_syntax.clone(),
                    transfer_syntax: entry.transfer_syntax.clone(),
                })
                .collect();

            Ok(Established {
                transport,
                machine,
                context_manager,
                negotiated: NegotiatedOptions {
                    peer_max_pdu_length,
                    presentation_contexts,
                    peer_ae_title: called_ae_title,
                    called_ae_title: options.called_ae_title.clone(),
                    user_variables,
                },
                our_max_pdu_length: options.max_pdu_length,
                strict: options.strict,
            })
        }
        Pdu::AssociationRj { result, source } => {
            machine.step(Event::AssociateRjReceived);
            let _ = transport.shutdown();
            RejectedSnafu { result, source }.fail()
        }
        Pdu::AbortRq { .. } => {
            let _ = transport.shutdown();
            AbortedSnafu.fail()
        }
        pdu => {
            abort_and_close(&mut transport);
            UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
        }
    }
}

/// Wait for an association request on `transport`
/// and negotiate it against the acceptor policy.
pub(crate) fn establish_acceptor(
    policy: &negotiation::AcceptorPolicy,
    strict: bool,
    mut transport: Transport,
) -> Result<Established> {
    ensure!(
        !policy.abstract_syntax_uids.is_empty() || policy.promiscuous,
        MissingAbstractSyntaxSnafu
    );

    let mut machine = Machine::new(Role::Acceptor);
    machine.step(Event::TransportConnected);

    let pdu = receive_pdu_now(&mut transport, policy.max_pdu_length, strict)?;
    match pdu {
        Pdu::AssociationRq {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            machine.step(Event::AssociateRqReceived);
            match negotiation::evaluate(
                policy,
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            ) {
                Ok((ac, negotiated)) => {
                    let actions = machine.step(Event::AssociateResponseAccept);
                    debug_assert!(actions.contains(&Action::SendAssociateAc));
                    send_pdu_now(&mut transport, &ac)?;

                    let context_manager =
                        ContextManager::from_negotiated(&negotiated.presentation_contexts)
                            .context(InvalidContextsSnafu)?;

                    Ok(Established {
                        transport,
                        machine,
                        context_manager,
                        negotiated,
                        our_max_pdu_length: policy.max_pdu_length,
                        strict,
                    })
                }
                Err((answer, error)) => {
                    machine.step(Event::AssociateResponseReject);
                    send_pdu_now(&mut transport, &answer)?;
                    let _ = transport.shutdown();
                    Err(error)
                }
            }
        }
        Pdu::ReleaseRq => {
            // a release before establishment is answered and dropped
            send_pdu_now(&mut transport, &Pdu::ReleaseRp)?;
            let _ = transport.shutdown();
            AbortedSnafu.fail()
        }
        Pdu::AbortRq { .. } => {
            let _ = transport.shutdown();
            AbortedSnafu.fail()
        }
        pdu => {
            abort_and_close(&mut transport);
            UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
        }
    }
}

impl Established {
    /// Hand this association to a driver thread.
    ///
    /// Inbound events are delivered through `upcall_tx`;
    /// the returned handle carries the downcall sender.
    /// `read_timeout` bounds how long a partially received PDU
    /// may stall before the association is aborted.
    pub(crate) fn spawn(
        self,
        upcall_tx: SyncSender<UpcallEvent>,
        read_timeout: Option<Duration>,
    ) -> Result<AssociationHandle> {
        let (downcall_tx, downcall_rx) = std::sync::mpsc::sync_channel(DOWNCALL_QUEUE_SIZE);

        let driver = Driver {
            transport: self.transport,
            machine: self.machine,
            read_buffer: BytesMut::with_capacity(
                (self.our_max_pdu_length.min(DEFAULT_MAX_PDU) + PDU_HEADER_SIZE) as usize,
            ),
            write_buffer: Vec::with_capacity(self.our_max_pdu_length.min(DEFAULT_MAX_PDU) as usize),
            our_max_pdu_length: self.our_max_pdu_length,
            peer_max_pdu_length: self.negotiated.peer_max_pdu_length,
            strict: self.strict,
            upcall_tx,
            downcall_rx,
            read_timeout,
            closed: false,
            transport_broken: false,
            dispatcher_gone: false,
        };

        let join = std::thread::Builder::new()
            .name("dicom-dimse-association".to_string())
            .spawn(move || driver.run())
            .context(SpawnDriverSnafu)?;

        Ok(AssociationHandle { downcall_tx, join })
    }
}

fn send_pdu_now(transport: &mut Transport, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
    write_pdu(&mut buffer, pdu).context(SendPduSnafu)?;
    transport.write_all(&buffer).context(WireSendSnafu)
}

fn receive_pdu_now(transport: &mut Transport, max_pdu_length: u32, strict: bool) -> Result<Pdu> {
    read_pdu(transport, max_pdu_length, strict).map_err(|e| {
        if error_is_timeout(&e) {
            TimeoutSnafu.build()
        } else {
            Error::ReceivePdu { source: e }
        }
    })
}

fn abort_and_close(transport: &mut Transport) {
    let abort = Pdu::AbortRq {
        source: AbortRqSource::ServiceProvider(AbortRqServiceProviderReason::UnexpectedPdu),
    };
    let _ = send_pdu_now(transport, &abort);
    let _ = transport.shutdown();
}

/// Whether the error chain bottoms out in an I/O timeout.
fn error_is_timeout(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut);
        }
        current = e.source();
    }
    false
}

#[derive(Default)]
struct ActionContext {
    pdata: Option<Vec<crate::pdu::PDataValue>>,
    abort_source: Option<AbortRqSource>,
    abort_reason: Option<AbortReason>,
}

enum ReadOutcome {
    Progress,
    Idle,
    Closed,
    Failed(std::io::Error),
}

/// The per-association protocol task.
///
/// The driver owns the socket exclusively,
/// reading and writing on the same thread:
/// socket reads are bounded by a short poll interval
/// so that local requests are serviced while the line is quiet.
struct Driver {
    transport: Transport,
    machine: Machine,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
    our_max_pdu_length: u32,
    peer_max_pdu_length: u32,
    strict: bool,
    upcall_tx: SyncSender<UpcallEvent>,
    downcall_rx: Receiver<Downcall>,
    read_timeout: Option<Duration>,
    closed: bool,
    transport_broken: bool,
    dispatcher_gone: bool,
}

impl Driver {
    fn run(mut self) {
        if let Err(e) = self.transport.set_read_timeout(Some(POLL_INTERVAL)) {
            warn!("could not configure association socket: {}", e);
            let _ = self.upcall_tx.send(UpcallEvent::Aborted(AbortReason::TransportFailure));
            let _ = self.transport.shutdown();
            return;
        }

        let mut partial_since: Option<Instant> = None;

        while !self.finished() {
            if self.transport_broken {
                self.apply(
                    Event::TransportClosed,
                    ActionContext {
                        abort_reason: Some(AbortReason::TransportFailure),
                        ..Default::default()
                    },
                );
                break;
            }

            // service local requests first
            loop {
                match self.downcall_rx.try_recv() {
                    Ok(downcall) => {
                        self.handle_downcall(downcall);
                        if self.finished() {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.dispatcher_gone = true;
                        break;
                    }
                }
            }
            if self.finished() {
                break;
            }
            if self.dispatcher_gone {
                // the service layer went away without releasing
                self.apply(
                    Event::AbortRequest,
                    ActionContext {
                        abort_source: Some(AbortRqSource::ServiceUser),
                        abort_reason: Some(AbortReason::LocalRequest),
                        ..Default::default()
                    },
                );
                break;
            }

            // pump the socket
            match self.read_some() {
                ReadOutcome::Progress => {
                    partial_since = None;
                    self.drain_frames();
                }
                ReadOutcome::Idle => {
                    if self.read_buffer.is_empty() {
                        partial_since = None;
                    } else if let Some(limit) = self.read_timeout {
                        let since = *partial_since.get_or_insert_with(Instant::now);
                        if since.elapsed() > limit {
                            warn!("timed out in the middle of a PDU");
                            self.apply(
                                Event::AbortRequest,
                                ActionContext {
                                    abort_source: Some(AbortRqSource::ServiceProvider(
                                        AbortRqServiceProviderReason::ReasonNotSpecified,
                                    )),
                                    abort_reason: Some(AbortReason::ReadTimeout),
                                    ..Default::default()
                                },
                            );
                        }
                    }
                }
                ReadOutcome::Closed => {
                    self.apply(
                        Event::TransportClosed,
                        ActionContext {
                            abort_reason: Some(AbortReason::TransportFailure),
                            ..Default::default()
                        },
                    );
                }
                ReadOutcome::Failed(e) => {
                    warn!("association socket failure: {}", e);
                    self.apply(
                        Event::TransportClosed,
                        ActionContext {
                            abort_reason: Some(AbortReason::TransportFailure),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let _ = self.transport.shutdown();
    }

    fn finished(&self) -> bool {
        self.closed || self.machine.state() == State::Sta1
    }

    fn handle_downcall(&mut self, downcall: Downcall) {
        match downcall {
            Downcall::SendPData(pdvs) => {
                self.apply(
                    Event::PDataRequest,
                    ActionContext {
                        pdata: Some(pdvs),
                        ..Default::default()
                    },
                );
            }
            Downcall::Release => {
                self.apply(Event::ReleaseRequest, ActionContext::default());
            }
            Downcall::Abort(source) => {
                self.apply(
                    Event::AbortRequest,
                    ActionContext {
                        abort_source: Some(source),
                        abort_reason: Some(AbortReason::LocalRequest),
                        ..Default::default()
                    },
                );
            }
        }
    }

    fn read_some(&mut self) -> ReadOutcome {
        let mut chunk = [0u8; 16 * 1024];
        match self.transport.read(&mut chunk) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                ReadOutcome::Progress
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                ReadOutcome::Idle
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => ReadOutcome::Idle,
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// Decode and apply every complete PDU frame sitting in the buffer.
    fn drain_frames(&mut self) {
        while !self.finished() {
            if self.read_buffer.len() < PDU_HEADER_SIZE as usize {
                return;
            }

            let declared = u32::from_be_bytes([
                self.read_buffer[2],
                self.read_buffer[3],
                self.read_buffer[4],
                self.read_buffer[5],
            ]);
            let hard_limit = if self.strict {
                self.our_max_pdu_length.min(MAXIMUM_PDU_SIZE)
            } else {
                self.our_max_pdu_length
                    .saturating_mul(2)
                    .min(MAXIMUM_PDU_SIZE)
            };
            if declared > hard_limit {
                warn!(
                    "incoming PDU of {} bytes exceeds the admissible maximum {}",
                    declared, hard_limit
                );
                self.protocol_violation(AbortRqServiceProviderReason::InvalidPduParameterValue);
                return;
            }

            let total = PDU_HEADER_SIZE as usize + declared as usize;
            if self.read_buffer.len() < total {
                return;
            }

            let frame = self.read_buffer.copy_to_bytes(total);
            match read_pdu(&mut frame.as_ref(), hard_limit.max(crate::pdu::MINIMUM_PDU_SIZE), false)
            {
                Ok(pdu) => self.handle_pdu(pdu),
                Err(e) => {
                    warn!("malformed PDU: {}", e);
                    self.protocol_violation(AbortRqServiceProviderReason::InvalidPduParameterValue);
                    return;
                }
            }
        }
    }

    fn handle_pdu(&mut self, pdu: Pdu) {
        trace!("association received {}", pdu.short_description());
        match pdu {
            Pdu::PData { data } => {
                self.apply(
                    Event::PDataReceived,
                    ActionContext {
                        pdata: Some(data),
                        ..Default::default()
                    },
                );
            }
            Pdu::ReleaseRq => {
                self.apply(Event::ReleaseRqReceived, ActionContext::default());
            }
            Pdu::ReleaseRp => {
                self.apply(Event::ReleaseRpReceived, ActionContext::default());
            }
            Pdu::AbortRq { source } => {
                debug!("association aborted by peer: {:?}", source);
                self.apply(
                    Event::AbortReceived,
                    ActionContext {
                        abort_reason: Some(AbortReason::PeerRequested),
                        ..Default::default()
                    },
                );
            }
            Pdu::AssociationRq { .. } => {
                self.apply(
                    Event::AssociateRqReceived,
                    ActionContext {
                        abort_source: Some(AbortRqSource::ServiceProvider(
                            AbortRqServiceProviderReason::UnexpectedPdu,
                        )),
                        abort_reason: Some(AbortReason::ProtocolViolation),
                        ..Default::default()
                    },
                );
            }
            Pdu::AssociationAc { .. } => {
                self.apply(
                    Event::AssociateAcReceived,
                    ActionContext {
                        abort_source: Some(AbortRqSource::ServiceProvider(
                            AbortRqServiceProviderReason::UnexpectedPdu,
                        )),
                        abort_reason: Some(AbortReason::ProtocolViolation),
                        ..Default::default()
                    },
                );
            }
            Pdu::AssociationRj { .. } => {
                self.apply(
                    Event::AssociateRjReceived,
                    ActionContext {
                        abort_source: Some(AbortRqSource::ServiceProvider(
                            AbortRqServiceProviderReason::UnexpectedPdu,
                        )),
                        abort_reason: Some(AbortReason::ProtocolViolation),
                        ..Default::default()
                    },
                );
            }
            Pdu::Unknown { pdu_type, .. } => {
                warn!("received PDU of unknown type {:#04X}", pdu_type);
                self.protocol_violation(AbortRqServiceProviderReason::UnrecognizedPdu);
            }
        }
    }

    fn protocol_violation(&mut self, reason: AbortRqServiceProviderReason) {
        self.apply(
            Event::InvalidPduReceived,
            ActionContext {
                abort_source: Some(AbortRqSource::ServiceProvider(reason)),
                abort_reason: Some(AbortReason::ProtocolViolation),
                ..Default::default()
            },
        );
    }

    fn apply(&mut self, event: Event, mut ctx: ActionContext) {
        let actions = self.machine.step(event);
        for action in actions {
            match action {
                Action::SendPData => {
                    if let Some(pdvs) = ctx.pdata.take() {
                        self.write_pdu_out(&Pdu::PData { data: pdvs });
                    }
                }
                Action::SendReleaseRq => self.write_pdu_out(&Pdu::ReleaseRq),
                Action::SendReleaseRp => self.write_pdu_out(&Pdu::ReleaseRp),
                Action::SendAbort => {
                    let source = ctx.abort_source.take().unwrap_or(
                        AbortRqSource::ServiceProvider(
                            AbortRqServiceProviderReason::ReasonNotSpecified,
                        ),
                    );
                    self.write_pdu_out(&Pdu::AbortRq { source });
                }
                Action::NotifyData => {
                    if let Some(pdvs) = ctx.pdata.take() {
                        if self.upcall_tx.send(UpcallEvent::Data(pdvs)).is_err() {
                            self.dispatcher_gone = true;
                        }
                    }
                }
                Action::NotifyReleased => {
                    let _ = self.upcall_tx.send(UpcallEvent::Released);
                }
                Action::NotifyAborted => {
                    let reason = ctx.abort_reason.unwrap_or(AbortReason::ProtocolViolation);
                    let _ = self.upcall_tx.send(UpcallEvent::Aborted(reason));
                }
                Action::CloseTransport => {
                    let _ = self.transport.shutdown();
                    self.closed = true;
                }
                // establishment actions cannot occur after spawning
                Action::SendAssociateRq
                | Action::SendAssociateAc
                | Action::SendAssociateRj
                | Action::NotifyEstablished
                | Action::NotifyRejected => {
                    debug!("ignoring establishment action {:?} in driver", action);
                }
            }
        }

        // a release indication or collision is answered right away
        match self.machine.state() {
            State::Sta8 | State::Sta9 | State::Sta12 => {
                self.apply(Event::ReleaseResponse, ActionContext::default());
            }
            _ => {}
        }
    }

    fn write_pdu_out(&mut self, pdu: &Pdu) {
        self.write_buffer.clear();
        if let Err(e) = write_pdu(&mut self.write_buffer, pdu) {
            warn!("could not encode outgoing PDU: {}", e);
            self.transport_broken = true;
            return;
        }
        let limit = self
            .peer_max_pdu_length
            .saturating_add(PDU_HEADER_SIZE) as usize;
        if matches!(pdu, Pdu::PData { .. }) && self.write_buffer.len() > limit {
            warn!(
                "outgoing P-DATA-TF of {} bytes exceeds the peer maximum of {}",
                self.write_buffer.len(),
                self.peer_max_pdu_length
            );
            self.transport_broken = true;
            return;
        }
        if let Err(e) = self.transport.write_all(&self.write_buffer) {
            warn!("could not send PDU: {}", e);
            self.transport_broken = true;
        }
    }
}
