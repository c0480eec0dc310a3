//! The service dispatcher:
//! a bidirectional multiplexor between one association driver
//! and the message handlers above it.
//!
//! Outbound, the dispatcher allocates message IDs,
//! encodes command sets and fragments them into P-DATA values
//! no larger than the peer's negotiated maximum PDU.
//! Inbound, it feeds fragments to the command assembler and routes
//! every completed message: responses are correlated to the waiting
//! command by message ID, fresh requests go to the registered handler
//! for their command field.
//! Handlers run on their own threads; a handler panic is contained
//! and answered with a `ProcessingFailure` response.

use std::collections::HashMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{ensure, Snafu};
use tracing::{debug, warn};

use crate::association::{AbortReason, Downcall, UpcallEvent};
use crate::context::{ContextEntry, ContextManager};
use crate::dimse::assembler::{AssembledMessage, CommandAssembler};
use crate::dimse::dataset::DataSetHandle;
use crate::dimse::{error_response, status, Message, Status};
use crate::pdu::{
    AbortRqServiceProviderReason, AbortRqSource, PDataValue, PDataValueType, PDV_HEADER_SIZE,
};

/// Capacity of each command's reply queue.
const REPLY_QUEUE_SIZE: usize = 32;

/// Upper bound on a single outbound fragment,
/// even when the peer advertises an unlimited PDU length.
const MAX_FRAGMENT_SIZE: usize = 1024 * 1024;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the association is closed
    #[snafu(display("association closed: {:?}", reason))]
    Closed { reason: ClosedReason },

    /// the association driver is no longer running
    DriverGone,

    /// failed to encode DIMSE command
    EncodeCommand {
        #[snafu(source(from(crate::dimse::Error, Box::from)))]
        source: Box<crate::dimse::Error>,
    },

    /// failed to read the outgoing data set
    ReadPayload { source: std::io::Error },

    /// timed out waiting for a response
    ResponseTimeout,

    /// all message IDs are taken by in-flight requests
    MessageIdsExhausted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a dispatcher stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// the association was released cleanly
    Released,
    /// the association was aborted
    Aborted(AbortReason),
}

/// A response delivered back to the command originator:
/// the message and its accompanying data set, if any.
#[derive(Debug)]
pub struct Reply {
    pub message: Message,
    pub data: Option<DataSetHandle>,
}

/// An inbound request handler:
/// receives the message, its data set,
/// and a handle for sending responses.
pub(crate) type HandlerFn = dyn Fn(Message, Option<DataSetHandle>, CommandHandle) + Send + Sync;

struct Inner {
    next_message_id: u16,
    active: HashMap<u16, SyncSender<Reply>>,
    closed: Option<ClosedReason>,
}

/// The per-association service dispatcher.
pub struct Dispatcher {
    label: String,
    downcall_tx: SyncSender<Downcall>,
    peer_max_pdu_length: u32,
    contexts: Arc<ContextManager>,
    handlers: HashMap<u16, Arc<HandlerFn>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("label", &self.label)
            .field("peer_max_pdu_length", &self.peer_max_pdu_length)
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(
        label: impl Into<String>,
        downcall_tx: SyncSender<Downcall>,
        peer_max_pdu_length: u32,
        contexts: Arc<ContextManager>,
        handlers: HashMap<u16, Arc<HandlerFn>>,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            label: label.into(),
            downcall_tx,
            peer_max_pdu_length,
            contexts,
            handlers,
            inner: Mutex::new(Inner {
                next_message_id: 1,
                active: HashMap::new(),
                closed: None,
            }),
        })
    }

    /// The presentation contexts of the underlying association.
    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Register a new outgoing command,
    /// allocating a fresh message ID for it.
    ///
    /// IDs are allocated monotonically, wrap at 65535,
    /// and never collide with a currently active command.
    pub(crate) fn new_command(self: &Arc<Self>, context: ContextEntry) -> Result<PendingCommand> {
        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(REPLY_QUEUE_SIZE);
        let message_id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = inner.closed {
                return ClosedSnafu { reason }.fail();
            }
            ensure!(inner.active.len() < u16::MAX as usize, MessageIdsExhaustedSnafu);

            let mut id = inner.next_message_id;
            while id == 0 || inner.active.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            inner.next_message_id = id.wrapping_add(1);
            inner.active.insert(id, reply_tx);
            id
        };

        Ok(PendingCommand {
            message_id,
            context,
            reply_rx,
            dispatcher: Arc::clone(self),
        })
    }

    /// Encode a message and send it under the given context,
    /// fragmenting as needed.
    pub(crate) fn send_message(&self, context_id: u8, message: &Message) -> Result<()> {
        let bytes = message.encode().map_err(|e| Error::EncodeCommand {
            source: Box::new(e),
        })?;
        self.send_fragments(context_id, PDataValueType::Command, &bytes)
    }

    /// Send an in-memory data set payload under the given context.
    pub(crate) fn send_payload(&self, context_id: u8, payload: &[u8]) -> Result<()> {
        self.send_fragments(context_id, PDataValueType::Data, payload)
    }

    /// Stream a data set payload from a reader under the given context,
    /// holding at most two fragments in memory at any time.
    ///
    /// Returns the number of payload bytes sent.
    pub(crate) fn send_payload_from(
        &self,
        context_id: u8,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        let max = self.max_fragment_len();
        let mut current = vec![0u8; max];
        let mut current_len = read_full(reader, &mut current).map_err(|e| Error::ReadPayload {
            source: e,
        })?;
        let mut total = 0u64;

        loop {
            let mut next = vec![0u8; max];
            let next_len = if current_len == max {
                read_full(reader, &mut next).map_err(|e| Error::ReadPayload { source: e })?
            } else {
                0
            };
            let is_last = next_len == 0;

            current.truncate(current_len);
            self.downcall(Downcall::SendPData(vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Data,
                is_last,
                data: current,
            }]))?;
            total += current_len as u64;

            if is_last {
                return Ok(total);
            }
            current = next;
            current_len = next_len;
        }
    }

    /// Initiate a graceful release of the association.
    pub(crate) fn release(&self) -> Result<()> {
        self.downcall(Downcall::Release)
    }

    /// Abort the association.
    pub(crate) fn abort(&self, source: AbortRqSource) -> Result<()> {
        self.downcall(Downcall::Abort(source))
    }

    /// Whether the association has ended, and how.
    pub fn closed_reason(&self) -> Option<ClosedReason> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    fn send_fragments(
        &self,
        context_id: u8,
        value_type: PDataValueType,
        bytes: &[u8],
    ) -> Result<()> {
        let max = self.max_fragment_len();

        if bytes.is_empty() {
            return self.downcall(Downcall::SendPData(vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }]));
        }

        let mut chunks = bytes.chunks(max).peekable();
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.downcall(Downcall::SendPData(vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last,
                data: chunk.to_vec(),
            }]))?;
        }
        Ok(())
    }

    fn max_fragment_len(&self) -> usize {
        let by_peer = self.peer_max_pdu_length.saturating_sub(PDV_HEADER_SIZE) as usize;
        by_peer.min(MAX_FRAGMENT_SIZE).max(1)
    }

    fn downcall(&self, downcall: Downcall) -> Result<()> {
        self.downcall_tx
            .send(downcall)
            .map_err(|_| DriverGoneSnafu.build())
    }

    fn forget(&self, message_id: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active.remove(&message_id);
    }

    /// Handle one upcall worth of P-DATA values.
    fn handle_data(self: &Arc<Self>, pdvs: Vec<PDataValue>, assembler: &mut CommandAssembler) {
        match assembler.feed(pdvs) {
            Ok(None) => {}
            Ok(Some(assembled)) => self.route(assembled),
            Err(e) => {
                warn!("{}: bad inbound fragment: {}", self.label, e);
                let _ = self.abort(AbortRqSource::ServiceProvider(
                    AbortRqServiceProviderReason::UnexpectedPdu,
                ));
            }
        }
    }

    fn route(self: &Arc<Self>, assembled: AssembledMessage) {
        let AssembledMessage {
            context_id,
            message,
            data,
        } = assembled;

        if message.is_response() {
            self.route_response(message, data);
            return;
        }

        let entry = match self.contexts.accepted_by_id(context_id) {
            Some(entry) => entry.clone(),
            None => {
                warn!(
                    "{}: message on unaccepted presentation context {}",
                    self.label, context_id
                );
                let _ = self.abort(AbortRqSource::ServiceProvider(
                    AbortRqServiceProviderReason::UnexpectedPdu,
                ));
                if let Some(data) = data {
                    let _ = data.ack();
                }
                return;
            }
        };

        match self.handlers.get(&message.command_field()).cloned() {
            Some(handler) => self.spawn_handler(handler, entry, message, data),
            None => {
                debug!(
                    "{}: no handler for command field {:#06X}",
                    self.label,
                    message.command_field()
                );
                if let Some(rsp) = error_response(
                    &message,
                    Status::with_comment(
                        status::UNRECOGNIZED_OPERATION,
                        "operation not supported by this node",
                    ),
                ) {
                    if let Err(e) = self.send_message(context_id, &rsp) {
                        warn!("{}: could not send error response: {}", self.label, e);
                    }
                }
                if let Some(data) = data {
                    let _ = data.ack();
                }
            }
        }
    }

    fn route_response(self: &Arc<Self>, message: Message, data: Option<DataSetHandle>) {
        let message_id = message.message_id();
        let terminal = message
            .status()
            .map(|status| !status.is_pending())
            .unwrap_or(true);

        let reply_tx = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if terminal {
                inner.active.remove(&message_id)
            } else {
                inner.active.get(&message_id).cloned()
            }
        };

        match reply_tx {
            Some(tx) => {
                // a gone waiter is not an error; it may have timed out
                let _ = tx.send(Reply { message, data });
            }
            None => {
                warn!(
                    "{}: response for unknown message ID {}",
                    self.label, message_id
                );
                let _ = self.abort(AbortRqSource::ServiceProvider(
                    AbortRqServiceProviderReason::UnexpectedPdu,
                ));
                if let Some(data) = data {
                    let _ = data.ack();
                }
            }
        }
    }

    fn spawn_handler(
        self: &Arc<Self>,
        handler: Arc<HandlerFn>,
        context: ContextEntry,
        message: Message,
        data: Option<DataSetHandle>,
    ) {
        let dispatcher = Arc::clone(self);
        let request = message.clone();
        let context_id = context.id;
        let handle = CommandHandle {
            context,
            dispatcher: Arc::clone(self),
        };

        let spawned = std::thread::Builder::new()
            .name("dicom-dimse-handler".to_string())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(message, data, handle)));
                if outcome.is_err() {
                    warn!("handler for {:#06X} panicked", request.command_field());
                    if let Some(rsp) = error_response(
                        &request,
                        Status::with_comment(status::PROCESSING_FAILURE, "handler failure"),
                    ) {
                        let _ = dispatcher.send_message(context_id, &rsp);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("{}: could not spawn handler thread: {}", self.label, e);
        }
    }

    /// Mark the dispatcher closed and fail every in-flight command.
    pub(crate) fn shutdown(&self, reason: ClosedReason) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed.is_none() {
            inner.closed = Some(reason);
        }
        // dropping the reply senders wakes up every waiter
        inner.active.clear();
    }
}

/// An in-flight outgoing command:
/// owns the message ID and the channel its responses arrive on.
///
/// Dropping the value forgets the command.
pub struct PendingCommand {
    message_id: u16,
    context: ContextEntry,
    reply_rx: Receiver<Reply>,
    dispatcher: Arc<Dispatcher>,
}

impl PendingCommand {
    /// The allocated message ID.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// The presentation context this command runs under.
    pub fn context(&self) -> &ContextEntry {
        &self.context
    }

    /// Send the command message.
    pub(crate) fn send_command(&self, message: &Message) -> Result<()> {
        self.dispatcher.send_message(self.context.id, message)
    }

    /// Send the accompanying data set from a byte slice.
    pub(crate) fn send_payload(&self, payload: &[u8]) -> Result<()> {
        self.dispatcher.send_payload(self.context.id, payload)
    }

    /// Stream the accompanying data set from a reader.
    pub(crate) fn send_payload_from(&self, reader: &mut dyn Read) -> Result<u64> {
        self.dispatcher.send_payload_from(self.context.id, reader)
    }

    /// Wait for the next response to this command.
    pub(crate) fn recv(&self, timeout: Option<Duration>) -> Result<Reply> {
        match timeout {
            Some(timeout) => match self.reply_rx.recv_timeout(timeout) {
                Ok(reply) => Ok(reply),
                Err(RecvTimeoutError::Timeout) => ResponseTimeoutSnafu.fail(),
                Err(RecvTimeoutError::Disconnected) => self.closed_error(),
            },
            None => match self.reply_rx.recv() {
                Ok(reply) => Ok(reply),
                Err(_) => self.closed_error(),
            },
        }
    }

    fn closed_error(&self) -> Result<Reply> {
        let reason = self
            .dispatcher
            .closed_reason()
            .unwrap_or(ClosedReason::Aborted(AbortReason::TransportFailure));
        ClosedSnafu { reason }.fail()
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        self.dispatcher.forget(self.message_id);
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("message_id", &self.message_id)
            .field("context", &self.context.id)
            .finish()
    }
}

/// A handle given to inbound request handlers
/// for sending their responses.
pub struct CommandHandle {
    pub(crate) context: ContextEntry,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl CommandHandle {
    /// The presentation context the request arrived under.
    pub fn context(&self) -> &ContextEntry {
        &self.context
    }

    /// Send a response message with no data set.
    pub fn send_response(&self, message: &Message) -> Result<()> {
        self.dispatcher.send_message(self.context.id, message)
    }

    /// Send a response message followed by its data set payload.
    pub fn send_response_with_payload(&self, message: &Message, payload: &[u8]) -> Result<()> {
        self.dispatcher.send_message(self.context.id, message)?;
        self.dispatcher.send_payload(self.context.id, payload)
    }
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("context", &self.context.id)
            .finish()
    }
}

/// Consume upcall events until the association ends,
/// then fail whatever is still in flight.
pub(crate) fn run_upcall_loop(
    dispatcher: &Arc<Dispatcher>,
    upcall_rx: Receiver<UpcallEvent>,
    spool_threshold: usize,
    lifecycle_tx: Option<SyncSender<ClosedReason>>,
) {
    let mut assembler = CommandAssembler::new(spool_threshold);
    let notify = |reason: ClosedReason| {
        if let Some(tx) = &lifecycle_tx {
            let _ = tx.try_send(reason);
        }
    };

    for event in upcall_rx.iter() {
        match event {
            UpcallEvent::Data(pdvs) => dispatcher.handle_data(pdvs, &mut assembler),
            UpcallEvent::Released => {
                debug!("association released");
                dispatcher.shutdown(ClosedReason::Released);
                notify(ClosedReason::Released);
            }
            UpcallEvent::Aborted(reason) => {
                debug!("association aborted: {:?}", reason);
                dispatcher.shutdown(ClosedReason::Aborted(reason));
                notify(ClosedReason::Aborted(reason));
            }
        }
    }

    // the driver is gone; if no reason was recorded, it was a failure
    dispatcher.shutdown(ClosedReason::Aborted(AbortReason::TransportFailure));
}

fn read_full(reader: &mut dyn Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dispatcher() -> (Arc<Dispatcher>, Receiver<Downcall>) {
        let (downcall_tx, downcall_rx) = std::sync::mpsc::sync_channel(64);
        let contexts = Arc::new(
            ContextManager::from_negotiated(&[crate::pdu::PresentationContextNegotiated {
                id: 1,
                reason: crate::pdu::PresentationContextResultReason::Acceptance,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            }])
            .unwrap(),
        );
        let dispatcher = Dispatcher::new("test", downcall_tx, 16384, contexts, HashMap::new());
        (dispatcher, downcall_rx)
    }

    fn entry(dispatcher: &Arc<Dispatcher>) -> ContextEntry {
        dispatcher.contexts().accepted_by_id(1).unwrap().clone()
    }

    #[test]
    fn message_ids_are_distinct_among_active_commands() {
        let (dispatcher, _rx) = test_dispatcher();
        let a = dispatcher.new_command(entry(&dispatcher)).unwrap();
        let b = dispatcher.new_command(entry(&dispatcher)).unwrap();
        let c = dispatcher.new_command(entry(&dispatcher)).unwrap();
        assert_ne!(a.message_id(), b.message_id());
        assert_ne!(b.message_id(), c.message_id());
        assert_ne!(a.message_id(), c.message_id());
    }

    #[test]
    fn message_id_allocation_skips_live_ids() {
        let (dispatcher, _rx) = test_dispatcher();

        let first = dispatcher.new_command(entry(&dispatcher)).unwrap();
        assert_eq!(first.message_id(), 1);

        // force the counter to wrap just before the live ID
        {
            let mut inner = dispatcher.inner.lock().unwrap();
            inner.next_message_id = u16::MAX;
        }
        let second = dispatcher.new_command(entry(&dispatcher)).unwrap();
        assert_eq!(second.message_id(), u16::MAX);
        // the wrap skips 0 and the still-live ID 1
        let third = dispatcher.new_command(entry(&dispatcher)).unwrap();
        assert_eq!(third.message_id(), 2);
    }

    #[test]
    fn dropping_a_command_frees_its_id() {
        let (dispatcher, _rx) = test_dispatcher();
        let first = dispatcher.new_command(entry(&dispatcher)).unwrap();
        let id = first.message_id();
        drop(first);
        {
            let mut inner = dispatcher.inner.lock().unwrap();
            inner.next_message_id = id;
        }
        let second = dispatcher.new_command(entry(&dispatcher)).unwrap();
        assert_eq!(second.message_id(), id);
    }

    #[test]
    fn commands_fail_after_shutdown() {
        let (dispatcher, _rx) = test_dispatcher();
        let pending = dispatcher.new_command(entry(&dispatcher)).unwrap();
        dispatcher.shutdown(ClosedReason::Released);

        // the in-flight command is woken with the close reason
        let err = pending.recv(Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(
            err,
            Error::Closed {
                reason: ClosedReason::Released
            }
        ));

        // and no new command can be created
        let err = dispatcher.new_command(entry(&dispatcher)).unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }

    #[test]
    fn fragments_split_at_the_negotiated_boundary() {
        let (dispatcher, rx) = test_dispatcher();
        let max_data = dispatcher.max_fragment_len();

        // payload of exactly the maximum must not be split
        dispatcher
            .send_payload(1, &vec![0xAA; max_data])
            .unwrap();
        match rx.try_recv().unwrap() {
            Downcall::SendPData(pdvs) => {
                assert_eq!(pdvs.len(), 1);
                assert!(pdvs[0].is_last);
                assert_eq!(pdvs[0].data.len(), max_data);
            }
            other => panic!("unexpected downcall {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        // one byte more gets split in two
        dispatcher
            .send_payload(1, &vec![0xBB; max_data + 1])
            .unwrap();
        let first = match rx.try_recv().unwrap() {
            Downcall::SendPData(pdvs) => pdvs,
            other => panic!("unexpected downcall {:?}", other),
        };
        assert!(!first[0].is_last);
        assert_eq!(first[0].data.len(), max_data);
        let second = match rx.try_recv().unwrap() {
            Downcall::SendPData(pdvs) => pdvs,
            other => panic!("unexpected downcall {:?}", other),
        };
        assert!(second[0].is_last);
        assert_eq!(second[0].data.len(), 1);
    }

    #[test]
    fn empty_payload_is_a_single_empty_last_fragment() {
        let (dispatcher, rx) = test_dispatcher();
        dispatcher.send_payload(1, &[]).unwrap();
        match rx.try_recv().unwrap() {
            Downcall::SendPData(pdvs) => {
                assert!(pdvs[0].is_last);
                assert!(pdvs[0].data.is_empty());
            }
            other => panic!("unexpected downcall {:?}", other),
        }
    }

    #[test]
    fn streamed_payload_matches_sliced_payload() {
        let (dispatcher, rx) = test_dispatcher();
        let max_data = dispatcher.max_fragment_len();
        let payload: Vec<u8> = (0..(max_data * 2 + 10)).map(|i| i as u8).collect();

        let sent = dispatcher
            .send_payload_from(1, &mut &payload[..])
            .unwrap();
        assert_eq!(sent, payload.len() as u64);

        let mut reassembled = Vec::new();
        let mut saw_last = false;
        while let Ok(Downcall::SendPData(pdvs)) = rx.try_recv() {
            assert!(!saw_last);
            for pdv in pdvs {
                saw_last = pdv.is_last;
                reassembled.extend_from_slice(&pdv.data);
            }
        }
        assert!(saw_last);
        assert_eq!(reassembled, payload);
    }
}
