//! Handler execution engine.
//!
//! [`MessageProcessor::process`] runs one inbound packet:
//!
//! 1. Claim the packet's correlation id in the [`CorrelationRegistry`].
//! 2. Nothing parked → build a fresh handler and run
//!    `prepare → process → cleanup`, parking it instead of cleaning up when it
//!    suspends.
//! 3. A suspended handler is promoted to resumable by the first follow-up
//!    packet, which is handled by the attached suspend processor (or a fresh
//!    handler of its own type). The next follow-up resumes the handler itself.
//! 4. A follow-up for an id that is busy, or any follow-up delivered by a
//!    server socket while the id is parked, is a duplicate request and is
//!    answered with a not-complete notice.
//!
//! Every step runs inside a tracing span carrying the handler's log info and
//! behind a panic boundary; a panic becomes [`Outcome::ExceptionOccurred`],
//! is logged on the `exception` target, and ends that handler only.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::correlation::{Claim, CorrelationRegistry, SuspendedEntry};
use crate::dispatcher::MessageReceiver;
use crate::handler::{HandlerContext, HandlerFactory, HandlerState, MessageHandler, Suspension};
use crate::notices::{NOTIFY_NOT_COMPLETE, NotifyNotComplete};
use crate::packet::{MessageId, NotifierKind, Packet, PacketHeader};
use crate::result::Outcome;

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// Runs handlers of one message type against inbound packets.
pub struct MessageProcessor {
    message_id: MessageId,
    factory: HandlerFactory,
    registry: Arc<CorrelationRegistry>,
}

impl MessageProcessor {
    /// Create a processor. The factory is probed once to learn its message id.
    pub fn new(factory: HandlerFactory, registry: Arc<CorrelationRegistry>) -> Self {
        let message_id = factory().req_msg_id();
        Self {
            message_id,
            factory,
            registry,
        }
    }

    /// Message id served by this processor's handlers.
    pub fn message_handler_id(&self) -> MessageId {
        self.message_id
    }

    /// Process one inbound packet.
    pub fn process(&self, packet: Packet) {
        let guid = packet.correlation_id();
        tracing::debug!("PROCESS {guid} {}", packet.message_id());

        let from_authority = packet.is_notifier_kind(NotifierKind::ServerSocket);
        match self.registry.claim(&guid, from_authority) {
            Claim::Fresh => {
                let handler = (self.factory)();
                match run_handler(handler, &packet) {
                    Some((handler, suspension)) => {
                        tracing::debug!("[{guid}] {} suspended", packet.message_id());
                        self.registry
                            .park(&guid, SuspendedEntry::new(handler, suspension.processor));
                    }
                    None => self.registry.release(&guid),
                }
            }
            Claim::Occupied => {
                tracing::debug!(
                    "{} / {guid} is processing. not completed.",
                    packet.message_id()
                );
                notify_not_complete(&packet);
            }
            Claim::Parked(entry) => self.resolve_parked(&guid, entry, &packet),
        }
    }

    fn resolve_parked(&self, guid: &str, mut entry: SuspendedEntry, packet: &Packet) {
        match entry.state {
            HandlerState::Suspended => {
                tracing::debug!(
                    "[{guid}] {} handler suspended -> resumable",
                    packet.message_id()
                );
                entry.state = HandlerState::Resumable;
                let follow_up = entry.processor.take().unwrap_or_else(|| (self.factory)());
                if let Some((nested, _)) = run_handler(follow_up, packet) {
                    tracing::error!(
                        "[{guid}] {} suspended again while its correlation id is parked",
                        nested.req_msg_id()
                    );
                    safe_cleanup(nested);
                }
                self.registry.park(guid, entry);
            }
            HandlerState::Resumable => {
                tracing::debug!("[{guid}] handler resumable, resume {}", packet.message_id());
                let outcome = safe_resume(entry.handler.as_mut(), packet);
                if outcome.is_not_complete() {
                    tracing::info!("[{guid}] resumable not complete {}", packet.message_id());
                    self.registry.park(guid, entry);
                    return;
                }
                self.registry.release(guid);
                safe_cleanup(entry.handler);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handler steps
// ---------------------------------------------------------------------------

/// Run a fresh handler. Returns the handler back when it suspended.
fn run_handler(
    mut handler: Box<dyn MessageHandler>,
    packet: &Packet,
) -> Option<(Box<dyn MessageHandler>, Suspension)> {
    let outcome = safe_prepare(handler.as_mut(), packet);
    if outcome.is_fail() {
        if !outcome.is_exception() {
            tracing::warn!("{} prepare failed: {outcome}", packet.message_id());
        }
        safe_cleanup(handler);
        return None;
    }
    if outcome.is_already_processed() {
        safe_cleanup(handler);
        return None;
    }

    let mut ctx = HandlerContext::new(packet);
    let outcome = safe_process(handler.as_mut(), &mut ctx);
    if outcome.is_fail() {
        if !outcome.is_exception() {
            tracing::warn!("{} process failed: {outcome}", packet.message_id());
        }
        safe_cleanup(handler);
        return None;
    }

    match ctx.into_suspension() {
        Some(suspension) => Some((handler, suspension)),
        None => {
            safe_cleanup(handler);
            None
        }
    }
}

fn safe_prepare(handler: &mut dyn MessageHandler, packet: &Packet) -> Outcome {
    let info = handler.log_info();
    let _span = tracing::info_span!("handler", info = %info).entered();
    guarded("prepare", handler.req_msg_id(), &info, || handler.prepare(packet))
}

fn safe_process(handler: &mut dyn MessageHandler, ctx: &mut HandlerContext<'_>) -> Outcome {
    let info = handler.log_info();
    let _span = tracing::info_span!("handler", info = %info).entered();
    tracing::debug!("process {}", ctx.packet().message_id());
    guarded("process", handler.req_msg_id(), &info, || handler.process(ctx))
}

fn safe_resume(handler: &mut dyn MessageHandler, packet: &Packet) -> Outcome {
    let info = handler.log_info();
    let _span = tracing::info_span!("handler", info = %info).entered();
    guarded("resume", handler.req_msg_id(), &info, || {
        handler.process_resume(packet)
    })
}

/// Run cleanup, after-cleanup, and dispose, then drop the handler.
pub(crate) fn safe_cleanup(mut handler: Box<dyn MessageHandler>) {
    let info = handler.log_info();
    let id = handler.req_msg_id();
    let _span = tracing::info_span!("handler", info = %info).entered();
    guarded("cleanup", id, &info, || {
        handler.cleanup();
        handler.after_cleanup();
        handler.dispose();
        Outcome::Ok
    });
}

fn guarded(step: &str, id: MessageId, info: &str, f: impl FnOnce() -> Outcome) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let detail = panic_message(payload.as_ref());
            tracing::error!(
                target: "exception",
                "HANDLER EXCEPTION {step}: message {id}, {info}: {detail}"
            );
            Outcome::ExceptionOccurred(detail)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Tell the sender of a duplicate request that it is still in progress.
fn notify_not_complete(packet: &Packet) {
    tracing::warn!("notify not complete: {}", packet.message_id());

    let Some(connection) = packet.connection() else {
        tracing::warn!(
            "no connection to answer {} for {}",
            packet.message_id(),
            packet.correlation_id()
        );
        return;
    };

    let notice = NotifyNotComplete {
        guid: packet.correlation_id(),
        outcome: Outcome::NotComplete,
    };
    let mut header = PacketHeader::new(NOTIFY_NOT_COMPLETE);
    header.auth_id = packet.header.auth_id;
    header.session_id = packet.header.session_id;
    header.relay_session_id = packet.header.relay_session_id;

    if let Err(e) = connection.relay_message(NOTIFY_NOT_COMPLETE, &notice, Some(&header)) {
        tracing::error!("failed to encode not-complete notice: {e}");
    }
}

// ---------------------------------------------------------------------------
// HandlerTable
// ---------------------------------------------------------------------------

/// Message id → processor table, built once at startup.
pub struct HandlerTable {
    registry: Arc<CorrelationRegistry>,
    processors: HashMap<MessageId, Arc<MessageProcessor>>,
}

impl HandlerTable {
    /// Create an empty table whose processors share `registry`.
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            registry,
            processors: HashMap::new(),
        }
    }

    /// Register a handler factory, returning the message id it serves.
    pub fn register<F>(&mut self, factory: F) -> MessageId
    where
        F: Fn() -> Box<dyn MessageHandler> + Send + Sync + 'static,
    {
        let processor = MessageProcessor::new(Arc::new(factory), Arc::clone(&self.registry));
        let id = processor.message_handler_id();
        if self.processors.insert(id, Arc::new(processor)).is_some() {
            tracing::warn!("handler for {id} registered twice, keeping the latest");
        }
        id
    }

    /// Processor serving `id`.
    pub fn processor(&self, id: MessageId) -> Option<&Arc<MessageProcessor>> {
        self.processors.get(&id)
    }

    /// Every registered message id.
    pub fn message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.processors.keys()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Bind every processor into `receiver`.
    pub fn bind(&self, receiver: &MessageReceiver) {
        for (id, processor) in &self.processors {
            let processor = Arc::clone(processor);
            receiver.register_handler(*id, move |packet| processor.process(packet));
        }
    }

    /// A direct receiver with every processor bound.
    pub fn into_receiver(self, name: &str) -> Arc<MessageReceiver> {
        let receiver = MessageReceiver::direct(name);
        self.bind(&receiver);
        Arc::new(receiver)
    }
}

// ---------------------------------------------------------------------------
// Suspended-handler expiry
// ---------------------------------------------------------------------------

/// Clean up handlers parked longer than `ttl`. Returns how many expired.
pub fn expire_suspended(registry: &CorrelationRegistry, ttl: Duration) -> usize {
    let expired = registry.take_expired(ttl);
    let count = expired.len();
    for (guid, entry) in expired {
        tracing::warn!(
            "[{guid}] {} suspended longer than {ttl:?}, cleaning up",
            entry.handler.req_msg_id()
        );
        if let Some(processor) = entry.processor {
            safe_cleanup(processor);
        }
        safe_cleanup(entry.handler);
    }
    count
}

/// Periodically expire parked handlers until `shutdown` flips to `true`.
pub fn spawn_registry_sweeper(
    registry: Arc<CorrelationRegistry>,
    ttl: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    expire_suspended(&registry, ttl);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
