//! The message handler contract.
//!
//! A fresh handler is built per inbound packet by a [`HandlerFactory`]. The
//! [`MessageProcessor`](crate::MessageProcessor) drives it through
//! `prepare → process → (suspend → resume)* → cleanup`. Every step reports an
//! [`Outcome`]; panics are caught by the processor and never reach the
//! connection.

use std::sync::Arc;

use crate::connection::Connection;
use crate::packet::{MessageId, Packet};
use crate::result::Outcome;

/// Per-message processing logic.
///
/// Only [`req_msg_id`](Self::req_msg_id) and [`process`](Self::process) are
/// required; every other step defaults to a no-op that succeeds.
pub trait MessageHandler: Send {
    /// Message id this handler processes.
    fn req_msg_id(&self) -> MessageId;

    /// Identity pushed into the tracing span around every step.
    fn log_info(&self) -> String {
        format!("handler {}", self.req_msg_id())
    }

    /// Validate and capture what `process` needs from the packet.
    fn prepare(&mut self, packet: &Packet) -> Outcome {
        let _ = packet;
        Outcome::Ok
    }

    /// Do the work. Call [`HandlerContext::suspend`] to wait for a follow-up
    /// packet carrying the same correlation id.
    fn process(&mut self, ctx: &mut HandlerContext<'_>) -> Outcome;

    /// Continue a suspended handler with a follow-up packet.
    ///
    /// Returning [`Outcome::NotComplete`] keeps the handler waiting.
    fn process_resume(&mut self, packet: &Packet) -> Outcome {
        let _ = packet;
        Outcome::Ok
    }

    /// Release handler-specific state.
    fn cleanup(&mut self) {}

    /// Runs after [`cleanup`](Self::cleanup).
    fn after_cleanup(&mut self) {}

    /// Final resource release.
    fn dispose(&mut self) {}
}

/// Builds a fresh handler for one inbound packet.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn MessageHandler> + Send + Sync>;

/// Lifecycle of a handler parked in the correlation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the first follow-up packet.
    Suspended,
    /// A follow-up arrived; the next one resumes the handler.
    Resumable,
}

/// Request to park the running handler.
pub(crate) struct Suspension {
    pub(crate) processor: Option<Box<dyn MessageHandler>>,
}

/// What a handler sees while [`MessageHandler::process`] runs.
pub struct HandlerContext<'a> {
    packet: &'a Packet,
    suspension: Option<Suspension>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(packet: &'a Packet) -> Self {
        Self {
            packet,
            suspension: None,
        }
    }

    /// The packet being processed.
    pub fn packet(&self) -> &Packet {
        self.packet
    }

    /// The connection the packet arrived on.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.packet.connection()
    }

    /// Correlation id the handler would be parked under.
    pub fn correlation_id(&self) -> String {
        self.packet.correlation_id()
    }

    /// Park this handler under the packet's correlation id once `process`
    /// returns. The processor registers it in the same step, so the handler
    /// can never be left suspended but unregistered.
    pub fn suspend(&mut self) {
        self.suspension = Some(Suspension { processor: None });
    }

    /// Like [`suspend`](Self::suspend), and let `processor` handle the first
    /// follow-up packet before the handler itself is resumed.
    pub fn suspend_with(&mut self, processor: Box<dyn MessageHandler>) {
        self.suspension = Some(Suspension {
            processor: Some(processor),
        });
    }

    /// Whether [`suspend`](Self::suspend) was requested.
    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    pub(crate) fn into_suspension(self) -> Option<Suspension> {
        self.suspension
    }
}
