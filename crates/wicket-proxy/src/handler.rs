//! The connection handler contract and the harness that drives it.
//!
//! A connection is served by a chain of handlers, one at a time. Each
//! handler owns the sockets and phase-specific state, runs until it
//! decides the connection's fate, and either hands everything to a
//! successor ([`Completion::ReplaceWith`]) or tears the connection down
//! ([`Completion::Remove`]).
//!
//! `serve(self: Box<Self>, ..)` consumes the handler, so a handler that
//! has removed itself is gone by construction — no late completion can
//! observe it. Failures a handler does not map to a removal reason
//! itself bubble up as `Err` and are recovered here, in one place.

use crate::context::HandlerContext;
use async_trait::async_trait;
use std::io;
use tracing::{debug, trace, warn};

/// Why a connection was removed. Closed set; the `Display` form is the
/// operator-facing label used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// A peer closed its side; the relay drained normally.
    NormalCompletion,
    /// The in-flight operation was cancelled by local teardown.
    CurrentOperationCanceled,
    /// Read or write failure on one of the sockets.
    IoError,
    /// Nothing was read for longer than the idle timeout.
    NoActivityForTooLong,
    /// A state the handler does not support (e.g. both relay directions
    /// already dead while the handler is still installed).
    UnexpectedAndUnsupportedCase,
    /// The handler returned an error the harness had to recover.
    UnhandledException,
}

impl std::fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RemoveReason::NormalCompletion => "normal_completion",
            RemoveReason::CurrentOperationCanceled => "current_operation_canceled",
            RemoveReason::IoError => "io_error",
            RemoveReason::NoActivityForTooLong => "no_activity_for_too_long",
            RemoveReason::UnexpectedAndUnsupportedCase => "unexpected_and_unsupported_case",
            RemoveReason::UnhandledException => "unhandled_exception",
        };
        f.write_str(label)
    }
}

/// Terminal event of one handler's `serve`.
pub enum Completion {
    /// Install the successor in this connection's slot. The outgoing
    /// handler has moved its sockets and limiter into the successor.
    ReplaceWith(Box<dyn ConnectionHandler>),
    /// Close the connection.
    Remove(RemoveReason),
}

/// One phase of a connection's lifetime.
#[async_trait]
pub trait ConnectionHandler: Send {
    /// Short diagnostic label.
    fn name(&self) -> &'static str;

    /// Drive this phase to its terminal event.
    ///
    /// Runs from installation until the handler replaces or removes
    /// itself. Owned sockets close when the handler (or its successor
    /// chain) is dropped.
    async fn serve(self: Box<Self>, ctx: &HandlerContext) -> crate::Result<Completion>;
}

/// Drive a connection's handler chain to completion.
///
/// Installs `handler`, runs it, follows replacements, and returns the
/// final removal reason. An `Err` from a handler is logged and mapped to
/// [`RemoveReason::UnhandledException`]; no failure escapes to other
/// connections.
pub async fn serve_connection(
    ctx: &HandlerContext,
    mut handler: Box<dyn ConnectionHandler>,
) -> RemoveReason {
    loop {
        let name = handler.name();
        trace!(connection = ctx.id, handler = name, "handler installed");
        match handler.serve(ctx).await {
            Ok(Completion::ReplaceWith(next)) => {
                trace!(
                    connection = ctx.id,
                    from = name,
                    to = next.name(),
                    "handler replaced"
                );
                handler = next;
            }
            Ok(Completion::Remove(reason)) => {
                debug!(connection = ctx.id, handler = name, %reason, "connection removed");
                return reason;
            }
            Err(e) => {
                warn!(
                    connection = ctx.id,
                    handler = name,
                    error = %e,
                    "connection removed after unexpected failure"
                );
                return RemoveReason::UnhandledException;
            }
        }
    }
}

/// Map an I/O failure on an established socket to its removal reason.
///
/// `ConnectionAborted` means the operation was torn down under us and is
/// reported as a cancellation; everything else is an I/O error.
pub(crate) fn remove_reason_for_io_error(e: &io::Error) -> RemoveReason {
    match e.kind() {
        io::ErrorKind::ConnectionAborted => RemoveReason::CurrentOperationCanceled,
        _ => RemoveReason::IoError,
    }
}
