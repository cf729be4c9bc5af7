//! Handler for the HTTP CONNECT method.
//!
//! Installed once the target connection is already established. Writes
//! the positive response to the client and hands both sockets to the
//! data-transfer handler.

use crate::context::HandlerContext;
use crate::handler::{remove_reason_for_io_error, Completion, ConnectionHandler, RemoveReason};
use crate::limiter::TrafficLimiter;
use crate::transfer::DataTransferHandler;
use crate::RequestInfo;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Serves the CONNECT method for one connection.
pub struct ConnectMethodHandler {
    /// Client side of the connection.
    user_end: TcpStream,

    /// Already-connected socket to the target.
    target_end: TcpStream,

    /// `host:port` of the target, for logs.
    connection_target: String,

    /// Traffic limiter, handed on to the data-transfer handler.
    limiter: Arc<dyn TrafficLimiter>,

    /// Pre-formatted positive response for the client.
    positive_response: &'static [u8],

    /// When this handler was created; bounds the response write.
    created_at: Instant,
}

impl ConnectMethodHandler {
    pub fn new(
        user_end: TcpStream,
        target_end: TcpStream,
        request: &RequestInfo,
        limiter: Arc<dyn TrafficLimiter>,
        positive_response: &'static [u8],
    ) -> Self {
        Self {
            user_end,
            target_end,
            connection_target: request.to_string(),
            limiter,
            positive_response,
            created_at: Instant::now(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for ConnectMethodHandler {
    fn name(&self) -> &'static str {
        "http-connect-method-handler"
    }

    async fn serve(mut self: Box<Self>, ctx: &HandlerContext) -> crate::Result<Completion> {
        info!(
            connection = ctx.id,
            "serving-request=CONNECT {}", self.connection_target
        );

        let deadline = self.created_at + ctx.config.idle_connection_timeout;
        let write = timeout_at(deadline, self.user_end.write_all(self.positive_response));
        match write.await {
            Ok(Ok(())) => {
                // The client has its tunnel; switch to plain relaying.
                let Self {
                    user_end,
                    target_end,
                    limiter,
                    ..
                } = *self;
                let next = DataTransferHandler::new(user_end, target_end, limiter, &ctx.config)?;
                Ok(Completion::ReplaceWith(Box::new(next)))
            }
            Ok(Err(e)) => {
                debug!(
                    connection = ctx.id,
                    error = %e,
                    "error writing positive response to CONNECT method"
                );
                Ok(Completion::Remove(remove_reason_for_io_error(&e)))
            }
            Err(_elapsed) => {
                warn!(
                    connection = ctx.id,
                    "timeout writing positive response to CONNECT method"
                );
                Ok(Completion::Remove(RemoveReason::NoActivityForTooLong))
            }
        }
    }
}
