//! Uplink client handle
//!
//! The caller-facing half of the messaging channel. One [`UplinkClient`] is
//! created at application startup and injected wherever state changes need
//! reporting; the connection actor it spawns owns the transport handle for
//! the life of the process.
//!
//! Every method is synchronous, never blocks on network I/O, and never
//! surfaces a connection error to the caller — failures degrade to "message
//! delayed until reconnect".
//!
//! # Usage
//!
//! ```ignore
//! let client = UplinkClient::new(ClientConfig::from_env())?;
//!
//! // Toast layer: render server responses
//! let subscription = client.subscribe(|message| {
//!     if let ServerMessage::Response(frame) = message {
//!         show_toast(frame.state(), frame.message());
//!     }
//! });
//!
//! // Game state layer: report activity
//! client.send_user_action(stage, clicks);
//! client.send_purchase(PurchaseReport::new("factory").with_price_paid(350.0));
//! ```

mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{OutboundMessage, PurchaseReport, ServerMessage};
use task::{ClientTask, Command};

pub use task::Listener;

/// Handle to the messaging channel.
///
/// Cloneable; all clones drive the same logical connection. The connection is
/// established lazily on first use (`send`, `subscribe`, or `connect`). When
/// the last clone is dropped the connection actor shuts down.
#[derive(Clone)]
pub struct UplinkClient {
    commands: mpsc::UnboundedSender<Command>,
    next_listener_id: Arc<AtomicU64>,
}

impl UplinkClient {
    /// Create a client and spawn its connection actor.
    ///
    /// Must be called within a tokio runtime. No connection is attempted
    /// until the client is first used.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid (for example a
    /// non-WebSocket endpoint, which would otherwise retry-loop forever).
    /// Once constructed, no method of the client ever fails toward the
    /// caller.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(ClientTask::new(config, rx).run());
        Ok(Self {
            commands,
            next_listener_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Establish the connection if not already connecting or open.
    ///
    /// Idempotent; a construction failure schedules a reconnect instead of
    /// surfacing to the caller.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Tear down the connection and cancel any pending reconnect.
    ///
    /// Queued outbound messages are retained; the client stays quiescent
    /// until `send`, `subscribe`, or `connect` is invoked again.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Register a listener for every parsed inbound frame.
    ///
    /// Implicitly triggers `connect()`. Listeners are invoked synchronously
    /// in registration order; a panic in one listener does not affect the
    /// others. The listener stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn subscribe(&self, listener: impl Fn(&ServerMessage) + Send + 'static) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.command(Command::Subscribe(id, Box::new(listener)));
        Subscription {
            id,
            commands: self.commands.clone(),
            active: true,
        }
    }

    /// Serialize and send a message.
    ///
    /// Transmitted immediately when the connection is open, otherwise queued
    /// (FIFO, unbounded) and the connection is triggered. Never blocks,
    /// never fails toward the caller.
    pub fn send(&self, message: &OutboundMessage) {
        match serde_json::to_string(message) {
            Ok(frame) => self.command(Command::Send(frame)),
            Err(e) => error!(error = %e, "failed to serialize outbound message"),
        }
    }

    /// Report a purchase to the gateway.
    pub fn send_purchase(&self, report: PurchaseReport) {
        self.send(&OutboundMessage::purchase(report));
    }

    /// Report accumulated clicks for a stage to the gateway.
    pub fn send_user_action(&self, stage: u32, clicks: u64) {
        self.send(&OutboundMessage::user_action(stage, clicks));
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("uplink task gone, command dropped");
        }
    }
}

/// Registration handle returned by [`UplinkClient::subscribe`].
///
/// Deregisters its listener on [`unsubscribe`](Self::unsubscribe) or drop.
/// A removal that lands while a frame is being dispatched takes effect for
/// the next frame; delivery already in flight to other listeners is not
/// affected.
pub struct Subscription {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl Subscription {
    /// Remove the listener. Idempotent; further calls are no-ops.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.commands.send(Command::Unsubscribe(self.id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
