//! Connection actor
//!
//! Owns the transport handle exclusively and runs the connection state
//! machine: `Idle` (no handle, possibly a pending reconnect timer),
//! `Connecting` (handshake in flight), `Open` (frames moving). Each phase is
//! one method; transport events and caller commands both feed the same loop,
//! so no locking is needed around the queue or the listener set.
//!
//! Failure policy: construction failures and mid-connection errors take the
//! same path. Compute `min(base * 2^attempt, cap)`, bump the counter,
//! schedule exactly one timer. The counter resets on every successful open
//! and on an explicit disconnect, which is also the only way to stop
//! reconnecting.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::UplinkError;
use crate::protocol::ServerMessage;

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsConn, Message>;

/// Inbound message listener, invoked synchronously in registration order.
pub type Listener = Box<dyn Fn(&ServerMessage) + Send>;

/// Commands from the caller-facing handle.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(String),
    Subscribe(u64, Listener),
    Unsubscribe(u64),
}

/// Compute the reconnect delay for the given attempt number.
pub(crate) fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap)
}

enum Established {
    Opened(WsConn),
    Abandoned,
    Shutdown,
}

pub(crate) struct ClientTask {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Serialized frames awaiting transmission. Unbounded FIFO: entries leave
    /// only on successful send, never on connection failure. A cap would
    /// silently drop messages, so bounding is left to operators.
    queue: VecDeque<String>,
    listeners: Vec<(u64, Listener)>,
    attempt: u32,
    /// Pending reconnect timer deadline; at most one exists at a time.
    reconnect_at: Option<Instant>,
    connect_requested: bool,
}

impl ClientTask {
    pub(crate) fn new(config: ClientConfig, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            config,
            commands,
            queue: VecDeque::new(),
            listeners: Vec::new(),
            attempt: 0,
            reconnect_at: None,
            connect_requested: false,
        }
    }

    /// Run until every handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            if !self.idle().await {
                break;
            }
            self.connect_requested = false;
            // An explicit trigger consumes any pending timer
            self.reconnect_at = None;

            match self.establish().await {
                Established::Opened(ws) => {
                    if !self.drive(ws).await {
                        break;
                    }
                }
                Established::Abandoned => {}
                Established::Shutdown => break,
            }
        }
        debug!("uplink task stopped");
    }

    /// Idle phase: no transport handle. Wait for a command that wants a
    /// connection, or for the reconnect timer to fire.
    ///
    /// Returns false when the command channel is closed.
    async fn idle(&mut self) -> bool {
        enum Event {
            Timer,
            Cmd(Option<Command>),
        }

        loop {
            if self.connect_requested {
                return true;
            }
            let event = match self.reconnect_at {
                Some(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Event::Timer,
                    cmd = self.commands.recv() => Event::Cmd(cmd),
                },
                None => Event::Cmd(self.commands.recv().await),
            };
            match event {
                Event::Timer => {
                    self.reconnect_at = None;
                    self.connect_requested = true;
                }
                Event::Cmd(Some(cmd)) => self.on_idle_command(cmd),
                Event::Cmd(None) => return false,
            }
        }
    }

    fn on_idle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect_requested = true,
            Command::Disconnect => {
                self.reconnect_at = None;
                self.attempt = 0;
                self.connect_requested = false;
            }
            Command::Send(frame) => {
                self.queue.push_back(frame);
                self.connect_requested = true;
            }
            Command::Subscribe(id, listener) => {
                self.listeners.push((id, listener));
                self.connect_requested = true;
            }
            Command::Unsubscribe(id) => self.remove_listener(id),
        }
    }

    /// Connecting phase: one handshake in flight. Commands keep being
    /// serviced so sends queue up and a disconnect can abort the attempt
    /// (dropping the future tears down the half-open handle, keeping the
    /// one-handle invariant).
    async fn establish(&mut self) -> Established {
        enum Event {
            Opened(WsConn),
            Failed(tokio_tungstenite::tungstenite::Error),
            Cmd(Option<Command>),
        }

        info!(url = %self.config.url, "connecting to gateway");
        let connect = connect_async(self.config.url.clone());
        tokio::pin!(connect);

        loop {
            let event = tokio::select! {
                result = &mut connect => match result {
                    Ok((ws, _)) => Event::Opened(ws),
                    Err(e) => Event::Failed(e),
                },
                cmd = self.commands.recv() => Event::Cmd(cmd),
            };
            match event {
                Event::Opened(ws) => {
                    self.attempt = 0;
                    info!(url = %self.config.url, "connected to gateway");
                    return Established::Opened(ws);
                }
                Event::Failed(e) => {
                    warn!(error = %e, "gateway connection failed");
                    self.schedule_reconnect();
                    return Established::Abandoned;
                }
                Event::Cmd(None) => return Established::Shutdown,
                Event::Cmd(Some(Command::Disconnect)) => {
                    debug!("connection attempt aborted");
                    self.reconnect_at = None;
                    self.attempt = 0;
                    self.connect_requested = false;
                    return Established::Abandoned;
                }
                Event::Cmd(Some(Command::Connect)) => {} // already connecting
                Event::Cmd(Some(Command::Send(frame))) => self.queue.push_back(frame),
                Event::Cmd(Some(Command::Subscribe(id, listener))) => {
                    self.listeners.push((id, listener));
                }
                Event::Cmd(Some(Command::Unsubscribe(id))) => self.remove_listener(id),
            }
        }
    }

    /// Open phase: flush the queue, then shuttle frames until the transport
    /// dies, the caller disconnects, or every handle is dropped.
    ///
    /// Returns false when the command channel is closed.
    async fn drive(&mut self, ws: WsConn) -> bool {
        enum Event {
            Cmd(Option<Command>),
            Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        }

        let (mut sink, mut stream) = ws.split();

        // The queue is consulted before any new command can interleave, so
        // queued frames never reorder against direct sends.
        if let Err(e) = self.flush_queue(&mut sink).await {
            warn!(error = %e, queued = self.queue.len(), "queue flush interrupted");
            self.schedule_reconnect();
            return true;
        }

        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Cmd(cmd),
                frame = stream.next() => Event::Frame(frame),
            };
            match event {
                Event::Cmd(None) => {
                    let _ = sink.close().await;
                    return false;
                }
                Event::Cmd(Some(Command::Send(frame))) => {
                    if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                        // The queue is empty here (flushed before any direct
                        // send), so tail order is still FIFO.
                        warn!(error = %e, "send failed, frame queued for retry");
                        self.queue.push_back(frame);
                        self.schedule_reconnect();
                        return true;
                    }
                }
                Event::Cmd(Some(Command::Disconnect)) => {
                    let _ = sink.close().await;
                    self.reconnect_at = None;
                    self.attempt = 0;
                    self.connect_requested = false;
                    info!("disconnected from gateway");
                    return true;
                }
                Event::Cmd(Some(Command::Connect)) => {} // already open
                Event::Cmd(Some(Command::Subscribe(id, listener))) => {
                    self.listeners.push((id, listener));
                }
                Event::Cmd(Some(Command::Unsubscribe(id))) => self.remove_listener(id),
                Event::Frame(Some(Ok(Message::Text(raw)))) => self.dispatch(&raw),
                Event::Frame(Some(Ok(Message::Ping(payload)))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Event::Frame(Some(Ok(Message::Close(frame)))) => {
                    debug!(?frame, "gateway closed connection");
                    self.schedule_reconnect();
                    return true;
                }
                Event::Frame(Some(Ok(_))) => {} // binary/pong: not part of this protocol
                Event::Frame(Some(Err(e))) => {
                    warn!(error = %e, "transport error");
                    self.schedule_reconnect();
                    return true;
                }
                Event::Frame(None) => {
                    debug!("gateway stream ended");
                    self.schedule_reconnect();
                    return true;
                }
            }
        }
    }

    /// Flush queued frames head-to-tail, stopping at the first failure and
    /// leaving the unsent remainder (including the failed frame) in place.
    async fn flush_queue(&mut self, sink: &mut WsSink) -> crate::error::Result<()> {
        while let Some(frame) = self.queue.front().cloned() {
            sink.send(Message::Text(frame))
                .await
                .map_err(|e| UplinkError::WebSocket(e.to_string()))?;
            self.queue.pop_front();
        }
        Ok(())
    }

    /// Parse a raw frame and deliver it to every listener in registration
    /// order. A panicking listener is isolated; an unparseable frame is
    /// dropped without touching the connection.
    fn dispatch(&mut self, raw: &str) {
        let message = match ServerMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&message))).is_err() {
                error!(listener = *id, "listener panicked during dispatch");
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let delay = reconnect_delay(
            self.attempt,
            self.config.reconnect_base,
            self.config.reconnect_cap,
        );
        self.attempt += 1;
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn remove_listener(&mut self, id: u64) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(1000);
    const CAP: Duration = Duration::from_millis(10_000);

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(reconnect_delay(0, BASE, CAP), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(1, BASE, CAP), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(2, BASE, CAP), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(3, BASE, CAP), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_cap() {
        assert_eq!(reconnect_delay(4, BASE, CAP), CAP);
        assert_eq!(reconnect_delay(10, BASE, CAP), CAP);
        // Large attempt counts must not overflow
        assert_eq!(reconnect_delay(u32::MAX, BASE, CAP), CAP);
    }

    #[test]
    fn test_backoff_custom_tuning() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_millis(400);
        assert_eq!(reconnect_delay(0, base, cap), Duration::from_millis(50));
        assert_eq!(reconnect_delay(2, base, cap), Duration::from_millis(200));
        assert_eq!(reconnect_delay(5, base, cap), cap);
    }
}
