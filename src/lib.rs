//! Uplink - resilient duplex messaging client for the game gateway
//!
//! Maintains one logical WebSocket connection to the remote game/analysis
//! service, reconnecting with exponential backoff, queueing outbound
//! messages while disconnected, and fanning parsed server frames out to any
//! number of independent listeners.
//!
//! ## Guarantees
//!
//! - No outbound message is silently dropped by a transient disconnect;
//!   queued frames flush FIFO on the next successful open
//! - Transport failures never surface to callers; only an explicit
//!   `disconnect()` stops the reconnect policy
//! - A malformed inbound frame or a panicking listener affects neither the
//!   connection nor the other listeners

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::{Subscription, UplinkClient};
pub use config::ClientConfig;
pub use error::{Result, UplinkError};
pub use protocol::{OutboundMessage, PurchaseReport, ResponseFrame, ServerMessage};
