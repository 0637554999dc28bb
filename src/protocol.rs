//! Wire protocol for the game gateway
//!
//! JSON text frames over the duplex connection. Outbound messages are the
//! `purchase` and `user_action` events emitted by the game state layer;
//! inbound frames are server `response` notifications consumed by toast
//! renderers and other listeners.
//!
//! The server keys purchases by a small integer id; the game state layer
//! works with stable string ids. The translation table lives here, with a
//! defined fallback for identifiers the server does not know yet.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Server item id used for identifiers missing from the lookup table.
pub const DEFAULT_SERVER_ITEM_ID: u32 = 8;

/// Translate a stable string item identifier to the server's numeric id.
///
/// Unrecognized identifiers map to [`DEFAULT_SERVER_ITEM_ID`] rather than
/// failing; the original string still travels in `original_item_id`.
pub fn server_item_id(item_id: &str) -> u32 {
    match item_id {
        "multiplier" => 0,
        "factory" => 1,
        "bonus" => 2,
        "display-upgrade" => 3,
        "leaderboard" => 4,
        "leaderboard-upgrade" => 5,
        "button-upgrade" => 6,
        "penguin" => 7,
        "skeleton" => 8,
        "stage-indicator" => 9,
        "ai-panel" => 10,
        "rocket" => 11,
        _ => DEFAULT_SERVER_ITEM_ID,
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Purchase details reported by the shop layer.
///
/// Everything except the item id is optional; the gateway tolerates sparse
/// payloads. `current_level`/`next_level` are nullable on the wire, so they
/// serialize as `null` when absent instead of being dropped.
#[derive(Debug, Clone, Default)]
pub struct PurchaseReport {
    pub item_id: String,
    pub item_name: Option<String>,
    pub price_paid: Option<f64>,
    pub click_count: Option<u64>,
    pub stage: Option<u32>,
    pub click_multiplier: Option<f64>,
    pub current_level: Option<u32>,
    pub next_level: Option<u32>,
    pub repeatable: Option<bool>,
}

impl PurchaseReport {
    /// Create a report for the given item
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            ..Self::default()
        }
    }

    /// Set the display name
    pub fn with_item_name(mut self, name: impl Into<String>) -> Self {
        self.item_name = Some(name.into());
        self
    }

    /// Set the price paid
    pub fn with_price_paid(mut self, price: f64) -> Self {
        self.price_paid = Some(price);
        self
    }

    /// Set the click count at purchase time
    pub fn with_click_count(mut self, clicks: u64) -> Self {
        self.click_count = Some(clicks);
        self
    }

    /// Set the stage at purchase time
    pub fn with_stage(mut self, stage: u32) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Set the click multiplier in effect
    pub fn with_click_multiplier(mut self, multiplier: f64) -> Self {
        self.click_multiplier = Some(multiplier);
        self
    }

    /// Set the level transition for leveled items
    pub fn with_levels(mut self, current: Option<u32>, next: Option<u32>) -> Self {
        self.current_level = current;
        self.next_level = next;
        self
    }

    /// Mark the item as repeatable
    pub fn with_repeatable(mut self, repeatable: bool) -> Self {
        self.repeatable = Some(repeatable);
        self
    }
}

/// Outbound message, tagged by `type` on the wire.
///
/// Immutable once constructed; the client serializes it at the `send` call
/// site so the outbound queue holds text, not live objects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Purchase {
        item_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        price_paid: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        click_count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        click_multiplier: Option<f64>,
        current_level: Option<u32>,
        next_level: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repeatable: Option<bool>,
        original_item_id: String,
        timestamp: i64,
    },
    UserAction {
        stage: u32,
        clicks: u64,
        timestamp: i64,
    },
}

impl OutboundMessage {
    /// Build a `purchase` event from a shop report, stamped with the current
    /// unix time and the translated server item id.
    pub fn purchase(report: PurchaseReport) -> Self {
        Self::Purchase {
            item_id: server_item_id(&report.item_id),
            item_name: report.item_name,
            price_paid: report.price_paid,
            click_count: report.click_count,
            stage: report.stage,
            click_multiplier: report.click_multiplier,
            current_level: report.current_level,
            next_level: report.next_level,
            repeatable: report.repeatable,
            original_item_id: report.item_id,
            timestamp: unix_now(),
        }
    }

    /// Build a `user_action` event stamped with the current unix time.
    pub fn user_action(stage: u32, clicks: u64) -> Self {
        Self::UserAction {
            stage,
            clicks,
            timestamp: unix_now(),
        }
    }
}

/// Parsed inbound frame.
///
/// Known server message kinds get a typed variant; anything else (unknown or
/// missing `type`, or a `response` whose fields do not match the expected
/// shapes) is preserved as [`ServerMessage::Unrecognized`] so listeners can
/// still inspect it. Only frames that are not valid JSON are dropped.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(ResponseFrame),
    Unrecognized(Value),
}

impl ServerMessage {
    /// Parse a raw text frame.
    ///
    /// # Errors
    /// Returns an error only when the frame is not valid JSON.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(value))
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("response") => match serde_json::from_value::<ResponseFrame>(value.clone()) {
                Ok(frame) => ServerMessage::Response(frame),
                Err(_) => ServerMessage::Unrecognized(value),
            },
            _ => ServerMessage::Unrecognized(value),
        }
    }
}

/// A server `response` notification.
///
/// The payload shape is not strictly enforced by the server: current builds
/// nest `state`/`message` under `data`, older ones put them at the top
/// level. The accessors check both.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ResponseFrame {
    /// Game state tag carried by the response, if any.
    pub fn state(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("state"))
            .and_then(Value::as_str)
            .or(self.state.as_deref())
    }

    /// Human-readable message carried by the response, if any.
    pub fn message(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .or(self.message.as_deref())
    }
}
