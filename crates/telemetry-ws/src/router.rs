//! Inbound message decoding and routing.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    command::CommandId,
    registry::SubscriberRegistry,
    subscriber::SubscriberEntry,
    transport::WsMessage,
};

/// One decoded inbound update.
///
/// Which payload field is populated depends on the subscription kind:
/// `data` for attributes and time series, `update`/`data` for query results,
/// `count` for counters, `notifications`/`totalUnreadCount` for the
/// notification feed. Fields this type does not model are kept in `extra`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub subscription_id: Option<CommandId>,
    pub cmd_id: Option<CommandId>,
    pub error_code: Option<i64>,
    pub error_msg: Option<String>,
    /// Present on query-result updates; selects the update callback.
    pub cmd_update_type: Option<String>,
    pub data: Option<Value>,
    pub latest_values: Option<Value>,
    pub update: Option<Value>,
    pub count: Option<i64>,
    pub total_unread_count: Option<i64>,
    pub notifications: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundMessage {
    /// Parse one JSON text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Whether this is a query-result update rather than a plain push.
    pub fn is_update(&self) -> bool {
        self.cmd_update_type.is_some()
    }

    /// Candidate correlation ids, `subscriptionId` first.
    pub fn correlation_ids(&self) -> impl Iterator<Item = CommandId> + '_ {
        self.subscription_id.into_iter().chain(self.cmd_id)
    }
}

/// What the router did with a frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Delivered to a subscriber's data callback.
    Data,
    /// Delivered to a subscriber's update callback.
    Update,
    /// Unknown, retired or missing correlation id.
    Unmatched,
    /// Undecodable or oversized frame.
    Malformed,
    /// A critical in-band error code; the connection must be recycled.
    Critical { code: i64, message: Option<String> },
}

/// Decodes frames and hands them to the owning subscriber.
pub(crate) struct MessageRouter {
    critical_codes: Vec<i64>,
    max_message_size: usize,
}

impl MessageRouter {
    pub(crate) fn new(critical_codes: Vec<i64>, max_message_size: usize) -> Self {
        Self {
            critical_codes,
            max_message_size,
        }
    }

    /// Decode a frame. Oversized and malformed frames are logged and dropped.
    pub(crate) fn decode(&self, frame: WsMessage) -> Option<InboundMessage> {
        let size = frame.len();
        if self.max_message_size > 0 && size > self.max_message_size {
            warn!(
                size,
                max = self.max_message_size,
                "Dropping oversized WebSocket message"
            );
            return None;
        }

        let text = match frame.into_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Dropping non-UTF-8 frame");
                return None;
            }
        };

        match InboundMessage::parse(&text) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "Dropping malformed frame");
                None
            }
        }
    }

    fn critical_code(&self, message: &InboundMessage) -> Option<i64> {
        message
            .error_code
            .filter(|code| self.critical_codes.contains(code))
    }

    /// Route one frame to its subscriber.
    ///
    /// Subscriber callbacks run synchronously on the caller's task.
    pub(crate) fn route(&self, registry: &SubscriberRegistry, frame: WsMessage) -> Routed {
        let Some(message) = self.decode(frame) else {
            return Routed::Malformed;
        };

        if let Some(code) = self.critical_code(&message) {
            return Routed::Critical {
                code,
                message: message.error_msg,
            };
        }

        let Some((cmd_id, entry)) = resolve(registry, &message) else {
            debug!(
                subscription_id = ?message.subscription_id,
                cmd_id = ?message.cmd_id,
                "Dropping message for unknown command id"
            );
            return Routed::Unmatched;
        };

        if message.is_update() {
            debug!(%cmd_id, subscriber = %entry.id, "Dispatching update");
            entry.subscriber.deliver_update(&message);
            Routed::Update
        } else {
            entry.subscriber.deliver_data(&message);
            Routed::Data
        }
    }
}

fn resolve(
    registry: &SubscriberRegistry,
    message: &InboundMessage,
) -> Option<(CommandId, Arc<SubscriberEntry>)> {
    message
        .correlation_ids()
        .find_map(|id| registry.lookup(id).map(|entry| (id, entry)))
}
