//! Subscription commands and their wire envelopes.
//!
//! A [`Command`] describes what a subscriber wants (kind, target entity,
//! kind-specific fields). The engine tags it with a [`CommandId`] to produce
//! an [`Envelope`], the object that travels inside a `{"cmds": [...]}` frame.
//! Every subscribable kind has a paired unsubscribe envelope:
//!
//! | kind                                   | unsubscribe envelope                        |
//! |----------------------------------------|---------------------------------------------|
//! | `ATTRIBUTES`, `TIMESERIES`             | same kind, `"unsubscribe": true`            |
//! | `ENTITY_DATA`                          | `ENTITY_DATA_UNSUBSCRIBE`                   |
//! | `ENTITY_COUNT`                         | `ENTITY_COUNT_UNSUBSCRIBE`                  |
//! | `ALARM_DATA`                           | `ALARM_DATA_UNSUBSCRIBE`                    |
//! | `ALARM_COUNT`                          | `ALARM_COUNT_UNSUBSCRIBE`                   |
//! | `NOTIFICATIONS`, `NOTIFICATIONS_COUNT` | `NOTIFICATIONS_UNSUBSCRIBE`                 |
//! | anything else                          | `ENTITY_DATA_UNSUBSCRIBE`                   |

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Scope used by latest-value time-series subscriptions.
const LATEST_TELEMETRY_SCOPE: &str = "LATEST_TELEMETRY";

/// Identifier assigned to a command for the lifetime of one subscription epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl CommandId {
    /// Id carried by the authentication frame; never handed to a subscriber.
    pub const AUTH: CommandId = CommandId(0);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminator selecting the subscription protocol of a command.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CommandKind {
    Attributes,
    Timeseries,
    EntityData,
    EntityCount,
    AlarmData,
    AlarmCount,
    Notifications,
    NotificationsCount,
    MarkNotificationsAsRead,
    MarkAllNotificationsAsRead,
    EntityDataUnsubscribe,
    EntityCountUnsubscribe,
    AlarmDataUnsubscribe,
    AlarmCountUnsubscribe,
    NotificationsUnsubscribe,
    /// A kind this crate has no dedicated knowledge of, sent verbatim.
    Other(String),
}

/// How a subscription of a given kind is cancelled on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnsubscribeForm {
    /// Re-send the original kind with `"unsubscribe": true`.
    Flag(CommandKind),
    /// Send a distinct `*_UNSUBSCRIBE` kind.
    Dedicated(CommandKind),
}

impl CommandKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Attributes => "ATTRIBUTES",
            Self::Timeseries => "TIMESERIES",
            Self::EntityData => "ENTITY_DATA",
            Self::EntityCount => "ENTITY_COUNT",
            Self::AlarmData => "ALARM_DATA",
            Self::AlarmCount => "ALARM_COUNT",
            Self::Notifications => "NOTIFICATIONS",
            Self::NotificationsCount => "NOTIFICATIONS_COUNT",
            Self::MarkNotificationsAsRead => "MARK_NOTIFICATIONS_AS_READ",
            Self::MarkAllNotificationsAsRead => "MARK_ALL_NOTIFICATIONS_AS_READ",
            Self::EntityDataUnsubscribe => "ENTITY_DATA_UNSUBSCRIBE",
            Self::EntityCountUnsubscribe => "ENTITY_COUNT_UNSUBSCRIBE",
            Self::AlarmDataUnsubscribe => "ALARM_DATA_UNSUBSCRIBE",
            Self::AlarmCountUnsubscribe => "ALARM_COUNT_UNSUBSCRIBE",
            Self::NotificationsUnsubscribe => "NOTIFICATIONS_UNSUBSCRIBE",
            Self::Other(name) => name,
        }
    }

    /// Parse a wire name; unknown names become [`CommandKind::Other`].
    pub fn parse(name: &str) -> Self {
        match name {
            "ATTRIBUTES" => Self::Attributes,
            "TIMESERIES" => Self::Timeseries,
            "ENTITY_DATA" => Self::EntityData,
            "ENTITY_COUNT" => Self::EntityCount,
            "ALARM_DATA" => Self::AlarmData,
            "ALARM_COUNT" => Self::AlarmCount,
            "NOTIFICATIONS" => Self::Notifications,
            "NOTIFICATIONS_COUNT" => Self::NotificationsCount,
            "MARK_NOTIFICATIONS_AS_READ" => Self::MarkNotificationsAsRead,
            "MARK_ALL_NOTIFICATIONS_AS_READ" => Self::MarkAllNotificationsAsRead,
            "ENTITY_DATA_UNSUBSCRIBE" => Self::EntityDataUnsubscribe,
            "ENTITY_COUNT_UNSUBSCRIBE" => Self::EntityCountUnsubscribe,
            "ALARM_DATA_UNSUBSCRIBE" => Self::AlarmDataUnsubscribe,
            "ALARM_COUNT_UNSUBSCRIBE" => Self::AlarmCountUnsubscribe,
            "NOTIFICATIONS_UNSUBSCRIBE" => Self::NotificationsUnsubscribe,
            other => Self::Other(other.to_string()),
        }
    }

    /// The unsubscribe envelope shape paired with this kind.
    ///
    /// Kinds without a known counterpart fall back to `ENTITY_DATA_UNSUBSCRIBE`.
    pub fn unsubscribe_form(&self) -> UnsubscribeForm {
        match self {
            Self::Attributes | Self::Timeseries => UnsubscribeForm::Flag(self.clone()),
            Self::EntityData => UnsubscribeForm::Dedicated(Self::EntityDataUnsubscribe),
            Self::EntityCount => UnsubscribeForm::Dedicated(Self::EntityCountUnsubscribe),
            Self::AlarmData => UnsubscribeForm::Dedicated(Self::AlarmDataUnsubscribe),
            Self::AlarmCount => UnsubscribeForm::Dedicated(Self::AlarmCountUnsubscribe),
            Self::Notifications | Self::NotificationsCount => {
                UnsubscribeForm::Dedicated(Self::NotificationsUnsubscribe)
            }
            _ => UnsubscribeForm::Dedicated(Self::EntityDataUnsubscribe),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// Entity a command is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn device(entity_id: impl Into<String>) -> Self {
        Self::new("DEVICE", entity_id)
    }

    pub fn asset(entity_id: impl Into<String>) -> Self {
        Self::new("ASSET", entity_id)
    }
}

/// Immutable description of one subscription intent.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    kind: Option<CommandKind>,
    target: Option<EntityRef>,
    fields: Map<String, Value>,
}

impl Command {
    /// Create a command of the given kind with no target or fields.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind: Some(kind),
            target: None,
            fields: Map::new(),
        }
    }

    /// Create a command without an explicit kind.
    ///
    /// Kept for older callers; see [`Envelope::normalized`] for how the kind
    /// is inferred at send time.
    pub fn untyped() -> Self {
        Self {
            kind: None,
            target: None,
            fields: Map::new(),
        }
    }

    /// Latest time-series values for `keys` of an entity.
    pub fn timeseries<S: AsRef<str>>(target: EntityRef, keys: &[S]) -> Self {
        Self::new(CommandKind::Timeseries)
            .target(target)
            .field("keys", join_keys(keys))
            .field("scope", LATEST_TELEMETRY_SCOPE)
    }

    /// Attribute values for `keys` in `scope` (e.g. `SERVER_SCOPE`) of an entity.
    pub fn attributes<S: AsRef<str>>(target: EntityRef, scope: &str, keys: &[S]) -> Self {
        Self::new(CommandKind::Attributes)
            .target(target)
            .field("keys", join_keys(keys))
            .field("scope", scope)
    }

    /// Entity-data query subscription.
    pub fn entity_data(query: Value) -> Self {
        Self::new(CommandKind::EntityData).field("query", query)
    }

    /// Entity-count query subscription.
    pub fn entity_count(query: Value) -> Self {
        Self::new(CommandKind::EntityCount).field("query", query)
    }

    /// Alarm-data query subscription.
    pub fn alarm_data(query: Value) -> Self {
        Self::new(CommandKind::AlarmData).field("query", query)
    }

    /// Alarm-count query subscription.
    pub fn alarm_count(query: Value) -> Self {
        Self::new(CommandKind::AlarmCount).field("query", query)
    }

    /// Notification feed limited to the `limit` most recent entries.
    pub fn notifications(limit: u32) -> Self {
        Self::new(CommandKind::Notifications).field("limit", limit)
    }

    /// Unread notification counter.
    pub fn notifications_count() -> Self {
        Self::new(CommandKind::NotificationsCount)
    }

    /// One-way command marking the given notifications as read.
    pub fn mark_notifications_as_read<S: AsRef<str>>(ids: &[S]) -> Self {
        let ids: Vec<Value> = ids.iter().map(|id| Value::from(id.as_ref())).collect();
        Self::new(CommandKind::MarkNotificationsAsRead).field("notifications", ids)
    }

    /// One-way command marking every notification as read.
    pub fn mark_all_notifications_as_read() -> Self {
        Self::new(CommandKind::MarkAllNotificationsAsRead)
    }

    /// Scope the command to an entity.
    #[must_use]
    pub fn target(mut self, target: EntityRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Add a kind-specific field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn kind(&self) -> Option<&CommandKind> {
        self.kind.as_ref()
    }

    pub fn entity(&self) -> Option<&EntityRef> {
        self.target.as_ref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Tag this command with an id, producing its subscribe envelope.
    pub fn envelope(&self, cmd_id: CommandId) -> Envelope {
        Envelope {
            cmd_id,
            kind: self.kind.clone(),
            target: self.target.clone(),
            fields: self.fields.clone(),
            unsubscribe: false,
        }
    }

    /// Build the unsubscribe envelope paired with this command under `cmd_id`.
    pub fn unsubscribe_envelope(&self, cmd_id: CommandId) -> Envelope {
        let kind = self
            .kind
            .clone()
            .or_else(|| self.inferred_kind())
            .map(|kind| kind.unsubscribe_form())
            .unwrap_or(UnsubscribeForm::Dedicated(CommandKind::EntityDataUnsubscribe));

        match kind {
            UnsubscribeForm::Flag(kind) => Envelope {
                cmd_id,
                kind: Some(kind),
                target: self.target.clone(),
                fields: Map::new(),
                unsubscribe: true,
            },
            UnsubscribeForm::Dedicated(kind) => Envelope {
                cmd_id,
                kind: Some(kind),
                target: None,
                fields: Map::new(),
                unsubscribe: false,
            },
        }
    }

    /// Legacy kind inference: `keys` together with `scope` means time series.
    fn inferred_kind(&self) -> Option<CommandKind> {
        (self.fields.contains_key("keys") && self.fields.contains_key("scope"))
            .then_some(CommandKind::Timeseries)
    }
}

fn join_keys<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",")
}

/// One id-tagged command as it appears on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    cmd_id: CommandId,
    kind: Option<CommandKind>,
    target: Option<EntityRef>,
    fields: Map<String, Value>,
    unsubscribe: bool,
}

impl Envelope {
    pub fn cmd_id(&self) -> CommandId {
        self.cmd_id
    }

    pub fn kind(&self) -> Option<&CommandKind> {
        self.kind.as_ref()
    }

    pub fn is_unsubscribe(&self) -> bool {
        self.unsubscribe
            || matches!(
                self.kind,
                Some(
                    CommandKind::EntityDataUnsubscribe
                        | CommandKind::EntityCountUnsubscribe
                        | CommandKind::AlarmDataUnsubscribe
                        | CommandKind::AlarmCountUnsubscribe
                        | CommandKind::NotificationsUnsubscribe
                )
            )
    }

    /// Fill in a missing kind for older callers.
    ///
    /// Compatibility shim, not protocol behaviour: a kind-less envelope that
    /// carries both `keys` and `scope` is sent as `TIMESERIES`. Anything else
    /// is left untouched.
    pub fn normalized(mut self) -> Self {
        if self.kind.is_none()
            && self.fields.contains_key("keys")
            && self.fields.contains_key("scope")
        {
            self.kind = Some(CommandKind::Timeseries);
        }
        self
    }

    /// Flatten into the JSON object sent to the server.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        if let Some(target) = &self.target {
            object.insert("entityType".to_string(), Value::from(target.entity_type.as_str()));
            object.insert("entityId".to_string(), Value::from(target.entity_id.as_str()));
        }
        object.insert("cmdId".to_string(), Value::from(self.cmd_id.0));
        if let Some(kind) = &self.kind {
            object.insert("type".to_string(), Value::from(kind.as_str()));
        }
        if self.unsubscribe {
            object.insert("unsubscribe".to_string(), Value::Bool(true));
        }
        Value::Object(object)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
