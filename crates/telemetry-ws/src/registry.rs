//! Lock-free registry mapping live command ids to their subscribers.
//!
//! Ids come from a counter that is never reset, so an id retired by
//! `unsubscribe` or by a reconnect is never handed out again. Only the engine
//! task mutates the map; client handles read it for diagnostics.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    command::{CommandId, Envelope},
    subscriber::{SubscriberEntry, SubscriberId},
};

/// Registry value: which subscriber owns the id, and which of its commands it tags.
struct LiveCommand {
    entry: Arc<SubscriberEntry>,
    index: usize,
}

/// Store of live `id → subscriber` mappings for the current epoch.
pub struct SubscriberRegistry {
    live: scc::HashMap<CommandId, LiveCommand>,
    last_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            live: scc::HashMap::new(),
            last_id: AtomicU64::new(0),
        }
    }

    /// Allocate the next command id. Starts at 1; 0 is reserved for auth.
    pub fn next_id(&self) -> CommandId {
        CommandId(self.last_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Map `id` to the `index`-th command of `entry`.
    ///
    /// Returns `false` if the id is already mapped (which fresh ids never are).
    pub(crate) fn insert(&self, id: CommandId, entry: &Arc<SubscriberEntry>, index: usize) -> bool {
        let value = LiveCommand {
            entry: Arc::clone(entry),
            index,
        };
        self.live.insert_sync(id, value).is_ok()
    }

    /// Resolve the subscriber owning a live id.
    pub(crate) fn lookup(&self, id: CommandId) -> Option<Arc<SubscriberEntry>> {
        self.live.update_sync(&id, |_, live| Arc::clone(&live.entry))
    }

    /// Retire every id owned by `subscriber`.
    ///
    /// Returns the matching unsubscribe envelope for each retired id, in
    /// allocation order.
    pub(crate) fn retire_subscriber(&self, subscriber: SubscriberId) -> Vec<Envelope> {
        let mut retired = Vec::new();
        self.live.retain_sync(|id, live| {
            if live.entry.id != subscriber {
                return true;
            }
            if let Some(command) = live.entry.subscriber.commands.get(live.index) {
                retired.push(command.unsubscribe_envelope(*id));
            }
            false
        });
        retired.sort_by_key(Envelope::cmd_id);
        retired
    }

    /// Retire all ids, returning each owning subscriber once.
    ///
    /// Subscribers are ordered by their lowest live id, i.e. registration order.
    pub(crate) fn drain_subscribers(&self) -> Vec<Arc<SubscriberEntry>> {
        let mut drained = Vec::new();
        self.live.retain_sync(|id, live| {
            drained.push((*id, Arc::clone(&live.entry)));
            false
        });
        drained.sort_by_key(|(id, _)| *id);

        let mut seen = Vec::new();
        let mut subscribers = Vec::new();
        for (_, entry) in drained {
            if !seen.contains(&entry.id) {
                seen.push(entry.id);
                subscribers.push(entry);
            }
        }
        subscribers
    }

    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Check if no ids are live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Command, EntityRef},
        subscriber::Subscriber,
    };

    fn entry(commands: usize) -> Arc<SubscriberEntry> {
        let cmds = (0..commands)
            .map(|i| Command::timeseries(EntityRef::device(format!("d{i}")), &["t"]));
        SubscriberEntry::new(Subscriber::new(cmds))
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let registry = SubscriberRegistry::new();
        assert_eq!(registry.next_id(), CommandId(1));
        assert_eq!(registry.next_id(), CommandId(2));
        assert_eq!(registry.next_id(), CommandId(3));
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = SubscriberRegistry::new();
        let a = entry(1);
        let id = registry.next_id();

        assert!(registry.insert(id, &a, 0));
        assert!(!registry.insert(id, &a, 0));
        assert_eq!(registry.lookup(id).map(|e| e.id), Some(a.id));
        assert!(registry.lookup(CommandId(99)).is_none());
    }

    #[test]
    fn test_retire_subscriber_only_touches_its_ids() {
        let registry = SubscriberRegistry::new();
        let a = entry(2);
        let b = entry(1);

        for index in 0..2 {
            let id = registry.next_id();
            registry.insert(id, &a, index);
        }
        let b_id = registry.next_id();
        registry.insert(b_id, &b, 0);

        let retired = registry.retire_subscriber(a.id);
        let ids: Vec<_> = retired.iter().map(Envelope::cmd_id).collect();
        assert_eq!(ids, vec![CommandId(1), CommandId(2)]);
        assert!(retired.iter().all(Envelope::is_unsubscribe));
        assert_eq!(
            retired[1].to_value()["entityId"],
            serde_json::Value::from("d1")
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(b_id).map(|e| e.id), Some(b.id));
        assert!(registry.lookup(CommandId(1)).is_none());
        assert!(registry.lookup(CommandId(2)).is_none());
    }

    #[test]
    fn test_drain_dedupes_in_registration_order() {
        let registry = SubscriberRegistry::new();
        let a = entry(2);
        let b = entry(2);

        for (sub, index) in [(&a, 0), (&b, 0), (&a, 1), (&b, 1)] {
            let id = registry.next_id();
            registry.insert(id, sub, index);
        }

        let drained = registry.drain_subscribers();
        let ids: Vec<_> = drained.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(registry.is_empty());

        // The counter keeps advancing across epochs.
        assert_eq!(registry.next_id(), CommandId(5));
    }
}
