//! Subscriber sets keyed by source address and message type.
//!
//! The same index shape is used on both ends of the fabric: a post office
//! resolves subscriber addresses to local mailboxes (or its central-bound
//! proxy) at delivery time, the central post office resolves them to
//! destination post offices. Keys are
//! `"<srcPO>.<srcMailbox>.<major>[.<minor>]"`.

use std::collections::{HashMap, HashSet};

use crate::address::Address;

/// Idempotent map of subscription key to subscriber addresses.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    entries: HashMap<String, HashSet<Address>>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index key for a source address and type.
    pub fn key(source: &Address, msg_type: &str) -> String {
        format!("{source}.{msg_type}")
    }

    /// Split a key back into its source address and type remainder.
    ///
    /// Returns `None` for keys that do not start with a well-formed
    /// address.
    pub fn split_key(key: &str) -> Option<(Address, String)> {
        let mut parts = key.splitn(3, '.');
        let po = parts.next()?;
        let mailbox = parts.next()?;
        let msg_type = parts.next()?;
        let source = Address::new(po, mailbox).ok()?;
        (!msg_type.is_empty()).then(|| (source, msg_type.to_string()))
    }

    /// Add `subscriber` under `key`. Returns `true` if it was not already
    /// present.
    pub fn subscribe(&mut self, key: &str, subscriber: Address) -> bool {
        self.entries.entry(key.to_string()).or_default().insert(subscriber)
    }

    /// Remove `subscriber` from `key`. Returns `true` if it was present.
    /// Empty sets are cleaned up.
    pub fn unsubscribe(&mut self, key: &str, subscriber: &Address) -> bool {
        let Some(set) = self.entries.get_mut(key) else {
            return false;
        };
        let removed = set.remove(subscriber);
        if set.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    /// Whether `subscriber` is registered under `key`.
    pub fn is_subscribed(&self, key: &str, subscriber: &Address) -> bool {
        self.entries.get(key).is_some_and(|s| s.contains(subscriber))
    }

    /// Subscribers for a publish from `from` with type `msg_type`.
    ///
    /// Probes the full `major.minor` key and the major-only key and unions
    /// the two sets, so subscribers to either granularity are served.
    pub fn subscribers_for_publish(&self, from: &str, msg_type: &str) -> HashSet<Address> {
        let mut out = HashSet::new();
        let full = format!("{from}.{msg_type}");
        if let Some(set) = self.entries.get(&full) {
            out.extend(set.iter().cloned());
        }
        if let Some((major, _)) = msg_type.rsplit_once('.') {
            let major_key = format!("{from}.{major}");
            if let Some(set) = self.entries.get(&major_key) {
                out.extend(set.iter().cloned());
            }
        }
        out
    }

    /// Iterate all `(key, subscribers)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &HashSet<Address>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate entries whose key starts with `prefix`.
    pub fn entries_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a HashSet<Address>)> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys with at least one subscriber.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no subscriptions at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> Address {
        text.parse().unwrap()
    }

    #[test]
    fn key_construction() {
        let key = SubscriptionIndex::key(&addr("alpha.io"), "sensor.temperature");
        assert_eq!(key, "alpha.io.sensor.temperature");
    }

    #[test]
    fn split_key_recovers_source_and_type() {
        let (source, msg_type) =
            SubscriptionIndex::split_key("alpha.io.sensor.temperature").unwrap();
        assert_eq!(source, addr("alpha.io"));
        assert_eq!(msg_type, "sensor.temperature");

        assert!(SubscriptionIndex::split_key("alpha.io").is_none());
        assert!(SubscriptionIndex::split_key("alpha").is_none());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut index = SubscriptionIndex::new();
        assert!(index.subscribe("alpha.io.sensor", addr("beta.io")));
        assert!(!index.subscribe("alpha.io.sensor", addr("beta.io")));
        assert_eq!(index.len(), 1);

        assert!(index.unsubscribe("alpha.io.sensor", &addr("beta.io")));
        assert!(!index.unsubscribe("alpha.io.sensor", &addr("beta.io")));
        assert!(index.is_empty());
    }

    #[test]
    fn unsubscribe_cleans_up_empty_sets() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("alpha.io.sensor", addr("beta.io"));
        index.unsubscribe("alpha.io.sensor", &addr("beta.io"));
        assert_eq!(index.entries().count(), 0);
    }

    #[test]
    fn publish_lookup_unions_both_granularities() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("alpha.io.sensor", addr("beta.io"));
        index.subscribe("alpha.io.sensor.temperature", addr("gamma.io"));
        index.subscribe("alpha.io.sensor.temperature", addr("beta.io"));

        let subs = index.subscribers_for_publish("alpha.io", "sensor.temperature");
        assert_eq!(subs.len(), 2);
        assert!(subs.contains(&addr("beta.io")));
        assert!(subs.contains(&addr("gamma.io")));

        // A single-segment type probes only one key.
        let subs = index.subscribers_for_publish("alpha.io", "sensor");
        assert_eq!(subs.len(), 1);
        assert!(subs.contains(&addr("beta.io")));
    }

    #[test]
    fn publish_lookup_on_unknown_key_is_empty() {
        let index = SubscriptionIndex::new();
        assert!(index.subscribers_for_publish("alpha.io", "sensor").is_empty());
    }

    #[test]
    fn prefix_iteration() {
        let mut index = SubscriptionIndex::new();
        index.subscribe("alpha.io.sensor", addr("beta.io"));
        index.subscribe("alphabet.io.sensor", addr("beta.io"));
        index.subscribe("alpha.log.event", addr("gamma.io"));

        let keys: Vec<&str> =
            index.entries_with_prefix("alpha.").map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"alpha.io.sensor"));
        assert!(keys.contains(&"alpha.log.event"));
    }
}
