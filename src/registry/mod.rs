//! Channel subscription bookkeeping.
//!
//! [`SubscriptionRegistry`] is the broker's authoritative map of who listens
//! where. It is owned by a single routing task, so it needs no interior
//! locking. [`ChannelsRefCount`] is the flat per-channel counter used where
//! only interest matters, not identity (bridge sinks, upstream links).

use std::collections::HashMap;

use tracing::debug;

use crate::command::{ChannelCount, Peer};

/// Identifier of one broker-side connection.
pub type ConnId = u64;

/// Observer of channel presence transitions. `channel_added` fires when a
/// channel gains its first subscriber, `channel_removed` when it loses its
/// last one; never for intermediate refcount changes.
pub trait ChannelNotifier: Send {
    fn channel_added(&self, channel: &str);
    fn channel_removed(&self, channel: &str);
}

#[derive(Debug)]
struct Entry {
    peer: Peer,
    conn: ConnId,
    refcount: u32,
}

/// Refcounted channel → subscriber map.
///
/// A subscriber is identified by its peer id; subscribing the same peer to
/// the same channel again bumps a refcount rather than adding a duplicate, so
/// fan-out delivers once per peer regardless of how many listeners it
/// attached locally.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: HashMap<String, HashMap<String, Entry>>,
    notifier: Option<Box<dyn ChannelNotifier>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or clear) the presence-transition observer.
    pub fn set_notifier(&mut self, notifier: Option<Box<dyn ChannelNotifier>>) {
        self.notifier = notifier;
    }

    /// Add one subscription reference for `peer` on `channel`.
    pub fn add_ref(&mut self, channel: &str, peer: &Peer, conn: ConnId) {
        let newly_present = !self.channels.contains_key(channel);
        let entries = self.channels.entry(channel.to_string()).or_default();
        entries
            .entry(peer.id.clone())
            .and_modify(|e| e.refcount += 1)
            .or_insert_with(|| Entry {
                peer: peer.clone(),
                conn,
                refcount: 1,
            });
        if newly_present {
            debug!(channel = %channel, "channel gained first subscriber");
            if let Some(n) = &self.notifier {
                n.channel_added(channel);
            }
        }
    }

    /// Drop one subscription reference for `peer_id` on `channel`.
    pub fn release(&mut self, channel: &str, peer_id: &str) {
        let Some(entries) = self.channels.get_mut(channel) else {
            return;
        };
        if let Some(entry) = entries.get_mut(peer_id) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(peer_id);
            }
        }
        self.prune(channel);
    }

    /// Drop every reference `peer_id` holds on `channel`.
    pub fn release_all(&mut self, channel: &str, peer_id: &str) {
        if let Some(entries) = self.channels.get_mut(channel) {
            entries.remove(peer_id);
        }
        self.prune(channel);
    }

    /// Drop every reference held by `peer_id`, on any channel.
    pub fn remove_peer(&mut self, peer_id: &str) {
        let affected: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, entries)| entries.contains_key(peer_id))
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in affected {
            self.release_all(&channel, peer_id);
        }
    }

    /// Drop every reference held over connection `conn`. Used when a socket
    /// dies without saying goodbye.
    pub fn remove_connection(&mut self, conn: ConnId) {
        let affected: Vec<String> = self.channels.keys().cloned().collect();
        for channel in affected {
            if let Some(entries) = self.channels.get_mut(&channel) {
                entries.retain(|_, entry| entry.conn != conn);
            }
            self.prune(&channel);
        }
    }

    /// Whether `channel` has at least one subscriber.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// All channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Distinct connections subscribed to `channel`.
    pub fn connections_on(&self, channel: &str) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = self
            .channels
            .get(channel)
            .map(|entries| entries.values().map(|e| e.conn).collect())
            .unwrap_or_default();
        conns.sort_unstable();
        conns.dedup();
        conns
    }

    /// Subscriber counts per channel, for state queries.
    pub fn snapshot(&self) -> Vec<ChannelCount> {
        self.channels
            .iter()
            .map(|(channel, entries)| ChannelCount {
                channel: channel.clone(),
                refcount: entries.values().map(|e| e.refcount).sum(),
            })
            .collect()
    }

    /// Distinct peers across all channels.
    pub fn peers(&self) -> Vec<Peer> {
        let mut seen = HashMap::new();
        for entries in self.channels.values() {
            for entry in entries.values() {
                seen.entry(entry.peer.id.clone())
                    .or_insert_with(|| entry.peer.clone());
            }
        }
        seen.into_values().collect()
    }

    fn prune(&mut self, channel: &str) {
        let empty = self
            .channels
            .get(channel)
            .map(|entries| entries.is_empty())
            .unwrap_or(false);
        if empty {
            self.channels.remove(channel);
            debug!(channel = %channel, "channel lost last subscriber");
            if let Some(n) = &self.notifier {
                n.channel_removed(channel);
            }
        }
    }
}

/// Flat channel → refcount set. Tracks interest only, not who holds it.
#[derive(Debug, Default, Clone)]
pub struct ChannelsRefCount {
    counts: HashMap<String, u32>,
}

impl ChannelsRefCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference. Returns true on the 0→1 transition.
    pub fn add_ref(&mut self, channel: &str) -> bool {
        let count = self.counts.entry(channel.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Add one reference per channel in `channels`.
    pub fn add_refs<I, S>(&mut self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for channel in channels {
            self.add_ref(channel.as_ref());
        }
    }

    /// Drop one reference. Returns true on the 1→0 transition.
    pub fn release(&mut self, channel: &str) -> bool {
        match self.counts.get_mut(channel) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(channel);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn has(&self, channel: &str) -> bool {
        self.counts.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    /// Per-channel counts, for state queries.
    pub fn snapshot(&self) -> Vec<ChannelCount> {
        self.counts
            .iter()
            .map(|(channel, refcount)| ChannelCount {
                channel: channel.clone(),
                refcount: *refcount,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
