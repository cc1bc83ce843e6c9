//! Ephemeral per-connection presence.
//!
//! Every connection owns exactly one [`PresenceState`] and overwrites it in
//! full on each update. Updates carry a per-connection clock; older or
//! repeated clocks are ignored. Nothing here is persisted or merged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::element::ElementId;
use crate::player::PlayerIdentity;

/// How often a live connection re-announces its state.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(15);

/// Remote entries not renewed within this window are dropped.
pub const EXPIRE_AFTER: Duration = Duration::from_secs(30);

/// Connection id assigned per connection attempt.
pub type PeerId = String;

/// A cursor position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    /// Angle in degrees of the line from `self` to `other`, in `(-180, 180]`.
    pub fn angle_to(&self, other: &Point) -> f64 {
        (other.y - self.y).atan2(other.x - self.x).to_degrees()
    }
}

/// Everything a connection announces about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub player: PlayerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
    /// Per-element payloads, keyed by element id.
    #[serde(default)]
    pub elements: BTreeMap<String, Value>,
}

impl PresenceState {
    pub fn new(player: PlayerIdentity) -> Self {
        Self {
            player,
            cursor: None,
            elements: BTreeMap::new(),
        }
    }
}

/// A snapshot of one connection's entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub peer: PeerId,
    pub is_local: bool,
    pub state: PresenceState,
}

/// One connection's payload for a single element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementPresence {
    pub peer: PeerId,
    pub is_local: bool,
    pub player: PlayerIdentity,
    pub payload: Value,
}

/// What changed in an entry, so subscribers can be notified selectively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessChange {
    pub peer: PeerId,
    pub elements: BTreeSet<String>,
    pub removed: bool,
}

impl AwarenessChange {
    fn between(peer: &str, old: Option<&PresenceState>, new: Option<&PresenceState>) -> Self {
        let empty = BTreeMap::new();
        let old_elements = old.map(|s| &s.elements).unwrap_or(&empty);
        let new_elements = new.map(|s| &s.elements).unwrap_or(&empty);

        let elements = old_elements
            .keys()
            .chain(new_elements.keys())
            .filter(|key| old_elements.get(*key) != new_elements.get(*key))
            .cloned()
            .collect();

        Self {
            peer: peer.to_string(),
            elements,
            removed: new.is_none(),
        }
    }
}

/// A local state ready to broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub clock: u64,
    pub state: PresenceState,
}

struct Tombstone {
    clock: u64,
    removed_at: Instant,
}

struct RemoteEntry {
    clock: u64,
    state: PresenceState,
    last_seen: Instant,
}

/// The awareness set of one room, from one connection's point of view.
pub struct Awareness {
    local_peer: PeerId,
    local: PresenceState,
    clock: u64,
    remote: HashMap<PeerId, RemoteEntry>,
    /// Clocks of removed peers, so late updates cannot resurrect them.
    /// Kept for [`EXPIRE_AFTER`].
    tombstones: HashMap<PeerId, Tombstone>,
}

impl Awareness {
    pub fn new(local_peer: PeerId, player: PlayerIdentity) -> Self {
        Self {
            local_peer,
            local: PresenceState::new(player),
            clock: 0,
            remote: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Adopts the id of a new connection attempt. Remote entries are dropped.
    pub fn set_local_peer(&mut self, peer: PeerId) -> Vec<AwarenessChange> {
        self.local_peer = peer;
        self.clear_remote()
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    /// Current local state with a fresh clock, for (re)broadcasting.
    pub fn renew(&mut self) -> LocalUpdate {
        self.clock += 1;
        LocalUpdate {
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Replaces this connection's payload for one element.
    pub fn set_element(&mut self, element: &ElementId, payload: Value) -> LocalUpdate {
        self.local.elements.insert(element.to_string(), payload);
        self.renew()
    }

    pub fn clear_element(&mut self, element: &ElementId) -> Option<LocalUpdate> {
        self.local.elements.remove(element.as_str())?;
        Some(self.renew())
    }

    pub fn set_cursor(&mut self, cursor: Option<Point>) -> LocalUpdate {
        self.local.cursor = cursor;
        self.renew()
    }

    /// Applies a remote update; `None` state removes the entry.
    ///
    /// Returns `None` when the update was stale or changed nothing.
    pub fn apply_remote(
        &mut self,
        peer: &str,
        clock: u64,
        state: Option<PresenceState>,
        now: Instant,
    ) -> Option<AwarenessChange> {
        if peer == self.local_peer {
            return None;
        }
        if self.tombstones.get(peer).is_some_and(|t| clock <= t.clock) {
            return None;
        }

        match state {
            Some(state) => {
                if let Some(existing) = self.remote.get_mut(peer) {
                    if clock <= existing.clock {
                        return None;
                    }
                    let change = AwarenessChange::between(peer, Some(&existing.state), Some(&state));
                    existing.clock = clock;
                    existing.state = state;
                    existing.last_seen = now;
                    return Some(change);
                }

                let change = AwarenessChange::between(peer, None, Some(&state));
                self.tombstones.remove(peer);
                self.remote.insert(
                    peer.to_string(),
                    RemoteEntry {
                        clock,
                        state,
                        last_seen: now,
                    },
                );
                Some(change)
            }
            None => {
                if self.remote.get(peer).is_some_and(|e| clock < e.clock) {
                    return None;
                }
                self.tombstones.insert(
                    peer.to_string(),
                    Tombstone {
                        clock,
                        removed_at: now,
                    },
                );
                self.remove(peer)
            }
        }
    }

    fn remove(&mut self, peer: &str) -> Option<AwarenessChange> {
        let entry = self.remote.remove(peer)?;
        Some(AwarenessChange::between(peer, Some(&entry.state), None))
    }

    /// Drops remote entries that were not renewed in time, and tombstones
    /// older than the same window.
    pub fn expire(&mut self, now: Instant) -> Vec<AwarenessChange> {
        self.tombstones
            .retain(|_, t| now.saturating_duration_since(t.removed_at) < EXPIRE_AFTER);

        let stale: Vec<PeerId> = self
            .remote
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= EXPIRE_AFTER)
            .map(|(peer, _)| peer.clone())
            .collect();

        stale
            .iter()
            .filter_map(|peer| {
                tracing::debug!("awareness entry for {} expired", peer);
                self.remove(peer)
            })
            .collect()
    }

    /// Drops every remote entry. Used when the local connection drops.
    pub fn clear_remote(&mut self) -> Vec<AwarenessChange> {
        self.tombstones.clear();
        let peers: Vec<PeerId> = self.remote.keys().cloned().collect();
        peers.iter().filter_map(|peer| self.remove(peer)).collect()
    }

    /// All entries: the local one first, then remote peers by id.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        let mut peers: Vec<&PeerId> = self.remote.keys().collect();
        peers.sort();

        std::iter::once(AwarenessEntry {
            peer: self.local_peer.clone(),
            is_local: true,
            state: self.local.clone(),
        })
        .chain(peers.into_iter().map(|peer| AwarenessEntry {
            peer: peer.clone(),
            is_local: false,
            state: self.remote[peer].state.clone(),
        }))
        .collect()
    }

    /// Payloads for one element across all connections that set one.
    pub fn element_entries(&self, element: &ElementId) -> Vec<ElementPresence> {
        self.entries()
            .into_iter()
            .filter_map(|entry| {
                let payload = entry.state.elements.get(element.as_str())?.clone();
                Some(ElementPresence {
                    peer: entry.peer,
                    is_local: entry.is_local,
                    player: entry.state.player,
                    payload,
                })
            })
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn awareness(peer: &str) -> Awareness {
        Awareness::new(peer.to_string(), PlayerIdentity::generate())
    }

    fn state_with(element: &str, payload: Value) -> PresenceState {
        let mut state = PresenceState::new(PlayerIdentity::generate());
        state.elements.insert(element.to_string(), payload);
        state
    }

    #[test]
    fn test_point_geometry() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(a.midpoint(&b), Point::new(1.5, 2.0));
        assert!((a.angle_to(&Point::new(0.0, 10.0)) - 90.0).abs() < 1e-9);
        assert!((a.angle_to(&Point::new(-10.0, 0.0)) - 180.0).abs() < 1e-9);
        assert_eq!(a.angle_to(&Point::new(10.0, 0.0)), 0.0);
    }

    #[test]
    fn test_set_element_replaces_slot_in_full() {
        let mut a = awareness("a");
        let el = ElementId::parse("cursor-box").unwrap();
        let first = a.set_element(&el, json!({"color": "red", "size": 2}));
        let second = a.set_element(&el, json!({"color": "blue"}));
        assert!(second.clock > first.clock);
        assert_eq!(a.local_state().elements["cursor-box"], json!({"color": "blue"}));
    }

    #[test]
    fn test_stale_clock_is_ignored() {
        let mut a = awareness("a");
        let now = Instant::now();
        assert!(a.apply_remote("b", 2, Some(state_with("x", json!(2))), now).is_some());
        assert!(a.apply_remote("b", 1, Some(state_with("x", json!(1))), now).is_none());
        assert!(a.apply_remote("b", 2, Some(state_with("x", json!(3))), now).is_none());

        let el = ElementId::parse("x").unwrap();
        let entries = a.element_entries(&el);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!(2));
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut a = awareness("a");
        assert!(a
            .apply_remote("a", 99, Some(state_with("x", json!(1))), Instant::now())
            .is_none());
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn test_change_lists_touched_elements() {
        let mut a = awareness("a");
        let now = Instant::now();
        let mut state = state_with("x", json!(1));
        state.elements.insert("y".to_string(), json!(1));
        a.apply_remote("b", 1, Some(state.clone()), now);

        state.elements.insert("y".to_string(), json!(2));
        let change = a.apply_remote("b", 2, Some(state), now).unwrap();
        assert!(change.elements.contains("y"));
        assert!(!change.elements.contains("x"));
    }

    #[test]
    fn test_removal_is_final_for_older_clocks() {
        let mut a = awareness("a");
        let now = Instant::now();
        a.apply_remote("b", 3, Some(state_with("x", json!(1))), now);
        let change = a.apply_remote("b", 3, None, now).unwrap();
        assert!(change.removed);
        assert!(change.elements.contains("x"));
        // A reordered update from before the removal must not bring it back.
        assert!(a.apply_remote("b", 2, Some(state_with("x", json!(1))), now).is_none());
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn test_tombstones_are_pruned_after_window() {
        let mut a = awareness("a");
        let start = Instant::now();
        for (i, peer) in ["b", "c", "d"].iter().enumerate() {
            a.apply_remote(peer, 1, Some(state_with("x", json!(i))), start);
            a.apply_remote(peer, 1, None, start);
        }
        assert_eq!(a.tombstones.len(), 3);

        a.expire(start + Duration::from_secs(10));
        assert_eq!(a.tombstones.len(), 3);
        assert!(a.apply_remote("b", 1, Some(state_with("x", json!(0))), start).is_none());

        a.expire(start + EXPIRE_AFTER);
        assert!(a.tombstones.is_empty());
        // Past the window the peer id can be used again.
        assert!(a
            .apply_remote("b", 1, Some(state_with("x", json!(0))), start + EXPIRE_AFTER)
            .is_some());
    }

    #[test]
    fn test_entries_expire_after_window() {
        let mut a = awareness("a");
        let start = Instant::now();
        a.apply_remote("b", 1, Some(state_with("x", json!(1))), start);
        a.apply_remote("c", 1, Some(state_with("x", json!(1))), start + Duration::from_secs(20));

        assert!(a.expire(start + Duration::from_secs(29)).is_empty());
        let expired = a.expire(start + EXPIRE_AFTER);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer, "b");
        assert_eq!(a.peer_count(), 1);
    }

    #[test]
    fn test_clear_remote_on_disconnect() {
        let mut a = awareness("a");
        let now = Instant::now();
        a.apply_remote("b", 1, Some(state_with("x", json!(1))), now);
        a.apply_remote("c", 1, Some(state_with("y", json!(1))), now);
        let changes = a.set_local_peer("a2".to_string());
        assert_eq!(changes.len(), 2);
        assert_eq!(a.entries().len(), 1);
        assert!(a.entries()[0].is_local);
        assert_eq!(a.local_peer(), "a2");
    }

    #[test]
    fn test_presence_state_cbor_roundtrip() {
        let mut state = state_with("x", json!({"nested": [1, 2.5, "s", null]}));
        state.cursor = Some(Point::new(10.0, -4.5));
        let mut bytes = Vec::new();
        ciborium::into_writer(&state, &mut bytes).unwrap();
        let back: PresenceState = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, state);
    }
}
