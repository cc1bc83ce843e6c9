//! Cursor proximity detection.
//!
//! Each scan measures the distance from the local cursor to every remote
//! cursor. A pair becomes near when the distance drops below the enter
//! threshold and apart again once it exceeds the larger leave threshold,
//! or when the peer's entry disappears. A peer whose cursor is absent is
//! left out of the scan entirely; its pair keeps its current state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::awareness::{Awareness, PeerId, Point};
use crate::player::PlayerIdentity;

pub const DEFAULT_ENTER_THRESHOLD: f64 = 30.0;
pub const DEFAULT_LEAVE_THRESHOLD: f64 = 60.0;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(250);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProximityConfigError {
    #[error("threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),

    #[error("enter threshold {enter} must be smaller than leave threshold {leave}")]
    NoHysteresis { enter: f64, leave: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProximityConfig {
    pub enter_threshold: f64,
    pub leave_threshold: f64,
    /// After a pair separates it cannot re-enter until this has elapsed.
    pub cooldown: Duration,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            enter_threshold: DEFAULT_ENTER_THRESHOLD,
            leave_threshold: DEFAULT_LEAVE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl ProximityConfig {
    pub fn validate(&self) -> Result<(), ProximityConfigError> {
        for threshold in [self.enter_threshold, self.leave_threshold] {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(ProximityConfigError::InvalidThreshold(threshold));
            }
        }
        if self.enter_threshold >= self.leave_threshold {
            return Err(ProximityConfigError::NoHysteresis {
                enter: self.enter_threshold,
                leave: self.leave_threshold,
            });
        }
        Ok(())
    }
}

/// Two cursors coming within the enter threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    pub peer: PeerId,
    pub player: PlayerIdentity,
    pub mine: Point,
    pub theirs: Point,
    pub midpoint: Point,
    /// Degrees, from the local cursor towards the peer's.
    pub angle: f64,
    pub distance: f64,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProximityEvent {
    Entered(Encounter),
    Left { peer: PeerId },
}

/// Receives proximity transitions.
pub trait ProximityHandler: Send {
    fn on_enter(&mut self, encounter: &Encounter);
    fn on_leave(&mut self, peer: &str);
}

/// A handler built from two closures.
pub struct Callbacks<E, L> {
    on_enter: E,
    on_leave: L,
}

impl<E, L> Callbacks<E, L>
where
    E: FnMut(&Encounter) + Send,
    L: FnMut(&str) + Send,
{
    pub fn new(on_enter: E, on_leave: L) -> Self {
        Self { on_enter, on_leave }
    }
}

impl<E, L> ProximityHandler for Callbacks<E, L>
where
    E: FnMut(&Encounter) + Send,
    L: FnMut(&str) + Send,
{
    fn on_enter(&mut self, encounter: &Encounter) {
        (self.on_enter)(encounter)
    }

    fn on_leave(&mut self, peer: &str) {
        (self.on_leave)(peer)
    }
}

/// Pair state machine for one local connection.
pub struct ProximityEngine {
    config: ProximityConfig,
    near: HashMap<PeerId, Instant>,
    cooldown_until: HashMap<PeerId, Instant>,
}

impl ProximityEngine {
    pub fn new(config: ProximityConfig) -> Result<Self, ProximityConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            near: HashMap::new(),
            cooldown_until: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn is_near(&self, peer: &str) -> bool {
        self.near.contains_key(peer)
    }

    /// Runs one scan over the current awareness set.
    pub fn scan(&mut self, awareness: &Awareness, now: Instant) -> Vec<ProximityEvent> {
        let mut events = Vec::new();
        let entries = awareness.entries();
        let local = entries
            .iter()
            .find(|e| e.is_local)
            .and_then(|e| e.state.cursor);

        // Pairs whose peer is gone separate regardless of cursors.
        let gone: Vec<PeerId> = self
            .near
            .keys()
            .filter(|peer| !entries.iter().any(|e| !e.is_local && &e.peer == *peer))
            .cloned()
            .collect();
        for peer in gone {
            self.separate(&peer, now);
            events.push(ProximityEvent::Left { peer });
        }
        self.cooldown_until.retain(|_, until| *until > now);

        let Some(mine) = local else {
            return events;
        };

        for entry in entries.iter().filter(|e| !e.is_local) {
            let Some(theirs) = entry.state.cursor else {
                continue;
            };
            let distance = mine.distance(&theirs);

            if self.near.contains_key(&entry.peer) {
                if distance > self.config.leave_threshold {
                    self.separate(&entry.peer, now);
                    events.push(ProximityEvent::Left {
                        peer: entry.peer.clone(),
                    });
                }
            } else if distance < self.config.enter_threshold
                && !self.cooldown_until.contains_key(&entry.peer)
            {
                self.near.insert(entry.peer.clone(), now);
                events.push(ProximityEvent::Entered(Encounter {
                    peer: entry.peer.clone(),
                    player: entry.state.player.clone(),
                    mine,
                    theirs,
                    midpoint: mine.midpoint(&theirs),
                    angle: mine.angle_to(&theirs),
                    distance,
                    at: now,
                }));
            }
        }

        events
    }

    fn separate(&mut self, peer: &str, now: Instant) {
        self.near.remove(peer);
        self.cooldown_until
            .insert(peer.to_string(), now + self.config.cooldown);
    }
}

/// Delivers events to a handler in order.
pub fn dispatch(handler: &mut dyn ProximityHandler, events: &[ProximityEvent]) {
    for event in events {
        match event {
            ProximityEvent::Entered(encounter) => handler.on_enter(encounter),
            ProximityEvent::Left { peer } => handler.on_leave(peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PresenceState;
    use std::sync::{Arc, Mutex};

    struct Scene {
        awareness: Awareness,
        clock: u64,
    }

    impl Scene {
        fn new() -> Self {
            Self {
                awareness: Awareness::new("me".to_string(), PlayerIdentity::generate()),
                clock: 0,
            }
        }

        fn me(&mut self, x: f64, y: f64) {
            self.awareness.set_cursor(Some(Point::new(x, y)));
        }

        fn peer(&mut self, peer: &str, cursor: Option<Point>) {
            self.clock += 1;
            let mut state = PresenceState::new(PlayerIdentity::generate());
            state.cursor = cursor;
            self.awareness
                .apply_remote(peer, self.clock, Some(state), Instant::now());
        }

        fn drop_peer(&mut self, peer: &str) {
            self.clock += 1;
            self.awareness
                .apply_remote(peer, self.clock, None, Instant::now());
        }
    }

    fn entered(events: &[ProximityEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ProximityEvent::Entered(_)))
            .count()
    }

    fn left(events: &[ProximityEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ProximityEvent::Left { .. }))
            .count()
    }

    #[test]
    fn test_config_validation() {
        assert!(ProximityConfig::default().validate().is_ok());
        let inverted = ProximityConfig {
            enter_threshold: 60.0,
            leave_threshold: 30.0,
            ..Default::default()
        };
        assert!(matches!(
            ProximityEngine::new(inverted),
            Err(ProximityConfigError::NoHysteresis { .. })
        ));
        let negative = ProximityConfig {
            enter_threshold: -1.0,
            ..Default::default()
        };
        assert_eq!(
            negative.validate(),
            Err(ProximityConfigError::InvalidThreshold(-1.0))
        );
    }

    #[test]
    fn test_hysteresis() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        let t0 = Instant::now();

        scene.me(0.0, 0.0);
        scene.peer("b", Some(Point::new(25.0, 0.0)));
        let events = engine.scan(&scene.awareness, t0);
        assert_eq!(entered(&events), 1);
        match &events[0] {
            ProximityEvent::Entered(encounter) => {
                assert_eq!(encounter.peer, "b");
                assert_eq!(encounter.midpoint, Point::new(12.5, 0.0));
                assert_eq!(encounter.angle, 0.0);
                assert_eq!(encounter.distance, 25.0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Still near: no repeat event.
        assert!(engine.scan(&scene.awareness, t0).is_empty());

        // Between the thresholds nothing changes.
        scene.peer("b", Some(Point::new(50.0, 0.0)));
        assert!(engine.scan(&scene.awareness, t0).is_empty());
        assert!(engine.is_near("b"));

        scene.peer("b", Some(Point::new(61.0, 0.0)));
        let events = engine.scan(&scene.awareness, t0);
        assert_eq!(events, vec![ProximityEvent::Left { peer: "b".into() }]);
    }

    #[test]
    fn test_between_thresholds_does_not_enter() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        scene.me(0.0, 0.0);
        scene.peer("b", Some(Point::new(45.0, 0.0)));
        assert!(engine.scan(&scene.awareness, Instant::now()).is_empty());
    }

    #[test]
    fn test_cooldown_blocks_immediate_reentry() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        let t0 = Instant::now();
        scene.me(0.0, 0.0);

        scene.peer("b", Some(Point::new(10.0, 0.0)));
        assert_eq!(entered(&engine.scan(&scene.awareness, t0)), 1);
        scene.peer("b", Some(Point::new(100.0, 0.0)));
        assert_eq!(left(&engine.scan(&scene.awareness, t0)), 1);

        scene.peer("b", Some(Point::new(10.0, 0.0)));
        assert!(engine
            .scan(&scene.awareness, t0 + Duration::from_millis(100))
            .is_empty());
        assert_eq!(
            entered(&engine.scan(&scene.awareness, t0 + Duration::from_millis(300))),
            1
        );
    }

    #[test]
    fn test_missing_cursor_is_excluded() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        let t0 = Instant::now();
        scene.me(0.0, 0.0);
        scene.peer("b", None);
        assert!(engine.scan(&scene.awareness, t0).is_empty());

        scene.peer("b", Some(Point::new(5.0, 5.0)));
        assert_eq!(entered(&engine.scan(&scene.awareness, t0)), 1);

        // Hiding the cursor neither leaves nor re-enters.
        scene.peer("b", None);
        assert!(engine.scan(&scene.awareness, t0).is_empty());
        assert!(engine.is_near("b"));
    }

    #[test]
    fn test_missing_local_cursor_scans_nothing() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        scene.peer("b", Some(Point::new(0.0, 0.0)));
        assert!(engine.scan(&scene.awareness, Instant::now()).is_empty());
    }

    #[test]
    fn test_disconnect_leaves() {
        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        let t0 = Instant::now();
        scene.me(0.0, 0.0);
        scene.peer("b", Some(Point::new(1.0, 1.0)));
        scene.peer("c", Some(Point::new(2.0, 2.0)));
        assert_eq!(entered(&engine.scan(&scene.awareness, t0)), 2);

        scene.drop_peer("b");
        let events = engine.scan(&scene.awareness, t0);
        assert_eq!(events, vec![ProximityEvent::Left { peer: "b".into() }]);
        assert!(engine.is_near("c"));
    }

    #[test]
    fn test_dispatch_to_callbacks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let enter_log = log.clone();
        let leave_log = log.clone();
        let mut handler = Callbacks::new(
            move |e: &Encounter| enter_log.lock().unwrap().push(format!("enter {}", e.peer)),
            move |peer: &str| leave_log.lock().unwrap().push(format!("leave {}", peer)),
        );

        let mut engine = ProximityEngine::new(ProximityConfig::default()).unwrap();
        let mut scene = Scene::new();
        scene.me(0.0, 0.0);
        scene.peer("b", Some(Point::new(3.0, 4.0)));
        let events = engine.scan(&scene.awareness, Instant::now());
        dispatch(&mut handler, &events);
        scene.drop_peer("b");
        let events = engine.scan(&scene.awareness, Instant::now());
        dispatch(&mut handler, &events);

        assert_eq!(*log.lock().unwrap(), vec!["enter b", "leave b"]);
    }
}
