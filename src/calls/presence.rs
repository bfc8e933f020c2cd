//! Peer presence as reported by the relay.

use log::debug;
use tokio::sync::watch;

/// A change in the peer's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEdge {
    BecamePresent,
    BecameAbsent,
}

/// Single presence flag with edge detection.
///
/// The current value is also published through a `watch` channel so the
/// presentation layer can follow it without going through the controller.
#[derive(Debug)]
pub struct PresenceTracker {
    tx: watch::Sender<bool>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn is_present(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Records the latest report. Returns the edge if the value changed.
    pub fn observe(&self, present: bool) -> Option<PresenceEdge> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == present {
                false
            } else {
                *current = present;
                true
            }
        });
        if !changed {
            debug!("Presence unchanged (present={present})");
            return None;
        }
        Some(if present {
            PresenceEdge::BecamePresent
        } else {
            PresenceEdge::BecameAbsent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_reported_once() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.is_present());

        assert_eq!(tracker.observe(true), Some(PresenceEdge::BecamePresent));
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(false), Some(PresenceEdge::BecameAbsent));
        assert_eq!(tracker.observe(false), None);
    }

    #[tokio::test]
    async fn test_subscribers_follow_the_flag() {
        let tracker = PresenceTracker::new();
        let mut rx = tracker.subscribe();

        tracker.observe(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        tracker.observe(true);
        assert!(!rx.has_changed().unwrap());
    }
}
