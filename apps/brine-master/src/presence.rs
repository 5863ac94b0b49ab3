//! Which minions have talked to the master recently.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use brine_storage::MinionId;
use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub present: BTreeSet<MinionId>,
    pub new: BTreeSet<MinionId>,
    pub lost: BTreeSet<MinionId>,
}

pub struct Presence {
    seen: DashMap<MinionId, Instant>,
    window: Duration,
    previous: Mutex<BTreeSet<MinionId>>,
}

impl Presence {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
            previous: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn touch(&self, id: &MinionId) {
        self.seen.insert(id.clone(), Instant::now());
    }

    pub fn present(&self) -> BTreeSet<MinionId> {
        self.seen
            .iter()
            .filter(|e| e.value().elapsed() <= self.window)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Current set plus what changed since the previous call. Entries that
    /// left the window are forgotten.
    pub fn diff(&self) -> PresenceChange {
        let present = self.present();
        self.seen.retain(|id, _| present.contains(id));
        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let new = present.difference(&previous).cloned().collect();
        let lost = previous.difference(&present).cloned().collect();
        *previous = present.clone();
        PresenceChange { present, new, lost }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_and_lost() {
        let presence = Presence::new(Duration::from_millis(40));
        presence.touch(&MinionId::from("a"));
        presence.touch(&MinionId::from("b"));
        let first = presence.diff();
        assert_eq!(first.new.len(), 2);
        assert!(first.lost.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        presence.touch(&MinionId::from("b"));
        presence.touch(&MinionId::from("c"));
        let second = presence.diff();
        assert_eq!(
            second.present,
            BTreeSet::from([MinionId::from("b"), MinionId::from("c")])
        );
        assert_eq!(second.new, BTreeSet::from([MinionId::from("c")]));
        assert_eq!(second.lost, BTreeSet::from([MinionId::from("a")]));
    }
}
