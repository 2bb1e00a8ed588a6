//! Purpose: Track the consumer positions attached to a publication.
//! Exports: `Subscribable`, `TetherablePosition`, `TetherState`.
//! Role: Conductor-owned set; writers never touch it. Entries reference their
//! counter by id rather than owning the publication that holds them.
//! Invariants: `Resting` entries are excluded from limit and drain computation.
//! Invariants: State timestamps change only when the state does, or while an
//! untethered subscriber is observed back inside the window.
use crate::core::counters::{CounterId, ReadablePosition};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TetherState {
    Active,
    Linger,
    Resting,
}

#[derive(Debug)]
pub struct TetherablePosition {
    pub counter_id: CounterId,
    pub registration_id: i64,
    /// Tethered subscribers gate the publication limit for as long as they
    /// live; untethered ones are walked through Linger/Resting when they
    /// fall outside the flow-control window.
    pub is_tether: bool,
    pub state: TetherState,
    pub time_of_last_change_ns: i64,
    pub position: ReadablePosition,
}

impl TetherablePosition {
    pub fn is_resting(&self) -> bool {
        self.state == TetherState::Resting
    }
}

#[derive(Default, Debug)]
pub struct Subscribable {
    entries: Vec<TetherablePosition>,
}

impl Subscribable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, entry: TetherablePosition) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, registration_id: i64) -> Option<TetherablePosition> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.registration_id == registration_id)?;
        Some(self.entries.remove(index))
    }

    pub fn remove_at(&mut self, index: usize) -> TetherablePosition {
        self.entries.remove(index)
    }

    pub fn get(&self, registration_id: i64) -> Option<&TetherablePosition> {
        self.entries
            .iter()
            .find(|entry| entry.registration_id == registration_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TetherablePosition> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[TetherablePosition] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [TetherablePosition] {
        &mut self.entries
    }

    /// Minimum position over non-resting entries, seeded with `floor`.
    pub fn min_non_resting_position(&self, floor: i64) -> i64 {
        let mut position = floor;
        for entry in &self.entries {
            if !entry.is_resting() {
                position = position.min(entry.position.get_acquire());
            }
        }
        position
    }

    /// True when every non-resting consumer has reached `target_position`.
    pub fn all_caught_up_to(&self, target_position: i64) -> bool {
        self.entries
            .iter()
            .filter(|entry| !entry.is_resting())
            .all(|entry| entry.position.get_acquire() >= target_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::counters::CountersManager;

    fn entry(
        manager: &CountersManager,
        registration_id: i64,
        position: i64,
        state: TetherState,
    ) -> TetherablePosition {
        let counter = manager.allocate().expect("allocate");
        counter.set_release(position);
        TetherablePosition {
            counter_id: counter.id(),
            registration_id,
            is_tether: true,
            state,
            time_of_last_change_ns: 0,
            position: counter.reader(),
        }
    }

    #[test]
    fn min_position_skips_resting_entries() {
        let manager = CountersManager::new(8);
        let mut subscribable = Subscribable::new();
        subscribable.add(entry(&manager, 1, 100, TetherState::Active));
        subscribable.add(entry(&manager, 2, 50, TetherState::Linger));
        subscribable.add(entry(&manager, 3, 10, TetherState::Resting));

        assert_eq!(subscribable.min_non_resting_position(i64::MAX), 50);
    }

    #[test]
    fn min_position_is_seeded_by_the_floor() {
        let manager = CountersManager::new(8);
        let mut subscribable = Subscribable::new();
        subscribable.add(entry(&manager, 1, 100, TetherState::Active));

        assert_eq!(subscribable.min_non_resting_position(64), 64);
    }

    #[test]
    fn drain_check_ignores_resting_entries() {
        let manager = CountersManager::new(8);
        let mut subscribable = Subscribable::new();
        subscribable.add(entry(&manager, 1, 128, TetherState::Active));
        subscribable.add(entry(&manager, 2, 0, TetherState::Resting));

        assert!(subscribable.all_caught_up_to(128));
        assert!(!subscribable.all_caught_up_to(129));
    }

    #[test]
    fn remove_returns_the_matching_entry() {
        let manager = CountersManager::new(8);
        let mut subscribable = Subscribable::new();
        subscribable.add(entry(&manager, 7, 0, TetherState::Active));
        subscribable.add(entry(&manager, 8, 0, TetherState::Active));

        let removed = subscribable.remove(7).expect("present");
        assert_eq!(removed.registration_id, 7);
        assert_eq!(subscribable.len(), 1);
        assert!(subscribable.remove(7).is_none());
    }
}
