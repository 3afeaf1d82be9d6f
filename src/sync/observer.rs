//! Render watermarks and effect observers.
//!
//! The observer (renderer, sound, logs) sees each confirmed event at most
//! once. The [`Watermark`] remembers the newest confirmed id it has been
//! shown; anything at or below it is filtered out.

use serde::{Serialize, Deserialize};

use crate::game::events::{EventId, EventStreamEntry};

/// Id of the last confirmed event handed to the observer. Never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(EventId);

impl Watermark {
    /// Watermark before anything was rendered.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Current value.
    pub fn get(&self) -> EventId {
        self.0
    }

    /// Raise to `id`; lower values are ignored.
    pub fn advance(&mut self, id: EventId) {
        self.0 = self.0.max(id);
    }

    /// Whether `id` was already rendered.
    pub fn covers(&self, id: EventId) -> bool {
        id <= self.0
    }

    /// Entries not yet rendered, in order, stopping before `ceiling` if set.
    pub fn unrendered<'a, E>(
        &self,
        entries: impl IntoIterator<Item = &'a EventStreamEntry<E>>,
        ceiling: Option<EventId>,
    ) -> Vec<&'a EventStreamEntry<E>>
    where
        E: 'a,
    {
        entries
            .into_iter()
            .filter(|e| !self.covers(e.id))
            .take_while(|e| ceiling.map_or(true, |c| e.id < c))
            .collect()
    }
}

/// Consumer of renderable effects.
pub trait EffectObserver<E> {
    /// Called with newly renderable entries, oldest first.
    fn on_effects(&mut self, effects: &[EventStreamEntry<E>]);
}

impl<E, F> EffectObserver<E> for F
where
    F: FnMut(&[EventStreamEntry<E>]),
{
    fn on_effects(&mut self, effects: &[EventStreamEntry<E>]) {
        self(effects)
    }
}

/// Observer that keeps everything it is shown.
#[derive(Debug, Clone)]
pub struct RecordingObserver<E> {
    /// Entries seen so far, in delivery order
    pub seen: Vec<EventStreamEntry<E>>,
}

impl<E> Default for RecordingObserver<E> {
    fn default() -> Self {
        Self { seen: Vec::new() }
    }
}

impl<E> RecordingObserver<E> {
    /// Ids seen so far.
    pub fn ids(&self) -> Vec<EventId> {
        self.seen.iter().map(|e| e.id).collect()
    }
}

impl<E: Clone> EffectObserver<E> for RecordingObserver<E> {
    fn on_effects(&mut self, effects: &[EventStreamEntry<E>]) {
        self.seen.extend_from_slice(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::events::{EventKind, GameEvent};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Blip;

    impl EventKind for Blip {
        fn event_type(&self) -> &'static str {
            "BLIP"
        }
    }

    fn entries(ids: &[EventId]) -> Vec<EventStreamEntry<Blip>> {
        ids.iter()
            .map(|&id| EventStreamEntry { id, event: GameEvent::new(Blip, 0, "X") })
            .collect()
    }

    #[test]
    fn test_watermark_never_decreases() {
        let mut mark = Watermark::new();
        mark.advance(5);
        mark.advance(3);
        assert_eq!(mark.get(), 5);
        assert!(mark.covers(5));
        assert!(!mark.covers(6));
    }

    #[test]
    fn test_unrendered_respects_mark_and_ceiling() {
        let list = entries(&[1, 2, 3, 4, 5]);
        let mut mark = Watermark::new();
        mark.advance(2);

        let ids: Vec<_> = mark.unrendered(&list, None).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);

        let ids: Vec<_> = mark.unrendered(&list, Some(5)).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_closure_observer() {
        let mut count = 0;
        {
            let mut observer = |effects: &[EventStreamEntry<Blip>]| count += effects.len();
            observer.on_effects(&entries(&[1, 2]));
        }
        assert_eq!(count, 2);
    }
}
