use std::collections::BTreeMap;

use crate::{Deadline, Instant};

/// An event queue for timing simulations.
///
/// Components never block; they schedule an event for a future instant and are called back by whoever
/// drives [`Executor::enter`]. Events scheduled for the same instant fire in the order they were scheduled.
pub struct Executor<E> {
    now: Instant,
    seq: u64,
    events: BTreeMap<(Instant, u64), E>,
}

impl<E> Default for Executor<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Executor<E> {
    /// Create a new executor.
    pub fn new() -> Self {
        Self {
            now: Instant::INIT,
            seq: 0,
            events: BTreeMap::new(),
        }
    }

    /// Return the simulation instant this executor is at.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Schedule an event to be delivered at future time.
    pub fn schedule(&mut self, fire_at: impl Deadline, event: E) {
        let instant = fire_at.to_instant(self.now);
        // To prevent mistaken scheduling into the past.
        assert!(instant >= self.now, "event scheduled at {instant:?} before {:?}", self.now);
        self.events.insert((instant, self.seq), event);
        self.seq += 1;
    }

    /// Deliver an event at current instant, after everything already queued for now.
    pub fn spawn(&mut self, event: E) {
        self.schedule(self.now, event);
    }

    /// Number of events not yet delivered.
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Instant of the next event, if any.
    pub fn peek(&self) -> Option<Instant> {
        self.events.first_key_value().map(|(&(at, _), _)| at)
    }

    /// Take the next event and progress current simulated time to it.
    pub fn pop(&mut self) -> Option<(Instant, E)> {
        let ((at, _), event) = self.events.pop_first()?;

        // Ensure time never go backwards.
        assert!(at >= self.now);
        self.now = at;
        Some((at, event))
    }

    /// Start running simulation.
    ///
    /// Returns once no more events are scheduled, or when the next event would fire at or after `timeout`.
    /// The handler receives the executor back so it can schedule follow-up events.
    pub fn enter<C>(&mut self, timeout: Instant, ctx: &mut C, mut handler: impl FnMut(&mut C, &mut Self, E)) -> u64 {
        let mut dispatched = 0;
        while let Some(at) = self.peek()
            && at < timeout
        {
            let Some((_, event)) = self.pop() else {
                break;
            };
            handler(ctx, self, event);
            dispatched += 1;
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Duration;

    #[test]
    fn same_instant_is_fifo() {
        let mut exec = Executor::new();
        exec.schedule(Duration::from_nanos(5), 'b');
        exec.schedule(Duration::from_nanos(1), 'a');
        exec.schedule(Duration::from_nanos(5), 'c');

        let order: Vec<_> = std::iter::from_fn(|| exec.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, ['a', 'b', 'c']);
        assert_eq!(exec.now(), Instant::INIT + Duration::from_nanos(5));
    }

    #[test]
    fn enter_stops_at_timeout() {
        let mut exec = Executor::new();
        let mut seen = Vec::new();
        exec.spawn(0u32);

        let dispatched = exec.enter(
            Instant::INIT + Duration::from_nanos(10),
            &mut seen,
            |seen, exec, n| {
                seen.push(n);
                exec.schedule(Duration::from_nanos(4), n + 1);
            },
        );

        // Fires at 0, 4 and 8; the event at 12 stays queued.
        assert_eq!(dispatched, 3);
        assert_eq!(seen, [0, 1, 2]);
        assert_eq!(exec.pending(), 1);
    }

    #[test]
    #[should_panic]
    fn no_time_travel() {
        let mut exec = Executor::new();
        exec.schedule(Duration::from_nanos(5), ());
        exec.pop();
        exec.schedule(Instant::INIT, ());
    }
}
