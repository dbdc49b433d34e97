//! Timeout management for the event loop
//!
//! The timer orders pending timeouts in a map keyed by deadline; the event
//! loop asks for the next poll date, sleeps at most that long, then drains
//! whatever came due. Each timeout carries a piece of state (the session
//! token) handed back on expiry.

use std::{collections::BTreeMap, time::{Duration, Instant}};

use mio::Token;

use crate::server::TIMER;

/// A timeout, as returned by `Timer::set_timeout`.
///
/// Use this as the argument to `Timer::cancel_timeout`, to cancel this timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeout {
    deadline: Instant,
    id: u64,
}

pub struct Timer<T> {
    entries: BTreeMap<(Instant, u64), T>,
    next_id: u64,
}

impl<T> Default for Timer<T> {
    fn default() -> Timer<T> {
        Timer {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<T> Timer<T> {
    pub fn set_timeout(&mut self, delay_from_now: Duration, state: T) -> Timeout {
        let deadline = Instant::now() + delay_from_now;
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((deadline, id), state);
        Timeout { deadline, id }
    }

    pub fn cancel_timeout(&mut self, timeout: &Timeout) -> Option<T> {
        self.entries.remove(&(timeout.deadline, timeout.id))
    }

    pub fn reset_timeout(&mut self, timeout: &Timeout, delay_from_now: Duration) -> Option<Timeout> {
        self.cancel_timeout(timeout)
            .map(|state| self.set_timeout(delay_from_now, state))
    }

    /// returns one expired timeout's state, if any; call until `None` to
    /// drain everything that came due
    pub fn poll(&mut self) -> Option<T> {
        let now = Instant::now();
        let key = match self.entries.keys().next() {
            Some(&(deadline, id)) if deadline <= now => (deadline, id),
            _ => return None,
        };
        self.entries.remove(&key)
    }

    pub fn next_poll_date(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// One timeout slot owned by a session, rearmed against the thread local
/// [TIMER]. The inner option prevents cancelling the same timeout twice.
#[derive(Clone, Debug)]
pub struct TimeoutContainer {
    timeout: Option<Timeout>,
    duration: Duration,
}

impl TimeoutContainer {
    pub fn new(duration: Duration, token: Token) -> TimeoutContainer {
        let timeout = TIMER.with(|timer| timer.borrow_mut().set_timeout(duration, token));
        TimeoutContainer {
            timeout: Some(timeout),
            duration,
        }
    }

    pub fn new_empty(duration: Duration) -> TimeoutContainer {
        TimeoutContainer {
            timeout: None,
            duration,
        }
    }

    /// must be called when a timeout was triggered, to prevent errors when canceling
    pub fn triggered(&mut self) {
        let _ = self.timeout.take();
    }

    pub fn set(&mut self, token: Token) {
        if let Some(timeout) = self.timeout.take() {
            TIMER.with(|timer| timer.borrow_mut().cancel_timeout(&timeout));
        }

        let timeout = TIMER.with(|timer| timer.borrow_mut().set_timeout(self.duration, token));
        self.timeout = Some(timeout);
    }

    /// warning: this does not reset the timer
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn cancel(&mut self) -> bool {
        match self.timeout.take() {
            None => false,
            Some(timeout) => {
                TIMER.with(|timer| timer.borrow_mut().cancel_timeout(&timeout));
                true
            }
        }
    }

    pub fn reset(&mut self) -> bool {
        match self.timeout.take() {
            None => return false,
            Some(timeout) => {
                self.timeout = TIMER.with(|timer| {
                    timer
                        .borrow_mut()
                        .reset_timeout(&timeout, self.duration)
                });
            }
        }
        self.timeout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn expiry_order() {
        let mut timer: Timer<u32> = Timer::default();
        timer.set_timeout(Duration::from_millis(20), 2);
        timer.set_timeout(Duration::from_millis(5), 1);
        assert_eq!(timer.poll(), None);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.poll(), Some(1));
        assert_eq!(timer.poll(), None);

        thread::sleep(Duration::from_millis(15));
        assert_eq!(timer.poll(), Some(2));
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn cancel() {
        let mut timer: Timer<u32> = Timer::default();
        let timeout = timer.set_timeout(Duration::from_millis(5), 1);
        assert_eq!(timer.cancel_timeout(&timeout), Some(1));
        assert_eq!(timer.cancel_timeout(&timeout), None);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.poll(), None);
    }

    #[test]
    fn reset_pushes_deadline() {
        let mut timer: Timer<u32> = Timer::default();
        let timeout = timer.set_timeout(Duration::from_millis(5), 1);
        thread::sleep(Duration::from_millis(2));
        let timeout = timer
            .reset_timeout(&timeout, Duration::from_millis(30))
            .expect("timeout was still armed");
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.poll(), None);
        assert_eq!(timer.cancel_timeout(&timeout), Some(1));
    }
}
