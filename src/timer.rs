//! Cancellable one-shot timers on the run clock.
//!
//! Everything runs on one thread, so timers are plain entries in a
//! [`TimerQueue`] addressed by a [`TimerToken`]. Cancelling removes the entry;
//! a cancelled timer can never fire. The two roles the controller needs are
//! wrapped in [`QuiescenceTimer`] (debounced, re-armable) and [`AbandonTimer`]
//! (cancel-once hard deadline).

use crate::ledger::RequestId;
use std::collections::{BTreeMap, HashMap};

/// Milliseconds since the start of the run
pub type Millis = u64;

/// Handle returned when a timer is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// What a scheduled timer is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerRole {
    Abandon,
    Quiescence,
    ResourceTimeout(RequestId),
}

/// Pending timers ordered by due time, ties broken by scheduling order
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_token: u64,
    pending: BTreeMap<(Millis, TimerToken), TimerRole>,
    due_by_token: HashMap<TimerToken, Millis>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Millis, role: TimerRole) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.pending.insert((due, token), role);
        self.due_by_token.insert(token, due);
        token
    }

    /// Remove a pending timer. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        match self.due_by_token.remove(&token) {
            Some(due) => self.pending.remove(&(due, token)).is_some(),
            None => false,
        }
    }

    /// Earliest due time among pending timers
    pub fn next_due(&self) -> Option<Millis> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    /// Due time of a specific pending timer
    pub fn due_of(&self, token: TimerToken) -> Option<Millis> {
        self.due_by_token.get(&token).copied()
    }

    /// Pop the earliest timer if it is due at `now`
    pub fn pop_due(&mut self, now: Millis) -> Option<(TimerToken, TimerRole)> {
        let (&(due, token), _) = self.pending.iter().next()?;
        if due > now {
            return None;
        }
        self.due_by_token.remove(&token);
        self.pending.remove(&(due, token)).map(|role| (token, role))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Armed(TimerToken),
    Consumed,
}

/// Debounced "page is quiet" deadline
#[derive(Debug)]
pub struct QuiescenceTimer {
    delay: Millis,
    state: DebounceState,
}

impl QuiescenceTimer {
    pub fn new(delay: Millis) -> Self {
        Self { delay, state: DebounceState::Idle }
    }

    /// Schedule the fire `delay` after `now`, replacing any pending fire.
    /// Has no effect once the timer has fired.
    pub fn arm(&mut self, queue: &mut TimerQueue, now: Millis) {
        match self.state {
            DebounceState::Consumed => {}
            DebounceState::Armed(token) => {
                queue.cancel(token);
                self.state = DebounceState::Armed(queue.schedule(now.saturating_add(self.delay), TimerRole::Quiescence));
            }
            DebounceState::Idle => {
                self.state = DebounceState::Armed(queue.schedule(now.saturating_add(self.delay), TimerRole::Quiescence));
            }
        }
    }

    /// Push the pending fire back to `now + delay`. Does nothing unless armed.
    pub fn reset(&mut self, queue: &mut TimerQueue, now: Millis) {
        if let DebounceState::Armed(_) = self.state {
            self.arm(queue, now);
        }
    }

    pub fn cancel(&mut self, queue: &mut TimerQueue) {
        if let DebounceState::Armed(token) = self.state {
            queue.cancel(token);
            self.state = DebounceState::Idle;
        }
    }

    /// Claim a popped token. Returns `true` exactly once, for the live token.
    pub fn fired(&mut self, token: TimerToken) -> bool {
        match self.state {
            DebounceState::Armed(live) if live == token => {
                self.state = DebounceState::Consumed;
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, DebounceState::Armed(_))
    }

    pub fn is_consumed(&self) -> bool {
        self.state == DebounceState::Consumed
    }

    /// Scheduled fire time while armed
    pub fn due(&self, queue: &TimerQueue) -> Option<Millis> {
        match self.state {
            DebounceState::Armed(token) => queue.due_of(token),
            _ => None,
        }
    }
}

/// Hard deadline after which the run is abandoned
#[derive(Debug)]
pub struct AbandonTimer {
    delay: Millis,
    token: Option<TimerToken>,
}

impl AbandonTimer {
    pub fn new(delay: Millis) -> Self {
        Self { delay, token: None }
    }

    pub fn arm(&mut self, queue: &mut TimerQueue, now: Millis) {
        if let Some(token) = self.token.take() {
            queue.cancel(token);
        }
        self.token = Some(queue.schedule(now.saturating_add(self.delay), TimerRole::Abandon));
    }

    pub fn cancel(&mut self, queue: &mut TimerQueue) {
        if let Some(token) = self.token.take() {
            queue.cancel(token);
        }
    }

    /// Claim a popped token. Returns `true` only for the live token.
    pub fn fired(&mut self, token: TimerToken) -> bool {
        if self.token == Some(token) {
            self.token = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_due_then_schedule_order() {
        let mut q = TimerQueue::new();
        let late = q.schedule(50, TimerRole::Abandon);
        let first = q.schedule(10, TimerRole::Quiescence);
        let second = q.schedule(10, TimerRole::ResourceTimeout("1".into()));
        assert_eq!(q.next_due(), Some(10));
        assert!(q.pop_due(9).is_none());
        assert_eq!(q.pop_due(10).map(|(t, _)| t), Some(first));
        assert_eq!(q.pop_due(10).map(|(t, _)| t), Some(second));
        assert!(q.pop_due(10).is_none());
        assert_eq!(q.pop_due(100).map(|(t, _)| t), Some(late));
        assert!(q.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let token = q.schedule(10, TimerRole::Abandon);
        assert!(q.cancel(token));
        assert!(!q.cancel(token));
        assert!(q.pop_due(1_000).is_none());
    }

    #[test]
    fn quiescence_reset_pushes_deadline() {
        let mut q = TimerQueue::new();
        let mut t = QuiescenceTimer::new(500);
        t.arm(&mut q, 0);
        assert_eq!(t.due(&q), Some(500));
        t.reset(&mut q, 400);
        assert_eq!(t.due(&q), Some(900));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn quiescence_reset_before_arm_is_noop() {
        let mut q = TimerQueue::new();
        let mut t = QuiescenceTimer::new(500);
        t.reset(&mut q, 100);
        assert!(!t.is_armed());
        assert!(q.is_empty());
    }

    #[test]
    fn quiescence_fires_once_then_ignores_resets() {
        let mut q = TimerQueue::new();
        let mut t = QuiescenceTimer::new(500);
        t.arm(&mut q, 0);
        let (token, role) = q.pop_due(500).unwrap();
        assert_eq!(role, TimerRole::Quiescence);
        assert!(t.fired(token));
        assert!(!t.fired(token));
        t.reset(&mut q, 600);
        t.arm(&mut q, 600);
        assert!(t.is_consumed());
        assert!(q.is_empty());
    }

    #[test]
    fn stale_quiescence_token_is_rejected() {
        let mut q = TimerQueue::new();
        let mut t = QuiescenceTimer::new(500);
        t.arm(&mut q, 0);
        let stale = q.schedule(0, TimerRole::Quiescence);
        assert!(!t.fired(stale));
        assert!(t.is_armed());
    }

    #[test]
    fn abandon_cancel_disarms() {
        let mut q = TimerQueue::new();
        let mut t = AbandonTimer::new(45_000);
        t.arm(&mut q, 0);
        assert_eq!(q.next_due(), Some(45_000));
        t.cancel(&mut q);
        assert!(!t.is_armed());
        assert!(q.pop_due(u64::MAX).is_none());
    }

    #[test]
    fn huge_delays_saturate_instead_of_overflowing() {
        let mut q = TimerQueue::new();
        let mut quiet = QuiescenceTimer::new(u64::MAX);
        let mut abandon = AbandonTimer::new(u64::MAX);
        quiet.arm(&mut q, 10);
        quiet.reset(&mut q, 20);
        abandon.arm(&mut q, 10);
        assert_eq!(quiet.due(&q), Some(u64::MAX));
        assert_eq!(q.next_due(), Some(u64::MAX));
        assert!(q.pop_due(1_000_000).is_none());
    }
}
