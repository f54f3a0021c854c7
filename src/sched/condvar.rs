/*
 * Condition Variables
 *
 * A CondVar is nothing more than an unordered list of parked thread ids,
 * embedded in whatever structure its guarding mutex protects. The blocking
 * protocol is split between the caller and the scheduler:
 *
 *   let tid = sched::current();
 *   inner.cond.add_waiter(tid);                       // under the guard
 *   sched::sleep_releasing(Stopped, inner, cause, timeout);
 *   // re-acquire the guard and re-check the predicate
 *
 * sleep_releasing marks the thread Stopped under the scheduler lock before
 * the guard is released, so a signaller holding the same guard can never
 * observe a registered waiter that is not yet asleep. Wakeup ordering across
 * waiters is unspecified; the periodic priority boost keeps it fair.
 *
 * For timed waits the signalled/timed-out distinction falls out of the list:
 * a signaller removes the waiter it wakes, a timeout does not. A timed-out
 * waiter finds itself still registered and deregisters on the way out.
 */

use alloc::collections::VecDeque;

use super::thread::Tid;

pub struct CondVar {
    waiters: VecDeque<Tid>,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar { waiters: VecDeque::new() }
    }

    /// Register a thread about to sleep on this variable.
    pub fn add_waiter(&mut self, tid: Tid) {
        if !self.waiters.contains(&tid) {
            self.waiters.push_back(tid);
        }
    }

    /// Deregister a thread. Returns whether it was still registered; false
    /// means a signaller already claimed (and woke) it.
    pub fn remove_waiter(&mut self, tid: Tid) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&t| t != tid);
        self.waiters.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn take_one(&mut self) -> Option<Tid> {
        self.waiters.pop_front()
    }

    fn take_all(&mut self) -> VecDeque<Tid> {
        core::mem::take(&mut self.waiters)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Wake one waiter, if any.
pub fn signal(cv: &mut CondVar) {
    if let Some(tid) = cv.take_one() {
        super::wakeup(tid);
    }
}

/// Wake every waiter.
pub fn broadcast(cv: &mut CondVar) {
    for tid in cv.take_all() {
        super::wakeup(tid);
    }
}
