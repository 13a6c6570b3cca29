//! Admission-control quota for accepted connections.
//!
//! A [`Quota`] caps the number of concurrently held [`QuotaPermit`]s. When it
//! is exhausted a caller can register a callback that receives a permit as
//! soon as one is released, so a listener defers its accept instead of
//! failing it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Waiter = Box<dyn FnOnce(QuotaPermit) + Send>;

struct QuotaState {
    max: usize,
    used: usize,
    waiters: VecDeque<Waiter>,
}

struct QuotaInner {
    state: Mutex<QuotaState>,
}

/// Shared connection quota
#[derive(Clone)]
pub struct Quota {
    inner: Arc<QuotaInner>,
}

impl Quota {
    /// Create a quota allowing `max` concurrent permits
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                state: Mutex::new(QuotaState {
                    max,
                    used: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the limit; held permits are unaffected
    pub fn set_max(&self, max: usize) {
        self.state().max = max;
    }

    /// Current limit
    pub fn max(&self) -> usize {
        self.state().max
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.state().used
    }

    /// Callbacks waiting for a permit
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    /// Take a permit if one is free
    pub fn try_acquire(&self) -> Option<QuotaPermit> {
        let mut st = self.state();
        if st.used < st.max {
            st.used += 1;
            return Some(self.permit());
        }
        None
    }

    /// Take a permit now, or arrange for `cb` to receive one later.
    ///
    /// Returns `None` when the callback was queued.
    pub fn acquire_or_wait<F>(&self, cb: F) -> Option<QuotaPermit>
    where
        F: FnOnce(QuotaPermit) + Send + 'static,
    {
        let mut st = self.state();
        if st.used < st.max {
            st.used += 1;
            return Some(self.permit());
        }
        st.waiters.push_back(Box::new(cb));
        None
    }

    fn permit(&self) -> QuotaPermit {
        QuotaPermit {
            quota: Some(self.clone()),
        }
    }

    fn release(&self) {
        let waiter = {
            let mut st = self.state();
            match st.waiters.pop_front() {
                // The slot moves to the waiter without changing `used`
                Some(waiter) if st.used <= st.max => Some(waiter),
                Some(waiter) => {
                    st.waiters.push_front(waiter);
                    st.used -= 1;
                    None
                }
                None => {
                    st.used -= 1;
                    None
                }
            }
        };

        if let Some(waiter) = waiter {
            waiter(self.permit());
        }
    }
}

impl fmt::Debug for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Quota")
            .field("max", &st.max)
            .field("used", &st.used)
            .field("waiting", &st.waiters.len())
            .finish()
    }
}

/// One admitted connection; dropping it frees the slot
pub struct QuotaPermit {
    quota: Option<Quota>,
}

impl fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPermit").finish()
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        if let Some(quota) = self.quota.take() {
            quota.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_acquire_release() {
        let quota = Quota::new(2);
        let a = quota.try_acquire().unwrap();
        let b = quota.try_acquire().unwrap();
        assert!(quota.try_acquire().is_none());
        assert_eq!(quota.in_use(), 2);

        drop(a);
        assert_eq!(quota.in_use(), 1);
        let _c = quota.try_acquire().unwrap();
        drop(b);
        assert_eq!(quota.in_use(), 1);
    }

    #[test]
    fn test_waiter_receives_released_slot() {
        let quota = Quota::new(1);
        let first = quota.try_acquire().unwrap();

        let held: Arc<Mutex<Option<QuotaPermit>>> = Arc::new(Mutex::new(None));
        let slot = held.clone();
        assert!(quota
            .acquire_or_wait(move |permit| {
                *slot.lock().unwrap() = Some(permit);
            })
            .is_none());
        assert_eq!(quota.waiting(), 1);

        drop(first);
        assert!(held.lock().unwrap().is_some());
        assert_eq!(quota.in_use(), 1);
        assert_eq!(quota.waiting(), 0);

        held.lock().unwrap().take();
        assert_eq!(quota.in_use(), 0);
    }

    #[test]
    fn test_dropped_handoff_moves_on() {
        let quota = Quota::new(1);
        let first = quota.try_acquire().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            quota.acquire_or_wait(move |permit| {
                calls.fetch_add(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        // Each waiter drops its permit, which hands the slot to the next one
        drop(first);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(quota.in_use(), 0);
    }

    #[test]
    fn test_shrunk_quota() {
        let quota = Quota::new(2);
        let a = quota.try_acquire().unwrap();
        let b = quota.try_acquire().unwrap();
        quota.set_max(1);

        let woken = Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        quota.acquire_or_wait(move |_permit| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        // Still over the new limit after the first release
        drop(a);
        assert_eq!(woken.load(Ordering::SeqCst), 0);
        assert_eq!(quota.in_use(), 1);

        drop(b);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(quota.in_use(), 0);
    }
}
