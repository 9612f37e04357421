//! Timers shared by the pipe manager, the query manager and transactions.
//!
//! Everything here spawns onto the current [`tokio::task::LocalSet`], so the callbacks may
//! capture `Rc` state. Dropping a [`Timer`] cancels it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest period a repeating timer runs at. "Zero-delay" checks use this.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Handle to a scheduled one-shot or repeating callback.
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
}

impl Timer {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `f` every `period` until the returned timer is cancelled or dropped.
///
/// The first call happens one period from now. Periods shorter than [`MIN_TICK`] are raised
/// to it; periods reaching past the clock's range never fire.
pub fn every<F>(period: Duration, mut f: F) -> Timer
where
    F: FnMut() + 'static,
{
    let period = period.max(MIN_TICK);
    let token = CancellationToken::new();
    let Some(start) = Instant::now().checked_add(period) else {
        return Timer { token };
    };
    let child = token.clone();
    tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = child.cancelled() => break,
                _ = interval.tick() => {
                    if child.is_cancelled() {
                        break;
                    }
                    f();
                }
            }
        }
    });
    Timer { token }
}

/// Run `f` once after `delay` unless the returned timer is cancelled or dropped first.
pub fn after<F>(delay: Duration, f: F) -> Timer
where
    F: FnOnce() + 'static,
{
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::task::spawn_local(async move {
        tokio::select! {
            biased;
            () = child.cancelled() => {}
            () = tokio::time::sleep(delay) => {
                if !child.is_cancelled() {
                    f();
                }
            }
        }
    });
    Timer { token }
}

struct DebounceEntry {
    generation: u64,
    _timer: Timer,
}

/// Debounce-by-key: repeated triggers for one key collapse into a single call that fires after
/// the key has been quiet for the whole window.
#[derive(Clone, Default)]
pub struct Debouncer {
    pending: Rc<RefCell<HashMap<String, DebounceEntry>>>,
    generation: Rc<Cell<u64>>,
}

impl Debouncer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arm `key`: any earlier pending call for the key is dropped and `f` runs once the
    /// window elapses without another trigger.
    pub fn debounce<F>(&self, key: &str, window: Duration, f: F)
    where
        F: FnOnce() + 'static,
    {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let pending = Rc::downgrade(&self.pending);
        let owned_key = key.to_string();
        let timer = after(window, move || {
            if let Some(pending) = pending.upgrade() {
                let mut map = pending.borrow_mut();
                if map
                    .get(&owned_key)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    map.remove(&owned_key);
                }
            }
            f();
        });

        // replacing the entry drops (and so cancels) the previous timer
        self.pending.borrow_mut().insert(
            key.to_string(),
            DebounceEntry {
                generation,
                _timer: timer,
            },
        );
    }

    /// Number of keys with a scheduled, not yet fired call.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.borrow().contains_key(key)
    }

    /// Cancel every scheduled call.
    pub fn cancel_all(&self) {
        let drained: Vec<DebounceEntry> = self.pending.borrow_mut().drain().map(|(_, e)| e).collect();
        drop(drained);
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("pending", &self.pending())
            .finish()
    }
}
