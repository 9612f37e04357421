use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::driver::{Driver, Link};
use crate::pipe::{Pipe, PipeState};
use crate::scheduler::{self, MIN_TICK, Timer};

/// Working pipes awaiting completion, swept by one shared timer that only runs while the set is
/// non-empty.
pub(crate) struct PollSet {
    driver: Rc<dyn Driver>,
    inner: RefCell<PollInner>,
}

struct PollInner {
    pipes: BTreeMap<u64, Rc<Pipe>>,
    timer: Option<Timer>,
}

impl PollSet {
    pub(crate) fn new(driver: Rc<dyn Driver>) -> Rc<Self> {
        Rc::new(Self {
            driver,
            inner: RefCell::new(PollInner {
                pipes: BTreeMap::new(),
                timer: None,
            }),
        })
    }

    pub(crate) fn register(self: &Rc<Self>, pipe: Rc<Pipe>) {
        let mut inner = self.inner.borrow_mut();
        inner.pipes.insert(pipe.id(), pipe);
        if inner.timer.is_none() {
            let weak: Weak<Self> = Rc::downgrade(self);
            inner.timer = Some(scheduler::every(MIN_TICK, move || {
                if let Some(set) = weak.upgrade() {
                    set.poll();
                }
            }));
        }
    }

    pub(crate) fn remove(&self, pipe_id: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.pipes.remove(&pipe_id);
        if inner.pipes.is_empty() {
            inner.timer = None;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.borrow().pipes.len()
    }

    pub(crate) fn is_polling(&self) -> bool {
        self.inner.borrow().timer.is_some()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.pipes.clear();
        inner.timer = None;
    }

    /// One non-blocking readiness check across every registered link.
    ///
    /// Handled pipes leave the set before they are settled, so settlement may re-enter
    /// `register` or `remove`.
    pub(crate) fn poll(&self) {
        let pipes: Vec<Rc<Pipe>> = self.inner.borrow().pipes.values().cloned().collect();
        if pipes.is_empty() {
            self.inner.borrow_mut().timer = None;
            return;
        }

        let outcome = {
            let mut borrowed: Vec<_> = pipes.iter().map(|pipe| pipe.link_mut()).collect();
            // pipes closed since registration have no link; they were settled by the close
            let (mut links, owners): (Vec<&mut dyn Link>, Vec<usize>) = borrowed
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, link)| {
                    link.as_mut()
                        .map(|link| (&mut ***link as &mut dyn Link, idx))
                })
                .unzip();
            let outcome = self.driver.poll_ready(&mut links);
            let map = |indices: Vec<usize>| -> Vec<Rc<Pipe>> {
                indices
                    .into_iter()
                    .filter_map(|idx| owners.get(idx))
                    .map(|owner| Rc::clone(&pipes[*owner]))
                    .collect()
            };
            (map(outcome.ready), map(outcome.errored), map(outcome.rejected))
        };
        let (ready, errored, rejected) = outcome;

        for pipe in &ready {
            self.remove(pipe.id());
            pipe.reap();
        }
        for pipe in errored.iter().chain(&rejected) {
            self.remove(pipe.id());
            pipe.reject_with_link_error();
        }

        let mut inner = self.inner.borrow_mut();
        inner.pipes.retain(|_, pipe| pipe.in_state(PipeState::Working));
        if inner.pipes.is_empty() {
            inner.timer = None;
        }
    }
}
