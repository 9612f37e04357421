use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::pipe::Pipe;
use crate::scheduler::{self, Timer};

pub const START_TRANSACTION: &str = "START TRANSACTION";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

/// Deadline applied when the caller does not give one.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(180);

/// Exclusive, time-bounded pin of one pipe.
///
/// A transaction is ACTIVE while it holds its pipe and CLOSED afterwards. While active, only
/// acquisitions naming this transaction are handed the pipe. If neither commit nor rollback
/// happens before the deadline the pipe is force-closed and the transaction with it.
///
/// Clones share state; equality is identity.
#[derive(Clone)]
pub struct Transaction {
    shared: Rc<TxShared>,
}

struct TxShared {
    pipe_id: u64,
    inner: RefCell<TxInner>,
}

struct TxInner {
    pipe: Option<Rc<Pipe>>,
    timer: Option<Timer>,
}

impl Transaction {
    /// Pin `pipe` and arm the abandonment timer.
    pub(crate) fn begin(pipe: &Rc<Pipe>, deadline: Duration) -> Self {
        let shared = Rc::new(TxShared {
            pipe_id: pipe.id(),
            inner: RefCell::new(TxInner {
                pipe: Some(Rc::clone(pipe)),
                timer: None,
            }),
        });
        pipe.set_transaction(Some(WeakTransaction(Rc::downgrade(&shared))));

        let weak = Rc::downgrade(&shared);
        let timer = scheduler::after(deadline, move || {
            if let Some(shared) = weak.upgrade() {
                tracing::warn!(
                    pipe = shared.pipe_id,
                    "transaction exceeded its {deadline:?} deadline, abandoning"
                );
                Transaction { shared }.close();
            }
        });
        shared.inner.borrow_mut().timer = Some(timer);
        tracing::debug!(pipe = pipe.id(), ?deadline, "transaction started");
        Self { shared }
    }

    /// The pinned pipe, while active.
    #[must_use]
    pub fn pipe(&self) -> Option<Rc<Pipe>> {
        self.shared.inner.borrow().pipe.clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.inner.borrow().pipe.is_some()
    }

    /// Close the transaction and force-close its pipe. Uncommitted work is lost.
    pub fn close(&self) {
        if let Some(pipe) = self.unpin() {
            pipe.close();
        }
    }

    /// End the transaction after a successful commit or rollback, handing the pipe back to the
    /// pool open.
    pub(crate) fn finish(&self) {
        if let Some(pipe) = self.unpin() {
            tracing::debug!(pipe = pipe.id(), "transaction finished");
        }
    }

    fn unpin(&self) -> Option<Rc<Pipe>> {
        let (pipe, timer) = {
            let mut inner = self.shared.inner.borrow_mut();
            (inner.pipe.take(), inner.timer.take())
        };
        drop(timer);
        if let Some(pipe) = &pipe {
            pipe.set_transaction(None);
        }
        pipe
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("pipe", &self.shared.pipe_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for TxShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.timer.take();
        if let Some(pipe) = inner.pipe.take() {
            tracing::warn!(pipe = pipe.id(), "transaction dropped while active, closing its pipe");
            pipe.set_transaction(None);
            pipe.close();
        }
    }
}

/// Non-owning reference from a pipe back to the transaction pinning it.
#[derive(Clone)]
pub(crate) struct WeakTransaction(Weak<TxShared>);

impl WeakTransaction {
    pub(crate) fn upgrade(&self) -> Option<Transaction> {
        self.0.upgrade().map(|shared| Transaction { shared })
    }
}
