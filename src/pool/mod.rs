//! Per-role pools of pipes.
//!
//! [`PipeManager`] owns every pipe, hands them out as [`PipeLease`]s, queues acquisitions it
//! cannot satisfy on a bounded waiting list, and runs the idle-recycle and health-ping
//! maintenance.

mod maintenance;
mod waiting;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::config::PipesConfig;
use crate::driver::Driver;
use crate::error::SqlPipesError;
use crate::pipe::{Pipe, PipeLease};
use crate::scheduler::{self, Debouncer, MIN_TICK, Timer};
use crate::transaction::Transaction;
use crate::types::Role;

use waiting::{LeaseReceiver, WaitTag, WaitingList};

/// Cloneable handle to the pipe pools.
#[derive(Clone)]
pub struct PipeManager {
    shared: Rc<Shared>,
}

struct Shared {
    write: Vec<Rc<Pipe>>,
    read: Vec<Rc<Pipe>>,
    min_idle: usize,
    idle_timeout: Duration,
    waiting: RefCell<WaitingList>,
    resolver: RefCell<Option<Timer>>,
    debouncer: Debouncer,
    recycle_window: Cell<Duration>,
    ping_window: Cell<Duration>,
    recycle_timer: RefCell<Option<Timer>>,
    ping_timer: RefCell<Option<Timer>>,
}

impl PipeManager {
    /// Build both pools from `config` and open the first `min_num_idle_connections` pipes of
    /// each. Open failures are logged and the pipes are retried on demand.
    ///
    /// Must be called inside a [`tokio::task::LocalSet`].
    ///
    /// # Errors
    /// Returns [`SqlPipesError::Config`] when `config` fails validation.
    pub fn new(config: &PipesConfig, driver: Rc<dyn Driver>) -> Result<Self, SqlPipesError> {
        config.validate()?;

        let mut next_id = 0;
        let mut build = |role: Role| -> Vec<Rc<Pipe>> {
            tracing::debug!(%role, "initializing pipes");
            config
                .credentials(role)
                .into_iter()
                .enumerate()
                .map(|(slot, credential)| {
                    next_id += 1;
                    let pipe = Rc::new(Pipe::new(next_id, role, credential, Rc::clone(&driver)));
                    if slot < config.min_num_idle_connections {
                        pipe.open();
                    }
                    pipe
                })
                .collect()
        };
        let write = build(Role::Write);
        let read = build(Role::Read);

        Ok(Self {
            shared: Rc::new(Shared {
                write,
                read,
                min_idle: config.min_num_idle_connections,
                idle_timeout: config.idle_timeout,
                waiting: RefCell::new(WaitingList::new(config.waiting_list_size)),
                resolver: RefCell::new(None),
                debouncer: Debouncer::new(),
                recycle_window: Cell::new(Duration::ZERO),
                ping_window: Cell::new(Duration::ZERO),
                recycle_timer: RefCell::new(None),
                ping_timer: RefCell::new(None),
            }),
        })
    }

    /// Acquire a pipe of `role`.
    ///
    /// An idle pipe is leased at once; otherwise a closed one is reopened; otherwise the request
    /// joins the waiting list. While earlier requests for `role` are still queued the new one
    /// queues behind them. The capacity check happens here, not when the future is polled.
    pub fn get(&self, role: Role) -> Acquire {
        let tag = WaitTag::Role(role);
        let selected = if self.shared.waiting.borrow().is_queued(&tag) {
            None
        } else {
            self.shared.select(role)
        };
        if let Some(pipe) = selected {
            return Acquire::ready(Ok(PipeLease::new(pipe)));
        }
        tracing::debug!(%role, "put on waiting list");
        self.enqueue(tag)
    }

    /// Acquire the pipe pinned to `transaction`.
    ///
    /// Fails with [`SqlPipesError::TransactionState`] if the transaction is closed. Waits while
    /// the pinned pipe is busy.
    pub fn get_by_transaction(&self, transaction: &Transaction) -> Acquire {
        if !transaction.is_active() {
            return Acquire::ready(Err(SqlPipesError::TransactionState(
                "transaction is closed".into(),
            )));
        }
        let tag = WaitTag::Transaction(transaction.clone());
        let selected = if self.shared.waiting.borrow().is_queued(&tag) {
            None
        } else {
            self.shared.select_pinned(transaction)
        };
        if let Some(pipe) = selected {
            return Acquire::ready(Ok(PipeLease::new(pipe)));
        }
        tracing::debug!(?transaction, "put on waiting list");
        self.enqueue(tag)
    }

    fn enqueue(&self, tag: WaitTag) -> Acquire {
        let pushed = self.shared.waiting.borrow_mut().push(tag);
        match pushed {
            Ok((id, receiver)) => {
                self.shared.arm_resolver();
                Acquire {
                    state: AcquireState::Waiting {
                        id,
                        receiver,
                        manager: Rc::downgrade(&self.shared),
                    },
                }
            }
            Err(err) => {
                tracing::warn!("waiting list is full");
                Acquire::ready(Err(err))
            }
        }
    }

    /// Window for the debounced idle recycle. Zero disables recycling.
    ///
    /// When enabled, a periodic trigger fires every idle timeout in addition to the trigger
    /// after each statement.
    pub fn set_recycle_debounce(&self, window: Duration) {
        let shared = &self.shared;
        shared.recycle_window.set(window);
        shared.recycle_timer.borrow_mut().take();
        if window.is_zero() {
            return;
        }
        let weak = Rc::downgrade(shared);
        let timer = scheduler::every(shared.idle_timeout, move || {
            if let Some(shared) = weak.upgrade() {
                for role in [Role::Read, Role::Write] {
                    shared.debounce_recycle(role);
                }
            }
        });
        *shared.recycle_timer.borrow_mut() = Some(timer);
    }

    /// Window for the debounced health ping. Zero disables pinging.
    ///
    /// When enabled, every pool is checked at least every ten windows.
    pub fn set_ping_debounce(&self, window: Duration) {
        let shared = &self.shared;
        shared.ping_window.set(window);
        shared.ping_timer.borrow_mut().take();
        if window.is_zero() {
            return;
        }
        let weak = Rc::downgrade(shared);
        let timer = scheduler::every(window.saturating_mul(10), move || {
            if let Some(shared) = weak.upgrade() {
                for role in [Role::Read, Role::Write] {
                    shared.debounce_ping(role);
                }
            }
        });
        *shared.ping_timer.borrow_mut() = Some(timer);
    }

    /// Schedule an idle recycle of `role`, collapsing with any already scheduled.
    pub fn debounce_recycle(&self, role: Role) {
        self.shared.debounce_recycle(role);
    }

    /// Schedule a health ping of `role`, collapsing with any already scheduled.
    pub fn debounce_ping(&self, role: Role) {
        self.shared.debounce_ping(role);
    }

    /// Close every pipe and reject every queued request.
    ///
    /// Pipes reopen on the next acquisition.
    pub fn close(&self) {
        let shared = &self.shared;
        for pipe in shared.write.iter().chain(&shared.read) {
            pipe.close();
        }

        shared.resolver.borrow_mut().take();
        shared.recycle_timer.borrow_mut().take();
        shared.ping_timer.borrow_mut().take();
        let waiters = shared.waiting.borrow_mut().drain();
        for waiter in waiters {
            let _ = waiter.send(Err(SqlPipesError::Pipe("pipe manager closed".into())));
        }
        shared.debouncer.cancel_all();
        tracing::debug!("pipe manager closed");
    }

    /// Pipes of `role`, in pool order.
    #[must_use]
    pub fn pipes(&self, role: Role) -> &[Rc<Pipe>] {
        self.shared.pool(role)
    }

    /// Requests currently on the waiting list.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.shared.waiting.borrow().len()
    }

    #[must_use]
    pub fn waiting_list_size(&self) -> usize {
        self.shared.waiting.borrow().capacity()
    }

    /// Debounced maintenance actions scheduled but not yet run.
    #[must_use]
    pub fn pending_maintenance(&self) -> usize {
        self.shared.debouncer.pending()
    }
}

impl fmt::Debug for PipeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.shared;
        f.debug_struct("PipeManager")
            .field("write", &shared.write.len())
            .field("read", &shared.read.len())
            .field("min_idle", &shared.min_idle)
            .field("idle_timeout", &shared.idle_timeout)
            .field("waiting", &shared.waiting.borrow().len())
            .field("recycle_window", &shared.recycle_window.get())
            .field("ping_window", &shared.ping_window.get())
            .finish()
    }
}

impl Shared {
    fn pool(&self, role: Role) -> &[Rc<Pipe>] {
        match role {
            Role::Write => &self.write,
            Role::Read => &self.read,
        }
    }

    /// First idle pipe of `role`, else the first closed one that reopens.
    fn select(&self, role: Role) -> Option<Rc<Pipe>> {
        let pool = self.pool(role);
        let found = pool
            .iter()
            .find(|pipe| pipe.is_available())
            .inspect(|pipe| tracing::debug!(pipe = pipe.id(), %role, "found an idle pipe"))
            .or_else(|| {
                pool.iter()
                    .filter(|pipe| pipe.is_reopenable())
                    .find(|pipe| pipe.open())
                    .inspect(|pipe| tracing::debug!(pipe = pipe.id(), %role, "reopened a pipe"))
            })
            .cloned();
        if found.is_some() {
            self.debounce_ping(role);
        }
        found
    }

    fn select_pinned(&self, transaction: &Transaction) -> Option<Rc<Pipe>> {
        let pipe = transaction.pipe()?;
        if pipe.state() == crate::pipe::PipeState::Idle && !pipe.is_leased() {
            self.debounce_ping(pipe.role());
            Some(pipe)
        } else {
            None
        }
    }

    fn arm_resolver(self: &Rc<Self>) {
        if self.resolver.borrow().is_some() {
            return;
        }
        let weak = Rc::downgrade(self);
        let timer = scheduler::every(MIN_TICK, move || {
            if let Some(shared) = weak.upgrade() {
                shared.resolve_waiting();
            }
        });
        *self.resolver.borrow_mut() = Some(timer);
    }

    /// One pass over the waiting list in request order. Each request is retried on its own,
    /// so a request that cannot be served does not hold back later ones with other tags.
    fn resolve_waiting(&self) {
        let snapshot = self.waiting.borrow().snapshot();
        let mut resolved = 0;
        for (id, tag) in snapshot {
            if !self.waiting.borrow().contains(id) {
                continue;
            }
            let outcome = match &tag {
                WaitTag::Role(role) => self.select(*role).map(Ok),
                WaitTag::Transaction(transaction) if !transaction.is_active() => Some(Err(
                    SqlPipesError::TransactionState("transaction is closed".into()),
                )),
                WaitTag::Transaction(transaction) => self.select_pinned(transaction).map(Ok),
            };
            let Some(outcome) = outcome else {
                continue;
            };
            let Some(sender) = self.waiting.borrow_mut().remove(id) else {
                continue;
            };
            resolved += 1;
            let _ = sender.send(outcome.map(PipeLease::new));
        }
        if resolved > 0 {
            tracing::debug!("resolved {resolved} waiting request(s)");
        }
        if self.waiting.borrow().is_empty() {
            self.resolver.borrow_mut().take();
        }
    }

    fn remove_waiter(&self, id: u64) {
        let removed = self.waiting.borrow_mut().remove(id);
        if removed.is_some() {
            tracing::debug!(request = id, "waiting request withdrawn");
        }
        if self.waiting.borrow().is_empty() {
            self.resolver.borrow_mut().take();
        }
    }
}

/// Pending acquisition from a [`PipeManager`].
///
/// Dropping it while it is still on the waiting list withdraws the request.
pub struct Acquire {
    state: AcquireState,
}

enum AcquireState {
    Ready(Option<Result<PipeLease, SqlPipesError>>),
    Waiting {
        id: u64,
        receiver: LeaseReceiver,
        manager: Weak<Shared>,
    },
    Done,
}

impl Acquire {
    fn ready(result: Result<PipeLease, SqlPipesError>) -> Self {
        Self {
            state: AcquireState::Ready(Some(result)),
        }
    }

    /// Whether the request is queued on the waiting list.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, AcquireState::Waiting { .. })
    }

    /// Whether the request already failed, without waiting.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, AcquireState::Ready(Some(Err(_))))
    }

    /// Withdraw the request. The future then resolves to [`SqlPipesError::Cancelled`].
    pub fn cancel(&mut self) {
        self.withdraw();
        self.state = AcquireState::Ready(Some(Err(SqlPipesError::Cancelled)));
    }

    fn withdraw(&mut self) {
        if let AcquireState::Waiting { id, manager, .. } = &self.state {
            if let Some(shared) = manager.upgrade() {
                shared.remove_waiter(*id);
            }
        }
    }
}

impl Future for Acquire {
    type Output = Result<PipeLease, SqlPipesError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let output = match &mut this.state {
            AcquireState::Ready(result) => result
                .take()
                .unwrap_or_else(|| Err(SqlPipesError::Usage("acquisition already completed".into()))),
            AcquireState::Waiting { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(received) => received.unwrap_or_else(|_| {
                    Err(SqlPipesError::Pipe("pipe manager dropped".into()))
                }),
            },
            AcquireState::Done => {
                Err(SqlPipesError::Usage("acquisition already completed".into()))
            }
        };
        this.state = AcquireState::Done;
        Poll::Ready(output)
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl fmt::Debug for Acquire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            AcquireState::Ready(_) => "ready",
            AcquireState::Waiting { .. } => "waiting",
            AcquireState::Done => "done",
        };
        f.debug_struct("Acquire").field("state", &state).finish()
    }
}
