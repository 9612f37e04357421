use std::rc::Rc;
use std::time::Duration;

use super::Shared;
use crate::pipe::{Pipe, PipeState};
use crate::types::Role;

impl Shared {
    pub(super) fn debounce_recycle(&self, role: Role) {
        let window = self.recycle_window.get();
        if window.is_zero() {
            return;
        }
        let pipes = self.pool(role).to_vec();
        let (min_idle, idle_timeout) = (self.min_idle, self.idle_timeout);
        self.debouncer
            .debounce(&format!("recycle:{role}"), window, move || {
                recycle(role, &pipes, min_idle, idle_timeout);
            });
    }

    pub(super) fn debounce_ping(&self, role: Role) {
        let window = self.ping_window.get();
        if window.is_zero() {
            return;
        }
        let pipes = self.pool(role).to_vec();
        self.debouncer
            .debounce(&format!("ping:{role}"), window, move || ping(role, &pipes));
    }
}

/// Close idle pipes that have been idle for at least `idle_timeout`, longest-idle first, but
/// keep `min_idle` of them open.
fn recycle(role: Role, pipes: &[Rc<Pipe>], min_idle: usize, idle_timeout: Duration) {
    tracing::debug!(%role, "start recycling pipes");
    let mut candidates: Vec<(&Rc<Pipe>, Duration)> = pipes
        .iter()
        .filter(|pipe| pipe.is_available())
        .map(|pipe| (pipe, pipe.state_duration()))
        .filter(|(_, idle)| *idle >= idle_timeout)
        .collect();

    if candidates.len() <= min_idle {
        tracing::debug!(%role, "finished recycling pipes, nothing to recycle");
        return;
    }
    let closing = candidates.len() - min_idle;
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    for (pipe, idle) in candidates.into_iter().take(closing) {
        pipe.close();
        tracing::debug!(pipe = pipe.id(), ?idle, "pipe closed during recycling");
    }
}

/// Ping pipes in pool order until one answers. Idle pipes that fail are closed.
fn ping(role: Role, pipes: &[Rc<Pipe>]) {
    for pipe in pipes {
        match pipe.state() {
            PipeState::Closed => continue,
            _ if pipe.ping() => {
                tracing::debug!(pipe = pipe.id(), %role, "ping result is good");
                return;
            }
            PipeState::Idle => {
                tracing::warn!(pipe = pipe.id(), %role, "pipe closed since ping failed");
                pipe.close();
            }
            PipeState::Working => {
                tracing::warn!(pipe = pipe.id(), %role, "ping failed");
            }
        }
    }
}
