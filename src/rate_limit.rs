use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

// Budgets whose window has closed are dropped once this many clients are
// tracked, at most once per window.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug)]
struct ClientBudget {
    count: u32,
    window_start: Instant,
}

struct Budgets {
    clients: HashMap<String, ClientBudget>,
    last_pruned: Option<Instant>,
}

/// Fixed-window request quota per client identity.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    prune_threshold: usize,
    budgets: Mutex<Budgets>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter::with_prune_threshold(limit, window, PRUNE_THRESHOLD)
    }

    fn with_prune_threshold(limit: u32, window: Duration, prune_threshold: usize) -> Self {
        RateLimiter {
            limit,
            window,
            prune_threshold,
            budgets: Mutex::new(Budgets {
                clients: HashMap::new(),
                last_pruned: None,
            }),
        }
    }

    /// Counts one request for `client_id`. Returns `false` once the quota
    /// for the current window is used up.
    pub fn try_acquire(&self, client_id: &str, now: Instant) -> bool {
        let mut budgets = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut budgets, now);

        let budget = budgets.clients.entry(client_id.to_owned()).or_insert(ClientBudget {
            count: 0,
            window_start: now,
        });

        if now.saturating_duration_since(budget.window_start) >= self.window {
            budget.count = 0;
            budget.window_start = now;
        }

        if budget.count >= self.limit {
            return false;
        }
        budget.count += 1;
        true
    }

    fn prune(&self, budgets: &mut Budgets, now: Instant) {
        if budgets.clients.len() < self.prune_threshold {
            return;
        }
        let due = budgets
            .last_pruned
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if !due {
            return;
        }

        let window = self.window;
        let before = budgets.clients.len();
        budgets
            .clients
            .retain(|_, budget| now.saturating_duration_since(budget.window_start) < window);
        budgets.last_pruned = Some(now);
        tracing::debug!(
            dropped = before - budgets.clients.len(),
            tracked = budgets.clients.len(),
            "pruned rate limit budgets"
        );
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.budgets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clients
            .len()
    }
}
