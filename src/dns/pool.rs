//! Recursor failover with per-recursor failure history
//!
//! Each recursor keeps a fixed window of its most recent outcomes and a
//! running count of the failures inside that window. Work always starts at
//! the preferred recursor; when that recursor has failed too often within its
//! window the preference moves on to the next one.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::error::{DnsError, DnsResult};

/// Outcomes remembered per recursor
pub const FAIL_HISTORY_LENGTH: usize = 25;

/// Failures within the window before the preference shifts
pub const FAIL_HISTORY_THRESHOLD: i32 = 5;

struct Recursor {
    addr: SocketAddr,
    /// `true` marks a failed attempt; always exactly `FAIL_HISTORY_LENGTH` long
    history: Mutex<VecDeque<bool>>,
    fail_count: AtomicI32,
}

impl Recursor {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            history: Mutex::new(VecDeque::from(vec![false; FAIL_HISTORY_LENGTH])),
            fail_count: AtomicI32::new(0),
        }
    }

    /// Age out the oldest outcome, record the newest, and return the updated
    /// failure count
    fn register_result(&self, was_error: bool) -> i32 {
        let oldest = {
            let mut history = self.history.lock();
            let oldest = history.pop_front().unwrap_or(false);
            history.push_back(was_error);
            oldest
        };

        let change = i32::from(was_error) - i32::from(oldest);
        self.fail_count.fetch_add(change, Ordering::SeqCst) + change
    }
}

/// Ordered recursors with a rotating preferred index
pub struct FailoverRecursorPool {
    recursors: Vec<Recursor>,
    preferred: AtomicUsize,
}

impl FailoverRecursorPool {
    #[must_use]
    pub fn new(addrs: &[SocketAddr]) -> Self {
        if let Some(first) = addrs.first() {
            info!(recursor = %first, "Starting with recursor");
        }
        Self {
            recursors: addrs.iter().copied().map(Recursor::new).collect(),
            preferred: AtomicUsize::new(0),
        }
    }

    /// Recursor addresses in configured order
    pub fn recursors(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.recursors.iter().map(|r| r.addr)
    }

    /// Index of the recursor tried first
    #[must_use]
    pub fn preferred_index(&self) -> usize {
        match self.recursors.len() {
            0 => 0,
            n => self.preferred.load(Ordering::SeqCst) % n,
        }
    }

    /// Failures currently inside a recursor's window
    #[must_use]
    pub fn fail_count(&self, index: usize) -> Option<i32> {
        self.recursors
            .get(index)
            .map(|r| r.fail_count.load(Ordering::SeqCst))
    }

    /// Run `work` against recursors starting at the preferred one until one
    /// succeeds
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NoUpstream`] when every recursor failed.
    pub async fn perform_strategically<F, Fut, T>(&self, mut work: F) -> DnsResult<T>
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = DnsResult<T>>,
    {
        let count = self.recursors.len();
        let offset = self.preferred.load(Ordering::SeqCst);

        for i in 0..count {
            let recursor = &self.recursors[(i + offset) % count];

            match work(recursor.addr).await {
                Ok(value) => {
                    recursor.register_result(false);
                    return Ok(value);
                }
                Err(e) => {
                    debug!(recursor = %recursor.addr, error = %e, "Recursor failed");
                    let failures = recursor.register_result(true);
                    if i == 0 && failures >= FAIL_HISTORY_THRESHOLD {
                        self.shift_preference();
                    }
                }
            }
        }

        Err(DnsError::no_upstream("No response from recursors"))
    }

    fn shift_preference(&self) {
        let next = self.preferred.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = self.recursors[next % self.recursors.len()].addr;
        info!(recursor = %addr, "Shifting to recursor");
    }
}
