//! Advisory rate-limit bookkeeping
//!
//! Remembers the most recent `Retry-After` a provider sent with a
//! `RateLimited` error. Callers may consult it before issuing a call; the
//! runtime never blocks or rejects on its basis.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::classify::MAX_RETRY_AFTER;
use crate::error::{CanonicalError, ErrorKind};

/// Per-provider "limited until" instants, shared across runtimes of one registry
#[derive(Debug, Default)]
pub struct RateLimitBook {
    providers: DashMap<String, Instant>,
}

impl RateLimitBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a failed call; only `RateLimited` errors with a known delay count
    pub fn record(&self, provider: &str, error: &CanonicalError) {
        if error.kind() != ErrorKind::RateLimited {
            return;
        }
        let Some(retry_after) = error.retry_after() else {
            return;
        };

        let retry_after = retry_after.min(MAX_RETRY_AFTER);
        let Some(until) = Instant::now().checked_add(retry_after) else {
            return;
        };
        self.providers
            .entry(provider.to_owned())
            .and_modify(|current| *current = (*current).max(until))
            .or_insert(until);
        tracing::debug!(provider, retry_after_secs = retry_after.as_secs(), "provider rate limited");
    }

    /// Forget the provider's limit after a successful call
    pub fn record_success(&self, provider: &str) {
        self.providers.remove(provider);
    }

    /// Remaining advisory wait, if the provider is still limited
    pub fn advisory_wait(&self, provider: &str) -> Option<Duration> {
        let until = *self.providers.get(provider)?;
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.providers.remove_if(provider, |_, at| *at <= Instant::now());
            return None;
        }
        Some(remaining)
    }
}
