//! Exponential backoff shared by every transient-error path.
//!
//! One configuration (see [`crate::config::RetryConfig`]) drives retries
//! of provider RPCs, event uploads and storage transfers. Validation and
//! state-transition failures are never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

type Predicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retries a fallible async operation with jittered exponential backoff.
#[derive(Clone)]
pub struct Retrier {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_elapsed: Duration,
    /// Total attempts including the first. Zero behaves like one.
    pub max_tries: u32,
    should_retry: Option<Predicate>,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("multiplier", &self.multiplier)
            .field("randomization_factor", &self.randomization_factor)
            .field("max_elapsed", &self.max_elapsed)
            .field("max_tries", &self.max_tries)
            .finish()
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Retrier {
    fn from(conf: &RetryConfig) -> Self {
        Self {
            initial_interval: conf.initial_interval,
            max_interval: conf.max_interval,
            multiplier: conf.multiplier,
            randomization_factor: conf.randomization_factor,
            max_elapsed: conf.max_elapsed,
            max_tries: conf.max_tries,
            should_retry: None,
        }
    }
}

impl Retrier {
    /// Override which errors are retried. Errors that are never retryable
    /// (validation, not found, invalid transition) stay that way.
    pub fn should_retry(mut self, f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn max_tries(mut self, n: u32) -> Self {
        self.max_tries = n;
        self
    }

    pub fn initial_interval(mut self, d: Duration) -> Self {
        self.initial_interval = d;
        self
    }

    fn retryable(&self, err: &Error) -> bool {
        if matches!(
            err,
            Error::Validation(_)
                | Error::NotFound(_)
                | Error::InvalidTransition { .. }
                | Error::AlreadyExists(_)
                | Error::Canceled
        ) {
            return false;
        }
        match &self.should_retry {
            Some(pred) => pred(err),
            None => err.is_retryable(),
        }
    }

    /// Delay before retry number `n` (0-based), before jitter.
    pub fn base_delay(&self, n: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(n as i32);
        let secs = (self.initial_interval.as_secs_f64() * factor).min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let r = self.randomization_factor.clamp(0.0, 1.0);
        if r == 0.0 {
            return base;
        }
        let delta = base.as_secs_f64() * r;
        let low = base.as_secs_f64() - delta;
        Duration::from_secs_f64(low + fastrand::f64() * (2.0 * delta))
    }

    /// Run `f` until it succeeds, fails permanently, runs out of tries or
    /// time, or `cancel` fires.
    pub async fn retry<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let max_tries = self.max_tries.max(1);
        let mut tries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            tries += 1;
            if tries >= max_tries || !self.retryable(&err) {
                return Err(err);
            }
            let delay = self.jittered(self.base_delay(tries - 1));
            if start.elapsed() + delay > self.max_elapsed {
                return Err(err);
            }
            debug!(tries, ?delay, "retrying after error: {err}");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
