#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use super::super::{AttemptFailure, StoreError};

/// Retry and time budget of one logical execution.
#[derive(Debug)]
pub struct ExecutionContext {
    query_id: String,
    max_retries: u32,
    timeout: Duration,
    started: Instant,
    attempts: u32,
}

impl ExecutionContext {
    pub fn new(query_id: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            query_id: query_id.into(),
            max_retries,
            timeout,
            started: Instant::now(),
            attempts: 0,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// Starts the next attempt, or reports why no attempt is left.
    /// `last` is the transient error of the previous attempt.
    pub fn begin_attempt(&mut self, last: Option<StoreError>) -> Result<Instant, StoreError> {
        if self.attempts > self.max_retries {
            return Err(self.exhausted(AttemptFailure::TooManyAttempts, last));
        }
        if self.remaining().is_zero() {
            return Err(self.exhausted(AttemptFailure::NoTimeLeft, last));
        }
        self.attempts += 1;
        Ok(self.deadline())
    }

    fn exhausted(&self, reason: AttemptFailure, last: Option<StoreError>) -> StoreError {
        tracing::warn!(
            query_id = %self.query_id,
            attempts = self.attempts,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "{}",
            reason.message()
        );
        StoreError::FailedAttempt {
            reason,
            attempts: self.attempts,
            last: last.map(Box::new),
        }
    }
}
