//! Bounded polling for a result that is written asynchronously.
//!
//! The poller waits an initial delay so the ingestion side gets a head
//! start, then looks the id up once per interval until a record shows up or
//! the attempt budget runs out. Every miss, the last one included, is
//! followed by one interval of waiting, so the worst case takes
//! `initial_delay + max_attempts * interval`.

use crate::identity::ObjectIdentity;
use crate::result_store::{ResultRecord, ResultStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors returned while awaiting a result
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Analysis timeout - Please try again")]
    Timeout { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Initial delay, interval and attempt count bounding one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollBudget {
    /// Longest time a wait can take before timing out
    pub fn ceiling(&self) -> Duration {
        self.initial_delay + self.interval * self.max_attempts
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            interval: Duration::from_secs(3),
            max_attempts: 20,
        }
    }
}

/// Source of waiting, injectable so the timing contract can be tested
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Progress of one wait
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    /// Initial delay not yet served
    Waiting,
    /// Next lookup to perform, counted from 0
    Polling { attempt: u32 },
    Found(ResultRecord),
    TimedOut { attempts: u32 },
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollState::Found(_) | PollState::TimedOut { .. })
    }
}

/// Waits for the result of one object to appear in the store
pub struct ResultPoller {
    store: Arc<dyn ResultStore>,
    sleeper: Arc<dyn Sleeper>,
    budget: PollBudget,
}

impl ResultPoller {
    pub fn new(store: Arc<dyn ResultStore>, budget: PollBudget) -> Self {
        Self::with_sleeper(store, budget, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        store: Arc<dyn ResultStore>,
        budget: PollBudget,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            sleeper,
            budget,
        }
    }

    /// Wait for a result using the configured budget
    pub async fn await_result(&self, id: &ObjectIdentity) -> Result<ResultRecord, PollError> {
        self.await_result_within(id, &self.budget).await
    }

    /// Wait for a result using an explicit budget
    #[instrument(skip(self, budget), fields(id = %id))]
    pub async fn await_result_within(
        &self,
        id: &ObjectIdentity,
        budget: &PollBudget,
    ) -> Result<ResultRecord, PollError> {
        let mut state = PollState::Waiting;

        loop {
            state = self.step(id, state, budget).await?;

            match state {
                PollState::Found(record) => {
                    metrics::counter!("analysis.poll.found").increment(1);
                    info!(status = record.status.as_str(), "Result found");
                    return Ok(record);
                }
                PollState::TimedOut { attempts } => {
                    metrics::counter!("analysis.poll.timeouts").increment(1);
                    warn!(attempts, "Gave up waiting for result");
                    return Err(PollError::Timeout { attempts });
                }
                _ => {}
            }
        }
    }

    /// Advance a wait by one transition
    ///
    /// Each transition suspends on at most one wait. Terminal states are
    /// returned unchanged.
    pub async fn step(
        &self,
        id: &ObjectIdentity,
        state: PollState,
        budget: &PollBudget,
    ) -> Result<PollState, PollError> {
        match state {
            PollState::Waiting => {
                self.sleeper.sleep(budget.initial_delay).await;
                if budget.max_attempts == 0 {
                    return Ok(PollState::TimedOut { attempts: 0 });
                }
                Ok(PollState::Polling { attempt: 0 })
            }
            PollState::Polling { attempt } => {
                metrics::histogram!("analysis.poll.attempts").record(f64::from(attempt + 1));

                if let Some(stored) = self.store.get(id).await? {
                    debug!(attempt = attempt + 1, "Result visible");
                    return Ok(PollState::Found(stored.normalize()));
                }

                debug!(attempt = attempt + 1, "Result not yet available");
                self.sleeper.sleep(budget.interval).await;

                let attempts = attempt + 1;
                if attempts >= budget.max_attempts {
                    Ok(PollState::TimedOut { attempts })
                } else {
                    Ok(PollState::Polling { attempt: attempts })
                }
            }
            terminal => Ok(terminal),
        }
    }
}
