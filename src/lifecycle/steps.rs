use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retries named lifecycle stages with exponential backoff.
///
/// Stages must be safe to run more than once; every write they make is keyed
/// on the run's record id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepRunner {
    max_retries: u32,
    base_delay: Duration,
}

impl StepRunner {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Run `op` until it succeeds or the retries are used up.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            debug!(event = "stage_start", stage = name, attempt, "Running stage");
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        stage = name,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %format!("{e:#}"),
                        "Stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.context(format!("stage '{name}' failed"))),
            }
        }
    }
}
