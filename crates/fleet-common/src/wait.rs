use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::{FleetError, Result};

/// Deadline and cancellation for a blocking operation.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs `fut` under the deadline and cancellation of `opts`.
///
/// Cancellation wins over a simultaneously expiring deadline.
pub async fn bounded<T, F>(
    opts: &WaitOptions,
    operation: &'static str,
    name: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Err(FleetError::Cancelled {
            operation,
            name: name.to_string(),
        }),
        res = timeout(opts.timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(FleetError::Timeout {
                operation,
                name: name.to_string(),
                after: opts.timeout,
            }),
        },
    }
}

/// Calls `check` every `interval` until it yields a value, the deadline
/// passes, or the wait is cancelled. Errors from `check` end the wait.
pub async fn poll_until<T, F, Fut>(
    opts: &WaitOptions,
    interval: Duration,
    operation: &'static str,
    name: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    bounded(opts, operation, name, async move {
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            sleep(interval).await;
        }
    })
    .await
}
