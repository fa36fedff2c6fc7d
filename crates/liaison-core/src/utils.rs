/*!
 * Async helpers shared by the device layer and the server.
 *
 * Device I/O is blocking; these helpers move it onto tokio's blocking pool
 * and bound how long a caller waits for it.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a blocking closure on the blocking thread pool, bounded by an optional timeout.
///
/// The closure is not cancelled when the timeout fires; it runs to completion in the
/// background while the caller gets a timeout error.
pub async fn spawn_blocking_with_timeout<F, T>(duration: Option<Duration>, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    let joined = match duration {
        Some(duration) => match timeout(duration, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(Error::timeout(format!(
                    "Blocking operation timed out after {} ms",
                    duration.as_millis()
                )))
            }
        },
        None => handle.await,
    };
    joined.map_err(|e| Error::runtime(format!("Blocking task failed: {}", e)))
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Current host clock time in seconds since the Unix epoch
pub fn now_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_blocking_with_timeout_success() {
        let result = spawn_blocking_with_timeout(Some(Duration::from_secs(1)), || 7).await;
        assert_eq!(tokio_test::assert_ok!(result), 7);

        let result = spawn_blocking_with_timeout(None, || "done").await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_spawn_blocking_with_timeout_expires() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let result = spawn_blocking_with_timeout(Some(Duration::from_millis(10)), move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        // The closure keeps running after the caller gave up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test_log::test(tokio::test)]
    async fn test_spawn_and_log_runs_future() {
        let handle = spawn_and_log("unit", async { Ok::<_, Error>(()) });
        handle.await.unwrap();
    }

    #[test]
    fn test_now_seconds_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_seconds() > 1_577_836_800.0);
    }
}
