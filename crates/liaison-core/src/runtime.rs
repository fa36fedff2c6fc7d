/*!
 * Runtime construction for Liaison.
 *
 * The binary builds its tokio runtime here so that worker thread counts come
 * from configuration instead of the `#[tokio::main]` defaults.
 */
use tokio::runtime::Builder as TokioRuntimeBuilder;
use tokio::runtime::Runtime as TokioRuntime;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

/// Build the multi-threaded tokio runtime described by `config`
pub fn build_runtime(config: &RuntimeConfig) -> Result<TokioRuntime> {
    let mut builder = TokioRuntimeBuilder::new_multi_thread();
    builder.enable_all().thread_name("liaison-worker");

    // 0 lets tokio pick one worker per core
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }

    let runtime = builder
        .build()
        .map_err(|e| Error::runtime(format!("Failed to create Tokio runtime: {}", e)))?;

    info!(
        worker_threads = config.worker_threads,
        "Created Liaison runtime"
    );
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_runtime_with_fixed_workers() {
        let config = RuntimeConfig {
            worker_threads: 2,
            ..RuntimeConfig::default()
        };
        let runtime = build_runtime(&config).unwrap();
        let value = runtime.block_on(async { 40 + 2 });
        assert_eq!(value, 42);
    }

    #[test]
    fn test_build_runtime_default_workers() {
        let runtime = build_runtime(&RuntimeConfig::default()).unwrap();
        runtime.block_on(async {
            tokio::task::yield_now().await;
        });
    }
}
