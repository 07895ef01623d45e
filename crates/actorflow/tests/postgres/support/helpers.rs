use std::time::Duration;

use actorflow::{ExecutionMode, PgDriver, RetryPolicy, RuntimeConfig};
use sqlx::PgPool;

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("actorflow=debug")
        .with_test_writer()
        .try_init();
}

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver polling fast enough for tests.
pub fn driver(pool: &PgPool, namespace: &str) -> PgDriver {
    PgDriver::new(pool.clone(), namespace).with_poll_interval(Duration::from_millis(10))
}

pub fn test_runtime_config(mode: ExecutionMode) -> RuntimeConfig {
    RuntimeConfig {
        mode,
        retry_policy: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        error_backoff: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}
