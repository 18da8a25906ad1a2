//! File-readiness waiter.
//!
//! The converter materialises its output asynchronously and gives no other
//! completion signal, so the only way to know a PDF or page image is ready is
//! to poll for it. A `false` return is a stage failure for the caller to
//! handle, never a panic.

use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

/// Poll for `path` every `poll` until it exists or `timeout` elapses.
///
/// Always checks at least once, so a zero timeout is a plain existence test.
pub async fn await_file(path: &Path, timeout: Duration, poll: Duration) -> bool {
    let start = Instant::now();
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!("File {} found after {:?}", path.display(), start.elapsed());
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            error!(
                "File {} not found after {}s",
                path.display(),
                timeout.as_secs_f32()
            );
            return false;
        }
        sleep(poll.min(timeout - elapsed)).await;
    }
}
