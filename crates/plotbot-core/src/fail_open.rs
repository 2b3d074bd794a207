//! Fail-open helper for housekeeping
//!
//! Archiving progress files, removing temporary output of failed instances
//! and startup cleanup are housekeeping: a failure there is logged and the
//! service keeps going.
//!
//! DO NOT use fail-open for:
//! - Launching plotters
//! - Relocating plots
//! - Delay policy decisions

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run a housekeeping operation, logging instead of propagating its error
///
/// Returns `None` when the operation failed.
///
/// ```no_run
/// use plotbot_core::fail_open::fail_open;
/// use plotbot_core::Result;
///
/// async fn archive_progress_file() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let archived = fail_open("archive progress file", || archive_progress_file()).await;
///     assert!(archived.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlotError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("cleanup", || async { Ok::<_, PlotError>(3) }).await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("cleanup", || async {
            Err::<u32, _>(PlotError::Other("permission denied".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
