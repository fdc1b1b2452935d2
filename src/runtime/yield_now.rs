use crate::time::sleep;

use std::time::Duration;

/// Cooperative yield: lets every other ready task run once.
///
/// Equivalent to `sleep(Duration::ZERO)`; the task always suspends and
/// resumes on a later loop turn.
pub async fn yield_now() {
    sleep(Duration::ZERO).await
}
