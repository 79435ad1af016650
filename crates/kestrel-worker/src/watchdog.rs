use std::time::{Duration, Instant};

use kestrel_core::panic_payload_to_str;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Runs `f` on a dedicated thread and waits up to `timeout` for it to finish.
///
/// On timeout or cancellation the thread is left running; the caller is expected to
/// unblock it (for a backend call, by killing the process it is waiting on). Panics inside
/// `f` are caught and reported as [`TaskError::Panicked`].
pub fn run_with_timeout<T, F>(
    timeout: Duration,
    cancel_token: &CancellationToken,
    f: F,
) -> Result<T, TaskError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if cancel_token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let (tx, rx) = crossbeam_channel::bounded::<Result<T, TaskError>>(1);
    let spawned = std::thread::Builder::new()
        .name("kestrel-job".to_owned())
        .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_payload_to_str(&*payload).to_owned()));
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        return Err(TaskError::Panicked(format!("failed to spawn job thread: {err}")));
    }

    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(5);

    loop {
        if cancel_token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TaskError::DeadlineExceeded(timeout));
        }

        match rx.recv_timeout(remaining.min(poll_interval)) {
            Ok(result) => return result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(TaskError::Panicked("job thread exited without a result".to_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_the_value_of_a_fast_task() {
        let token = CancellationToken::new();
        assert_eq!(run_with_timeout(Duration::from_secs(5), &token, || 7_u32), Ok(7));
    }

    #[test]
    fn deadline_is_enforced_for_a_stuck_task() {
        let token = CancellationToken::new();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let start = Instant::now();

        let result = run_with_timeout(Duration::from_millis(50), &token, move || {
            let _ = release_rx.recv();
        });

        assert_eq!(result, Err(TaskError::DeadlineExceeded(Duration::from_millis(50))));
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(release_tx);
    }

    #[test]
    fn panics_are_reported() {
        let token = CancellationToken::new();
        let result = run_with_timeout(Duration::from_secs(5), &token, || -> u32 { panic!("boom") });
        assert_eq!(result, Err(TaskError::Panicked("boom".to_owned())));
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_with_timeout(Duration::from_secs(5), &token, || 1_u32);
        assert_eq!(result, Err(TaskError::Cancelled));
    }
}
