//! Helpers for joining terminating tasks

use tokio::task::JoinHandle;

/// Waits for a background task to exit.
///
/// Cancellation is treated as a normal exit. A panic in the task is
/// re-raised in the caller.
pub(crate) async fn join(handle: JoinHandle<()>) {
    match handle.await {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) if err.is_panic() => {
            std::panic::resume_unwind(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error (other than panic or cancellation): {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cancelled_tasks_join_quietly() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        join(handle).await;
    }

    #[tokio::test]
    #[should_panic(expected = "worker failed")]
    async fn panics_propagate() {
        join(tokio::spawn(async { panic!("worker failed") })).await;
    }
}
