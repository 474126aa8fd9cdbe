//! Deadline-bounded condition waits.
//!
//! Every blocking point in the supervisor (ready, acknowledgement, exit,
//! request drain, child drain) is a predicate re-checked after each wakeup of
//! a [`Notify`]. The notification is armed before the predicate runs so a
//! wakeup between check and sleep is never lost.

use std::future::Future;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Waits until `check` yields a value or `deadline` passes.
///
/// Returns `None` on timeout. The predicate gets one last look after the
/// deadline so a state change racing the timer still wins.
pub(crate) async fn wait_until<T, F>(notify: &Notify, deadline: Instant, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = check() {
            return Some(value);
        }

        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return check();
        }
    }
}

/// Runs `fut` to completion unless `deadline` passes first.
pub(crate) async fn before<F: Future>(deadline: Instant, fut: F) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, fut).await.ok()
}
