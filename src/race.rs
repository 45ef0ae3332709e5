//! "There can be only one": a fixed set of concurrent attempts where the
//! first success wins and cancels the rest, and the first recorded failure
//! is returned only if every contender fails. Ported in naming intent (not
//! literally) from the Python original's `_ThereCanBeOnlyOne` class, which
//! tracks `_remaining`/`_first_failure`/`_have_winner` the same way; the
//! cancel-the-losers mechanics come from the legacy
//! `src/transit.rs::{leader_connect, follower_connect}` race loops, which
//! use `futures::future::select_all` plus `JoinHandle::cancel` the same way.

use async_std::task::JoinHandle;

/// `async-std`'s `JoinHandle` detaches rather than cancels its task on
/// `Drop`. If this race future itself is dropped mid-flight (the outer
/// `connect()` is cancelled, or the overall timeout elapses), the
/// contenders still in `remaining` need an explicit cancel, not a detach.
/// This guard spawns a small cleanup task to do that on drop.
struct CancelRemainingOnDrop<T: Send + 'static, E: Send + 'static> {
    handles: Vec<JoinHandle<Result<T, E>>>,
}

impl<T, E> CancelRemainingOnDrop<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn new(handles: Vec<JoinHandle<Result<T, E>>>) -> Self {
        CancelRemainingOnDrop { handles }
    }

    fn take(&mut self) -> Vec<JoinHandle<Result<T, E>>> {
        std::mem::take(&mut self.handles)
    }
}

impl<T, E> Drop for CancelRemainingOnDrop<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        spawn_cancel_all(handles);
    }
}

/// Cancel every handle in `handles` on a background task, rather than just
/// detaching them by letting the `Vec` drop. Shared by
/// [`CancelRemainingOnDrop`] and `listener::accept_race`'s own pending set,
/// which needs the same treatment when one inbound negotiation wins while
/// others are still in flight.
pub(crate) fn spawn_cancel_all<T, E>(handles: Vec<JoinHandle<Result<T, E>>>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    if handles.is_empty() {
        return;
    }
    tracing::trace!(count = handles.len(), "cancelling remaining contenders");
    async_std::task::spawn(async move {
        for handle in handles {
            handle.cancel().await;
        }
    });
}

pub async fn there_can_be_only_one<T, E>(contenders: Vec<JoinHandle<Result<T, E>>>) -> Result<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let mut guard = CancelRemainingOnDrop::new(contenders);
    let mut first_failure = None;

    loop {
        let remaining = guard.take();
        if remaining.is_empty() {
            return Err(first_failure.expect(
                "there_can_be_only_one: no contenders were offered, or the last one vanished without a failure",
            ));
        }
        let (settled, _index, rest) = futures::future::select_all(remaining).await;
        guard = CancelRemainingOnDrop::new(rest);

        match settled {
            Ok(value) => {
                tracing::debug!("contender won the race");
                // CancelRemainingOnDrop's Drop impl takes care of the rest.
                return Ok(value);
            }
            Err(err) => {
                tracing::trace!("a contender failed");
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
            }
        }
    }
}
