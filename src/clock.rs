//! Injected time source. Production code runs on [`AsyncStdClock`]; tests run
//! on [`ManualClock`] so the inactivity timeout, the relay stagger delay, and
//! the overall connect() deadline can be exercised without actually waiting.
//! Mirrors `src/util.rs::{sleep, timeout}`, which wrap the bare `async-std`
//! calls the same way this trait does.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, thiserror::Error)]
#[error("timed out")]
pub struct Elapsed;

/// Race `fut` against `clock.sleep(duration)`. Returns `Err(Elapsed)` if the
/// sleep wins. Built on `futures_lite::future::race` the way the rest of the
/// crate leans on `futures-lite` for small I/O-adjacent combinators.
pub async fn timeout<C, F>(clock: &C, duration: Duration, fut: F) -> Result<F::Output, Elapsed>
where
    C: Clock + ?Sized,
    F: Future,
{
    let value = futures_lite::future::race(
        async { Ok(fut.await) },
        async {
            clock.sleep(duration).await;
            Err(Elapsed)
        },
    )
    .await;
    value
}

#[derive(Debug, Clone, Default)]
pub struct AsyncStdClock;

#[async_trait]
impl Clock for AsyncStdClock {
    async fn sleep(&self, duration: Duration) {
        async_std::task::sleep(duration).await
    }
}
