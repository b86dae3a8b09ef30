use std::{future::Future, pin::pin, time::Duration};

use futures_util::future::{select, Either};
use once_cell::sync::OnceCell;

use crate::{error::Error, Result};

/// Handle to the runtime the tracker spawns its tasks on.
///
/// Backed by a `smol` executor, or by a `tokio` runtime handle when the
/// `tokio` feature is selected. Cloning is cheap.
#[derive(Clone)]
pub struct Executor {
    #[cfg(feature = "smol")]
    inner: std::sync::Arc<smol::Executor<'static>>,
    #[cfg(feature = "tokio")]
    inner: tokio::runtime::Handle,
}

impl Executor {
    /// Spawns `future` and lets it run to completion on its own.
    pub fn spawn_detached(&self, future: impl Future<Output = ()> + Send + 'static) {
        #[cfg(feature = "smol")]
        self.inner.spawn(future).detach();
        #[cfg(feature = "tokio")]
        drop(self.inner.spawn(future));
    }
}

#[cfg(feature = "smol")]
impl From<std::sync::Arc<smol::Executor<'static>>> for Executor {
    fn from(inner: std::sync::Arc<smol::Executor<'static>>) -> Self {
        Self { inner }
    }
}

#[cfg(feature = "tokio")]
impl From<tokio::runtime::Handle> for Executor {
    fn from(inner: tokio::runtime::Handle) -> Self {
        Self { inner }
    }
}

static GLOBAL_EXECUTOR: OnceCell<Executor> = OnceCell::new();

/// Returns the process-wide executor, started on first use on a dedicated
/// `muddle-runtime` thread.
pub fn global_executor() -> Executor {
    GLOBAL_EXECUTOR.get_or_init(start_global).clone()
}

#[cfg(feature = "smol")]
fn start_global() -> Executor {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let ex = std::sync::Arc::new(smol::Executor::new());
    let runner = ex.clone();
    std::thread::Builder::new()
        .name("muddle-runtime".into())
        .spawn(move || loop {
            // A panicking task unwinds through `run`, start it again.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                smol::block_on(runner.run(std::future::pending::<()>()))
            }));
        })
        .expect("cannot spawn the runtime thread");
    ex.into()
}

#[cfg(feature = "tokio")]
fn start_global() -> Executor {
    static RUNTIME: OnceCell<tokio::runtime::Runtime> = OnceCell::new();
    let rt = RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("muddle-runtime")
            .enable_all()
            .build()
            .expect("cannot build the tokio runtime")
    });
    rt.handle().clone().into()
}

/// Drives `future` to completion on the calling thread.
pub fn block_on<T>(future: impl Future<Output = T>) -> T {
    #[cfg(feature = "smol")]
    return smol::block_on(future);
    #[cfg(feature = "tokio")]
    return tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("cannot build the tokio runtime")
        .block_on(future);
}

pub async fn sleep(duration: Duration) {
    #[cfg(feature = "smol")]
    smol::Timer::after(duration).await;
    #[cfg(feature = "tokio")]
    tokio::time::sleep(duration).await;
}

/// Resolves to the output of `future`, or to [`Error::Timeout`] once `delay`
/// has passed.
pub async fn timeout<T>(delay: Duration, future: impl Future<Output = T>) -> Result<T> {
    match select(pin!(future), pin!(sleep(delay))).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(Error::Timeout),
    }
}
