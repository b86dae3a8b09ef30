/// Bincode codec with bounded decoding, and path helpers.
pub mod util;

/// Executor handle, `sleep`, `timeout` and `block_on` over the selected
/// async runtime (`smol` by default, `tokio` behind the `tokio` feature).
pub mod runtime;

/// Groups of cancellable tasks reporting to callbacks.
pub mod task_group;

/// Represents muddle's Core Error.
pub mod error;

pub use error::{Error, Result};
