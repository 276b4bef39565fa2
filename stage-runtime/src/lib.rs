//! The generic per-stage worker loop: consume, synchronise, dispatch to
//! the stage callback, produce, commit.
//!
//! A stage binary supplies a [StageHandler] and a [StageRuntime] drives
//! it: offsets are committed only after the callback returns, failing
//! messages are redelivered and dead-lettered after three attempts, and
//! shutdown drains the producer before exiting.
mod error;
mod producer;
mod runtime;

pub use error::{CallbackError, StageError, finish};
pub use producer::{DeliveryFutureSender, create_producer_task, send_record};
pub use runtime::{OutboundRecord, StageHandler, StageRuntime, install_observability};
