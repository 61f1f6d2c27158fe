//! Native synchronization primitives and shared containers.
//!
//! Thread-domain handles wrap these directly; the manager process hosts the
//! very same types behind its proxies.

pub(crate) mod barrier;
pub(crate) mod condition;
pub(crate) mod containers;
pub(crate) mod event;
pub(crate) mod lock;
pub(crate) mod monitor;
pub(crate) mod owner;
pub(crate) mod queue;
pub(crate) mod semaphore;
pub(crate) mod typed;

pub use barrier::BarrierStatus;
pub use queue::QueueStatus;
pub use typed::TypeCode;
