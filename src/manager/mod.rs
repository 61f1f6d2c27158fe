//! The manager process hosting process-domain primitives, and the proxies
//! that reach it.

pub(crate) mod client;
pub(crate) mod process;
pub(crate) mod protocol;
pub(crate) mod server;
