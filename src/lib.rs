//! TCP port forwarding over a single readiness-based event loop.
//!
//! Each [`Mapping`] gets a listener; every accepted client is paired with a
//! fresh outbound connection to the mapping's remote address and bytes are
//! relayed both ways until either side goes away or the [`Proxy`] is shut
//! down.

pub mod config;
mod mapping;
mod proxy;
mod queue;
mod registry;
mod shutdown;

pub use mapping::Mapping;
pub use proxy::{Proxy, Running, CHUNK_SIZE, HIGH_WATERMARK, LOW_WATERMARK};
pub use shutdown::ShutdownHandle;
