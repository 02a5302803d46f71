//! Upper-layer transport adapter: one-command-in-flight request/response
//! semantics layered on [`ncplink_link::LinkEngine`].

pub mod adapter;
pub mod error;

pub use adapter::{ResponseTimeoutPolicy, TransportAdapter, TransportEvent};
pub use error::{TransportError, TransportResult};
