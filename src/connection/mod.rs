//! Connection state machine and per-connection records.

mod record;
mod state;

pub use record::ConnectionInfo;
pub use state::ConnectionState;

pub(crate) use record::{Connection, ListenSocket};
