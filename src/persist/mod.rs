//! On-disk runtime state: the status document and the connection log.

pub mod connection_log;
pub mod status_store;

pub use connection_log::ConnectionLog;
pub use status_store::{PersistError, StatusStore};
