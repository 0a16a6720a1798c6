//! CDP protocol plumbing: transport framing, command correlation, and the
//! hand-written wire types.

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use transport::{fetch_version, resolve_endpoint};
pub use types::{TargetInfo, VersionInfo};
