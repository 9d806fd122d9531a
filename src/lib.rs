//! Bidirectional sync between a local DuckDB store and a remote spreadsheet
//! document.
//!
//! Remote edits are pulled through [`pull::PullController`] under a
//! last-modified-wins policy. Local edits made through
//! [`tracker::ChangeTracker`] are captured in a changelog and replayed in
//! batches by [`push::SheetPusher`]. [`controller::BidirectionalSync`] ties
//! both directions together and owns mode scheduling.

pub mod config;
pub mod controller;
pub mod error;
pub mod headers;
pub mod persistence;
pub mod pull;
pub mod push;
pub mod rpc;
pub mod scheduler;
pub mod schema;
pub mod test_utils;
pub mod tracker;
pub mod types;
pub mod value;

pub use config::SyncConfig;
pub use controller::BidirectionalSync;
pub use persistence::LocalStore;
pub use rpc::{HttpRpcClient, RemoteRpc};
pub use schema::{RegistryResolver, SchemaResolver};
pub use types::{BidirectionalResult, PullResult, PushResult, RemoteChange, SyncMode, SyncStatus};
