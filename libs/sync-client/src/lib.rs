pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod replica;
pub mod subscribers;
pub mod transport;

pub use bridge::CanonicalBridge;
pub use client::{ConnectionState, SyncClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use replica::SessionReplica;
pub use subscribers::{Subscribers, Subscription};
pub use transport::{Connector, Link, WsConnector};
