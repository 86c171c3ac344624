pub mod cluster;
pub mod codec;
pub mod connection;
pub mod directory;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod local;
pub mod mesh;
pub mod metrics;
pub mod registry;
pub mod reliability;
pub mod router;
pub mod server;
pub mod topic;
pub mod transport;
pub mod types;
