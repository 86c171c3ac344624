//! Clustered pub/sub broker.
//!
//! Clients speak a subset of MQTT 3.1.1. Nodes form a full TCP mesh and
//! replicate a directory of which peer holds subscribers for which topic,
//! so a publish is delivered locally and sent once to every interested peer.

pub mod broker;
pub mod config;
pub mod error;

pub use broker::server::{Broker, BrokerContext};
pub use config::{BrokerConfig, Cli};
pub use error::{BrokerError, BrokerResult};
