pub mod activity;
pub mod app;
pub mod broker;
pub mod bus_redis;
pub mod capabilities;
pub mod capability;
pub mod cli;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identifier;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod store_redis;
pub mod telemetry;

pub use broker::{Admission, Broker, BrokerSettings};
pub use error::BrokerError;
pub use identifier::Identifier;
pub use session::{Session, SessionConfig, SessionContext, SessionState};
