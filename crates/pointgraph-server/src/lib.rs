//! # Pointgraph Server
//!
//! Node/edge store with a publish/subscribe sync protocol.
//!
//! ## Architecture
//!
//! - **Persistence**: SQLite or in-memory engines behind [`persistence::Persistence`]
//! - **Store**: authoritative in-memory cache, merge engine and edge hash
//!   maintenance, every mutation committed durably before it is visible
//! - **Handler**: decodes bus messages into commands, applies them on a
//!   worker pool and fans updates out to every ancestor
//! - **Bus**: in-process router or MQTT broker, with request/reply

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod handler;
pub mod mqtt;
pub mod persistence;
pub mod query;
pub mod runtime;
pub mod store;

pub use bus::{Bus, BusError, LocalBus, Message, Subscription};
pub use client::{Client, ClientError};
pub use config::{ServerConfig, StoreType};
pub use handler::{Command, Handler, HandlerError, HandlerMetrics};
pub use mqtt::{BrokerAddr, MqttBus};
pub use persistence::{MemoryStore, Persistence, PersistenceError, SqliteStore};
pub use runtime::{start, ServerHandle};
pub use store::{Dump, Store, StoreError, VerifyReport};
