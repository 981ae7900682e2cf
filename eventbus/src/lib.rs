//! Partitioned publish/subscribe event bus on Redis.
//!
//! This crate provides:
//! - Atomic fan-out of each event to every subscribing service, landing in one
//!   partition queue per service (zlib CRC-32 of the key, mod partition count)
//! - Bounded retry of store writes (4 attempts, delay growing with attempt⁴)
//! - Heartbeat-based consumer liveness with a TTL-bound presence record
//! - Round-robin partition ownership over the alive consumers of a service,
//!   persisted through an optimistic compare-and-swap
//! - A consume loop that dispatches locally by name, `name:version` and
//!   wildcard, and dead-letters anything that fails
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventbus::{BusConfig, Consumer, EmitOptions, Emitter, Producer, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BusConfig::from_env()?;
//!     let store = Store::connect(&config).await?;
//!
//!     let emitter = Arc::new(Emitter::new());
//!     emitter.receive("orders:created", Some(1), |event| {
//!         println!("{}", event.payload);
//!         Ok(())
//!     });
//!
//!     let consumer = Arc::new(Consumer::new(store.clone(), config.clone(), emitter)?);
//!     consumer.register().await?;
//!     let handle = consumer.handle();
//!     tokio::spawn({
//!         let consumer = consumer.clone();
//!         async move { consumer.run().await }
//!     });
//!
//!     Producer::new(store, &config.client_id)
//!         .emit("orders:created", serde_json::json!({"id": 7}), EmitOptions::new().version(1))
//!         .await?;
//!
//!     handle.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Delivery
//!
//! - **Per partition**: FIFO, one consumer at a time once ownership converged
//! - **Per item**: at-least-once; removal follows processing, so a crash in
//!   between replays the item
//! - **Failures**: the raw bytes go to `<queue>:dead_letter` and the item is
//!   removed
//!
//! # Failure Detection
//!
//! - **Graceful stop**: the liveness record is deleted; peers take over on
//!   their next poll
//! - **Crash/kill -9**: peers take over once the liveness TTL runs out

pub mod config;
mod consumer;
pub mod coordinator;
mod dispatch;
mod error;
mod event;
pub mod keys;
mod lifecycle;
mod liveness;
mod producer;
mod retry;
pub mod router;
pub mod store;

pub use config::{Backend, BusConfig};
pub use consumer::{Consumer, ConsumerHandle, ConsumerState};
pub use coordinator::PartitionCoordinator;
pub use dispatch::{Channel, Emitter, HandlerResult, Subscription, WILDCARD};
pub use error::{Error, Result};
pub use event::{Event, EventMeta};
pub use lifecycle::{LifeCycleEventHandler, NoopLifeCycle, TracingLifeCycle};
pub use liveness::LivenessTracker;
pub use producer::{EmitOptions, Producer};
pub use retry::RetryPolicy;
pub use store::{MemoryStore, RedisStore, Store};
