//! # trogon-dcron
//!
//! Leaderless distributed cron for horizontally scaled services.
//!
//! Every instance of a service registers the same jobs. Instances announce
//! themselves to a shared liveness backend with TTL-bounded presence records,
//! periodically discover each other, and place the live set on a
//! consistent-hash ring. When a job fires, each instance locates the job name
//! on its ring and only the owner runs the body. There is no election and no
//! per-firing lock.
//!
//! ## Features
//!
//! - Liveness backends: in-process memory, NATS JetStream KV, Redis (`redis` feature).
//! - 5-field, 6/7-field and `@descriptor` cron expressions.
//! - Ownership moves only for keys owned by a node that joins or leaves.
//! - Failed discovery keeps the previous ring; heartbeat and discovery errors
//!   are logged and retried, never fatal.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trogon_dcron::{DcronOptions, NatsKvBackend, Scheduler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
//!     let backend = NatsKvBackend::connect(nats, Duration::from_secs(10)).await.unwrap();
//!
//!     let scheduler = Scheduler::new("billing", backend, DcronOptions::default());
//!     scheduler
//!         .add_func("daily-report", "0 6 * * *", || println!("sending report"))
//!         .unwrap();
//!     scheduler.run().await.unwrap();
//! }
//! ```

pub mod backend;
pub mod backends;
pub mod clock;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod job;
pub mod node;
pub mod pool;
pub mod ring;
pub mod scheduler;

pub use backend::{LivenessBackend, Renewal};
pub use backends::memory::MemoryBackend;
pub use backends::nats_kv::NatsKvBackend;
#[cfg(feature = "redis")]
pub use backends::redis::RedisBackend;
pub use config::{DcronConfig, DcronOptions};
pub use engine::{CronEngine, EngineOptions, EntryId, EntryInfo};
pub use error::DcronError;
pub use job::{FireOutcome, Job, JobWrapper};
pub use node::NodeId;
pub use pool::NodePool;
pub use ring::HashRing;
pub use scheduler::{JobStatus, RunState, Scheduler, StatusSnapshot};
