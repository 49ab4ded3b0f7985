//! # dbfixture
//!
//! Supervises disposable database-server processes used as test fixtures.
//!
//! ## Features
//!
//! - **Lifecycle control**: create, start, stop, restart and destroy server
//!   processes, with bounded readiness polling and SIGTERM→SIGKILL escalation
//! - **Port allocation**: non-conflicting ports from a configurable range,
//!   reclaimed on cleanup
//! - **Persistent registry**: identifiers and instance metadata survive a
//!   supervisor restart (SQLite in WAL mode)
//! - **Endpoint lookup**: map an identifier to `host:port` and back
//!
//! ## Quick Start
//!
//! ```no_run
//! use dbfixture::{Params, Parser, Registry};
//!
//! # async fn example() -> Result<(), dbfixture::Error> {
//! let config = Parser::new().load_config("dbfixture.yaml")?;
//! let registry = Registry::open(&config).await?;
//!
//! let id = registry.create("mongod", Params::new(), true).await?;
//! println!("server at {}", registry.hostname(&id).await?);
//!
//! registry.command(&id, "restart").await?;
//! registry.remove(&id).await?;
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Every method takes `&self`; share the registry as `Arc<Registry>`
//! - Lifecycle calls on one instance are serialized; different instances
//!   start and stop concurrently
//! - `cleanup` is idempotent at both the instance and registry level

pub mod config;
pub mod error;
pub mod healthcheck;
pub mod instance;
pub mod port;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use config::{Parser, PortRange, SupervisorConfig};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceInfo, InstanceSettings, Params, ProcInfo};
pub use port::PortAllocator;
pub use registry::{Command, Registry};
pub use state::{InstanceRecord, SqliteStateStore, StateStore};
