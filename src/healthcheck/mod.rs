//! Readiness probes and the bounded polling loop that drives them.
//!
//! - [`TcpChecker`]: is the endpoint accepting connections
//! - [`VersionProbe`]: asks the server binary for its version string
//! - [`wait_for`] / [`wait_for_closed`]: fixed-interval polling against a
//!   monotonic deadline

mod checker;
mod command;
mod tcp;

pub use checker::*;
pub use command::*;
pub use tcp::*;
