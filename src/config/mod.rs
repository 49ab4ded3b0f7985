//! Supervisor configuration.
//!
//! - `settings` - [`SupervisorConfig`] and [`PortRange`]
//! - `parser` - YAML loading
//! - `duration` - human-readable duration strings

mod duration;
mod parser;
mod settings;

pub use duration::*;
pub use parser::*;
pub use settings::*;
