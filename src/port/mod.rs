//! Port allocation for managed server instances.

mod allocator;

pub use allocator::{is_port_available, PortAllocator, PortLease};
