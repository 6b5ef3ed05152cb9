//! Breakpoints and their cached lookup.

pub mod service;
pub mod store;
pub mod types;

pub use service::{BreakpointCache, BreakpointService};
pub use store::{BreakpointStore, MemoryBreakpointStore};
pub use types::{Breakpoint, BreakpointKey, BreakpointScope};
