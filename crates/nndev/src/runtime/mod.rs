//! Host-side helpers that drive the device lifecycle on behalf of a scheduler.

mod session;

pub use session::{execute_subgraph, PreparedSubgraph};
