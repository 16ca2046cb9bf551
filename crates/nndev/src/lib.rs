//! Device-backend lifecycle contract for a modular inference runtime.
//!
//! The host runtime drives every device through the same sequence: `init` once,
//! then `prerun -> run* -> postrun` per subgraph, then `release` once. Devices
//! implement [`NnDevice`]; most do so by handing an [`EngineFactory`] to
//! [`EngineBackend`], which owns the per-subgraph engine bookkeeping.

pub mod backend;
mod env;
pub mod runtime;
pub mod subgraph;

pub use backend::engine_backend::EngineBackend;
pub use backend::spec::{
    status_of, DeviceError, DeviceId, DeviceResult, DeviceState, EngineError, EngineFactory,
    EngineResult, ExecMode, ExecutionEngine, NnDevice, PrerunParams, Teardown, STATUS_FAILED,
    STATUS_FOREIGN_HANDLE, STATUS_INVALID_ARGUMENT, STATUS_INVALID_STATE, STATUS_LIVE_SUBGRAPHS,
    STATUS_OK, STATUS_SLOT_EMPTY, STATUS_SLOT_OCCUPIED,
};
pub use env::DeviceOptions;
pub use subgraph::{
    BoundEngine, ExecGraphSlot, LiveCounter, NodeDesc, Subgraph, SubgraphDesc, SubgraphId,
};
