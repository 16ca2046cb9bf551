use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use thiserror::Error;

use crate::subgraph::{Subgraph, SubgraphDesc, SubgraphId};

/// Host status for a lifecycle call that completed.
pub const STATUS_OK: i32 = 0;
/// Generic failure; also substituted for engine errors that report a zero code.
pub const STATUS_FAILED: i32 = -1;
/// A pointer or argument handed across the host boundary was unusable.
pub const STATUS_INVALID_ARGUMENT: i32 = -2;
/// The device was not in a state that accepts the requested call.
pub const STATUS_INVALID_STATE: i32 = -3;
/// prerun was called on a subgraph that still holds an engine.
pub const STATUS_SLOT_OCCUPIED: i32 = -4;
/// run or postrun was called on a subgraph without an engine.
pub const STATUS_SLOT_EMPTY: i32 = -5;
/// The subgraph's engine belongs to a different device instance.
pub const STATUS_FOREIGN_HANDLE: i32 = -6;
/// release was called while subgraphs still hold engines.
pub const STATUS_LIVE_SUBGRAPHS: i32 = -7;

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(1);

/// Identity of one device instance, used to tag the engines it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub fn next() -> Self {
        DeviceId(NEXT_DEVICE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Device-wide lifecycle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninit,
    Ready,
    Released,
}

impl DeviceState {
    fn to_raw(self) -> u8 {
        match self {
            DeviceState::Uninit => 0,
            DeviceState::Ready => 1,
            DeviceState::Released => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => DeviceState::Uninit,
            1 => DeviceState::Ready,
            _ => DeviceState::Released,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Uninit => "uninit",
            DeviceState::Ready => "ready",
            DeviceState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Atomic holder for [`DeviceState`] so a device can be shared across threads.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: DeviceState) -> Self {
        StateCell(AtomicU8::new(state.to_raw()))
    }

    pub fn get(&self) -> DeviceState {
        DeviceState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to`; on mismatch returns the state actually observed.
    pub fn transition(&self, from: DeviceState, to: DeviceState) -> Result<(), DeviceState> {
        self.0
            .compare_exchange(
                from.to_raw(),
                to.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(DeviceState::from_raw)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new(DeviceState::Uninit)
    }
}

/// Numeric precision the engine should compile the subgraph for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecMode {
    #[default]
    Fp32,
    Fp16,
    Uint8,
    Int8,
    /// Selector the host passed that this crate does not name; engines decide.
    Other(i32),
}

impl ExecMode {
    pub fn from_raw(mode: i32) -> Self {
        match mode {
            0 => ExecMode::Fp32,
            1 => ExecMode::Fp16,
            2 => ExecMode::Uint8,
            3 => ExecMode::Int8,
            other => ExecMode::Other(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            ExecMode::Fp32 => 0,
            ExecMode::Fp16 => 1,
            ExecMode::Uint8 => 2,
            ExecMode::Int8 => 3,
            ExecMode::Other(other) => other,
        }
    }
}

/// Execution parameters the host supplies with prerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrerunParams {
    /// Worker threads the engine may use; `0` lets the device pick.
    pub num_thread: usize,
    /// CPU affinity hint, passed through untouched.
    pub cpu_affinity: i32,
    pub mode: ExecMode,
}

impl PrerunParams {
    pub fn new(num_thread: usize, cpu_affinity: i32, mode: ExecMode) -> Self {
        Self {
            num_thread,
            cpu_affinity,
            mode,
        }
    }

    /// Decodes the integer triple used by the C-style host interface.
    /// Negative thread counts are treated as "unspecified".
    pub fn from_raw(num_thread: i32, cpu_affinity: i32, mode: i32) -> Self {
        Self {
            num_thread: usize::try_from(num_thread).unwrap_or(0),
            cpu_affinity,
            mode: ExecMode::from_raw(mode),
        }
    }
}

/// Failure reported by an execution engine, carrying the engine's own status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine status {code}: {message}")]
pub struct EngineError {
    code: i32,
    message: String,
}

impl EngineError {
    /// A zero code would read as success on the host side, so it is replaced with
    /// [`STATUS_FAILED`].
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: if code == STATUS_OK { STATUS_FAILED } else { code },
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Error surfaced by a device lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("compile of subgraph {subgraph} failed: {source}")]
    Compile {
        subgraph: SubgraphId,
        #[source]
        source: EngineError,
    },
    #[error("execute of subgraph {subgraph} failed: {source}")]
    Execute {
        subgraph: SubgraphId,
        #[source]
        source: EngineError,
    },
    #[error("device {device} cannot {op} while {state}")]
    InvalidState {
        device: String,
        op: &'static str,
        state: DeviceState,
    },
    #[error("subgraph {subgraph} already holds an engine")]
    SlotOccupied { subgraph: SubgraphId },
    #[error("subgraph {subgraph} has no engine for {op}")]
    SlotEmpty {
        subgraph: SubgraphId,
        op: &'static str,
    },
    #[error("subgraph {subgraph} is bound to {owner}, not {device}")]
    ForeignHandle {
        subgraph: SubgraphId,
        owner: DeviceId,
        device: DeviceId,
    },
    #[error("device {device} still has {live} bound subgraph(s)")]
    LiveSubgraphs { device: String, live: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DeviceError {
    /// Host status code for this error. Engine failures pass the engine's code through.
    pub fn status(&self) -> i32 {
        match self {
            DeviceError::Compile { source, .. } | DeviceError::Execute { source, .. } => {
                source.code()
            }
            DeviceError::InvalidState { .. } => STATUS_INVALID_STATE,
            DeviceError::SlotOccupied { .. } => STATUS_SLOT_OCCUPIED,
            DeviceError::SlotEmpty { .. } => STATUS_SLOT_EMPTY,
            DeviceError::ForeignHandle { .. } => STATUS_FOREIGN_HANDLE,
            DeviceError::LiveSubgraphs { .. } => STATUS_LIVE_SUBGRAPHS,
            DeviceError::InvalidArgument(_) => STATUS_INVALID_ARGUMENT,
        }
    }

    /// True for caller-ordering mistakes as opposed to engine failures.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(
            self,
            DeviceError::Compile { .. }
                | DeviceError::Execute { .. }
                | DeviceError::InvalidArgument(_)
        )
    }
}

/// Convenience alias for results returned by device lifecycle calls.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Collapses a lifecycle result into the host's integer convention.
pub fn status_of<T>(result: &DeviceResult<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(err) => err.status(),
    }
}

/// Outcome of the engine teardown performed by postrun.
///
/// postrun always succeeds as a lifecycle step; a failing engine release is
/// reported here instead of as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Teardown {
    Clean,
    Degraded(EngineError),
}

impl Teardown {
    pub fn is_clean(&self) -> bool {
        matches!(self, Teardown::Clean)
    }

    pub fn release_error(&self) -> Option<&EngineError> {
        match self {
            Teardown::Clean => None,
            Teardown::Degraded(err) => Some(err),
        }
    }
}

/// Per-subgraph compiled execution state provided by a hardware integration.
pub trait ExecutionEngine: Send {
    /// Compiles the subgraph into a runnable form.
    fn compile(&mut self, graph: &SubgraphDesc, params: &PrerunParams) -> EngineResult<()>;

    /// Executes the compiled form. Must be repeatable until [`release`](Self::release).
    fn execute(&mut self) -> EngineResult<()>;

    /// Frees engine resources. Errors are advisory; the engine is dropped regardless.
    fn release(&mut self) -> EngineResult<()>;
}

/// Creates a fresh engine for each prerun.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn ExecutionEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn ExecutionEngine> + Send + Sync,
{
    fn create(&self) -> Box<dyn ExecutionEngine> {
        self()
    }
}

/// Lifecycle interface every device backend exposes to the host runtime.
///
/// The host calls `init` once, then `prerun -> run* -> postrun` per subgraph, then
/// `release` once. Calls on distinct subgraphs may come from different threads.
pub trait NnDevice: Send + Sync {
    /// Returns a human-readable device identifier (e.g. `"ref"`, `"timvx"`).
    fn device_name(&self) -> &str;

    fn state(&self) -> DeviceState;

    /// Number of subgraphs currently holding an engine of this device.
    fn live_subgraphs(&self) -> usize;

    fn init(&self) -> DeviceResult<()>;

    /// Attaches a new engine to `subgraph` and compiles it. The engine stays attached
    /// even when compilation fails, so every prerun is matched by one postrun.
    fn prerun(&self, subgraph: &mut Subgraph, params: PrerunParams) -> DeviceResult<()>;

    fn run(&self, subgraph: &mut Subgraph) -> DeviceResult<()>;

    /// Releases and detaches the subgraph's engine, whatever the engine reports.
    fn postrun(&self, subgraph: &mut Subgraph) -> DeviceResult<Teardown>;

    fn release(&self) -> DeviceResult<()>;
}
