//! Host-owned subgraph record and the slot that carries its engine.
//!
//! The host builds a [`Subgraph`] per partition assigned to a device. The device only
//! ever touches the `exec_graph` slot: prerun binds an engine into it, postrun takes it
//! back out. The slot is tagged with the owning device so a handle can never be torn
//! down by a device that did not create it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{DeviceError, DeviceId, DeviceResult, ExecutionEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubgraphId(pub u32);

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sg{}", self.0)
    }
}

/// One operator of a subgraph. Tensor ids are opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDesc {
    pub op: String,
    #[serde(default)]
    pub inputs: Vec<u32>,
    #[serde(default)]
    pub outputs: Vec<u32>,
}

impl NodeDesc {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_io(op: impl Into<String>, inputs: Vec<u32>, outputs: Vec<u32>) -> Self {
        Self {
            op: op.into(),
            inputs,
            outputs,
        }
    }
}

/// The portion of the partitioned graph an engine compiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphDesc {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDesc>,
}

impl SubgraphDesc {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDesc>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Number of engines a device currently has bound across all subgraphs.
///
/// Every [`BoundEngine`] holds one share of the count and gives it back when it is
/// dropped, whether through postrun or by the subgraph going away.
#[derive(Debug, Clone, Default)]
pub struct LiveCounter(Arc<AtomicUsize>);

impl LiveCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) -> LiveToken {
        self.0.fetch_add(1, Ordering::AcqRel);
        LiveToken(Arc::clone(&self.0))
    }
}

struct LiveToken(Arc<AtomicUsize>);

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An engine attached to a subgraph, tagged with the device that created it.
pub struct BoundEngine {
    owner: DeviceId,
    engine: Box<dyn ExecutionEngine>,
    _live: LiveToken,
}

impl BoundEngine {
    pub fn owner(&self) -> DeviceId {
        self.owner
    }

    pub fn engine_mut(&mut self) -> &mut dyn ExecutionEngine {
        self.engine.as_mut()
    }
}

/// Holds at most one engine, tagged with the device that owns it.
#[derive(Default)]
pub struct ExecGraphSlot(Option<BoundEngine>);

impl ExecGraphSlot {
    pub fn is_bound(&self) -> bool {
        self.0.is_some()
    }

    /// Device that owns the engine currently held, if any.
    pub fn owner(&self) -> Option<DeviceId> {
        self.0.as_ref().map(|bound| bound.owner)
    }

    /// Stores `engine` for `owner` and counts it in `live`. The slot must be empty.
    pub fn bind(
        &mut self,
        owner: DeviceId,
        engine: Box<dyn ExecutionEngine>,
        live: &LiveCounter,
    ) -> &mut BoundEngine {
        debug_assert!(self.0.is_none(), "bind on an occupied slot");
        self.0.insert(BoundEngine {
            owner,
            engine,
            _live: live.acquire(),
        })
    }

    /// Engine held for `device`. `Err(None)` when empty, `Err(Some(owner))` when the
    /// engine belongs to another device.
    pub fn get_owned_by(&mut self, device: DeviceId) -> Result<&mut BoundEngine, Option<DeviceId>> {
        match self.0.as_mut() {
            Some(bound) if bound.owner == device => Ok(bound),
            Some(bound) => Err(Some(bound.owner)),
            None => Err(None),
        }
    }

    /// Detaches the engine held for `device`, leaving the slot empty. A foreign
    /// engine is left in place.
    pub fn take_owned_by(&mut self, device: DeviceId) -> Result<BoundEngine, Option<DeviceId>> {
        match self.0.as_ref().map(|bound| bound.owner) {
            Some(owner) if owner == device => self.0.take().ok_or(None),
            Some(owner) => Err(Some(owner)),
            None => Err(None),
        }
    }
}

impl fmt::Debug for ExecGraphSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "Bound({owner})"),
            None => f.write_str("Empty"),
        }
    }
}

/// A partitioned unit of the computation graph, owned by the host runtime.
#[derive(Debug)]
pub struct Subgraph {
    id: SubgraphId,
    desc: SubgraphDesc,
    exec_graph: ExecGraphSlot,
}

impl Subgraph {
    pub fn new(id: SubgraphId, desc: SubgraphDesc) -> Self {
        Self {
            id,
            desc,
            exec_graph: ExecGraphSlot::default(),
        }
    }

    pub fn id(&self) -> SubgraphId {
        self.id
    }

    pub fn desc(&self) -> &SubgraphDesc {
        &self.desc
    }

    /// Replaces the graph description. Rejected while an engine is bound, since that
    /// engine was compiled from the previous description.
    pub fn set_desc(&mut self, desc: SubgraphDesc) -> DeviceResult<()> {
        if self.exec_graph.is_bound() {
            return Err(DeviceError::SlotOccupied { subgraph: self.id });
        }
        self.desc = desc;
        Ok(())
    }

    pub fn exec_graph(&self) -> &ExecGraphSlot {
        &self.exec_graph
    }

    pub fn exec_graph_mut(&mut self) -> &mut ExecGraphSlot {
        &mut self.exec_graph
    }

    /// Description and slot borrowed together, for compiling into a freshly bound engine.
    pub fn parts_mut(&mut self) -> (&SubgraphDesc, &mut ExecGraphSlot) {
        (&self.desc, &mut self.exec_graph)
    }

    pub fn is_bound(&self) -> bool {
        self.exec_graph.is_bound()
    }
}

impl Drop for Subgraph {
    fn drop(&mut self) {
        let Some(mut bound) = self.exec_graph.0.take() else {
            return;
        };
        tracing::warn!(
            subgraph = %self.id,
            device = %bound.owner,
            "subgraph dropped while its engine is still bound; releasing it here"
        );
        if let Err(err) = bound.engine.release() {
            tracing::warn!(
                subgraph = %self.id,
                code = err.code(),
                "engine release on drop failed: {err}"
            );
        }
    }
}
