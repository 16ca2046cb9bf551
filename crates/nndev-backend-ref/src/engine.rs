use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use nndev::{
    EngineError, EngineFactory, EngineResult, ExecMode, ExecutionEngine, NodeDesc, PrerunParams,
    SubgraphDesc,
};

/// A node referenced an operator the kernel table does not provide.
pub const REF_STATUS_UNSUPPORTED_OP: i32 = 1;
/// The subgraph has no nodes.
pub const REF_STATUS_EMPTY_GRAPH: i32 = 2;
/// execute was called on an engine without a compiled plan.
pub const REF_STATUS_NOT_COMPILED: i32 = 3;
/// A kernel reported failure while executing.
pub const REF_STATUS_KERNEL_FAILED: i32 = 4;
/// The execution mode selector is not one the reference engine understands.
pub const REF_STATUS_UNSUPPORTED_MODE: i32 = 5;

/// Host-side implementation of one operator.
pub type Kernel = Arc<dyn Fn(&NodeDesc, &PrerunParams) -> Result<(), String> + Send + Sync>;

/// Operator name to kernel mapping consulted at compile time.
#[derive(Clone, Default)]
pub struct KernelTable {
    kernels: HashMap<String, Kernel>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass-through operators that need no data movement on the host.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register("noop", |_, _| Ok(()));
        table.register("identity", |node, _| {
            if node.inputs.len() == node.outputs.len() {
                Ok(())
            } else {
                Err(format!(
                    "identity expects matching arity, got {} inputs and {} outputs",
                    node.inputs.len(),
                    node.outputs.len()
                ))
            }
        });
        table
    }

    pub fn register<F>(&mut self, op: impl Into<String>, kernel: F)
    where
        F: Fn(&NodeDesc, &PrerunParams) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.insert(op.into(), Arc::new(kernel));
    }

    pub fn get(&self, op: &str) -> Option<&Kernel> {
        self.kernels.get(op)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.kernels.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops: BTreeSet<&str> = self.kernels.keys().map(String::as_str).collect();
        f.debug_struct("KernelTable").field("ops", &ops).finish()
    }
}

struct Step {
    node: NodeDesc,
    kernel: Kernel,
}

struct CompiledPlan {
    graph: String,
    steps: Vec<Step>,
    params: PrerunParams,
    runs: u64,
}

/// Reference engine: resolves every node against a [`KernelTable`] at compile time
/// and invokes the resolved kernels in node order on each execute.
pub struct RefEngine {
    kernels: Arc<KernelTable>,
    plan: Option<CompiledPlan>,
}

impl RefEngine {
    pub fn new(kernels: Arc<KernelTable>) -> Self {
        Self {
            kernels,
            plan: None,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    /// Completed executions of the current plan.
    pub fn runs(&self) -> u64 {
        self.plan.as_ref().map_or(0, |plan| plan.runs)
    }
}

impl ExecutionEngine for RefEngine {
    fn compile(&mut self, graph: &SubgraphDesc, params: &PrerunParams) -> EngineResult<()> {
        self.plan = None;

        if graph.nodes.is_empty() {
            return Err(EngineError::new(
                REF_STATUS_EMPTY_GRAPH,
                format!("subgraph '{}' has no nodes", graph.name),
            ));
        }
        if let ExecMode::Other(mode) = params.mode {
            return Err(EngineError::new(
                REF_STATUS_UNSUPPORTED_MODE,
                format!("execution mode {mode} is not supported"),
            ));
        }

        let unsupported: BTreeSet<&str> = graph
            .nodes
            .iter()
            .filter(|node| !self.kernels.contains(&node.op))
            .map(|node| node.op.as_str())
            .collect();
        if !unsupported.is_empty() {
            let ops: Vec<&str> = unsupported.into_iter().collect();
            return Err(EngineError::new(
                REF_STATUS_UNSUPPORTED_OP,
                format!("unsupported operators: {}", ops.join(", ")),
            ));
        }

        let steps = graph
            .nodes
            .iter()
            .filter_map(|node| {
                self.kernels.get(&node.op).map(|kernel| Step {
                    node: node.clone(),
                    kernel: Arc::clone(kernel),
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            graph = %graph.name,
            steps = steps.len(),
            num_thread = params.num_thread,
            "reference plan compiled"
        );
        self.plan = Some(CompiledPlan {
            graph: graph.name.clone(),
            steps,
            params: *params,
            runs: 0,
        });
        Ok(())
    }

    fn execute(&mut self) -> EngineResult<()> {
        let plan = self.plan.as_mut().ok_or_else(|| {
            EngineError::new(REF_STATUS_NOT_COMPILED, "execute called without a compiled plan")
        })?;

        for (index, step) in plan.steps.iter().enumerate() {
            (step.kernel)(&step.node, &plan.params).map_err(|reason| {
                EngineError::new(
                    REF_STATUS_KERNEL_FAILED,
                    format!(
                        "node {index} ({}) of '{}' failed: {reason}",
                        step.node.op, plan.graph
                    ),
                )
            })?;
        }
        plan.runs += 1;
        tracing::trace!(graph = %plan.graph, runs = plan.runs, "reference plan executed");
        Ok(())
    }

    fn release(&mut self) -> EngineResult<()> {
        if let Some(plan) = self.plan.take() {
            tracing::trace!(graph = %plan.graph, runs = plan.runs, "reference plan released");
        }
        Ok(())
    }
}

/// Creates [`RefEngine`]s sharing one kernel table.
#[derive(Clone, Debug)]
pub struct RefEngineFactory {
    kernels: Arc<KernelTable>,
}

impl RefEngineFactory {
    pub fn new(kernels: KernelTable) -> Self {
        Self {
            kernels: Arc::new(kernels),
        }
    }

    pub fn builtin() -> Self {
        Self::new(KernelTable::builtin())
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }
}

impl EngineFactory for RefEngineFactory {
    fn create(&self) -> Box<dyn ExecutionEngine> {
        Box::new(RefEngine::new(Arc::clone(&self.kernels)))
    }
}
