//! Generic device backend that drives one [`ExecutionEngine`] per subgraph.
//!
//! Hardware integrations only provide an [`EngineFactory`]; the lifecycle bookkeeping
//! (device state, slot ownership, live-handle accounting, error translation) lives
//! here once for every device.

use super::spec::{
    DeviceError, DeviceId, DeviceResult, DeviceState, EngineFactory, NnDevice, PrerunParams,
    StateCell, Teardown,
};
use crate::env::DeviceOptions;
use crate::subgraph::{LiveCounter, Subgraph, SubgraphId};

pub struct EngineBackend<F: EngineFactory> {
    name: String,
    id: DeviceId,
    factory: F,
    options: DeviceOptions,
    state: StateCell,
    live: LiveCounter,
}

impl<F: EngineFactory> EngineBackend<F> {
    /// Creates a backend configured from the process environment.
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self::with_options(name, factory, DeviceOptions::from_env())
    }

    pub fn with_options(name: impl Into<String>, factory: F, options: DeviceOptions) -> Self {
        Self {
            name: name.into(),
            id: DeviceId::next(),
            factory,
            options,
            state: StateCell::default(),
            live: LiveCounter::new(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn violation(&self, err: DeviceError) -> DeviceError {
        tracing::warn!(device = %self.name, status = err.status(), "protocol violation: {err}");
        if self.options.strict {
            panic!("device {} protocol violation: {err}", self.name);
        }
        err
    }

    fn ensure_ready(&self, op: &'static str) -> DeviceResult<()> {
        match self.state.get() {
            DeviceState::Ready => Ok(()),
            state => Err(self.violation(DeviceError::InvalidState {
                device: self.name.clone(),
                op,
                state,
            })),
        }
    }

    fn slot_error(
        &self,
        subgraph: SubgraphId,
        op: &'static str,
        owner: Option<DeviceId>,
    ) -> DeviceError {
        let err = match owner {
            Some(owner) => DeviceError::ForeignHandle {
                subgraph,
                owner,
                device: self.id,
            },
            None => DeviceError::SlotEmpty { subgraph, op },
        };
        self.violation(err)
    }

    fn resolve_params(&self, params: PrerunParams) -> PrerunParams {
        if params.num_thread == 0 {
            PrerunParams {
                num_thread: self.options.default_num_thread,
                ..params
            }
        } else {
            params
        }
    }
}

impl<F: EngineFactory> NnDevice for EngineBackend<F> {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> DeviceState {
        self.state.get()
    }

    fn live_subgraphs(&self) -> usize {
        self.live.get()
    }

    fn init(&self) -> DeviceResult<()> {
        match self.state.transition(DeviceState::Uninit, DeviceState::Ready) {
            Ok(()) => {
                tracing::info!(device = %self.name, id = %self.id, "device initialized");
                Ok(())
            }
            Err(DeviceState::Ready) => {
                tracing::debug!(device = %self.name, "init on an initialized device ignored");
                Ok(())
            }
            Err(state) => Err(self.violation(DeviceError::InvalidState {
                device: self.name.clone(),
                op: "init",
                state,
            })),
        }
    }

    fn prerun(&self, subgraph: &mut Subgraph, params: PrerunParams) -> DeviceResult<()> {
        self.ensure_ready("prerun")?;
        let id = subgraph.id();
        if subgraph.is_bound() {
            return Err(self.violation(DeviceError::SlotOccupied { subgraph: id }));
        }

        let params = self.resolve_params(params);
        tracing::debug!(
            device = %self.name,
            subgraph = %id,
            nodes = subgraph.desc().nodes.len(),
            num_thread = params.num_thread,
            cpu_affinity = params.cpu_affinity,
            mode = params.mode.as_raw(),
            "prerun"
        );

        // The engine is attached before compiling so postrun can reclaim it either way.
        let (desc, slot) = subgraph.parts_mut();
        let bound = slot.bind(self.id, self.factory.create(), &self.live);

        bound.engine_mut().compile(desc, &params).map_err(|source| {
            tracing::warn!(
                device = %self.name,
                subgraph = %id,
                code = source.code(),
                "compile failed: {source}"
            );
            DeviceError::Compile {
                subgraph: id,
                source,
            }
        })
    }

    fn run(&self, subgraph: &mut Subgraph) -> DeviceResult<()> {
        let id = subgraph.id();
        let bound = match subgraph.exec_graph_mut().get_owned_by(self.id) {
            Ok(bound) => bound,
            Err(owner) => return Err(self.slot_error(id, "run", owner)),
        };

        tracing::trace!(device = %self.name, subgraph = %id, "run");
        bound.engine_mut().execute().map_err(|source| {
            tracing::debug!(
                device = %self.name,
                subgraph = %id,
                code = source.code(),
                "execute failed: {source}"
            );
            DeviceError::Execute {
                subgraph: id,
                source,
            }
        })
    }

    fn postrun(&self, subgraph: &mut Subgraph) -> DeviceResult<Teardown> {
        let id = subgraph.id();
        let mut bound = match subgraph.exec_graph_mut().take_owned_by(self.id) {
            Ok(bound) => bound,
            Err(owner) => return Err(self.slot_error(id, "postrun", owner)),
        };

        let teardown = match bound.engine_mut().release() {
            Ok(()) => Teardown::Clean,
            Err(err) => {
                tracing::warn!(
                    device = %self.name,
                    subgraph = %id,
                    code = err.code(),
                    "engine release failed, handle destroyed anyway: {err}"
                );
                Teardown::Degraded(err)
            }
        };
        drop(bound);

        tracing::debug!(
            device = %self.name,
            subgraph = %id,
            clean = teardown.is_clean(),
            "postrun"
        );
        Ok(teardown)
    }

    fn release(&self) -> DeviceResult<()> {
        let live = self.live.get();
        if live > 0 {
            return Err(self.violation(DeviceError::LiveSubgraphs {
                device: self.name.clone(),
                live,
            }));
        }

        match self.state.transition(DeviceState::Ready, DeviceState::Released) {
            Ok(()) => {
                tracing::info!(device = %self.name, id = %self.id, "device released");
                Ok(())
            }
            Err(state) => Err(self.violation(DeviceError::InvalidState {
                device: self.name.clone(),
                op: "release",
                state,
            })),
        }
    }
}
