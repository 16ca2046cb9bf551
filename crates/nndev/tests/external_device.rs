//! A device implemented outside this crate on top of the public slot API, checked
//! against the shared lifecycle suite.

use nndev::backend::spec::StateCell;
use nndev::{
    DeviceError, DeviceId, DeviceResult, DeviceState, EngineResult, ExecutionEngine, LiveCounter,
    NnDevice, NodeDesc, PrerunParams, Subgraph, SubgraphDesc, SubgraphId, Teardown,
};

struct CountingEngine {
    runs: usize,
}

impl ExecutionEngine for CountingEngine {
    fn compile(&mut self, _graph: &SubgraphDesc, _params: &PrerunParams) -> EngineResult<()> {
        Ok(())
    }

    fn execute(&mut self) -> EngineResult<()> {
        self.runs += 1;
        Ok(())
    }

    fn release(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

struct InlineDevice {
    id: DeviceId,
    state: StateCell,
    live: LiveCounter,
}

impl InlineDevice {
    fn new() -> Self {
        Self {
            id: DeviceId::next(),
            state: StateCell::default(),
            live: LiveCounter::new(),
        }
    }

    fn invalid_state(&self, op: &'static str, state: DeviceState) -> DeviceError {
        DeviceError::InvalidState {
            device: "inline".to_string(),
            op,
            state,
        }
    }

    fn slot_error(
        &self,
        subgraph: SubgraphId,
        op: &'static str,
        owner: Option<DeviceId>,
    ) -> DeviceError {
        match owner {
            Some(owner) => DeviceError::ForeignHandle {
                subgraph,
                owner,
                device: self.id,
            },
            None => DeviceError::SlotEmpty { subgraph, op },
        }
    }
}

impl NnDevice for InlineDevice {
    fn device_name(&self) -> &str {
        "inline"
    }

    fn state(&self) -> DeviceState {
        self.state.get()
    }

    fn live_subgraphs(&self) -> usize {
        self.live.get()
    }

    fn init(&self) -> DeviceResult<()> {
        match self.state.transition(DeviceState::Uninit, DeviceState::Ready) {
            Ok(()) | Err(DeviceState::Ready) => Ok(()),
            Err(state) => Err(self.invalid_state("init", state)),
        }
    }

    fn prerun(&self, subgraph: &mut Subgraph, params: PrerunParams) -> DeviceResult<()> {
        let state = self.state.get();
        if state != DeviceState::Ready {
            return Err(self.invalid_state("prerun", state));
        }
        let id = subgraph.id();
        if subgraph.is_bound() {
            return Err(DeviceError::SlotOccupied { subgraph: id });
        }
        let (desc, slot) = subgraph.parts_mut();
        let bound = slot.bind(self.id, Box::new(CountingEngine { runs: 0 }), &self.live);
        bound
            .engine_mut()
            .compile(desc, &params)
            .map_err(|source| DeviceError::Compile {
                subgraph: id,
                source,
            })
    }

    fn run(&self, subgraph: &mut Subgraph) -> DeviceResult<()> {
        let id = subgraph.id();
        let bound = subgraph
            .exec_graph_mut()
            .get_owned_by(self.id)
            .map_err(|owner| self.slot_error(id, "run", owner))?;
        bound
            .engine_mut()
            .execute()
            .map_err(|source| DeviceError::Execute {
                subgraph: id,
                source,
            })
    }

    fn postrun(&self, subgraph: &mut Subgraph) -> DeviceResult<Teardown> {
        let id = subgraph.id();
        let mut bound = subgraph
            .exec_graph_mut()
            .take_owned_by(self.id)
            .map_err(|owner| self.slot_error(id, "postrun", owner))?;
        Ok(match bound.engine_mut().release() {
            Ok(()) => Teardown::Clean,
            Err(err) => Teardown::Degraded(err),
        })
    }

    fn release(&self) -> DeviceResult<()> {
        let live = self.live.get();
        if live > 0 {
            return Err(DeviceError::LiveSubgraphs {
                device: "inline".to_string(),
                live,
            });
        }
        self.state
            .transition(DeviceState::Ready, DeviceState::Released)
            .map_err(|state| self.invalid_state("release", state))
    }
}

fn subgraph(id: u32) -> Subgraph {
    Subgraph::new(
        SubgraphId(id),
        SubgraphDesc::new(format!("inline-{id}"), vec![NodeDesc::new("any")]),
    )
}

nndev_backend_tests::define_device_tests!(inline_lifecycle, InlineDevice::new, subgraph);

#[test]
fn foreign_slot_is_not_touched_by_inline_device() {
    let first = InlineDevice::new();
    let second = InlineDevice::new();
    first.init().unwrap();
    second.init().unwrap();
    let mut sg = subgraph(1);

    first.prerun(&mut sg, PrerunParams::default()).unwrap();
    assert!(matches!(
        second.postrun(&mut sg),
        Err(DeviceError::ForeignHandle { .. })
    ));
    assert_eq!(sg.exec_graph().owner(), Some(first.id));
    assert_eq!(first.live_subgraphs(), 1);
    assert_eq!(second.live_subgraphs(), 0);

    let _ = first.postrun(&mut sg).unwrap();
    first.release().unwrap();
}
