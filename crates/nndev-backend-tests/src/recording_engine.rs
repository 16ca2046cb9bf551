use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nndev::{
    DeviceOptions, EngineBackend, EngineError, EngineFactory, EngineResult, ExecutionEngine,
    PrerunParams, SubgraphDesc, STATUS_OK,
};

/// One call observed by a [`RecordingEngine`], tagged with the engine's creation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Compile {
        engine: usize,
        graph: String,
        nodes: usize,
        params: PrerunParams,
    },
    Execute {
        engine: usize,
    },
    Release {
        engine: usize,
    },
}

#[derive(Default)]
struct ScriptState {
    compile: VecDeque<i32>,
    execute: VecDeque<i32>,
    release: VecDeque<i32>,
    calls: Vec<EngineCall>,
}

/// Shared script and call log for every engine created by one [`RecordingFactory`].
///
/// Statuses are consumed in call order across all engines; an empty queue means
/// success.
#[derive(Default)]
pub struct EngineScript {
    state: Mutex<ScriptState>,
    created: AtomicUsize,
    dropped: AtomicUsize,
}

impl EngineScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("engine script mutex poisoned")
    }

    pub fn push_compile_status(&self, code: i32) {
        self.lock().compile.push_back(code);
    }

    pub fn push_execute_status(&self, code: i32) {
        self.lock().execute.push_back(code);
    }

    pub fn push_release_status(&self, code: i32) {
        self.lock().release.push_back(code);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn execute_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, EngineCall::Execute { .. }))
            .count()
    }

    pub fn release_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, EngineCall::Release { .. }))
            .count()
    }

    /// Engines created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Engines created and not yet dropped.
    pub fn live_engines(&self) -> usize {
        self.created() - self.dropped.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> RecordingFactory {
        RecordingFactory {
            script: Arc::clone(self),
        }
    }

    fn record(&self, call: EngineCall, pick: fn(&mut ScriptState) -> &mut VecDeque<i32>) -> i32 {
        let mut state = self.lock();
        state.calls.push(call);
        pick(&mut *state).pop_front().unwrap_or(STATUS_OK)
    }
}

fn scripted(code: i32, what: &str) -> EngineResult<()> {
    if code == STATUS_OK {
        Ok(())
    } else {
        Err(EngineError::new(code, format!("scripted {what} failure")))
    }
}

/// Test-only engine that records every call and returns scripted statuses.
pub struct RecordingEngine {
    script: Arc<EngineScript>,
    index: usize,
}

impl ExecutionEngine for RecordingEngine {
    fn compile(&mut self, graph: &SubgraphDesc, params: &PrerunParams) -> EngineResult<()> {
        let call = EngineCall::Compile {
            engine: self.index,
            graph: graph.name.clone(),
            nodes: graph.nodes.len(),
            params: *params,
        };
        scripted(self.script.record(call, |s| &mut s.compile), "compile")
    }

    fn execute(&mut self) -> EngineResult<()> {
        let call = EngineCall::Execute { engine: self.index };
        scripted(self.script.record(call, |s| &mut s.execute), "execute")
    }

    fn release(&mut self) -> EngineResult<()> {
        let call = EngineCall::Release { engine: self.index };
        scripted(self.script.record(call, |s| &mut s.release), "release")
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        self.script.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RecordingFactory {
    script: Arc<EngineScript>,
}

impl EngineFactory for RecordingFactory {
    fn create(&self) -> Box<dyn ExecutionEngine> {
        let index = self.script.created.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingEngine {
            script: Arc::clone(&self.script),
            index,
        })
    }
}

/// A non-strict device driving recording engines.
pub fn recording_device(script: &Arc<EngineScript>) -> EngineBackend<RecordingFactory> {
    EngineBackend::with_options("recording", script.factory(), DeviceOptions::default())
}
