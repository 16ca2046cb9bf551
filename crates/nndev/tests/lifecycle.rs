use std::thread;

use nndev::runtime::{execute_subgraph, PreparedSubgraph};
use nndev::{
    DeviceError, DeviceState, ExecMode, NnDevice, NodeDesc, PrerunParams, Subgraph, SubgraphDesc,
    SubgraphId, Teardown, STATUS_FAILED, STATUS_FOREIGN_HANDLE, STATUS_SLOT_EMPTY,
    STATUS_SLOT_OCCUPIED,
};
use nndev_backend_tests::{recording_device, EngineCall, EngineScript};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn subgraph(id: u32) -> Subgraph {
    Subgraph::new(
        SubgraphId(id),
        SubgraphDesc::new(
            format!("graph-{id}"),
            vec![NodeDesc::new("conv"), NodeDesc::with_io("relu", vec![1], vec![2])],
        ),
    )
}

fn params() -> PrerunParams {
    PrerunParams::new(2, 0, ExecMode::Fp32)
}

nndev_backend_tests::define_device_tests!(
    recording_lifecycle,
    || recording_device(&EngineScript::new()),
    subgraph
);

#[test]
fn successful_lifecycle_calls_engine_in_order() {
    init_tracing();
    let script = EngineScript::new();
    let device = recording_device(&script);
    let mut sg = subgraph(1);

    device.init().unwrap();
    device.prerun(&mut sg, params()).unwrap();
    device.run(&mut sg).unwrap();
    device.run(&mut sg).unwrap();
    assert!(device.postrun(&mut sg).unwrap().is_clean());
    device.release().unwrap();

    assert_eq!(
        script.calls(),
        vec![
            EngineCall::Compile {
                engine: 0,
                graph: "graph-1".to_string(),
                nodes: 2,
                params: params(),
            },
            EngineCall::Execute { engine: 0 },
            EngineCall::Execute { engine: 0 },
            EngineCall::Release { engine: 0 },
        ]
    );
    assert_eq!(script.live_engines(), 0);
}

#[test]
fn failed_compile_still_frees_engine_on_postrun() {
    let script = EngineScript::new();
    script.push_compile_status(-42);
    let device = recording_device(&script);
    let mut sg = subgraph(2);

    device.init().unwrap();
    let err = device.prerun(&mut sg, params()).unwrap_err();
    assert_eq!(err.status(), -42);
    assert!(matches!(err, DeviceError::Compile { .. }));
    assert!(!err.is_protocol_violation());
    assert!(sg.is_bound());
    assert_eq!(device.live_subgraphs(), 1);

    assert!(device.postrun(&mut sg).unwrap().is_clean());
    assert!(!sg.is_bound());
    assert_eq!(script.release_count(), 1);
    assert_eq!(script.live_engines(), 0);
    device.release().unwrap();
}

#[test]
fn run_failure_passes_engine_status_through() {
    let script = EngineScript::new();
    script.push_execute_status(0);
    script.push_execute_status(17);
    let device = recording_device(&script);
    let mut sg = subgraph(3);

    device.init().unwrap();
    device.prerun(&mut sg, params()).unwrap();
    device.run(&mut sg).unwrap();
    let err = device.run(&mut sg).unwrap_err();
    assert_eq!(err.status(), 17);
    assert!(sg.is_bound());

    assert!(device.postrun(&mut sg).unwrap().is_clean());
    assert_eq!(script.execute_count(), 2);
    device.release().unwrap();
}

#[test]
fn failing_release_degrades_teardown_but_clears_slot() {
    init_tracing();
    let script = EngineScript::new();
    script.push_release_status(9);
    let device = recording_device(&script);
    let mut sg = subgraph(4);

    device.init().unwrap();
    device.prerun(&mut sg, params()).unwrap();
    let teardown = device.postrun(&mut sg).unwrap();
    match &teardown {
        Teardown::Degraded(err) => assert_eq!(err.code(), 9),
        Teardown::Clean => panic!("expected degraded teardown"),
    }
    assert!(!sg.is_bound());
    assert_eq!(script.release_count(), 1);
    assert_eq!(script.live_engines(), 0);

    // The slot is empty again, so a second postrun is a protocol violation and
    // the engine is not released twice.
    assert_eq!(
        device.postrun(&mut sg).unwrap_err().status(),
        STATUS_SLOT_EMPTY
    );
    assert_eq!(script.release_count(), 1);
    device.release().unwrap();
}

#[test]
fn engine_code_zero_is_reported_as_failure() {
    let err = nndev::EngineError::new(0, "engine claimed success while failing");
    assert_eq!(err.code(), STATUS_FAILED);
    let device_err = DeviceError::Execute {
        subgraph: SubgraphId(5),
        source: err,
    };
    assert_eq!(device_err.status(), STATUS_FAILED);
    assert_eq!(nndev::status_of(&Err::<(), _>(device_err)), STATUS_FAILED);
}

#[test]
fn subgraph_bound_to_one_device_is_rejected_by_another() {
    let script = EngineScript::new();
    let owner = recording_device(&script);
    let other = recording_device(&script);
    let mut sg = subgraph(6);

    owner.init().unwrap();
    other.init().unwrap();
    owner.prerun(&mut sg, params()).unwrap();

    let err = other.run(&mut sg).unwrap_err();
    assert_eq!(err.status(), STATUS_FOREIGN_HANDLE);
    let err = other.postrun(&mut sg).unwrap_err();
    assert_eq!(err.status(), STATUS_FOREIGN_HANDLE);
    assert!(err.is_protocol_violation());
    assert!(sg.is_bound());
    assert_eq!(script.execute_count(), 0);
    assert_eq!(script.release_count(), 0);

    assert!(owner.postrun(&mut sg).unwrap().is_clean());
    owner.release().unwrap();
    other.release().unwrap();
}

#[test]
fn thread_count_zero_uses_device_default() {
    let script = EngineScript::new();
    let device = recording_device(&script);
    let mut sg = subgraph(7);
    device.init().unwrap();

    device
        .prerun(&mut sg, PrerunParams::from_raw(0, 3, 1))
        .unwrap();
    let resolved = device.options().default_num_thread;
    match &script.calls()[0] {
        EngineCall::Compile { params, .. } => {
            assert_eq!(params.num_thread, resolved);
            assert_eq!(params.cpu_affinity, 3);
            assert_eq!(params.mode, ExecMode::Fp16);
        }
        other => panic!("unexpected first call {other:?}"),
    }
    let _ = device.postrun(&mut sg).unwrap();
}

#[test]
fn desc_cannot_change_while_bound() {
    let script = EngineScript::new();
    let device = recording_device(&script);
    let mut sg = subgraph(8);
    device.init().unwrap();

    device.prerun(&mut sg, params()).unwrap();
    let err = sg
        .set_desc(SubgraphDesc::new("other", vec![NodeDesc::new("noop")]))
        .unwrap_err();
    assert_eq!(err.status(), STATUS_SLOT_OCCUPIED);
    assert_eq!(sg.desc().name, "graph-8");

    let _ = device.postrun(&mut sg).unwrap();
    sg.set_desc(SubgraphDesc::new("other", vec![NodeDesc::new("noop")]))
        .unwrap();
    assert_eq!(sg.desc().name, "other");
}

#[test]
fn desc_survives_json_round_trip() {
    let desc = SubgraphDesc::new(
        "json",
        vec![NodeDesc::with_io("add", vec![0, 1], vec![2]), NodeDesc::new("noop")],
    );
    let json = desc.to_json_string().unwrap();
    assert_eq!(SubgraphDesc::from_json_str(&json).unwrap(), desc);

    let sparse = SubgraphDesc::from_json_str(r#"{"name":"s","nodes":[{"op":"noop"}]}"#).unwrap();
    assert!(sparse.nodes[0].inputs.is_empty());
    assert!(sparse.nodes[0].outputs.is_empty());
}

#[test]
fn prepared_subgraph_tears_down_on_drop() {
    init_tracing();
    let script = EngineScript::new();
    let device = recording_device(&script);
    let mut sg = subgraph(9);
    device.init().unwrap();

    {
        let mut prepared = PreparedSubgraph::prepare(&device, &mut sg, params()).unwrap();
        prepared.run().unwrap();
        prepared.run().unwrap();
        assert_eq!(prepared.runs(), 2);
        assert_eq!(prepared.device().live_subgraphs(), 1);
    }
    assert!(!sg.is_bound());
    assert_eq!(script.release_count(), 1);
    assert_eq!(device.live_subgraphs(), 0);
    device.release().unwrap();
}

#[test]
fn prepared_subgraph_finish_releases_once() {
    let script = EngineScript::new();
    script.push_release_status(5);
    let device = recording_device(&script);
    let mut sg = subgraph(10);
    device.init().unwrap();

    let prepared = PreparedSubgraph::prepare(&device, &mut sg, params()).unwrap();
    let teardown = prepared.finish().unwrap();
    assert_eq!(teardown.release_error().map(|err| err.code()), Some(5));
    assert_eq!(script.release_count(), 1);
    assert!(!sg.is_bound());
}

#[test]
fn prepare_cleans_up_after_failed_compile() {
    let script = EngineScript::new();
    script.push_compile_status(3);
    let device = recording_device(&script);
    let mut sg = subgraph(11);
    device.init().unwrap();

    let err = PreparedSubgraph::prepare(&device, &mut sg, params())
        .err()
        .expect("compile should fail");
    assert_eq!(err.status(), 3);
    assert!(!sg.is_bound());
    assert_eq!(script.live_engines(), 0);
    device.release().unwrap();
}

#[test]
fn execute_subgraph_reports_failing_iteration() {
    let script = EngineScript::new();
    script.push_execute_status(0);
    script.push_execute_status(0);
    script.push_execute_status(11);
    let device = recording_device(&script);
    let mut sg = subgraph(12);
    device.init().unwrap();

    let err = execute_subgraph(&device, &mut sg, params(), 5).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("run 2 of sg12 on device recording"), "{rendered}");
    assert_eq!(script.execute_count(), 3);
    assert!(!sg.is_bound());
    assert_eq!(device.state(), DeviceState::Ready);
    device.release().unwrap();
}

#[test]
fn dropped_bound_subgraph_releases_engine_and_unblocks_device() {
    init_tracing();
    let script = EngineScript::new();
    let device = recording_device(&script);
    device.init().unwrap();

    {
        let mut sg = subgraph(13);
        device.prerun(&mut sg, params()).unwrap();
        device.run(&mut sg).unwrap();
        assert_eq!(device.live_subgraphs(), 1);
    }

    assert_eq!(script.release_count(), 1);
    assert_eq!(script.live_engines(), 0);
    assert_eq!(device.live_subgraphs(), 0);
    device.release().unwrap();
    assert_eq!(device.state(), DeviceState::Released);
}

#[test]
fn worker_panic_with_bound_subgraph_does_not_block_release() {
    let script = EngineScript::new();
    let device = recording_device(&script);
    device.init().unwrap();

    let outcome = thread::scope(|scope| {
        scope
            .spawn(|| {
                let mut sg = subgraph(14);
                device.prerun(&mut sg, params()).unwrap();
                panic!("worker failed between prerun and postrun");
            })
            .join()
    });
    assert!(outcome.is_err());

    assert_eq!(script.release_count(), 1);
    assert_eq!(device.live_subgraphs(), 0);
    device.release().unwrap();
}

#[test]
fn failing_release_on_drop_still_frees_the_engine() {
    let script = EngineScript::new();
    script.push_release_status(21);
    let device = recording_device(&script);
    device.init().unwrap();

    let mut sg = subgraph(15);
    device.prerun(&mut sg, params()).unwrap();
    drop(sg);

    assert_eq!(script.release_count(), 1);
    assert_eq!(script.live_engines(), 0);
    device.release().unwrap();
}
