//! Lifecycle conformance checks every [`NnDevice`] must pass.
//!
//! Each check takes a fresh, non-strict device and a subgraph constructor producing
//! subgraphs the device can compile.

use std::thread;

use nndev::{
    DeviceError, DeviceState, ExecMode, NnDevice, PrerunParams, Subgraph, STATUS_INVALID_STATE,
    STATUS_LIVE_SUBGRAPHS, STATUS_SLOT_EMPTY, STATUS_SLOT_OCCUPIED,
};

fn default_params() -> PrerunParams {
    PrerunParams::new(4, 0, ExecMode::Fp32)
}

pub fn full_lifecycle_leaves_subgraph_empty(device: &dyn NnDevice, mut subgraph: Subgraph) {
    assert_eq!(device.state(), DeviceState::Uninit);
    device.init().expect("init");
    assert_eq!(device.state(), DeviceState::Ready);

    assert!(!subgraph.is_bound());
    device.prerun(&mut subgraph, default_params()).expect("prerun");
    assert!(subgraph.is_bound());
    device.run(&mut subgraph).expect("run");
    let teardown = device.postrun(&mut subgraph).expect("postrun");
    assert!(teardown.is_clean(), "unexpected teardown {teardown:?}");
    assert!(!subgraph.is_bound());

    device.release().expect("release");
    assert_eq!(device.state(), DeviceState::Released);
}

pub fn repeated_runs_are_allowed(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    device.prerun(&mut subgraph, default_params()).expect("prerun");
    for _ in 0..3 {
        device.run(&mut subgraph).expect("run");
        assert!(subgraph.is_bound());
    }
    let _ = device.postrun(&mut subgraph).expect("postrun");
    device.release().expect("release");
}

pub fn subgraph_can_be_prerun_again_after_postrun(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    for _ in 0..2 {
        device.prerun(&mut subgraph, default_params()).expect("prerun");
        device.run(&mut subgraph).expect("run");
        let _ = device.postrun(&mut subgraph).expect("postrun");
        assert!(!subgraph.is_bound());
    }
    assert_eq!(device.live_subgraphs(), 0);
    device.release().expect("release");
}

pub fn run_before_prerun_is_rejected(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    let err = device.run(&mut subgraph).expect_err("run without prerun");
    assert_eq!(err.status(), STATUS_SLOT_EMPTY);
    assert!(err.is_protocol_violation());
    assert!(!subgraph.is_bound());
}

pub fn postrun_without_prerun_is_rejected(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    let err = device
        .postrun(&mut subgraph)
        .expect_err("postrun without prerun");
    assert_eq!(err.status(), STATUS_SLOT_EMPTY);
    device.release().expect("release");
}

pub fn second_prerun_keeps_original_handle(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    device.prerun(&mut subgraph, default_params()).expect("prerun");
    let err = device
        .prerun(&mut subgraph, default_params())
        .expect_err("second prerun");
    assert_eq!(err.status(), STATUS_SLOT_OCCUPIED);
    assert!(subgraph.is_bound());
    assert_eq!(device.live_subgraphs(), 1);

    device.run(&mut subgraph).expect("run after rejected prerun");
    let _ = device.postrun(&mut subgraph).expect("postrun");
    device.release().expect("release");
}

pub fn release_with_bound_subgraph_is_rejected(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    device.prerun(&mut subgraph, default_params()).expect("prerun");

    let err = device.release().expect_err("release with live subgraph");
    assert_eq!(err.status(), STATUS_LIVE_SUBGRAPHS);
    assert_eq!(device.state(), DeviceState::Ready);

    let _ = device.postrun(&mut subgraph).expect("postrun");
    device.release().expect("release");
}

pub fn init_twice_succeeds_release_twice_fails(device: &dyn NnDevice) {
    device.init().expect("init");
    device.init().expect("second init");
    device.release().expect("release");

    let err = device.release().expect_err("second release");
    assert!(matches!(
        err,
        DeviceError::InvalidState {
            state: DeviceState::Released,
            ..
        }
    ));
    assert_eq!(err.status(), STATUS_INVALID_STATE);
}

pub fn prerun_after_release_is_rejected(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    device.release().expect("release");
    let err = device
        .prerun(&mut subgraph, default_params())
        .expect_err("prerun on released device");
    assert_eq!(err.status(), STATUS_INVALID_STATE);
    assert!(!subgraph.is_bound());
}

pub fn dropped_subgraph_does_not_block_release(device: &dyn NnDevice, mut subgraph: Subgraph) {
    device.init().expect("init");
    device.prerun(&mut subgraph, default_params()).expect("prerun");
    assert_eq!(device.live_subgraphs(), 1);

    drop(subgraph);
    assert_eq!(device.live_subgraphs(), 0);
    device.release().expect("release after dropping a bound subgraph");
}

/// Drives every subgraph through its lifecycle on its own thread, sharing one device.
pub fn concurrent_subgraphs_are_independent(
    device: &dyn NnDevice,
    subgraphs: Vec<Subgraph>,
    runs: usize,
) {
    device.init().expect("init");

    let finished: Vec<Subgraph> = thread::scope(|scope| {
        let handles: Vec<_> = subgraphs
            .into_iter()
            .map(|mut subgraph| {
                scope.spawn(move || {
                    device.prerun(&mut subgraph, default_params()).expect("prerun");
                    for _ in 0..runs {
                        device.run(&mut subgraph).expect("run");
                        assert!(subgraph.is_bound());
                    }
                    let _ = device.postrun(&mut subgraph).expect("postrun");
                    subgraph
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("lifecycle thread panicked"))
            .collect()
    });

    assert!(finished.iter().all(|subgraph| !subgraph.is_bound()));
    assert_eq!(device.live_subgraphs(), 0);
    device.release().expect("release");
}
