pub mod lifecycle;
pub mod recording_engine;

pub use recording_engine::{
    recording_device, EngineCall, EngineScript, RecordingEngine, RecordingFactory,
};

/// Instantiates the lifecycle conformance suite for a device.
///
/// `$device_ctor` returns a fresh, non-strict `impl NnDevice`; `$subgraph_ctor` maps a
/// `u32` id to a `Subgraph` the device can compile.
#[macro_export]
macro_rules! define_device_tests {
    ($module:ident, $device_ctor:expr, $subgraph_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::lifecycle;

            #[test]
            fn full_lifecycle_leaves_subgraph_empty() {
                let device = ($device_ctor)();
                lifecycle::full_lifecycle_leaves_subgraph_empty(&device, ($subgraph_ctor)(1));
            }

            #[test]
            fn repeated_runs_are_allowed() {
                let device = ($device_ctor)();
                lifecycle::repeated_runs_are_allowed(&device, ($subgraph_ctor)(3));
            }

            #[test]
            fn subgraph_can_be_prerun_again_after_postrun() {
                let device = ($device_ctor)();
                lifecycle::subgraph_can_be_prerun_again_after_postrun(
                    &device,
                    ($subgraph_ctor)(4),
                );
            }

            #[test]
            fn run_before_prerun_is_rejected() {
                let device = ($device_ctor)();
                lifecycle::run_before_prerun_is_rejected(&device, ($subgraph_ctor)(5));
            }

            #[test]
            fn postrun_without_prerun_is_rejected() {
                let device = ($device_ctor)();
                lifecycle::postrun_without_prerun_is_rejected(&device, ($subgraph_ctor)(6));
            }

            #[test]
            fn second_prerun_keeps_original_handle() {
                let device = ($device_ctor)();
                lifecycle::second_prerun_keeps_original_handle(&device, ($subgraph_ctor)(7));
            }

            #[test]
            fn release_with_bound_subgraph_is_rejected() {
                let device = ($device_ctor)();
                lifecycle::release_with_bound_subgraph_is_rejected(&device, ($subgraph_ctor)(8));
            }

            #[test]
            fn init_twice_succeeds_release_twice_fails() {
                let device = ($device_ctor)();
                lifecycle::init_twice_succeeds_release_twice_fails(&device);
            }

            #[test]
            fn prerun_after_release_is_rejected() {
                let device = ($device_ctor)();
                lifecycle::prerun_after_release_is_rejected(&device, ($subgraph_ctor)(9));
            }

            #[test]
            fn dropped_subgraph_does_not_block_release() {
                let device = ($device_ctor)();
                lifecycle::dropped_subgraph_does_not_block_release(&device, ($subgraph_ctor)(19));
            }

            #[test]
            fn concurrent_subgraphs_are_independent() {
                let device = ($device_ctor)();
                let subgraphs = (10..18).map($subgraph_ctor).collect();
                lifecycle::concurrent_subgraphs_are_independent(&device, subgraphs, 5);
            }
        }
    };
}
