pub mod engine;

pub use engine::{
    Kernel, KernelTable, RefEngine, RefEngineFactory, REF_STATUS_EMPTY_GRAPH,
    REF_STATUS_KERNEL_FAILED, REF_STATUS_NOT_COMPILED, REF_STATUS_UNSUPPORTED_MODE,
    REF_STATUS_UNSUPPORTED_OP,
};

use nndev::{DeviceOptions, EngineBackend};

/// Reference device: the generic engine backend over [`RefEngine`]s.
pub type RefDevice = EngineBackend<RefEngineFactory>;

/// Creates a reference device with the builtin kernels, configured from the environment.
pub fn ref_device() -> RefDevice {
    EngineBackend::new("ref", RefEngineFactory::builtin())
}

pub fn ref_device_with(kernels: KernelTable, options: DeviceOptions) -> RefDevice {
    EngineBackend::with_options("ref", RefEngineFactory::new(kernels), options)
}

/// Register the reference device with the global device registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the device is registered.
/// The device is registered under both "ref" and "cpu-ref" names.
pub fn register_ref_device() {
    nndev::backend::registry::register_engine_device("ref", RefEngineFactory::builtin);
    nndev::backend::registry::register_engine_device("cpu-ref", RefEngineFactory::builtin);
}

// Auto-register on library load
#[cfg(any(target_os = "linux", target_os = "android"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_DEVICE: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_device();
    }
    register
};
