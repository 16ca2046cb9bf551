//! Runtime device registry for selecting device backends by name.
//!
//! Device crates register a constructor under one or more names; the host runtime
//! then creates devices without naming concrete backend types.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use super::engine_backend::EngineBackend;
use super::spec::{EngineFactory, NnDevice};
use crate::env::DeviceOptions;

/// Factory function that creates a new device instance.
pub type DeviceConstructor = Box<dyn Fn() -> Box<dyn NnDevice> + Send + Sync>;

struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceConstructor>>,
}

impl DeviceRegistry {
    fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: DeviceConstructor) {
        self.devices
            .write()
            .expect("device registry poisoned")
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Box<dyn NnDevice>> {
        let registry = self.devices.read().expect("device registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .expect("device registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has_device(&self, name: &str) -> bool {
        self.devices
            .read()
            .expect("device registry poisoned")
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DeviceRegistry> = OnceLock::new();

fn global_registry() -> &'static DeviceRegistry {
    GLOBAL_REGISTRY.get_or_init(DeviceRegistry::new)
}

/// Register a device by name with a constructor function.
///
/// The constructor runs every time the device is requested via [`create_device`], so
/// each host gets its own device instance and lifecycle. Registering an existing name
/// replaces the previous constructor.
pub fn register_device<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Box<dyn NnDevice> + Send + Sync + 'static,
{
    let name = name.into();
    tracing::debug!(device = %name, "registering device");
    global_registry().register(name, Box::new(constructor));
}

/// Register an [`EngineBackend`] built from an engine factory.
///
/// The factory constructor is invoked per created device; options come from the
/// process environment at creation time.
pub fn register_engine_device<E, F>(name: impl Into<String>, factory: F)
where
    E: EngineFactory + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    let name = name.into();
    let device_name = name.clone();
    register_device(name, move || {
        Box::new(EngineBackend::with_options(
            device_name.clone(),
            factory(),
            DeviceOptions::from_env(),
        ))
    });
}

/// Create a device instance by name, or `None` if nothing is registered under it.
pub fn create_device(name: &str) -> Option<Box<dyn NnDevice>> {
    global_registry().create(name)
}

/// All registered device names, sorted.
pub fn list_devices() -> Vec<String> {
    global_registry().list_devices()
}

pub fn has_device(name: &str) -> bool {
    global_registry().has_device(name)
}
