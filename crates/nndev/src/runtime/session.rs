use anyhow::{Context, Result};

use crate::backend::spec::{DeviceError, DeviceResult, NnDevice, PrerunParams, Teardown};
use crate::subgraph::Subgraph;

/// A subgraph that went through prerun on a device and will go through postrun
/// exactly once, either via [`finish`](Self::finish) or on drop.
pub struct PreparedSubgraph<'a> {
    device: &'a dyn NnDevice,
    subgraph: &'a mut Subgraph,
    runs: usize,
    finished: bool,
}

impl<'a> PreparedSubgraph<'a> {
    /// Runs prerun. When compilation fails the engine is torn down here before the
    /// compile error is returned, so the caller never holds a half-prepared subgraph.
    pub fn prepare(
        device: &'a dyn NnDevice,
        subgraph: &'a mut Subgraph,
        params: PrerunParams,
    ) -> DeviceResult<Self> {
        if let Err(err) = device.prerun(subgraph, params) {
            if matches!(err, DeviceError::Compile { .. }) {
                match device.postrun(subgraph) {
                    Ok(Teardown::Clean) => {}
                    Ok(Teardown::Degraded(release)) => tracing::debug!(
                        subgraph = %subgraph.id(),
                        "release after failed compile reported: {release}"
                    ),
                    Err(postrun) => tracing::warn!(
                        subgraph = %subgraph.id(),
                        "postrun after failed compile failed: {postrun}"
                    ),
                }
            }
            return Err(err);
        }
        Ok(Self {
            device,
            subgraph,
            runs: 0,
            finished: false,
        })
    }

    pub fn subgraph(&self) -> &Subgraph {
        self.subgraph
    }

    pub fn device(&self) -> &dyn NnDevice {
        self.device
    }

    /// Successful runs so far.
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn run(&mut self) -> DeviceResult<()> {
        self.device.run(self.subgraph)?;
        self.runs += 1;
        Ok(())
    }

    pub fn finish(mut self) -> DeviceResult<Teardown> {
        self.finished = true;
        self.device.postrun(self.subgraph)
    }
}

impl Drop for PreparedSubgraph<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.device.postrun(self.subgraph) {
            Ok(teardown) => tracing::debug!(
                subgraph = %self.subgraph.id(),
                clean = teardown.is_clean(),
                "postrun on drop"
            ),
            Err(err) => tracing::warn!(
                subgraph = %self.subgraph.id(),
                "postrun on drop failed: {err}"
            ),
        }
    }
}

/// Prepares `subgraph`, runs it `iterations` times and tears it down.
pub fn execute_subgraph(
    device: &dyn NnDevice,
    subgraph: &mut Subgraph,
    params: PrerunParams,
    iterations: usize,
) -> Result<Teardown> {
    let id = subgraph.id();
    let mut prepared = PreparedSubgraph::prepare(device, subgraph, params)
        .with_context(|| format!("prerun of {id} on device {}", device.device_name()))?;
    for iteration in 0..iterations {
        prepared.run().with_context(|| {
            format!("run {iteration} of {id} on device {}", device.device_name())
        })?;
    }
    prepared
        .finish()
        .with_context(|| format!("postrun of {id} on device {}", device.device_name()))
}
