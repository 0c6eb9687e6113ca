//! Session root: the operation context plus the instruments it drives.
use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::info;

use resotrack_shared::Address;

use crate::controller::{
    DataRecorder, FrequencySweeper, FrequencyTracker, RecorderConfig, RunCtx, SweepConfig,
    TrackingConfig,
};
use crate::error::Result;
use crate::logging;
use crate::peripheral::{Connector, InstrumentRegistry, RetryPolicy};

/// Owns the instrument registry for one operation and builds tasks against it.
pub struct Workbench {
    ctx: RunCtx,
    registry: InstrumentRegistry,
}

impl Workbench {
    /// Connect every instrument in `<op_dir>/config/instruments_config.json`.
    /// Returns the connection status per configured address.
    pub fn open(
        ctx: RunCtx,
        connector: impl Connector + 'static,
    ) -> Result<(Self, BTreeMap<Address, bool>)> {
        Self::open_with_retry(ctx, connector, RetryPolicy::default())
    }

    pub fn open_with_retry(
        ctx: RunCtx,
        connector: impl Connector + 'static,
        retry: RetryPolicy,
    ) -> Result<(Self, BTreeMap<Address, bool>)> {
        let (registry, status) =
            InstrumentRegistry::open(connector, &ctx.instrument_config_path(), retry)?;
        let connected = status.values().filter(|ok| **ok).count();
        info!(
            "Opened {} with {connected}/{} configured instruments",
            ctx.op_name,
            status.len()
        );
        Ok((Self { ctx, registry }, status))
    }

    pub fn ctx(&self) -> &RunCtx {
        &self.ctx
    }

    /// Log to stdout and `<op_dir>/logs/<op_name>.log`
    pub fn init_logging(&self) -> Result<PathBuf> {
        logging::init_logging(&self.ctx.op_dir, &self.ctx.op_name)
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut InstrumentRegistry {
        &mut self.registry
    }

    pub fn tracker(
        &self,
        lockin: &str,
        generator: &str,
        config: TrackingConfig,
    ) -> Result<FrequencyTracker> {
        Ok(FrequencyTracker::new(
            self.ctx.clone(),
            Some(self.registry.lockin(lockin)?),
            Some(self.registry.generator(generator)?),
            config,
        ))
    }

    /// Recorder over every lock-in and environment controller connected now
    pub fn recorder(&self, config: RecorderConfig) -> DataRecorder {
        DataRecorder::from_registry(self.ctx.clone(), &self.registry, config)
    }

    pub fn sweeper(
        &self,
        lockin: &str,
        generator: &str,
        config: SweepConfig,
    ) -> Result<FrequencySweeper> {
        Ok(FrequencySweeper::new(
            self.ctx.clone(),
            Some(self.registry.lockin(lockin)?),
            Some(self.registry.generator(generator)?),
            config,
        ))
    }

    /// Close every instrument. Returns false if any failed to close cleanly.
    pub fn close(mut self) -> bool {
        self.registry.close_all()
    }
}
