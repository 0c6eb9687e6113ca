//! Periodic acquisition from every lock-in and environment controller,
//! with crash-safe spills to disk and a final merged save.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use resotrack_shared::{
    Address, DeviceError, EnvironmentController, EnvironmentReading, InstrumentKind, LockIn,
    RECORD_SNAPSHOT,
};

use crate::dispatcher::{ChunkStore, FieldValue, OutputChain, SampleTable, SavedOutput};
use crate::error::{Error, Result};
use crate::peripheral::{InstrumentRegistry, ReadCache};

use super::context::file_stamp;
use super::nonblocking::FinishGuard;
use super::timing::{Pacer, Stopwatch};
use super::{RunCtx, TaskCore, TaskEvent, TaskState, Termination};

/// Recording settings, applied at the next start
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    /// Seconds between acquisitions
    pub time_step: f64,

    /// Stop on its own after this many seconds
    pub max_duration: Option<f64>,

    /// Seconds between spills of the buffer to a temporary file
    pub temp_save_interval: f64,

    /// Minimum seconds between requests to the same environment controller
    pub min_read_interval: f64,

    /// Consecutive empty acquisitions after which the run is abandoned
    pub max_failed_ticks: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            time_step: 1.0,
            max_duration: None,
            temp_save_interval: 300.0,
            min_read_interval: 1.0,
            max_failed_ticks: 10,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.time_step > 0.0) {
            return Err(Error::config("time step must be positive"));
        }
        if !(self.temp_save_interval > 0.0) {
            return Err(Error::config("temp save interval must be positive"));
        }
        if !(self.min_read_interval >= 0.0) {
            return Err(Error::config("minimum read interval must not be negative"));
        }
        if self.max_failed_ticks == 0 {
            return Err(Error::config("failure limit must be at least 1"));
        }
        Ok(())
    }
}

/// Named values from one instrument
pub type Fields = BTreeMap<String, FieldValue>;

/// One acquisition across all instruments.
///
/// Serializes as `{"time": .., "timestamp": .., "SR830": {"<address>": {"X": ..}}, ..}`,
/// which flattens to columns such as `SR830_<address>_X`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RecordSample {
    /// Seconds since the run started
    #[serde(rename = "time")]
    pub elapsed_time: f64,

    /// Unix seconds
    #[serde(rename = "timestamp")]
    pub wall_timestamp: f64,

    #[serde(flatten)]
    pub readings: BTreeMap<InstrumentKind, BTreeMap<Address, Fields>>,
}

impl RecordSample {
    pub fn get(&self, kind: InstrumentKind, address: &str, name: &str) -> Option<&FieldValue> {
        self.readings.get(&kind)?.get(address)?.get(name)
    }
}

/// Outcome of one acquisition
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: RecordSample,

    /// Per-instrument failures; the tick may still have produced data
    pub errors: Vec<DeviceError>,

    /// Instruments that contributed a reading, cached or fresh
    pub devices_read: usize,

    pub device_count: usize,
}

impl TickReport {
    /// Instruments were available but none of them produced anything
    pub fn is_failed(&self) -> bool {
        self.device_count > 0 && self.devices_read == 0
    }
}

/// Reads every instrument once per call, rate-limiting the environment controllers.
pub struct Acquisition {
    lockins: Vec<Arc<dyn LockIn>>,
    environments: Vec<Arc<dyn EnvironmentController>>,
    cache: ReadCache<EnvironmentReading>,
}

impl Acquisition {
    pub fn new(
        lockins: Vec<Arc<dyn LockIn>>,
        environments: Vec<Arc<dyn EnvironmentController>>,
        min_read_interval: f64,
    ) -> Self {
        Self {
            lockins,
            environments,
            cache: ReadCache::new(min_read_interval),
        }
    }

    pub fn device_count(&self) -> usize {
        self.lockins.len() + self.environments.len()
    }

    /// `elapsed` is the monotonic run time, also used as the cache clock.
    pub fn collect(&mut self, elapsed: f64, wall_timestamp: f64) -> TickReport {
        let mut sample = RecordSample {
            elapsed_time: elapsed,
            wall_timestamp,
            readings: BTreeMap::new(),
        };
        let mut errors = Vec::new();
        let mut devices_read = 0;

        for lockin in &self.lockins {
            match lockin_fields(lockin.as_ref()) {
                Ok(fields) => {
                    sample
                        .readings
                        .entry(InstrumentKind::Sr830)
                        .or_default()
                        .insert(lockin.address().to_owned(), fields);
                    devices_read += 1;
                }
                Err(e) => errors.push(e),
            }
        }

        for env in &self.environments {
            let lookup = self
                .cache
                .read_with(env.address(), elapsed, || env.get_temperature_and_field());
            if let Some(e) = lookup.error {
                errors.push(e);
            }
            if let Some(reading) = lookup.value {
                sample
                    .readings
                    .entry(InstrumentKind::Ppms)
                    .or_default()
                    .insert(env.address().to_owned(), environment_fields(reading));
                devices_read += 1;
            }
        }

        TickReport {
            sample,
            errors,
            devices_read,
            device_count: self.device_count(),
        }
    }
}

fn lockin_fields(lockin: &dyn LockIn) -> std::result::Result<Fields, DeviceError> {
    let values = lockin.snapshot(&RECORD_SNAPSHOT)?;
    if values.len() != RECORD_SNAPSHOT.len() {
        return Err(DeviceError::Malformed {
            address: lockin.address().to_owned(),
            response: format!(
                "{} values for {} parameters",
                values.len(),
                RECORD_SNAPSHOT.len()
            ),
        });
    }
    Ok(RECORD_SNAPSHOT
        .iter()
        .zip(values)
        .map(|(p, v)| (p.name().to_owned(), FieldValue::Number(v)))
        .collect())
}

fn environment_fields(reading: EnvironmentReading) -> Fields {
    BTreeMap::from([
        ("temperature".to_owned(), reading.temperature.into()),
        ("temp_status".to_owned(), reading.temperature_status.into()),
        ("field".to_owned(), reading.field.into()),
        ("field_status".to_owned(), reading.field_status.into()),
    ])
}

/// Samples not yet merged into a final file
#[derive(Default)]
struct RecordingStore {
    buffer: Vec<RecordSample>,
    chunks: Option<ChunkStore>,
}

impl RecordingStore {
    /// Spill the buffer to a new chunk. The buffer is kept if the write fails.
    fn flush(&mut self) -> Result<()> {
        let Some(chunks) = self.chunks.as_mut() else {
            return Ok(());
        };
        chunks.flush(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    fn merged(&self) -> Vec<RecordSample> {
        let mut out = match &self.chunks {
            Some(chunks) => chunks.load_all(),
            None => Vec::new(),
        };
        out.extend(self.buffer.iter().cloned());
        out
    }
}

fn lock_store(store: &Mutex<RecordingStore>) -> MutexGuard<'_, RecordingStore> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background data recording task.
pub struct DataRecorder {
    ctx: RunCtx,
    lockins: Vec<Arc<dyn LockIn>>,
    environments: Vec<Arc<dyn EnvironmentController>>,
    config: RecorderConfig,
    store: Arc<Mutex<RecordingStore>>,
    outputs: OutputChain,
    core: TaskCore<RecordSample>,
}

impl DataRecorder {
    pub fn new(
        ctx: RunCtx,
        lockins: Vec<Arc<dyn LockIn>>,
        environments: Vec<Arc<dyn EnvironmentController>>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            ctx,
            lockins,
            environments,
            config,
            store: Arc::new(Mutex::new(RecordingStore::default())),
            outputs: OutputChain::default(),
            core: TaskCore::new("data-recorder"),
        }
    }

    /// Record from every lock-in and environment controller in the registry
    pub fn from_registry(ctx: RunCtx, registry: &InstrumentRegistry, config: RecorderConfig) -> Self {
        Self::new(ctx, registry.lockins(), registry.environments(), config)
    }

    pub fn with_outputs(mut self, outputs: OutputChain) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Takes effect at the next start
    pub fn set_recording_params(&mut self, time_step: f64, max_duration: Option<f64>) {
        self.config.time_step = time_step;
        self.config.max_duration = max_duration;
    }

    /// Takes effect at the next start
    pub fn set_temp_save_interval(&mut self, seconds: f64) {
        self.config.temp_save_interval = seconds;
    }

    /// Replace the instruments to record from. Takes effect at the next start.
    pub fn set_instruments(
        &mut self,
        lockins: Vec<Arc<dyn LockIn>>,
        environments: Vec<Arc<dyn EnvironmentController>>,
    ) {
        self.lockins = lockins;
        self.environments = environments;
    }

    pub fn events(&self) -> Receiver<TaskEvent<RecordSample>> {
        self.core.events()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Every sample of the current or last run, including those spilled to disk
    pub fn samples(&self) -> Vec<RecordSample> {
        lock_store(&self.store).merged()
    }

    /// Samples as a table, for choosing and plotting columns
    pub fn table(&self) -> Result<SampleTable> {
        SampleTable::from_samples(&self.samples())
    }

    /// Start recording on a background thread.
    pub fn start(&mut self) -> Result<()> {
        self.config.validate()?;
        self.core.ensure_idle()?;

        let chunk_dir = self
            .ctx
            .temp_dir()
            .join(format!("recording_{}", file_stamp(SystemTime::now())));
        let chunks = ChunkStore::create(chunk_dir)?;
        info!("Recording temporary data to {:?}", chunks.dir());
        {
            let mut store = lock_store(&self.store);
            store.buffer.clear();
            store.chunks = Some(chunks);
        }

        let acquisition = Acquisition::new(
            self.lockins.clone(),
            self.environments.clone(),
            self.config.min_read_interval,
        );
        if acquisition.device_count() == 0 {
            warn!("Recording with no instruments; samples will only carry time");
        }

        let worker = RecorderWorker {
            acquisition,
            config: self.config.clone(),
            store: self.store.clone(),
            events: self.core.sender(),
        };
        self.core.spawn(move |stop| worker.run(&stop))
    }

    /// Request a stop. Does nothing when idle.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Wait for the current run to exit
    pub fn join(&mut self) -> Result<()> {
        self.core.join()
    }

    /// Merge spilled and buffered samples into one file, by default
    /// `history_data/data_record_<stamp>.dat`, then delete the temporary files.
    pub fn save_final_data(&self, path: Option<&Path>) -> Result<SavedOutput> {
        if self.is_running() {
            return Err(Error::config("cannot save while recording"));
        }
        let mut store = lock_store(&self.store);
        let samples = store.merged();

        let path = match path {
            Some(p) => p.to_owned(),
            None => self.ctx.default_data_path("data_record"),
        };
        let saved = self.outputs.save(&samples, &path, "Data Record")?;

        // Everything is in memory again; drop the spilled copies
        if let Some(mut chunks) = store.chunks.take() {
            chunks.cleanup();
        }
        store.buffer = samples;
        Ok(saved)
    }
}

struct RecorderWorker {
    acquisition: Acquisition,
    config: RecorderConfig,
    store: Arc<Mutex<RecordingStore>>,
    events: Sender<TaskEvent<RecordSample>>,
}

impl RecorderWorker {
    fn run(mut self, stop: &AtomicBool) {
        let mut finish = FinishGuard::new("Data recording", self.events.clone());
        let termination = self.run_loop(stop);

        // Whatever is left goes to disk with the rest
        if let Err(e) = lock_store(&self.store).flush() {
            error!("Final temporary save failed: {e}");
            let _ = self.events.send(TaskEvent::Error(e.to_string()));
        }
        finish.finish(termination);
    }

    fn run_loop(&mut self, stop: &AtomicBool) -> Termination {
        let _ = self
            .events
            .send(TaskEvent::Status("Data recording started".into()));

        let clock = Stopwatch::start();
        let mut pacer = Pacer::new(self.config.time_step);
        let mut last_spill = 0.0;
        let mut failed_ticks = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Termination::Stopped;
            }
            pacer.begin();
            let elapsed = clock.elapsed_s();
            if self.config.max_duration.is_some_and(|max| elapsed >= max) {
                return Termination::Completed;
            }

            let report = self.acquisition.collect(elapsed, clock.wall_timestamp());
            for e in &report.errors {
                warn!("Acquisition error: {e}");
                let _ = self.events.send(TaskEvent::Error(e.to_string()));
            }

            if report.is_failed() {
                failed_ticks += 1;
                let _ = self.events.send(TaskEvent::Error(format!(
                    "No instrument responded ({failed_ticks} consecutive)"
                )));
                if failed_ticks >= self.config.max_failed_ticks {
                    return Termination::Failed(format!(
                        "stopped after {failed_ticks} consecutive failed acquisitions"
                    ));
                }
            } else {
                failed_ticks = 0;
                let sample = report.sample;
                lock_store(&self.store).buffer.push(sample.clone());
                let _ = self.events.send(TaskEvent::Sample(sample));
                let _ = self.events.send(TaskEvent::Elapsed(elapsed));

                if elapsed - last_spill >= self.config.temp_save_interval {
                    match lock_store(&self.store).flush() {
                        Ok(()) => last_spill = elapsed,
                        Err(e) => {
                            error!("Temporary save failed: {e}");
                            let _ = self.events.send(TaskEvent::Error(e.to_string()));
                        }
                    }
                }
            }

            pacer.wait(stop);
        }
    }
}
