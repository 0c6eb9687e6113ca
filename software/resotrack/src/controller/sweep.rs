//! Open-loop frequency sweep: step the generator across a ladder
//! and take one lock-in snapshot per step.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use resotrack_shared::{DeviceError, LockIn, SWEEP_SNAPSHOT, SignalGenerator, Waveform};

use crate::calc::{FrequencyLadder, Spacing, estimate_frequency, step_count};
use crate::dispatcher::{OutputChain, SavedOutput};
use crate::error::{Error, Result};

use super::nonblocking::{FinishGuard, OutputGuard};
use super::timing::{Stopwatch, sleep_unless_stopped};
use super::{RunCtx, TaskCore, TaskEvent, TaskState, Termination};

/// Sweep settings, applied at the next start
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    pub start_hz: f64,
    pub stop_hz: f64,

    /// Nominal duration in seconds
    pub sweep_time_s: f64,

    /// Together with the sweep time, sets the number of steps
    pub sample_interval: f64,

    /// Wait after each frequency change before reading the lock-in
    pub settle_interval: f64,

    /// Interpolation used to estimate the frequency when it cannot be read back
    pub spacing: Spacing,

    pub waveform: Waveform,

    /// Peak-to-peak volts
    pub amplitude: f64,

    /// Volts
    pub offset: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_hz: 1000.0,
            stop_hz: 2000.0,
            sweep_time_s: 10.0,
            sample_interval: 0.2,
            settle_interval: 0.5,
            spacing: Spacing::Linear,
            waveform: Waveform::Sine,
            amplitude: 0.01,
            offset: 0.0,
        }
    }
}

impl SweepConfig {
    /// Number of frequency steps
    pub fn steps(&self) -> usize {
        step_count(self.sweep_time_s, self.sample_interval)
    }

    pub fn ladder(&self) -> FrequencyLadder {
        FrequencyLadder::new(self.start_hz, self.stop_hz, self.steps())
    }

    /// Time the steps will actually take, which differs from `sweep_time_s`
    /// whenever the settle and sample intervals differ
    pub fn expected_duration_s(&self) -> f64 {
        self.steps() as f64 * self.settle_interval
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.start_hz.is_finite() && self.stop_hz.is_finite()) {
            return Err(Error::config("sweep bounds must be finite"));
        }
        if self.start_hz >= self.stop_hz {
            return Err(Error::config(format!(
                "start frequency {} Hz must be below stop frequency {} Hz",
                self.start_hz, self.stop_hz
            )));
        }
        if self.spacing == Spacing::Logarithmic && self.start_hz <= 0.0 {
            return Err(Error::config("logarithmic spacing needs a positive start frequency"));
        }
        if !(self.settle_interval >= 0.0) {
            return Err(Error::config("settle interval must not be negative"));
        }
        if self.steps() == 0 {
            return Err(Error::config(format!(
                "a {} s sweep at {} s per sample has no steps",
                self.sweep_time_s, self.sample_interval
            )));
        }
        Ok(())
    }
}

/// One step of a sweep
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    /// Read back from the generator, or estimated if that failed
    pub frequency: f64,

    #[serde(rename = "X")]
    pub x: f64,

    #[serde(rename = "Y")]
    pub y: f64,

    #[serde(rename = "R")]
    pub r: f64,

    /// Degrees
    pub theta: f64,

    /// Unix seconds
    #[serde(rename = "timestamp")]
    pub wall_timestamp: f64,

    /// Seconds since the sweep started
    pub elapsed_time: f64,
}

/// Instrument operations of a sweep, without any threading.
pub struct SweepRun {
    lockin: Arc<dyn LockIn>,
    generator: Arc<dyn SignalGenerator>,
    config: SweepConfig,
    ladder: FrequencyLadder,
}

impl SweepRun {
    pub fn new(
        lockin: Arc<dyn LockIn>,
        generator: Arc<dyn SignalGenerator>,
        config: SweepConfig,
    ) -> Self {
        let ladder = config.ladder();
        Self {
            lockin,
            generator,
            config,
            ladder,
        }
    }

    pub fn ladder(&self) -> &FrequencyLadder {
        &self.ladder
    }

    /// Program the output shape and switch it on
    pub fn prepare(&self) -> std::result::Result<(), DeviceError> {
        self.generator.set_waveform(self.config.waveform)?;
        self.generator.set_amplitude(self.config.amplitude)?;
        self.generator.set_offset(self.config.offset)?;
        self.generator.set_output(true)
    }

    /// Command step `i` of the ladder
    pub fn set_step(&self, i: usize) -> std::result::Result<f64, DeviceError> {
        let hz = self.ladder.get(i).unwrap_or(self.config.stop_hz);
        self.generator.set_frequency(hz)?;
        Ok(hz)
    }

    /// Read the response. If either instrument fails, the sample carries an estimated
    /// frequency and zero response, and the error is returned alongside it.
    pub fn measure(&self, elapsed: f64, wall_timestamp: f64) -> (SweepSample, Option<DeviceError>) {
        let read = self.generator.get_frequency().and_then(|hz| {
            let values = self.lockin.snapshot(&SWEEP_SNAPSHOT)?;
            match values[..] {
                [x, y, r, theta] => Ok((hz, x, y, r, theta)),
                _ => Err(DeviceError::Malformed {
                    address: self.lockin.address().to_owned(),
                    response: format!(
                        "{} values for {} parameters",
                        values.len(),
                        SWEEP_SNAPSHOT.len()
                    ),
                }),
            }
        });

        match read {
            Ok((frequency, x, y, r, theta)) => (
                SweepSample {
                    frequency,
                    x,
                    y,
                    r,
                    theta,
                    wall_timestamp,
                    elapsed_time: elapsed,
                },
                None,
            ),
            Err(e) => {
                let progress = if self.config.sweep_time_s > 0.0 {
                    (elapsed / self.config.sweep_time_s).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let frequency = estimate_frequency(
                    self.config.start_hz,
                    self.config.stop_hz,
                    progress,
                    self.config.spacing,
                );
                (
                    SweepSample {
                        frequency,
                        x: 0.0,
                        y: 0.0,
                        r: 0.0,
                        theta: 0.0,
                        wall_timestamp,
                        elapsed_time: elapsed,
                    },
                    Some(e),
                )
            }
        }
    }
}

/// Background frequency sweep task.
pub struct FrequencySweeper {
    ctx: RunCtx,
    lockin: Option<Arc<dyn LockIn>>,
    generator: Option<Arc<dyn SignalGenerator>>,
    config: SweepConfig,
    samples: Arc<Mutex<Vec<SweepSample>>>,
    outputs: OutputChain,
    core: TaskCore<SweepSample>,
}

impl FrequencySweeper {
    pub fn new(
        ctx: RunCtx,
        lockin: Option<Arc<dyn LockIn>>,
        generator: Option<Arc<dyn SignalGenerator>>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ctx,
            lockin,
            generator,
            config,
            samples: Arc::new(Mutex::new(Vec::new())),
            outputs: OutputChain::default(),
            core: TaskCore::new("frequency-sweeper"),
        }
    }

    pub fn with_outputs(mut self, outputs: OutputChain) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Takes effect at the next start
    pub fn set_sweep_params(&mut self, config: SweepConfig) {
        self.config = config;
    }

    pub fn events(&self) -> Receiver<TaskEvent<SweepSample>> {
        self.core.events()
    }

    /// Copy of the samples of the current or last sweep
    pub fn samples(&self) -> Vec<SweepSample> {
        self.samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Start the sweep on a background thread.
    pub fn start(&mut self) -> Result<()> {
        let lockin = self
            .lockin
            .clone()
            .ok_or(Error::MissingDevice { role: "lock-in" })?;
        let generator = self
            .generator
            .clone()
            .ok_or(Error::MissingDevice { role: "generator" })?;
        self.config.validate()?;
        self.core.ensure_idle()?;

        let expected = self.config.expected_duration_s();
        if (expected - self.config.sweep_time_s).abs() > 1e-9 {
            warn!(
                "Sweep of {} steps at {} s settle will take {expected} s, not {} s",
                self.config.steps(),
                self.config.settle_interval,
                self.config.sweep_time_s
            );
        }

        match self.samples.lock() {
            Ok(mut s) => s.clear(),
            Err(e) => e.into_inner().clear(),
        }

        let worker = SweepWorker {
            run: SweepRun::new(lockin, generator.clone(), self.config.clone()),
            generator,
            settle: Duration::try_from_secs_f64(self.config.settle_interval)
                .unwrap_or(Duration::ZERO),
            samples: self.samples.clone(),
            events: self.core.sender(),
        };
        self.core.spawn(move |stop| worker.run(&stop))
    }

    /// Request a stop, observed before the next step. Does nothing when idle.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Wait for the current sweep to exit
    pub fn join(&mut self) -> Result<()> {
        self.core.join()
    }

    /// Save the sweep, by default to `history_data/frequency_sweep_<stamp>.dat`.
    pub fn save_sweep_data(&self, path: Option<&Path>) -> Result<SavedOutput> {
        let samples = self.samples();
        let path = match path {
            Some(p) => p.to_owned(),
            None => self.ctx.default_data_path("frequency_sweep"),
        };
        self.outputs.save(&samples, &path, "Frequency Sweep Data")
    }
}

struct SweepWorker {
    run: SweepRun,
    generator: Arc<dyn SignalGenerator>,
    settle: Duration,
    samples: Arc<Mutex<Vec<SweepSample>>>,
    events: Sender<TaskEvent<SweepSample>>,
}

impl SweepWorker {
    fn run(self, stop: &AtomicBool) {
        // Declared first so it drops last, after the generator is shut down
        let mut finish = FinishGuard::new("Frequency sweep", self.events.clone());
        let _output = OutputGuard::new(self.generator.clone());
        let termination = self.run_steps(stop);
        finish.finish(termination);
    }

    fn run_steps(&self, stop: &AtomicBool) -> Termination {
        if let Err(e) = self.run.prepare() {
            let _ = self.events.send(TaskEvent::Error(e.to_string()));
            return Termination::Failed(e.to_string());
        }

        let total = self.run.ladder().len();
        info!(
            "Sweeping {total} steps of {} Hz",
            self.run.ladder().increment_hz()
        );
        let _ = self
            .events
            .send(TaskEvent::Status(format!("Sweeping {total} steps")));

        let clock = Stopwatch::start();
        for i in 0..total {
            if stop.load(Ordering::Relaxed) {
                return Termination::Stopped;
            }

            if let Err(e) = self.run.set_step(i) {
                let _ = self.events.send(TaskEvent::Error(e.to_string()));
                return Termination::Failed(e.to_string());
            }
            if !sleep_unless_stopped(self.settle, stop) {
                return Termination::Stopped;
            }

            let (sample, err) = self.run.measure(clock.elapsed_s(), clock.wall_timestamp());
            if let Some(e) = err {
                warn!("Sweep step {i} read failed, using estimated frequency: {e}");
                let _ = self.events.send(TaskEvent::Error(format!(
                    "Step {i}: {e}; frequency estimated"
                )));
            }
            match self.samples.lock() {
                Ok(mut s) => s.push(sample),
                Err(e) => e.into_inner().push(sample),
            }
            let _ = self.events.send(TaskEvent::Sample(sample));
            let _ = self.events.send(TaskEvent::Progress { done: i + 1, total });
        }

        Termination::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::mockup::{MockGenerator, MockLockIn, Resonator};

    fn bench() -> (Arc<MockLockIn>, Arc<MockGenerator>) {
        let sig = Arc::new(MockGenerator::new("USB0::1"));
        let lockin = Arc::new(MockLockIn::new(
            "GPIB0::8",
            Some(sig.clone()),
            Resonator::default(),
        ));
        (lockin, sig)
    }

    fn quick(start_hz: f64, stop_hz: f64) -> SweepConfig {
        SweepConfig {
            start_hz,
            stop_hz,
            sweep_time_s: 5.0,
            sample_interval: 1.0,
            settle_interval: 0.001,
            ..Default::default()
        }
    }

    fn sweeper(
        lockin: Arc<MockLockIn>,
        sig: Arc<MockGenerator>,
        config: SweepConfig,
    ) -> FrequencySweeper {
        let dir = std::env::temp_dir().join(format!("resotrack-sweep-{}", std::process::id()));
        let ctx = RunCtx::new(dir);
        FrequencySweeper::new(
            ctx,
            Some(lockin as Arc<dyn LockIn>),
            Some(sig as Arc<dyn SignalGenerator>),
            config,
        )
    }

    #[test]
    fn step_count_follows_sample_interval() {
        let config = SweepConfig {
            start_hz: 1000.0,
            stop_hz: 2000.0,
            ..Default::default()
        };
        assert_eq!(config.steps(), 50);
        assert_eq!(config.ladder().increment_hz(), 20.0);
        assert_eq!(config.expected_duration_s(), 25.0);

        let bad = [
            SweepConfig {
                start_hz: 2000.0,
                stop_hz: 1000.0,
                ..Default::default()
            },
            SweepConfig {
                sweep_time_s: 0.1,
                ..Default::default()
            },
            SweepConfig {
                stop_hz: f64::NAN,
                ..Default::default()
            },
        ];
        for c in bad {
            assert!(matches!(c.validate(), Err(Error::Config { .. })), "{c:?}");
        }
    }

    #[test]
    fn full_sweep() {
        let (lockin, sig) = bench();
        let mut sweep = sweeper(lockin, sig.clone(), quick(1000.0, 1500.0));
        let events = sweep.events();
        sweep.start().unwrap();
        sweep.join().unwrap();

        let samples = sweep.samples();
        assert_eq!(samples.len(), 5);
        assert_eq!(sig.history(), vec![1000.0, 1100.0, 1200.0, 1300.0, 1400.0]);
        assert_eq!(samples[2].frequency, 1200.0);

        let all: Vec<_> = events.try_iter().collect();
        let progress: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { done, total } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, [(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        assert_eq!(all.last(), Some(&TaskEvent::Finished(Termination::Completed)));

        // Shut down exactly once
        assert!(!sig.output_enabled());
        assert_eq!((sig.output_disables(), sig.resets()), (1, 1));

        let saved = sweep.save_sweep_data(None).unwrap();
        assert_eq!(saved.rows, 5);
    }

    #[test]
    fn read_failure_estimates_frequency() {
        let (lockin, sig) = bench();
        let config = quick(1000.0, 2000.0);
        let run = SweepRun::new(lockin.clone(), sig, config.clone());

        lockin.set_failing(true);
        let (sample, err) = run.measure(config.sweep_time_s / 2.0, 0.0);
        assert!(err.is_some());
        assert_eq!(sample.frequency, 1500.0);
        assert_eq!((sample.x, sample.y, sample.r, sample.theta), (0.0, 0.0, 0.0, 0.0));

        let log = SweepRun::new(
            lockin,
            Arc::new(MockGenerator::new("USB0::2")),
            SweepConfig {
                spacing: Spacing::Logarithmic,
                ..quick(100.0, 10_000.0)
            },
        );
        let (sample, _) = log.measure(config.sweep_time_s / 2.0, 0.0);
        assert!((sample.frequency - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn failed_steps_do_not_abort() {
        let (lockin, sig) = bench();
        lockin.set_failing(true);
        let mut sweep = sweeper(lockin, sig.clone(), quick(1000.0, 1500.0));
        let events = sweep.events();
        sweep.start().unwrap();
        sweep.join().unwrap();

        assert_eq!(sweep.samples().len(), 5);
        let errors = events
            .try_iter()
            .filter(|e| matches!(e, TaskEvent::Error(_)))
            .count();
        assert_eq!(errors, 5);
        assert_eq!(sig.resets(), 1);
    }

    #[test]
    fn stop_ends_sweep_early() {
        let (lockin, sig) = bench();
        let config = SweepConfig {
            settle_interval: 10.0,
            ..quick(1000.0, 1500.0)
        };
        let mut sweep = sweeper(lockin, sig.clone(), config);
        let events = sweep.events();
        sweep.start().unwrap();
        sweep.stop();
        sweep.join().unwrap();

        assert!(sweep.samples().len() < 5);
        assert_eq!(
            events.try_iter().last(),
            Some(TaskEvent::Finished(Termination::Stopped))
        );
        assert_eq!(sig.resets(), 1);
    }
}
