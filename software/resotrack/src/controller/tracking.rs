//! Closed-loop frequency tracking: hold the lock-in phase at a setpoint
//! by steering the generator frequency.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use resotrack_shared::{DeviceError, FrequencyLimits, LockIn, SignalGenerator};

use crate::calc::DigitalPid;
use crate::dispatcher::{OutputChain, SavedOutput};
use crate::error::{Error, Result};

use super::nonblocking::{FinishGuard, OutputGuard};
use super::timing::{Pacer, Stopwatch};
use super::{RunCtx, TaskCore, TaskEvent, TaskState, Termination};

/// Tracking loop settings, applied at the next start
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,

    /// Target phase in degrees
    pub setpoint: f64,

    /// Loop period in seconds, also the PID sample time
    pub sample_interval: f64,

    /// Stop on its own after this many seconds
    pub max_duration: Option<f64>,

    /// Frequency to start from. Read from the generator if absent.
    pub initial_frequency: Option<f64>,

    /// Bounds on the PID correction, in Hz per second
    pub output_limits: (Option<f64>, Option<f64>),

    /// Anti-windup bounds on the accumulated error
    pub integral_limits: (Option<f64>, Option<f64>),
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.1,
            kd: 0.01,
            setpoint: 0.0,
            sample_interval: 0.1,
            max_duration: None,
            initial_frequency: None,
            output_limits: (Some(-1000.0), Some(1000.0)),
            integral_limits: (Some(-5000.0), Some(5000.0)),
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.sample_interval > 0.0) {
            return Err(Error::config(format!(
                "sample interval must be positive, got {}",
                self.sample_interval
            )));
        }
        if let Some(f) = self.initial_frequency {
            if !f.is_finite() {
                return Err(Error::config("initial frequency must be finite"));
            }
        }
        Ok(())
    }

    pub fn build_pid(&self) -> DigitalPid {
        let mut pid = DigitalPid::new(self.kp, self.ki, self.kd, self.setpoint, self.sample_interval);
        pid.set_output_limits(self.output_limits.0, self.output_limits.1);
        pid.set_integral_limits(self.integral_limits.0, self.integral_limits.1);
        pid
    }
}

/// One tick of the tracking loop
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TrackingSample {
    /// Seconds since the run started
    #[serde(rename = "time")]
    pub elapsed_time: f64,

    /// Unix seconds
    #[serde(rename = "timestamp")]
    pub wall_timestamp: f64,

    /// Frequency commanded this tick, Hz
    pub frequency: f64,

    /// Measured phase, degrees
    pub phase: f64,

    pub setpoint: f64,
    pub error: f64,
    pub pid_output: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

/// The control law against a pair of instruments, without any threading.
pub struct TrackingLoop {
    lockin: Arc<dyn LockIn>,
    generator: Arc<dyn SignalGenerator>,
    pid: DigitalPid,
    sample_interval: f64,
    limits: FrequencyLimits,
    current_frequency: f64,
}

impl TrackingLoop {
    /// Reset the controller and seed the frequency, reading the generator
    /// if no initial frequency is given.
    pub fn new(
        lockin: Arc<dyn LockIn>,
        generator: Arc<dyn SignalGenerator>,
        mut pid: DigitalPid,
        sample_interval: f64,
        initial_frequency: Option<f64>,
    ) -> std::result::Result<Self, DeviceError> {
        pid.reset();
        let limits = generator.frequency_limits();
        let current_frequency = match initial_frequency {
            Some(f) => f,
            None => generator.get_frequency()?,
        };
        Ok(Self {
            lockin,
            generator,
            pid,
            sample_interval,
            limits,
            current_frequency,
        })
    }

    pub fn current_frequency(&self) -> f64 {
        self.current_frequency
    }

    pub fn pid(&self) -> &DigitalPid {
        &self.pid
    }

    /// Read the phase, correct the frequency, and command the generator.
    /// The commanded frequency never leaves the generator's range.
    pub fn step(
        &mut self,
        elapsed: f64,
        wall_timestamp: f64,
    ) -> std::result::Result<TrackingSample, DeviceError> {
        let phase = self.lockin.read_phase()?;
        if !phase.is_finite() {
            return Err(DeviceError::Malformed {
                address: self.lockin.address().to_owned(),
                response: format!("phase {phase}"),
            });
        }
        let correction = self.pid.compute(phase, elapsed);

        let frequency = self
            .limits
            .clamp(self.current_frequency + correction * self.sample_interval);
        self.generator.set_frequency(frequency)?;
        self.current_frequency = frequency;

        let terms = self.pid.terms(phase, elapsed);
        Ok(TrackingSample {
            elapsed_time: elapsed,
            wall_timestamp,
            frequency,
            phase,
            setpoint: terms.setpoint,
            error: terms.error,
            pid_output: correction,
            proportional: terms.proportional,
            integral: terms.integral,
            derivative: terms.derivative,
        })
    }
}

/// Background frequency tracking task.
pub struct FrequencyTracker {
    ctx: RunCtx,
    lockin: Option<Arc<dyn LockIn>>,
    generator: Option<Arc<dyn SignalGenerator>>,
    config: TrackingConfig,
    samples: Arc<Mutex<Vec<TrackingSample>>>,
    outputs: OutputChain,
    core: TaskCore<TrackingSample>,
}

impl FrequencyTracker {
    pub fn new(
        ctx: RunCtx,
        lockin: Option<Arc<dyn LockIn>>,
        generator: Option<Arc<dyn SignalGenerator>>,
        config: TrackingConfig,
    ) -> Self {
        Self {
            ctx,
            lockin,
            generator,
            config,
            samples: Arc::new(Mutex::new(Vec::new())),
            outputs: OutputChain::default(),
            core: TaskCore::new("frequency-tracker"),
        }
    }

    pub fn with_outputs(mut self, outputs: OutputChain) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Takes effect at the next start
    pub fn set_pid_params(&mut self, kp: f64, ki: f64, kd: f64, setpoint: f64) {
        self.config.kp = kp;
        self.config.ki = ki;
        self.config.kd = kd;
        self.config.setpoint = setpoint;
    }

    /// Takes effect at the next start
    pub fn set_tracking_params(&mut self, sample_interval: f64, max_duration: Option<f64>) {
        self.config.sample_interval = sample_interval;
        self.config.max_duration = max_duration;
    }

    pub fn set_initial_frequency(&mut self, hz: Option<f64>) {
        self.config.initial_frequency = hz;
    }

    pub fn events(&self) -> crossbeam::channel::Receiver<TaskEvent<TrackingSample>> {
        self.core.events()
    }

    /// Copy of the samples of the current or last run
    pub fn samples(&self) -> Vec<TrackingSample> {
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

    /// Start tracking on a background thread.
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

        match self.samples.lock() {
            Ok(mut s) => s.clear(),
            Err(e) => e.into_inner().clear(),
        }

        let worker = TrackingWorker {
            lockin,
            generator,
            config: self.config.clone(),
            samples: self.samples.clone(),
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

    /// Save the collected samples, by default to
    /// `history_data/frequency_tracking_<stamp>.dat`.
    pub fn save_tracking_data(&self, path: Option<&Path>) -> Result<SavedOutput> {
        let samples = self.samples();
        let path = match path {
            Some(p) => p.to_owned(),
            None => self.ctx.default_data_path("frequency_tracking"),
        };
        self.outputs.save(&samples, &path, "Frequency Tracking Data")
    }
}

struct TrackingWorker {
    lockin: Arc<dyn LockIn>,
    generator: Arc<dyn SignalGenerator>,
    config: TrackingConfig,
    samples: Arc<Mutex<Vec<TrackingSample>>>,
    events: crossbeam::channel::Sender<TaskEvent<TrackingSample>>,
}

impl TrackingWorker {
    fn run(self, stop: &AtomicBool) {
        // Declared first so it drops last, after the generator is shut down
        let mut finish = FinishGuard::new("Frequency tracking", self.events.clone());
        let _output = OutputGuard::new(self.generator.clone());
        let termination = self.run_loop(stop);
        finish.finish(termination);
    }

    fn run_loop(&self, stop: &AtomicBool) -> Termination {
        let _ = self
            .events
            .send(TaskEvent::Status("Initializing frequency tracking".into()));

        let mut tracking = match TrackingLoop::new(
            self.lockin.clone(),
            self.generator.clone(),
            self.config.build_pid(),
            self.config.sample_interval,
            self.config.initial_frequency,
        ) {
            Ok(t) => t,
            Err(e) => {
                let _ = self.events.send(TaskEvent::Error(e.to_string()));
                return Termination::Failed(e.to_string());
            }
        };
        info!(
            "Digital PID frequency tracking started at {} Hz",
            tracking.current_frequency()
        );
        let _ = self.events.send(TaskEvent::Status(
            "Digital PID frequency tracking started".into(),
        ));

        let clock = Stopwatch::start();
        let mut pacer = Pacer::new(self.config.sample_interval);
        loop {
            if stop.load(Ordering::Relaxed) {
                return Termination::Stopped;
            }
            pacer.begin();
            let elapsed = clock.elapsed_s();
            if self.config.max_duration.is_some_and(|max| elapsed >= max) {
                return Termination::Completed;
            }

            match tracking.step(elapsed, clock.wall_timestamp()) {
                Ok(sample) => {
                    match self.samples.lock() {
                        Ok(mut s) => s.push(sample),
                        Err(e) => e.into_inner().push(sample),
                    }
                    let _ = self.events.send(TaskEvent::Sample(sample));
                }
                Err(e) => {
                    error!("Frequency tracking error: {e}");
                    let _ = self
                        .events
                        .send(TaskEvent::Error(format!("Frequency tracking error: {e}")));
                    return Termination::Failed(e.to_string());
                }
            }

            pacer.wait(stop);
        }
    }
}
