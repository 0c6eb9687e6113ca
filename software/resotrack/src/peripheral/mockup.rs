//! Simulated instruments for tests and dry runs without hardware.
//!
//! The lock-in reads its reference from a simulated generator and reports the
//! response of a single resonance, so closed-loop tasks behave as they would on a bench.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use resotrack_shared::peripherals::lockin::validate_snap;
use resotrack_shared::{
    DeviceError, EnvironmentController, EnvironmentReading, FrequencyLimits, InstrumentKind, Load,
    LockIn, SignalGenerator, SnapParam, WF1947_FREQUENCY_LIMITS, Waveform,
};

use super::{Connector, Instrument};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Driven damped resonance seen through a lock-in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resonator {
    pub center_hz: f64,

    /// Half width at which the phase reaches 45 degrees
    pub linewidth_hz: f64,

    /// Response magnitude on resonance, in volts
    pub amplitude: f64,
}

impl Default for Resonator {
    fn default() -> Self {
        Self {
            center_hz: 32_768.0,
            linewidth_hz: 2.0,
            amplitude: 1e-3,
        }
    }
}

impl Resonator {
    /// Phase lag in degrees: negative below resonance, zero on it, positive above
    pub fn phase_deg(&self, hz: f64) -> f64 {
        ((hz - self.center_hz) / self.linewidth_hz).atan().to_degrees()
    }

    pub fn magnitude(&self, hz: f64) -> f64 {
        let detuning = (hz - self.center_hz) / self.linewidth_hz;
        self.amplitude / (1.0 + detuning * detuning).sqrt()
    }
}

/// Simulated function generator that records what was asked of it.
pub struct MockGenerator {
    address: String,
    limits: FrequencyLimits,
    frequency: Mutex<f64>,
    history: Mutex<Vec<f64>>,
    output: AtomicBool,
    output_disables: AtomicUsize,
    resets: AtomicUsize,
    waveform: Mutex<Waveform>,
    amplitude: Mutex<f64>,
    offset: Mutex<f64>,
    load: Mutex<Load>,
    fail: AtomicBool,
}

impl MockGenerator {
    /// Frequency after power-on or reset
    pub const POWER_ON_HZ: f64 = 1000.0;

    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            limits: WF1947_FREQUENCY_LIMITS,
            frequency: Mutex::new(Self::POWER_ON_HZ),
            history: Mutex::new(Vec::new()),
            output: AtomicBool::new(false),
            output_disables: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            waveform: Mutex::new(Waveform::Sine),
            amplitude: Mutex::new(0.1),
            offset: Mutex::new(0.0),
            load: Mutex::new(Load::HighZ),
            fail: AtomicBool::new(false),
        }
    }

    pub fn with_limits(mut self, limits: FrequencyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn frequency(&self) -> f64 {
        *lock(&self.frequency)
    }

    /// Every frequency that was successfully set, in order
    pub fn history(&self) -> Vec<f64> {
        lock(&self.history).clone()
    }

    pub fn output_enabled(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    /// Number of times the output was switched off
    pub fn output_disables(&self) -> usize {
        self.output_disables.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Make every frequency request fail with a timeout
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Timeout {
                address: self.address.clone(),
            });
        }
        Ok(())
    }
}

impl SignalGenerator for MockGenerator {
    fn address(&self) -> &str {
        &self.address
    }

    fn frequency_limits(&self) -> FrequencyLimits {
        self.limits
    }

    fn get_frequency(&self) -> Result<f64, DeviceError> {
        self.check()?;
        Ok(self.frequency())
    }

    fn set_frequency(&self, hz: f64) -> Result<(), DeviceError> {
        self.check()?;
        if !self.limits.contains(hz) {
            return Err(DeviceError::InvalidRequest {
                address: self.address.clone(),
                msg: format!("frequency {hz} Hz out of range"),
            });
        }
        *lock(&self.frequency) = hz;
        lock(&self.history).push(hz);
        Ok(())
    }

    fn set_output(&self, on: bool) -> Result<(), DeviceError> {
        self.output.store(on, Ordering::SeqCst);
        if !on {
            self.output_disables.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reset(&self) -> Result<(), DeviceError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.output.store(false, Ordering::SeqCst);
        *lock(&self.frequency) = Self::POWER_ON_HZ;
        *lock(&self.waveform) = Waveform::Sine;
        Ok(())
    }

    fn get_waveform(&self) -> Result<Waveform, DeviceError> {
        Ok(*lock(&self.waveform))
    }

    fn set_waveform(&self, waveform: Waveform) -> Result<(), DeviceError> {
        *lock(&self.waveform) = waveform;
        Ok(())
    }

    fn get_amplitude(&self) -> Result<f64, DeviceError> {
        Ok(*lock(&self.amplitude))
    }

    fn set_amplitude(&self, vpp: f64) -> Result<(), DeviceError> {
        *lock(&self.amplitude) = vpp;
        Ok(())
    }

    fn get_offset(&self) -> Result<f64, DeviceError> {
        Ok(*lock(&self.offset))
    }

    fn set_offset(&self, volts: f64) -> Result<(), DeviceError> {
        *lock(&self.offset) = volts;
        Ok(())
    }

    fn get_load(&self) -> Result<Load, DeviceError> {
        Ok(*lock(&self.load))
    }

    fn set_load(&self, load: Load) -> Result<(), DeviceError> {
        *lock(&self.load) = load;
        Ok(())
    }
}

/// Simulated lock-in referenced to a [`MockGenerator`].
///
/// Without a generator it reports the on-resonance response.
pub struct MockLockIn {
    address: String,
    generator: Option<Arc<MockGenerator>>,
    resonator: Resonator,
    fixed_phase: Mutex<Option<f64>>,
    reads: AtomicUsize,
    fail: AtomicBool,
}

impl MockLockIn {
    pub fn new(address: &str, generator: Option<Arc<MockGenerator>>, resonator: Resonator) -> Self {
        Self {
            address: address.to_owned(),
            generator,
            resonator,
            fixed_phase: Mutex::new(None),
            reads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Report this phase regardless of the reference frequency
    pub fn set_fixed_phase(&self, phase: Option<f64>) {
        *lock(&self.fixed_phase) = phase;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of requests served, failed or not
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn reference_hz(&self) -> f64 {
        self.generator
            .as_ref()
            .map(|g| g.frequency())
            .unwrap_or(self.resonator.center_hz)
    }

    fn begin_read(&self) -> Result<(), DeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Timeout {
                address: self.address.clone(),
            });
        }
        Ok(())
    }

    fn theta(&self, hz: f64) -> f64 {
        (*lock(&self.fixed_phase)).unwrap_or_else(|| self.resonator.phase_deg(hz))
    }
}

impl LockIn for MockLockIn {
    fn address(&self) -> &str {
        &self.address
    }

    fn read_phase(&self) -> Result<f64, DeviceError> {
        self.begin_read()?;
        Ok(self.theta(self.reference_hz()))
    }

    fn snapshot(&self, params: &[SnapParam]) -> Result<Vec<f64>, DeviceError> {
        validate_snap(&self.address, params)?;
        self.begin_read()?;

        let hz = self.reference_hz();
        let r = self.resonator.magnitude(hz);
        let theta = self.theta(hz);
        let (x, y) = (r * theta.to_radians().cos(), r * theta.to_radians().sin());
        Ok(params
            .iter()
            .map(|p| match p {
                SnapParam::X | SnapParam::Ch1Display => x,
                SnapParam::Y | SnapParam::Ch2Display => y,
                SnapParam::R => r,
                SnapParam::Theta => theta,
                SnapParam::Frequency => hz,
                SnapParam::AuxIn1 | SnapParam::AuxIn2 | SnapParam::AuxIn3 | SnapParam::AuxIn4 => {
                    0.0
                }
            })
            .collect())
    }

    fn reference_source(&self) -> Result<String, DeviceError> {
        self.begin_read()?;
        Ok("External".to_owned())
    }
}

/// Simulated cryostat reporting a fixed temperature and field.
pub struct MockEnvironment {
    address: String,
    temperature: Mutex<f64>,
    field: Mutex<f64>,
    reads: AtomicUsize,
    fail: AtomicBool,
}

impl MockEnvironment {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            temperature: Mutex::new(300.0),
            field: Mutex::new(0.0),
            reads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, temperature: f64, field: f64) {
        *lock(&self.temperature) = temperature;
        *lock(&self.field) = field;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of requests served, failed or not
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl EnvironmentController for MockEnvironment {
    fn address(&self) -> &str {
        &self.address
    }

    fn get_temperature_and_field(&self) -> Result<EnvironmentReading, DeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Connection {
                address: self.address.clone(),
                msg: "MultiVu server not responding".into(),
            });
        }
        Ok(EnvironmentReading {
            temperature: *lock(&self.temperature),
            temperature_status: "Stable".into(),
            field: *lock(&self.field),
            field_status: "Holding (Driven)".into(),
        })
    }
}

#[derive(Default)]
struct Bench {
    resonator: Resonator,
    unreachable: Mutex<BTreeSet<String>>,
    generators: Mutex<BTreeMap<String, Arc<MockGenerator>>>,
    last_generator: Mutex<Option<Arc<MockGenerator>>>,
    lockins: Mutex<BTreeMap<String, Arc<MockLockIn>>>,
    environments: Mutex<BTreeMap<String, Arc<MockEnvironment>>>,
}

/// Connector that builds simulated instruments on demand.
///
/// Lock-ins are referenced to the most recently connected generator.
/// Clones share the same bench, so a test can keep one to inspect the instruments
/// after handing another to a registry.
#[derive(Clone, Default)]
pub struct MockConnector {
    bench: Arc<Bench>,
}

impl MockConnector {
    pub fn new(resonator: Resonator) -> Self {
        Self {
            bench: Arc::new(Bench {
                resonator,
                ..Default::default()
            }),
        }
    }

    /// Make connections to `address` fail
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = lock(&self.bench.unreachable);
        if unreachable {
            set.insert(address.to_owned());
        } else {
            set.remove(address);
        }
    }

    pub fn generator(&self, address: &str) -> Option<Arc<MockGenerator>> {
        lock(&self.bench.generators).get(address).cloned()
    }

    pub fn lockin(&self, address: &str) -> Option<Arc<MockLockIn>> {
        lock(&self.bench.lockins).get(address).cloned()
    }

    pub fn environment(&self, address: &str) -> Option<Arc<MockEnvironment>> {
        lock(&self.bench.environments).get(address).cloned()
    }
}

impl Connector for MockConnector {
    fn connect(&self, kind: InstrumentKind, address: &str) -> Result<Instrument, DeviceError> {
        if lock(&self.bench.unreachable).contains(address) {
            return Err(DeviceError::Connection {
                address: address.to_owned(),
                msg: "no route to instrument".into(),
            });
        }

        let instrument = match kind {
            InstrumentKind::Wf1947 => {
                let sig = Arc::new(MockGenerator::new(address));
                lock(&self.bench.generators).insert(address.to_owned(), sig.clone());
                *lock(&self.bench.last_generator) = Some(sig.clone());
                Instrument::Generator(sig)
            }
            InstrumentKind::Sr830 => {
                let reference = lock(&self.bench.last_generator).clone();
                let lockin = Arc::new(MockLockIn::new(address, reference, self.bench.resonator));
                lock(&self.bench.lockins).insert(address.to_owned(), lockin.clone());
                Instrument::LockIn(lockin)
            }
            InstrumentKind::Ppms => {
                let env = Arc::new(MockEnvironment::new(address));
                lock(&self.bench.environments).insert(address.to_owned(), env.clone());
                Instrument::Environment(env)
            }
        };
        Ok(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockin_follows_generator() {
        let res = Resonator::default();
        let sig = Arc::new(MockGenerator::new("sig"));
        let lockin = MockLockIn::new("li", Some(sig.clone()), res);

        sig.set_frequency(res.center_hz).unwrap();
        assert!(lockin.read_phase().unwrap().abs() < 1e-12);

        sig.set_frequency(res.center_hz - res.linewidth_hz).unwrap();
        assert!((lockin.read_phase().unwrap() + 45.0).abs() < 1e-9);

        let snap = lockin
            .snapshot(&[SnapParam::R, SnapParam::Frequency])
            .unwrap();
        assert!(snap[0] < res.amplitude);
        assert_eq!(snap[1], res.center_hz - res.linewidth_hz);
    }

    #[test]
    fn generator_rejects_out_of_range() {
        let sig = MockGenerator::new("sig");
        assert!(sig.set_frequency(1e9).is_err());
        assert_eq!(sig.frequency(), MockGenerator::POWER_ON_HZ);

        sig.set_output(true).unwrap();
        sig.set_output(false).unwrap();
        sig.reset().unwrap();
        assert_eq!((sig.output_disables(), sig.resets()), (1, 1));
    }
}
