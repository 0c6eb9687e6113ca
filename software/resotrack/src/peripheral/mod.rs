//! Instrument registry: connection, lookup, and lifecycle of every configured instrument.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use resotrack_shared::{
    Address, DeviceError, EnvironmentController, InstrumentKind, LockIn, SignalGenerator,
};

use crate::error::{Error, Result};

mod cache;
mod config;
mod lock;
pub mod mockup;

pub use cache::{CacheLookup, CachedRead, ReadCache};
pub use config::InstrumentConfig;
pub use lock::{GateGuard, LockedEnvironment, ReentrantGate};

/// A connected instrument, by capability
#[derive(Clone)]
pub enum Instrument {
    LockIn(Arc<dyn LockIn>),
    Generator(Arc<dyn SignalGenerator>),
    Environment(Arc<dyn EnvironmentController>),
}

impl Instrument {
    pub fn kind(&self) -> InstrumentKind {
        match self {
            Self::LockIn(_) => InstrumentKind::Sr830,
            Self::Generator(_) => InstrumentKind::Wf1947,
            Self::Environment(_) => InstrumentKind::Ppms,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::LockIn(x) => x.address(),
            Self::Generator(x) => x.address(),
            Self::Environment(x) => x.address(),
        }
    }

    pub fn close(&self) -> std::result::Result<(), DeviceError> {
        match self {
            Self::LockIn(x) => x.close(),
            Self::Generator(x) => x.close(),
            Self::Environment(x) => x.close(),
        }
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.address())
    }
}

/// Opens a connection to an instrument.
///
/// Implemented by the driver layer; tests use [`mockup::MockConnector`].
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        kind: InstrumentKind,
        address: &str,
    ) -> std::result::Result<Instrument, DeviceError>;
}

impl<F> Connector for F
where
    F: Fn(InstrumentKind, &str) -> std::result::Result<Instrument, DeviceError> + Send + Sync,
{
    fn connect(
        &self,
        kind: InstrumentKind,
        address: &str,
    ) -> std::result::Result<Instrument, DeviceError> {
        self(kind, address)
    }
}

/// How connection attempts are repeated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,

    /// Wait after the transport refused or dropped the connection
    pub connection_backoff: Duration,

    /// Wait after the instrument did not answer
    pub timeout_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connection_backoff: Duration::from_secs(1),
            timeout_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt, or None if retrying is pointless
    fn backoff(&self, err: &DeviceError) -> Option<Duration> {
        match err {
            DeviceError::InvalidRequest { .. } => None,
            DeviceError::Timeout { .. } => Some(self.timeout_backoff),
            DeviceError::Connection { .. } | DeviceError::Malformed { .. } => {
                Some(self.connection_backoff)
            }
        }
    }
}

/// Owns every connected instrument and keeps the config file in step with it.
///
/// Handles are shared with tasks as `Arc`s, so a task keeps its instruments alive
/// even if they are removed from the registry mid-run.
pub struct InstrumentRegistry {
    connector: Box<dyn Connector>,
    retry: RetryPolicy,
    instruments: BTreeMap<Address, Instrument>,
    config: InstrumentConfig,
    config_path: Option<PathBuf>,
}

impl InstrumentRegistry {
    /// An empty registry that does not persist its configuration
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            retry: RetryPolicy::default(),
            instruments: BTreeMap::new(),
            config: InstrumentConfig::default(),
            config_path: None,
        }
    }

    /// Load the config file at `path` (creating it if needed) and connect every
    /// instrument it lists. Returns the registry and the connection status per address;
    /// instruments that fail to connect stay in the config file.
    pub fn open(
        connector: impl Connector + 'static,
        path: &Path,
        retry: RetryPolicy,
    ) -> Result<(Self, BTreeMap<Address, bool>)> {
        let config = InstrumentConfig::load_or_create(path)?;
        let mut registry = Self::new(connector).with_retry(retry);
        registry.config_path = Some(path.to_owned());

        let mut status = BTreeMap::new();
        for (kind, address) in config.iter() {
            let ok = match registry.connect_with_retry(kind, address) {
                Ok(instrument) => {
                    registry.insert(instrument);
                    true
                }
                Err(e) => {
                    warn!("Could not connect configured {kind} at {address}: {e}");
                    false
                }
            };
            status.insert(address.to_owned(), ok);
        }
        registry.config = config;

        Ok((registry, status))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Connect an instrument and record it in the config file.
    /// Adding an address that is already connected does nothing.
    pub fn add_instrument(&mut self, kind: InstrumentKind, address: &str) -> Result<()> {
        if let Some(existing) = self.instruments.get(address) {
            if existing.kind() != kind {
                return Err(Error::WrongKind {
                    address: address.to_owned(),
                    expected: kind,
                    actual: existing.kind(),
                });
            }
            info!("{kind} at {address} is already connected");
            return Ok(());
        }

        let instrument = self.connect_with_retry(kind, address)?;
        self.insert(instrument);
        if self.config.add(kind, address) {
            self.save_config()?;
        }
        info!("Added {kind} at {address}");
        Ok(())
    }

    /// Parse the class name and add the instrument
    pub fn add_instrument_by_name(&mut self, class: &str, address: &str) -> Result<()> {
        let kind = class
            .parse::<InstrumentKind>()
            .map_err(|_| Error::UnknownInstrument(class.to_owned()))?;
        self.add_instrument(kind, address)
    }

    /// Close and forget an instrument. Returns false if it was not registered.
    pub fn remove_instrument(&mut self, address: &str) -> Result<bool> {
        let Some(instrument) = self.instruments.remove(address) else {
            return Ok(false);
        };
        if let Err(e) = instrument.close() {
            warn!("Error closing {instrument:?}: {e}");
        }
        if self.config.remove(address) {
            self.save_config()?;
        }
        info!("Removed {instrument:?}");
        Ok(true)
    }

    /// Close every connection. The config file is left untouched.
    /// Returns false if any instrument failed to close cleanly.
    pub fn close_all(&mut self) -> bool {
        let mut clean = true;
        for (address, instrument) in std::mem::take(&mut self.instruments) {
            if let Err(e) = instrument.close() {
                error!("Error closing {address}: {e}");
                clean = false;
            }
        }
        clean
    }

    pub fn get(&self, address: &str) -> Option<&Instrument> {
        self.instruments.get(address)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Connected addresses of one class
    pub fn addresses(&self, kind: InstrumentKind) -> Vec<Address> {
        self.instruments
            .values()
            .filter(|i| i.kind() == kind)
            .map(|i| i.address().to_owned())
            .collect()
    }

    pub fn lockin(&self, address: &str) -> Result<Arc<dyn LockIn>> {
        match self.lookup(address)? {
            Instrument::LockIn(x) => Ok(x.clone()),
            other => Err(wrong_kind(address, InstrumentKind::Sr830, other)),
        }
    }

    pub fn generator(&self, address: &str) -> Result<Arc<dyn SignalGenerator>> {
        match self.lookup(address)? {
            Instrument::Generator(x) => Ok(x.clone()),
            other => Err(wrong_kind(address, InstrumentKind::Wf1947, other)),
        }
    }

    pub fn environment(&self, address: &str) -> Result<Arc<dyn EnvironmentController>> {
        match self.lookup(address)? {
            Instrument::Environment(x) => Ok(x.clone()),
            other => Err(wrong_kind(address, InstrumentKind::Ppms, other)),
        }
    }

    pub fn lockins(&self) -> Vec<Arc<dyn LockIn>> {
        self.instruments
            .values()
            .filter_map(|i| match i {
                Instrument::LockIn(x) => Some(x.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn generators(&self) -> Vec<Arc<dyn SignalGenerator>> {
        self.instruments
            .values()
            .filter_map(|i| match i {
                Instrument::Generator(x) => Some(x.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn environments(&self) -> Vec<Arc<dyn EnvironmentController>> {
        self.instruments
            .values()
            .filter_map(|i| match i {
                Instrument::Environment(x) => Some(x.clone()),
                _ => None,
            })
            .collect()
    }

    fn lookup(&self, address: &str) -> Result<&Instrument> {
        self.instruments.get(address).ok_or_else(|| Error::NotFound {
            address: address.to_owned(),
        })
    }

    fn insert(&mut self, instrument: Instrument) {
        // Environment controllers are shared between tasks; serialize their requests
        let instrument = match instrument {
            Instrument::Environment(x) => {
                Instrument::Environment(Arc::new(LockedEnvironment::new(x)))
            }
            other => other,
        };
        self.instruments
            .insert(instrument.address().to_owned(), instrument);
    }

    fn connect_with_retry(&self, kind: InstrumentKind, address: &str) -> Result<Instrument> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(kind, address) {
                Ok(instrument) if instrument.kind() == kind => return Ok(instrument),
                Ok(instrument) => {
                    return Err(Error::WrongKind {
                        address: address.to_owned(),
                        expected: kind,
                        actual: instrument.kind(),
                    });
                }
                Err(e) => {
                    let backoff = self.retry.backoff(&e);
                    match backoff {
                        Some(wait) if attempt < attempts => {
                            warn!(
                                "Connecting {kind} at {address} failed (attempt {attempt}/{attempts}): {e}"
                            );
                            thread::sleep(wait);
                        }
                        _ => {
                            error!("Giving up on {kind} at {address} after {attempt} attempt(s): {e}");
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    fn save_config(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => self.config.save(path),
            None => Ok(()),
        }
    }
}

impl Drop for InstrumentRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn wrong_kind(address: &str, expected: InstrumentKind, actual: &Instrument) -> Error {
    Error::WrongKind {
        address: address.to_owned(),
        expected,
        actual: actual.kind(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::mockup::{MockConnector, MockGenerator};
    use super::*;

    type Connect = std::result::Result<Instrument, DeviceError>;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            connection_backoff: Duration::from_millis(1),
            timeout_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn add_lookup_remove() {
        let mut reg = InstrumentRegistry::new(MockConnector::default());
        reg.add_instrument(InstrumentKind::Sr830, "GPIB0::8::INSTR").unwrap();
        reg.add_instrument_by_name("WF1947", "USB0::1").unwrap();
        reg.add_instrument(InstrumentKind::Ppms, "127.0.0.1").unwrap();

        // Idempotent
        reg.add_instrument(InstrumentKind::Sr830, "GPIB0::8::INSTR").unwrap();
        assert_eq!(reg.len(), 3);

        assert!(reg.lockin("GPIB0::8::INSTR").is_ok());
        assert!(reg.generator("USB0::1").is_ok());
        assert_eq!(reg.environments().len(), 1);
        assert!(matches!(
            reg.generator("GPIB0::8::INSTR"),
            Err(Error::WrongKind { .. })
        ));
        assert!(matches!(reg.lockin("nope"), Err(Error::NotFound { .. })));
        assert!(matches!(
            reg.add_instrument_by_name("SR850", "x"),
            Err(Error::UnknownInstrument(_))
        ));

        assert!(reg.remove_instrument("USB0::1").unwrap());
        assert!(!reg.remove_instrument("USB0::1").unwrap());
        assert!(reg.generators().is_empty());
        assert!(reg.config().addresses(InstrumentKind::Wf1947).is_empty());
    }

    #[test]
    fn invalid_requests_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let connector = move |_kind: InstrumentKind, address: &str| -> Connect {
            c.fetch_add(1, Ordering::SeqCst);
            Err(DeviceError::InvalidRequest {
                address: address.to_owned(),
                msg: "permission denied".into(),
            })
        };
        let mut reg = InstrumentRegistry::new(connector).with_retry(fast_retry());
        assert!(reg.add_instrument(InstrumentKind::Sr830, "GPIB0::8").is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let connector = move |_kind: InstrumentKind, address: &str| -> Connect {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DeviceError::Timeout {
                    address: address.to_owned(),
                })
            } else {
                Ok(Instrument::Generator(Arc::new(MockGenerator::new(address))))
            }
        };
        let mut reg = InstrumentRegistry::new(connector).with_retry(fast_retry());
        reg.add_instrument(InstrumentKind::Wf1947, "USB0::1").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Out of attempts
        let connector = |_kind: InstrumentKind, address: &str| -> Connect {
            Err(DeviceError::Connection {
                address: address.to_owned(),
                msg: "refused".into(),
            })
        };
        let mut reg = InstrumentRegistry::new(connector).with_retry(fast_retry());
        assert!(matches!(
            reg.add_instrument(InstrumentKind::Wf1947, "USB0::1"),
            Err(Error::Device(DeviceError::Connection { .. }))
        ));
    }

    #[test]
    fn config_follows_registry() {
        let dir = std::env::temp_dir().join(format!("resotrack-registry-{}", std::process::id()));
        let path = dir.join("instruments_config.json");
        let _ = std::fs::remove_dir_all(&dir);

        {
            let (mut reg, status) =
                InstrumentRegistry::open(MockConnector::default(), &path, fast_retry()).unwrap();
            assert!(status.is_empty());
            reg.add_instrument(InstrumentKind::Sr830, "GPIB0::8::INSTR").unwrap();
            reg.add_instrument(InstrumentKind::Ppms, "127.0.0.1").unwrap();
        }

        let connector = MockConnector::default();
        connector.set_unreachable("127.0.0.1", true);
        let (reg, status) = InstrumentRegistry::open(connector, &path, fast_retry()).unwrap();
        assert_eq!(status.get("GPIB0::8::INSTR"), Some(&true));
        assert_eq!(status.get("127.0.0.1"), Some(&false));
        assert_eq!(reg.len(), 1);

        // Failed connections stay configured
        assert_eq!(reg.config().addresses(InstrumentKind::Ppms), ["127.0.0.1"]);

        drop(reg);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
