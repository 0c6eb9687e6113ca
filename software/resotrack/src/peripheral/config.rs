//! Persistent list of configured instruments.
//!
//! Stored as a JSON object keyed by instrument class, for example
//! `{"SR830": ["GPIB0::8::INSTR"], "WF1947": [], "PPMS": ["127.0.0.1"]}`.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use resotrack_shared::{Address, InstrumentKind};

use crate::error::{Error, Result};

/// Addresses to connect on startup, grouped by instrument class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct InstrumentConfig {
    instruments: BTreeMap<InstrumentKind, Vec<Address>>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            instruments: InstrumentKind::ALL.iter().map(|k| (*k, Vec::new())).collect(),
        }
    }
}

impl InstrumentConfig {
    /// Parse a config document. Unrecognized classes are skipped with a warning.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<Address>> = serde_json::from_str(text)?;
        let mut config = Self::default();
        for (class, addresses) in raw {
            match class.parse::<InstrumentKind>() {
                Ok(kind) => {
                    let entry = config.instruments.entry(kind).or_default();
                    for address in addresses {
                        if !entry.contains(&address) {
                            entry.push(address);
                        }
                    }
                }
                Err(msg) => warn!("Skipping config entry: {msg}"),
            }
        }
        Ok(config)
    }

    /// Read the config file, or write an empty one if none exists yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!("Created instrument config at {path:?}");
            return Ok(config);
        }
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| Error::persistence(path, e))
    }

    /// Add an address under `kind`. Returns false if it was already listed.
    pub fn add(&mut self, kind: InstrumentKind, address: &str) -> bool {
        let entry = self.instruments.entry(kind).or_default();
        if entry.iter().any(|a| a == address) {
            return false;
        }
        entry.push(address.to_owned());
        true
    }

    /// Remove an address from whichever class lists it.
    pub fn remove(&mut self, address: &str) -> bool {
        let mut removed = false;
        for addresses in self.instruments.values_mut() {
            let before = addresses.len();
            addresses.retain(|a| a != address);
            removed |= addresses.len() != before;
        }
        removed
    }

    pub fn addresses(&self, kind: InstrumentKind) -> &[Address] {
        self.instruments.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every configured instrument, in class order then insertion order
    pub fn iter(&self) -> impl Iterator<Item = (InstrumentKind, &str)> + '_ {
        self.instruments
            .iter()
            .flat_map(|(kind, addrs)| addrs.iter().map(move |a| (*kind, a.as_str())))
    }
}
