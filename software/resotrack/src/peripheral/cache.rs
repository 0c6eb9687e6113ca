//! Read-rate cap for instruments that are slow or expensive to query.

use std::collections::BTreeMap;

/// Last successful reading from one instrument
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRead<T> {
    pub value: T,

    /// Time of the read, in the caller's clock (seconds)
    pub read_at: f64,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<T, E> {
    /// Fresh reading if one was taken, otherwise the cached one, if any
    pub value: Option<T>,

    /// Whether a request was issued to the instrument and succeeded
    pub fresh: bool,

    /// Error from the request, if one was issued and failed
    pub error: Option<E>,
}

/// Per-address cache that only lets a new read through once
/// `min_interval` seconds have passed since the last successful one.
///
/// A failed read leaves the previous entry and its timestamp in place,
/// so the next lookup is allowed to try again.
#[derive(Debug, Clone)]
pub struct ReadCache<T> {
    min_interval: f64,
    entries: BTreeMap<String, CachedRead<T>>,
}

impl<T: Clone> ReadCache<T> {
    pub fn new(min_interval: f64) -> Self {
        Self {
            min_interval,
            entries: BTreeMap::new(),
        }
    }

    pub fn min_interval(&self) -> f64 {
        self.min_interval
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, address: &str) -> Option<&CachedRead<T>> {
        self.entries.get(address)
    }

    /// Whether a new read of `address` is allowed at `now`
    pub fn is_due(&self, address: &str, now: f64) -> bool {
        match self.entries.get(address) {
            Some(entry) => now - entry.read_at >= self.min_interval,
            None => true,
        }
    }

    /// Take a new reading with `read` if one is due, otherwise reuse the cached one.
    pub fn read_with<E>(
        &mut self,
        address: &str,
        now: f64,
        read: impl FnOnce() -> Result<T, E>,
    ) -> CacheLookup<T, E> {
        if self.is_due(address, now) {
            match read() {
                Ok(value) => {
                    self.entries.insert(
                        address.to_owned(),
                        CachedRead {
                            value: value.clone(),
                            read_at: now,
                        },
                    );
                    return CacheLookup {
                        value: Some(value),
                        fresh: true,
                        error: None,
                    };
                }
                Err(error) => {
                    return CacheLookup {
                        value: self.entries.get(address).map(|e| e.value.clone()),
                        fresh: false,
                        error: Some(error),
                    };
                }
            }
        }

        CacheLookup {
            value: self.entries.get(address).map(|e| e.value.clone()),
            fresh: false,
            error: None,
        }
    }
}
