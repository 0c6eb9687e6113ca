//! Serialized access to instruments whose transport cannot interleave requests.
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use resotrack_shared::{DeviceError, EnvironmentController, EnvironmentReading};

/// Current holder of the gate and how many times it has entered.
#[derive(Debug, Default)]
struct Holder {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Re-entrant mutual exclusion built on the usual predicate/condvar pair.
///
/// The thread that holds the gate may enter again without blocking;
/// other threads wait until every entry has been released.
#[derive(Debug, Default)]
pub struct ReentrantGate {
    state: Mutex<Holder>,
    cvar: Condvar,
}

impl ReentrantGate {
    pub fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(holder) = state.thread {
            if holder == me {
                break;
            }
            state = self.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.thread = Some(me);
        state.depth += 1;
        GateGuard { gate: self }
    }

    fn leave(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.thread = None;
            self.cvar.notify_one();
        }
    }
}

/// Releases one entry of the gate when dropped, including during unwinding.
pub struct GateGuard<'a> {
    gate: &'a ReentrantGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// Environment controller wrapper that holds a re-entrant lock around every request,
/// so that tasks sharing the handle cannot interleave at the transport level.
pub struct LockedEnvironment {
    inner: Arc<dyn EnvironmentController>,
    gate: ReentrantGate,
}

impl LockedEnvironment {
    pub fn new(inner: Arc<dyn EnvironmentController>) -> Self {
        Self {
            inner,
            gate: ReentrantGate::default(),
        }
    }

    /// Run several requests back to back without another thread getting in between.
    /// Requests made through `self` inside `f` do not deadlock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.gate.enter();
        f(self)
    }
}

impl EnvironmentController for LockedEnvironment {
    fn address(&self) -> &str {
        self.inner.address()
    }

    fn get_temperature_and_field(&self) -> Result<EnvironmentReading, DeviceError> {
        let _guard = self.gate.enter();
        self.inner.get_temperature_and_field()
    }

    fn close(&self) -> Result<(), DeviceError> {
        let _guard = self.gate.enter();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Fails the test if two requests are ever in flight at once
    struct Exclusive {
        in_flight: AtomicUsize,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    impl EnvironmentController for Exclusive {
        fn address(&self) -> &str {
            "ppms"
        }

        fn get_temperature_and_field(&self) -> Result<EnvironmentReading, DeviceError> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(EnvironmentReading {
                temperature: 300.0,
                temperature_status: "Stable".into(),
                field: 0.0,
                field_status: "Holding".into(),
            })
        }
    }

    #[test]
    fn requests_do_not_interleave() {
        let inner = Arc::new(Exclusive {
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let locked = Arc::new(LockedEnvironment::new(inner.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locked = locked.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        locked.get_temperature_and_field().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 40);
        assert_eq!(inner.overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn holder_can_reenter() {
        let inner = Arc::new(Exclusive {
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let locked = LockedEnvironment::new(inner.clone());

        let (a, b) = locked.with_lock(|env| {
            (
                env.get_temperature_and_field(),
                env.get_temperature_and_field(),
            )
        });
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(locked.address(), "ppms");

        // Released after the batch
        assert!(locked.get_temperature_and_field().is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
