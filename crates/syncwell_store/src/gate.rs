//! Two-tier write gate.
//!
//! Local writers (application mutations) and sync writers (flush results)
//! share one store. The gate admits one writer at a time and always lets a
//! waiting local writer in before any sync writer, so user-facing writes
//! never queue behind background sync traffic.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// Who is asking to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOrigin {
    /// An application mutation.
    Local,
    /// The flush path or another background task.
    Sync,
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    local_waiting: usize,
    sync_waiting: usize,
}

/// Counters describing gate contention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Local admissions.
    pub local_admissions: u64,
    /// Sync admissions.
    pub sync_admissions: u64,
    /// Times a sync writer stood aside for a local one.
    pub sync_yields: u64,
}

/// A priority write lock.
#[derive(Debug, Default)]
pub struct WriteGate {
    state: Mutex<GateState>,
    released: Condvar,
    local_admissions: AtomicU64,
    sync_admissions: AtomicU64,
    sync_yields: AtomicU64,
}

impl WriteGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the caller may write.
    pub fn enter(&self, origin: WriteOrigin) -> GatePermit<'_> {
        let mut state = self.state.lock();
        match origin {
            WriteOrigin::Local => {
                state.local_waiting += 1;
                while state.held {
                    self.released.wait(&mut state);
                }
                state.local_waiting -= 1;
                self.local_admissions.fetch_add(1, Ordering::Relaxed);
            }
            WriteOrigin::Sync => {
                state.sync_waiting += 1;
                while state.held || state.local_waiting > 0 {
                    if !state.held {
                        self.sync_yields.fetch_add(1, Ordering::Relaxed);
                    }
                    self.released.wait(&mut state);
                }
                state.sync_waiting -= 1;
                self.sync_admissions.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.held = true;
        GatePermit { gate: self }
    }

    /// Returns (local, sync) writers currently waiting.
    #[must_use]
    pub fn waiting(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.local_waiting, state.sync_waiting)
    }

    /// Returns contention counters.
    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            local_admissions: self.local_admissions.load(Ordering::Relaxed),
            sync_admissions: self.sync_admissions.load(Ordering::Relaxed),
            sync_yields: self.sync_yields.load(Ordering::Relaxed),
        }
    }

    fn release(&self) {
        self.state.lock().held = false;
        self.released.notify_all();
    }
}

/// Exclusive write access. Released on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a WriteGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn wait_for(gate: &WriteGate, expected: (usize, usize)) {
        for _ in 0..1_000 {
            if gate.waiting() == expected {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("waiters never reached {expected:?}, saw {:?}", gate.waiting());
    }

    #[test]
    fn local_writer_overtakes_waiting_sync_writer() {
        let gate = Arc::new(WriteGate::new());
        let (tx, rx) = mpsc::channel();

        let held = gate.enter(WriteOrigin::Sync);

        let sync_gate = Arc::clone(&gate);
        let sync_tx = tx.clone();
        let sync_writer = thread::spawn(move || {
            let _permit = sync_gate.enter(WriteOrigin::Sync);
            sync_tx.send("sync").unwrap();
        });
        wait_for(&gate, (0, 1));

        let local_gate = Arc::clone(&gate);
        let local_writer = thread::spawn(move || {
            let _permit = local_gate.enter(WriteOrigin::Local);
            tx.send("local").unwrap();
        });
        wait_for(&gate, (1, 1));

        drop(held);
        sync_writer.join().unwrap();
        local_writer.join().unwrap();

        let order: Vec<_> = rx.iter().collect();
        assert_eq!(order, vec!["local", "sync"]);
        assert_eq!(gate.stats().local_admissions, 1);
        assert_eq!(gate.stats().sync_admissions, 2);
    }

    #[test]
    fn permits_are_exclusive() {
        let gate = Arc::new(WriteGate::new());
        let inside = Arc::new(AtomicU64::new(0));
        let overlaps = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    let origin = if i % 2 == 0 {
                        WriteOrigin::Local
                    } else {
                        WriteOrigin::Sync
                    };
                    for _ in 0..50 {
                        let _permit = gate.enter(origin);
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        let stats = gate.stats();
        assert_eq!(stats.local_admissions + stats.sync_admissions, 400);
    }
}
