//! The player worker thread
//!
//! One background thread drives refills for every active player in the
//! process. While players are registered it wakes every
//! [`EngineConfig::worker_nap`] and calls `work()` on each; with no
//! players it blocks until notified. Pulling from a source may block on
//! decoder I/O — that is the whole point of doing it here rather than on
//! the application thread or a device callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::player::AudioPlayer;

struct Gate {
    stopped: bool,
    notified: bool,
}

struct WorkerInner {
    /// Operation lock: held while the player set is read or changed,
    /// never while a player's `work()` runs.
    players: Mutex<HashMap<u64, Arc<dyn AudioPlayer>>>,
    gate: Mutex<Gate>,
    wake: Condvar,
    nap: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the worker thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct PlayerWorker {
    inner: Arc<WorkerInner>,
}

impl PlayerWorker {
    /// Spawn a worker thread napping `nap` between rounds.
    ///
    /// Returns once the thread is up, so a `stop()` issued right after
    /// can never miss it.
    pub fn spawn(nap: Duration) -> Result<Self> {
        let inner = Arc::new(WorkerInner {
            players: Mutex::new(HashMap::new()),
            gate: Mutex::new(Gate {
                stopped: false,
                notified: false,
            }),
            wake: Condvar::new(),
            nap,
            thread: Mutex::new(None),
        });

        // Start gate: don't return until the thread has registered
        // itself, guarding against it being unscheduled in between.
        let started = Arc::new((Mutex::new(false), Condvar::new()));
        let started_thread = Arc::clone(&started);
        let run_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("player-worker".to_string())
            .spawn(move || {
                {
                    let (flag, cond) = &*started_thread;
                    *flag.lock() = true;
                    cond.notify_all();
                }
                Self::run(&run_inner);
            })
            .map_err(|e| MediaError::BackendFatal(format!("failed to spawn worker thread: {e}")))?;

        {
            let (flag, cond) = &*started;
            let mut up = flag.lock();
            while !*up {
                cond.wait(&mut up);
            }
        }
        *inner.thread.lock() = Some(handle);
        info!("player worker started (nap {:?})", nap);
        Ok(Self { inner })
    }

    /// The process-wide worker drivers share by default.
    pub fn shared() -> &'static PlayerWorker {
        static SHARED: Lazy<PlayerWorker> = Lazy::new(|| {
            PlayerWorker::spawn(EngineConfig::default().worker_nap)
                .expect("failed to start the shared player worker")
        });
        &SHARED
    }

    fn run(inner: &Arc<WorkerInner>) {
        loop {
            let idle = inner.players.lock().is_empty();
            {
                let mut gate = inner.gate.lock();
                if gate.stopped {
                    break;
                }
                if !gate.notified {
                    if idle {
                        trace!("worker sleeping indefinitely, no active players");
                        inner.wake.wait(&mut gate);
                    } else {
                        let _ = inner.wake.wait_for(&mut gate, inner.nap);
                    }
                }
                gate.notified = false;
                if gate.stopped {
                    break;
                }
            }

            // Snapshot under the operation lock, run work() outside it:
            // add/remove stay mutually exclusive with the iteration step
            // and the set lock is never held across a player lock. A
            // player removed mid-round may still receive one trailing
            // work(), which is harmless on a paused player.
            let players: Vec<Arc<dyn AudioPlayer>> =
                inner.players.lock().values().cloned().collect();
            for player in players {
                player.work();
            }
        }
        debug!("player worker exiting");
    }

    /// Register a player; the worker will call `work()` on it regularly.
    /// Safe from any thread, including from within a `work()` call.
    pub fn add(&self, id: u64, player: Arc<dyn AudioPlayer>) {
        trace!(id, "worker: player added");
        self.inner.players.lock().insert(id, player);
        self.notify();
    }

    /// Deregister a player, or do nothing if it is not registered.
    /// Safe from any thread, including from within a `work()` call.
    pub fn remove(&self, id: u64) {
        trace!(id, "worker: player removed");
        self.inner.players.lock().remove(&id);
    }

    /// Interrupt the current nap so the next round starts immediately.
    pub fn notify(&self) {
        let mut gate = self.inner.gate.lock();
        gate.notified = true;
        self.inner.wake.notify_all();
    }

    /// Stop the thread and wait for it to terminate. Must not be called
    /// from the worker thread itself.
    pub fn stop(&self) {
        {
            let mut gate = self.inner.gate.lock();
            gate.stopped = true;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.inner.thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.inner.players.lock().len()
    }
}
