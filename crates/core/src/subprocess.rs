//! Subprocess lifecycle bookkeeping for the external validator.
//!
//! The adapter that spawned a process keeps ownership of its `Child` and awaits its exit. What
//! it registers here is a kill switch: [`SubprocessRegistry::kill_all`] trips every registered
//! switch, and the owning adapter force-kills its child as soon as it observes that.
//!
//! Registration is tied to a [`ProcessTicket`]; dropping the ticket deregisters the process,
//! so an adapter that bails out early never leaves a stale entry behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct TrackedProcess {
    pid: Option<u32>,
    kill: CancellationToken,
}

/// Live external validator processes.
#[derive(Debug, Default)]
pub struct SubprocessRegistry {
    next_id: AtomicU64,
    processes: Mutex<HashMap<u64, TrackedProcess>>,
}

impl SubprocessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<u64, TrackedProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a freshly spawned process.
    ///
    /// The returned ticket deregisters the process when dropped.
    pub fn register(self: &Arc<Self>, pid: Option<u32>) -> ProcessTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        self.processes().insert(
            id,
            TrackedProcess {
                pid,
                kill: kill.clone(),
            },
        );
        tracing::debug!("registered validator process {:?} as #{}", pid, id);

        ProcessTicket {
            id,
            pid,
            kill,
            registry: Arc::clone(self),
        }
    }

    /// Remove a process after it exited. Unknown ids are ignored.
    pub fn deregister(&self, id: u64) {
        if let Some(process) = self.processes().remove(&id) {
            tracing::debug!("deregistered validator process {:?}", process.pid);
        }
    }

    /// Request termination of every registered process.
    ///
    /// Returns how many processes were signalled. Processes that already exited are simply
    /// deregistered by their owners.
    pub fn kill_all(&self) -> usize {
        let processes = self.processes();
        for process in processes.values() {
            tracing::info!("killing validator process {:?}", process.pid);
            process.kill.cancel();
        }
        processes.len()
    }

    /// OS process ids of the currently registered processes.
    pub fn live_pids(&self) -> Vec<u32> {
        self.processes()
            .values()
            .filter_map(|process| process.pid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle for one live process.
#[derive(Debug)]
pub struct ProcessTicket {
    id: u64,
    pid: Option<u32>,
    kill: CancellationToken,
    registry: Arc<SubprocessRegistry>,
}

impl ProcessTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once a kill has been requested for this process.
    pub async fn kill_requested(&self) {
        self.kill.cancelled().await;
    }

    pub fn is_kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }
}

impl Drop for ProcessTicket {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
