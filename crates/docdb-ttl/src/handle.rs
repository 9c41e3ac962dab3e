use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use docdb_store::Store;
use tracing::{debug, warn};

use crate::purger::TtlPurger;

/// Background thread running [`TtlPurger::purge`] every sweep interval.
/// Stops on [`TtlHandle::stop`] or drop.
pub struct TtlHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
    runs: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TtlHandle {
    /// `None` when the config disables background sweeps.
    pub fn spawn<S>(purger: Arc<TtlPurger<S>>) -> Option<TtlHandle>
    where
        S: Store + Send + Sync + 'static,
    {
        let interval = purger.config().sweep_interval()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new((Mutex::new(()), Condvar::new()));
        let runs = Arc::new(AtomicU64::new(0));
        let sweep_flag = Arc::clone(&shutdown);
        let sweep_notify = Arc::clone(&notify);
        let sweep_runs = Arc::clone(&runs);
        let handle = thread::spawn(move || {
            loop {
                let (lock, cvar) = &*sweep_notify;
                let Ok(guard) = lock.lock() else {
                    warn!("TTL sweeper lost its wakeup lock");
                    break;
                };
                if cvar
                    .wait_timeout_while(guard, interval, |_| !sweep_flag.load(Ordering::Relaxed))
                    .is_err()
                {
                    break;
                }
                if sweep_flag.load(Ordering::Relaxed) {
                    break;
                }
                let report = purger.purge();
                sweep_runs.fetch_add(1, Ordering::Relaxed);
                debug!(deleted = report.deleted, "TTL sweep done");
            }
        });

        Some(TtlHandle {
            shutdown,
            notify,
            runs,
            handle: Some(handle),
        })
    }

    /// Completed sweeps.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        {
            // taking the lock orders the flag before the waiter's next check
            let _guard = self.notify.0.lock();
            self.notify.1.notify_one();
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for TtlHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
