//! Worker pool and maintenance timer. A fixed pool of channel-fed worker
//! threads executes posted jobs; a dedicated timer thread fires the
//! maintenance schedule every interval and posts the work onto the pool so
//! that wallet RPCs never block the timer itself.

use log::warn;
use parking_lot::{Condvar, Mutex};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Maintenance tick interval.
pub const TIMER_INTERVAL: Duration = Duration::from_secs(15);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Round-robin pool of worker threads, one I/O queue each.
pub struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = mpsc::channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("xchange-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            senders.push(tx);
            handles.push(handle);
        }
        WorkerPool {
            senders,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    /// Post a job onto the next worker in rotation.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        let n = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[n].send(Box::new(job)).is_err() {
            warn!("worker {} is gone, job dropped", n);
        }
    }

    /// Close the queues and join every worker. Queued jobs still run.
    pub fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Periodic timer on its own thread. The tick closure runs on the timer
/// thread and is expected to only post jobs, never block.
pub struct Timer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn start<F>(interval: Duration, mut tick: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = stop.clone();
        let handle = thread::Builder::new()
            .name("xchange-timer".into())
            .spawn(move || {
                let (lock, cvar) = &*shared;
                loop {
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cvar.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    tick();
                }
            })
            .expect("failed to spawn timer thread");
        Timer { stop, handle }
    }

    /// Cancel the timer and join its thread.
    pub fn shutdown(self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn pool_runs_posted_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn timer_fires_and_stops() {
        let counter = Arc::new(AtomicU32::new(0));
        let shared = counter.clone();
        let timer = Timer::start(Duration::from_millis(5), move || {
            shared.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(60));
        timer.shutdown();
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired > 0);
    }
}
