use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crate::observability::{classify_panic_payload, format_panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn submit<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    TaskPool::global().submit(Box::new(job));
}

/// Jobs submitted together, so the caller can wait for all of them.
pub(crate) struct Batch {
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    pending: usize,
}

impl Batch {
    pub(crate) fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            done_tx,
            done_rx,
            pending: 0,
        }
    }

    pub(crate) fn submit<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let done = self.done_tx.clone();
        self.pending += 1;
        submit(move || {
            // The signal must go out even when the job panics.
            struct Signal(Sender<()>);
            impl Drop for Signal {
                fn drop(&mut self) {
                    let _ = self.0.send(());
                }
            }
            let _signal = Signal(done);
            job();
        });
    }

    pub(crate) fn wait(mut self) {
        while self.pending > 0 {
            if self.done_rx.recv().is_err() {
                break;
            }
            self.pending -= 1;
        }
    }
}

struct TaskPool {
    tx: Sender<Job>,
}

impl TaskPool {
    fn global() -> &'static Self {
        static POOL: OnceLock<TaskPool> = OnceLock::new();
        POOL.get_or_init(Self::new)
    }

    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let workers = thread::available_parallelism()
            .map(|n| n.get().max(4))
            .unwrap_or(4);
        let shared_rx: Arc<Mutex<Receiver<Job>>> = Arc::new(Mutex::new(rx));
        for idx in 0..workers {
            let worker_rx = Arc::clone(&shared_rx);
            let name = format!("edgesim-task-{idx}");
            let _ = thread::Builder::new().name(name).spawn(move || {
                loop {
                    let job = {
                        let Ok(guard) = worker_rx.lock() else {
                            break;
                        };
                        match guard.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        let details = classify_panic_payload(payload.as_ref());
                        edgesim_rt::log::error(&format!(
                            "worker job panicked: {}",
                            format_panic_message(&details)
                        ));
                    }
                }
            });
        }
        Self { tx }
    }

    fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, mpsc};
    use std::time::Duration;

    use super::{Batch, submit};

    #[test]
    fn runs_multiple_jobs_concurrently() {
        let barrier = Arc::new(Barrier::new(3));
        let (tx, rx) = mpsc::channel::<String>();

        for name in ["a", "b"] {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            submit(move || {
                let _ = tx.send(name.to_string());
                barrier.wait();
            });
        }

        let mut started = HashSet::new();
        while started.len() < 2 {
            let name = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("expected both jobs to start");
            started.insert(name);
        }
        barrier.wait();
    }

    #[test]
    fn batch_waits_for_panicking_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut batch = Batch::new();
        for idx in 0..4 {
            let counter = Arc::clone(&counter);
            batch.submit(move || {
                if idx == 2 {
                    panic!("job {idx} failed");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        batch.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
