use std::thread;

use crossbeam_channel::{Sender, unbounded};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool the per-pixel fits are submitted to.
///
/// Jobs are queued on an unbounded channel; dropping the pool closes it and joins the
/// workers after they drain what was queued.
pub struct FitPool {
    tx: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl FitPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let worker_count = threads.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let rx = rx.clone();
            handles.push(thread::spawn(move || {
                for job in rx {
                    job();
                }
                debug!("fit pool worker {idx} exiting");
            }));
        }
        Self {
            tx: Some(tx),
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queue `job`; it runs on the calling thread if the pool has been stopped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = match &self.tx {
            Some(tx) => tx.send(job).err().map(|err| err.into_inner()),
            None => Some(job),
        };
        if let Some(job) = rejected {
            job();
        }
    }
}

impl Drop for FitPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                debug!("fit pool worker panicked");
            }
        }
    }
}
