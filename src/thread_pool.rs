use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TaskState<T> {
    result: Mutex<Option<T>>,
    cvar: Condvar,
}

/// Waitable, movable result of a submitted task. Single consumer: `get`
/// surrenders the value, after which the future is no longer valid.
pub struct TaskFuture<T> {
    state: Arc<TaskState<T>>,
    consumed: bool,
}

impl<T> TaskFuture<T> {
    /// Whether this future still refers to an unconsumed result.
    pub fn valid(&self) -> bool {
        !self.consumed
    }

    /// Block until the task has produced its result.
    pub fn wait(&self) {
        if self.consumed {
            return;
        }
        let mut result = self.state.result.lock();
        while result.is_none() {
            self.state.cvar.wait(&mut result);
        }
    }

    /// Block until completion and take the result. Returns `None` once the
    /// value has already been consumed.
    pub fn get(&mut self) -> Option<T> {
        if self.consumed {
            return None;
        }
        self.wait();
        self.consumed = true;
        self.state.result.lock().take()
    }
}

/// A bounded pool of workers draining one shared queue. Tasks may block on
/// the futures of other tasks; the caller sizes the pool so that such
/// composition cannot exhaust every worker.
pub struct ThreadPool {
    workers: Vec<thread::JoinHandle<()>>,
    tx: Option<crossbeam::channel::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(nthreads: usize) -> ThreadPool {
        let nthreads = nthreads.max(1);
        let (tx, rx) = crossbeam::channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            let rx = rx.clone();
            let builder = thread::Builder::new().name("pool_worker".into());
            workers.push(
                builder
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn pool worker"),
            );
        }
        ThreadPool {
            workers,
            tx: Some(tx),
        }
    }

    /// Enqueue a task without blocking; execution order is unspecified.
    pub fn submit<F, T>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(TaskState {
            result: Mutex::new(None),
            cvar: Condvar::new(),
        });
        let task_state = state.clone();
        let job: Job = Box::new(move || {
            let value = f();
            *task_state.result.lock() = Some(value);
            task_state.cvar.notify_all();
        });
        self.tx
            .as_ref()
            .expect("pool is shutting down")
            .send(job)
            .expect("pool queue closed");
        TaskFuture {
            state,
            consumed: false,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submit_and_get() {
        let pool = ThreadPool::new(2);
        let mut fut = pool.submit(|| 21 * 2);
        assert!(fut.valid());
        assert_eq!(fut.get(), Some(42));
        assert!(!fut.valid());
        assert_eq!(fut.get(), None);
    }

    #[test]
    fn futures_move_between_threads() {
        let pool = ThreadPool::new(2);
        let fut = pool.submit(|| "done".to_owned());
        let handle = thread::spawn(move || {
            let mut fut = fut;
            fut.get().unwrap()
        });
        assert_eq!(handle.join().unwrap(), "done");
    }

    #[test]
    fn tasks_can_wait_on_tasks() {
        let pool = ThreadPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let mut leaf = pool.submit(move || c1.fetch_add(1, Ordering::SeqCst));
        let c2 = counter.clone();
        let mut parent = pool.submit(move || {
            leaf.wait();
            let _ = leaf.get();
            c2.fetch_add(1, Ordering::SeqCst)
        });
        parent.get();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn many_tasks_complete() {
        let pool = ThreadPool::new(4);
        let futs: Vec<_> = (0..64).map(|i| pool.submit(move || i * i)).collect();
        let sum: usize = futs.into_iter().map(|mut f| f.get().unwrap()).sum();
        assert_eq!(sum, (0..64).map(|i| i * i).sum());
    }
}
