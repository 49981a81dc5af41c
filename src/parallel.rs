//! Scoped worker pool for the between-pass restructure phase.
//!
//! Workers drain a shared job list until it is empty; jobs may borrow
//! mutable tree state because the threads are scoped to the caller.

use std::sync::Mutex;

/// Number of workers used for parallel tree maintenance.
pub fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Runs `run` over every job on `worker_count()` threads, returning once the
/// job list has drained. Falls back to the calling thread for trivial loads.
pub fn drain_parallel<T, F>(jobs: Vec<T>, run: F)
where
    T: Send,
    F: Fn(T) + Sync,
{
    let workers = worker_count().min(jobs.len());
    if workers <= 1 {
        for job in jobs {
            run(job);
        }
        return;
    }

    let queue = Mutex::new(jobs);
    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let job = {
                    let mut queue = queue.lock().unwrap();
                    queue.pop()
                };
                match job {
                    Some(job) => run(job),
                    None => break,
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drains_every_job_exactly_once() {
        let hits = AtomicUsize::new(0);
        let jobs: Vec<usize> = (0..1000).collect();
        drain_parallel(jobs, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn jobs_may_mutate_borrowed_state() {
        let mut values = vec![0u32; 64];
        let jobs: Vec<&mut u32> = values.iter_mut().collect();
        drain_parallel(jobs, |v| *v += 7);
        assert!(values.iter().all(|&v| v == 7));
    }
}
