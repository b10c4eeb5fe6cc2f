use crossbeam_utils::CachePadded;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provides multithreading dispatch primitives and a thread count for the evolution to use.
///
/// The evolution only ever asks for a batch of workers and waits for them. Work distribution happens on
/// the evolution's side: each pre-iteration pass, serial island sweep and color bucket hands out index
/// ranges from an atomic cursor in [`parallel_for`], so workers that finish early simply claim more ranges.
/// A color bucket is one dispatch, and the dispatch returning is the barrier before the next bucket.
///
/// An implementation therefore only needs to run `worker_body` on up to `maximum_worker_count` threads and
/// return once all of them are done. Wrapping an existing pool this way is enough.
pub trait IThreadDispatcher: Send + Sync {
    /// Gets the number of workers available in the thread dispatcher.
    ///
    /// Workers are expected to be truly independent threads. Nothing in the evolution blocks on another worker,
    /// but the stage as a whole blocks until every dispatched worker returns.
    fn thread_count(&self) -> usize;

    /// Dispatches up to `maximum_worker_count` workers and blocks until all of them return.
    ///
    /// # Arguments
    ///
    /// * `worker_body` - Function invoked once on every worker with the worker's index.
    /// * `maximum_worker_count` - Maximum number of workers to dispatch.
    fn dispatch_workers(&self, worker_body: &(dyn Fn(usize) + Sync), maximum_worker_count: usize);
}

/// Default dispatcher backed by crossbeam scoped threads.
///
/// The calling thread acts as worker 0, so a dispatcher with a thread count of one never spawns.
#[derive(Debug, Clone)]
pub struct ThreadDispatcher {
    thread_count: usize,
}

impl ThreadDispatcher {
    /// Creates a dispatcher with the given number of workers. Zero is treated as one.
    pub fn new(thread_count: usize) -> Self {
        Self {
            thread_count: thread_count.max(1),
        }
    }

    /// Creates a dispatcher using every hardware thread reported by the platform.
    pub fn with_available_parallelism() -> Self {
        let thread_count = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::new(thread_count)
    }
}

impl IThreadDispatcher for ThreadDispatcher {
    #[inline(always)]
    fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn dispatch_workers(&self, worker_body: &(dyn Fn(usize) + Sync), maximum_worker_count: usize) {
        let worker_count = self.thread_count.min(maximum_worker_count);
        if worker_count <= 1 {
            worker_body(0);
            return;
        }
        let result = crossbeam_utils::thread::scope(|scope| {
            for worker_index in 1..worker_count {
                scope.spawn(move |_| worker_body(worker_index));
            }
            worker_body(0);
        });
        if let Err(payload) = result {
            // A worker panicked; surface it on the dispatching thread.
            std::panic::resume_unwind(payload);
        }
    }
}

/// Shared job counter handed to every worker of a parallel-for.
struct JobQueue {
    next_job: CachePadded<AtomicUsize>,
    job_size: usize,
    job_count: usize,
    item_count: usize,
}

impl JobQueue {
    fn new(item_count: usize, worker_count: usize) -> Self {
        const JOBS_PER_WORKER: usize = 4;
        let target_job_count = worker_count * JOBS_PER_WORKER;
        let job_size = (item_count / target_job_count).max(1);
        let job_count = item_count.div_ceil(job_size);
        Self {
            next_job: CachePadded::new(AtomicUsize::new(0)),
            job_size,
            job_count,
            item_count,
        }
    }

    #[inline(always)]
    fn try_get_job(&self) -> Option<Range<usize>> {
        let job_index = self.next_job.fetch_add(1, Ordering::AcqRel);
        if job_index >= self.job_count {
            return None;
        }
        let start = job_index * self.job_size;
        let end = (start + self.job_size).min(self.item_count);
        Some(start..end)
    }
}

/// Runs `body` over `0..item_count`, split into contiguous ranges claimed lock-free by the dispatcher's workers.
///
/// Ranges handed to `body` never overlap, so each invocation may write exclusively to the items in its range.
/// Runs inline on the calling thread when there is no dispatcher or `item_count` does not exceed `minimum_batch_size`.
/// Blocks until every range has been processed.
pub fn parallel_for(
    dispatcher: Option<&dyn IThreadDispatcher>,
    item_count: usize,
    minimum_batch_size: usize,
    body: &(dyn Fn(Range<usize>) + Sync),
) {
    if item_count == 0 {
        return;
    }
    let dispatcher = match dispatcher {
        Some(dispatcher) if dispatcher.thread_count() > 1 && item_count > minimum_batch_size => {
            dispatcher
        }
        _ => {
            body(0..item_count);
            return;
        }
    };
    let worker_count = dispatcher
        .thread_count()
        .min(item_count.div_ceil(minimum_batch_size.max(1)));
    let queue = JobQueue::new(item_count, worker_count);
    dispatcher.dispatch_workers(
        &|_worker_index| {
            while let Some(range) = queue.try_get_job() {
                body(range);
            }
        },
        worker_count,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn parallel_for_visits_every_item_once() {
        let dispatcher = ThreadDispatcher::new(4);
        let visits: Vec<AtomicU32> = (0..1000).map(|_| AtomicU32::new(0)).collect();
        parallel_for(Some(&dispatcher), visits.len(), 8, &|range| {
            for i in range {
                visits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn small_batches_run_inline() {
        let dispatcher = ThreadDispatcher::new(4);
        let calls = AtomicU32::new(0);
        parallel_for(Some(&dispatcher), 10, 64, &|range| {
            assert_eq!(range, 0..10);
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_items_is_a_no_op() {
        parallel_for(None, 0, 1, &|_| panic!("should not be called"));
    }
}
