// Copyright (c) 2024 Mike Tsao

use crate::{graph::ModuleSlot, traits::ProcessArgs};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
};

/// A barrier that spins by default and can be switched to a condvar wait.
///
/// Spinning wins for the sub-100 µs rounds that dominate real-time blocks;
/// the blocking mode exists so a module that knows it is about to run long
/// (I/O, a big FFT) can keep the other workers from burning a core each
/// while they wait for it. This is the latency floor of the whole engine, so
/// the fast path is two atomic ops and a spin loop.
#[derive(Debug)]
pub(crate) struct HybridBarrier {
    total: usize,
    count: AtomicUsize,
    generation: AtomicUsize,
    yielded: Arc<AtomicBool>,
    lock: Mutex<()>,
    cv: Condvar,
}
impl HybridBarrier {
    /// A barrier for `total` participants. `yielded` is shared: the engine
    /// and the in-flight [ProcessArgs] flip it, every barrier reads it.
    pub fn new(total: usize, yielded: Arc<AtomicBool>) -> Self {
        Self {
            total,
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            yielded,
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Blocks (spinning, or sleeping once yielded) until all `total`
    /// participants have arrived.
    pub fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.total {
            self.count.store(0, Ordering::Release);
            // Advance the generation under the lock so a waiter that checked
            // it and is about to sleep can't miss the notification.
            let _guard = self.lock.lock();
            self.generation.fetch_add(1, Ordering::Release);
            self.cv.notify_all();
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                if self.yielded.load(Ordering::Acquire) {
                    let mut guard = self.lock.lock();
                    if self.generation.load(Ordering::Acquire) == generation {
                        self.cv.wait(&mut guard);
                    }
                } else {
                    core::hint::spin_loop();
                }
            }
        }
    }
}

/// What the workers chew through during one frame round.
#[derive(Debug, Default)]
struct FrameJob {
    list: Arc<Vec<Arc<ModuleSlot>>>,
    args: ProcessArgs,
}

#[derive(Debug)]
struct PoolShared {
    start: HybridBarrier,
    end: HybridBarrier,
    job: Mutex<FrameJob>,
    next_index: AtomicUsize,
    running: AtomicBool,
    aborted: AtomicBool,
}

/// The pool of long-lived threads that evaluate modules in parallel.
///
/// The thread calling [WorkerPool::run_frame()] counts as worker 0, so a
/// pool of one spawns no threads at all. Work distribution is a shared
/// `fetch_add` counter over the frame's module list: no per-module
/// scheduling, no load balancing beyond first-come-first-served stealing.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}
impl WorkerPool {
    /// A pool in which `workers` threads (including the caller) process each
    /// frame.
    pub fn new(workers: usize, yield_flag: &Arc<AtomicBool>) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            start: HybridBarrier::new(workers, Arc::clone(yield_flag)),
            end: HybridBarrier::new(workers, Arc::clone(yield_flag)),
            job: Mutex::new(FrameJob::default()),
            next_index: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
        });
        let threads = (1..workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tangle-worker-{worker_id}"))
                    .spawn(move || Self::worker_run(shared, worker_id))
                    .expect("spawning an engine worker thread failed")
            })
            .collect();
        Self { shared, threads }
    }

    fn worker_run(shared: Arc<PoolShared>, worker_id: usize) {
        tracing::debug!(worker_id, "engine worker started");
        loop {
            shared.start.wait();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            let (list, args) = {
                let job = shared.job.lock();
                (Arc::clone(&job.list), job.args.clone())
            };
            Self::work(&shared, &list, &args);
            shared.end.wait();
        }
        tracing::debug!(worker_id, "engine worker stopped");
    }

    /// Pulls module indices off the shared counter until the list runs dry.
    fn work(shared: &PoolShared, list: &[Arc<ModuleSlot>], args: &ProcessArgs) {
        loop {
            let index = shared.next_index.fetch_add(1, Ordering::Relaxed);
            if index >= list.len() {
                break;
            }
            if shared.aborted.load(Ordering::Relaxed) {
                // A module panicked; drain the rest of the frame.
                continue;
            }
            let slot = &list[index];
            if catch_unwind(AssertUnwindSafe(|| slot.process_frame(args))).is_err() {
                shared.aborted.store(true, Ordering::Relaxed);
                tracing::error!(
                    module_id = %slot.id(),
                    "module panicked in process(); aborting the rest of this block"
                );
            }
        }
    }

    /// Runs one frame: every module in `list` gets exactly one
    /// `process_frame` call, split across all workers. Returns only when the
    /// frame is complete, and returns `false` if a module panicked and the
    /// frame was abandoned partway.
    pub fn run_frame(&self, list: &Arc<Vec<Arc<ModuleSlot>>>, args: ProcessArgs) -> bool {
        {
            let mut job = self.shared.job.lock();
            job.list = Arc::clone(list);
            job.args = args.clone();
        }
        self.shared.next_index.store(0, Ordering::Release);
        self.shared.start.wait();
        Self::work(&self.shared, list, &args);
        self.shared.end.wait();
        !self.shared.aborted.swap(false, Ordering::Relaxed)
    }

    /// Drops the pool's reference to the last frame's module list so that
    /// removed modules aren't kept alive by a stale snapshot.
    pub fn clear_job(&self) {
        self.shared.job.lock().list = Arc::new(Vec::new());
    }
}
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if !self.threads.is_empty() {
            // Workers are parked at the start barrier between frames; one
            // more round releases them to observe the shutdown flag.
            self.shared.start.wait();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{InputPort, OutputPort, Param},
        traits::Module,
        types::{ModuleDescriptor, ModuleId},
    };
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[derive(Debug)]
    struct CountingModule {
        calls: Arc<StdAtomicUsize>,
    }
    impl Module for CountingModule {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor::new("test", "counting")
        }

        fn process(
            &mut self,
            _args: &ProcessArgs,
            _inputs: &[InputPort],
            _outputs: &[OutputPort],
            _params: &[Param],
        ) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Debug)]
    struct PanickingModule;
    impl Module for PanickingModule {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor::new("test", "panicking")
        }

        fn process(
            &mut self,
            _args: &ProcessArgs,
            _inputs: &[InputPort],
            _outputs: &[OutputPort],
            _params: &[Param],
        ) {
            panic!("deliberate test panic");
        }
    }

    fn slot_list(slots: Vec<ModuleSlot>) -> Arc<Vec<Arc<ModuleSlot>>> {
        Arc::new(slots.into_iter().map(Arc::new).collect())
    }

    fn counting_slots(count: i64, calls: &Arc<StdAtomicUsize>) -> Arc<Vec<Arc<ModuleSlot>>> {
        slot_list(
            (0..count)
                .map(|i| {
                    ModuleSlot::new(
                        ModuleId(i),
                        Box::new(CountingModule {
                            calls: Arc::clone(calls),
                        }),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn every_module_processed_exactly_once_per_frame() {
        for workers in [1, 2, 4] {
            let calls = Arc::new(StdAtomicUsize::new(0));
            let slots = counting_slots(16, &calls);
            let pool = WorkerPool::new(workers, &Arc::new(AtomicBool::new(false)));
            for _ in 0..10 {
                assert!(pool.run_frame(&slots, ProcessArgs::default()));
            }
            assert_eq!(
                calls.load(Ordering::Relaxed),
                160,
                "with {workers} workers, 16 modules over 10 frames should process 160 times"
            );
        }
    }

    #[test]
    fn panicking_module_aborts_the_frame_but_not_the_pool() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let slots = slot_list(vec![
            ModuleSlot::new(ModuleId(0), Box::new(PanickingModule)),
            ModuleSlot::new(
                ModuleId(1),
                Box::new(CountingModule {
                    calls: Arc::clone(&calls),
                }),
            ),
        ]);
        let pool = WorkerPool::new(2, &Arc::new(AtomicBool::new(false)));
        assert!(!pool.run_frame(&slots, ProcessArgs::default()));

        // The pool is still serviceable afterward.
        let survivors = counting_slots(1, &calls);
        assert!(pool.run_frame(&survivors, ProcessArgs::default()));
    }

    #[test]
    fn yielded_barrier_still_completes_frames() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let slots = counting_slots(8, &calls);
        let yield_flag = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::new(3, &yield_flag);

        yield_flag.store(true, Ordering::Release);
        assert!(pool.run_frame(&slots, ProcessArgs::default()));
        yield_flag.store(false, Ordering::Release);
        assert!(pool.run_frame(&slots, ProcessArgs::default()));
        assert_eq!(calls.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn pool_shuts_down_cleanly() {
        let pool = WorkerPool::new(4, &Arc::new(AtomicBool::new(false)));
        assert!(pool.run_frame(&Arc::new(Vec::new()), ProcessArgs::default()));
        drop(pool);
    }
}
