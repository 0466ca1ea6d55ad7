use lagscope_capture::{ThreadHandle, current_thread};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// A thread that recurses `depth` frames deep and then spins until dropped,
/// standing in for a blocked main thread.
pub(crate) struct StuckWorker {
    thread: ThreadHandle,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<usize>>,
}

#[inline(never)]
fn descend(depth: usize, ready: &AtomicU64, stop: &AtomicBool) -> usize {
    if depth == 0 {
        ready.store(current_thread().as_raw(), Ordering::Release);
        while !stop.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        return 0;
    }
    black_box(descend(black_box(depth - 1), ready, stop)) + 1
}

impl StuckWorker {
    pub(crate) fn spawn(depth: usize) -> Result<Self, String> {
        let ready = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let ready = Arc::clone(&ready);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("lagscope-stuck".to_owned())
                .spawn(move || descend(depth, &ready, &stop))
                .map_err(|e| format!("failed to spawn stuck worker: {e}"))?
        };
        while ready.load(Ordering::Acquire) == 0 {
            if join.is_finished() {
                return Err("stuck worker exited before reporting its thread".to_owned());
            }
            std::thread::yield_now();
        }
        let thread = ThreadHandle::from_raw(ready.load(Ordering::Acquire));
        tracing::debug!(thread = thread.as_raw(), depth, "stuck worker ready");
        Ok(Self {
            thread,
            stop,
            join: Some(join),
        })
    }

    pub(crate) fn thread(&self) -> ThreadHandle {
        self.thread
    }
}

impl Drop for StuckWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
