//! Threading support: a one-shot latch used for cancellation and completion
//! signalling, and a thread handle that can be joined against a deadline.
//!
//! Every long-lived unit of the agent (source schedulers, collectors, the
//! processing loop, flush controllers) runs on its own OS thread and parks on
//! a `Latch` with a timeout rather than sleeping blindly, so a shutdown request
//! is seen promptly.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// How often blocking operations that cannot wait on a latch directly (bus
/// publish, buffer offer) re-check their cancellation latch.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A one-shot, clonable flag. Once set it stays set. Threads may wait for it
/// with a deadline.
#[derive(Clone, Debug, Default)]
pub struct Latch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Latch {
    /// Create an unset latch.
    pub fn new() -> Latch {
        Latch::default()
    }

    fn lock(&self) -> MutexGuard<bool> {
        // A poisoned latch still carries a meaningful bool.
        match self.inner.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set the latch, waking every waiter.
    pub fn set(&self) {
        let mut set = self.lock();
        *set = true;
        self.inner.1.notify_all();
    }

    /// Whether the latch has been set.
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Wait until the latch is set or `deadline` passes. Returns true if the
    /// latch is set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut set = self.lock();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = match self.inner.1.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Wait at most `timeout` for the latch. Returns true if the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

/// Sets its latch when dropped, including on unwind.
struct SetOnDrop(Latch);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// A named worker thread.
pub struct ThreadHandle {
    name: String,
    handle: thread::JoinHandle<()>,
    done: Latch,
}

impl ThreadHandle {
    /// The name the thread was spawned with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread's closure has returned.
    pub fn is_finished(&self) -> bool {
        self.done.is_set()
    }

    /// Join the given thread, blocking until it exits.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("[{}] thread panicked", self.name);
        }
    }

    /// Join the thread if it finishes before `deadline`. Returns false, and
    /// detaches the thread, if it is still running at the deadline.
    pub fn join_until(self, deadline: Instant) -> bool {
        if self.done.wait_until(deadline) {
            self.join();
            true
        } else {
            warn!("[{}] did not stop before deadline, abandoning", self.name);
            false
        }
    }
}

/// Spawns a new named thread executing the provided closure.
///
/// Spawning only fails when the OS refuses to create a thread, which the agent
/// treats as fatal at construction time.
pub fn spawn<S, F>(name: S, f: F) -> ::std::io::Result<ThreadHandle>
where
    S: Into<String>,
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    let done = Latch::new();
    let guard = SetOnDrop(done.clone());
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let _guard = guard;
        f();
    })?;
    Ok(ThreadHandle { name, handle, done })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn latch_wait_times_out() {
        let latch = Latch::new();
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn latch_wakes_waiter() {
        let latch = Latch::new();
        let remote = latch.clone();
        let handle = spawn("setter", move || {
            thread::sleep(Duration::from_millis(10));
            remote.set();
        }).unwrap();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert!(latch.is_set());
        assert!(handle.join_until(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn join_until_abandons_stuck_thread() {
        let release = Latch::new();
        let remote = release.clone();
        let handle = spawn("stuck", move || {
            remote.wait_timeout(Duration::from_secs(60));
        }).unwrap();
        let start = Instant::now();
        assert!(!handle.join_until(Instant::now() + Duration::from_millis(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        release.set();
    }
}
