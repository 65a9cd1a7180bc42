use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};

/// Counting semaphore bounding how many branches of one group run at once.
#[derive(Debug)]
pub(crate) struct Throttle {
    free: Mutex<usize>,
    released: Condvar,
}

impl Throttle {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            free: Mutex::new(permits.max(1)),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut free = self.free.lock().unwrap_or_else(|poison| poison.into_inner());
        while *free == 0 {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        *free -= 1;
    }

    fn release(&self) {
        *self.free.lock().unwrap_or_else(|poison| poison.into_inner()) += 1;
        self.released.notify_one();
    }
}

/// A branch thread's claim on its group's throttle.
///
/// The permit is handed back while the branch is blocked on other tasks, so
/// a waiting branch never keeps the one it waits for from running.
pub(crate) struct Lease {
    throttle: Option<Arc<Throttle>>,
    held: Cell<bool>,
}

impl Lease {
    /// Blocks until a permit is free. Without a throttle this never blocks.
    pub(crate) fn acquire(throttle: Option<Arc<Throttle>>) -> Self {
        if let Some(throttle) = &throttle {
            throttle.acquire();
        }
        Self {
            held: Cell::new(throttle.is_some()),
            throttle,
        }
    }

    /// Runs `wait` with the permit released, taking it back afterwards.
    pub(crate) fn suspend<T>(&self, wait: impl FnOnce() -> T) -> T {
        let Some(throttle) = self.throttle.as_deref().filter(|_| self.held.get()) else {
            return wait();
        };

        throttle.release();
        self.held.set(false);

        let out = wait();

        throttle.acquire();
        self.held.set(true);
        out
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(throttle) = &self.throttle
            && self.held.get()
        {
            throttle.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bounds_concurrency() {
        let throttle = Arc::new(Throttle::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let (throttle, active, peak) = (throttle.clone(), active.clone(), peak.clone());
                thread::spawn(move || {
                    let _lease = Lease::acquire(Some(throttle));
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_suspend_lets_another_holder_in() {
        let throttle = Arc::new(Throttle::new(1));
        let lease = Lease::acquire(Some(throttle.clone()));

        // With the only permit lent out, a second lease can be taken and
        // dropped from inside the suspended section.
        let inner = lease.suspend(|| {
            let other = thread::spawn({
                let throttle = throttle.clone();
                move || drop(Lease::acquire(Some(throttle)))
            });
            other.join().is_ok()
        });

        assert!(inner);
        assert!(lease.held.get());
        drop(lease);
        assert_eq!(*throttle.free.lock().unwrap(), 1);
    }

    #[test]
    fn test_unbounded_lease() {
        let lease = Lease::acquire(None);
        assert_eq!(lease.suspend(|| 7), 7);
    }
}
