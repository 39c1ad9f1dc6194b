//! RAII guard deferring `SIGINT` while the cluster parent blocks in its
//! wait-any reap loop (§5, §9 "Scoped resource acquisition"). Installs a
//! no-op handler on construction and restores the previous disposition on
//! drop, so every exit path -- including panics and early returns --
//! restores the original handler.

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn record_interrupt(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub struct SigintGuard {
        previous: libc::sighandler_t,
    }

    impl SigintGuard {
        pub fn new() -> Self {
            INTERRUPTED.store(false, Ordering::SeqCst);
            // SAFETY: `record_interrupt` is an `extern "C" fn(c_int)`, the
            // required signature for a signal handler, and installing it is
            // the documented use of `libc::signal`.
            let previous = unsafe { libc::signal(libc::SIGINT, record_interrupt as libc::sighandler_t) };
            SigintGuard { previous }
        }

        pub fn interrupted(&self) -> bool {
            INTERRUPTED.load(Ordering::SeqCst)
        }
    }

    impl Drop for SigintGuard {
        fn drop(&mut self) {
            // SAFETY: restoring whatever disposition `libc::signal` reported
            // as previously installed is always valid for `SIGINT`.
            unsafe {
                libc::signal(libc::SIGINT, self.previous);
            }
        }
    }

    impl Default for SigintGuard {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub struct SigintGuard;

    impl SigintGuard {
        pub fn new() -> Self {
            SigintGuard
        }

        pub fn interrupted(&self) -> bool {
            false
        }
    }

    impl Default for SigintGuard {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use imp::SigintGuard;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_can_be_constructed_and_dropped() {
        let guard = SigintGuard::new();
        assert!(!guard.interrupted());
        drop(guard);
    }
}
