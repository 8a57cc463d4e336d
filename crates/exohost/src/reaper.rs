//! # Exit hooks
//!
//! Every live backend registers a synchronous, best-effort teardown here, so isolated runtimes
//! do not outlive the host. Hooks run when [`run_exit_hooks`] is called (the signal hook from
//! [`install_signal_hook`] does so on Ctrl-C or SIGTERM) and when a backend is dropped without
//! being terminated. A process worker additionally dies with the host on Linux, where it is
//! spawned with a parent-death signal.
//!
//! A hook runs at most once no matter how many of these paths reach it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

type Action = Box<dyn Fn() + Send + Sync>;

pub struct ExitHook {
    label: String,
    done: AtomicBool,
    action: Action,
}

impl ExitHook {
    /// Runs the teardown unless it already ran or the hook was disarmed.
    pub fn fire(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(backend = %self.label, "tearing down worker runtime");
        (self.action)();
    }

    /// Marks the runtime as already gone; the teardown will never run.
    pub fn disarm(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_spent(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// A set of exit hooks. The process-wide one is behind [`register`] and [`run_exit_hooks`].
#[derive(Default)]
pub struct Registry {
    hooks: Mutex<Vec<Weak<ExitHook>>>,
}

impl Registry {
    /// Registers a teardown. The registry only holds a weak reference; the backend owns the hook.
    pub fn register(&self, label: impl Into<String>, action: impl Fn() + Send + Sync + 'static) -> Arc<ExitHook> {
        let hook = Arc::new(ExitHook {
            label: label.into(),
            done: AtomicBool::new(false),
            action: Box::new(action),
        });
        let mut hooks = self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.retain(|weak| weak.strong_count() > 0);
        hooks.push(Arc::downgrade(&hook));
        hook
    }

    /// Fires every registered hook that has not run yet. Returns how many ran.
    pub fn run(&self) -> usize {
        let live: Vec<Arc<ExitHook>> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let live = hooks.iter().filter_map(Weak::upgrade).collect();
            hooks.clear();
            live
        };

        let mut fired = 0;
        for hook in live {
            if !hook.is_spent() {
                hook.fire();
                fired += 1;
            }
        }
        fired
    }
}

fn global() -> &'static Registry {
    static HOOKS: OnceLock<Registry> = OnceLock::new();
    HOOKS.get_or_init(Registry::default)
}

pub fn register(label: impl Into<String>, action: impl Fn() + Send + Sync + 'static) -> Arc<ExitHook> {
    global().register(label, action)
}

/// Fires every live backend's teardown.
pub fn run_exit_hooks() -> usize {
    global().run()
}

/// Tears down every live backend and exits when the process receives Ctrl-C or SIGTERM.
///
/// Every backend installs this on start. Outside a tokio runtime, and on any call after the
/// first, it does nothing.
pub fn install_signal_hook() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    runtime.spawn(async {
        if let Some(code) = interrupted().await {
            let fired = run_exit_hooks();
            tracing::warn!(fired, code, "interrupted, worker runtimes torn down");
            std::process::exit(code);
        }
    });
}

/// The exit status to leave with once a termination signal arrives.
#[cfg(unix)]
async fn interrupted() -> Option<i32> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            result = tokio::signal::ctrl_c() => result.ok().map(|()| 130),
            received = sigterm.recv() => received.map(|()| 143),
        },
        Err(e) => {
            tracing::warn!(error = %e, "cannot watch for SIGTERM");
            tokio::signal::ctrl_c().await.ok().map(|()| 130)
        }
    }
}

#[cfg(not(unix))]
async fn interrupted() -> Option<i32> {
    tokio::signal::ctrl_c().await.ok().map(|()| 130)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(registry: &Registry) -> (Arc<ExitHook>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let hook = registry.register("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    #[test]
    fn test_hooks_fire_once() {
        let registry = Registry::default();
        let (hook, count) = counting(&registry);

        hook.fire();
        hook.fire();
        assert_eq!(registry.run(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_fires_live_hooks() {
        let registry = Registry::default();
        let (_first, first) = counting(&registry);
        let (_second, second) = counting(&registry);

        assert_eq!(registry.run(), 2);
        assert_eq!(registry.run(), 0);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarmed_and_dropped_hooks_never_fire() {
        let registry = Registry::default();
        let (disarmed, disarmed_count) = counting(&registry);
        let (dropped, dropped_count) = counting(&registry);

        disarmed.disarm();
        drop(dropped);
        assert_eq!(registry.run(), 0);
        assert_eq!(disarmed_count.load(Ordering::SeqCst), 0);
        assert_eq!(dropped_count.load(Ordering::SeqCst), 0);
    }
}
