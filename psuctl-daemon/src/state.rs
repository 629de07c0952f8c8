use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Indicateurs runtime du PSU, partagés entre la poll loop, l'observateur
/// du flux de commandes et les callbacks de timers.
///
/// `is_on` est la croyance courante ; elle n'est écrite que par la poll
/// loop. `internal_tracked` est la valeur utilisée par le sensing INTERNAL.
#[derive(Debug, Default)]
pub struct PsuState {
    is_on: AtomicBool,
    internal_tracked: AtomicBool,
    wait_for_heaters: AtomicBool,
    skip_idle_reset: AtomicBool,
}

impl PsuState {
    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::SeqCst)
    }

    pub fn set_is_on(&self, v: bool) {
        self.is_on.store(v, Ordering::SeqCst);
    }

    pub fn internal_tracked(&self) -> bool {
        self.internal_tracked.load(Ordering::SeqCst)
    }

    pub fn set_internal_tracked(&self, v: bool) {
        self.internal_tracked.store(v, Ordering::SeqCst);
    }

    pub fn wait_for_heaters(&self) -> bool {
        self.wait_for_heaters.load(Ordering::SeqCst)
    }

    pub fn set_wait_for_heaters(&self, v: bool) {
        self.wait_for_heaters.store(v, Ordering::SeqCst);
    }

    pub fn skip_idle_reset(&self) -> bool {
        self.skip_idle_reset.load(Ordering::SeqCst)
    }

    pub fn set_skip_idle_reset(&self, v: bool) {
        self.skip_idle_reset.store(v, Ordering::SeqCst);
    }
}
