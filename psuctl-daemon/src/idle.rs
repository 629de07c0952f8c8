//! Resettable single-shot idle timer.
//!
//! A generation counter under one mutex makes stop/reset/start atomic
//! with respect to each other, and guarantees that a stopped timer's
//! callback can never fire afterwards. A callback that is already
//! running is deliberately not interrupted; the heater-wait activity
//! flag covers that window.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Callback factory: produces a fresh future for every (re)arm.
pub type FireFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Slot {
    generation: u64,
    duration: Duration,
    fire: Option<FireFn>,
    task: Option<JoinHandle<()>>,
}

pub struct IdleTimer {
    slot: Arc<Mutex<Slot>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                generation: 0,
                duration: Duration::ZERO,
                fire: None,
                task: None,
            })),
        }
    }

    /// Cancels any pending deadline and arms a fresh one.
    pub fn start(&self, duration: Duration, fire: FireFn) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.duration = duration;
        slot.fire = Some(fire);
        let task = Self::arm(Arc::clone(&self.slot), slot.generation, duration);
        slot.task = Some(task);
    }

    /// Cancels the pending deadline; the callback is guaranteed not to
    /// fire afterwards.
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.fire = None;
    }

    /// Re-arms the timer. A timer that already fired re-arms from its
    /// stored callback, exactly like a fresh `start`. Returns false when
    /// there is nothing to re-arm (never started, or stopped).
    pub fn reset(&self, new_duration: Option<Duration>) -> bool {
        let mut slot = self.slot.lock();
        if slot.fire.is_none() {
            return false;
        }
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if let Some(duration) = new_duration {
            slot.duration = duration;
        }
        let task = Self::arm(Arc::clone(&self.slot), slot.generation, slot.duration);
        slot.task = Some(task);
        true
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().task.is_some()
    }

    fn arm(slot: Arc<Mutex<Slot>>, generation: u64, duration: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let fire = {
                let mut slot = slot.lock();
                if slot.generation != generation {
                    return;
                }
                // marque le timer comme déclenché avant d'exécuter le callback
                slot.task = None;
                slot.fire.clone()
            };
            if let Some(fire) = fire {
                fire().await;
            }
        })
    }
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fire(count: Arc<AtomicUsize>) -> FireFn {
        Arc::new(move || {
            let count = Arc::clone(&count);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let timer = IdleTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(60), counting_fire(Arc::clone(&count)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_fire() {
        let timer = IdleTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(60), counting_fire(Arc::clone(&count)));
        timer.stop();

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_the_deadline() {
        let timer = IdleTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(100), counting_fire(Arc::clone(&count)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(timer.reset(None));

        // la deadline d'origine est dépassée mais pas la nouvelle
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_fire_behaves_like_start() {
        let timer = IdleTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(10), counting_fire(Arc::clone(&count)));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());

        assert!(timer.reset(None));
        assert!(timer.is_running());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_without_anything_to_rearm_is_a_noop() {
        let timer = IdleTimer::new();
        assert!(!timer.reset(None));

        let count = Arc::new(AtomicUsize::new(0));
        timer.start(Duration::from_secs(10), counting_fire(Arc::clone(&count)));
        timer.stop();
        assert!(!timer.reset(None));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
