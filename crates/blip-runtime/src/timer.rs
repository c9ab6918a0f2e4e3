//! Shared monotonic timer service.
//!
//! One background thread sleeps until the earliest deadline and fires the
//! entries that have come due. Callbacks run on the timer thread and are
//! expected to do nothing but dispatch onto a mailbox; user code never
//! runs inline here. Cancel and fire are race-free: for any armed
//! deadline, at most one firing is observed.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

type Callback = Box<dyn Fn() + Send + Sync + 'static>;

enum Entry {
    /// Fire-and-forget closure (used by `Mailbox::enqueue_after`).
    Once(Box<dyn FnOnce() + Send + 'static>),
    /// A re-armable timer; only fires if its generation still matches.
    Armed(Weak<TimerInner>, u64),
}

struct ServiceState {
    entries: BTreeMap<(Instant, u64), Entry>,
    next_seq: u64,
}

struct Service {
    state: Mutex<ServiceState>,
    wakeup: Condvar,
}

impl Service {
    fn shared() -> &'static Service {
        static SHARED: OnceLock<Service> = OnceLock::new();
        static STARTED: OnceLock<()> = OnceLock::new();

        let service = SHARED.get_or_init(|| Service {
            state: Mutex::new(ServiceState { entries: BTreeMap::new(), next_seq: 0 }),
            wakeup: Condvar::new(),
        });
        STARTED.get_or_init(|| {
            thread::Builder::new()
                .name("blip-timer".into())
                .spawn(move || service.run())
                .expect("failed to spawn timer thread");
        });
        service
    }

    fn insert(&self, deadline: Instant, entry: Entry) {
        let mut state = self.state.lock().expect("timer state poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert((deadline, seq), entry);
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut state = self.state.lock().expect("timer state poisoned");
        loop {
            let now = Instant::now();
            // Fire everything due, in deadline order (ties by insertion).
            while let Some((&key, _)) = state.entries.iter().next() {
                if key.0 > now {
                    break;
                }
                let entry = state.entries.remove(&key).expect("entry just observed");
                drop(state);
                match entry {
                    Entry::Once(task) => task(),
                    Entry::Armed(weak, generation) => {
                        if let Some(timer) = weak.upgrade() {
                            timer.fire(generation);
                        }
                    }
                }
                state = self.state.lock().expect("timer state poisoned");
            }

            state = match state.entries.keys().next().map(|&(deadline, _)| deadline) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.wakeup.wait_timeout(state, timeout).expect("timer state poisoned").0
                }
                None => self.wakeup.wait(state).expect("timer state poisoned"),
            };
        }
    }
}

/// Schedules a one-shot closure on the shared timer thread.
pub(crate) fn schedule_once(delay: Duration, task: impl FnOnce() + Send + 'static) {
    Service::shared().insert(Instant::now() + delay, Entry::Once(Box::new(task)));
}

struct Armed {
    deadline: Option<Instant>,
    generation: u64,
}

struct TimerInner {
    callback: Callback,
    armed: Mutex<Armed>,
}

impl TimerInner {
    fn fire(&self, generation: u64) {
        {
            let mut armed = self.armed.lock().expect("timer poisoned");
            if armed.generation != generation || armed.deadline.is_none() {
                return; // Cancelled or re-armed since this entry was queued
            }
            armed.deadline = None;
        }
        (self.callback)();
    }
}

/// A re-armable scheduled callback. The callback is fixed at
/// construction; `fire_after`/`fire_at` arm it, replacing any earlier
/// arming, and `cancel` disarms it.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Creates a disarmed timer with the given callback.
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Timer {
        Timer {
            inner: Arc::new(TimerInner {
                callback: Box::new(callback),
                armed: Mutex::new(Armed { deadline: None, generation: 0 }),
            }),
        }
    }

    /// Arms the timer to fire once, `delay` from now.
    pub fn fire_after(&self, delay: Duration) {
        self.fire_at(Instant::now() + delay);
    }

    /// Arms the timer to fire once at `deadline`.
    pub fn fire_at(&self, deadline: Instant) {
        let generation = {
            let mut armed = self.inner.armed.lock().expect("timer poisoned");
            armed.generation += 1;
            armed.deadline = Some(deadline);
            armed.generation
        };
        Service::shared().insert(deadline, Entry::Armed(Arc::downgrade(&self.inner), generation));
    }

    /// Disarms the timer. A firing already past its generation check may
    /// still run; one that has not will never run.
    pub fn cancel(&self) {
        let mut armed = self.inner.armed.lock().expect("timer poisoned");
        armed.generation += 1;
        armed.deadline = None;
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let armed = self.inner.armed.lock().expect("timer poisoned");
        f.debug_struct("Timer").field("armed", &armed.deadline.is_some()).finish()
    }
}
