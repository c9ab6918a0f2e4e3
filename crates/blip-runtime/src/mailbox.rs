//! Serialized task queues drained by a shared worker pool.
//!
//! A [`Mailbox`] executes its tasks strictly one at a time, in FIFO order
//! for immediate enqueues. Tasks enqueued with a delay run no earlier
//! than their deadline and, among equal deadlines, in enqueue order;
//! ordering between immediate and delayed tasks is not defined. A task
//! may enqueue onto its own mailbox; the new task is appended to the
//! tail, never run inline.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, trace};

use crate::manifest::Manifest;
use crate::timer;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide worker pool. Ready mailboxes are pushed onto a channel;
/// each worker pops one and performs a single task from it, so a mailbox
/// is never on two workers at once.
struct Scheduler {
    sender: Sender<Arc<MailboxInner>>,
}

impl Scheduler {
    fn shared() -> &'static Scheduler {
        static SHARED: OnceLock<Scheduler> = OnceLock::new();
        SHARED.get_or_init(|| {
            let (sender, receiver) = unbounded::<Arc<MailboxInner>>();
            let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(2).max(2);
            trace!(workers, "starting mailbox scheduler");
            for id in 0..workers {
                let receiver: Receiver<Arc<MailboxInner>> = receiver.clone();
                thread::Builder::new()
                    .name(format!("blip-worker-{}", id))
                    .spawn(move || {
                        while let Ok(mailbox) = receiver.recv() {
                            mailbox.perform_next();
                        }
                    })
                    .expect("failed to spawn mailbox worker");
            }
            Scheduler { sender }
        })
    }

    fn submit(&self, mailbox: Arc<MailboxInner>) {
        // Workers live for the process, so the channel never closes.
        let _ = self.sender.send(mailbox);
    }
}

struct Queued {
    name: &'static str,
    task: Task,
}

struct State {
    queue: VecDeque<Queued>,
    // True while the mailbox is on the scheduler channel or a worker is
    // mid-task; guarantees single-threaded execution.
    scheduled: bool,
}

pub(crate) struct MailboxInner {
    name: String,
    state: Mutex<State>,
    manifest: Mutex<Manifest>,
}

impl MailboxInner {
    fn push(self: &Arc<Self>, entry: Queued) {
        let mut state = self.state.lock().expect("mailbox state poisoned");
        state.queue.push_back(entry);
        if !state.scheduled {
            state.scheduled = true;
            drop(state);
            Scheduler::shared().submit(Arc::clone(self));
        }
    }

    fn perform_next(self: &Arc<Self>) {
        let entry = {
            let mut state = self.state.lock().expect("mailbox state poisoned");
            debug_assert!(state.scheduled);
            state.queue.pop_front()
        };
        if let Some(entry) = entry {
            self.manifest.lock().expect("manifest poisoned").add_execution(entry.name);
            if catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                let history = self.manifest.lock().expect("manifest poisoned").dump();
                error!(
                    mailbox = %self.name,
                    task = entry.name,
                    "task panicked; mailbox continues\n{}",
                    history
                );
            }
        }

        let mut state = self.state.lock().expect("mailbox state poisoned");
        if state.queue.is_empty() {
            state.scheduled = false;
        } else {
            drop(state);
            Scheduler::shared().submit(Arc::clone(self));
        }
    }
}

/// Handle to a serialized FIFO task queue. Clones share the queue.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    /// Creates a mailbox. The name appears in diagnostics only.
    pub fn new(name: impl Into<String>) -> Mailbox {
        Mailbox {
            inner: Arc::new(MailboxInner {
                name: name.into(),
                state: Mutex::new(State { queue: VecDeque::new(), scheduled: false }),
                manifest: Mutex::new(Manifest::new()),
            }),
        }
    }

    /// Appends a task to the queue. Tasks enqueued this way run in strict
    /// FIFO order relative to each other.
    pub fn enqueue(&self, name: &'static str, task: impl FnOnce() + Send + 'static) {
        self.inner.manifest.lock().expect("manifest poisoned").add_enqueue(name, None);
        self.inner.push(Queued { name, task: Box::new(task) });
    }

    /// Appends a task no earlier than `delay` from now. Delayed tasks
    /// with equal deadlines run in enqueue order among themselves.
    pub fn enqueue_after(&self, delay: Duration, name: &'static str, task: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            return self.enqueue(name, task);
        }
        self.inner.manifest.lock().expect("manifest poisoned").add_enqueue(name, Some(delay));
        let inner = Arc::clone(&self.inner);
        timer::schedule_once(delay, move || {
            inner.push(Queued { name, task: Box::new(task) });
        });
    }

    /// The diagnostic name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("name", &self.inner.name).finish()
    }
}
