//! A single-slot future resolved across mailboxes.
//!
//! An [`AsyncProvider`] is the write side; the matching [`AsyncValue`] is
//! the read side. An actor observes the value with a continuation and a
//! target mailbox; when the provider resolves, the continuation is
//! enqueued there (or run inline when no mailbox is given), so the
//! waiting actor's mailbox is never blocked. Dropping an unresolved
//! provider delivers `None`, which waiters treat as a disconnect.

use std::sync::{Arc, Mutex};

use crate::mailbox::Mailbox;

type Continuation<T> = Box<dyn FnOnce(Option<T>) + Send + 'static>;

struct Observer<T> {
    mailbox: Option<Mailbox>,
    run: Continuation<T>,
}

enum Slot<T> {
    /// Not yet resolved; holds the observer once one registers.
    Pending(Option<Observer<T>>),
    /// Resolved before anyone observed; holds the outcome.
    Resolved(Option<T>),
    /// The outcome has been handed to the observer.
    Delivered,
}

/// Creates a connected provider/value pair.
pub fn async_value<T: Send + 'static>() -> (AsyncProvider<T>, AsyncValue<T>) {
    let slot = Arc::new(Mutex::new(Slot::Pending(None)));
    (AsyncProvider { slot: Arc::clone(&slot) }, AsyncValue { slot })
}

/// Write side: resolve with a value, or drop to signal disconnection.
pub struct AsyncProvider<T: Send + 'static> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: Send + 'static> AsyncProvider<T> {
    /// Resolves the value, waking the observer if one is registered.
    pub fn resolve(self, value: T) {
        deliver(&self.slot, Some(value));
    }
}

impl<T: Send + 'static> Drop for AsyncProvider<T> {
    fn drop(&mut self) {
        // Resolution replaces the slot state first, making this a no-op
        // after a normal resolve.
        deliver(&self.slot, None);
    }
}

fn deliver<T: Send + 'static>(slot: &Mutex<Slot<T>>, outcome: Option<T>) {
    let observer = {
        let mut slot = slot.lock().expect("async slot poisoned");
        match std::mem::replace(&mut *slot, Slot::Delivered) {
            Slot::Pending(Some(observer)) => observer,
            Slot::Pending(None) => {
                *slot = Slot::Resolved(outcome);
                return;
            }
            resolved @ (Slot::Resolved(_) | Slot::Delivered) => {
                *slot = resolved;
                return;
            }
        }
    };
    dispatch(observer, outcome);
}

fn dispatch<T: Send + 'static>(observer: Observer<T>, outcome: Option<T>) {
    match observer.mailbox {
        Some(mailbox) => {
            let run = observer.run;
            mailbox.enqueue("async-resolve", move || run(outcome));
        }
        None => (observer.run)(outcome),
    }
}

/// Read side: register a continuation for the eventual outcome.
pub struct AsyncValue<T: Send + 'static> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: Send + 'static> AsyncValue<T> {
    /// Registers the continuation. It runs exactly once with `Some` on
    /// resolve or `None` if the provider is dropped first; on `mailbox`
    /// when one is given, inline otherwise. A value resolved before this
    /// call is delivered immediately.
    pub fn observe(self, mailbox: Option<Mailbox>, run: impl FnOnce(Option<T>) + Send + 'static) {
        let observer = Observer { mailbox, run: Box::new(run) };
        let ready = {
            let mut slot = self.slot.lock().expect("async slot poisoned");
            match std::mem::replace(&mut *slot, Slot::Delivered) {
                Slot::Pending(None) => {
                    *slot = Slot::Pending(Some(observer));
                    return;
                }
                Slot::Resolved(outcome) => outcome,
                Slot::Pending(Some(_)) | Slot::Delivered => {
                    panic!("async value observed twice")
                }
            }
        };
        dispatch(observer, ready);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_for(flag: &AtomicBool) {
        let start = Instant::now();
        while !flag.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5), "continuation never ran");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_resolve_then_observe() {
        let (provider, value) = async_value::<u32>();
        provider.resolve(7);

        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        value.observe(None, move |outcome| {
            assert_eq!(outcome, Some(7));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(seen.load(Ordering::SeqCst), "inline observe should run immediately");
    }

    #[test]
    fn test_observe_then_resolve_on_mailbox() {
        let (provider, value) = async_value::<String>();
        let mailbox = Mailbox::new("observer");

        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        value.observe(Some(mailbox), move |outcome| {
            assert_eq!(outcome.as_deref(), Some("reply"));
            flag.store(true, Ordering::SeqCst);
        });

        provider.resolve("reply".into());
        wait_for(&seen);
    }

    #[test]
    fn test_dropped_provider_delivers_none() {
        let (provider, value) = async_value::<u32>();

        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        value.observe(None, move |outcome| {
            assert_eq!(outcome, None);
            flag.store(true, Ordering::SeqCst);
        });

        drop(provider);
        wait_for(&seen);
    }
}
