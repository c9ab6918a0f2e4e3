//! A bounded record of a mailbox's recent enqueue and execution calls,
//! dumped when a task panics to show what led up to the failure.

use std::collections::VecDeque;
use std::fmt::Write;
use std::time::{Duration, Instant};

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug)]
struct Entry {
    elapsed: Duration,
    name: &'static str,
    delay: Option<Duration>,
}

/// Rolling history of what a mailbox was asked to do and what it ran.
#[derive(Debug)]
pub struct Manifest {
    start: Instant,
    limit: usize,
    enqueues: VecDeque<Entry>,
    executions: VecDeque<Entry>,
    truncated_enqueues: usize,
    truncated_executions: usize,
}

impl Manifest {
    /// Creates an empty manifest holding roughly 100 entries per list.
    pub fn new() -> Manifest {
        Manifest {
            start: Instant::now(),
            limit: DEFAULT_LIMIT,
            enqueues: VecDeque::new(),
            executions: VecDeque::new(),
            truncated_enqueues: 0,
            truncated_executions: 0,
        }
    }

    /// Records a call to enqueue, with the delay if one was requested.
    pub fn add_enqueue(&mut self, name: &'static str, delay: Option<Duration>) {
        let entry = Entry { elapsed: self.start.elapsed(), name, delay };
        self.enqueues.push_back(entry);
        while self.enqueues.len() > self.limit {
            self.enqueues.pop_front();
            self.truncated_enqueues += 1;
        }
    }

    /// Records the execution of a previously enqueued task.
    pub fn add_execution(&mut self, name: &'static str) {
        let entry = Entry { elapsed: self.start.elapsed(), name, delay: None };
        self.executions.push_back(entry);
        while self.executions.len() > self.limit {
            self.executions.pop_front();
            self.truncated_executions += 1;
        }
    }

    /// Renders the history for inclusion in a diagnostic log line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "List of enqueue calls:");
        if self.truncated_enqueues > 0 {
            let _ = writeln!(out, "\t...{} truncated entries...", self.truncated_enqueues);
        }
        for entry in &self.enqueues {
            Self::write_entry(&mut out, entry);
        }
        let _ = writeln!(out, "Resulting execution calls:");
        if self.truncated_executions > 0 {
            let _ = writeln!(out, "\t...{} truncated entries...", self.truncated_executions);
        }
        for entry in &self.executions {
            Self::write_entry(&mut out, entry);
        }
        out
    }

    fn write_entry(out: &mut String, entry: &Entry) {
        let _ = match entry.delay {
            Some(delay) => writeln!(
                out,
                "\t[{} ms] {} [after {} ms]",
                entry.elapsed.as_millis(),
                entry.name,
                delay.as_millis()
            ),
            None => writeln!(out, "\t[{} ms] {}", entry.elapsed.as_millis(), entry.name),
        };
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}
