// SPDX-License-Identifier: MPL-2.0

//! The background worker.
//!
//! One thread owns a FIFO of deferred tasks: error-path recovery, operator
//! flushes and everything else that may block or allocate. The same thread
//! doubles as the autosave timer by waiting on the queue with a timeout and
//! running a tick closure whenever it fires. The hot path never runs here;
//! it only enqueues.

use std::{collections::VecDeque, time::Duration};

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    os::{spawn, Condvar, CvarMutex, JoinHandle, Mutex},
    prelude::*,
};

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueInner {
    tasks: CvarMutex<VecDeque<Task>>,
    cvar: Condvar,
    shutdown: AtomicBool,
}

/// A single-threaded task queue with an optional periodic tick.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Starts the worker thread.
    ///
    /// With a `tick` interval, `on_tick` runs whenever the queue has been
    /// idle that long; without one the worker only ever runs tasks.
    pub fn start(tick: Option<Duration>, on_tick: Box<dyn Fn() + Send>) -> Self {
        let inner = Arc::new(QueueInner {
            tasks: CvarMutex::new(VecDeque::new()),
            cvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker = {
            let inner = inner.clone();
            spawn(move || Self::run(&inner, tick, on_tick))
        };
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn run(inner: &QueueInner, tick: Option<Duration>, on_tick: Box<dyn Fn() + Send>) {
        loop {
            let task = {
                let mut tasks = inner.tasks.lock().unwrap();
                loop {
                    if let Some(task) = tasks.pop_front() {
                        break Some(task);
                    }
                    if inner.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    match tick {
                        Some(period) => {
                            let (guard, timed_out) =
                                inner.cvar.wait_timeout(tasks, period).unwrap();
                            tasks = guard;
                            if timed_out {
                                drop(tasks);
                                on_tick();
                                tasks = inner.tasks.lock().unwrap();
                            }
                        }
                        None => {
                            tasks = inner.cvar.wait(tasks).unwrap();
                        }
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    /// Enqueues a task.
    ///
    /// After shutdown the task runs on the caller instead, so deferred
    /// completions are never lost.
    pub fn submit(&self, task: Task) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            task();
            return;
        }
        self.inner.tasks.lock().unwrap().push_back(task);
        self.inner.cvar.notify_one();
    }

    /// Stops the worker after it drains every queued task.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cvar.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
