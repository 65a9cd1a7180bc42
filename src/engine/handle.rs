use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::ResultMap;
use crate::engine::Diagnostics;
use crate::error::BraidError;
use crate::scope::Table;

/// Lifecycle of a task. Transitions only ever move forward:
/// `Pending → Running → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

struct State {
    status: Status,
    outcome: Option<Result<ResultMap, BraidError>>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    changed: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    children: Mutex<Vec<TaskHandle>>,
    table: Mutex<Option<Arc<Table>>>,
    diagnostics: Arc<Diagnostics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Handle to a unit of work running somewhere in the braid.
///
/// Cloning is cheap; all clones observe the same task. A task that owns
/// parallel branches keeps their handles, and its own thread joins them
/// before the task settles, so [`wait`](Self::wait) on the root joins the
/// whole tree.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Inner>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<String>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    status: Status::Pending,
                    outcome: None,
                }),
                changed: Condvar::new(),
                thread: Mutex::new(None),
                children: Mutex::new(Vec::new()),
                table: Mutex::new(None),
                diagnostics,
            }),
        }
    }

    /// A handle that is already settled, for work that needs no thread.
    pub(crate) fn finished(
        name: impl Into<String>,
        outcome: Result<ResultMap, BraidError>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let handle = Self::new(name, diagnostics);
        handle.settle(outcome);
        handle
    }

    /// Path of the task inside the braid, `""` for the root.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> Status {
        lock(&self.inner.state).status
    }

    /// Whether the outcome is available. A group may report
    /// [`Status::Failed`] before it is finished, while its remaining
    /// branches run to completion.
    pub fn is_finished(&self) -> bool {
        lock(&self.inner.state).outcome.is_some()
    }

    /// Handles of the branches this task spawned, in declared order.
    pub fn children(&self) -> Vec<TaskHandle> {
        lock(&self.inner.children).clone()
    }

    /// Timing of every task of the run this handle belongs to.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Blocks until the task and everything it spawned has finished.
    ///
    /// On failure the error is the first one in declared order, wrapped in
    /// [`BraidError::Branch`] for each group it passed through. Results of
    /// branches that did complete stay available through
    /// [`partial`](Self::partial).
    pub fn wait(&self) -> Result<ResultMap, BraidError> {
        let outcome = {
            let mut state = lock(&self.inner.state);
            loop {
                if let Some(outcome) = &state.outcome {
                    break outcome.clone();
                }
                state = self
                    .inner
                    .changed
                    .wait(state)
                    .unwrap_or_else(|poison| poison.into_inner());
            }
        };

        self.join_thread();
        outcome
    }

    /// Like [`wait`](Self::wait), giving up with [`BraidError::WaitTimeout`]
    /// after `timeout`. The task keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ResultMap, BraidError> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = lock(&self.inner.state);
            while state.outcome.is_none() {
                let now = Instant::now();
                if now >= deadline {
                    return Err(BraidError::WaitTimeout {
                        name: self.inner.name.clone(),
                        timeout,
                    });
                }
                state = self
                    .inner
                    .changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|poison| poison.into_inner())
                    .0;
            }
        }

        self.wait()
    }

    /// Whatever has completed so far: the full result once the task
    /// succeeded, otherwise the completed branches of the most recent group
    /// this task ran.
    pub fn partial(&self) -> ResultMap {
        if let Some(Ok(map)) = &lock(&self.inner.state).outcome {
            return map.clone();
        }

        match &*lock(&self.inner.table) {
            Some(table) => table.partial(),
            None => ResultMap::new(),
        }
    }

    fn join_thread(&self) {
        let thread = lock(&self.inner.thread).take();
        if let Some(thread) = thread {
            // The task body catches its own panics, joining only reaps it.
            let _ = thread.join();
        }
    }

    pub(crate) fn attach_thread(&self, thread: JoinHandle<()>) {
        *lock(&self.inner.thread) = Some(thread);
    }

    pub(crate) fn attach_table(&self, table: Arc<Table>) {
        *lock(&self.inner.table) = Some(table);
    }

    pub(crate) fn adopt(&self, child: TaskHandle) {
        lock(&self.inner.children).push(child);
    }

    pub(crate) fn start(&self) {
        let mut state = lock(&self.inner.state);
        if state.status == Status::Pending {
            state.status = Status::Running;
            drop(state);
            self.inner.changed.notify_all();
        }
    }

    /// Flags the task as failed ahead of its outcome.
    pub(crate) fn mark_failed(&self) {
        let mut state = lock(&self.inner.state);
        if !state.status.is_terminal() {
            state.status = Status::Failed;
            drop(state);
            self.inner.changed.notify_all();
        }
    }

    pub(crate) fn settle(&self, outcome: Result<ResultMap, BraidError>) {
        let mut state = lock(&self.inner.state);
        if state.outcome.is_some() {
            return;
        }

        state.status = match (&outcome, state.status) {
            (_, Status::Failed) | (Err(_), _) => Status::Failed,
            (Ok(_), _) => Status::Completed,
        };
        state.outcome = Some(outcome);
        drop(state);

        self.inner.changed.notify_all();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
