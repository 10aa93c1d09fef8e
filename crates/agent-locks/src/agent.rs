//! Agents — isolated execution contexts with their own single-threaded
//! event loops.
//!
//! The lock manager only needs two things from an agent: a way to post a
//! task onto its loop (the wake-up primitive) and a hook that fires when
//! the agent is torn down. [`AgentHandle`] packages both. Hosts that drive
//! their own loop pair a handle with an [`AgentMailbox`] via [`mailbox`];
//! [`Agent`] is the batteries-included worker that runs a mailbox on a
//! dedicated OS thread.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::error;

/// Global agent ID counter.
static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(u64);

impl AgentId {
    fn next() -> Self {
        Self(NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type AgentTask = Box<dyn FnOnce() + Send>;
type TeardownHook = Box<dyn FnOnce(AgentId) + Send>;

enum AgentCommand {
    /// Execute a task on the agent's thread.
    Run(AgentTask),
    /// Stop the loop and fire teardown hooks.
    Shutdown,
}

/// Cloneable handle used to post work into an agent and to observe its
/// teardown.
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    tx: mpsc::UnboundedSender<AgentCommand>,
    hooks: Arc<Mutex<Vec<TeardownHook>>>,
}

impl AgentHandle {
    /// This agent's identifier.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Post a task to run on the agent's thread, FIFO with respect to
    /// other posts. Returns `false` when the agent is gone; the task is
    /// silently dropped in that case.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(AgentCommand::Run(Box::new(task))).is_ok()
    }

    /// Register a hook that fires when the agent's loop exits.
    pub fn on_teardown(&self, hook: impl FnOnce(AgentId) + Send + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    fn shutdown(&self) {
        let _ = self.tx.send(AgentCommand::Shutdown);
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle").field("id", &self.id).finish()
    }
}

/// Receiving side of an agent: the task queue and teardown hooks.
///
/// Hosts embedding the lock service into their own event loop drive this
/// directly; [`Agent`] drives it on a dedicated thread.
pub struct AgentMailbox {
    id: AgentId,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
    hooks: Arc<Mutex<Vec<TeardownHook>>>,
}

/// Create a handle/mailbox pair for a new agent.
pub fn mailbox() -> (AgentHandle, AgentMailbox) {
    let id = AgentId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let hooks = Arc::new(Mutex::new(Vec::new()));
    (
        AgentHandle {
            id,
            tx,
            hooks: hooks.clone(),
        },
        AgentMailbox { id, rx, hooks },
    )
}

impl AgentMailbox {
    /// Drive the mailbox until shutdown (or until every handle is
    /// dropped), then fire teardown hooks. Panics in posted tasks are
    /// contained so the loop keeps running.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                AgentCommand::Run(task) => run_contained(self.id, task),
                AgentCommand::Shutdown => break,
            }
        }
        self.fire_teardown();
    }

    /// Execute every task already queued, without waiting for more.
    /// Returns the number of tasks run.
    pub fn run_ready(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(command) = self.rx.try_recv() {
            match command {
                AgentCommand::Run(task) => {
                    run_contained(self.id, task);
                    ran += 1;
                }
                AgentCommand::Shutdown => break,
            }
        }
        ran
    }

    /// Fire teardown hooks, consuming the mailbox. Called by [`run`] on
    /// exit; hosts with their own loop call it when the agent dies.
    ///
    /// [`run`]: AgentMailbox::run
    pub fn fire_teardown(self) {
        let hooks: Vec<TeardownHook> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for hook in hooks {
            hook(self.id);
        }
    }
}

fn run_contained(id: AgentId, task: AgentTask) {
    if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(agent = %id, "posted task panicked");
    }
}

/// An agent running on a dedicated OS thread with a current-thread tokio
/// runtime.
///
/// Dropping the agent performs a best-effort shutdown and joins the
/// thread; queued tasks that have not run yet are discarded.
pub struct Agent {
    handle: AgentHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Agent {
    /// Spawn a new agent thread.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (handle, mailbox) = mailbox();
        let thread = thread::Builder::new()
            .name(format!("agent-{}-{}", name, handle.id()))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build agent runtime");
                rt.block_on(mailbox.run());
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// This agent's identifier.
    pub fn id(&self) -> AgentId {
        self.handle.id()
    }

    /// A handle for posting work into this agent.
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Run a closure on the agent's thread and return its result, or
    /// `None` if the agent is gone.
    pub async fn run<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.handle.post(move || {
            let _ = tx.send(f());
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Stop the agent and join its thread. Teardown hooks fire before
    /// this returns.
    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn run_returns_closure_result() {
        let agent = Agent::spawn("test").unwrap();
        assert_eq!(agent.run(|| 2 + 2).await, Some(4));
        agent.shutdown();
    }

    #[test]
    fn post_after_shutdown_is_dropped() {
        let agent = Agent::spawn("test").unwrap();
        let handle = agent.handle();
        agent.shutdown();
        assert!(!handle.post(|| {}));
    }

    #[test]
    fn teardown_hooks_fire_on_shutdown() {
        let agent = Agent::spawn("test").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let id = agent.id();
        agent.handle().on_teardown(move |hook_id| {
            assert_eq!(hook_id, id);
            fired_clone.store(true, Ordering::Release);
        });
        agent.shutdown();
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn mailbox_runs_ready_tasks_in_post_order() {
        let (handle, mut mb) = mailbox();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            assert!(handle.post(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(mb.run_ready(), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(mb.run_ready(), 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_agent() {
        let agent = Agent::spawn("test").unwrap();
        agent.handle().post(|| panic!("boom"));
        assert_eq!(agent.run(|| 1).await, Some(1));
        agent.shutdown();
    }

    #[test]
    fn agent_ids_are_unique() {
        let (a, _mba) = mailbox();
        let (b, _mbb) = mailbox();
        assert_ne!(a.id(), b.id());
    }
}
