//! The lock manager — request intake, the grant engine, the steal
//! protocol, cross-agent wake-ups, query snapshots, and agent cleanup.
//!
//! One manager arbitrates every named lock in the process. All state sits
//! behind a single mutex. Work callbacks run with the mutex released, so
//! user code is free to re-enter `request` and `query`. Settlement of the
//! futures handed out at intake also happens with the mutex released,
//! with one deliberate exception: the steal protocol rejects evicted
//! holders' released futures while still holding it, which is safe
//! because settling is a plain channel send.
//!
//! Thread affinity: the grant engine only ever grants locks, invokes
//! callbacks, and drives work futures for the agent on whose thread it
//! runs. Requests belonging to other agents are observed just long enough
//! to post wake-ups into their own loops.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::agent::{AgentHandle, AgentId};
use crate::error::LockError;
use crate::lock::{
    LockCallback, LockInfo, LockMode, LockOptions, LockTicket, Released, Settlement, Waiting, Work,
};

/// Global held-lock ID counter.
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: OnceLock<Arc<LockManager>> = OnceLock::new();

/// A queued lock request, owned by the pending queue until granted,
/// handed to an if-available miss, or discarded at cleanup.
struct PendingRequest {
    agent: AgentHandle,
    name: String,
    mode: LockMode,
    client_id: String,
    steal: bool,
    if_available: bool,
    callback: LockCallback,
    waiting: oneshot::Sender<Settlement>,
    released: oneshot::Sender<Settlement>,
}

/// A granted lock. The released sender is taken exactly once — either by
/// the settlement continuation or, for stolen locks, by the steal
/// protocol.
struct HeldLock {
    id: u64,
    agent: AgentHandle,
    mode: LockMode,
    client_id: String,
    stolen: bool,
    released: Option<oneshot::Sender<Settlement>>,
}

#[derive(Default)]
struct ManagerState {
    /// name → held locks in grant order.
    held: HashMap<String, Vec<HeldLock>>,
    /// Global FIFO across all agents and names; steal requests sit at the
    /// front.
    pending: VecDeque<PendingRequest>,
    /// Agents with a teardown hook installed.
    agents: HashMap<AgentId, AgentHandle>,
}

impl ManagerState {
    /// Mode compatibility against currently held locks. Per-name queue
    /// ordering is checked separately by the scan.
    fn compatible_with_held(&self, name: &str, mode: LockMode) -> bool {
        match self.held.get(name) {
            None => true,
            Some(holders) => match mode {
                LockMode::Exclusive => holders.is_empty(),
                LockMode::Shared => holders.iter().all(|lock| lock.mode == LockMode::Shared),
            },
        }
    }
}

/// What a scan pass picked out of the pending queue.
enum Claimed {
    /// Grantable now (or a steal).
    Grant(PendingRequest),
    /// An if-available request that cannot be granted; its callback runs
    /// without a grant.
    Miss(PendingRequest),
}

/// Snapshot of held and pending locks visible to one agent.
///
/// `held` lists locks in per-name grant order; the order across names is
/// unspecified. `pending` follows queue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub held: Vec<LockInfo>,
    pub pending: Vec<LockInfo>,
}

/// Process-wide arbiter for named advisory locks.
pub struct LockManager {
    me: Weak<LockManager>,
    state: Mutex<ManagerState>,
}

impl LockManager {
    /// Create a new manager wrapped in `Arc` for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(ManagerState::default()),
        })
    }

    /// The lazily-initialized process-wide manager.
    pub fn global() -> &'static Arc<Self> {
        GLOBAL.get_or_init(Self::shared)
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a lock request for `agent` and run the grant engine.
    ///
    /// Must be called on the requesting agent's thread: a grantable
    /// request has its callback invoked before this returns. The returned
    /// ticket carries the waiting and released futures; the released
    /// future is the one wrappers hand to callers.
    pub fn request(
        &self,
        agent: &AgentHandle,
        name: impl Into<String>,
        client_id: impl Into<String>,
        options: LockOptions,
        callback: impl FnOnce(Option<LockInfo>) -> Work + Send + 'static,
    ) -> LockTicket {
        let name = name.into();
        let client_id = client_id.into();
        let (waiting_tx, waiting_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();

        trace!(name = %name, mode = %options.mode, agent = %agent.id(), "lock requested");
        {
            let mut st = self.lock_state();

            // Install the teardown hook for the agent only once.
            if !st.agents.contains_key(&agent.id()) {
                st.agents.insert(agent.id(), agent.clone());
                let weak = self.me.clone();
                agent.on_teardown(move |id| {
                    if let Some(manager) = weak.upgrade() {
                        manager.cleanup_agent(id);
                    }
                });
            }

            let request = PendingRequest {
                agent: agent.clone(),
                name,
                mode: options.mode,
                client_id,
                steal: options.steal,
                if_available: options.if_available,
                callback: Box::new(callback),
                waiting: waiting_tx,
                released: released_tx,
            };
            // Steal requests get priority by going to the front of the
            // queue.
            if request.steal {
                st.pending.push_front(request);
            } else {
                st.pending.push_back(request);
            }
        }

        // Intake already runs on the requester's thread, so the wake-up is
        // a direct call.
        self.process_queue(agent);

        LockTicket {
            waiting: Waiting(waiting_rx),
            released: Released(released_rx),
        }
    }

    /// Snapshot of held and pending locks belonging to `agent`, taken
    /// under one mutex acquisition.
    pub fn query(&self, agent: &AgentHandle) -> LockSnapshot {
        let st = self.lock_state();
        let mut held = Vec::new();
        for (name, holders) in &st.held {
            for lock in holders {
                if lock.agent.id() == agent.id() {
                    held.push(LockInfo {
                        name: name.clone(),
                        mode: lock.mode,
                        client_id: lock.client_id.clone(),
                    });
                }
            }
        }
        let pending = st
            .pending
            .iter()
            .filter(|request| request.agent.id() == agent.id())
            .map(|request| LockInfo {
                name: request.name.clone(),
                mode: request.mode,
                client_id: request.client_id.clone(),
            })
            .collect();
        LockSnapshot { held, pending }
    }

    /// Run the grant engine for `agent`. Safe to call on an empty queue;
    /// posted wake-ups funnel here.
    ///
    /// Must run on `agent`'s thread: callbacks for granted requests are
    /// invoked inline and work futures are spawned onto the current
    /// runtime.
    pub fn process_queue(&self, agent: &AgentHandle) {
        self.cleanup_stolen(agent.id());

        loop {
            let (claimed, wakes) = self.claim_next(agent);
            for target in &wakes {
                self.wake_agent(target);
            }

            match claimed {
                None => return,
                Some(Claimed::Miss(request)) => {
                    self.finish_if_available_miss(request);
                    return;
                }
                Some(Claimed::Grant(request)) => {
                    if request.steal {
                        self.evict_holders(&request.name, agent);
                    }
                    self.grant(request);
                    // Keep scanning: a run of compatible requests (e.g.
                    // several shared locks) is granted in one pass.
                }
            }
        }
    }

    /// Remove every lock of `agent` that a steal has marked stolen.
    /// Stolen locks of other agents are left for their own passes.
    fn cleanup_stolen(&self, agent_id: AgentId) {
        let mut st = self.lock_state();
        st.held.retain(|_, holders| {
            holders.retain(|lock| !(lock.stolen && lock.agent.id() == agent_id));
            !holders.is_empty()
        });
    }

    /// One scan over the pending queue: pick the first request of
    /// `agent` that is grantable (or an if-available miss), and collect
    /// the other agents whose requests were walked over.
    fn claim_next(&self, agent: &AgentHandle) -> (Option<Claimed>, Vec<AgentHandle>) {
        let mut st = self.lock_state();
        let mut first_seen: HashMap<String, (usize, LockMode)> = HashMap::new();
        let mut woken: HashSet<AgentId> = HashSet::new();
        let mut wakes: Vec<AgentHandle> = Vec::new();
        let mut claimed: Option<(usize, bool)> = None;

        for (idx, request) in st.pending.iter().enumerate() {
            if request.agent.id() != agent.id() && woken.insert(request.agent.id()) {
                wakes.push(request.agent.clone());
            }

            // The first time a name shows up in the walk is its earliest
            // pending request.
            let (first_idx, first_mode) = *first_seen
                .entry(request.name.clone())
                .or_insert((idx, request.mode));

            if request.agent.id() != agent.id() {
                continue;
            }

            // An earlier request for the same name blocks this one unless
            // both are shared. Steal requests bypass ordering and mode
            // compatibility alike.
            let blocked = first_idx != idx
                && (request.mode == LockMode::Exclusive || first_mode == LockMode::Exclusive);
            if request.steal
                || (!blocked && st.compatible_with_held(&request.name, request.mode))
            {
                claimed = Some((idx, false));
                break;
            }
            if request.if_available {
                claimed = Some((idx, true));
                break;
            }
        }

        let claimed = match claimed {
            Some((idx, miss)) => st.pending.remove(idx).map(|request| {
                if miss {
                    Claimed::Miss(request)
                } else {
                    Claimed::Grant(request)
                }
            }),
            None => None,
        };
        (claimed, wakes)
    }

    /// Steal protocol: mark every current holder of `name` stolen, reject
    /// its released future, evict the current agent's stolen locks right
    /// away, and wake the other owners so they clean up on their own
    /// threads.
    fn evict_holders(&self, name: &str, current: &AgentHandle) {
        let mut wakes: Vec<AgentHandle> = Vec::new();
        {
            let mut st = self.lock_state();
            let Some(holders) = st.held.get_mut(name) else {
                return;
            };
            let mut woken: HashSet<AgentId> = HashSet::new();
            for lock in holders.iter_mut() {
                lock.stolen = true;
                if let Some(released) = lock.released.take() {
                    let _ = released.send(Err(LockError::Stolen));
                }
                if lock.agent.id() != current.id() && woken.insert(lock.agent.id()) {
                    wakes.push(lock.agent.clone());
                }
            }
            holders.retain(|lock| lock.agent.id() != current.id());
            if holders.is_empty() {
                st.held.remove(name);
            }
        }
        debug!(name = %name, "existing holders stolen");
        for target in &wakes {
            self.wake_agent(target);
        }
    }

    /// Install the granted lock, invoke the callback, and route its
    /// outcome into the settlement continuation.
    fn grant(&self, request: PendingRequest) {
        let PendingRequest {
            agent: owner,
            name,
            mode,
            client_id,
            callback,
            waiting,
            released,
            ..
        } = request;

        let lock_id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        let info = LockInfo {
            name: name.clone(),
            mode,
            client_id: client_id.clone(),
        };
        {
            let mut st = self.lock_state();
            st.held.entry(name.clone()).or_default().push(HeldLock {
                id: lock_id,
                agent: owner.clone(),
                mode,
                client_id,
                stolen: false,
                released: Some(released),
            });
        }
        debug!(name = %name, mode = %mode, agent = %owner.id(), "lock granted");

        match invoke_callback(callback, Some(info)) {
            Work::Done(outcome) => {
                let _ = waiting.send(outcome.clone());
                self.settle_lock(&name, lock_id, outcome);
                // The caller's scan loop continues; no recursion needed.
            }
            Work::Pending(work) => {
                let Some(manager) = self.me.upgrade() else {
                    return;
                };
                // Supervise the work through its join handle so a panic
                // inside the future still releases the lock.
                let supervised = tokio::spawn(work);
                tokio::spawn(async move {
                    let outcome = match supervised.await {
                        Ok(outcome) => outcome,
                        Err(err) if err.is_panic() => Err(LockError::WorkPanicked {
                            reason: panic_reason(err.into_panic()),
                        }),
                        // Runtime shutting down; teardown cleanup owns the
                        // state.
                        Err(_) => return,
                    };
                    let _ = waiting.send(outcome.clone());
                    manager.settle_lock(&name, lock_id, outcome);
                    manager.process_queue(&owner);
                });
            }
        }
    }

    /// An if-available request that could not be granted: the callback
    /// runs once without a grant and both futures settle with its
    /// outcome. The request never touches the held map and is never
    /// re-queued.
    fn finish_if_available_miss(&self, request: PendingRequest) {
        let PendingRequest {
            name,
            callback,
            waiting,
            released,
            ..
        } = request;
        debug!(name = %name, "lock unavailable, callback runs without a grant");

        match invoke_callback(callback, None) {
            Work::Done(outcome) => {
                let _ = waiting.send(outcome.clone());
                let _ = released.send(outcome);
            }
            Work::Pending(work) => {
                let supervised = tokio::spawn(work);
                tokio::spawn(async move {
                    let outcome = match supervised.await {
                        Ok(outcome) => outcome,
                        Err(err) if err.is_panic() => Err(LockError::WorkPanicked {
                            reason: panic_reason(err.into_panic()),
                        }),
                        Err(_) => return,
                    };
                    let _ = waiting.send(outcome.clone());
                    let _ = released.send(outcome);
                });
            }
        }
    }

    /// Settlement continuation: drop the lock from the held map and
    /// settle its released future — unless the lock was stolen, in which
    /// case the steal protocol already rejected it.
    fn settle_lock(&self, name: &str, lock_id: u64, outcome: Settlement) {
        let removed = {
            let mut st = self.lock_state();
            match st.held.get_mut(name) {
                Some(holders) => {
                    let position = holders.iter().position(|lock| lock.id == lock_id);
                    let removed = position.map(|idx| holders.remove(idx));
                    if holders.is_empty() {
                        st.held.remove(name);
                    }
                    removed
                }
                None => None,
            }
        };
        if let Some(mut lock) = removed {
            if let Some(released) = lock.released.take() {
                debug!(name = %name, "lock released");
                let _ = released.send(outcome);
            }
        }
    }

    /// Discard every held lock and pending request of a torn-down agent,
    /// then wake agents that still have pending requests so they can
    /// advance past the removed entries.
    pub fn cleanup_agent(&self, agent_id: AgentId) {
        let wakes = {
            let mut st = self.lock_state();
            st.held.retain(|_, holders| {
                holders.retain(|lock| lock.agent.id() != agent_id);
                !holders.is_empty()
            });
            st.pending.retain(|request| request.agent.id() != agent_id);
            st.agents.remove(&agent_id);

            let mut woken: HashSet<AgentId> = HashSet::new();
            let mut wakes: Vec<AgentHandle> = Vec::new();
            for request in &st.pending {
                if woken.insert(request.agent.id()) {
                    wakes.push(request.agent.clone());
                }
            }
            wakes
        };
        debug!(agent = %agent_id, "agent cleaned up");
        for target in &wakes {
            self.wake_agent(target);
        }
    }

    /// Post a wake-up that re-enters the grant engine on the target
    /// agent's own thread. Dropped silently when the agent is gone.
    fn wake_agent(&self, target: &AgentHandle) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let handle = target.clone();
        if !target.post(move || manager.process_queue(&handle)) {
            trace!(agent = %target.id(), "wake-up dropped, agent gone");
        }
    }
}

/// Run a work callback, containing panics so nothing unwinds past the
/// grant engine.
fn invoke_callback(callback: LockCallback, grant: Option<LockInfo>) -> Work {
    match std::panic::catch_unwind(AssertUnwindSafe(move || callback(grant))) {
        Ok(work) => work,
        Err(payload) => Work::Done(Err(LockError::WorkPanicked {
            reason: panic_reason(payload),
        })),
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
