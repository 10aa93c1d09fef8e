//! # Agent Locks
//!
//! Advisory, mode-qualified resource locking coordinated across
//! cooperating agents — isolated execution contexts, each with its own
//! single-threaded event loop.
//!
//! ## Services
//!
//! - **Agent** — agent identities, the wake-up/teardown host contract,
//!   and a dedicated-thread worker runtime
//! - **Lock** — modes, lock descriptors, request options, and the
//!   waiting/released settlement futures
//! - **Manager** — the process-wide arbiter: request intake, the grant
//!   engine, the steal protocol, query snapshots, and agent cleanup
//!
//! A client names a resource, picks a mode, and supplies a work callback;
//! the manager grants the lock when mode compatibility and per-name FIFO
//! ordering allow, runs the callback while the lock is held, and releases
//! it when the callback's outcome settles. Steal requests evict current
//! holders and jump the queue; if-available requests fail fast instead of
//! waiting.

#![forbid(unsafe_code)]

pub mod agent;
pub mod error;
pub mod lock;
pub mod manager;

pub use agent::{mailbox, Agent, AgentHandle, AgentId, AgentMailbox};
pub use error::{LockError, Result, LOCK_STOLEN};
pub use lock::{
    LockCallback, LockInfo, LockMode, LockOptions, LockTicket, LockValue, Released, Settlement,
    Waiting, Work, WorkFuture, MODE_EXCLUSIVE, MODE_SHARED,
};
pub use manager::{LockManager, LockSnapshot};
