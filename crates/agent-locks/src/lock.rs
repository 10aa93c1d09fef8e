//! Lock vocabulary — modes, descriptors, request options, and the
//! settlement futures handed back at intake.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::LockError;

/// The shared mode string, as surfaced to wrappers.
pub const MODE_SHARED: &str = "shared";
/// The exclusive mode string, as surfaced to wrappers.
pub const MODE_EXCLUSIVE: &str = "exclusive";

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Shared access — multiple holders allowed.
    Shared,
    /// Exclusive access — single holder only.
    Exclusive,
}

impl LockMode {
    /// The wire-format mode string.
    pub const fn as_str(self) -> &'static str {
        match self {
            LockMode::Shared => MODE_SHARED,
            LockMode::Exclusive => MODE_EXCLUSIVE,
        }
    }
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Exclusive
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            MODE_SHARED => Ok(LockMode::Shared),
            MODE_EXCLUSIVE => Ok(LockMode::Exclusive),
            other => Err(LockError::InvalidMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// Descriptor for a held or pending lock, passed to work callbacks and
/// returned by query snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Resource name.
    pub name: String,
    /// Lock mode.
    pub mode: LockMode,
    /// Identifier of the requesting client.
    pub client_id: String,
}

/// Options attached to a lock request.
///
/// `steal` and `if_available` are mutually exclusive at the wrapper level;
/// if both are set, steal wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Requested mode (exclusive by default).
    pub mode: LockMode,
    /// Evict current holders and jump the queue.
    pub steal: bool,
    /// Fail fast (callback without a grant) if not immediately grantable.
    pub if_available: bool,
}

impl LockOptions {
    /// Options for an exclusive request.
    pub fn exclusive() -> Self {
        Self {
            mode: LockMode::Exclusive,
            ..Self::default()
        }
    }

    /// Options for a shared request.
    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            ..Self::default()
        }
    }

    /// Request eviction of current holders.
    pub fn steal(mut self) -> Self {
        self.steal = true;
        self
    }

    /// Request fail-fast behaviour when the lock is busy.
    pub fn if_available(mut self) -> Self {
        self.if_available = true;
        self
    }
}

/// Opaque value produced by work callbacks and carried through settlement.
pub type LockValue = serde_json::Value;

/// Outcome of a lock's work: the callback's value, or the error that ends
/// the lock's lifetime.
pub type Settlement = crate::error::Result<LockValue>;

/// Boxed future driving asynchronous lock work on the owning agent.
pub type WorkFuture = Pin<Box<dyn Future<Output = Settlement> + Send>>;

/// What a work callback returned: a finished outcome, or work that keeps
/// the lock held until the future settles.
pub enum Work {
    /// Finished synchronously.
    Done(Settlement),
    /// Continues asynchronously; the lock is released when the future
    /// settles.
    Pending(WorkFuture),
}

impl Work {
    /// Synchronous success with the given value.
    pub fn done(value: impl Into<LockValue>) -> Self {
        Work::Done(Ok(value.into()))
    }

    /// Synchronous failure.
    pub fn fail(error: LockError) -> Self {
        Work::Done(Err(error))
    }

    /// Asynchronous continuation.
    pub fn pending(fut: impl Future<Output = Settlement> + Send + 'static) -> Self {
        Work::Pending(Box::pin(fut))
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Done(outcome) => f.debug_tuple("Done").field(outcome).finish(),
            Work::Pending(_) => f.debug_tuple("Pending").finish(),
        }
    }
}

/// Boxed work callback as stored in the pending queue.
pub type LockCallback = Box<dyn FnOnce(Option<LockInfo>) -> Work + Send>;

/// Future that settles when the request's callback has produced its
/// outcome — immediately for synchronous callbacks and if-available
/// misses, or when the returned work future completes.
///
/// Settles `Err(LockError::AgentGone)` if the owning agent is torn down
/// first.
#[derive(Debug)]
pub struct Waiting(pub(crate) oneshot::Receiver<Settlement>);

/// Future that settles when the lock's full lifetime ends: the callback's
/// eventual value, the error it failed with, or `LockError::Stolen` the
/// moment the lock is stolen.
///
/// Settles `Err(LockError::AgentGone)` if the owning agent is torn down
/// first.
#[derive(Debug)]
pub struct Released(pub(crate) oneshot::Receiver<Settlement>);

impl Future for Waiting {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LockError::AgentGone)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Future for Released {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LockError::AgentGone)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Waiting {
    /// Non-blocking check: `Some` once settled, `None` while outstanding.
    pub fn try_settle(&mut self) -> Option<Settlement> {
        match self.0.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(LockError::AgentGone)),
        }
    }
}

impl Released {
    /// Non-blocking check: `Some` once settled, `None` while outstanding.
    pub fn try_settle(&mut self) -> Option<Settlement> {
        match self.0.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(LockError::AgentGone)),
        }
    }
}

/// The pair of futures produced for every lock request.
#[derive(Debug)]
pub struct LockTicket {
    /// Settles when the callback has produced its outcome.
    pub waiting: Waiting,
    /// Settles when the lock's full lifetime ends.
    pub released: Released,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_round_trips_through_strings() {
        assert_eq!(LockMode::Shared.as_str(), "shared");
        assert_eq!(LockMode::Exclusive.as_str(), "exclusive");
        assert_eq!("shared".parse::<LockMode>().unwrap(), LockMode::Shared);
        assert_eq!(
            "exclusive".parse::<LockMode>().unwrap(),
            LockMode::Exclusive
        );
    }

    #[test]
    fn mode_parse_rejects_unknown_strings() {
        let err = "upgrade".parse::<LockMode>().unwrap_err();
        assert_eq!(
            err,
            LockError::InvalidMode {
                mode: "upgrade".to_string()
            }
        );
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LockMode::Shared).unwrap(), "\"shared\"");
        let mode: LockMode = serde_json::from_str("\"exclusive\"").unwrap();
        assert_eq!(mode, LockMode::Exclusive);
    }

    #[test]
    fn lock_info_uses_camel_case_client_id() {
        let info = LockInfo {
            name: "resource".to_string(),
            mode: LockMode::Exclusive,
            client_id: "client-1".to_string(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value,
            json!({ "name": "resource", "mode": "exclusive", "clientId": "client-1" })
        );
    }

    #[test]
    fn options_default_to_plain_exclusive() {
        let options = LockOptions::default();
        assert_eq!(options.mode, LockMode::Exclusive);
        assert!(!options.steal);
        assert!(!options.if_available);
    }

    #[test]
    fn options_builders_compose() {
        let options = LockOptions::shared().if_available();
        assert_eq!(options.mode, LockMode::Shared);
        assert!(options.if_available);
        let options = LockOptions::exclusive().steal();
        assert!(options.steal);
    }
}
