use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const COMPLETED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// Explicit abort from the client.
    ClientAbort,
    /// The response stream was dropped or stopped accepting frames.
    TransportClosed,
    Shutdown,
}

/// The single cancellation primitive of a turn.
///
/// Clones share one token. The first `cancel` wins; later calls, and any call
/// after `complete`, return false and have no effect.
#[derive(Debug, Clone)]
pub struct CancellationCoordinator {
    token: CancellationToken,
    state: Arc<AtomicU8>,
    source: Arc<OnceLock<CancelSource>>,
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(ACTIVE)),
            source: Arc::new(OnceLock::new()),
        }
    }

    pub fn cancel(&self, source: CancelSource) -> bool {
        if self
            .state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.source.set(source);
        tracing::debug!("Turn cancellation signalled ({:?})", source);
        self.token.cancel();
        true
    }

    /// Marks the turn as past its commit point. Returns false if it was
    /// already cancelled.
    pub fn complete(&self) -> bool {
        match self
            .state
            .compare_exchange(ACTIVE, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == COMPLETED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn source(&self) -> Option<CancelSource> {
        self.source.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token handed to the upstream call.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Active turns by id, so an abort request can reach a running relay.
#[derive(Debug, Default)]
pub struct TurnRegistry {
    turns: Mutex<HashMap<String, CancellationCoordinator>>,
}

impl TurnRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The returned guard unregisters the turn when dropped. None when a
    /// turn with this id is already active; the running turn keeps its entry.
    pub fn register(self: &Arc<Self>, turn_id: &str, cancel: CancellationCoordinator) -> Option<Registration> {
        let mut turns = self.turns.lock().ok()?;
        if turns.contains_key(turn_id) {
            return None;
        }
        turns.insert(turn_id.to_string(), cancel);
        Some(Registration {
            registry: Arc::clone(self),
            turn_id: turn_id.to_string(),
        })
    }

    /// None when no turn with this id is active.
    pub fn cancel(&self, turn_id: &str, source: CancelSource) -> Option<bool> {
        let cancel = match self.turns.lock() {
            Ok(turns) => turns.get(turn_id).cloned(),
            Err(_) => None,
        }?;
        Some(cancel.cancel(source))
    }

    /// Cancels every active turn. Returns how many were still cancellable.
    pub fn cancel_all(&self, source: CancelSource) -> usize {
        let active: Vec<CancellationCoordinator> = match self.turns.lock() {
            Ok(turns) => turns.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        active.iter().filter(|c| c.cancel(source)).count()
    }

    pub fn active(&self) -> usize {
        match self.turns.lock() {
            Ok(turns) => turns.len(),
            Err(_) => 0,
        }
    }

    fn remove(&self, turn_id: &str) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.remove(turn_id);
        }
    }
}

#[derive(Debug)]
pub struct Registration {
    registry: Arc<TurnRegistry>,
    turn_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.turn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_cancel_is_a_no_op() {
        let cancel = CancellationCoordinator::new();
        let shared = cancel.clone();

        assert!(cancel.cancel(CancelSource::ClientAbort));
        assert!(!shared.cancel(CancelSource::TransportClosed));
        assert!(shared.is_cancelled());
        assert!(cancel.token().is_cancelled());
        assert_eq!(shared.source(), Some(CancelSource::ClientAbort));
    }

    #[test]
    fn cancel_after_completion_does_nothing() {
        let cancel = CancellationCoordinator::new();
        assert!(cancel.complete());
        assert!(!cancel.cancel(CancelSource::ClientAbort));
        assert!(!cancel.token().is_cancelled());
        assert!(cancel.complete());
    }

    #[test]
    fn completion_loses_to_earlier_cancel() {
        let cancel = CancellationCoordinator::new();
        assert!(cancel.cancel(CancelSource::TransportClosed));
        assert!(!cancel.complete());
    }

    #[tokio::test]
    async fn registry_forgets_finished_turns() {
        let registry = TurnRegistry::new();
        let cancel = CancellationCoordinator::new();
        {
            let _guard = registry.register("t1", cancel.clone()).unwrap_or_else(|| panic!("t1 taken"));
            assert_eq!(registry.active(), 1);
            assert_eq!(registry.cancel("t1", CancelSource::ClientAbort), Some(true));
            assert_eq!(registry.cancel("t1", CancelSource::ClientAbort), Some(false));
        }
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.cancel("t1", CancelSource::ClientAbort), None);

        let done = CancellationCoordinator::new();
        let live = CancellationCoordinator::new();
        let _a = registry.register("a", done.clone()).unwrap_or_else(|| panic!("a taken"));
        let _b = registry.register("b", live.clone()).unwrap_or_else(|| panic!("b taken"));
        done.complete();
        assert_eq!(registry.cancel_all(CancelSource::Shutdown), 1);
        assert_eq!(live.source(), Some(CancelSource::Shutdown));

        tokio::time::timeout(std::time::Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap_or_else(|_| panic!("token should already be cancelled"));
    }

    #[test]
    fn reused_turn_id_keeps_the_running_turn_reachable() {
        let registry = TurnRegistry::new();
        let first = CancellationCoordinator::new();
        let second = CancellationCoordinator::new();

        let first_guard = registry.register("dup", first.clone());
        assert!(first_guard.is_some());
        assert!(registry.register("dup", second.clone()).is_none());

        let second_guard = registry.register("fresh", second.clone());
        assert!(second_guard.is_some());
        drop(first_guard);

        assert_eq!(registry.active(), 1);
        assert_eq!(registry.cancel("fresh", CancelSource::ClientAbort), Some(true));
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());

        let again = registry.register("dup", CancellationCoordinator::new());
        assert!(again.is_some());
    }
}
