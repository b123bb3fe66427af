//! MME Timer Management
//!
//! Timers are armed on behalf of a UE connection. The handle is stored on
//! the owning `UeConnection`; `TimerIndex` keeps the reverse mapping used
//! when the timer fires, since the expiry event carries only the handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::UeId;
use crate::event::MmeEvent;

// ============================================================================
// Timer Identifiers
// ============================================================================

/// MME timer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmeTimerId {
    /// S1 holding timer (waiting for UE context release complete)
    S1Holding,
    /// TS1RELOCOverall (waiting for handover notify at the target)
    S1RelocOverall,
}

impl fmt::Display for MmeTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmeTimerId::S1Holding => write!(f, "S1_HOLDING"),
            MmeTimerId::S1RelocOverall => write!(f, "S1_RELOC_OVERALL"),
        }
    }
}

/// Opaque timer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// UE and timer kind guarded by one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOwner {
    /// UE connection pool ID
    pub ue_id: UeId,
    /// Timer kind
    pub timer_id: MmeTimerId,
}

// ============================================================================
// Timer Service
// ============================================================================

/// Backend that delivers a `TimerExpired` event after `duration`.
///
/// Cancellation is best effort: an expiry may still be delivered after
/// `cancel` returns, and the fire path must tolerate it.
pub trait TimerService: Send {
    fn schedule(&mut self, handle: TimerHandle, duration: Duration);
    fn cancel(&mut self, handle: TimerHandle);
}

/// Timer service backed by the tokio runtime
pub struct TokioTimerService {
    tx: mpsc::Sender<MmeEvent>,
    tasks: HashMap<TimerHandle, JoinHandle<()>>,
}

impl TokioTimerService {
    pub fn new(tx: mpsc::Sender<MmeEvent>) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&mut self, handle: TimerHandle, duration: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());

        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if tx.send(MmeEvent::TimerExpired { handle }).await.is_err() {
                log::debug!("[{}] MME task gone, expiry dropped", handle);
            }
        });
        self.tasks.insert(handle, task);
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }
}

/// Timer service that only records what is armed.
///
/// Clones share state, so a test keeps one clone to inspect pending timers
/// and fires them by feeding `TimerExpired` events itself.
#[derive(Debug, Clone, Default)]
pub struct ManualTimerService {
    pending: Arc<Mutex<HashMap<TimerHandle, Duration>>>,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles currently armed, in arming order
    pub fn pending(&self) -> Vec<TimerHandle> {
        let mut handles: Vec<TimerHandle> = match self.pending.lock() {
            Ok(pending) => pending.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        };
        handles.sort();
        handles
    }

    /// Duration a handle was armed with
    pub fn duration_of(&self, handle: TimerHandle) -> Option<Duration> {
        match self.pending.lock() {
            Ok(pending) => pending.get(&handle).copied(),
            Err(poisoned) => poisoned.into_inner().get(&handle).copied(),
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.duration_of(handle).is_some()
    }
}

impl TimerService for ManualTimerService {
    fn schedule(&mut self, handle: TimerHandle, duration: Duration) {
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(handle, duration),
            Err(poisoned) => poisoned.into_inner().insert(handle, duration),
        };
    }

    fn cancel(&mut self, handle: TimerHandle) {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(&handle),
            Err(poisoned) => poisoned.into_inner().remove(&handle),
        };
    }
}

// ============================================================================
// Timer Correlation Index
// ============================================================================

/// Handle generator plus the handle -> owner map for the fire path
pub struct TimerIndex {
    next_handle: u64,
    owners: HashMap<TimerHandle, TimerOwner>,
    service: Box<dyn TimerService>,
}

impl TimerIndex {
    pub fn new(service: Box<dyn TimerService>) -> Self {
        Self {
            next_handle: 1,
            owners: HashMap::new(),
            service,
        }
    }

    /// Arm a timer for `ue_id`; the caller stores the returned handle
    pub fn arm(&mut self, ue_id: UeId, timer_id: MmeTimerId, duration: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);

        self.owners.insert(handle, TimerOwner { ue_id, timer_id });
        self.service.schedule(handle, duration);
        log::debug!("[ue:{}] {} armed as {} ({:?})", ue_id, timer_id, handle, duration);
        handle
    }

    /// Cancel a timer. Unknown handles are ignored.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(owner) = self.owners.remove(&handle) {
            log::debug!("[ue:{}] {} cancelled ({})", owner.ue_id, owner.timer_id, handle);
        }
        self.service.cancel(handle);
    }

    /// Resolve a fired handle. `None` means it was already cancelled.
    pub fn resolve(&mut self, handle: TimerHandle) -> Option<TimerOwner> {
        self.owners.remove(&handle)
    }

    pub fn owner(&self, handle: TimerHandle) -> Option<&TimerOwner> {
        self.owners.get(&handle)
    }

    /// Number of outstanding timers
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_id_display() {
        assert_eq!(MmeTimerId::S1Holding.to_string(), "S1_HOLDING");
        assert_eq!(MmeTimerId::S1RelocOverall.to_string(), "S1_RELOC_OVERALL");
    }

    #[test]
    fn test_arm_and_resolve() {
        let service = ManualTimerService::new();
        let mut index = TimerIndex::new(Box::new(service.clone()));

        let handle = index.arm(7, MmeTimerId::S1Holding, Duration::from_secs(30));
        assert!(service.is_armed(handle));
        assert_eq!(service.duration_of(handle), Some(Duration::from_secs(30)));

        let owner = index.resolve(handle).unwrap();
        assert_eq!(owner.ue_id, 7);
        assert_eq!(owner.timer_id, MmeTimerId::S1Holding);

        // Second delivery of the same expiry is stale
        assert!(index.resolve(handle).is_none());
    }

    #[test]
    fn test_cancel_then_fire_is_stale() {
        let service = ManualTimerService::new();
        let mut index = TimerIndex::new(Box::new(service.clone()));

        let handle = index.arm(1, MmeTimerId::S1RelocOverall, Duration::from_secs(10));
        index.cancel(handle);
        assert!(!service.is_armed(handle));
        assert!(index.is_empty());
        assert!(index.resolve(handle).is_none());
    }

    #[test]
    fn test_handles_are_distinct() {
        let mut index = TimerIndex::new(Box::new(ManualTimerService::new()));
        let a = index.arm(1, MmeTimerId::S1Holding, Duration::from_millis(1));
        let b = index.arm(1, MmeTimerId::S1RelocOverall, Duration::from_millis(1));
        assert_ne!(a, b);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut service = TokioTimerService::new(tx);
        service.schedule(TimerHandle(3), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(150)).await;
        match rx.recv().await {
            Some(MmeEvent::TimerExpired { handle }) => assert_eq!(handle, TimerHandle(3)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_cancel() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut service = TokioTimerService::new(tx);
        service.schedule(TimerHandle(1), Duration::from_millis(100));
        service.cancel(TimerHandle(1));
        drop(service);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(rx.recv().await.is_none());
    }
}
