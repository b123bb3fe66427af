//! MME State Machine
//!
//! Top-level FSM and the task loop that feeds it. Each event runs to
//! completion; the outbox is drained before the next event is taken.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::MmeContext;
use crate::error::{MmeError, MmeResult};
use crate::event::{AppIndication, AppRequest, MmeEvent, Outbox, S1apInbound};
use crate::s1ap_build::OutboundS1ap;
use crate::timer::{MmeTimerId, TimerHandle};

/// How often the loop checks the running flag while idle
const IDLE_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// State Machine Trait
// ============================================================================

/// Finite State Machine trait
pub trait Fsm {
    /// Event type
    type Event;
    /// Error returned by dispatch
    type Error;

    /// Initialize the state machine
    fn init(&mut self);

    /// Finalize the state machine
    fn fini(&mut self);

    /// Dispatch an event to the state machine
    fn dispatch(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Check if in a specific state
    fn check_state(&self, state_name: &str) -> bool;
}

// ============================================================================
// MME State Machine
// ============================================================================

/// MME State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmeState {
    /// Initial state
    Initial,
    /// Final state
    Final,
    /// Operational state
    Operational,
}

impl fmt::Display for MmeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmeState::Initial => write!(f, "INITIAL"),
            MmeState::Final => write!(f, "FINAL"),
            MmeState::Operational => write!(f, "OPERATIONAL"),
        }
    }
}

/// MME Main State Machine
pub struct MmeFsm {
    /// Current state
    state: MmeState,
    /// Registries and pools
    ctx: MmeContext,
}

impl MmeFsm {
    /// Create a new MME FSM around a context
    pub fn new(ctx: MmeContext) -> Self {
        Self {
            state: MmeState::Initial,
            ctx,
        }
    }

    /// Get current state
    pub fn state(&self) -> MmeState {
        self.state
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: MmeState) {
        log::debug!("MME FSM: {} -> {}", self.state, new_state);
        self.state = new_state;
    }

    pub fn context(&self) -> &MmeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut MmeContext {
        &mut self.ctx
    }

    /// Messages and indications produced since the last call
    pub fn take_outbox(&mut self) -> Outbox {
        self.ctx.conn.take_outbox()
    }

    /// Run one event to completion
    pub fn handle(&mut self, event: MmeEvent) -> MmeResult<()> {
        mme_sm_debug(&event);
        match self.state {
            MmeState::Initial => {
                log::warn!("MME FSM not initialized, {} dropped", event_name(&event));
                Ok(())
            }
            MmeState::Final => {
                log::debug!("MME FSM finalized, {} dropped", event_name(&event));
                Ok(())
            }
            MmeState::Operational => self.state_operational(event),
        }
    }

    /// Handle operational state
    fn state_operational(&mut self, event: MmeEvent) -> MmeResult<()> {
        match event {
            MmeEvent::AssociationUp {
                assoc_id,
                inbound_streams,
                outbound_streams,
                addr,
            } => self
                .ctx
                .handle_association_up(assoc_id, inbound_streams, outbound_streams, addr),
            MmeEvent::AssociationDown { assoc_id, is_reset } => {
                self.ctx.handle_association_down(assoc_id, is_reset);
                Ok(())
            }
            MmeEvent::S1ap {
                assoc_id,
                stream_id,
                message,
            } => self.ctx.handle_s1ap(assoc_id, stream_id, message).map(|_| ()),
            MmeEvent::App(request) => self.ctx.handle_app_request(request),
            MmeEvent::TimerExpired { handle } => {
                self.ctx.handle_timer_expired(handle);
                Ok(())
            }
        }
    }
}

impl Fsm for MmeFsm {
    type Event = MmeEvent;
    type Error = MmeError;

    fn init(&mut self) {
        self.state = MmeState::Initial;
        self.transition(MmeState::Operational);
    }

    fn fini(&mut self) {
        self.transition(MmeState::Final);
    }

    fn dispatch(&mut self, event: &MmeEvent) -> MmeResult<()> {
        self.handle(event.clone())
    }

    fn check_state(&self, state_name: &str) -> bool {
        self.state.to_string() == state_name
    }
}

// ============================================================================
// Timer Expiry
// ============================================================================

impl MmeContext {
    /// Timer fired; stale handles are ignored
    pub fn handle_timer_expired(&mut self, handle: TimerHandle) {
        let Some(owner) = self.conn.resolve_timer(handle) else {
            return;
        };
        log::debug!("[ue:{}] {} expired", owner.ue_id, owner.timer_id);
        match owner.timer_id {
            MmeTimerId::S1Holding => {
                if let Some(removed) = self.conn.on_release_timeout(owner.ue_id) {
                    self.release_access_planes(&removed);
                }
            }
            MmeTimerId::S1RelocOverall => {
                self.mobility.on_handover_timeout(&mut self.conn, owner.ue_id);
            }
        }
    }
}

// ============================================================================
// Task Loop
// ============================================================================

/// Drive the FSM until the event channel closes, the running flag drops,
/// or a handler reports a fatal error.
pub async fn run(
    mut fsm: MmeFsm,
    mut rx: mpsc::Receiver<MmeEvent>,
    s1ap_tx: mpsc::Sender<OutboundS1ap>,
    app_tx: mpsc::Sender<AppIndication>,
    running: Arc<AtomicBool>,
) -> MmeResult<MmeFsm> {
    if fsm.state() != MmeState::Operational {
        fsm.init();
    }
    log::info!("MME task running");

    while running.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(IDLE_POLL, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                log::info!("MME event channel closed");
                break;
            }
            Err(_) => continue,
        };

        let result = fsm.handle(event);
        flush(fsm.take_outbox(), &s1ap_tx, &app_tx).await;

        if let Err(e) = result {
            if e.is_fatal() {
                log::error!("MME task stopped: {}", e);
                fsm.fini();
                return Err(e);
            }
            log::warn!("{}", e);
        }
    }

    fsm.fini();
    log::info!("MME task exited");
    Ok(fsm)
}

async fn flush(
    outbox: Outbox,
    s1ap_tx: &mpsc::Sender<OutboundS1ap>,
    app_tx: &mpsc::Sender<AppIndication>,
) {
    for message in outbox.s1ap {
        if s1ap_tx.send(message).await.is_err() {
            log::warn!("S1AP transport gone, outbound message dropped");
        }
    }
    for indication in outbox.app {
        if app_tx.send(indication).await.is_err() {
            log::warn!("application layer gone, indication dropped");
        }
    }
}

// ============================================================================
// Debug Helper
// ============================================================================

fn event_name(event: &MmeEvent) -> &'static str {
    match event {
        MmeEvent::AssociationUp { .. } => "ASSOCIATION_UP",
        MmeEvent::AssociationDown { .. } => "ASSOCIATION_DOWN",
        MmeEvent::S1ap { message, .. } => match message {
            S1apInbound::Unknown { .. } => "S1AP_UNKNOWN",
            _ => "S1AP_MESSAGE",
        },
        MmeEvent::App(request) => match request {
            AppRequest::Paging { .. } => "APP_PAGING",
            _ => "APP_REQUEST",
        },
        MmeEvent::TimerExpired { .. } => "TIMER_EXPIRED",
    }
}

/// Debug helper for state machine events
pub fn mme_sm_debug(event: &MmeEvent) {
    log::trace!("MME SM Event: {}", event_name(event));
}

// ============================================================================
// Tests
// ============================================================================
