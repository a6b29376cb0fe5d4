mod params;

pub use params::{CaptureSpec, HardwareLimits};

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::common::Frame;
use crate::config::CameraSettings;
use crate::error::SessionError;
use crate::intake::source::{FrameSource, SourceFactory, SourceSpec};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the session, safe to hand to a status page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub params: Option<SourceSpec>,
    pub uptime_ms: Option<u64>,
    pub frames_grabbed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

struct SessionSlot {
    state: SessionState,
    params: Option<SourceSpec>,
    started_at: Option<Instant>,
    frames_grabbed: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl SessionSlot {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            params: None,
            started_at: None,
            frames_grabbed: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Owns the single live camera session of the process.
///
/// State lives in `slot`, a plain mutex that is never held across an await; the open source
/// sits behind its own async lock so that a slow read never blocks `info()`.
pub struct CameraSessionManager {
    factory: Arc<dyn SourceFactory>,
    limits: HardwareLimits,
    failure_threshold: u32,
    slot: std::sync::Mutex<SessionSlot>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    events: broadcast::Sender<SessionState>,
}

/// Settles a `Starting` or `Stopping` transition whose future was dropped before it finished,
/// so the session falls back to `Idle` instead of staying busy forever.
struct TransitionGuard<'a> {
    manager: &'a CameraSessionManager,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(manager: &'a CameraSessionManager) -> Self {
        Self { manager, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.manager.slot();
        tracing::warn!(state = %slot.state, "Camera session transition interrupted");
        slot.last_error = Some(format!("{} interrupted", slot.state));
        self.manager.transition(&mut slot, SessionState::Failed);
        slot.params = None;
        slot.started_at = None;
        self.manager.transition(&mut slot, SessionState::Idle);
    }
}

impl CameraSessionManager {
    pub fn new(factory: Arc<dyn SourceFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            factory,
            limits: HardwareLimits::default(),
            failure_threshold: 3,
            slot: std::sync::Mutex::new(SessionSlot::idle()),
            source: Mutex::new(None),
            events,
        }
    }

    pub fn from_settings(factory: Arc<dyn SourceFactory>, settings: &CameraSettings) -> Self {
        Self::new(factory)
            .limits(settings.limits.clone())
            .failure_threshold(settings.failure_threshold)
    }

    pub fn limits(mut self, limits: HardwareLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    /// Every state transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, slot: &mut SessionSlot, state: SessionState) {
        tracing::debug!(from = %slot.state, to = %state, "Camera session transition");
        slot.state = state;
        let _ = self.events.send(state);
    }

    pub async fn start(&self, spec: &CaptureSpec) -> Result<SourceSpec, SessionError> {
        let source_spec = {
            let mut slot = self.slot();
            match slot.state {
                SessionState::Running | SessionState::Starting => {
                    return Err(SessionError::SessionAlreadyActive)
                }
                SessionState::Stopping => return Err(SessionError::SessionBusy),
                SessionState::Idle | SessionState::Failed => {}
            }
            let source_spec = self.limits.validate(spec)?;

            *slot = SessionSlot::idle();
            slot.params = Some(source_spec.clone());
            self.transition(&mut slot, SessionState::Starting);
            source_spec
        };
        let guard = TransitionGuard::new(self);

        // An interrupted stop can leave its source behind; release the device first.
        let stale = self.source.lock().await.take();
        if let Some(mut stale) = stale {
            stale.close().await;
        }

        let mut source = self.factory.create(source_spec.clone());
        match source.open().await {
            Ok(()) => {
                *self.source.lock().await = Some(source);
                let mut slot = self.slot();
                slot.started_at = Some(Instant::now());
                self.transition(&mut slot, SessionState::Running);
                guard.disarm();
                tracing::info!(device = %source_spec.device_key(), "Camera session running");
                Ok(source_spec)
            }
            Err(err) => {
                let mut slot = self.slot();
                slot.last_error = Some(err.to_string());
                self.transition(&mut slot, SessionState::Failed);
                slot.params = None;
                self.transition(&mut slot, SessionState::Idle);
                guard.disarm();
                tracing::error!(device = %source_spec.device_key(), error = %err, "Camera session failed to start");
                Err(err.into())
            }
        }
    }

    /// Stops the running session. A no-op when idle.
    pub async fn stop(&self) -> Result<(), SessionError> {
        {
            let mut slot = self.slot();
            match slot.state {
                SessionState::Idle | SessionState::Failed => return Ok(()),
                SessionState::Starting | SessionState::Stopping => return Err(SessionError::SessionBusy),
                SessionState::Running => self.transition(&mut slot, SessionState::Stopping),
            }
        }
        let guard = TransitionGuard::new(self);

        // Waits for an in-flight grab, which is itself bounded by the read timeout.
        let source = self.source.lock().await.take();
        if let Some(mut source) = source {
            source.close().await;
        }

        let mut slot = self.slot();
        slot.params = None;
        slot.started_at = None;
        self.transition(&mut slot, SessionState::Idle);
        guard.disarm();
        tracing::info!("Camera session stopped");
        Ok(())
    }

    /// One frame from the running session. Single flight: a concurrent call fails with
    /// `SessionBusy` rather than queuing.
    pub async fn grab_frame(&self) -> Result<Frame, SessionError> {
        if self.slot().state != SessionState::Running {
            return Err(SessionError::SessionNotRunning);
        }

        let mut guard = self.source.try_lock().map_err(|_| SessionError::SessionBusy)?;
        let source = guard.as_mut().ok_or(SessionError::SessionNotRunning)?;

        let result = source.read().await;
        match result {
            Ok(frame) => {
                let mut slot = self.slot();
                slot.frames_grabbed += 1;
                slot.consecutive_failures = 0;
                Ok(frame)
            }
            Err(err) => {
                let torn_down = {
                    let mut slot = self.slot();
                    slot.consecutive_failures += 1;
                    slot.last_error = Some(err.to_string());
                    tracing::warn!(
                        error = %err,
                        consecutive_failures = slot.consecutive_failures,
                        "Frame grab failed"
                    );

                    if slot.consecutive_failures >= self.failure_threshold && slot.state == SessionState::Running {
                        self.transition(&mut slot, SessionState::Failed);
                        slot.params = None;
                        slot.started_at = None;
                        self.transition(&mut slot, SessionState::Idle);
                        tracing::error!(
                            failures = slot.consecutive_failures,
                            "Camera session torn down after repeated read failures"
                        );
                        guard.take()
                    } else {
                        None
                    }
                };
                // `guard` stays held until the device is released, so a new start waits for it.
                if let Some(mut source) = torn_down {
                    source.close().await;
                }
                Err(err.into())
            }
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let slot = self.slot();
        SessionInfo {
            state: slot.state,
            params: slot.params.clone(),
            uptime_ms: slot.started_at.map(|started| started.elapsed().as_millis() as u64),
            frames_grabbed: slot.frames_grabbed,
            consecutive_failures: slot.consecutive_failures,
            last_error: slot.last_error.clone(),
        }
    }

    /// A single frame: grabbed from the running session, or through a throwaway source
    /// opened for `spec` when idle.
    pub async fn snapshot(&self, spec: &CaptureSpec) -> Result<Frame, SessionError> {
        let state = self.slot().state;
        match state {
            SessionState::Running => self.grab_frame().await,
            SessionState::Idle | SessionState::Failed => {
                let source_spec = self.limits.validate(spec)?;
                let mut source = self.factory.create(source_spec);
                Ok(source.snapshot().await?)
            }
            SessionState::Starting | SessionState::Stopping => Err(SessionError::SessionBusy),
        }
    }
}
