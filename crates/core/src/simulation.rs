use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::api::ApiClient;
use crate::error::SyncResult;
use crate::types::{ControlAction, ControlRequest, SimulationStatus};

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

/// Backend side of the time controls.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    async fn control(&self, request: &ControlRequest) -> SyncResult<SimulationStatus>;
}

#[async_trait]
impl SimulationBackend for ApiClient {
    async fn control(&self, request: &ControlRequest) -> SyncResult<SimulationStatus> {
        self.control_simulation(request).await
    }
}

pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub speed: f64,
    pub paused: bool,
    /// A control request is in flight.
    pub updating: bool,
    /// Outcome of the last request, empty until one completes.
    pub status: String,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            speed: 1.0,
            paused: false,
            updating: false,
            status: String::new(),
        }
    }
}

/// Playback speed and pause state of the running simulation.
pub struct SimulationControl {
    backend: Arc<dyn SimulationBackend>,
    state: Mutex<ControlState>,
}

impl SimulationControl {
    pub fn new(backend: Arc<dyn SimulationBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(ControlState::default()),
        }
    }

    /// Control for a simulation already running at `speed`.
    pub fn starting_at(backend: Arc<dyn SimulationBackend>, speed: f64) -> Self {
        let control = Self::new(backend);
        control.state.lock().speed = clamp_speed(speed);
        control
    }

    pub fn state(&self) -> ControlState {
        self.state.lock().clone()
    }

    /// The requested speed is shown immediately; the backend answer only
    /// updates the status line.
    pub async fn set_speed(&self, speed: f64) -> SyncResult<SimulationStatus> {
        let speed = clamp_speed(speed);
        {
            let mut state = self.state.lock();
            state.speed = speed;
            state.updating = true;
            state.status.clear();
        }
        let result = self
            .backend
            .control(&ControlRequest {
                action: None,
                speed: Some(speed),
            })
            .await;
        self.finish(&result, "Speed updated", |_| {});
        result
    }

    pub async fn pause(&self) -> SyncResult<SimulationStatus> {
        self.state.lock().updating = true;
        let result = self
            .backend
            .control(&ControlRequest {
                action: Some(ControlAction::Pause),
                speed: None,
            })
            .await;
        self.finish(&result, "Paused", |state| state.paused = true);
        result
    }

    /// Resume at the currently selected speed.
    pub async fn resume(&self) -> SyncResult<SimulationStatus> {
        let speed = {
            let mut state = self.state.lock();
            state.updating = true;
            state.speed
        };
        let result = self
            .backend
            .control(&ControlRequest {
                action: Some(ControlAction::Resume),
                speed: Some(speed),
            })
            .await;
        self.finish(&result, "Resumed", |state| state.paused = false);
        result
    }

    fn finish(
        &self,
        result: &SyncResult<SimulationStatus>,
        done: &str,
        on_success: impl FnOnce(&mut ControlState),
    ) {
        let mut state = self.state.lock();
        state.updating = false;
        match result {
            Ok(status) => {
                on_success(&mut state);
                state.status = done.to_string();
                info!(
                    speed = status.speed,
                    paused = status.is_paused,
                    tick_seconds = status.tick_seconds,
                    "{}",
                    done
                );
            }
            Err(e) => state.status = e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[derive(Default)]
    struct FakeBackend {
        requests: Mutex<Vec<ControlRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl SimulationBackend for FakeBackend {
        async fn control(&self, request: &ControlRequest) -> SyncResult<SimulationStatus> {
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(SyncError::fetch("/api/simulation/control", "Bad Gateway"));
            }
            Ok(SimulationStatus {
                speed: request.speed.unwrap_or(1.0),
                is_paused: request.action == Some(ControlAction::Pause),
                tick_seconds: 5.0,
            })
        }
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(0.0), MIN_SPEED);
        assert_eq!(clamp_speed(25.0), MAX_SPEED);
        assert_eq!(clamp_speed(2.5), 2.5);
        assert_eq!(clamp_speed(f64::NAN), 1.0);
    }

    #[tokio::test]
    async fn test_resume_resends_current_speed() {
        let backend = Arc::new(FakeBackend::default());
        let control = SimulationControl::new(backend.clone());

        control.set_speed(3.0).await.unwrap();
        control.pause().await.unwrap();
        assert!(control.state().paused);
        control.resume().await.unwrap();

        let requests = backend.requests.lock().clone();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].action, Some(ControlAction::Pause));
        assert_eq!(requests[2].action, Some(ControlAction::Resume));
        assert_eq!(requests[2].speed, Some(3.0));

        let state = control.state();
        assert!(!state.paused);
        assert!(!state.updating);
        assert_eq!(state.status, "Resumed");
    }

    #[tokio::test]
    async fn test_failed_pause_keeps_running_state() {
        let backend = Arc::new(FakeBackend {
            fail: true,
            ..Default::default()
        });
        let control = SimulationControl::new(backend);

        assert!(control.pause().await.is_err());
        let state = control.state();
        assert!(!state.paused);
        assert!(!state.updating);
        assert!(state.status.contains("Bad Gateway"));
    }

    #[tokio::test]
    async fn test_resume_from_initial_speed() {
        let backend = Arc::new(FakeBackend::default());
        let control = SimulationControl::starting_at(backend.clone(), 0.01);
        let status = control.resume().await.unwrap();
        assert_eq!(status.speed, MIN_SPEED);
        assert_eq!(backend.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_set_speed_is_clamped() {
        let backend = Arc::new(FakeBackend::default());
        let control = SimulationControl::new(backend.clone());

        control.set_speed(50.0).await.unwrap();
        assert_eq!(control.state().speed, MAX_SPEED);
        assert_eq!(backend.requests.lock()[0].speed, Some(MAX_SPEED));
        assert_eq!(backend.requests.lock()[0].action, None);
    }
}
