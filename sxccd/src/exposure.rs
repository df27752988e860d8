/*!
Exposure session: Idle → Exposing → Downloading → Idle.

[`ExposureSession::start_exposure`] returns as soon as the state is
`Exposing`; a background worker clears the sensor, times the exposure in
short sleeps, and then downloads the image. Abort is honoured only while
exposing. Stop ends the timed wait early but still downloads.

Every transition is published as an [`ExposureEvent`] to subscribers.
*/

use crate::camera::Camera;
use crate::error::{ErrorKind, Result, SxError};
use crate::reconstruct::ImageBuffer;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sleep step while the remaining exposure is long
const POLL_STEP: Duration = Duration::from_millis(50);

/// Below this much remaining time, sleep the remainder in one go
const POLL_THRESHOLD: Duration = Duration::from_millis(75);

/// Queue depth per event subscriber
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraState {
    Idle,
    Exposing,
    Downloading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExposureEvent {
    Started { duration: Duration, light: bool },
    Downloading,
    Completed { actual: Duration },
    Aborted,
    Failed { kind: ErrorKind, message: String },
}

/// Failure recorded by the most recent exposure worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug)]
struct SessionState {
    state: CameraState,
    abort_requested: bool,
    stop_requested: bool,
    image_valid: bool,
    light: bool,
    requested: Duration,
    actual: Option<Duration>,
    started_at: Option<DateTime<Local>>,
    last_error: Option<LastError>,
}

struct Shared {
    camera: Arc<Camera>,
    state: Mutex<SessionState>,
    subscribers: Mutex<Vec<Sender<ExposureEvent>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ExposureEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Exposure event channel full, dropping {:?}", event);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Exposure control for one camera
pub struct ExposureSession {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExposureSession {
    pub fn new(camera: Arc<Camera>) -> Self {
        Self {
            shared: Arc::new(Shared {
                camera,
                state: Mutex::new(SessionState {
                    state: CameraState::Idle,
                    abort_requested: false,
                    stop_requested: false,
                    image_valid: false,
                    light: true,
                    requested: Duration::ZERO,
                    actual: None,
                    started_at: None,
                    last_error: None,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &Arc<Camera> {
        &self.shared.camera
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<ExposureEvent> {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Begin an exposure in the background
    pub fn start_exposure(&self, duration: Duration, light: bool) -> Result<()> {
        {
            let mut s = self.shared.lock_state();
            if s.state != CameraState::Idle {
                return Err(SxError::invalid_state(format!(
                    "cannot start an exposure while {:?}",
                    s.state
                )));
            }
            s.state = CameraState::Exposing;
            s.abort_requested = false;
            s.stop_requested = false;
            s.image_valid = false;
            s.light = light;
            s.requested = duration;
            s.actual = None;
            s.started_at = None;
            s.last_error = None;
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                warn!("Previous exposure worker panicked");
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("sx-exposure-{}", self.shared.camera.index()))
            .spawn(move || run_worker(shared, duration, light));

        match spawned {
            Ok(handle) => {
                info!("⏱️ Exposure started: {:?} ({})", duration, if light { "light" } else { "dark" });
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn exposure worker: {}", e);
                self.shared.lock_state().state = CameraState::Idle;
                Err(SxError::Io(e))
            }
        }
    }

    /// Abandon the exposure; no-op when idle, refused while downloading
    pub fn abort_exposure(&self) -> Result<()> {
        let mut s = self.shared.lock_state();
        match s.state {
            CameraState::Idle => Ok(()),
            CameraState::Exposing => {
                info!("Abort requested");
                s.abort_requested = true;
                Ok(())
            }
            CameraState::Downloading => Err(SxError::invalid_state("cannot abort while downloading")),
        }
    }

    /// End the exposure early and keep the image
    pub fn stop_exposure(&self) -> Result<()> {
        let mut s = self.shared.lock_state();
        match s.state {
            CameraState::Exposing | CameraState::Downloading => {
                info!("Stop requested");
                s.stop_requested = true;
                Ok(())
            }
            CameraState::Idle => Err(SxError::invalid_state("no exposure in progress")),
        }
    }

    pub fn current_state(&self) -> CameraState {
        self.shared.lock_state().state
    }

    pub fn image_valid(&self) -> bool {
        self.shared.lock_state().image_valid
    }

    /// Image from the last successful exposure
    pub fn image(&self) -> Result<Arc<ImageBuffer>> {
        if !self.image_valid() {
            return Err(SxError::invalid_state("no valid image"));
        }
        self.shared.camera.image()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.shared.lock_state().last_error.clone()
    }

    /// Local time the last exposure began, ISO 8601 with milliseconds
    pub fn last_exposure_start(&self) -> Option<String> {
        self.shared
            .lock_state()
            .started_at
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
    }

    /// Measured length of the last successful exposure
    pub fn last_exposure_duration(&self) -> Option<Duration> {
        self.shared.lock_state().actual
    }

    pub fn requested_duration(&self) -> Duration {
        self.shared.lock_state().requested
    }

    pub fn is_light_frame(&self) -> bool {
        self.shared.lock_state().light
    }

    /// Block until the current worker, if any, has exited
    pub fn wait(&self) {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Exposure worker panicked");
            }
        }
    }
}

impl Drop for ExposureSession {
    fn drop(&mut self) {
        {
            let mut s = self.shared.lock_state();
            if s.state == CameraState::Exposing {
                s.abort_requested = true;
            }
        }
        self.wait();
    }
}

fn run_worker(shared: Arc<Shared>, duration: Duration, light: bool) {
    // Return to Idle even if the readout panics
    let guard = scopeguard::guard(Arc::clone(&shared), |shared| {
        let mut s = shared.lock_state();
        if s.state != CameraState::Idle {
            error!("Exposure worker exited abnormally, forcing Idle");
            s.state = CameraState::Idle;
            s.image_valid = false;
        }
    });

    shared.emit(ExposureEvent::Started { duration, light });
    let outcome = expose(&shared, duration);
    scopeguard::ScopeGuard::into_inner(guard);
    finish(&shared, outcome);
}

/// Run one exposure; `Ok(None)` means it was aborted
fn expose(shared: &Shared, duration: Duration) -> Result<Option<Duration>> {
    shared.camera.clear_ccd_pixels()?;
    let start = Instant::now();
    shared.lock_state().started_at = Some(Local::now());

    loop {
        {
            let s = shared.lock_state();
            if s.abort_requested || s.stop_requested {
                break;
            }
        }
        let elapsed = start.elapsed();
        if elapsed >= duration {
            break;
        }
        let remaining = duration - elapsed;
        thread::sleep(if remaining > POLL_THRESHOLD { POLL_STEP } else { remaining });
    }

    {
        let mut s = shared.lock_state();
        if s.abort_requested {
            debug!("exposure abandoned after {:?}", start.elapsed());
            return Ok(None);
        }
        s.state = CameraState::Downloading;
    }
    shared.emit(ExposureEvent::Downloading);

    let ended = shared.camera.record_pixels()?;
    Ok(Some(ended.duration_since(start)))
}

fn finish(shared: &Shared, outcome: Result<Option<Duration>>) {
    let event = {
        let mut s = shared.lock_state();
        s.state = CameraState::Idle;
        match outcome {
            Ok(Some(actual)) => {
                info!("✅ Exposure complete after {:?}", actual);
                s.image_valid = true;
                s.actual = Some(actual);
                ExposureEvent::Completed { actual }
            }
            Ok(None) => {
                info!("Exposure aborted");
                s.image_valid = false;
                ExposureEvent::Aborted
            }
            Err(e) => {
                error!("❌ Exposure failed: {}", e);
                s.image_valid = false;
                let failure = LastError {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                s.last_error = Some(failure.clone());
                ExposureEvent::Failed {
                    kind: failure.kind,
                    message: failure.message,
                }
            }
        }
    };
    shared.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraOptions;
    use crate::controller::Controller;
    use crate::protocol::Opcode;
    use crate::simulator::{SimulatedDevice, SimulatedHead, SimulatorConfig, SimulatorHandle};

    fn session() -> (ExposureSession, SimulatorHandle) {
        let device = SimulatedDevice::new(SimulatorConfig::new(SimulatedHead::new(0x47, 16, 12, 16)));
        let handle = device.handle();
        let controller = Controller::open(device).unwrap();
        let camera = Camera::open(controller, 0, CameraOptions::default()).unwrap();
        (ExposureSession::new(Arc::new(camera)), handle)
    }

    fn wait_for_state(session: &ExposureSession, state: CameraState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.current_state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_start_requires_idle() {
        let (session, _) = session();
        session.start_exposure(Duration::from_millis(200), true).unwrap();
        assert_eq!(session.current_state(), CameraState::Exposing);

        let err = session.start_exposure(Duration::from_millis(10), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        session.wait();
        assert_eq!(session.current_state(), CameraState::Idle);
        assert!(session.image_valid());
        assert_eq!(session.image().unwrap().width(), 16);
        assert!(session.last_exposure_duration().unwrap() >= Duration::from_millis(200));
        assert_eq!(session.requested_duration(), Duration::from_millis(200));
        assert!(session.last_exposure_start().is_some());
    }

    #[test]
    fn test_abort_during_exposure() {
        let (session, handle) = session();
        let begun = Instant::now();
        session.start_exposure(Duration::from_secs(2), true).unwrap();
        session.abort_exposure().unwrap();
        session.wait();

        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(session.current_state(), CameraState::Idle);
        assert!(!session.image_valid());
        assert!(session.last_error().is_none());
        assert!(handle.commands_with(Opcode::ReadPixels).is_empty());
        assert_eq!(session.image().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_abort_and_stop_when_idle() {
        let (session, _) = session();
        assert!(session.abort_exposure().is_ok());
        assert_eq!(session.current_state(), CameraState::Idle);
        assert_eq!(session.stop_exposure().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_stop_cuts_exposure_short() {
        let (session, _) = session();
        let begun = Instant::now();
        session.start_exposure(Duration::from_secs(5), false).unwrap();
        thread::sleep(Duration::from_millis(100));
        session.stop_exposure().unwrap();
        session.wait();

        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(session.image_valid());
        assert!(!session.is_light_frame());
        assert!(session.last_exposure_duration().unwrap() < Duration::from_secs(2));
    }

    #[test]
    fn test_download_failure_returns_to_idle() {
        let (session, handle) = session();
        handle.set_fail_downloads(true);
        session.start_exposure(Duration::from_millis(10), true).unwrap();
        session.wait();

        assert_eq!(session.current_state(), CameraState::Idle);
        assert!(!session.image_valid());
        assert_eq!(session.last_error().unwrap().kind, ErrorKind::Io);

        handle.set_fail_downloads(false);
        session.start_exposure(Duration::from_millis(10), true).unwrap();
        session.wait();
        assert!(session.image_valid());
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_abort_refused_while_downloading() {
        let (session, handle) = session();
        handle.set_download_delay(Duration::from_millis(300));
        session.start_exposure(Duration::ZERO, true).unwrap();
        wait_for_state(&session, CameraState::Downloading);

        assert_eq!(session.abort_exposure().unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(session.stop_exposure().is_ok());

        session.wait();
        assert!(session.image_valid());
    }

    #[test]
    fn test_events_follow_transitions() {
        let (session, _) = session();
        let events = session.subscribe();
        session.start_exposure(Duration::from_millis(10), true).unwrap();
        session.wait();

        let seen: Vec<ExposureEvent> = events.try_iter().collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[0],
            ExposureEvent::Started {
                duration: Duration::from_millis(10),
                light: true
            }
        );
        assert_eq!(seen[1], ExposureEvent::Downloading);
        assert!(matches!(seen[2], ExposureEvent::Completed { .. }));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let (session, _) = session();
        drop(session.subscribe());
        session.start_exposure(Duration::ZERO, true).unwrap();
        session.wait();
        assert!(session.shared.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_aborts_worker() {
        let (session, handle) = session();
        let begun = Instant::now();
        session.start_exposure(Duration::from_secs(10), true).unwrap();
        drop(session);

        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(handle.commands_with(Opcode::ReadPixels).is_empty());
    }
}
