use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use surveil_common::config::{Config, RecordingConfig};
use surveil_common::frame::CapturedFrame;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiClient};
use crate::capture::{self, CaptureMode};
use crate::location::{self, LocationSource};
use crate::motion::{self, policy};
use crate::motion::policy::Action;
use crate::recorder::encoder::ClipEncoder;

/// What caused a recording to start or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Motion,
    Remote,
    Manual,
    EncoderFailure,
    CameraLost,
    Shutdown,
}

/// User-visible device status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Starting,
    CameraReady,
    CameraFailed(String),
    Recording,
    Idle,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => write!(f, "starting"),
            Status::CameraReady => write!(f, "camera ready"),
            Status::CameraFailed(reason) => write!(f, "camera failed: {reason}"),
            Status::Recording => write!(f, "recording"),
            Status::Idle => write!(f, "idle"),
        }
    }
}

/// Frames queued for the clip writer before new ones are dropped.
const CLIP_QUEUE: usize = 32;

/// A recording in progress. Frames reach ffmpeg through a writer task so a
/// slow encoder never holds the session lock.
struct ActiveClip {
    frames: mpsc::Sender<CapturedFrame>,
    writer: JoinHandle<ClipEncoder>,
    start_ms: i64,
    trigger: Trigger,
}

/// Feed queued frames to the encoder, skipping any already written. A write
/// failure closes the queue; the encoder is returned for finalizing.
async fn write_frames(
    mut encoder: ClipEncoder,
    mut rx: mpsc::Receiver<CapturedFrame>,
    mut last_seq: Option<u64>,
) -> ClipEncoder {
    while let Some(frame) = rx.recv().await {
        if last_seq.is_some_and(|seq| frame.seq <= seq) {
            continue;
        }
        if let Err(e) = encoder.push_frame(&frame.jpeg).await {
            error!(error = %e, seq = frame.seq, "failed to push frame to encoder");
            break;
        }
        last_seq = Some(frame.seq);
    }
    encoder
}

/// Shared state of one capture session.
///
/// `recordingActive` is the presence of an active clip. Every start and stop
/// decision is taken and applied while holding the clip lock, so concurrent
/// triggers resolve in lock order (last writer wins).
pub struct Session {
    clip: Mutex<Option<ActiveClip>>,
    frames: watch::Sender<Option<CapturedFrame>>,
    status: watch::Sender<Status>,
    recording: RecordingConfig,
    api: Arc<ApiClient>,
    uploads: Mutex<JoinSet<()>>,
    upload_timeout: Duration,
}

impl Session {
    pub fn new(recording: RecordingConfig, api: Arc<ApiClient>, upload_timeout: Duration) -> Self {
        let (frames, _) = watch::channel(None);
        let (status, _) = watch::channel(Status::Starting);
        Self {
            clip: Mutex::new(None),
            frames,
            status,
            recording,
            api,
            uploads: Mutex::new(JoinSet::new()),
            upload_timeout,
        }
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<CapturedFrame>> {
        self.frames.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    fn set_status(&self, status: Status) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            debug!(status = %status, "device status");
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.clip.lock().await.is_some()
    }

    pub fn camera_ready(&self) {
        let status = self.status.borrow().clone();
        if matches!(status, Status::Starting | Status::CameraFailed(_)) {
            self.set_status(Status::CameraReady);
        }
    }

    /// The capture source went away: sampling goes quiet and new recordings
    /// are refused until frames arrive again.
    pub async fn camera_lost(&self, reason: String) {
        self.frames.send_replace(None);
        self.stop_recording(Trigger::CameraLost).await;
        self.set_status(Status::CameraFailed(reason));
    }

    /// Make `frame` the latest frame and queue it for the active clip.
    pub async fn publish_frame(&self, frame: CapturedFrame) {
        self.frames.send_replace(Some(frame.clone()));

        let mut slot = self.clip.lock().await;
        let Some(clip) = slot.as_ref() else {
            return;
        };
        match clip.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!(seq = frame.seq, "encoder falling behind, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                self.stop_locked(&mut slot, Trigger::EncoderFailure).await;
            }
        }
    }

    /// Run the trigger policy for one sampled magnitude.
    pub async fn apply_motion(&self, magnitude: Option<f64>, threshold: f64) {
        let mut slot = self.clip.lock().await;
        for action in policy::evaluate_trigger_policy(magnitude, slot.is_some(), threshold) {
            self.apply_locked(&mut slot, action, Trigger::Motion).await;
        }
    }

    /// Align local recording with the server's desired state.
    pub async fn reconcile(&self, desired_recording: bool) {
        let mut slot = self.clip.lock().await;
        if let Some(action) = policy::reconcile_remote_state(desired_recording, slot.is_some()) {
            self.apply_locked(&mut slot, action, Trigger::Remote).await;
        }
    }

    pub async fn start_recording(&self, trigger: Trigger) {
        let mut slot = self.clip.lock().await;
        self.start_locked(&mut slot, trigger).await;
    }

    pub async fn stop_recording(&self, trigger: Trigger) {
        let mut slot = self.clip.lock().await;
        self.stop_locked(&mut slot, trigger).await;
    }

    async fn apply_locked(&self, slot: &mut Option<ActiveClip>, action: Action, trigger: Trigger) {
        match action {
            Action::ReportMotion(magnitude) => self.report_motion(magnitude),
            Action::StartRecording => self.start_locked(slot, trigger).await,
            Action::StopRecording => self.stop_locked(slot, trigger).await,
        }
    }

    fn report_motion(&self, magnitude: f64) {
        info!(magnitude = format!("{:.3}", magnitude), "motion detected");
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.report_motion(magnitude).await {
                debug!(error = %e, "motion report failed");
            }
        });
    }

    async fn start_locked(&self, slot: &mut Option<ActiveClip>, trigger: Trigger) {
        if slot.is_some() {
            debug!(?trigger, "already recording");
            return;
        }
        let Some(first) = self.frames.borrow().clone() else {
            debug!(?trigger, "no camera frames, not starting recording");
            return;
        };

        let start_ms = Utc::now().timestamp_millis();
        let mut encoder = match ClipEncoder::start(start_ms, &self.recording).await {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, ?trigger, "failed to start clip encoder");
                return;
            }
        };

        if let Err(e) = encoder.push_frame(&first.jpeg).await {
            error!(error = %e, "failed to push first frame to new encoder");
            encoder.abort().await;
            return;
        }

        let (tx, rx) = mpsc::channel(CLIP_QUEUE);
        let writer = tokio::spawn(write_frames(encoder, rx, Some(first.seq)));

        info!(?trigger, start_ms, codec = self.recording.codec, "recording started");
        *slot = Some(ActiveClip {
            frames: tx,
            writer,
            start_ms,
            trigger,
        });
        self.set_status(Status::Recording);
    }

    async fn stop_locked(&self, slot: &mut Option<ActiveClip>, trigger: Trigger) {
        let Some(clip) = slot.take() else {
            return;
        };
        info!(
            ?trigger,
            started_by = ?clip.trigger,
            start_ms = clip.start_ms,
            "recording stopped"
        );
        if !matches!(*self.status.borrow(), Status::CameraFailed(_)) {
            self.set_status(Status::Idle);
        }

        let api = Arc::clone(&self.api);
        let mut uploads = self.uploads.lock().await;
        while uploads.try_join_next().is_some() {}
        // Closing the queue lets the writer drain and hand the encoder back.
        drop(clip.frames);
        uploads.spawn(finish_and_upload(clip.writer, api));
    }

    /// Stop recording, wait for pending uploads and release the camera frame.
    pub async fn shutdown(&self) {
        self.stop_recording(Trigger::Shutdown).await;
        self.frames.send_replace(None);

        let mut uploads = self.uploads.lock().await;
        let pending = uploads.len();
        if pending > 0 {
            info!(pending, "waiting for clip uploads");
            let drained = tokio::time::timeout(self.upload_timeout, async {
                while uploads.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = uploads.len(), "upload wait timed out, abandoning clips");
                uploads.abort_all();
            }
        }
    }
}

async fn finish_and_upload(writer: JoinHandle<ClipEncoder>, api: Arc<ApiClient>) {
    let encoder = match writer.await {
        Ok(encoder) => encoder,
        Err(e) => {
            error!(error = %e, "clip writer task failed, clip lost");
            return;
        }
    };
    let start_ms = encoder.start_ms;
    let clip = match encoder.finish().await {
        Ok(clip) => clip,
        Err(e) => {
            error!(error = %e, start_ms, "encoder finish failed, clip lost");
            return;
        }
    };
    let duration_ms = clip.duration_ms;
    let frames = clip.frame_count;
    let bytes = clip.bytes.len();
    match api.upload_clip(clip).await {
        Ok(receipt) => info!(
            ok = receipt.ok,
            id = receipt.id,
            url = receipt.url,
            duration_ms,
            frames,
            bytes,
            "upload complete"
        ),
        Err(e) => warn!(error = %e, start_ms, duration_ms, "upload failed"),
    }
}

/// Poll the server's desired recording state and reconcile. Failures are dropped.
pub async fn run_status_poll_loop(session: Arc<Session>, api: Arc<ApiClient>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match api.recording_enabled().await {
            Ok(desired) => session.reconcile(desired).await,
            Err(e) => debug!(error = %e, "status poll failed"),
        }
    }
}

/// SIGUSR1 starts a recording, SIGUSR2 stops it.
#[cfg(unix)]
pub async fn run_manual_control(session: Arc<Session>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut start, mut stop) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(start), Ok(stop)) => (start, stop),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "failed to install manual control signals");
            return;
        }
    };

    loop {
        tokio::select! {
            Some(()) = start.recv() => session.start_recording(Trigger::Manual).await,
            Some(()) = stop.recv() => session.stop_recording(Trigger::Manual).await,
            else => return,
        }
    }
}

/// A running session and the repeating tasks attached to it.
pub struct SessionHandle {
    session: Arc<Session>,
    tasks: JoinSet<()>,
}

impl SessionHandle {
    pub fn start(
        config: &Config,
        mode: CaptureMode,
        location: LocationSource,
        api: Arc<ApiClient>,
    ) -> Self {
        let session = Arc::new(Session::new(
            config.recording.clone(),
            Arc::clone(&api),
            Duration::from_secs(config.telemetry.upload_timeout_secs),
        ));
        let mut tasks = JoinSet::new();

        tasks.spawn(capture::run_capture(
            config.capture.clone(),
            mode,
            Arc::clone(&session),
        ));
        tasks.spawn(motion::run_sampling_loop(
            Arc::clone(&session),
            config.motion.clone(),
        ));
        tasks.spawn(run_status_poll_loop(
            Arc::clone(&session),
            Arc::clone(&api),
            Duration::from_millis(config.telemetry.status_poll_interval_ms),
        ));
        tasks.spawn(api::run_heartbeat_loop(
            Arc::clone(&api),
            Duration::from_millis(config.telemetry.heartbeat_interval_ms),
        ));
        tasks.spawn(location::run_location_updates(location, api));
        #[cfg(unix)]
        tasks.spawn(run_manual_control(Arc::clone(&session)));

        Self { session, tasks }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Cancel every repeating task, then finish the session.
    pub async fn stop(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.session.shutdown().await;
    }
}
