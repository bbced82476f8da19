use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use surveil_common::config::CaptureConfig;
use surveil_common::frame::CapturedFrame;
use tracing::{debug, error, info, warn};

use crate::session::Session;

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("unknown capture mode {0:?}, expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera stream ended")]
    StreamEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// `multipart/x-mixed-replace` stream of JPEG parts.
    Mjpeg,
    /// One JPEG per request, fetched at the configured fps.
    Polling,
}

impl FromStr for CaptureMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mjpeg" => Ok(CaptureMode::Mjpeg),
            "polling" => Ok(CaptureMode::Polling),
            other => Err(CaptureError::UnknownMode(other.to_string())),
        }
    }
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter turning MJPEG body chunks into JPEG payloads.
pub struct MjpegSplitter {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one body chunk; returns every JPEG completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY) {
                        let jpeg_end = self.jpeg_start + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2
                            && self.buffer[jpeg_end - 2] == b'\r'
                            && self.buffer[jpeg_end - 1] == b'\n'
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };

                        let mut part = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                        part.truncate(end);
                        if !part.is_empty() {
                            frames.push(part.freeze());
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Avoid re-scanning bytes already known to hold no boundary
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    }
                }
            }
        }

        frames
    }
}

fn next_frame(jpeg: Bytes) -> CapturedFrame {
    let seq = SEQ_COUNTER.fetch_add(1, Ordering::Relaxed);
    CapturedFrame::new(jpeg, Utc::now().timestamp_millis(), seq)
}

/// Read frames from the camera into `session` until the task is aborted.
///
/// A failure is surfaced as the session status. Without `reconnect` the
/// source then stays down; with it, reconnects use exponential backoff.
pub async fn run_capture(config: CaptureConfig, mode: CaptureMode, session: Arc<Session>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = config.url, ?mode, "connecting to camera");
        let result = match mode {
            CaptureMode::Mjpeg => consume_stream(&config.url, &session).await,
            CaptureMode::Polling => {
                let interval = Duration::from_secs_f64(1.0 / config.fps);
                poll_frames(&config.url, interval, &session).await
            }
        };
        let reason = match result {
            Ok(()) => {
                backoff = Duration::from_secs(2);
                CaptureError::StreamEnded.to_string()
            }
            Err(e) => e.to_string(),
        };
        error!(reason, "camera capture failed");
        session.camera_lost(reason).await;

        if !config.reconnect {
            return;
        }
        info!("reconnecting to camera in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, session: &Session) -> Result<(), CaptureError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(CaptureError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(CaptureError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(CaptureError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");
    session.camera_ready();

    let mut byte_stream = response.bytes_stream();
    let mut splitter = MjpegSplitter::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CaptureError::HttpStream)?;
        for jpeg in splitter.feed(&chunk) {
            let frame = next_frame(jpeg);
            debug!(seq = frame.seq, bytes = frame.jpeg.len(), "captured frame");
            session.publish_frame(frame).await;
        }
    }

    Ok(())
}

/// Polling fallback: fetch single frames on a fixed interval.
///
/// A failed fetch marks the camera as lost once; the next good frame marks it
/// ready again. Only a client build failure ends the loop.
async fn poll_frames(url: &str, interval: Duration, session: &Session) -> Result<(), CaptureError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(CaptureError::HttpConnect)?;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut down = false;

    loop {
        ticker.tick().await;

        match fetch_frame(&client, url).await {
            Ok(jpeg) => {
                if down {
                    info!("camera frames recovered");
                    down = false;
                }
                session.publish_frame(next_frame(jpeg)).await;
                session.camera_ready();
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
                if !down {
                    down = true;
                    session.camera_lost(e.to_string()).await;
                }
            }
        }
    }
}

async fn fetch_frame(client: &reqwest::Client, url: &str) -> Result<Bytes, CaptureError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(CaptureError::HttpConnect)?;
    if !resp.status().is_success() {
        return Err(CaptureError::HttpStatus(resp.status().as_u16()));
    }
    resp.bytes().await.map_err(CaptureError::HttpStream)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
