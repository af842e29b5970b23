//! Exclusive voice recording session.
//!
//! The microphone is held through a [`MicrophoneLease`] for exactly as long
//! as a recording runs. Every exit path (stop, cancel, assembly failure,
//! drop) releases it, and releasing twice is a no-op.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::domain::{AudioAttachment, MessageBody};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tracing::{info, warn};

use crate::{error::RecordingError, format::format_duration, ClientEvent};

pub const DEFAULT_AUDIO_MIME: &str = "audio/wav";

/// How long a released device may take to close its chunk stream.
const RELEASE_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Platform handle for an acquired input device.
pub trait DeviceHandle: Send {
    fn release(&mut self) -> anyhow::Result<()>;
}

/// A live capture: encoded chunks arrive on `chunks` until the device is
/// released. A device may deliver its buffered tail on release, then
/// closes the stream.
pub struct CaptureStream {
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    pub mime_type: String,
    pub device: Box<dyn DeviceHandle>,
}

#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<CaptureStream>;
}

pub struct MissingMicrophone;

#[async_trait]
impl Microphone for MissingMicrophone {
    async fn acquire(&self) -> anyhow::Result<CaptureStream> {
        Err(anyhow!("no audio input device is available"))
    }
}

pub struct MicrophoneLease {
    device: Option<Box<dyn DeviceHandle>>,
}

impl MicrophoneLease {
    fn new(device: Box<dyn DeviceHandle>) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn release(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        match device.release() {
            Ok(()) => info!("recording: microphone released"),
            Err(err) => warn!("recording: microphone release reported an error: {err}"),
        }
    }
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopped,
}

/// The assembled recording, ready to be sent as an audio message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    pub data_url: String,
    pub mime_type: String,
    pub duration_secs: u32,
}

impl VoiceClip {
    pub fn message_text(&self) -> String {
        format!("🎤 Voice message ({})", format_duration(self.duration_secs))
    }

    pub fn body(&self) -> MessageBody {
        MessageBody::Audio(AudioAttachment {
            file_url: self.data_url.clone(),
            file_type: Some(self.mime_type.clone()),
            duration_secs: Some(self.duration_secs),
        })
    }
}

struct ActiveRecording {
    stop: oneshot::Sender<()>,
    capture: JoinHandle<Vec<Vec<u8>>>,
    lease: MicrophoneLease,
    elapsed: Arc<AtomicU32>,
    mime_type: String,
}

enum RecorderSession {
    Idle,
    Recording(ActiveRecording),
    Stopped,
}

pub struct AudioRecorder {
    microphone: Arc<dyn Microphone>,
    tick: Duration,
    session: Mutex<RecorderSession>,
    events: broadcast::Sender<ClientEvent>,
}

impl AudioRecorder {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        tick: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            microphone,
            tick,
            session: Mutex::new(RecorderSession::Idle),
            events,
        }
    }

    pub async fn state(&self) -> RecordingState {
        match *self.session.lock().await {
            RecorderSession::Idle => RecordingState::Idle,
            RecorderSession::Recording(_) => RecordingState::Recording,
            RecorderSession::Stopped => RecordingState::Stopped,
        }
    }

    pub async fn elapsed_secs(&self) -> u32 {
        match &*self.session.lock().await {
            RecorderSession::Recording(active) => active.elapsed.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub async fn start(&self) -> Result<(), RecordingError> {
        let mut session = self.session.lock().await;
        if matches!(*session, RecorderSession::Recording(_)) {
            return Err(RecordingError::AlreadyRecording);
        }

        let stream = match self.microphone.acquire().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("recording: microphone unavailable: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::Warning("Could not access microphone".into()));
                return Err(RecordingError::MicrophoneAccessDenied(err.to_string()));
            }
        };

        let CaptureStream {
            chunks,
            mime_type,
            device,
        } = stream;
        let elapsed = Arc::new(AtomicU32::new(0));
        let (stop, stop_rx) = oneshot::channel();
        let capture = tokio::spawn(capture(
            chunks,
            stop_rx,
            self.tick,
            Arc::clone(&elapsed),
            self.events.clone(),
        ));

        *session = RecorderSession::Recording(ActiveRecording {
            stop,
            capture,
            lease: MicrophoneLease::new(device),
            elapsed,
            mime_type,
        });
        info!("recording: started");
        let _ = self
            .events
            .send(ClientEvent::RecordingStateChanged(RecordingState::Recording));
        Ok(())
    }

    /// Ends the recording and assembles the clip. The microphone is
    /// released before assembly, so it is freed even when nothing usable
    /// was captured.
    pub async fn stop(&self) -> Result<VoiceClip, RecordingError> {
        let mut session = self.session.lock().await;
        let active = match std::mem::replace(&mut *session, RecorderSession::Stopped) {
            RecorderSession::Recording(active) => active,
            other => {
                *session = other;
                return Err(RecordingError::NotRecording);
            }
        };

        let (chunks, duration_secs, mime_type) = finish(active).await;
        let _ = self
            .events
            .send(ClientEvent::RecordingStateChanged(RecordingState::Stopped));
        info!(duration_secs, chunks = chunks.len(), "recording: stopped");
        assemble(chunks, mime_type, duration_secs)
    }

    /// Stops without producing a clip. Returns whether a recording was
    /// running.
    pub async fn cancel(&self) -> bool {
        let mut session = self.session.lock().await;
        match std::mem::replace(&mut *session, RecorderSession::Idle) {
            RecorderSession::Recording(active) => {
                finish(active).await;
                info!("recording: cancelled");
                let _ = self
                    .events
                    .send(ClientEvent::RecordingStateChanged(RecordingState::Idle));
                true
            }
            other => {
                *session = other;
                false
            }
        }
    }
}

async fn finish(active: ActiveRecording) -> (Vec<Vec<u8>>, u32, String) {
    let ActiveRecording {
        stop,
        capture,
        mut lease,
        elapsed,
        mime_type,
    } = active;
    lease.release();
    let _ = stop.send(());
    let chunks = match capture.await {
        Ok(chunks) => chunks,
        Err(err) => {
            warn!("recording: capture task ended abnormally: {err}");
            Vec::new()
        }
    };
    (chunks, elapsed.load(Ordering::Relaxed), mime_type)
}

async fn capture(
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop: oneshot::Receiver<()>,
    tick: Duration,
    elapsed: Arc<AtomicU32>,
    events: broadcast::Sender<ClientEvent>,
) -> Vec<Vec<u8>> {
    let mut buffered = Vec::new();
    let mut ticker = interval_at(Instant::now() + tick, tick);
    let mut capturing = true;
    loop {
        tokio::select! {
            biased;
            _ = ticker.tick() => {
                let elapsed_secs = elapsed.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = events.send(ClientEvent::RecordingTick { elapsed_secs });
            }
            chunk = chunks.recv(), if capturing => match chunk {
                Some(chunk) => buffered.push(chunk),
                None => capturing = false,
            },
            _ = &mut stop => break,
        }
    }
    if capturing {
        while let Ok(Some(chunk)) = timeout(RELEASE_FLUSH_GRACE, chunks.recv()).await {
            buffered.push(chunk);
        }
    }
    buffered
}

fn assemble(
    chunks: Vec<Vec<u8>>,
    mime_type: String,
    duration_secs: u32,
) -> Result<VoiceClip, RecordingError> {
    let audio = chunks.concat();
    if audio.is_empty() {
        return Err(RecordingError::EmptyCapture);
    }
    let mime_type = if mime_type.trim().is_empty() {
        DEFAULT_AUDIO_MIME.to_string()
    } else {
        mime_type
    };
    Ok(VoiceClip {
        data_url: format!("data:{mime_type};base64,{}", STANDARD.encode(audio)),
        mime_type,
        duration_secs,
    })
}
