//! File upload tasks. Each file is uploaded on its own task and always ends
//! as a chat message: a `file` message on success, a text fallback
//! otherwise.

use std::{collections::HashMap, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{FileAttachment, MessageBody, RoomId, UploadId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    api::ChatApi,
    connection::ConnectionHandle,
    error::{ApiError, UploadError},
    identity::SessionIdentity,
    ClientEvent,
};

pub const UPLOAD_UNAVAILABLE_WARNING: &str = "File upload service unavailable. Sent as text.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name).to_string();
        Self {
            name,
            mime_type,
            bytes,
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| UploadError::ReadFile {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, bytes))
    }
}

fn guess_mime_type(name: &str) -> &'static str {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
}

/// One entry of the in-flight set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub id: UploadId,
    pub file_name: String,
    pub size_bytes: usize,
    pub room_id: RoomId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Shared { file_url: String },
    FellBack { reason: String },
}

#[derive(Clone)]
pub struct UploadPipeline {
    identity: SessionIdentity,
    api: Arc<dyn ChatApi>,
    connection: ConnectionHandle,
    in_flight: Arc<Mutex<HashMap<UploadId, UploadTask>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl UploadPipeline {
    pub fn new(
        identity: SessionIdentity,
        api: Arc<dyn ChatApi>,
        connection: ConnectionHandle,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            identity,
            api,
            connection,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Oldest first.
    pub async fn in_flight(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<_> = self.in_flight.lock().await.values().cloned().collect();
        tasks.sort_by_key(|task| task.started_at);
        tasks
    }

    /// Registers the task and starts it. The task is in the in-flight set
    /// by the time this returns and leaves it once the message is sent.
    pub async fn submit(&self, room_id: RoomId, file: LocalFile) -> JoinHandle<UploadOutcome> {
        let task = UploadTask {
            id: UploadId::generate(),
            file_name: file.name.clone(),
            size_bytes: file.bytes.len(),
            room_id: room_id.clone(),
            started_at: Utc::now(),
        };
        self.in_flight
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        info!(
            upload_id = %task.id,
            room_id = %room_id,
            file = %task.file_name,
            size_bytes = task.size_bytes,
            "uploads: started"
        );
        let _ = self.events.send(ClientEvent::UploadStarted(task.clone()));

        let pipeline = self.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(&task, &file).await;
            pipeline.in_flight.lock().await.remove(&task.id);
            let _ = pipeline.events.send(ClientEvent::UploadSettled {
                id: task.id.clone(),
                outcome: outcome.clone(),
            });
            outcome
        })
    }

    async fn run(&self, task: &UploadTask, file: &LocalFile) -> UploadOutcome {
        let result = self
            .api
            .upload_file(&task.room_id, &self.identity.user_id, file)
            .await;

        let (content, body, outcome) = match result {
            Ok(file_url) => (
                format!("📎 {}", file.name),
                MessageBody::File(FileAttachment {
                    file_url: file_url.clone(),
                    file_name: file.name.clone(),
                    file_type: Some(file.mime_type.clone()),
                }),
                UploadOutcome::Shared { file_url },
            ),
            Err(err) => {
                warn!(upload_id = %task.id, file = %file.name, "uploads: failed: {err}");
                let (content, warning) = fallback_text(&file.name, &err);
                let _ = self.events.send(ClientEvent::Warning(warning));
                (
                    content,
                    MessageBody::Text,
                    UploadOutcome::FellBack {
                        reason: err.to_string(),
                    },
                )
            }
        };

        let sent = self
            .connection
            .send(&task.room_id, &content, &self.identity.display_name, &body)
            .await;
        if !sent.is_sent() {
            warn!(upload_id = %task.id, ?sent, "uploads: result message not delivered");
        }
        outcome
    }
}

/// Text sent in place of the file, plus the warning shown to the user.
fn fallback_text(file_name: &str, err: &ApiError) -> (String, String) {
    match err {
        ApiError::Rejected { status, .. } => (
            format!("📎 {file_name} (upload not available)"),
            format!("Upload of {file_name} was rejected ({status}). Sent as text."),
        ),
        ApiError::Unavailable(_) | ApiError::Decode(_) => (
            format!("📎 {file_name} (upload failed)"),
            UPLOAD_UNAVAILABLE_WARNING.to_string(),
        ),
    }
}
