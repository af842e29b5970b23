use async_trait::async_trait;
use reqwest::{multipart, Client, Response};
use shared::{
    domain::{ChatMessage, Room, RoomId, UserId},
    error::{ErrorBody, ErrorCode},
    protocol::{ApiEnvelope, CreateRoomRequest, CreatedRoom, OnlineUsersResponse, UploadResponse},
};
use tracing::debug;

use crate::{config::ClientSettings, error::ApiError, uploads::LocalFile};

/// REST surface of the chat backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError>;
    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ApiError>;
    async fn fetch_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, ApiError>;
    /// Returns the url under which the stored file is served.
    async fn upload_file(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        file: &LocalFile,
    ) -> Result<String, ApiError>;
    async fn online_users(&self) -> Result<Vec<UserId>, ApiError>;
}

pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        Err(ApiError::Unavailable("chat api is unavailable".into()))
    }

    async fn create_room(&self, _request: CreateRoomRequest) -> Result<Room, ApiError> {
        Err(ApiError::Unavailable("chat api is unavailable".into()))
    }

    async fn fetch_messages(&self, _room_id: &RoomId) -> Result<Vec<ChatMessage>, ApiError> {
        Err(ApiError::Unavailable("chat api is unavailable".into()))
    }

    async fn upload_file(
        &self,
        _room_id: &RoomId,
        _sender_id: &UserId,
        _file: &LocalFile,
    ) -> Result<String, ApiError> {
        Err(ApiError::Unavailable("upload service is unavailable".into()))
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ApiError> {
        Err(ApiError::Unavailable("chat api is unavailable".into()))
    }
}

pub struct HttpChatApi {
    http: Client,
    settings: ClientSettings,
}

impl HttpChatApi {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            http: Client::new(),
            settings,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Maps a non-success status to [`ApiError::Rejected`], reading the
/// backend's `{"detail": ...}` body when present.
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    Err(ApiError::Rejected {
        status: status.as_u16(),
        code: ErrorCode::from_status(status.as_u16()),
        detail: body.detail,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        let response = self
            .authorize(self.http.get(self.settings.api_url("rooms")))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, ApiError> {
        let response = self
            .authorize(self.http.post(self.settings.api_url("rooms")))
            .json(&request)
            .send()
            .await?;
        let envelope: ApiEnvelope<CreatedRoom> = check_status(response).await?.json().await?;
        debug!(message = %envelope.message, "api: room created");
        Ok(envelope.data.room)
    }

    async fn fetch_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, ApiError> {
        let path = format!("rooms/{}/messages", room_id.as_str());
        let response = self
            .authorize(self.http.get(self.settings.api_url(&path)))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn upload_file(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        file: &LocalFile,
    ) -> Result<String, ApiError> {
        let part = multipart::Part::bytes(file.bytes.clone())
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .map_err(|err| ApiError::Decode(format!("invalid mime type: {err}")))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("room_id", room_id.as_str().to_string())
            .text("sender_id", sender_id.as_str().to_string());

        let response = self
            .authorize(self.http.post(self.settings.api_url("upload")))
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        Ok(uploaded.file_url)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, ApiError> {
        let response = self
            .authorize(self.http.get(self.settings.api_url("online-users")))
            .send()
            .await?;
        let body: OnlineUsersResponse = check_status(response).await?.json().await?;
        Ok(body.online_users)
    }
}
