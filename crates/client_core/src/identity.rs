//! Session identity and the display-name precedence rules.

use serde::{Deserialize, Serialize};
use shared::domain::{ChatMessage, UserId};

/// Who this session speaks as. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Builds the identity from a stored profile using
    /// [`resolve_display_name`].
    pub fn from_profile(user_id: impl Into<UserId>, profile: &StoredProfile) -> Self {
        let user_id = user_id.into();
        let display_name = resolve_display_name(&user_id, profile);
        Self {
            user_id,
            display_name,
        }
    }
}

/// Profile fields as persisted by the sign-in flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProfile {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// First name, then username, then the e-mail local part, then the raw id.
pub fn resolve_display_name(user_id: &UserId, profile: &StoredProfile) -> String {
    non_blank(profile.first_name.as_deref())
        .or_else(|| non_blank(profile.username.as_deref()))
        .or_else(|| {
            non_blank(profile.email.as_deref())
                .map(email_local_part)
                .and_then(|local| non_blank(Some(local)))
        })
        .map(str::to_string)
        .unwrap_or_else(|| user_id.as_str().to_string())
}

/// `ana@example.com` -> `ana`; ids without `@` are returned as-is.
pub fn label_for_user_id(user_id: &UserId) -> String {
    email_local_part(user_id.as_str()).to_string()
}

/// Name shown next to a message: the sender's name if present, else the
/// local part of the sender id.
pub fn sender_label(message: &ChatMessage) -> String {
    match non_blank(Some(message.sender_name.as_str())) {
        Some(name) => name.to_string(),
        None => label_for_user_id(&message.sender_id),
    }
}

fn email_local_part(value: &str) -> &str {
    value.split('@').next().unwrap_or(value)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
