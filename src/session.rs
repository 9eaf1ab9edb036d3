//! Session Module
//!
//! The SOS tracking session: the four credentials that identify a live
//! location stream and authorize writes to it.

use serde::{Deserialize, Serialize};

/// An active SOS tracking session.
///
/// A session is either complete or absent. Construct one through
/// [`TrackingSession::from_request`] so that a half-filled session can
/// never exist in memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSession {
    pub sos_id: String,
    pub sos_token: String,
    pub identity_token: String,
    pub user_id: String,
}

// Tokens stay out of logs and panics.
impl std::fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("sos_id", &self.sos_id)
            .field("sos_token", &"<redacted>")
            .field("identity_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl TrackingSession {
    /// Validate a start request and build a session from it.
    pub fn from_request(request: SessionRequest) -> Result<Self, InvalidSessionError> {
        request.missing_fields_result()?;

        Ok(Self {
            sos_id: request.sos_id.unwrap_or_default(),
            sos_token: request.sos_token.unwrap_or_default(),
            identity_token: request.identity_token.unwrap_or_default(),
            user_id: request.user_id.unwrap_or_default(),
        })
    }

    /// Re-check an already-built session (e.g. one read back from disk).
    pub fn validate(&self) -> Result<(), InvalidSessionError> {
        SessionRequest::from(self.clone()).missing_fields_result()
    }
}

/// Start command input. Every field may be absent on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub sos_id: Option<String>,
    pub sos_token: Option<String>,
    #[serde(alias = "idToken")]
    pub identity_token: Option<String>,
    pub user_id: Option<String>,
}

impl SessionRequest {
    /// Fields that are absent or empty, in declaration order.
    pub fn missing_fields(&self) -> Vec<SessionField> {
        [
            (SessionField::SosId, &self.sos_id),
            (SessionField::SosToken, &self.sos_token),
            (SessionField::IdentityToken, &self.identity_token),
            (SessionField::UserId, &self.user_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
        .map(|(field, _)| field)
        .collect()
    }

    fn missing_fields_result(&self) -> Result<(), InvalidSessionError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(InvalidSessionError { missing })
        }
    }
}

impl From<TrackingSession> for SessionRequest {
    fn from(session: TrackingSession) -> Self {
        Self {
            sos_id: Some(session.sos_id),
            sos_token: Some(session.sos_token),
            identity_token: Some(session.identity_token),
            user_id: Some(session.user_id),
        }
    }
}

/// Names of the session fields, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionField {
    #[serde(rename = "sosId")]
    SosId,
    #[serde(rename = "sosToken")]
    SosToken,
    #[serde(rename = "identityToken")]
    IdentityToken,
    #[serde(rename = "userId")]
    UserId,
}

impl std::fmt::Display for SessionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionField::SosId => write!(f, "sosId"),
            SessionField::SosToken => write!(f, "sosToken"),
            SessionField::IdentityToken => write!(f, "identityToken"),
            SessionField::UserId => write!(f, "userId"),
        }
    }
}

/// Start input rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid session, missing: {}", join_fields(.missing))]
pub struct InvalidSessionError {
    pub missing: Vec<SessionField>,
}

fn join_fields(fields: &[SessionField]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
