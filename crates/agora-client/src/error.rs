use thiserror::Error;

use agora_shared::{AgoraError, AuthError, Locale};
use agora_store::StoreError;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Local storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shared(#[from] AgoraError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No user signed in")]
    NotSignedIn,
}

impl From<AuthError> for ClientError {
    fn from(e: AuthError) -> Self {
        Self::Shared(AgoraError::Auth(e))
    }
}

impl ClientError {
    /// Message safe to show in the UI.  Raw backend and provider errors
    /// are never surfaced.
    pub fn user_message(&self, locale: Locale) -> String {
        let pick = |en: &str, fr: &str| match locale {
            Locale::En => en.to_string(),
            Locale::Fr => fr.to_string(),
        };
        match self {
            Self::Shared(AgoraError::Auth(auth)) => auth.user_message(locale).to_string(),
            Self::Backend(e) if e.is_permission_error() => pick(
                "You don't have access to this.",
                "Vous n'avez pas accès à cette ressource.",
            ),
            Self::Backend(BackendError::NotFound(_)) => {
                pick("This item no longer exists.", "Élément introuvable.")
            }
            Self::Backend(BackendError::Unavailable(_)) | Self::Http(_) => {
                AuthError::Network.user_message(locale).to_string()
            }
            Self::InvalidInput(reason) => reason.clone(),
            Self::NotSignedIn => pick("Please sign in.", "Veuillez vous connecter."),
            _ => AuthError::Unknown(String::new())
                .user_message(locale)
                .to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
