use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgoraError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Authentication failures reported by the auth provider.
///
/// Provider error codes are mapped onto this enum and shown to the user
/// through [`AuthError::user_message`], never verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid email address")]
    InvalidEmail,

    #[error("user not found")]
    UserNotFound,

    #[error("wrong password")]
    WrongPassword,

    #[error("invalid credentials")]
    InvalidCredential,

    #[error("email already in use")]
    EmailAlreadyInUse,

    #[error("password too weak")]
    WeakPassword,

    #[error("account disabled")]
    UserDisabled,

    #[error("too many attempts")]
    TooManyRequests,

    #[error("network failure")]
    Network,

    #[error("expired or invalid reset link")]
    ExpiredActionCode,

    #[error("unrecognised auth error code: {0}")]
    Unknown(String),
}

/// Display language for user-facing messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    En,
    Fr,
}

impl Locale {
    /// Parse a BCP-47-ish tag such as `fr-FR`; unknown tags fall back to English.
    pub fn from_tag(tag: &str) -> Self {
        match tag.split(['-', '_']).next().map(str::to_ascii_lowercase) {
            Some(lang) if lang == "fr" => Self::Fr,
            _ => Self::En,
        }
    }
}

impl AuthError {
    /// Map a provider error code (`auth/...`) to an [`AuthError`].
    pub fn from_code(code: &str) -> Self {
        match code.trim().trim_start_matches("auth/") {
            "invalid-email" => Self::InvalidEmail,
            "user-not-found" => Self::UserNotFound,
            "wrong-password" => Self::WrongPassword,
            "invalid-credential" | "invalid-login-credentials" => Self::InvalidCredential,
            "email-already-in-use" => Self::EmailAlreadyInUse,
            "weak-password" => Self::WeakPassword,
            "user-disabled" => Self::UserDisabled,
            "too-many-requests" => Self::TooManyRequests,
            "network-request-failed" => Self::Network,
            "expired-action-code" | "invalid-action-code" => Self::ExpiredActionCode,
            _ => Self::Unknown(code.to_string()),
        }
    }

    /// Localised message safe to show in the UI.
    pub fn user_message(&self, locale: Locale) -> &'static str {
        match (self, locale) {
            (Self::InvalidEmail, Locale::En) => "Please enter a valid email address.",
            (Self::InvalidEmail, Locale::Fr) => "Veuillez saisir une adresse e-mail valide.",
            (Self::UserNotFound | Self::WrongPassword | Self::InvalidCredential, Locale::En) => {
                "Incorrect email or password."
            }
            (Self::UserNotFound | Self::WrongPassword | Self::InvalidCredential, Locale::Fr) => {
                "E-mail ou mot de passe incorrect."
            }
            (Self::EmailAlreadyInUse, Locale::En) => "An account already exists for this email.",
            (Self::EmailAlreadyInUse, Locale::Fr) => "Un compte existe déjà pour cet e-mail.",
            (Self::WeakPassword, Locale::En) => "Password must be at least 6 characters.",
            (Self::WeakPassword, Locale::Fr) => {
                "Le mot de passe doit contenir au moins 6 caractères."
            }
            (Self::UserDisabled, Locale::En) => "This account has been disabled.",
            (Self::UserDisabled, Locale::Fr) => "Ce compte a été désactivé.",
            (Self::TooManyRequests, Locale::En) => "Too many attempts. Please try again later.",
            (Self::TooManyRequests, Locale::Fr) => {
                "Trop de tentatives. Veuillez réessayer plus tard."
            }
            (Self::Network, Locale::En) => "Network error. Check your connection.",
            (Self::Network, Locale::Fr) => "Erreur réseau. Vérifiez votre connexion.",
            (Self::ExpiredActionCode, Locale::En) => "This link has expired or was already used.",
            (Self::ExpiredActionCode, Locale::Fr) => "Ce lien a expiré ou a déjà été utilisé.",
            (Self::Unknown(_), Locale::En) => "Something went wrong. Please try again.",
            (Self::Unknown(_), Locale::Fr) => "Une erreur est survenue. Veuillez réessayer.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_provider_codes() {
        assert_eq!(AuthError::from_code("auth/invalid-email"), AuthError::InvalidEmail);
        assert_eq!(AuthError::from_code("weak-password"), AuthError::WeakPassword);
        assert_eq!(
            AuthError::from_code("auth/something-new"),
            AuthError::Unknown("auth/something-new".into())
        );
    }

    #[test]
    fn credential_errors_share_a_message() {
        let wrong = AuthError::WrongPassword.user_message(Locale::En);
        assert_eq!(wrong, AuthError::UserNotFound.user_message(Locale::En));
        assert_eq!(wrong, AuthError::InvalidCredential.user_message(Locale::En));
    }

    #[test]
    fn unknown_codes_never_leak() {
        let err = AuthError::from_code("auth/internal-error: stack trace");
        assert!(!err.user_message(Locale::En).contains("internal"));
        assert!(!err.user_message(Locale::Fr).contains("internal"));
    }

    #[test]
    fn locale_from_tag() {
        assert_eq!(Locale::from_tag("fr-FR"), Locale::Fr);
        assert_eq!(Locale::from_tag("FR"), Locale::Fr);
        assert_eq!(Locale::from_tag("de_DE"), Locale::En);
        assert_eq!(Locale::from_tag(""), Locale::En);
    }
}
