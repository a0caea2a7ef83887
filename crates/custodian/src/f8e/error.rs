use crate::errors::ErrorCode;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// An endpoint family's structured 4xx error codes, as they appear on the wire.
pub trait ClientErrorCode: Copy + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn from_wire(code: &str) -> Option<Self>;

    fn as_wire(self) -> &'static str;
}

macro_rules! client_error_codes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl ClientErrorCode for $name {
            fn from_wire(code: &str) -> Option<Self> {
                match code {
                    $($wire => Some(Self::$variant),)*
                    _ => None,
                }
            }

            fn as_wire(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_wire())
            }
        }
    };
}

client_error_codes!(CreateAccountClientErrorCode {
    HwAuthPubkeyInUse => "HW_AUTH_PUBKEY_IN_USE",
    AppAuthPubkeyInUse => "APP_AUTH_PUBKEY_IN_USE",
    RecoveryAuthPubkeyInUse => "RECOVERY_AUTH_PUBKEY_IN_USE",
});

client_error_codes!(InitiateAccountDelayNotifyErrorCode {
    CommsVerificationRequired => "COMMS_VERIFICATION_REQUIRED",
    RecoveryAlreadyExists => "RECOVERY_ALREADY_EXISTS",
});

client_error_codes!(CancelDelayNotifyRecoveryErrorCode {
    CommsVerificationRequired => "COMMS_VERIFICATION_REQUIRED",
    NoRecoveryExists => "NO_RECOVERY_EXISTS",
});

client_error_codes!(CompleteDelayNotifyErrorCode {
    NoRecoveryExists => "NO_RECOVERY_EXISTS",
    DelayPeriodNotElapsed => "DELAY_PERIOD_NOT_ELAPSED",
    InvalidSignature => "INVALID_SIGNATURE",
});

client_error_codes!(SocRecClientErrorCode {
    RelationshipNotFound => "RELATIONSHIP_NOT_FOUND",
    InvitationExpired => "INVITATION_EXPIRED",
    InvitationCodeMismatch => "INVITATION_CODE_MISMATCH",
});

/// For endpoints that define no structured client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoClientErrorCode {}

impl ClientErrorCode for NoClientErrorCode {
    fn from_wire(_code: &str) -> Option<Self> {
        None
    }

    fn as_wire(self) -> &'static str {
        match self {}
    }
}

impl fmt::Display for NoClientErrorCode {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

/// A failed server call. `C` is the endpoint family's code enum.
#[derive(Debug, Error)]
pub enum F8eError<C: ClientErrorCode> {
    /// Connect failure or timeout.
    #[error("f8e unreachable: {0}")]
    Networking(String),

    #[error("f8e server error (http {status}): {message}")]
    Server { status: u16, message: String },

    #[error("f8e rejected request: {code}")]
    SpecificClientError { code: C, message: String },

    #[error("f8e rejected request (http {status}): {message}")]
    GeneralClient { status: u16, message: String },

    /// The response could not be understood.
    #[error("unexpected f8e response: {0}")]
    Unhandled(String),
}

impl<C: ClientErrorCode> F8eError<C> {
    pub fn specific(code: C) -> Self {
        Self::SpecificClientError {
            code,
            message: code.as_wire().to_owned(),
        }
    }

    pub fn client_code(&self) -> Option<C> {
        match self {
            Self::SpecificClientError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub const fn is_networking(&self) -> bool {
        matches!(self, Self::Networking(_))
    }

    /// Re-tag an error whose code does not carry over to another endpoint family.
    pub fn generalize<D: ClientErrorCode>(self) -> F8eError<D> {
        match self {
            Self::Networking(m) => F8eError::Networking(m),
            Self::Server { status, message } => F8eError::Server { status, message },
            Self::SpecificClientError { code, message } => F8eError::GeneralClient {
                status: 400,
                message: format!("{code}: {message}"),
            },
            Self::GeneralClient { status, message } => F8eError::GeneralClient { status, message },
            Self::Unhandled(m) => F8eError::Unhandled(m),
        }
    }
}

impl<C: ClientErrorCode> ErrorCode for F8eError<C> {
    fn code(&self) -> &'static str {
        match self {
            Self::Networking(_) => "f8e_networking",
            Self::Server { .. } => "f8e_server_error",
            Self::SpecificClientError { code, .. } => code.as_wire(),
            Self::GeneralClient { .. } => "f8e_client_error",
            Self::Unhandled(_) => "f8e_unhandled",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    code: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Classify a non-2xx response.
///
/// Error bodies look like `{"errors":[{"category":"...","code":"NO_RECOVERY_EXISTS","detail":"..."}]}`.
pub fn from_response<C: ClientErrorCode>(status: u16, body: &str) -> F8eError<C> {
    if status >= 500 {
        return F8eError::Server {
            status,
            message: body.to_owned(),
        };
    }
    let entry = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.errors.into_iter().next());
    match entry {
        Some(e) => {
            let message = e.detail.unwrap_or_else(|| e.code.clone());
            match C::from_wire(&e.code) {
                Some(code) => F8eError::SpecificClientError { code, message },
                None => F8eError::GeneralClient { status, message },
            }
        }
        None => F8eError::GeneralClient {
            status,
            message: body.to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_become_specific_errors() {
        let body = r#"{"errors":[{"category":"INVALID_REQUEST_ERROR","code":"NO_RECOVERY_EXISTS","detail":"nothing to cancel"}]}"#;
        let e = from_response::<CancelDelayNotifyRecoveryErrorCode>(400, body);
        assert_eq!(
            e.client_code(),
            Some(CancelDelayNotifyRecoveryErrorCode::NoRecoveryExists)
        );
        assert_eq!(e.code(), "NO_RECOVERY_EXISTS");
    }

    #[test]
    fn unknown_codes_and_bodies_are_general() {
        let body = r#"{"errors":[{"code":"SOMETHING_NEW"}]}"#;
        let e = from_response::<CancelDelayNotifyRecoveryErrorCode>(409, body);
        assert!(matches!(e, F8eError::GeneralClient { status: 409, .. }));

        let e = from_response::<NoClientErrorCode>(404, "not json");
        assert!(matches!(e, F8eError::GeneralClient { status: 404, .. }));

        let e = from_response::<NoClientErrorCode>(503, "");
        assert!(matches!(e, F8eError::Server { status: 503, .. }));
    }

    #[test]
    fn generalizing_drops_the_family_code() {
        let e = F8eError::specific(InitiateAccountDelayNotifyErrorCode::RecoveryAlreadyExists);
        let g: F8eError<NoClientErrorCode> = e.generalize();
        assert!(matches!(g, F8eError::GeneralClient { .. }));
    }
}
