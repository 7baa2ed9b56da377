use crate::engine::{EngineError, codes};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a key was refused by [`KeyRecord::validate`](crate::KeyRecord::validate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKeyReason {
    Expired,
    InvalidRevokedOrDisabled,
    Unusable,
    /// The selected encryption subkey expires in fewer than 200 days.
    ExpiringSoon { days: i64 },
    UnknownAlgorithm(u8),
}

impl fmt::Display for InvalidKeyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidKeyReason::Expired => write!(f, "is expired"),
            InvalidKeyReason::InvalidRevokedOrDisabled => write!(f, "is invalid/revoked/disabled"),
            InvalidKeyReason::Unusable => write!(f, "is unusable"),
            InvalidKeyReason::ExpiringSoon { days } => {
                write!(f, "encryption subkey expires in {days} days")
            }
            InvalidKeyReason::UnknownAlgorithm(code) => {
                write!(f, "uses unknown public key algorithm {code}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum P3Error {
    #[error("key {key} {reason}")]
    InvalidKey {
        key: String,
        reason: InvalidKeyReason,
    },

    #[error("home directory {} has mode {mode:04o}, expected 0700", path.display())]
    PermissionMismatch { path: PathBuf, mode: u32 },

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad password")]
    BadPassword,

    #[error("bad private key")]
    BadPrivateKey,

    #[error("operation canceled")]
    Canceled,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error(transparent)]
    Engine(EngineError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl P3Error {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        P3Error::Filesystem {
            path: path.into(),
            source,
        }
    }
}

impl From<EngineError> for P3Error {
    fn from(err: EngineError) -> Self {
        if err.code != codes::SOURCE_GPGME {
            return P3Error::Engine(err);
        }
        match err.subcode {
            codes::BAD_PASSPHRASE => P3Error::BadPassword,
            codes::DECRYPT_FAILED => P3Error::BadPrivateKey,
            codes::CANCELED => P3Error::Canceled,
            _ => P3Error::Engine(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpgme_codes_map_to_variants() {
        let cases = [
            (codes::BAD_PASSPHRASE, "bad password"),
            (codes::DECRYPT_FAILED, "bad private key"),
            (codes::CANCELED, "operation canceled"),
        ];
        for (subcode, display) in cases {
            let err = P3Error::from(EngineError::gpgme(subcode, "x"));
            assert_eq!(err.to_string(), display);
        }
    }

    #[test]
    fn foreign_source_stays_an_engine_error() {
        let err = P3Error::from(EngineError::new(2, codes::BAD_PASSPHRASE, "agent"));
        assert!(matches!(err, P3Error::Engine(ref e) if e.code == 2));
        assert_eq!(err.to_string(), "engine error (2, 11): agent");
    }

    #[test]
    fn permission_mismatch_shows_octal_mode() {
        let err = P3Error::PermissionMismatch {
            path: PathBuf::from("/tmp/gnupg"),
            mode: 0o755,
        };
        assert_eq!(
            err.to_string(),
            "home directory /tmp/gnupg has mode 0755, expected 0700"
        );
    }
}
