use crate::homedir::HomeDirectory;
use crate::passphrase::PassphraseCallback;
use std::io::{Read, Write};
use std::time::SystemTime;
use thiserror::Error;

/// libgpg-error style codes. `code` is the error source, `subcode` the error
/// number within it.
pub mod codes {
    pub const SOURCE_GPGME: u32 = 7;

    pub const GENERAL: u32 = 1;
    pub const BAD_PASSPHRASE: u32 = 11;
    pub const UNUSABLE_PUBKEY: u32 = 53;
    pub const INV_VALUE: u32 = 55;
    pub const NO_DATA: u32 = 58;
    pub const CANCELED: u32 = 99;
    pub const AMBIGUOUS_NAME: u32 = 107;
    pub const DECRYPT_FAILED: u32 = 152;
    pub const EOF: u32 = 16383;
    pub const EIO: u32 = 32773;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error ({code}, {subcode}): {message}")]
pub struct EngineError {
    pub code: u32,
    pub subcode: u32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: u32, subcode: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            subcode,
            message: message.into(),
        }
    }

    pub fn gpgme(subcode: u32, message: impl Into<String>) -> Self {
        Self::new(codes::SOURCE_GPGME, subcode, message)
    }

    pub fn canceled() -> Self {
        Self::gpgme(codes::CANCELED, "Operation cancelled")
    }

    pub fn bad_passphrase() -> Self {
        Self::gpgme(codes::BAD_PASSPHRASE, "Bad passphrase")
    }

    pub fn decrypt_failed(message: impl Into<String>) -> Self {
        Self::gpgme(codes::DECRYPT_FAILED, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::gpgme(codes::NO_DATA, message)
    }

    pub fn not_found(id: &str) -> Self {
        Self::gpgme(codes::EOF, format!("no key matches {id}"))
    }

    pub fn io(err: std::io::Error) -> Self {
        Self::gpgme(codes::EIO, err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        self.code == codes::SOURCE_GPGME && self.subcode == codes::EOF
    }
}

/// Public key algorithm of a (sub)key, as the RFC 4880 numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubkeyAlgo {
    Rsa,
    ElgamalEncrypt,
    Dsa,
    Unknown(u8),
}

impl PubkeyAlgo {
    pub fn label(self) -> Option<&'static str> {
        match self {
            PubkeyAlgo::Rsa => Some("RSA"),
            PubkeyAlgo::ElgamalEncrypt => Some("ELG-E"),
            PubkeyAlgo::Dsa => Some("DSA"),
            PubkeyAlgo::Unknown(_) => None,
        }
    }
}

impl From<u8> for PubkeyAlgo {
    fn from(code: u8) -> Self {
        match code {
            1 => PubkeyAlgo::Rsa,
            16 => PubkeyAlgo::ElgamalEncrypt,
            17 => PubkeyAlgo::Dsa,
            other => PubkeyAlgo::Unknown(other),
        }
    }
}

impl From<PubkeyAlgo> for u8 {
    fn from(algo: PubkeyAlgo) -> Self {
        match algo {
            PubkeyAlgo::Rsa => 1,
            PubkeyAlgo::ElgamalEncrypt => 16,
            PubkeyAlgo::Dsa => 17,
            PubkeyAlgo::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUserId {
    pub uid: String,
    pub name: String,
    pub email: String,
}

impl EngineUserId {
    /// Splits `Name (Comment) <email>` into its parts. Missing parts are
    /// empty.
    pub fn parse(uid: &str) -> Self {
        let email = match (uid.rfind('<'), uid.rfind('>')) {
            (Some(start), Some(end)) if start < end => uid[start + 1..end].trim().to_string(),
            _ if uid.contains('@') && !uid.contains(' ') => uid.trim().to_string(),
            _ => String::new(),
        };
        let name_end = uid.find(['(', '<']).unwrap_or(uid.len());
        let name = if email == uid.trim() {
            String::new()
        } else {
            uid[..name_end].trim().to_string()
        };
        Self {
            uid: uid.to_string(),
            name,
            email,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSubkey {
    /// 16 hex digit key id.
    pub key_id: String,
    pub algo: PubkeyAlgo,
    pub can_sign: bool,
    pub can_encrypt: bool,
    pub secret: bool,
    pub expired: bool,
    pub invalid: bool,
    pub revoked: bool,
    pub disabled: bool,
    pub expires: Option<SystemTime>,
}

/// Snapshot of an engine key handle. The primary key is the first entry of
/// `subkeys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineKey {
    pub fingerprint: String,
    pub expired: bool,
    pub invalid: bool,
    pub revoked: bool,
    pub disabled: bool,
    pub can_encrypt: bool,
    pub secret: bool,
    pub user_ids: Vec<EngineUserId>,
    pub subkeys: Vec<EngineSubkey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptFlags {
    /// Skip the trust model check on recipient keys.
    pub always_trust: bool,
    pub armor: bool,
}

impl Default for EncryptFlags {
    fn default() -> Self {
        Self {
            always_trust: true,
            armor: false,
        }
    }
}

/// The OpenPGP implementation behind the service.
pub trait Engine {
    fn open(home: &HomeDirectory) -> Result<Self, EngineError>
    where
        Self: Sized;

    fn name(&self) -> &'static str;

    fn lookup_key(&self, id: &str, secret_only: bool) -> Result<EngineKey, EngineError>;
    fn list_keys(&self, secret_only: bool) -> Result<Vec<EngineKey>, EngineError>;
    fn import(&self, bytes: &[u8]) -> Result<Vec<EngineKey>, EngineError>;

    fn encrypt(
        &self,
        recipients: &[&EngineKey],
        flags: EncryptFlags,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), EngineError>;

    /// Decrypts `input` into `output`, asking `passphrase` for the secret of
    /// any protected private key it needs.
    fn decrypt(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        passphrase: &mut dyn PassphraseCallback,
    ) -> Result<(), EngineError>;
}
