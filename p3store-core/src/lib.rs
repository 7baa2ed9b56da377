//! Encryption facade in front of an OpenPGP engine.
//!
//! Keys are validated into [`KeyRecord`]s before use, the engine's state
//! lives in an owner-only [`HomeDirectory`], and passphrases reach the
//! engine through the [`PassphraseBridge`] from a pluggable
//! [`PasswordSource`] without being stored.

mod engine;
mod error;
mod homedir;
mod key;
mod passphrase;
mod service;
mod terminal;

pub use engine::{
    EncryptFlags, Engine, EngineError, EngineKey, EngineSubkey, EngineUserId, PubkeyAlgo, codes,
};
pub use error::{InvalidKeyReason, P3Error};
pub use homedir::{HOME_MODE, HomeDirectory, default_home};
pub use key::{KeyRecord, MIN_REMAINING_DAYS};
pub use passphrase::{
    CallbackStatus, InteractivePrompt, PassphraseBridge, PassphraseCallback, PassphraseChannel,
    PassphraseReply, PassphraseRequest, PasswordError, PasswordSource, deliver,
};
pub use service::{ARMOR_ENV, EncryptionService, HOME_ENV, ServiceConfig};
pub use terminal::sanitize_for_terminal;
