use crate::engine::{EncryptFlags, Engine, EngineKey};
use crate::error::P3Error;
use crate::homedir::{HomeDirectory, default_home};
use crate::key::KeyRecord;
use crate::passphrase::{InteractivePrompt, PassphraseBridge, PasswordSource};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

pub const HOME_ENV: &str = "P3STORE_GPG_HOME";
pub const ARMOR_ENV: &str = "P3STORE_ARMOR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub home: PathBuf,
    /// ASCII-armor ciphertext. Off by default; callers handle their own
    /// transport encoding.
    pub armor: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let home = std::env::var_os(HOME_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        let armor = std::env::var(ARMOR_ENV).is_ok_and(|value| value == "1");
        Self { home, armor }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            armor: false,
        }
    }
}

/// Encrypt/decrypt facade over an [`Engine`] bound to a private home
/// directory.
pub struct EncryptionService<E: Engine> {
    home: HomeDirectory,
    engine: E,
    source: Box<dyn PasswordSource>,
    flags: EncryptFlags,
}

impl<E: Engine> EncryptionService<E> {
    /// Opens a service in `home`, prompting on the terminal for passphrases.
    pub fn open(home: impl Into<PathBuf>) -> Result<Self, P3Error> {
        Self::open_with_source(home, InteractivePrompt)
    }

    pub fn open_with_source(
        home: impl Into<PathBuf>,
        source: impl PasswordSource + 'static,
    ) -> Result<Self, P3Error> {
        let config = ServiceConfig {
            home: home.into(),
            ..ServiceConfig::default()
        };
        Self::with_config(&config, source)
    }

    pub fn with_config(
        config: &ServiceConfig,
        source: impl PasswordSource + 'static,
    ) -> Result<Self, P3Error> {
        let home = HomeDirectory::ensure(config.home.clone())?;
        let engine = E::open(&home)?;
        debug!(engine = engine.name(), home = %home.path().display(), "encryption service ready");
        Ok(Self {
            home,
            engine,
            source: Box::new(source),
            flags: EncryptFlags {
                armor: config.armor,
                ..EncryptFlags::default()
            },
        })
    }

    pub fn home(&self) -> &HomeDirectory {
        &self.home
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub(crate) fn password_source(&self) -> &dyn PasswordSource {
        self.source.as_ref()
    }

    /// Looks up a public key by fingerprint, key id or user id and
    /// validates it.
    pub fn lookup_key(&self, id: &str) -> Result<KeyRecord, P3Error> {
        let key = self.engine.lookup_key(id, false).map_err(|err| {
            if err.is_not_found() {
                P3Error::KeyNotFound(id.to_string())
            } else {
                P3Error::from(err)
            }
        })?;
        KeyRecord::validate(key)
    }

    /// Imports certificates (public or secret) into the keyring and returns
    /// their fingerprints.
    pub fn import_keys(&self, bytes: &[u8]) -> Result<Vec<String>, P3Error> {
        let keys = self.engine.import(bytes)?;
        debug!(count = keys.len(), "imported keys");
        Ok(keys.into_iter().map(|key| key.fingerprint).collect())
    }

    /// Unvalidated keyring listing.
    pub fn list_keys(&self, secret_only: bool) -> Result<Vec<EngineKey>, P3Error> {
        Ok(self.engine.list_keys(secret_only)?)
    }

    /// Encrypts `input` to every recipient and rewinds `output` to its
    /// start.
    pub fn encrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        recipients: &[KeyRecord],
    ) -> Result<(), P3Error>
    where
        R: Read,
        W: Write + Seek,
    {
        if recipients.is_empty() {
            return Err(P3Error::InvalidArgument(
                "at least one recipient is required".to_string(),
            ));
        }
        let keys: Vec<&EngineKey> = recipients.iter().map(KeyRecord::key).collect();
        debug!(recipients = keys.len(), armor = self.flags.armor, "encrypting");
        self.engine.encrypt(&keys, self.flags, input, output)?;
        output.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Decrypts `input` with whichever private key the engine finds and
    /// rewinds `output` to its start.
    pub fn decrypt<R, W>(&self, input: &mut R, output: &mut W) -> Result<(), P3Error>
    where
        R: Read,
        W: Write + Seek,
    {
        debug!("decrypting");
        let mut bridge = PassphraseBridge::new(self);
        let outcome = self.engine.decrypt(input, output, &mut bridge);
        if let Some(err) = bridge.take_lookup_error() {
            return Err(err);
        }
        outcome?;
        output.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Removes the home directory. The service is consumed.
    pub fn destroy(self) -> Result<(), P3Error> {
        self.home.destroy()
    }
}

impl<E: Engine> std::fmt::Debug for EncryptionService<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("engine", &self.engine.name())
            .field("home", &self.home.path())
            .field("flags", &self.flags)
            .finish()
    }
}
