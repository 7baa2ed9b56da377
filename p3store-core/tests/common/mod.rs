#![allow(dead_code)]

use p3store_core::{
    EncryptFlags, Engine, EngineError, EngineKey, EngineSubkey, EngineUserId, HomeDirectory,
    PassphraseCallback, PassphraseChannel, PubkeyAlgo,
};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::time::SystemTime;

pub const MASK: u8 = 0x5a;

pub fn subkey(key_id: &str, algo: PubkeyAlgo, can_sign: bool, can_encrypt: bool) -> EngineSubkey {
    EngineSubkey {
        key_id: key_id.to_string(),
        algo,
        can_sign,
        can_encrypt,
        secret: false,
        expired: false,
        invalid: false,
        revoked: false,
        disabled: false,
        expires: None,
    }
}

/// RSA sign primary + RSA encryption subkey, no expiry.
pub fn walter() -> EngineKey {
    EngineKey {
        fingerprint: "E08B48D4923B68D03CE8274DAF386C4BFA33BF5B".to_string(),
        expired: false,
        invalid: false,
        revoked: false,
        disabled: false,
        can_encrypt: true,
        secret: false,
        user_ids: vec![EngineUserId::parse(
            "Walter Example <Walter-RSA-RSA@Example.com>",
        )],
        subkeys: vec![
            subkey("AF386C4BFA33BF5B", PubkeyAlgo::Rsa, true, false),
            subkey("E41BEA77E2F8AB82", PubkeyAlgo::Rsa, false, true),
        ],
    }
}

pub fn walter_expiring(expires: SystemTime) -> EngineKey {
    let mut key = walter();
    key.subkeys[1].expires = Some(expires);
    key
}

#[derive(Debug, Clone)]
pub enum DecryptBehavior {
    /// Ask for `expected` up to `attempts` times, using `hint` as uid hint.
    Prompt {
        hint: Option<String>,
        expected: String,
        attempts: u32,
    },
    Fail(EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRecord {
    pub prev_was_bad: bool,
    pub status: u32,
    pub written: Vec<u8>,
    pub closed: bool,
}

/// In-memory engine with a toy cipher and a scripted passphrase exchange.
pub struct FakeEngine {
    keys: RefCell<Vec<EngineKey>>,
    behavior: RefCell<DecryptBehavior>,
    pub callbacks: RefCell<Vec<CallbackRecord>>,
    pub encrypted_to: RefCell<Vec<String>>,
}

impl FakeEngine {
    pub fn add_key(&self, key: EngineKey) {
        self.keys.borrow_mut().push(key);
    }

    pub fn set_behavior(&self, behavior: DecryptBehavior) {
        *self.behavior.borrow_mut() = behavior;
    }
}

impl Engine for FakeEngine {
    fn open(_home: &HomeDirectory) -> Result<Self, EngineError> {
        Ok(Self {
            keys: RefCell::new(Vec::new()),
            behavior: RefCell::new(DecryptBehavior::Prompt {
                hint: None,
                expected: String::new(),
                attempts: 1,
            }),
            callbacks: RefCell::new(Vec::new()),
            encrypted_to: RefCell::new(Vec::new()),
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn lookup_key(&self, id: &str, _secret_only: bool) -> Result<EngineKey, EngineError> {
        let needle = id.to_uppercase();
        self.keys
            .borrow()
            .iter()
            .find(|key| {
                key.fingerprint.ends_with(&needle)
                    || key.subkeys.iter().any(|sub| sub.key_id == needle)
            })
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))
    }

    fn list_keys(&self, _secret_only: bool) -> Result<Vec<EngineKey>, EngineError> {
        Ok(self.keys.borrow().clone())
    }

    fn import(&self, _bytes: &[u8]) -> Result<Vec<EngineKey>, EngineError> {
        Ok(Vec::new())
    }

    fn encrypt(
        &self,
        recipients: &[&EngineKey],
        _flags: EncryptFlags,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), EngineError> {
        self.encrypted_to
            .borrow_mut()
            .extend(recipients.iter().map(|key| key.fingerprint.clone()));
        let mut plaintext = Vec::new();
        input.read_to_end(&mut plaintext).map_err(EngineError::io)?;
        let masked: Vec<u8> = plaintext.iter().map(|b| b ^ MASK).collect();
        output.write_all(&masked).map_err(EngineError::io)
    }

    fn decrypt(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        passphrase: &mut dyn PassphraseCallback,
    ) -> Result<(), EngineError> {
        let behavior = self.behavior.borrow().clone();
        let (hint, expected, attempts) = match behavior {
            DecryptBehavior::Fail(err) => return Err(err),
            DecryptBehavior::Prompt {
                hint,
                expected,
                attempts,
            } => (hint, expected, attempts),
        };

        for attempt in 0..attempts {
            let mut channel = PassphraseChannel::new();
            let status = passphrase.passphrase(
                hint.as_deref(),
                Some("E41BEA77E2F8AB82 AF386C4BFA33BF5B 1 0"),
                attempt > 0,
                &mut channel,
            );
            self.callbacks.borrow_mut().push(CallbackRecord {
                prev_was_bad: attempt > 0,
                status: status.code(),
                written: channel.written().to_vec(),
                closed: channel.is_closed(),
            });
            if channel.is_closed() || status.code() != 0 {
                return Err(EngineError::canceled());
            }
            if channel.line() == expected.as_bytes() {
                let mut ciphertext = Vec::new();
                input.read_to_end(&mut ciphertext).map_err(EngineError::io)?;
                let plaintext: Vec<u8> = ciphertext.iter().map(|b| b ^ MASK).collect();
                return output.write_all(&plaintext).map_err(EngineError::io);
            }
        }
        Err(EngineError::bad_passphrase())
    }
}
