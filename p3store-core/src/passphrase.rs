//! The passphrase callback protocol between the engine and the caller.
//!
//! When the engine needs the secret of a protected private key it calls a
//! [`PassphraseCallback`] with a writable [`PassphraseChannel`]. The callback
//! must either write the passphrase followed by a newline and report
//! [`CallbackStatus::Success`], or close the channel and report
//! [`CallbackStatus::Canceled`]. Anything else can leave the engine waiting.

use crate::engine::{Engine, codes};
use crate::error::P3Error;
use crate::key::KeyRecord;
use crate::service::EncryptionService;
use crate::terminal::sanitize_for_terminal;
use std::io::{self, ErrorKind, Write};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Success,
    Canceled,
}

impl CallbackStatus {
    pub fn code(self) -> u32 {
        match self {
            CallbackStatus::Success => 0,
            CallbackStatus::Canceled => codes::CANCELED,
        }
    }
}

/// Engine-provided sink for one passphrase answer.
#[derive(Default)]
pub struct PassphraseChannel {
    buf: Zeroizing<Vec<u8>>,
    closed: bool,
}

impl PassphraseChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn written(&self) -> &[u8] {
        &self.buf
    }

    /// The bytes before the first newline, or everything written if no
    /// newline arrived.
    pub fn line(&self) -> &[u8] {
        match self.buf.iter().position(|b| *b == b'\n') {
            Some(end) => &self.buf[..end],
            None => &self.buf,
        }
    }
}

impl Write for PassphraseChannel {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "passphrase channel is closed",
            ));
        }
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for PassphraseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseChannel")
            .field("written", &self.buf.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// What the engine calls when it needs a secret.
pub trait PassphraseCallback {
    fn passphrase(
        &mut self,
        uid_hint: Option<&str>,
        passphrase_info: Option<&str>,
        prev_was_bad: bool,
        channel: &mut PassphraseChannel,
    ) -> CallbackStatus;
}

/// Parsed callback parameters. Lives for one callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseRequest<'a> {
    key_id: Option<&'a str>,
    prev_was_bad: bool,
}

impl<'a> PassphraseRequest<'a> {
    /// The hint looks like `E41BEA77E2F8AB82 Walter (Example) <walter@example.com>`;
    /// its first token is the id of the key that needs unlocking.
    pub fn parse(uid_hint: Option<&'a str>, prev_was_bad: bool) -> Self {
        let key_id = uid_hint.and_then(|hint| hint.split_whitespace().next());
        Self {
            key_id,
            prev_was_bad,
        }
    }

    pub fn key_id(&self) -> Option<&'a str> {
        self.key_id
    }

    pub fn prev_was_bad(&self) -> bool {
        self.prev_was_bad
    }
}

#[derive(Debug, Error)]
pub enum PasswordError {
    /// The user aborted the prompt.
    #[error("interrupted")]
    Interrupted,
    #[error("password source failed: {0}")]
    Failed(String),
}

/// Supplies the secret for a key. `key` is `None` when the engine gave no
/// hint about which key is being unlocked.
pub trait PasswordSource {
    fn password(&self, key: Option<&KeyRecord>, prev_was_bad: bool)
    -> Result<String, PasswordError>;
}

impl<F> PasswordSource for F
where
    F: Fn(Option<&KeyRecord>, bool) -> Result<String, PasswordError>,
{
    fn password(
        &self,
        key: Option<&KeyRecord>,
        prev_was_bad: bool,
    ) -> Result<String, PasswordError> {
        self(key, prev_was_bad)
    }
}

/// Prompts on the controlling terminal without echo.
///
/// Ctrl-D (end of input) is the cancel key: it surfaces as
/// [`PasswordError::Interrupted`] and the decrypt fails with
/// [`P3Error::Canceled`]. Ctrl-C keeps the default SIGINT action and kills
/// the process mid-prompt, which can leave terminal echo off.
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractivePrompt;

impl PasswordSource for InteractivePrompt {
    fn password(
        &self,
        key: Option<&KeyRecord>,
        prev_was_bad: bool,
    ) -> Result<String, PasswordError> {
        if prev_was_bad {
            eprintln!("Bad passphrase, try again.");
        }
        rpassword::prompt_password(prompt_text(key)).map_err(prompt_error)
    }
}

fn prompt_text(key: Option<&KeyRecord>) -> String {
    let target = match key {
        Some(key) => sanitize_for_terminal(key.describe()),
        None => "unknown key".to_string(),
    };
    format!("Enter passphrase for {target}: ")
}

fn prompt_error(err: io::Error) -> PasswordError {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::UnexpectedEof => PasswordError::Interrupted,
        _ => PasswordError::Failed(err.to_string()),
    }
}

pub enum PassphraseReply {
    Write(Zeroizing<String>),
    Cancel,
}

/// Writes `secret\n` or closes the channel. Every reply to the engine goes
/// through here.
pub fn deliver(reply: PassphraseReply, channel: &mut PassphraseChannel) -> CallbackStatus {
    match reply {
        PassphraseReply::Write(secret) => {
            let mut line = Zeroizing::new(Vec::with_capacity(secret.len() + 1));
            line.extend_from_slice(secret.as_bytes());
            line.push(b'\n');
            match channel.write_all(&line) {
                Ok(()) => CallbackStatus::Success,
                Err(err) => {
                    warn!(error = %err, "writing passphrase failed");
                    channel.close();
                    CallbackStatus::Canceled
                }
            }
        }
        PassphraseReply::Cancel => {
            channel.close();
            CallbackStatus::Canceled
        }
    }
}

/// Connects the engine's passphrase callback to the service's key lookup
/// and password source.
pub struct PassphraseBridge<'a, E: Engine> {
    service: &'a EncryptionService<E>,
    lookup_error: Option<P3Error>,
}

impl<'a, E: Engine> PassphraseBridge<'a, E> {
    pub fn new(service: &'a EncryptionService<E>) -> Self {
        Self {
            service,
            lookup_error: None,
        }
    }

    /// The key lookup failure that made the bridge cancel, if any. The
    /// caller should report it instead of the engine's cancellation.
    pub fn take_lookup_error(&mut self) -> Option<P3Error> {
        self.lookup_error.take()
    }

    fn resolve(&self, request: &PassphraseRequest<'_>) -> Result<Option<KeyRecord>, P3Error> {
        match request.key_id() {
            Some(id) => self.service.lookup_key(id).map(Some),
            None => Ok(None),
        }
    }
}

impl<E: Engine> PassphraseCallback for PassphraseBridge<'_, E> {
    fn passphrase(
        &mut self,
        uid_hint: Option<&str>,
        _passphrase_info: Option<&str>,
        prev_was_bad: bool,
        channel: &mut PassphraseChannel,
    ) -> CallbackStatus {
        let request = PassphraseRequest::parse(uid_hint, prev_was_bad);
        let key = match self.resolve(&request) {
            Ok(key) => key,
            Err(err) => {
                debug!(error = %err, "passphrase key lookup failed");
                self.lookup_error = Some(err);
                return deliver(PassphraseReply::Cancel, channel);
            }
        };

        let reply = match self
            .service
            .password_source()
            .password(key.as_ref(), request.prev_was_bad())
        {
            Ok(secret) => PassphraseReply::Write(Zeroizing::new(secret)),
            Err(PasswordError::Interrupted) => {
                debug!("passphrase entry interrupted");
                PassphraseReply::Cancel
            }
            Err(err) => {
                warn!(error = %err, "password source failed");
                PassphraseReply::Cancel
            }
        };
        deliver(reply, channel)
    }
}
