use openpgp::cert::prelude::*;
use openpgp::crypto::{Password, SessionKey};
use openpgp::packet::key::{SecretParts, UnspecifiedRole};
use openpgp::packet::{Key, PKESK, SKESK};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Recipient};
use openpgp::types::{RevocationStatus, SymmetricAlgorithm};
use openpgp::{Cert, Fingerprint, KeyHandle};
use p3store_core::{
    CallbackStatus, EncryptFlags, Engine, EngineError, EngineKey, EngineSubkey, EngineUserId,
    HomeDirectory, PassphraseCallback, PassphraseChannel, PubkeyAlgo, codes,
};
use sequoia_openpgp as openpgp;
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::debug;

/// How often a protected key is offered to the passphrase callback before
/// the decryption gives up.
pub const PASSPHRASE_ATTEMPTS: u32 = 3;

const DIR_MODE: u32 = 0o700;
const PUBLIC_FILE_MODE: u32 = 0o644;
const SECRET_FILE_MODE: u32 = 0o600;

/// OpenPGP engine on sequoia. Certificates live as one file per
/// fingerprint under `<home>/public` and, for keys with secret material,
/// `<home>/secret`.
#[derive(Debug)]
pub struct NativeEngine {
    home: PathBuf,
}

impl NativeEngine {
    fn public_dir(&self) -> PathBuf {
        self.home.join("public")
    }

    fn secret_dir(&self) -> PathBuf {
        self.home.join("secret")
    }

    fn load_all_certs(&self) -> Result<Vec<Cert>, EngineError> {
        let mut certs: HashMap<Fingerprint, Cert> = HashMap::new();
        for cert in load_certs_from_dir(&self.public_dir())? {
            certs.insert(cert.fingerprint(), cert);
        }
        // Secret copies win over their public halves.
        for cert in load_certs_from_dir(&self.secret_dir())? {
            certs.insert(cert.fingerprint(), cert);
        }
        let mut certs: Vec<Cert> = certs.into_values().collect();
        certs.sort_by_key(|cert| cert.fingerprint().to_hex());
        Ok(certs)
    }

    fn load_certs(&self, secret_only: bool) -> Result<Vec<Cert>, EngineError> {
        if secret_only {
            let mut certs = load_certs_from_dir(&self.secret_dir())?;
            certs.sort_by_key(|cert| cert.fingerprint().to_hex());
            Ok(certs)
        } else {
            self.load_all_certs()
        }
    }

    fn store_cert(&self, cert: &Cert) -> Result<(), EngineError> {
        let file = format!("{}.pgp", cert.fingerprint().to_hex());
        let public = cert.to_vec().map_err(serialize_error)?;
        write_atomic(&self.public_dir().join(&file), &public, PUBLIC_FILE_MODE)?;

        if cert.is_tsk() {
            let secret = cert.as_tsk().to_vec().map_err(serialize_error)?;
            write_atomic(&self.secret_dir().join(&file), &secret, SECRET_FILE_MODE)?;
        }
        Ok(())
    }

    fn find_cert(&self, id: &str, secret_only: bool) -> Result<Cert, EngineError> {
        let needle = normalize_id(id);
        if needle.is_empty() {
            return Err(EngineError::gpgme(codes::INV_VALUE, "empty key id"));
        }
        let mut matches: Vec<Cert> = self
            .load_certs(secret_only)?
            .into_iter()
            .filter(|cert| cert_matches(cert, &needle, id))
            .collect();

        match matches.len() {
            0 => Err(EngineError::not_found(id)),
            1 => Ok(matches.remove(0)),
            n => Err(EngineError::gpgme(
                codes::AMBIGUOUS_NAME,
                format!("{id} matches {n} keys"),
            )),
        }
    }

    fn cert_for(&self, key: &EngineKey) -> Result<Cert, EngineError> {
        self.load_all_certs()?
            .into_iter()
            .find(|cert| cert.fingerprint().to_hex() == key.fingerprint)
            .ok_or_else(|| EngineError::not_found(&key.fingerprint))
    }
}

impl Engine for NativeEngine {
    fn open(home: &HomeDirectory) -> Result<Self, EngineError> {
        let engine = Self {
            home: home.path().to_path_buf(),
        };
        let mut builder = fs::DirBuilder::new();
        builder.mode(DIR_MODE);
        for dir in [engine.public_dir(), engine.secret_dir()] {
            match builder.create(&dir) {
                Ok(()) => debug!(path = %dir.display(), "created keyring directory"),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => {}
                Err(err) => return Err(EngineError::io(err)),
            }
        }
        Ok(engine)
    }

    fn name(&self) -> &'static str {
        "native"
    }

    fn lookup_key(&self, id: &str, secret_only: bool) -> Result<EngineKey, EngineError> {
        let cert = self.find_cert(id, secret_only)?;
        Ok(key_from_cert(&cert))
    }

    fn list_keys(&self, secret_only: bool) -> Result<Vec<EngineKey>, EngineError> {
        Ok(self
            .load_certs(secret_only)?
            .iter()
            .map(key_from_cert)
            .collect())
    }

    fn import(&self, bytes: &[u8]) -> Result<Vec<EngineKey>, EngineError> {
        let ppr = openpgp::parse::PacketParser::from_bytes(bytes)
            .map_err(|err| EngineError::no_data(format!("parse failed: {err}")))?;
        let mut imported = Vec::new();
        for cert in openpgp::cert::CertParser::from(ppr) {
            let cert =
                cert.map_err(|err| EngineError::no_data(format!("invalid certificate: {err}")))?;
            let merged = match self
                .load_all_certs()?
                .into_iter()
                .find(|existing| existing.fingerprint() == cert.fingerprint())
            {
                Some(existing) => existing.merge_public_and_secret(cert).map_err(|err| {
                    EngineError::gpgme(codes::GENERAL, format!("merge failed: {err}"))
                })?,
                None => cert,
            };
            self.store_cert(&merged)?;
            debug!(fingerprint = %merged.fingerprint(), secret = merged.is_tsk(), "imported certificate");
            imported.push(key_from_cert(&merged));
        }
        if imported.is_empty() {
            return Err(EngineError::no_data("no certificates found"));
        }
        Ok(imported)
    }

    fn encrypt(
        &self,
        recipients: &[&EngineKey],
        flags: EncryptFlags,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), EngineError> {
        // The keyring keeps no ownertrust, so every recipient is trusted
        // whatever `always_trust` says.
        debug!(always_trust = flags.always_trust, armor = flags.armor, "native encrypt");

        let certs = recipients
            .iter()
            .map(|key| self.cert_for(key))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = StandardPolicy::new();
        let mut targets: Vec<Recipient<'_>> = Vec::new();
        for cert in &certs {
            let before = targets.len();
            for key in cert
                .keys()
                .with_policy(&policy, None)
                .supported()
                .alive()
                .revoked(false)
                .for_transport_encryption()
                .for_storage_encryption()
            {
                targets.push(key.into());
            }
            if targets.len() == before {
                return Err(EngineError::gpgme(
                    codes::UNUSABLE_PUBKEY,
                    format!("{}: no usable encryption key", cert.fingerprint()),
                ));
            }
        }

        let mut plaintext = Vec::new();
        input.read_to_end(&mut plaintext).map_err(EngineError::io)?;

        let mut sink = Vec::new();
        let mut message = Message::new(&mut sink);
        if flags.armor {
            message = Armorer::new(message).build().map_err(general("armor"))?;
        }
        let message = Encryptor::for_recipients(message, targets)
            .build()
            .map_err(general("encryptor"))?;
        let mut message = LiteralWriter::new(message)
            .build()
            .map_err(general("literal writer"))?;
        message.write_all(&plaintext).map_err(EngineError::io)?;
        message.finalize().map_err(general("finalize"))?;

        output.write_all(&sink).map_err(EngineError::io)
    }

    fn decrypt(
        &self,
        input: &mut dyn Read,
        output: &mut dyn Write,
        passphrase: &mut dyn PassphraseCallback,
    ) -> Result<(), EngineError> {
        let mut ciphertext = Vec::new();
        input.read_to_end(&mut ciphertext).map_err(EngineError::io)?;

        let asked = Cell::new(false);
        let helper = SecretKeyHelper {
            certs: self.load_all_certs()?,
            callback: passphrase,
            asked: &asked,
        };
        let policy = StandardPolicy::new();
        let mut plaintext = Vec::new();
        let result = DecryptorBuilder::from_bytes(&ciphertext)
            .and_then(|builder| builder.with_policy(&policy, None, helper))
            .and_then(|mut decryptor| {
                decryptor.read_to_end(&mut plaintext)?;
                Ok(())
            });

        match result {
            Ok(()) if asked.get() => output.write_all(&plaintext).map_err(EngineError::io),
            Ok(()) => Err(EngineError::no_data("not an encrypted message")),
            Err(err) => Err(classify(&err, asked.get())),
        }
    }
}

/// Snapshots `cert` as the engine sees it now under the standard policy.
/// The primary key comes first, then the subkeys in certificate order.
pub fn key_from_cert(cert: &Cert) -> EngineKey {
    let policy = StandardPolicy::new();
    let valid = cert.with_policy(&policy, None);

    let mut bindings: HashMap<Fingerprint, Binding> = HashMap::new();
    if let Ok(vc) = &valid {
        for ka in vc.keys() {
            let flags = ka.key_flags();
            bindings.insert(
                ka.key().fingerprint(),
                Binding {
                    alive: ka.alive().is_ok(),
                    revoked: matches!(ka.revocation_status(), RevocationStatus::Revoked(_)),
                    can_sign: flags.as_ref().is_some_and(|f| f.for_signing()),
                    can_encrypt: flags.as_ref().is_some_and(|f| {
                        f.for_transport_encryption() || f.for_storage_encryption()
                    }),
                    expires: ka.key_expiration_time(),
                },
            );
        }
    }

    let subkeys: Vec<EngineSubkey> = cert
        .keys()
        .map(|ka| {
            let key = ka.key();
            let binding = bindings.get(&key.fingerprint());
            EngineSubkey {
                key_id: key.keyid().to_hex(),
                algo: PubkeyAlgo::from(u8::from(key.pk_algo())),
                can_sign: binding.is_some_and(|b| b.can_sign),
                can_encrypt: binding.is_some_and(|b| b.can_encrypt),
                secret: key.has_secret(),
                expired: binding.is_some_and(|b| !b.alive),
                invalid: binding.is_none(),
                revoked: binding.is_some_and(|b| b.revoked),
                disabled: false,
                expires: binding.and_then(|b| b.expires),
            }
        })
        .collect();

    let can_encrypt = subkeys
        .iter()
        .any(|sub| sub.can_encrypt && !sub.expired && !sub.invalid && !sub.revoked);

    EngineKey {
        fingerprint: cert.fingerprint().to_hex(),
        expired: valid.as_ref().is_ok_and(|vc| vc.alive().is_err()),
        invalid: valid.is_err(),
        revoked: matches!(
            cert.revocation_status(&policy, None),
            RevocationStatus::Revoked(_)
        ),
        disabled: false,
        can_encrypt,
        secret: cert.is_tsk(),
        user_ids: cert
            .userids()
            .map(|uid| EngineUserId::parse(&String::from_utf8_lossy(uid.userid().value())))
            .collect(),
        subkeys,
    }
}

struct Binding {
    alive: bool,
    revoked: bool,
    can_sign: bool,
    can_encrypt: bool,
    expires: Option<SystemTime>,
}

struct SecretKeyHelper<'a> {
    certs: Vec<Cert>,
    callback: &'a mut dyn PassphraseCallback,
    asked: &'a Cell<bool>,
}

impl SecretKeyHelper<'_> {
    /// Offers the key to the passphrase callback until it unlocks, the
    /// callback cancels, or the attempts run out.
    fn unlock(
        &mut self,
        cert: &Cert,
        key: &Key<SecretParts, UnspecifiedRole>,
    ) -> Result<Key<SecretParts, UnspecifiedRole>, EngineError> {
        let key_id = key.keyid().to_hex();
        let uid_hint = match primary_user_id(cert) {
            Some(uid) => format!("{key_id} {uid}"),
            None => key_id.clone(),
        };
        let info = format!(
            "{key_id} {} {} 0",
            cert.keyid().to_hex(),
            u8::from(key.pk_algo())
        );

        for attempt in 0..PASSPHRASE_ATTEMPTS {
            let mut channel = PassphraseChannel::new();
            let status =
                self.callback
                    .passphrase(Some(&uid_hint), Some(&info), attempt > 0, &mut channel);
            if status != CallbackStatus::Success || channel.is_closed() {
                debug!(key = %key_id, "passphrase request canceled");
                return Err(EngineError::canceled());
            }
            let password = Password::from(channel.line().to_vec());
            match key.clone().decrypt_secret(&password) {
                Ok(unlocked) => return Ok(unlocked),
                Err(_) => debug!(key = %key_id, attempt, "bad passphrase"),
            }
        }
        Err(EngineError::bad_passphrase())
    }
}

impl VerificationHelper for SecretKeyHelper<'_> {
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self
            .certs
            .iter()
            .filter(|cert| {
                ids.iter()
                    .any(|id| cert.keys().any(|key| key.key().fingerprint().aliases(id)))
            })
            .cloned()
            .collect())
    }

    fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
        Ok(())
    }
}

impl DecryptionHelper for SecretKeyHelper<'_> {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> openpgp::Result<Option<Cert>> {
        self.asked.set(true);
        let policy = StandardPolicy::new();
        let certs = self.certs.clone();
        let mut candidates = 0;

        for pkesk in pkesks {
            let recipient = pkesk.recipient();
            for cert in &certs {
                for ka in cert
                    .keys()
                    .secret()
                    .with_policy(&policy, None)
                    .supported()
                    .alive()
                    .revoked(false)
                    .for_transport_encryption()
                    .for_storage_encryption()
                {
                    let handle = KeyHandle::from(ka.key().fingerprint());
                    if let Some(recipient) = &recipient
                        && !handle.aliases(recipient)
                    {
                        continue;
                    }
                    candidates += 1;

                    let key = if ka.key().secret().is_encrypted() {
                        self.unlock(cert, ka.key())?
                    } else {
                        ka.key().clone()
                    };
                    let mut keypair = key.into_keypair()?;
                    if let Some((algo, sk)) = pkesk.decrypt(&mut keypair, sym_algo)
                        && decrypt(algo, &sk)
                    {
                        return Ok(Some(cert.clone()));
                    }
                }
            }
        }

        if candidates == 0 {
            Err(EngineError::decrypt_failed("No secret key").into())
        } else {
            Err(EngineError::decrypt_failed("Decryption failed").into())
        }
    }
}

fn load_certs_from_dir(dir: &Path) -> Result<Vec<Cert>, EngineError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut certs = Vec::new();
    for entry in fs::read_dir(dir).map_err(EngineError::io)? {
        let entry = entry.map_err(EngineError::io)?;
        if !entry.file_type().map_err(EngineError::io)?.is_file() {
            continue;
        }
        // Only `<fingerprint>.pgp` entries are keyring content. Leftover
        // temp files and editor debris are skipped.
        let is_pgp = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pgp"));
        if !is_pgp {
            continue;
        }
        let bytes = fs::read(entry.path()).map_err(EngineError::io)?;
        let ppr = openpgp::parse::PacketParser::from_bytes(&bytes).map_err(|err| {
            EngineError::gpgme(
                codes::GENERAL,
                format!("{}: parse failed: {err}", entry.path().display()),
            )
        })?;
        for cert in openpgp::cert::CertParser::from(ppr) {
            certs.push(cert.map_err(|err| {
                EngineError::gpgme(
                    codes::GENERAL,
                    format!("{}: invalid certificate: {err}", entry.path().display()),
                )
            })?);
        }
    }
    Ok(certs)
}

/// Temp file in the same directory, renamed into place. The mode is set
/// before any byte lands.
fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), EngineError> {
    let dir = path
        .parent()
        .ok_or_else(|| EngineError::gpgme(codes::INV_VALUE, "keyring path has no parent"))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(EngineError::io)?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(EngineError::io)?;
    temp.write_all(bytes).map_err(EngineError::io)?;
    temp.as_file().sync_all().map_err(EngineError::io)?;
    temp.persist(path).map_err(|err| EngineError::io(err.error))?;
    fs::File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(EngineError::io)
}

fn primary_user_id(cert: &Cert) -> Option<String> {
    cert.userids()
        .next()
        .map(|uid| String::from_utf8_lossy(uid.userid().value()).into_owned())
}

fn normalize_id(input: &str) -> String {
    input
        .trim()
        .trim_start_matches("0x")
        .replace([' ', '\t'], "")
        .to_uppercase()
}

fn cert_matches(cert: &Cert, needle_hex: &str, needle_raw: &str) -> bool {
    let hex_match = cert.keys().any(|ka| {
        let key = ka.key();
        key.fingerprint().to_hex().ends_with(needle_hex) || key.keyid().to_hex() == needle_hex
    });
    if hex_match {
        return true;
    }

    let needle_raw = needle_raw.trim().to_lowercase();
    !needle_raw.is_empty()
        && cert.userids().any(|uid| {
            String::from_utf8_lossy(uid.userid().value())
                .to_lowercase()
                .contains(&needle_raw)
        })
}

/// Turns a sequoia failure into the engine's error codes. A failure raised
/// by the helper travels through sequoia unchanged and is returned as is.
fn classify(err: &anyhow::Error, asked: bool) -> EngineError {
    for cause in err.chain() {
        if let Some(found) = engine_error_in(cause) {
            return found;
        }
    }
    if asked {
        EngineError::decrypt_failed(err.to_string())
    } else {
        EngineError::no_data(err.to_string())
    }
}

fn engine_error_in(err: &(dyn std::error::Error + 'static)) -> Option<EngineError> {
    if let Some(found) = err.downcast_ref::<EngineError>() {
        return Some(found.clone());
    }
    // io::Error hides its payload from `source()`.
    let inner = err.downcast_ref::<std::io::Error>()?.get_ref()?;
    inner.downcast_ref::<EngineError>().cloned()
}

fn serialize_error(err: anyhow::Error) -> EngineError {
    EngineError::gpgme(codes::GENERAL, format!("serialize failed: {err}"))
}

fn general(what: &'static str) -> impl Fn(anyhow::Error) -> EngineError {
    move |err| EngineError::gpgme(codes::GENERAL, format!("{what} failed: {err}"))
}
