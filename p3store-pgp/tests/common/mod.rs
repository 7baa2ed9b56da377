#![allow(dead_code)]

use openpgp::cert::prelude::*;
use openpgp::crypto::Password;
use openpgp::serialize::SerializeInto;
use openpgp::types::KeyFlags;
use p3store_core::{EncryptionService, KeyRecord, PasswordError, PasswordSource, ServiceConfig};
use p3store_pgp::NativeEngine;
use sequoia_openpgp as openpgp;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;

pub const WALTER_UID: &str = "Walter Example <Walter-RSA-RSA@Example.com>";
pub const WALTER_PASSWORD: &str = "walter2";

/// RSA-2048 key protected with "walter2". Generated once per test binary.
pub fn walter() -> &'static Cert {
    static WALTER: OnceLock<Cert> = OnceLock::new();
    WALTER.get_or_init(|| {
        let (cert, _rev) = CertBuilder::general_purpose(Some(WALTER_UID))
            .set_cipher_suite(CipherSuite::RSA2k)
            .set_password(Some(Password::from(WALTER_PASSWORD)))
            .generate()
            .expect("generate walter");
        cert
    })
}

/// RSA-2048 key whose encryption subkey expires after `validity`.
pub fn rsa_expiring(uid: &str, validity: Duration) -> Cert {
    let (cert, _rev) = CertBuilder::new()
        .add_userid(uid)
        .set_cipher_suite(CipherSuite::RSA2k)
        .set_primary_key_flags(KeyFlags::empty().set_certification().set_signing())
        .add_subkey(
            KeyFlags::empty()
                .set_transport_encryption()
                .set_storage_encryption(),
            validity,
            None,
        )
        .generate()
        .expect("generate expiring key");
    cert
}

pub fn cv25519(uid: &str) -> Cert {
    let (cert, _rev) = CertBuilder::general_purpose(Some(uid))
        .set_cipher_suite(CipherSuite::Cv25519)
        .generate()
        .expect("generate cv25519 key");
    cert
}

pub fn public_bytes(cert: &Cert) -> Vec<u8> {
    cert.to_vec().expect("serialize cert")
}

pub fn secret_bytes(cert: &Cert) -> Vec<u8> {
    cert.as_tsk().to_vec().expect("serialize tsk")
}

/// `Walter Example` -> `walter2`.
pub fn firstname_password(
    key: Option<&KeyRecord>,
    _prev_was_bad: bool,
) -> Result<String, PasswordError> {
    let key = key.ok_or_else(|| PasswordError::Failed("no key hint".into()))?;
    let first = key.name().split(' ').next().unwrap_or("");
    Ok(format!("{}2", first.to_lowercase()))
}

pub fn open_service(
    source: impl PasswordSource + 'static,
) -> (TempDir, EncryptionService<NativeEngine>) {
    open_service_with(source, false)
}

pub fn open_service_with(
    source: impl PasswordSource + 'static,
    armor: bool,
) -> (TempDir, EncryptionService<NativeEngine>) {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = ServiceConfig {
        home: scratch.path().join("gnupg"),
        armor,
    };
    let service = EncryptionService::<NativeEngine>::with_config(&config, source)
        .expect("open service");
    (scratch, service)
}
