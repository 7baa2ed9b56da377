#![no_main]

use libfuzzer_sys::fuzz_target;
use p3store_core::KeyRecord;
use p3store_pgp::key_from_cert;
use sequoia_openpgp::Cert;
use sequoia_openpgp::parse::Parse;

fuzz_target!(|data: &[u8]| {
    // Snapshot and validation must never panic on any parseable certificate.
    if let Ok(cert) = Cert::from_bytes(data) {
        let key = key_from_cert(&cert);
        assert_eq!(key.subkeys.len(), cert.keys().count());
        let _ = KeyRecord::validate(key);
    }
});
