#![no_main]

use libfuzzer_sys::fuzz_target;
use p3store_core::{EngineUserId, PassphraseRequest, sanitize_for_terminal};

fuzz_target!(|data: &[u8]| {
    let Ok(hint) = std::str::from_utf8(data) else {
        return;
    };
    let request = PassphraseRequest::parse(Some(hint), data.len() % 2 == 0);
    if let Some(key_id) = request.key_id() {
        assert!(!key_id.is_empty());
        assert!(!key_id.contains(char::is_whitespace));
    }
    let uid = EngineUserId::parse(hint);
    assert_eq!(uid.uid, hint);
    assert!(!sanitize_for_terminal(hint).chars().any(char::is_control));
});
