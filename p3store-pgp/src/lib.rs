mod native;

pub use native::{NativeEngine, PASSPHRASE_ATTEMPTS, key_from_cert};
