use crate::engine::{EngineKey, EngineSubkey};
use crate::error::{InvalidKeyReason, P3Error};
use std::fmt;
use std::time::SystemTime;

/// Minimum remaining lifetime of the encryption subkey, in days.
pub const MIN_REMAINING_DAYS: f64 = 200.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// An engine key that passed validation. There is no way to hold a
/// `KeyRecord` for an expired, revoked or soon-to-expire key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    key: EngineKey,
    description: String,
}

impl KeyRecord {
    pub fn validate(key: EngineKey) -> Result<Self, P3Error> {
        Self::validate_at(key, SystemTime::now())
    }

    /// Validates against an explicit clock.
    pub fn validate_at(key: EngineKey, now: SystemTime) -> Result<Self, P3Error> {
        let fail = |key: &EngineKey, reason| P3Error::InvalidKey {
            key: key.fingerprint.clone(),
            reason,
        };

        if key.expired {
            return Err(fail(&key, InvalidKeyReason::Expired));
        }
        if key.invalid || key.revoked || key.disabled {
            return Err(fail(&key, InvalidKeyReason::InvalidRevokedOrDisabled));
        }
        // The engine also clears can_encrypt when every encryption subkey is
        // expired.
        if !key.can_encrypt {
            return Err(fail(&key, InvalidKeyReason::Unusable));
        }

        let Some(selected) = key.subkeys.iter().find(|sub| is_usable(sub)) else {
            return Err(fail(&key, InvalidKeyReason::Unusable));
        };
        if let Some(expires) = selected.expires {
            let days = days_until(expires, now);
            if days < MIN_REMAINING_DAYS {
                let days = days.floor() as i64;
                return Err(fail(&key, InvalidKeyReason::ExpiringSoon { days }));
            }
        }

        let description = describe_key(&key).map_err(|code| {
            fail(&key, InvalidKeyReason::UnknownAlgorithm(code))
        })?;
        Ok(Self { key, description })
    }

    pub fn key(&self) -> &EngineKey {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.key.fingerprint
    }

    /// Last 8 hex digits of the primary key id.
    pub fn short_id(&self) -> &str {
        short_id(&self.key)
    }

    pub fn email(&self) -> String {
        self.key
            .user_ids
            .first()
            .map(|uid| uid.email.to_lowercase())
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.key
            .user_ids
            .first()
            .map(|uid| uid.name.as_str())
            .unwrap_or("")
    }

    /// `SHORTID <email> [KEYID(ALGO,caps), ...]`
    pub fn describe(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

fn is_usable(sub: &EngineSubkey) -> bool {
    !(sub.expired || sub.invalid || sub.revoked || sub.disabled) && sub.can_encrypt
}

fn days_until(expires: SystemTime, now: SystemTime) -> f64 {
    match expires.duration_since(now) {
        Ok(left) => left.as_secs_f64() / SECONDS_PER_DAY,
        Err(err) => -(err.duration().as_secs_f64() / SECONDS_PER_DAY),
    }
}

fn short_id(key: &EngineKey) -> &str {
    let id = key
        .subkeys
        .first()
        .map(|sub| sub.key_id.as_str())
        .unwrap_or("");
    let start = id.len().saturating_sub(8);
    id.get(start..).unwrap_or(id)
}

fn describe_subkey(sub: &EngineSubkey) -> Result<String, u8> {
    let algo = sub.algo.label().ok_or(u8::from(sub.algo))?;
    let mut properties = vec![algo];
    if sub.can_sign {
        properties.push("sign");
    }
    if sub.can_encrypt {
        properties.push("enc");
    }
    if sub.secret {
        properties.push("secret");
    }
    if sub.expired {
        properties.push("expired");
    }
    Ok(format!("{}({})", sub.key_id, properties.join(",")))
}

fn describe_key(key: &EngineKey) -> Result<String, u8> {
    let email = key
        .user_ids
        .first()
        .map(|uid| uid.email.to_lowercase())
        .unwrap_or_default();
    let subkeys = key
        .subkeys
        .iter()
        .map(describe_subkey)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!(
        "{} <{}> [{}]",
        short_id(key),
        email,
        subkeys.join(", ")
    ))
}

