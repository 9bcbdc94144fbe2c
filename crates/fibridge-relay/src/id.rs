//! Session id generation and the resume tokens that guard them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Characters of a short id; `l` is left out so ids read unambiguously.
const SHORT_ID_ALPHABET: &[u8] = b"0123456789abcdefghijkmnpqrstuvwxyz";

/// Longest session id a host may ask to resume.
const MAX_SESSION_ID_LEN: usize = 64;

pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Random UUID v4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Short `xxxx-xxxx` ids that are easy to read out and type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortIdGenerator;

impl IdGenerator for ShortIdGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        let mut pick = || SHORT_ID_ALPHABET[rng.random_range(0..SHORT_ID_ALPHABET.len())] as char;

        let mut id = String::with_capacity(9);
        id.extend((0..4).map(|_| pick()));
        id.push('-');
        id.extend((0..4).map(|_| pick()));
        id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdGeneratorKind {
    #[default]
    Short,
    Uuid,
}

impl IdGeneratorKind {
    pub fn build(self) -> Arc<dyn IdGenerator> {
        match self {
            IdGeneratorKind::Short => Arc::new(ShortIdGenerator),
            IdGeneratorKind::Uuid => Arc::new(UuidGenerator),
        }
    }
}

/// Context string for deriving a resume key from a configured secret.
const RESUME_KEY_CONTEXT: &str = "fibridge 2024-06 session resume token";

/// Issues and checks resume tokens.
///
/// A token is the keyed BLAKE3 hash of the session id, so checking one needs
/// no per-session state and survives a relay restart whenever the key does.
#[derive(Clone)]
pub struct ResumeKey {
    key: [u8; 32],
}

impl std::fmt::Debug for ResumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResumeKey(..)")
    }
}

impl ResumeKey {
    /// Key stable across restarts that share `secret`.
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(RESUME_KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// Key that lives as long as this process.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);
        Self { key }
    }

    pub fn token_for(&self, session_id: &str) -> String {
        blake3::keyed_hash(&self.key, session_id.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Whether `token` was issued for `session_id` under this key.
    pub fn verify(&self, session_id: &str, token: &str) -> bool {
        match blake3::Hash::from_hex(token) {
            // Hash equality is constant time.
            Ok(presented) => presented == blake3::keyed_hash(&self.key, session_id.as_bytes()),
            Err(_) => false,
        }
    }
}

/// Whether a host-supplied id is acceptable for resume.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_shape() {
        for _ in 0..100 {
            let id = ShortIdGenerator.generate();
            assert_eq!(id.len(), 9);
            assert_eq!(&id[4..5], "-");
            assert!(id
                .bytes()
                .filter(|b| *b != b'-')
                .all(|b| SHORT_ID_ALPHABET.contains(&b)));
            assert!(!id.contains('l'));
        }
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let a = UuidGenerator.generate();
        let b = UuidGenerator.generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_resume_id_validation() {
        assert!(is_valid_session_id("k3x9-ab2c"));
        assert!(is_valid_session_id(&UuidGenerator.generate()));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id(&"a".repeat(65)));
    }

    #[test]
    fn test_resume_token_is_bound_to_id_and_key() {
        let key = ResumeKey::random();
        let token = key.token_for("k3x9-ab2c");
        assert!(key.verify("k3x9-ab2c", &token));
        assert!(!key.verify("k3x9-ab2d", &token));
        assert!(!key.verify("k3x9-ab2c", ""));
        assert!(!key.verify("k3x9-ab2c", "not hex"));
        assert!(!ResumeKey::random().verify("k3x9-ab2c", &token));
    }

    #[test]
    fn test_secret_key_survives_restart() {
        let token = ResumeKey::from_secret("hunter2").token_for("k3x9-ab2c");
        assert!(ResumeKey::from_secret("hunter2").verify("k3x9-ab2c", &token));
        assert!(!ResumeKey::from_secret("hunter3").verify("k3x9-ab2c", &token));
    }

    #[test]
    fn test_kind_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: IdGeneratorKind,
        }
        let w: Wrapper = serde_json::from_str(r#"{"kind":"uuid"}"#).unwrap();
        assert_eq!(w.kind, IdGeneratorKind::Uuid);
    }
}
