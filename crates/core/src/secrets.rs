//! Credential secret material: generation, hashing and constant-time checks.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::SecretString;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_PREFIX: &str = "rw-";
pub const DISPLAY_PREFIX_LEN: usize = 12;
const SECRET_BODY_LEN: usize = 40;

/// Freshly minted secret. Only `prefix` and `hash` are ever persisted.
pub struct GeneratedSecret {
    pub secret: SecretString,
    pub prefix: String,
    pub hash: String,
}

impl std::fmt::Debug for GeneratedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedSecret")
            .field("secret", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("hash", &self.hash)
            .finish()
    }
}

pub fn generate_secret() -> GeneratedSecret {
    let body: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(SECRET_BODY_LEN).map(char::from).collect();
    let secret = format!("{SECRET_PREFIX}{body}");
    let prefix = display_prefix(&secret);
    let hash = hash_secret(&secret);
    GeneratedSecret { secret: secret.into(), prefix, hash }
}

pub fn display_prefix(secret: &str) -> String {
    secret.chars().take(DISPLAY_PREFIX_LEN).collect()
}

pub fn hash_secret(secret: &str) -> String {
    encode_hex(Sha256::digest(secret.as_bytes()).as_slice())
}

/// Compares two byte strings without short-circuiting on the first mismatch.
///
/// Both inputs are keyed through HMAC-SHA256 with a per-call random key and the
/// tags are compared with `verify_slice`, which is constant time.
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let key: [u8; 32] = rand::random();
    let Ok(mut expected) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    expected.update(left);
    let Ok(mut actual) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    actual.update(right);
    let tag = actual.finalize().into_bytes();
    expected.verify_slice(tag.as_slice()).is_ok()
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::{constant_time_eq, display_prefix, generate_secret, hash_secret, SECRET_PREFIX};

    #[test]
    fn generated_secret_carries_prefix_and_matching_hash() {
        let generated = generate_secret();
        let secret = generated.secret.expose_secret();

        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(secret.len(), SECRET_PREFIX.len() + 40);
        assert_eq!(generated.prefix, display_prefix(secret));
        assert_eq!(generated.prefix.len(), 12);
        assert_eq!(generated.hash, hash_secret(secret));
        assert_eq!(generated.hash.len(), 64);
    }

    #[test]
    fn two_generated_secrets_differ() {
        let first = generate_secret();
        let second = generate_secret();
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let generated = generate_secret();
        let debug = format!("{generated:?}");
        assert!(!debug.contains(generated.secret.expose_secret()));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"internal-secret", b"internal-secret"));
        assert!(!constant_time_eq(b"internal-secret", b"internal-secreT"));
        assert!(!constant_time_eq(b"short", b"a much longer value"));
        assert!(constant_time_eq(b"", b""));
    }
}
