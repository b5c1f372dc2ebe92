use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::config::ConfigSource;

/// Configuration-backed table of login/password-digest pairs.
///
/// Users are enumerated as `user<i>.login` with either `user<i>.password_sha1`
/// (a precomputed lowercase-hex SHA-1 digest) or `user<i>.password` (plaintext,
/// hashed on read). Enumeration stops at the first index with no login key:
/// that absence is the table's only length signal, so a gap in the index
/// sequence hides every entry after it. Settings are read on every call and
/// never cached.
#[derive(Clone)]
pub struct CredentialStore {
    settings: Arc<dyn ConfigSource>,
}

impl CredentialStore {
    pub fn new(settings: Arc<dyn ConfigSource>) -> Self {
        Self { settings }
    }

    /// Verify a login/password pair against the configured users.
    ///
    /// Returns `true` on the first index whose login matches (case-sensitive)
    /// and whose digest matches. Returns `false` both for an unknown login and
    /// for a wrong password; callers cannot tell the two apart. The digest
    /// comparison is ordinary string equality, not constant-time; this surface
    /// is low-traffic and administrative, and the trade-off is covered in the
    /// test suite.
    pub fn verify(&self, login: &str, password: &str) -> bool {
        let digest = sha1_hex(password);

        for i in 0.. {
            let login_key = format!("user{}.login", i);
            let Some(login_check) = self.settings.get(&login_key) else {
                tracing::debug!(key = %login_key, "no such configuration option, stopping enumeration");
                break;
            };

            if login != login_check {
                tracing::debug!(attempted = %login, configured = %login_check, "login mismatch");
                continue;
            }

            let expected = match self.settings.get(&format!("user{}.password_sha1", i)) {
                Some(stored) => stored,
                None => match self.settings.get(&format!("user{}.password", i)) {
                    Some(plain) => sha1_hex(&plain),
                    None => {
                        // A login key with no password entry at all.
                        tracing::error!(index = i, "user entry has no password configured, shouldn't happen");
                        continue;
                    }
                },
            };

            if digest != expected {
                // Lengths only; digests never reach the log.
                tracing::debug!(
                    login = %login,
                    supplied_len = digest.len(),
                    expected_len = expected.len(),
                    "sha1 check failed"
                );
                continue;
            }

            tracing::info!(login = %login, "authenticated");
            return true;
        }

        false
    }
}

/// Lowercase hex SHA-1 of the input.
pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
