use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

// Default port for the HTTP listener.
const DEFAULT_PORT: u16 = 8080;

// Fallback locale when neither the `lang` parameter nor Accept-Language
// yields anything usable.
const DEFAULT_LANG: &str = "en";

/// Read-only key/value settings surface.
///
/// The credential store and the token verifier read through this trait on
/// every call; nothing is cached. Keys use the dotted form of the settings
/// file (`user0.login`, `jwt_secret`), and implementations decide how that
/// maps onto their backing store. Sources must be read-only after startup so
/// concurrent per-request reads need no locking.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Environment-backed source. Dotted keys are translated to the conventional
/// env-var spelling: `user0.login` reads `USER0_LOGIN`, `jwt_secret` reads
/// `JWT_SECRET`.
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(env_key(key)).ok()
    }
}

pub(crate) fn env_key(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

/// In-memory source used by tests and by settings loaded from a file.
#[derive(Default, Clone)]
pub struct MapSource {
    entries: HashMap<String, String>,
}

impl MapSource {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// Credential-extractor behavior for the identity resolver.
///
/// `Compat` preserves the historical resolution order exactly, including the
/// quirk that a header-carried Bearer token is never consulted. `Strict` is
/// the corrected three-way branch (parameter, then header Bearer, then header
/// Basic) and must be enabled explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Compat,
    Strict,
}

impl std::str::FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compat" => Ok(Self::Compat),
            "strict" => Ok(Self::Strict),
            _ => anyhow::bail!("invalid auth mode: {}. Must be 'compat' or 'strict'", s),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub auth_mode: AuthMode,
    pub default_lang: String,
    /// Settings surface for users and the signing secret. Read lazily on
    /// every lookup; immutable after startup.
    pub settings: Arc<dyn ConfigSource>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            auth_mode: std::env::var("AUTH_MODE")
                .ok()
                .map(|m| m.parse())
                .transpose()?
                .unwrap_or_default(),
            default_lang: std::env::var("DEFAULT_LANG").unwrap_or_else(|_| DEFAULT_LANG.to_string()),
            settings: Arc::new(EnvSource),
        })
    }

    /// Test/embedding constructor over an arbitrary settings source.
    pub fn with_settings(settings: Arc<dyn ConfigSource>) -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_mode: AuthMode::default(),
            default_lang: DEFAULT_LANG.to_string(),
            settings,
        }
    }

    /// The token-signing secret, resolved at verification time. `None` means
    /// the deployment cannot verify any token; callers treat that as a fatal
    /// misconfiguration rather than a per-request failure.
    pub fn jwt_secret(&self) -> Option<String> {
        self.settings.get("jwt_secret")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("auth_mode", &self.auth_mode)
            .field("default_lang", &self.default_lang)
            .finish_non_exhaustive()
    }
}
