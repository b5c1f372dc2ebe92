use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::header::AUTHORIZATION;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::{AuthMode, Config};
use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::pipeline::RequestContext;

/// Well-known view-args key the resolved identity is published under.
pub const IDENTITY_KEY: &str = "me";

/// Per-request caller identity. The zero value is the anonymous caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub is_admin: bool,
}

/// Credential candidate extracted from a request, dispatched as a tagged
/// union so the resolution order is explicit and guard-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Basic { login: String, password: String },
    Bearer(String),
}

/// Derives the caller identity for a request and publishes it on the context.
///
/// All recoverable failures (absent or malformed credentials, bad signature,
/// wrong password) leave the identity anonymous and return `Ok`; resolution
/// must never block an unauthenticated caller from reaching a public action.
/// `Err` is reserved for the fatal tier: a missing signing secret and a
/// claims-contract violation.
pub struct IdentityResolver {
    config: Arc<Config>,
    store: CredentialStore,
}

impl IdentityResolver {
    pub fn new(config: Arc<Config>) -> Self {
        let store = CredentialStore::new(config.settings.clone());
        Self { config, store }
    }

    pub fn resolve(&self, ctx: &mut RequestContext) -> AppResult<()> {
        let credential = match self.config.auth_mode {
            AuthMode::Compat => extract_compat(ctx),
            AuthMode::Strict => extract_strict(ctx),
        };

        match credential {
            Credential::None => Ok(()),
            Credential::Basic { login, password } => {
                if self.store.verify(&login, &password) {
                    // Basic-authenticated callers are always administrators;
                    // there is no non-admin Basic identity.
                    set_identity(
                        ctx,
                        UserInfo {
                            login,
                            authenticated: true,
                            is_admin: true,
                        },
                    );
                }
                Ok(())
            }
            Credential::Bearer(token) => {
                if let Some(user) = self.verify_token(&token)? {
                    set_identity(ctx, user);
                }
                Ok(())
            }
        }
    }

    /// Verify a signed token and project its `user` claim.
    ///
    /// `Ok(None)` covers every recoverable rejection (non-HMAC algorithm, bad
    /// signature, expired). A missing secret is fatal: the deployment cannot
    /// verify tokens for any caller, so the request is aborted through the
    /// recovery boundary rather than silently downgraded to anonymous.
    fn verify_token(&self, token: &str) -> AppResult<Option<UserInfo>> {
        let header = match decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, token = %token, "cannot parse token header");
                return Ok(None);
            }
        };

        if !matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            tracing::error!(alg = ?header.alg, "unexpected signing method, only HMAC is accepted");
            return Ok(None);
        }

        let secret = self.config.jwt_secret().ok_or(AppError::MissingSecret)?;

        let validation = Validation::new(header.alg);
        let token_data = match decode::<serde_json::Value>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        ) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, token = %token, "token verification failed");
                return Ok(None);
            }
        };

        let user_claim = token_data
            .claims
            .get("user")
            .ok_or_else(|| AppError::MalformedClaims("claims have no user entry".to_string()))?;

        let user: UserInfo = serde_json::from_value(user_claim.clone())
            .map_err(|e| AppError::MalformedClaims(format!("user claim does not project: {}", e)))?;

        Ok(Some(user))
    }
}

/// Publish the resolved identity on the context. Called at most once per
/// request after the anonymous reset.
pub fn set_identity(ctx: &mut RequestContext, user: UserInfo) {
    ctx.view_args.insert(
        IDENTITY_KEY.to_string(),
        serde_json::to_value(&user).unwrap_or(serde_json::Value::Null),
    );
    ctx.identity = user;
}

/// Historical extraction order. A non-empty `token` parameter wins outright;
/// otherwise the Authorization header is parsed as a Basic credential no
/// matter which scheme word it carries. The original code guarded this branch
/// on a prefix check against the (empty) parameter string, which always held,
/// so a header-carried Bearer token was never consulted. That behavior is
/// preserved here as the default; [`extract_strict`] is the corrected branch.
fn extract_compat(ctx: &RequestContext) -> Credential {
    if let Some(token) = ctx.param("token") {
        if !token.is_empty() {
            return Credential::Bearer(token.to_string());
        }
    }

    let auth = ctx.header_str(AUTHORIZATION).unwrap_or_default();
    parse_basic_words(auth)
}

/// Corrected three-way extraction: `token` parameter, then header Bearer,
/// then header Basic. Enabled with `AUTH_MODE=strict`.
fn extract_strict(ctx: &RequestContext) -> Credential {
    if let Some(token) = ctx.param("token") {
        if !token.is_empty() {
            return Credential::Bearer(token.to_string());
        }
    }

    let auth = ctx.header_str(AUTHORIZATION).unwrap_or_default();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        if !token.is_empty() {
            return Credential::Bearer(token.to_string());
        }
        return Credential::None;
    }
    if auth.starts_with("Basic ") {
        return parse_basic_words(auth);
    }
    Credential::None
}

/// Parse `<scheme> <base64(login:password)>` into a Basic credential.
///
/// Splits the raw value on spaces and base64-decodes the second word; the
/// scheme word itself is not inspected. The decoded payload is split on `:`
/// and only the first two parts are used, so a colon inside the password is
/// not supported (known limitation, inherited).
fn parse_basic_words(value: &str) -> Credential {
    let words: Vec<&str> = value.split(' ').collect();
    if words.len() < 2 {
        return Credential::None;
    }

    let decoded = match BASE64.decode(words[1]) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, payload = %words[1], "cannot decode base64 credential");
            return Credential::None;
        }
    };
    let decoded = String::from_utf8_lossy(&decoded);

    let parts: Vec<&str> = decoded.split(':').collect();
    if parts.len() < 2 {
        return Credential::None;
    }

    Credential::Basic {
        login: parts[0].to_string(),
        password: parts[1].to_string(),
    }
}
