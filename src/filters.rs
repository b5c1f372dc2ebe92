use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hyper::header::{
    HeaderValue, ACCEPT_ENCODING, ACCEPT_LANGUAGE, COOKIE, SET_COOKIE, VARY,
};
use hyper::{HeaderMap, StatusCode};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{set_identity, IdentityResolver, UserInfo};
use crate::pipeline::{Chain, Filter, FilterChain, RequestContext};
use crate::routes::RouteTable;
use crate::trail::{TrailLogger, TrailScope};

const SESSION_COOKIE: &str = "TURNSTILE_SESSION";
const FLASH_COOKIE: &str = "TURNSTILE_FLASH";
const ERRORS_COOKIE: &str = "TURNSTILE_ERRORS";

/// The default pipeline: the fixed stage order, outermost first.
pub fn default_chain(config: Arc<Config>, routes: Arc<RouteTable>) -> FilterChain {
    build_chain(config, routes, Vec::new(), HashMap::new())
}

/// Pipeline assembly with interceptors and per-action filter overrides.
pub fn build_chain(
    config: Arc<Config>,
    routes: Arc<RouteTable>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    per_action: HashMap<String, Vec<Arc<dyn Filter>>>,
) -> FilterChain {
    let resolver = IdentityResolver::new(config.clone());
    FilterChain::new(vec![
        Arc::new(RecoveryFilter),
        Arc::new(RouterFilter::new(routes)),
        Arc::new(FilterConfigFilter::new(per_action)),
        Arc::new(ParamsFilter),
        Arc::new(SessionFilter),
        Arc::new(FlashFilter),
        Arc::new(ValidationFilter),
        Arc::new(I18nFilter::new(config.default_lang.clone())),
        Arc::new(HeaderFilter),
        Arc::new(InterceptorFilter::new(interceptors)),
        Arc::new(CompressFilter),
        Arc::new(ActionInvoker::new(resolver)),
    ])
}

// ============================================================================
// Recovery boundary
// ============================================================================

/// The outermost stage and the pipeline's only fault-isolation point. Any
/// panic or propagated error from an inner stage is converted into an error
/// response here, scoped to the one request; nothing escapes to the process.
pub struct RecoveryFilter;

impl Filter for RecoveryFilter {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let _scope = TrailScope::enter();
        let outcome = catch_unwind(AssertUnwindSafe(|| chain.next(ctx)));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                err.write_response(ctx);
                Ok(())
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                AppError::Internal(format!("panic in filter chain: {}", msg)).write_response(ctx);
                Ok(())
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Matches the request against the static route table. No match halts the
/// chain with a 404; the continuation is only invoked for a resolved route.
pub struct RouterFilter {
    table: Arc<RouteTable>,
}

impl RouterFilter {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

impl Filter for RouterFilter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let _scope = TrailScope::enter();
        match self.table.resolve(&ctx.method, &ctx.path) {
            Some(route) => {
                tracing::debug!(method = %ctx.method, path = %ctx.path, action = %route.action, "route matched");
                ctx.action = Some(route);
                chain.next(ctx)
            }
            None => {
                tracing::debug!(method = %ctx.method, path = %ctx.path, "no route matched");
                ctx.respond_text(StatusCode::NOT_FOUND, "Not Found");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Per-action filter configuration hook
// ============================================================================

/// Splices action-specific filters ahead of the remaining chain when the
/// matched action has overrides configured.
pub struct FilterConfigFilter {
    per_action: HashMap<String, Vec<Arc<dyn Filter>>>,
}

impl FilterConfigFilter {
    pub fn new(per_action: HashMap<String, Vec<Arc<dyn Filter>>>) -> Self {
        Self { per_action }
    }
}

impl Filter for FilterConfigFilter {
    fn name(&self) -> &'static str {
        "filter-config"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let overrides = ctx
            .action
            .as_ref()
            .and_then(|route| self.per_action.get(&route.action));

        match overrides {
            Some(extra) if !extra.is_empty() => {
                let mut spliced: Vec<Arc<dyn Filter>> =
                    Vec::with_capacity(extra.len() + chain.remaining().len());
                spliced.extend(extra.iter().cloned());
                spliced.extend_from_slice(chain.remaining());
                Chain::new(&spliced).next(ctx)
            }
            _ => chain.next(ctx),
        }
    }
}

// ============================================================================
// Parameter binding
// ============================================================================

/// Parses the query string into the context's parameter map. The `token`
/// parameter consumed by the identity resolver arrives through this stage.
pub struct ParamsFilter;

impl Filter for ParamsFilter {
    fn name(&self) -> &'static str {
        "params"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        if let Some(query) = ctx.query.clone() {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                ctx.params
                    .insert(decode_component(name), decode_component(value));
            }
        }
        chain.next(ctx)
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    if let Ok(decoded) = urlencoding::decode(&spaced) {
        decoded.into_owned()
    } else {
        spaced
    }
}

// ============================================================================
// Cookie-backed state: session, flash, validation errors
// ============================================================================

/// Restores the session cookie into the context and writes it back after the
/// inner stages ran. The cookie payload is a base64url JSON map; anything
/// undecodable is treated as an empty session.
pub struct SessionFilter;

impl Filter for SessionFilter {
    fn name(&self) -> &'static str {
        "session"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let _scope = TrailScope::enter();
        let restored = cookie_value(&ctx.headers, SESSION_COOKIE);
        if let Some(raw) = &restored {
            ctx.session = decode_cookie_map(raw);
        }

        chain.next(ctx)?;

        if !ctx.session.is_empty() {
            let value = encode_cookie_map(&ctx.session);
            set_cookie(ctx, SESSION_COOKIE, &value);
        } else if restored.is_some() {
            expire_cookie(ctx, SESSION_COOKIE);
        }
        Ok(())
    }
}

/// One-shot flash messages: the inbound cookie is exposed to the action via
/// the view-args bag and cleared; outbound flash set during the request is
/// persisted for exactly the next one.
pub struct FlashFilter;

impl Filter for FlashFilter {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let restored = cookie_value(&ctx.headers, FLASH_COOKIE);
        if let Some(raw) = &restored {
            let incoming = decode_cookie_map(raw);
            ctx.view_args
                .insert("flash".to_string(), serde_json::json!(incoming));
        }

        chain.next(ctx)?;

        if !ctx.flash.is_empty() {
            let value = encode_cookie_map(&ctx.flash);
            set_cookie(ctx, FLASH_COOKIE, &value);
        } else if restored.is_some() {
            expire_cookie(ctx, FLASH_COOKIE);
        }
        Ok(())
    }
}

/// Restores validation errors kept from the previous request and persists
/// newly kept ones, mirroring the flash lifecycle.
pub struct ValidationFilter;

impl Filter for ValidationFilter {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let restored = cookie_value(&ctx.headers, ERRORS_COOKIE);
        if let Some(raw) = &restored {
            let errors = decode_cookie_list(raw);
            ctx.view_args
                .insert("errors".to_string(), serde_json::json!(errors));
        }

        chain.next(ctx)?;

        if !ctx.validation_errors.is_empty() {
            let value = encode_cookie_list(&ctx.validation_errors);
            set_cookie(ctx, ERRORS_COOKIE, &value);
        } else if restored.is_some() {
            expire_cookie(ctx, ERRORS_COOKIE);
        }
        Ok(())
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for piece in raw.split(';') {
            if let Some(value) = piece.trim().strip_prefix(name).and_then(|v| v.strip_prefix('=')) {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn decode_cookie_map(raw: &str) -> HashMap<String, String> {
    URL_SAFE_NO_PAD
        .decode(raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| {
            tracing::debug!("undecodable cookie payload, starting empty");
            HashMap::new()
        })
}

fn encode_cookie_map(map: &HashMap<String, String>) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(map).unwrap_or_default())
}

fn decode_cookie_list(raw: &str) -> Vec<String> {
    URL_SAFE_NO_PAD
        .decode(raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn encode_cookie_list(list: &[String]) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(list).unwrap_or_default())
}

fn set_cookie(ctx: &mut RequestContext, name: &str, value: &str) {
    let cookie = format!("{}={}; Path=/; HttpOnly", name, value);
    if let Ok(header) = HeaderValue::from_str(&cookie) {
        ctx.response.headers.append(SET_COOKIE, header);
    }
}

fn expire_cookie(ctx: &mut RequestContext, name: &str) {
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", name);
    if let Ok(header) = HeaderValue::from_str(&cookie) {
        ctx.response.headers.append(SET_COOKIE, header);
    }
}

// ============================================================================
// Locale resolution
// ============================================================================

/// Resolves the request locale: `lang` parameter, then the first
/// Accept-Language tag, then the configured default.
pub struct I18nFilter {
    default_lang: String,
}

impl I18nFilter {
    pub fn new(default_lang: String) -> Self {
        Self { default_lang }
    }
}

impl Filter for I18nFilter {
    fn name(&self) -> &'static str {
        "i18n"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let locale = ctx
            .param("lang")
            .map(str::to_string)
            .or_else(|| ctx.header_str(ACCEPT_LANGUAGE).and_then(first_language_tag))
            .unwrap_or_else(|| self.default_lang.clone());

        ctx.view_args
            .insert("currentLocale".to_string(), serde_json::json!(locale));
        ctx.locale = locale;
        chain.next(ctx)
    }
}

fn first_language_tag(value: &str) -> Option<String> {
    let tag = value.split(',').next()?.split(';').next()?.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

// ============================================================================
// Security headers
// ============================================================================

/// Pure side-effecting pass-through: sets the four fixed security headers and
/// always continues. Never reads the identity context, never halts.
pub struct HeaderFilter;

impl Filter for HeaderFilter {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let headers = &mut ctx.response.headers;
        headers.insert("X-Frame-Options", HeaderValue::from_static("SAMEORIGIN"));
        headers.insert("X-XSS-Protection", HeaderValue::from_static("1; mode=block"));
        headers.insert(
            "X-Content-Type-Options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(
            "Referrer-Policy",
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        chain.next(ctx)
    }
}

// ============================================================================
// Interceptors
// ============================================================================

/// Outcome of an interceptor's before-hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    Continue,
    Halt,
}

/// Hooks running around the rest of the chain. Before-hooks run in
/// registration order and may halt; after-hooks run in reverse order once the
/// inner stages returned.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn before(&self, _ctx: &mut RequestContext) -> AppResult<Intercept> {
        Ok(Intercept::Continue)
    }

    fn after(&self, _ctx: &mut RequestContext) -> AppResult<()> {
        Ok(())
    }
}

pub struct InterceptorFilter {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorFilter {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }
}

impl Filter for InterceptorFilter {
    fn name(&self) -> &'static str {
        "interceptors"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let _scope = TrailScope::enter();
        for interceptor in &self.interceptors {
            if interceptor.before(ctx)? == Intercept::Halt {
                tracing::debug!(interceptor = interceptor.name(), "interceptor halted the chain");
                return Ok(());
            }
        }

        chain.next(ctx)?;

        for interceptor in self.interceptors.iter().rev() {
            interceptor.after(ctx)?;
        }
        Ok(())
    }
}

// ============================================================================
// Compression negotiation
// ============================================================================

/// Records whether the client accepts gzip and marks the response as varying
/// on Accept-Encoding. The encoding itself belongs to the transport layer;
/// this stage only negotiates.
pub struct CompressFilter;

impl Filter for CompressFilter {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
        let accepts_gzip = ctx
            .header_str(ACCEPT_ENCODING)
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        chain.next(ctx)?;

        ctx.response
            .headers
            .insert(VARY, HeaderValue::from_static("Accept-Encoding"));
        ctx.gzip_ok = accepts_gzip;
        Ok(())
    }
}

// ============================================================================
// Action invocation
// ============================================================================

/// Terminal stage: resets the identity to the anonymous zero-value, runs the
/// identity resolver synchronously and unconditionally, then dispatches the
/// matched action. Recoverable resolver outcomes never halt the chain; an
/// unauthenticated caller reaches the action with the anonymous context, and
/// authorization is entirely the action's concern. Only the resolver's fatal
/// tier propagates to the recovery boundary.
pub struct ActionInvoker {
    resolver: IdentityResolver,
    diag: TrailLogger,
}

impl ActionInvoker {
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            diag: TrailLogger::to_tracing_debug(),
        }
    }
}

impl Filter for ActionInvoker {
    fn name(&self) -> &'static str {
        "action"
    }

    fn call(&self, ctx: &mut RequestContext, _chain: Chain<'_>) -> AppResult<()> {
        let _scope = TrailScope::enter();
        set_identity(ctx, UserInfo::default());
        self.resolver.resolve(ctx)?;

        let Some(route) = ctx.action.clone() else {
            // The router short-circuits unmatched requests before this stage;
            // guard against a chain assembled without it.
            ctx.respond_text(StatusCode::NOT_FOUND, "Not Found");
            return Ok(());
        };

        self.diag
            .write_line(&format!("invoking action {}", route.action));
        (route.handler)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestContext;

    fn terminal_probe(log: Arc<std::sync::Mutex<Vec<&'static str>>>) -> Arc<dyn Filter> {
        struct Probe {
            log: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        impl Filter for Probe {
            fn name(&self) -> &'static str {
                "probe"
            }
            fn call(&self, _ctx: &mut RequestContext, _chain: Chain<'_>) -> AppResult<()> {
                self.log.lock().unwrap().push("probe");
                Ok(())
            }
        }
        Arc::new(Probe { log })
    }

    #[test]
    fn header_filter_sets_all_four_and_continues() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(HeaderFilter), terminal_probe(log.clone())];
        let mut ctx = RequestContext::get("/");
        Chain::new(&stages).next(&mut ctx).unwrap();

        let expected = [
            ("X-Frame-Options", "SAMEORIGIN"),
            ("X-XSS-Protection", "1; mode=block"),
            ("X-Content-Type-Options", "nosniff"),
            ("Referrer-Policy", "strict-origin-when-cross-origin"),
        ];
        for (name, value) in expected {
            assert_eq!(ctx.response.headers.get(name).unwrap(), value, "{}", name);
        }
        assert_eq!(*log.lock().unwrap(), vec!["probe"]);
    }

    #[test]
    fn params_filter_decodes_query_pairs() {
        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(ParamsFilter)];
        let mut ctx = RequestContext::get("/x?token=abc.def&msg=hello%20world&plus=a+b&flag");
        Chain::new(&stages).next(&mut ctx).unwrap();
        assert_eq!(ctx.param("token"), Some("abc.def"));
        assert_eq!(ctx.param("msg"), Some("hello world"));
        assert_eq!(ctx.param("plus"), Some("a b"));
        assert_eq!(ctx.param("flag"), Some(""));
    }

    #[test]
    fn i18n_prefers_param_over_header() {
        let stages: Vec<Arc<dyn Filter>> =
            vec![Arc::new(ParamsFilter), Arc::new(I18nFilter::new("en".into()))];
        let mut ctx = RequestContext::get("/x?lang=ru");
        ctx.headers
            .insert(ACCEPT_LANGUAGE, HeaderValue::from_static("de-DE,de;q=0.9"));
        Chain::new(&stages).next(&mut ctx).unwrap();
        assert_eq!(ctx.locale, "ru");
    }

    #[test]
    fn i18n_falls_back_to_header_then_default() {
        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(I18nFilter::new("en".into()))];

        let mut ctx = RequestContext::get("/x");
        ctx.headers
            .insert(ACCEPT_LANGUAGE, HeaderValue::from_static("de-DE,de;q=0.9"));
        Chain::new(&stages).next(&mut ctx).unwrap();
        assert_eq!(ctx.locale, "de-DE");

        let mut bare = RequestContext::get("/x");
        Chain::new(&stages).next(&mut bare).unwrap();
        assert_eq!(bare.locale, "en");
    }

    #[test]
    fn session_cookie_roundtrip() {
        struct WriteSession;
        impl Filter for WriteSession {
            fn name(&self) -> &'static str {
                "write-session"
            }
            fn call(&self, ctx: &mut RequestContext, _chain: Chain<'_>) -> AppResult<()> {
                ctx.session.insert("uid".to_string(), "42".to_string());
                Ok(())
            }
        }

        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(SessionFilter), Arc::new(WriteSession)];
        let mut ctx = RequestContext::get("/");
        Chain::new(&stages).next(&mut ctx).unwrap();

        let set = ctx.response.headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        let value = set
            .strip_prefix("TURNSTILE_SESSION=")
            .unwrap()
            .split(';')
            .next()
            .unwrap();
        let restored = decode_cookie_map(value);
        assert_eq!(restored.get("uid").map(String::as_str), Some("42"));

        // Feed the persisted cookie back in and observe the restore.
        let mut next = RequestContext::get("/");
        next.headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("TURNSTILE_SESSION={}", value)).unwrap(),
        );
        let restore_only: Vec<Arc<dyn Filter>> = vec![Arc::new(SessionFilter)];
        Chain::new(&restore_only).next(&mut next).unwrap();
        assert_eq!(next.session.get("uid").map(String::as_str), Some("42"));
    }

    #[test]
    fn undecodable_session_cookie_starts_empty() {
        let mut ctx = RequestContext::get("/");
        ctx.headers.insert(
            COOKIE,
            HeaderValue::from_static("TURNSTILE_SESSION=!!!garbage!!!"),
        );
        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(SessionFilter)];
        Chain::new(&stages).next(&mut ctx).unwrap();
        assert!(ctx.session.is_empty());
    }

    #[test]
    fn interceptor_halt_skips_the_suffix() {
        struct Gate;
        impl Interceptor for Gate {
            fn name(&self) -> &'static str {
                "gate"
            }
            fn before(&self, ctx: &mut RequestContext) -> AppResult<Intercept> {
                ctx.respond_text(StatusCode::TOO_MANY_REQUESTS, "slow down");
                Ok(Intercept::Halt)
            }
        }

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Filter>> = vec![
            Arc::new(InterceptorFilter::new(vec![Arc::new(Gate)])),
            terminal_probe(log.clone()),
        ];
        let mut ctx = RequestContext::get("/");
        Chain::new(&stages).next(&mut ctx).unwrap();
        assert_eq!(ctx.response.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn compress_filter_marks_negotiation_only() {
        let stages: Vec<Arc<dyn Filter>> = vec![Arc::new(CompressFilter)];

        let mut gzip = RequestContext::get("/");
        gzip.headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        Chain::new(&stages).next(&mut gzip).unwrap();
        assert!(gzip.gzip_ok);
        assert_eq!(gzip.response.headers.get(VARY).unwrap(), "Accept-Encoding");

        let mut plain = RequestContext::get("/");
        Chain::new(&stages).next(&mut plain).unwrap();
        assert!(!plain.gzip_ok);
    }
}
