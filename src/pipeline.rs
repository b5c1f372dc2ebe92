use std::collections::HashMap;
use std::sync::Arc;

use hyper::header::AsHeaderName;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Serialize;

use crate::error::AppResult;
use crate::identity::UserInfo;
use crate::routes::Route;

/// Response under construction, rendered by the transport adapter once the
/// chain returns.
#[derive(Debug)]
pub struct ResponseState {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }
}

/// Per-request state threaded through the filter chain.
///
/// One context per request; nothing here outlives the request or is shared
/// across requests. The identity field starts as the anonymous zero-value and
/// is written exactly once, by the resolver inside the action-invocation
/// stage.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,

    /// Bound request parameters (query string, filled by the params stage).
    pub params: HashMap<String, String>,
    /// Route matched by the router stage.
    pub action: Option<Route>,
    /// Resolved caller identity; anonymous until the resolver runs.
    pub identity: UserInfo,
    /// Request-scoped bag consumed by actions and templates.
    pub view_args: HashMap<String, serde_json::Value>,

    pub session: HashMap<String, String>,
    pub flash: HashMap<String, String>,
    pub validation_errors: Vec<String>,
    pub locale: String,
    /// Whether the client negotiated gzip; encoding itself is applied by the
    /// transport layer.
    pub gzip_ok: bool,

    pub response: ResponseState,
}

impl RequestContext {
    pub fn new(method: Method, path_and_query: &str, headers: HeaderMap) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers,
            params: HashMap::new(),
            action: None,
            identity: UserInfo::default(),
            view_args: HashMap::new(),
            session: HashMap::new(),
            flash: HashMap::new(),
            validation_errors: Vec::new(),
            locale: String::new(),
            gzip_ok: false,
            response: ResponseState::default(),
        }
    }

    /// Shorthand for a bare GET request, mostly used by tests.
    pub fn get(path_and_query: &str) -> Self {
        Self::new(Method::GET, path_and_query, HeaderMap::new())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header_str<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn respond_text(&mut self, status: StatusCode, body: &str) {
        self.response.status = status;
        self.response.headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.response.body = body.to_string();
    }

    pub fn respond_json<T: Serialize>(&mut self, status: StatusCode, body: &T) -> AppResult<()> {
        let rendered = serde_json::to_string(body)?;
        self.response.status = status;
        self.response.headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        self.response.body = rendered;
        Ok(())
    }
}

/// A unit of the request pipeline.
///
/// A stage that wants processing to continue must invoke `chain.next(ctx)`;
/// returning without doing so short-circuits the remainder of the chain.
/// Stages do not recover faults themselves; anything they panic or `Err` with
/// propagates to the recovery boundary at the head of the chain.
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;
    fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()>;
}

/// Continuation handed to each stage: the remaining suffix of the chain.
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    stages: &'a [Arc<dyn Filter>],
}

impl<'a> Chain<'a> {
    pub fn new(stages: &'a [Arc<dyn Filter>]) -> Self {
        Self { stages }
    }

    /// Invoke the next stage with the rest of the chain as its continuation.
    /// A no-op on an exhausted chain.
    pub fn next(self, ctx: &mut RequestContext) -> AppResult<()> {
        match self.stages.split_first() {
            Some((head, rest)) => head.call(ctx, Chain { stages: rest }),
            None => Ok(()),
        }
    }

    pub fn remaining(&self) -> &'a [Arc<dyn Filter>] {
        self.stages
    }
}

/// The fixed, process-wide pipeline. Built once at startup, immutable during
/// execution, shared by reference across request contexts.
pub struct FilterChain {
    stages: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Arc<dyn Filter>>) -> Self {
        Self { stages }
    }

    pub fn run(&self, ctx: &mut RequestContext) -> AppResult<()> {
        Chain::new(&self.stages).next(ctx)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Tag {
        label: &'static str,
        halt: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Filter for Tag {
        fn name(&self) -> &'static str {
            self.label
        }

        fn call(&self, ctx: &mut RequestContext, chain: Chain<'_>) -> AppResult<()> {
            self.log.lock().unwrap().push(self.label);
            if self.halt {
                return Ok(());
            }
            chain.next(ctx)
        }
    }

    fn tag(label: &'static str, halt: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Filter> {
        Arc::new(Tag {
            label,
            halt,
            log: log.clone(),
        })
    }

    #[test]
    fn stages_run_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            tag("a", false, &log),
            tag("b", false, &log),
            tag("c", false, &log),
        ]);
        let mut ctx = RequestContext::get("/");
        chain.run(&mut ctx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn halting_stage_short_circuits_the_suffix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            tag("a", false, &log),
            tag("stop", true, &log),
            tag("never", false, &log),
        ]);
        let mut ctx = RequestContext::get("/");
        chain.run(&mut ctx).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "stop"]);
    }

    #[test]
    fn empty_chain_is_a_no_op() {
        let chain = FilterChain::new(Vec::new());
        let mut ctx = RequestContext::get("/");
        assert!(chain.run(&mut ctx).is_ok());
        assert_eq!(ctx.response.status, StatusCode::OK);
    }

    #[test]
    fn context_splits_path_and_query() {
        let ctx = RequestContext::get("/whoami?token=abc&x=1");
        assert_eq!(ctx.path, "/whoami");
        assert_eq!(ctx.query.as_deref(), Some("token=abc&x=1"));
    }
}
