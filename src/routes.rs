use hyper::{Method, StatusCode};
use serde_json::json;

use crate::error::AppResult;
use crate::pipeline::RequestContext;
use crate::trail::TrailScope;

/// Application action invoked at the end of the filter chain.
pub type Handler = fn(&mut RequestContext) -> AppResult<()>;

#[derive(Clone, Debug)]
pub struct Route {
    pub method: Method,
    pub path: String,
    pub action: String,
    pub handler: Handler,
}

/// Static routing table, built once at startup and immutable afterwards.
#[derive(Default, Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: Method, path: &str, action: &str, handler: Handler) -> Self {
        self.routes.push(Route {
            method,
            path: path.to_string(),
            action: action.to_string(),
            handler,
        });
        self
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<Route> {
        self.routes
            .iter()
            .find(|r| r.method == *method && r.path == path)
            .cloned()
    }
}

/// Routes served by the turnstile binary.
pub fn default_routes() -> RouteTable {
    RouteTable::new()
        .route(Method::GET, "/health", "App.Health", health)
        .route(Method::GET, "/whoami", "App.WhoAmI", whoami)
        .route(Method::GET, "/admin/status", "Admin.Status", admin_status)
}

fn health(ctx: &mut RequestContext) -> AppResult<()> {
    ctx.respond_text(StatusCode::OK, "OK");
    Ok(())
}

/// Renders the identity context resolved for this request. Works for
/// anonymous callers too; that is the point.
fn whoami(ctx: &mut RequestContext) -> AppResult<()> {
    let _scope = TrailScope::enter();
    let me = ctx.identity.clone();
    ctx.respond_json(StatusCode::OK, &me)
}

/// Authorization happens here, in the action: the resolver never blocks a
/// request, it only says who the caller is.
fn admin_status(ctx: &mut RequestContext) -> AppResult<()> {
    let _scope = TrailScope::enter();
    if !ctx.identity.is_admin {
        ctx.respond_json(
            StatusCode::FORBIDDEN,
            &json!({ "error": "administrator access required" }),
        )?;
        return Ok(());
    }

    let admin = ctx.identity.login.clone();
    ctx.respond_json(StatusCode::OK, &json!({ "status": "ok", "admin": admin }))
}
