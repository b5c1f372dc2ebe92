use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming as IncomingBody;
use hyper::{Request, Response};

use crate::config::Config;
use crate::error::AppResult;
use crate::filters::default_chain;
use crate::pipeline::{FilterChain, RequestContext};
use crate::routes::{default_routes, RouteTable};

/// Process-wide application state: the assembled pipeline plus configuration.
/// Built once at startup, shared across connections.
pub struct App {
    chain: FilterChain,
    pub config: Arc<Config>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let routes = Arc::new(default_routes());
        Self {
            chain: default_chain(config.clone(), routes),
            config,
        }
    }

    pub fn with_routes(config: Config, routes: RouteTable) -> Self {
        let config = Arc::new(config);
        Self {
            chain: default_chain(config.clone(), Arc::new(routes)),
            config,
        }
    }

    /// Run one request through the pipeline and render the response.
    ///
    /// The recovery stage at the head of the chain absorbs every fault, so
    /// this only errs if the chain was assembled without it.
    pub fn handle(&self, req: Request<IncomingBody>) -> AppResult<Response<Full<Bytes>>> {
        let (parts, _body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut ctx = RequestContext::new(parts.method, path_and_query, parts.headers);
        self.chain.run(&mut ctx)?;
        Ok(render_response(ctx))
    }
}

pub fn render_response(ctx: RequestContext) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(ctx.response.body)));
    *response.status_mut() = ctx.response.status;
    *response.headers_mut() = ctx.response.headers;
    response
}
