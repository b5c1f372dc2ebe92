use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

pub mod config;
pub mod credentials;
pub mod error;
pub mod filters;
pub mod identity;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod trail;

pub use config::{AuthMode, Config, ConfigSource, EnvSource, MapSource};
pub use error::{AppError, AppResult};
pub use identity::{Credential, IdentityResolver, UserInfo};
pub use pipeline::{Chain, Filter, FilterChain, RequestContext};
pub use server::App;

/// Bind the listener and serve the application until the process exits.
pub async fn run(config: Config) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(mode = ?config.auth_mode, "turnstile listening on http://{}", addr);

    let app = Arc::new(App::new(config));

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let app = app.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let app = app.clone();
                async move {
                    match app.handle(req) {
                        Ok(response) => Ok::<_, std::convert::Infallible>(response),
                        Err(err) => {
                            // Unreachable with the default chain; the recovery
                            // stage converts faults into responses.
                            let mut ctx = pipeline::RequestContext::get("/");
                            err.write_response(&mut ctx);
                            Ok(server::render_response(ctx))
                        }
                    }
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(peer = %peer, "connection error: {}", err);
            }
        });
    }
}
