use super::{HttpTransport, Request, Response};
use crate::{
    context::{self, Context},
    error::{HandlerError, RpcError},
    module::Module,
};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{
    future::{join_all, BoxFuture},
    stream::{FuturesUnordered, StreamExt},
};
use http::{header::CONTENT_TYPE, request::Parts, HeaderValue, StatusCode};
use serde_json::{json, Map, Value};
use std::{convert::Infallible, future::Future, io, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, error, trace, warn};

/// Runs ahead of every inbound batch with the batch's [`Context`].
///
/// All middleware of a transport run concurrently. A failure is logged and
/// does not stop the batch.
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        request: &'a Parts,
        context: Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(&Parts, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        request: &'a Parts,
        context: Context,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(self(request, context))
    }
}

fn plain(status: StatusCode, body: impl Into<Body>) -> http::Response<Body> {
    let mut response = http::Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn seed_context(parts: &Parts) -> Context {
    let headers: Map<String, Value> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            (name.as_str().to_owned(), Value::String(value))
        })
        .collect();
    Context::create([
        (
            "request",
            json!({ "method": parts.method.as_str(), "uri": parts.uri.to_string() }),
        ),
        ("headers", Value::Object(headers)),
    ])
}

fn encode_line(response: &Response) -> Bytes {
    let mut line = serde_json::to_vec(response).unwrap_or_else(|e| {
        error!(id = %response.id, error = %e, "failed to encode response");
        Vec::new()
    });
    line.push(b'\n');
    Bytes::from(line)
}

/// Serve one request; every failure becomes an error line.
async fn dispatch(module: Module, request: Request) -> Response {
    let Request { id, name, args } = request;
    let outcome = async {
        let host = module
            .host(&name)
            .ok_or_else(|| RpcError::NotFound { name: name.clone() })?;
        let args = host.validate_input(args)?;
        let retval = module
            .resolve(Request {
                id: id.clone(),
                name: name.clone(),
                args,
            })
            .await?;
        host.validate_output(retval)
    }
    .await;
    trace!(%id, rpc = %name, ok = outcome.is_ok(), "request settled");
    match outcome {
        Ok(result) => Response::ok(id, name, result),
        Err(error) => Response::err(id, name, error),
    }
}

impl HttpTransport {
    /// Decode an inbound batch and stream each outcome back as soon as it is
    /// ready. Lines are not ordered by request; the body ends once every
    /// request has answered. Bodies over `max_body` are refused with 413.
    pub async fn respond(
        &self,
        module: &Module,
        request: http::Request<Bytes>,
    ) -> http::Response<Body> {
        let (parts, body) = request.into_parts();
        if body.len() > self.config.max_body {
            warn!(size = body.len(), limit = self.config.max_body, "request batch too large");
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
        let requests: Vec<Request> = match serde_json::from_slice(&body) {
            Ok(requests) => requests,
            Err(error) => {
                warn!(%error, "undecodable request batch");
                return plain(StatusCode::BAD_REQUEST, format!("Invalid request body: {error}"));
            }
        };
        if requests.is_empty() {
            return plain(StatusCode::NO_CONTENT, Body::empty());
        }
        debug!(module = %module.name(), size = requests.len(), "responding to batch");

        let batch = seed_context(&parts);
        let outcomes = join_all(self.middleware.iter().map(|middleware| {
            context::run(batch.clone(), middleware.handle(&parts, batch.clone()))
        }))
        .await;
        for error in outcomes.into_iter().filter_map(Result::err) {
            warn!(%error, "middleware failed");
        }

        let pending: FuturesUnordered<_> = requests
            .into_iter()
            .map(|request| context::run(batch.clone(), dispatch(module.clone(), request)))
            .collect();
        let lines = pending.map(|response| Ok::<_, Infallible>(encode_line(&response)));

        let mut response = plain(StatusCode::OK, Body::from_stream(lines));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// Liveness probe at the configured health path; everything else is
    /// treated as a batch.
    pub fn router(self: Arc<Self>, module: Module) -> Router {
        let health = format!("{}@{} is healthy", module.name(), module.version());
        let health_path = self.config.health_path.clone();
        let max_body = self.config.max_body;
        Router::new()
            .route(&health_path, get(move || async move { health }))
            .fallback(handle)
            .layer(DefaultBodyLimit::max(max_body))
            .with_state(Arc::new(Served {
                transport: self,
                module,
            }))
    }

    pub async fn serve(self: Arc<Self>, module: Module, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            debug!(%addr, module = %module.name(), "serving");
        }
        axum::serve(listener, self.router(module)).await
    }
}

struct Served {
    transport: Arc<HttpTransport>,
    module: Module,
}

async fn handle(
    State(served): State<Arc<Served>>,
    parts: Parts,
    body: Bytes,
) -> http::Response<Body> {
    served
        .transport
        .respond(&served.module, http::Request::from_parts(parts, body))
        .await
}
