use super::{HttpTransport, Request, Response};
use crate::{
    call::Call,
    error::{RpcError, RpcResult},
    module::Module,
    transport::Transport,
};
use bytes::{Bytes, BytesMut};
use futures::{
    future::BoxFuture,
    stream::{BoxStream, StreamExt, TryStreamExt},
};
use http::{HeaderMap, Method, StatusCode};
use std::{collections::HashMap, io, sync::Arc};
use tokio_util::{
    codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead},
    io::StreamReader,
};
use tracing::{debug, trace};

pub type ByteStream = BoxStream<'static, RpcResult<Bytes>>;

pub struct HttpReply {
    pub status: StatusCode,
    pub body: ByteStream,
}

/// The HTTP round trip underneath [`HttpTransport`]: one POST, a streamed body.
pub trait HttpClient: Send + Sync {
    fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> BoxFuture<'static, RpcResult<HttpReply>>;
}

fn transport_failure(error: impl ToString) -> RpcError {
    RpcError::TransportFailure(error.to_string())
}

#[derive(Default, Clone)]
pub struct ReqwestClient(reqwest::Client);

impl ReqwestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self(client)
    }
}

impl HttpClient for ReqwestClient {
    fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> BoxFuture<'static, RpcResult<HttpReply>> {
        let request = self.0.post(url).headers(headers).body(body);
        Box::pin(async move {
            let response = request.send().await.map_err(transport_failure)?;
            Ok(HttpReply {
                status: response.status(),
                body: response.bytes_stream().map_err(transport_failure).boxed(),
            })
        })
    }
}

/// Delivers posts to a serving [`HttpTransport`] in the same process.
#[derive(Clone)]
pub struct LoopbackClient {
    server: Arc<HttpTransport>,
    module: Module,
}

impl LoopbackClient {
    pub fn new(server: Arc<HttpTransport>, module: Module) -> Self {
        Self { server, module }
    }
}

impl HttpClient for LoopbackClient {
    fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> BoxFuture<'static, RpcResult<HttpReply>> {
        let server = Arc::clone(&self.server);
        let module = self.module.clone();
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(body)
            .map(|mut request| {
                *request.headers_mut() = headers;
                request
            });
        Box::pin(async move {
            let request = request.map_err(transport_failure)?;
            let response = server.respond(&module, request).await;
            Ok(HttpReply {
                status: response.status(),
                body: response
                    .into_body()
                    .into_data_stream()
                    .map_err(transport_failure)
                    .boxed(),
            })
        })
    }
}

/// Newline-delimited frames of raw bytes. A frame longer than
/// `max_length` is discarded up to its newline and comes out empty.
struct ResponseLines(AnyDelimiterCodec);

impl ResponseLines {
    fn new(max_length: usize) -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            max_length,
        ))
    }

    fn skip_oversized(
        frame: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Bytes>, AnyDelimiterCodecError> {
        match frame {
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                trace!("skipping oversized response line");
                Ok(Some(Bytes::new()))
            }
            frame => frame,
        }
    }
}

impl Decoder for ResponseLines {
    type Item = Bytes;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        Self::skip_oversized(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        Self::skip_oversized(self.0.decode_eof(buf))
    }
}

/// Split a streamed body into lines. The last line needs no terminator.
fn lines(body: ByteStream, max_length: usize) -> BoxStream<'static, RpcResult<Bytes>> {
    let reader = StreamReader::new(body.map_err(io::Error::other));
    FramedRead::new(reader, ResponseLines::new(max_length))
        .map_err(transport_failure)
        .boxed()
}

impl HttpTransport {
    /// Validate, post and demultiplex one batch.
    async fn send_batch(&self, module: &Module, calls: Vec<Arc<Call>>) -> RpcResult<()> {
        let mut pending: HashMap<String, Arc<Call>> = HashMap::with_capacity(calls.len());
        let mut requests = Vec::with_capacity(calls.len());

        for call in calls {
            let checked = match module.host(call.name()) {
                Some(host) => host.validate_input(call.args().to_vec()),
                None => Err(RpcError::NotFound {
                    name: call.name().to_owned(),
                }),
            };
            match checked {
                Ok(args) => {
                    requests.push(Request {
                        id: call.id().to_owned(),
                        name: call.name().to_owned(),
                        args,
                    });
                    pending.insert(call.id().to_owned(), call);
                }
                Err(error) => {
                    trace!(id = %call.id(), rpc = %call.name(), %error, "call failed validation");
                    call.reject(error);
                }
            }
        }
        if requests.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(&requests)?;
        debug!(url = %self.url, size = requests.len(), "posting batch");
        let reply = self
            .client
            .post(&self.url, self.headers.clone(), body.into())
            .await?;
        if !reply.status.is_success() {
            return Err(RpcError::TransportFailure(format!(
                "server responded with {}",
                reply.status
            )));
        }

        let mut lines = lines(reply.body, self.config.max_body);
        while let Some(line) = lines.next().await {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let response: Response = match serde_json::from_slice(&line) {
                Ok(response) => response,
                Err(error) => {
                    trace!(%error, "skipping undecodable response line");
                    continue;
                }
            };
            let Some(call) = pending.get(&response.id) else {
                trace!(id = %response.id, "response for unknown call");
                continue;
            };
            let outcome = response
                .into_result()
                .and_then(|value| match module.host(call.name()) {
                    Some(host) => host.validate_output(value),
                    None => Ok(value),
                });
            match outcome {
                Ok(value) => call.resolve(value),
                Err(error) => call.reject(error),
            };
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        module: &'a Module,
        calls: Vec<Arc<Call>>,
    ) -> BoxFuture<'a, RpcResult<()>> {
        Box::pin(self.send_batch(module, calls))
    }
}
