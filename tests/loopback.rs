use batchrpc::{
    context, schema, typed, BoxFuture, Context, HandlerError, HttpClient, HttpReply,
    HttpTransport, HttpTransportConfig, LoopbackClient, Module, ModuleConfig, RpcError,
    RpcResult, Spec, Type,
};
use bytes::Bytes;
use http::{request::Parts, HeaderMap};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::net::TcpListener;

fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn multiply() -> Spec {
    Spec::new("multiply")
        .describe("Multiply two integers")
        .schema(schema!([Type::Int, Type::Int] => Type::Int))
}

fn whoami() -> Spec {
    Spec::new("whoami").schema(schema!([] => Type::String))
}

fn server() -> Module {
    let module = Module::new(ModuleConfig {
        name: "calculator".into(),
        version: "1.2.0".into(),
        ..ModuleConfig::default()
    });
    let stub = module.define(multiply());
    module
        .construct(
            &stub,
            typed(|(a, b): (i64, i64)| async move { Ok::<_, HandlerError>(a * b) }),
        )
        .unwrap();
    let stub = module.define(whoami());
    module
        .construct(&stub, |_args: Vec<Value>| async {
            Ok::<_, HandlerError>(context::get_or("user", json!("anonymous")))
        })
        .unwrap();
    module
}

fn serving_transport() -> HttpTransport {
    HttpTransport::new(HttpTransportConfig::default())
        .unwrap()
        .middleware(|parts: &Parts, context: Context| {
            let token = parts
                .headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_owned);
            async move {
                let Some(token) = token else {
                    return Err(HandlerError::new("missing token"));
                };
                context.set("user", json!(token));
                Ok(())
            }
        })
}

/// Counts posts on their way through to the wrapped client.
struct Counting<C> {
    inner: C,
    posts: AtomicUsize,
}

impl<C: HttpClient> HttpClient for Counting<C> {
    fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> BoxFuture<'static, RpcResult<HttpReply>> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        self.inner.post(url, headers, body)
    }
}

fn client(config: HttpTransportConfig) -> (Module, Arc<Counting<LoopbackClient>>) {
    let loopback = LoopbackClient::new(Arc::new(serving_transport()), server());
    let counting = Arc::new(Counting {
        inner: loopback,
        posts: AtomicUsize::new(0),
    });
    let transport = HttpTransport::with_client(config, counting.clone()).unwrap();
    let module = Module::default();
    module.use_transport(Arc::new(transport));
    (module, counting)
}

#[tokio::test]
async fn concurrent_calls_share_one_post() {
    init_tracing();
    let (module, counting) = client(HttpTransportConfig::default());
    let multiply = module.define(multiply());

    let (a, b, c) = tokio::join!(
        multiply.invoke::<_, i64>((3, 4)),
        multiply.invoke::<_, i64>((5, 6)),
        multiply.invoke::<_, i64>((7, 8)),
    );
    assert_eq!((a, b, c), (Ok(12), Ok(30), Ok(56)));
    assert_eq!(counting.posts.load(Ordering::SeqCst), 1);

    assert_eq!(multiply.invoke::<_, i64>((2, 2)).await, Ok(4));
    assert_eq!(counting.posts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_call_does_not_sink_its_batch() {
    init_tracing();
    let (module, counting) = client(HttpTransportConfig::default());
    let multiply = module.define(multiply());

    let (valid, invalid) = tokio::join!(
        multiply.call(vec![json!(3), json!(4)]),
        multiply.call(vec![json!(3)]),
    );
    assert_eq!(valid, Ok(json!(12)));
    assert_eq!(invalid, Err(RpcError::InvalidArguments));
    assert_eq!(counting.posts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_rpc_is_reported_per_call() {
    init_tracing();
    let (module, _) = client(HttpTransportConfig::default());
    let multiply = module.define(multiply());
    let divide = module.define(Spec::new("divide"));

    let (product, quotient) = tokio::join!(
        multiply.call(vec![json!(3), json!(4)]),
        divide.call(vec![json!(3), json!(4)]),
    );
    assert_eq!(product, Ok(json!(12)));
    assert_eq!(
        quotient,
        Err(RpcError::Remote("IRPC can not be found.".into()))
    );
}

#[tokio::test]
async fn configured_headers_reach_middleware() {
    init_tracing();
    let (anonymous, _) = client(HttpTransportConfig::default());
    let (module, _) =
        client(HttpTransportConfig::default().header("authorization", "Bearer ada"));

    assert_eq!(
        anonymous.define(whoami()).invoke::<_, String>(()).await,
        Ok("anonymous".into())
    );
    assert_eq!(
        module.define(whoami()).invoke::<_, String>(()).await,
        Ok("ada".into())
    );
}

#[tokio::test]
async fn over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let serving = Arc::new(serving_transport());
    tokio::spawn(serving.serve(server(), listener));

    let health = reqwest::get(format!("{base_url}/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "calculator@1.2.0 is healthy");

    let transport = HttpTransport::new(
        HttpTransportConfig::new("//irpc").base_url(format!("{base_url}/")),
    )
    .unwrap();
    assert_eq!(transport.url(), format!("{base_url}/irpc"));

    let module = Module::default();
    module.use_transport(Arc::new(transport));
    let multiply = module.define(multiply());

    let (a, b) = tokio::join!(
        multiply.invoke::<_, i64>((6, 7)),
        multiply.invoke::<_, i64>((-2, 8)),
    );
    assert_eq!((a, b), (Ok(42), Ok(-16)));
}
