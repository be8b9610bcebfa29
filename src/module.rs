use crate::{
    batch::Batcher,
    call::{Call, Payload},
    error::{HandlerError, RpcError, RpcResult},
    net::Request,
    transport::Transport,
    types::Schema,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::{debug, warn};

/// A server-side implementation of one RPC.
pub trait RpcFunction: Send + Sync {
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>>;
}

impl<F, Fut> RpcFunction for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> {
        Box::pin(self(args))
    }
}

/// Adapt a function over deserialized arguments into an [`RpcFunction`].
///
/// The argument list is decoded as a JSON array, so tuples line up
/// positionally, e.g. a `(i64, i64)` parameter takes two integer arguments.
pub fn typed<A, R, F, Fut>(f: F) -> impl RpcFunction
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    move |args: Vec<Value>| {
        let decoded = serde_json::from_value::<A>(Value::Array(args)).map(&f);
        async move {
            let retval = decoded.map_err(|e| HandlerError::new(e.to_string()))?.await?;
            serde_json::to_value(retval).map_err(|e| HandlerError::new(e.to_string()))
        }
    }
}

/// Declaration of one RPC, shared by the calling and serving sides.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Schema>,
}

impl Spec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Registration record of a defined RPC. The handler is bound later.
#[derive(Clone)]
pub struct Host {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Schema>,
    handler: Option<Arc<dyn RpcFunction>>,
}

impl Host {
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn validate_input(&self, args: Vec<Value>) -> RpcResult<Vec<Value>> {
        match &self.schema {
            Some(schema) => schema.validate_input(args),
            None => Ok(args),
        }
    }

    pub fn validate_output(&self, value: Value) -> RpcResult {
        match &self.schema {
            Some(schema) => schema.validate_output(value),
            None => Ok(value),
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub description: Option<String>,
    pub implemented: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub name: String,
    pub version: String,
    /// Per-call deadline for remote calls. `None` or `0` disables it.
    pub timeout_ms: Option<u64>,
    /// How long the first call of a batch waits for company.
    pub batch_delay_ms: u64,
}

impl ModuleConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: "irpc".into(),
            version: "0.1.0".into(),
            timeout_ms: Some(10_000),
            batch_delay_ms: 0,
        }
    }
}

/// Registry of RPCs and dispatcher for calls made through their stubs.
///
/// Cloning yields another handle to the same module.
#[derive(Clone)]
pub struct Module {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    version: String,
    hosts: DashMap<String, Host>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    timeout: RwLock<Option<Duration>>,
    batcher: Batcher<Arc<Call>>,
}

impl Module {
    pub fn new(config: ModuleConfig) -> Self {
        let timeout = config.timeout();
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                version: config.version,
                hosts: DashMap::new(),
                transport: RwLock::new(None),
                timeout: RwLock::new(timeout),
                batcher: Batcher::new(Duration::from_millis(config.batch_delay_ms)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self
            .inner
            .timeout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self
            .inner
            .timeout
            .write()
            .unwrap_or_else(PoisonError::into_inner) = timeout.filter(|t| !t.is_zero());
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the transport used by every later remote call.
    pub fn use_transport(&self, transport: Arc<dyn Transport>) {
        *self
            .inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    /// Register `spec` and hand back its callable stub. Redefining a name
    /// replaces the previous registration, handler included.
    pub fn define(&self, spec: Spec) -> Stub {
        let Spec {
            name,
            description,
            schema,
        } = spec;
        debug!(module = %self.name(), rpc = %name, "defining rpc");
        self.inner.hosts.insert(
            name.clone(),
            Host {
                name: name.clone(),
                description,
                schema,
                handler: None,
            },
        );
        Stub {
            name,
            module: self.clone(),
        }
    }

    /// Bind an implementation to a stub previously returned by [`define`](Self::define).
    pub fn construct<RFn>(&self, stub: &Stub, handler: RFn) -> RpcResult<()>
    where
        RFn: RpcFunction + 'static,
    {
        if !Arc::ptr_eq(&stub.module.inner, &self.inner) {
            return Err(RpcError::InvalidStub {
                name: stub.name.clone(),
            });
        }
        let mut host = self
            .inner
            .hosts
            .get_mut(&stub.name)
            .ok_or_else(|| RpcError::NotFound {
                name: stub.name.clone(),
            })?;
        host.handler = Some(Arc::new(handler));
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<Host> {
        self.inner.hosts.get(name).map(|host| host.clone())
    }

    pub fn hosts(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self
            .inner
            .hosts
            .iter()
            .map(|host| HostInfo {
                name: host.name.clone(),
                description: host.description.clone(),
                implemented: host.has_handler(),
            })
            .collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    /// Run the bound handler for `request`. Used by the serving side.
    pub async fn resolve(&self, request: Request) -> RpcResult {
        let handler = self.handler(&request.name)?;
        Ok(handler.call(request.args).await?)
    }

    fn handler(&self, name: &str) -> RpcResult<Arc<dyn RpcFunction>> {
        let host = self.inner.hosts.get(name).ok_or_else(|| RpcError::NotFound {
            name: name.to_owned(),
        })?;
        let handler = host.handler.clone();
        handler.ok_or_else(|| RpcError::NoHandler {
            name: name.to_owned(),
        })
    }

    /// Call by name: locally when a handler is bound here, remotely otherwise.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> RpcResult {
        let local = self.inner.hosts.get(name).and_then(|host| host.handler.clone());
        match local {
            Some(handler) => Ok(handler.call(args).await?),
            None => {
                self.remote_call(Payload {
                    name: name.to_owned(),
                    args,
                })
                .await
            }
        }
    }

    async fn remote_call(&self, payload: Payload) -> RpcResult {
        let (call, settled) = Call::new(payload);

        if self.transport().is_none() {
            call.reject(RpcError::TransportNotFound);
        } else {
            let module = self.clone();
            self.inner
                .batcher
                .batch(Arc::clone(&call), move |calls| async move {
                    module.submit(calls).await
                });
        }

        let outcome = match self.timeout() {
            None => settled.await,
            Some(limit) => {
                let mut settled = settled;
                tokio::select! {
                    outcome = &mut settled => outcome,
                    _ = tokio::time::sleep(limit) => {
                        if call.reject(RpcError::Timeout(limit)) {
                            debug!(id = %call.id(), rpc = %call.name(), "call timed out");
                        }
                        settled.await
                    }
                }
            }
        };
        // `call` keeps the sender alive until here, so the channel cannot close unsettled.
        outcome.unwrap_or_else(|_| {
            Err(RpcError::TransportFailure(
                "call dropped before settling".into(),
            ))
        })
    }

    /// Hand one flushed batch to the transport. A failed send fails every call in it.
    async fn submit(&self, calls: Vec<Arc<Call>>) {
        let Some(transport) = self.transport() else {
            for call in &calls {
                call.reject(RpcError::TransportNotFound);
            }
            return;
        };
        debug!(module = %self.name(), size = calls.len(), "submitting batch");
        if let Err(error) = transport.send(self, calls.clone()).await {
            warn!(module = %self.name(), %error, "transport failed, rejecting batch");
            for call in &calls {
                call.reject(error.clone());
            }
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new(ModuleConfig::default())
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("hosts", &self.inner.hosts.len())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// Callable handle for one defined RPC.
#[derive(Clone, Debug)]
pub struct Stub {
    name: String,
    module: Module,
}

impl Stub {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub async fn call(&self, args: Vec<Value>) -> RpcResult {
        self.module.call(&self.name, args).await
    }

    /// Typed call. `args` is encoded as the argument list: a tuple or
    /// sequence becomes positional arguments, `()` means none, any other
    /// value is passed as the only argument.
    ///
    /// A lone sequence is spread too, and a lone `None` is dropped, so
    /// `invoke(vec![1, 2])` sends two arguments. Wrap it in a 1-tuple,
    /// `invoke((vec![1, 2],))`, to send it as a single array argument.
    pub async fn invoke<A, R>(&self, args: A) -> RpcResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let retval = self.call(args).await?;
        Ok(serde_json::from_value(retval)?)
    }
}
