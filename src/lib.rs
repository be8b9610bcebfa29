//! Call named remote operations like local async functions.
//!
//! A [`Module`] holds the RPC declarations. Stubs returned by
//! [`Module::define`] run a bound handler directly, or queue a [`Call`] that
//! is flushed with its neighbours as one batch through the installed
//! [`Transport`]. [`HttpTransport`] is the reference transport: JSON batches
//! out, newline-delimited results streamed back as each one completes.

#[macro_use]
mod macros;

pub mod batch;
pub mod call;
pub mod context;
pub mod error;
pub mod module;
pub mod net;
pub mod transport;
pub mod types;

pub use batch::Batcher;
pub use call::{Call, Payload};
pub use context::Context;
pub use error::{HandlerError, RpcError, RpcResult};
pub use module::{typed, Host, HostInfo, Module, ModuleConfig, RpcFunction, Spec, Stub};
pub use net::{
    client::{HttpClient, HttpReply, LoopbackClient, ReqwestClient},
    server::Middleware,
    HttpTransport, HttpTransportConfig, Request, Response,
};
pub use transport::Transport;
pub use types::{Schema, Type, TypeMismatch, Typed, Validator};

pub use futures::future::BoxFuture;
