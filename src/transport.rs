use crate::{call::Call, error::RpcResult, module::Module};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Carries flushed batches of calls to wherever their handlers live.
///
/// `send` settles calls individually as results arrive. Returning `Err`
/// fails the whole batch: the module rejects every call that is still
/// pending with that error.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, module: &'a Module, calls: Vec<Arc<Call>>)
        -> BoxFuture<'a, RpcResult<()>>;
}
