//! Method registry and typed handler adapters.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hubwire_core::{EncodedBody, MessageSerializer, MethodTable, MethodTableError, method_id};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::HubError;
use crate::rpc::context::HubCallContext;

/// What a handler produced.
#[derive(Debug)]
pub enum HandlerOutput {
    /// A serialized response value.
    Value(EncodedBody),
    /// The method returns nothing; an empty response is written.
    Void,
}

/// Trait implemented by every hub method handler.
#[async_trait]
pub trait MethodHandler<S: MessageSerializer>: Send + Sync + 'static {
    /// Execute the handler with the raw request payload.
    async fn call(&self, ctx: HubCallContext<S>, payload: Bytes) -> Result<HandlerOutput, HubError>;
}

/// A handler resolved into the method table.
pub struct RegisteredMethod<S: MessageSerializer> {
    /// Method name, used in logs and error details.
    pub name: Arc<str>,
    /// Wire id.
    pub id: i32,
    /// The handler.
    pub handler: Arc<dyn MethodHandler<S>>,
}

impl<S: MessageSerializer> std::fmt::Debug for RegisteredMethod<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Collects handlers before the method table is built.
pub struct MethodRegistry<S: MessageSerializer> {
    entries: Vec<(String, i32, Arc<dyn MethodHandler<S>>)>,
}

impl<S: MessageSerializer> MethodRegistry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register a handler under the FNV-1a id of `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl MethodHandler<S>) -> &mut Self {
        let name = name.into();
        let id = method_id(&name);
        self.register_with_id(name, id, handler)
    }

    /// Register a handler under an explicit wire id.
    pub fn register_with_id(&mut self, name: impl Into<String>, id: i32, handler: impl MethodHandler<S>) -> &mut Self {
        self.entries.push((name.into(), id, Arc::new(handler)));
        self
    }

    /// Registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|(name, _, _)| name.clone()).collect();
        names.sort();
        names
    }

    /// Check whether a method name is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _, _)| n == name)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the immutable dispatch table.
    ///
    /// Two methods sharing an id fail with both names in the error.
    pub fn build(self) -> Result<MethodTable<RegisteredMethod<S>>, MethodTableError> {
        let mut seen: HashMap<i32, String> = HashMap::with_capacity(self.entries.len());
        for (name, id, _) in &self.entries {
            if let Some(first) = seen.insert(*id, name.clone()) {
                return Err(MethodTableError::DuplicateMethodName {
                    method_id: *id,
                    first,
                    second: name.clone(),
                });
            }
        }
        MethodTable::build(self.entries.into_iter().map(|(name, id, handler)| {
            (
                id,
                RegisteredMethod {
                    name: Arc::from(name),
                    id,
                    handler,
                },
            )
        }))
    }
}

impl<S: MessageSerializer> Default for MethodRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

// ── typed adapters ──────────────────────────────────────────────────

/// Handler built from an async function taking a decoded request.
pub struct FnHandler<S, F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(S, Req) -> Resp>,
}

/// Handler built from an async function that returns nothing.
pub struct VoidFnHandler<S, F, Req> {
    f: F,
    _types: PhantomData<fn(S, Req)>,
}

/// Adapt `async fn(ctx, Req) -> Result<Resp, HubError>` into a [`MethodHandler`].
///
/// Methods with several parameters take a tuple as `Req`.
pub fn handler_fn<S, F, Fut, Req, Resp>(f: F) -> FnHandler<S, F, Req, Resp>
where
    S: MessageSerializer,
    F: Fn(HubCallContext<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HubError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    FnHandler { f, _types: PhantomData }
}

/// Adapt `async fn(ctx, Req) -> Result<(), HubError>` into a [`MethodHandler`]
/// that writes a void response.
pub fn void_handler_fn<S, F, Fut, Req>(f: F) -> VoidFnHandler<S, F, Req>
where
    S: MessageSerializer,
    F: Fn(HubCallContext<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HubError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
{
    VoidFnHandler { f, _types: PhantomData }
}

#[async_trait]
impl<S, F, Fut, Req, Resp> MethodHandler<S> for FnHandler<S, F, Req, Resp>
where
    S: MessageSerializer,
    F: Fn(HubCallContext<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HubError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn call(&self, ctx: HubCallContext<S>, payload: Bytes) -> Result<HandlerOutput, HubError> {
        let request: Req = ctx.codec().decode(&payload)?;
        let response = (self.f)(ctx.clone(), request).await?;
        Ok(HandlerOutput::Value(ctx.codec().encode_body(&response)?))
    }
}

#[async_trait]
impl<S, F, Fut, Req> MethodHandler<S> for VoidFnHandler<S, F, Req>
where
    S: MessageSerializer,
    F: Fn(HubCallContext<S>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HubError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
{
    async fn call(&self, ctx: HubCallContext<S>, payload: Bytes) -> Result<HandlerOutput, HubError> {
        let request: Req = ctx.codec().decode(&payload)?;
        (self.f)(ctx, request).await?;
        Ok(HandlerOutput::Void)
    }
}
