//! Call Endpoint, service side.
//!
//! A [`Service`] owns the handler tables for one namespace. Handlers receive a
//! [`CallEnv`] built by the service's ordered context consumers, whether the
//! call arrived over a connection or through [`Service::call_local`].

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::rpc::context::{
    CallContext, CallEnv, ContextConsumer, RequestLoggerConsumer, SubLevelConsumer,
};
use crate::stream::Payload;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, Instrument};

/// Handler returning its result directly.
pub type SyncHandler = Arc<dyn Fn(&CallEnv, Vec<Payload>) -> Result<Payload> + Send + Sync>;

/// Handler completing later.
pub type AsyncHandler =
    Arc<dyn Fn(CallEnv, Vec<Payload>) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

/// Calls and version a service advertises on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub api: Vec<String>,
    pub version: String,
}

impl Manifest {
    /// Check whether `call` is advertised.
    pub fn contains(&self, call: &str) -> bool {
        self.api.iter().any(|name| name == call)
    }
}

/// Wrap a closure as a [`SyncHandler`].
pub fn sync_handler<F>(f: F) -> SyncHandler
where
    F: Fn(&CallEnv, Vec<Payload>) -> Result<Payload> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as an [`AsyncHandler`].
pub fn async_handler<F, Fut>(f: F) -> AsyncHandler
where
    F: Fn(CallEnv, Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move |env, args| f(env, args).boxed())
}

/// Handler tables served under one namespace.
pub struct Service {
    namespace: String,
    api_version: String,
    sync_api: HashMap<String, SyncHandler>,
    async_api: HashMap<String, AsyncHandler>,
    consumers: Vec<Arc<dyn ContextConsumer>>,
}

impl Service {
    /// New service with the default consumers: request logger, then sub-level.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            api_version: RpcConfig::API_VERSION.to_string(),
            sync_api: HashMap::new(),
            async_api: HashMap::new(),
            consumers: vec![Arc::new(RequestLoggerConsumer), Arc::new(SubLevelConsumer)],
        }
    }

    /// Set the version reported by the manifest.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Append a consumer; consumers run in the order they were added.
    pub fn with_consumer(mut self, consumer: impl ContextConsumer + 'static) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    /// Replace the consumer list.
    pub fn with_consumers(mut self, consumers: Vec<Arc<dyn ContextConsumer>>) -> Self {
        self.consumers = consumers;
        self
    }

    /// Get the namespace this service is bound under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the advertised API version.
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Merge-install sync handlers. A name already present is replaced.
    pub fn register_sync_api<K, I>(&mut self, table: I) -> &mut Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, SyncHandler)>,
    {
        self.sync_api
            .extend(table.into_iter().map(|(name, handler)| (name.into(), handler)));
        self
    }

    /// Merge-install async handlers. A name already present is replaced.
    pub fn register_async_api<K, I>(&mut self, table: I) -> &mut Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AsyncHandler)>,
    {
        self.async_api
            .extend(table.into_iter().map(|(name, handler)| (name.into(), handler)));
        self
    }

    pub fn register_sync<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&CallEnv, Vec<Payload>) -> Result<Payload> + Send + Sync + 'static,
    {
        self.sync_api.insert(name.into(), sync_handler(f));
        self
    }

    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CallEnv, Vec<Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.async_api.insert(name.into(), async_handler(f));
        self
    }

    /// Every registered call name, sorted, excluding the manifest call.
    pub fn manifest(&self) -> Manifest {
        let mut api: Vec<String> = self
            .async_api
            .keys()
            .chain(self.sync_api.keys())
            .filter(|name| name.as_str() != RpcConfig::MANIFEST_CALL)
            .cloned()
            .collect();
        api.sort();
        api.dedup();
        Manifest {
            api,
            version: self.api_version.clone(),
        }
    }

    /// Build the handler environment by running every consumer in order.
    pub fn build_env(&self, call: &str, context: CallContext) -> CallEnv {
        let mut env = CallEnv::new(&self.namespace, call, context.clone());
        for consumer in &self.consumers {
            consumer.consume(&context, &mut env);
        }
        env
    }

    fn unknown_call(&self, call: &str) -> RpcError {
        RpcError::UnknownCall {
            namespace: self.namespace.clone(),
            call: call.to_string(),
        }
    }

    /// Run a sync handler. A panicking handler becomes a handler error.
    pub fn on_sync_call(
        &self,
        call: &str,
        args: Vec<Payload>,
        context: CallContext,
    ) -> Result<Payload> {
        let handler = self
            .sync_api
            .get(call)
            .ok_or_else(|| self.unknown_call(call))?;
        let env = self.build_env(call, context);
        let _entered = env.logger.enter();
        std::panic::catch_unwind(AssertUnwindSafe(|| handler(&env, args)))
            .unwrap_or_else(|_| Err(RpcError::handler_panicked(call)))
    }

    /// Run an async handler inside its request span.
    pub async fn on_async_call(
        &self,
        call: &str,
        args: Vec<Payload>,
        context: CallContext,
    ) -> Result<Payload> {
        let handler = self
            .async_api
            .get(call)
            .ok_or_else(|| self.unknown_call(call))?
            .clone();
        let env = self.build_env(call, context);
        let span = env.logger.clone();
        AssertUnwindSafe(handler(env, args))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|_| Err(RpcError::handler_panicked(call)))
    }

    /// Route a call: manifest, then async table, then sync table.
    pub async fn dispatch(
        &self,
        call: &str,
        args: Vec<Payload>,
        context: CallContext,
    ) -> Result<Payload> {
        if call == RpcConfig::MANIFEST_CALL {
            return Payload::json(&self.manifest());
        }
        let result = if self.async_api.contains_key(call) {
            self.on_async_call(call, args, context).await
        } else if self.sync_api.contains_key(call) {
            self.on_sync_call(call, args, context)
        } else {
            Err(self.unknown_call(call))
        };
        if let Err(err) = &result {
            debug!("{}.{} failed: {}", self.namespace, call, err);
        }
        result
    }

    /// Invoke a handler in-process, with the same environment construction
    /// as a remote call.
    pub async fn call_local(&self, call: &str, args: Vec<Payload>) -> Result<Payload> {
        self.dispatch(call, args, CallContext::new()).await
    }
}
