//! Ambient per-call context.
//!
//! A caller builds a [`CallContext`] by running its producers in list order,
//! then merging the one-shot request context on top. The service turns the
//! received context into a [`CallEnv`] by running its consumers in list order.
//! Later steps overwrite keys set by earlier ones.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Span;

/// Metadata that travels with a call outside its argument list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Request correlation id used by the request logger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_uids: Option<String>,
    /// Path of a sub-namespace inside a hierarchical backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_level: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_req_uids(mut self, uids: impl Into<String>) -> Self {
        self.req_uids = Some(uids.into());
        self
    }

    pub fn with_sub_level<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_level = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Merge `other` on top of `self`; keys present in `other` win.
    pub fn merge(&mut self, other: CallContext) {
        if other.req_uids.is_some() {
            self.req_uids = other.req_uids;
        }
        if !other.sub_level.is_empty() {
            self.sub_level = other.sub_level;
        }
        self.extra.extend(other.extra);
    }
}

/// Adds ambient metadata to outgoing calls.
pub trait ContextProducer: Send + Sync {
    fn produce(&self, ctx: &mut CallContext);
}

/// Tags every call with a fresh request id unless one is already set.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestUidsProducer;

impl ContextProducer for RequestUidsProducer {
    fn produce(&self, ctx: &mut CallContext) {
        if ctx.req_uids.is_none() {
            ctx.req_uids = Some(uuid::Uuid::new_v4().simple().to_string());
        }
    }
}

/// Merges a fixed context into every call.
#[derive(Debug, Clone)]
pub struct StaticContextProducer(pub CallContext);

impl ContextProducer for StaticContextProducer {
    fn produce(&self, ctx: &mut CallContext) {
        ctx.merge(self.0.clone());
    }
}

/// Environment a handler runs in.
#[derive(Debug, Clone)]
pub struct CallEnv {
    pub namespace: String,
    pub call: String,
    pub context: CallContext,
    /// Request id, taken from the context or generated.
    pub req_uids: String,
    /// Request-scoped logger.
    pub logger: Span,
    /// Resolved sub-namespace for hierarchical backends.
    pub sub_level: Option<Vec<String>>,
}

impl CallEnv {
    pub fn new(namespace: impl Into<String>, call: impl Into<String>, context: CallContext) -> Self {
        Self {
            namespace: namespace.into(),
            call: call.into(),
            req_uids: context.req_uids.clone().unwrap_or_default(),
            context,
            logger: Span::none(),
            sub_level: None,
        }
    }
}

/// Interprets received context into the handler environment.
pub trait ContextConsumer: Send + Sync {
    fn consume(&self, ctx: &CallContext, env: &mut CallEnv);
}

/// Builds the request-scoped logger.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLoggerConsumer;

impl ContextConsumer for RequestLoggerConsumer {
    fn consume(&self, ctx: &CallContext, env: &mut CallEnv) {
        env.req_uids = ctx
            .req_uids
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        env.logger = tracing::info_span!(
            "rpc_call",
            namespace = %env.namespace,
            call = %env.call,
            req_uids = %env.req_uids,
        );
    }
}

/// Resolves the sub-namespace path carried in the context.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubLevelConsumer;

impl ContextConsumer for SubLevelConsumer {
    fn consume(&self, ctx: &CallContext, env: &mut CallEnv) {
        if !ctx.sub_level.is_empty() {
            env.sub_level = Some(ctx.sub_level.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_later_keys_win() {
        let mut ctx = CallContext::new()
            .with_req_uids("first")
            .with_value("owner", json!("alice"));
        ctx.merge(
            CallContext::new()
                .with_req_uids("second")
                .with_value("owner", json!("bob")),
        );
        assert_eq!(ctx.req_uids.as_deref(), Some("second"));
        assert_eq!(ctx.extra["owner"], json!("bob"));
    }

    #[test]
    fn test_merge_keeps_keys_absent_from_other() {
        let mut ctx = CallContext::new().with_sub_level(["users", "meta"]);
        ctx.merge(CallContext::new().with_value("x", json!(1)));
        assert_eq!(ctx.sub_level, vec!["users", "meta"]);
        assert_eq!(ctx.extra["x"], json!(1));
    }

    #[test]
    fn test_request_uids_producer_does_not_overwrite() {
        let mut ctx = CallContext::new().with_req_uids("fixed");
        RequestUidsProducer.produce(&mut ctx);
        assert_eq!(ctx.req_uids.as_deref(), Some("fixed"));

        let mut empty = CallContext::new();
        RequestUidsProducer.produce(&mut empty);
        assert!(empty.req_uids.is_some());
    }

    #[test]
    fn test_consumers_fill_environment() {
        let ctx = CallContext::new()
            .with_req_uids("abc")
            .with_sub_level(["bucket"]);
        let mut env = CallEnv::new("metadata", "get", ctx.clone());
        RequestLoggerConsumer.consume(&ctx, &mut env);
        SubLevelConsumer.consume(&ctx, &mut env);
        assert_eq!(env.req_uids, "abc");
        assert_eq!(env.sub_level, Some(vec!["bucket".to_string()]));
    }

    #[test]
    fn test_context_wire_shape() {
        let ctx = CallContext::new()
            .with_req_uids("r1")
            .with_value("tenant", json!("t"));
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, json!({"reqUids": "r1", "tenant": "t"}));
    }
}
