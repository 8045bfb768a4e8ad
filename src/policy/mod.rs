//! # Policy Chain Module
//!
//! The invocation contract policies satisfy around the upstream call. No
//! concrete policies live here; deployments register their own.
//!
//! Request-phase policies run in contract order and may rewrite the
//! [`ServiceRequest`]. Response-phase policies run in reverse order over the
//! [`ServiceResponse`] head. Either phase may stop the call with a
//! [`PolicyFailure`].

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Policy, PolicyFailure, ServiceRequest, ServiceResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a single policy in one phase
pub type PolicyOutcome = Result<(), PolicyFailure>;

/// Per-request scratch state handed from policy to policy
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub request_id: String,
    attributes: HashMap<String, Value>,
}

impl PolicyContext {
    pub fn new<S: Into<String>>(request_id: S) -> Self {
        Self {
            request_id: request_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute<S: Into<String>>(&mut self, name: S, value: Value) {
        self.attributes.insert(name.into(), value);
    }
}

/// A policy implementation
///
/// `config` is the contract's `Policy` entry, carrying the raw JSON
/// configuration for this use of the policy.
#[async_trait]
pub trait GatewayPolicy: Send + Sync + fmt::Debug {
    /// Name matched against `Policy::policy_impl`
    fn name(&self) -> &str;

    async fn apply_request(
        &self,
        _request: &mut ServiceRequest,
        _context: &mut PolicyContext,
        _config: &Policy,
    ) -> PolicyOutcome {
        Ok(())
    }

    async fn apply_response(
        &self,
        _response: &mut ServiceResponse,
        _context: &mut PolicyContext,
        _config: &Policy,
    ) -> PolicyOutcome {
        Ok(())
    }
}

/// Policy implementations by name
#[derive(Debug, Default, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn GatewayPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: Arc<dyn GatewayPolicy>) {
        debug!(policy = policy.name(), "Policy registered");
        self.policies.insert(policy.name().to_string(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GatewayPolicy>> {
        self.policies.get(name).cloned()
    }

    /// Resolve a contract's policy list into a chain
    pub fn chain_for(&self, policies: &[Policy]) -> GatewayResult<PolicyChain> {
        let entries = policies
            .iter()
            .map(|config| {
                self.get(&config.policy_impl)
                    .map(|policy| (policy, config.clone()))
                    .ok_or_else(|| GatewayError::config(format!("Unknown policy implementation: {}", config.policy_impl)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(PolicyChain { entries })
    }
}

/// Ordered policies for one call
#[derive(Debug, Default)]
pub struct PolicyChain {
    entries: Vec<(Arc<dyn GatewayPolicy>, Policy)>,
}

impl PolicyChain {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the request phase in order, stopping at the first failure
    pub async fn apply_request(&self, request: &mut ServiceRequest, context: &mut PolicyContext) -> PolicyOutcome {
        for (policy, config) in &self.entries {
            if let Err(failure) = policy.apply_request(request, context, config).await {
                debug!(policy = policy.name(), code = failure.failure_code, "Request policy failed");
                return Err(failure);
            }
        }
        Ok(())
    }

    /// Run the response phase in reverse order, stopping at the first failure
    pub async fn apply_response(&self, response: &mut ServiceResponse, context: &mut PolicyContext) -> PolicyOutcome {
        for (policy, config) in self.entries.iter().rev() {
            if let Err(failure) = policy.apply_response(response, context, config).await {
                debug!(policy = policy.name(), code = failure.failure_code, "Response policy failed");
                return Err(failure);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PolicyFailureType;
    use serde_json::json;

    #[derive(Debug)]
    struct Trace(&'static str);

    #[async_trait]
    impl GatewayPolicy for Trace {
        fn name(&self) -> &str {
            self.0
        }

        async fn apply_request(
            &self,
            _request: &mut ServiceRequest,
            context: &mut PolicyContext,
            _config: &Policy,
        ) -> PolicyOutcome {
            push(context, self.0);
            Ok(())
        }

        async fn apply_response(
            &self,
            _response: &mut ServiceResponse,
            context: &mut PolicyContext,
            _config: &Policy,
        ) -> PolicyOutcome {
            push(context, self.0);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Deny;

    #[async_trait]
    impl GatewayPolicy for Deny {
        fn name(&self) -> &str {
            "deny"
        }

        async fn apply_request(
            &self,
            _request: &mut ServiceRequest,
            _context: &mut PolicyContext,
            config: &Policy,
        ) -> PolicyOutcome {
            Err(PolicyFailure::new(
                PolicyFailureType::Authorization,
                42,
                config.policy_json_config.clone(),
            ))
        }
    }

    fn push(context: &mut PolicyContext, name: &str) {
        let mut seen = context
            .attribute("seen")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        seen.push(json!(name));
        context.set_attribute("seen", Value::Array(seen));
    }

    fn registry() -> PolicyRegistry {
        let mut registry = PolicyRegistry::new();
        registry.register(Arc::new(Trace("a")));
        registry.register(Arc::new(Trace("b")));
        registry.register(Arc::new(Deny));
        registry
    }

    #[tokio::test]
    async fn test_request_in_order_response_in_reverse() {
        let chain = registry()
            .chain_for(&[Policy::new("a", ""), Policy::new("b", "")])
            .unwrap();
        let mut context = PolicyContext::new("req-1");
        let mut request = ServiceRequest::new("T", "echo", "1.0");
        chain.apply_request(&mut request, &mut context).await.unwrap();
        let mut response = ServiceResponse::default();
        chain.apply_response(&mut response, &mut context).await.unwrap();

        assert_eq!(context.attribute("seen").unwrap(), &json!(["a", "b", "b", "a"]));
    }

    #[tokio::test]
    async fn test_failure_stops_chain() {
        let chain = registry()
            .chain_for(&[Policy::new("deny", "nope"), Policy::new("a", "")])
            .unwrap();
        let mut context = PolicyContext::new("req-2");
        let mut request = ServiceRequest::new("T", "echo", "1.0");
        let failure = chain.apply_request(&mut request, &mut context).await.unwrap_err();
        assert_eq!(failure.failure_code, 42);
        assert_eq!(failure.message, "nope");
        assert!(context.attribute("seen").is_none());
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let result = registry().chain_for(&[Policy::new("missing", "")]);
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }
}
