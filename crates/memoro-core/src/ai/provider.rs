// AI provider golden trait and the JSON-RPC backed implementation.
// The router holds a polymorphic provider list; adding a backend with a
// unique wire shape means implementing the trait, nothing else changes.

use crate::config::{BreakerConfig, RetryConfig};
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::rpc::RpcTransport;
use crate::types::{
    AiOperation, AiRequest, AiResponse, ProviderConfig, ProviderKind, ProviderStatus,
    RateLimitConfig,
};
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::time::{Duration, Instant};

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    /// Default model when the request carries no hint.
    fn model(&self) -> &str;
    /// Lower = preferred.
    fn priority(&self) -> i32;
    fn supports(&self, operation: AiOperation) -> bool;
    fn rate_limit(&self) -> &RateLimitConfig;
    /// Invoke the provider with a concrete model. Transport-level retry and
    /// circuit breaking happen below this call.
    async fn invoke(&self, request: &AiRequest, model: &str, ctx: &Ctx) -> Result<AiResponse>;
    /// Light liveness probe feeding the provider status machine.
    async fn probe(&self, ctx: &Ctx) -> ProviderStatus;
}

/// Provider backend speaking JSON-RPC through the resilient transport. All
/// configured provider kinds ride this implementation; the kind only selects
/// credentials and reporting labels.
pub struct RpcProvider {
    config: ProviderConfig,
    transport: RpcTransport,
}

impl RpcProvider {
    pub fn new(config: ProviderConfig, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        let transport = RpcTransport::new(config.endpoint.clone(), retry, breaker);
        RpcProvider { config, transport }
    }

    /// Resolve the credential named by `auth_ref` from the environment.
    /// The value is passed on the wire and never stored.
    fn credential(&self) -> Option<String> {
        self.config
            .auth_ref
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl AiProvider for RpcProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    fn supports(&self, operation: AiOperation) -> bool {
        self.config.supported_operations.contains(&operation)
    }

    fn rate_limit(&self) -> &RateLimitConfig {
        &self.config.rate_limit
    }

    async fn invoke(&self, request: &AiRequest, model: &str, ctx: &Ctx) -> Result<AiResponse> {
        let started = Instant::now();
        let params = json!({
            "operation": request.operation.as_str(),
            "content": request.content,
            "repository": request.repository,
            "project_type": request.project_type,
            "preferences": request.preferences,
            "model": model,
            "auth": self.credential(),
        });
        let result = self.transport.call("ai_generate", params, ctx).await?;

        let content = result["content"]
            .as_str()
            .ok_or_else(|| Error::Protocol {
                code: 1001,
                message: format!("provider '{}' returned no content", self.config.id),
            })?
            .to_string();
        let response = AiResponse {
            id: result["id"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content,
            model_used: result["model_used"].as_str().unwrap_or(model).to_string(),
            tokens_in: result["tokens_in"].as_u64().unwrap_or(0),
            tokens_out: result["tokens_out"].as_u64().unwrap_or(0),
            latency_ms: started.elapsed().as_millis() as u64,
            cache_hit: false,
        };
        debug!(
            "[ai] {} completed {} in {}ms ({} in / {} out tokens)",
            self.config.id,
            request.operation.as_str(),
            response.latency_ms,
            response.tokens_in,
            response.tokens_out
        );
        Ok(response)
    }

    async fn probe(&self, ctx: &Ctx) -> ProviderStatus {
        let probe_ctx = ctx.child_timeout(Duration::from_secs(5));
        match self.transport.health(&probe_ctx).await {
            Ok(()) => ProviderStatus::Healthy,
            Err(Error::Protocol { .. }) => ProviderStatus::Degraded,
            Err(_) => ProviderStatus::Unhealthy,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            id: "p1".into(),
            kind: ProviderKind::Anthropic,
            endpoint: "http://127.0.0.1:1/rpc".into(),
            auth_ref: None,
            supported_operations: vec![AiOperation::Analyze, AiOperation::Complexity],
            priority: 1,
            rate_limit: RateLimitConfig { rpm: 60, burst: 0 },
            model: "default-model".into(),
        }
    }

    #[test]
    fn capability_declaration_is_honored() {
        let provider = RpcProvider::new(config(), RetryConfig::default(), Default::default());
        assert!(provider.supports(AiOperation::Analyze));
        assert!(!provider.supports(AiOperation::PrdGenerate));
        assert_eq!(provider.priority(), 1);
        assert_eq!(provider.model(), "default-model");
    }

    #[tokio::test]
    async fn unreachable_provider_probes_unhealthy() {
        let provider = RpcProvider::new(
            config(),
            RetryConfig { max_attempts: 1, base_delay_ms: 1, max_delay_ms: 2, multiplier: 2 },
            Default::default(),
        );
        let status = provider.probe(&Ctx::with_timeout(Duration::from_secs(2))).await;
        assert_eq!(status, ProviderStatus::Unhealthy);
    }
}
