use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use tether_ledger::LedgerConfig;
use tether_types::RunLimits;

const ENV_PREFIX: &str = "TETHER_";
const WEBHOOK_SECRET_PREFIX: &str = "TETHER_WEBHOOK_SECRET_";

/// Environment-driven runtime configuration. Every field has a usable
/// default so a bare process comes up; deployments override via `TETHER_*`
/// variables or the builder methods.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub state_root: PathBuf,
    pub environment: String,
    pub default_actor: String,
    pub policy_dir: Option<PathBuf>,
    pub approval_secret: String,
    pub approval_token_ttl_seconds: u64,
    pub idempotency_namespace: String,
    pub idempotency_prefix: String,
    pub idempotency_default_ttl_seconds: u64,
    pub idempotency_min_ttl_seconds: u64,
    pub idempotency_max_ttl_seconds: u64,
    pub fingerprinting_enabled: bool,
    pub auto_save_interval_ms: u64,
    pub run_retention_hours: i64,
    pub policy_checks_enabled: bool,
    pub default_limits: RunLimits,
    pub webhook_secrets: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(".tether/state"),
            environment: "default".to_string(),
            default_actor: "system".to_string(),
            policy_dir: None,
            approval_secret: "insecure-dev-secret".to_string(),
            approval_token_ttl_seconds: 900,
            idempotency_namespace: "default".to_string(),
            idempotency_prefix: "idem".to_string(),
            idempotency_default_ttl_seconds: 24 * 60 * 60,
            idempotency_min_ttl_seconds: 60,
            idempotency_max_ttl_seconds: 7 * 24 * 60 * 60,
            fingerprinting_enabled: true,
            auto_save_interval_ms: 30_000,
            run_retention_hours: 24,
            policy_checks_enabled: true,
            default_limits: RunLimits::default(),
            webhook_secrets: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(root) = read_var("STATE_ROOT") {
            config.state_root = PathBuf::from(root);
        }
        if let Some(environment) = read_var("ENVIRONMENT") {
            config.environment = environment;
        }
        if let Some(actor) = read_var("ACTOR") {
            config.default_actor = actor;
        }
        if let Some(dir) = read_var("POLICY_DIR") {
            config.policy_dir = Some(PathBuf::from(dir));
        }
        if let Some(secret) = read_var("APPROVAL_SECRET") {
            config.approval_secret = secret;
        }
        if let Some(ttl) = read_parsed("APPROVAL_TOKEN_TTL_SECONDS") {
            config.approval_token_ttl_seconds = ttl;
        }
        if let Some(namespace) = read_var("IDEMPOTENCY_NAMESPACE") {
            config.idempotency_namespace = namespace;
        }
        if let Some(prefix) = read_var("IDEMPOTENCY_PREFIX") {
            config.idempotency_prefix = prefix;
        }
        if let Some(ttl) = read_parsed("IDEMPOTENCY_TTL_SECONDS") {
            config.idempotency_default_ttl_seconds = ttl;
        }
        if let Some(ttl) = read_parsed("IDEMPOTENCY_MIN_TTL_SECONDS") {
            config.idempotency_min_ttl_seconds = ttl;
        }
        if let Some(ttl) = read_parsed("IDEMPOTENCY_MAX_TTL_SECONDS") {
            config.idempotency_max_ttl_seconds = ttl;
        }
        if let Some(enabled) = read_parsed::<bool>("FINGERPRINTING") {
            config.fingerprinting_enabled = enabled;
        }
        if let Some(interval) = read_parsed("AUTOSAVE_MS") {
            config.auto_save_interval_ms = interval;
        }
        if let Some(hours) = read_parsed("RUN_RETENTION_HOURS") {
            config.run_retention_hours = hours;
        }
        if let Some(enabled) = read_parsed::<bool>("POLICY_CHECKS") {
            config.policy_checks_enabled = enabled;
        }
        if let Some(cost) = read_parsed("MAX_COST_USD") {
            config.default_limits.max_cost_usd = Some(cost);
        }
        if let Some(tokens) = read_parsed("MAX_TOKENS") {
            config.default_limits.max_tokens = Some(tokens);
        }
        if let Some(calls) = read_parsed("MAX_TOOL_CALLS") {
            config.default_limits.max_tool_calls = Some(calls);
        }

        for (key, value) in env::vars() {
            if let Some(provider) = key.strip_prefix(WEBHOOK_SECRET_PREFIX) {
                config
                    .webhook_secrets
                    .insert(provider.to_lowercase(), value);
            }
        }

        config
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            namespace: self.idempotency_namespace.clone(),
            prefix: self.idempotency_prefix.clone(),
            default_ttl_seconds: self.idempotency_default_ttl_seconds,
            min_ttl_seconds: self.idempotency_min_ttl_seconds,
            max_ttl_seconds: self.idempotency_max_ttl_seconds,
            fingerprinting: self.fingerprinting_enabled,
            ..LedgerConfig::default()
        }
    }
}

fn read_var(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn read_parsed<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    read_var(suffix).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_env() {
        let config = RuntimeConfig::default();
        assert_eq!(config.environment, "default");
        assert!(config.fingerprinting_enabled);
        let ledger = config.ledger_config();
        assert_eq!(ledger.namespace, "default");
        assert_eq!(ledger.min_ttl_seconds, 60);
    }
}
