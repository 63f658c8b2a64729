use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use tether_types::{CoreError, CoreResult, RuntimeEvent, Zone};

use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Used,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub operation: String,
    pub resource: String,
    pub zone: Zone,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

/// Short-lived single-use credential bound to one (operation, resource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token: String,
    pub request_id: String,
    pub operation: String,
    pub resource: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub single_use: bool,
    pub used: bool,
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub auto_approve_green: bool,
    pub token_ttl_seconds: i64,
    pub request_ttl_seconds: i64,
    pub single_use: bool,
    pub secret: String,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve_green: true,
            token_ttl_seconds: 900,
            request_ttl_seconds: 3_600,
            single_use: true,
            secret: "insecure-dev-secret".to_string(),
        }
    }
}

/// Issues and validates approval tokens gating side effects. Green-zone
/// requests may auto-approve; yellow and red wait on a reviewer.
pub struct ApprovalManager {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    tokens: RwLock<HashMap<String, ApprovalToken>>,
    config: ApprovalConfig,
    events: EventBus,
}

impl ApprovalManager {
    pub fn new(config: ApprovalConfig, events: EventBus) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    /// Create a request. A green-zone request under auto-approval comes back
    /// approved with its token issued in the same transition.
    pub async fn request(
        &self,
        operation: impl Into<String>,
        resource: impl Into<String>,
        zone: Zone,
        requester: impl Into<String>,
        justification: Option<String>,
    ) -> (ApprovalRequest, Option<ApprovalToken>) {
        let now = Utc::now();
        let mut request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            operation: operation.into(),
            resource: resource.into(),
            zone,
            requester: requester.into(),
            justification,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(self.config.request_ttl_seconds),
            reviewer: None,
            notes: None,
            token_id: None,
        };

        let token = if zone.auto_approvable() && self.config.auto_approve_green {
            request.status = ApprovalStatus::Approved;
            request.reviewer = Some("auto".to_string());
            let token = self.mint_token(&request);
            request.token_id = Some(token.token.clone());
            Some(token)
        } else {
            None
        };

        {
            let mut requests = self.requests.write().await;
            requests.insert(request.id.clone(), request.clone());
        }
        if let Some(token) = &token {
            self.tokens
                .write()
                .await
                .insert(token.token.clone(), token.clone());
        }

        self.events.publish(RuntimeEvent::new(
            "approval.requested",
            json!({
                "request_id": request.id,
                "operation": request.operation,
                "resource": request.resource,
                "zone": request.zone.as_str(),
                "auto_approved": token.is_some(),
            }),
        ));

        (request, token)
    }

    pub async fn approve(
        &self,
        request_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> CoreResult<ApprovalToken> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown approval request `{request_id}`")))?;

        if request.expires_at <= Utc::now() {
            request.status = ApprovalStatus::Expired;
            return Err(CoreError::Validation(format!(
                "approval request `{request_id}` has expired"
            )));
        }
        if request.status != ApprovalStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "approval request `{request_id}` is not pending"
            )));
        }

        request.status = ApprovalStatus::Approved;
        request.reviewer = Some(reviewer.to_string());
        request.notes = notes;
        let token = self.mint_token(request);
        request.token_id = Some(token.token.clone());
        let request_snapshot = request.clone();
        drop(requests);

        self.tokens
            .write()
            .await
            .insert(token.token.clone(), token.clone());
        self.events.publish(RuntimeEvent::new(
            "approval.approved",
            json!({
                "request_id": request_snapshot.id,
                "reviewer": reviewer,
                "operation": request_snapshot.operation,
            }),
        ));
        Ok(token)
    }

    pub async fn reject(
        &self,
        request_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> CoreResult<()> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown approval request `{request_id}`")))?;
        if request.status != ApprovalStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "approval request `{request_id}` is not pending"
            )));
        }
        request.status = ApprovalStatus::Rejected;
        request.reviewer = Some(reviewer.to_string());
        request.notes = notes;
        drop(requests);

        self.events.publish(RuntimeEvent::new(
            "approval.rejected",
            json!({"request_id": request_id, "reviewer": reviewer}),
        ));
        Ok(())
    }

    /// Validate a token against the operation and resource it must cover.
    /// With `consume`, a single-use token is marked used exactly once and
    /// its request advances to `used`.
    pub async fn validate(
        &self,
        token_str: &str,
        operation: &str,
        resource: &str,
        zone: Zone,
        consume: bool,
    ) -> CoreResult<()> {
        let approval_required = || CoreError::ApprovalRequired {
            operation: operation.to_string(),
            resource: resource.to_string(),
            zone,
        };

        let mut tokens = self.tokens.write().await;
        let token = tokens.get_mut(token_str).ok_or_else(approval_required)?;

        if token.used {
            return Err(CoreError::Validation(
                "approval token already used".to_string(),
            ));
        }
        if token.expires_at <= Utc::now() {
            return Err(approval_required());
        }
        if token.operation != operation {
            return Err(approval_required());
        }
        if token.resource != "*" && token.resource != resource {
            return Err(approval_required());
        }
        if token.checksum != self.token_checksum(token) {
            return Err(approval_required());
        }

        if consume && token.single_use {
            token.used = true;
            let request_id = token.request_id.clone();
            drop(tokens);
            if let Some(request) = self.requests.write().await.get_mut(&request_id) {
                request.status = ApprovalStatus::Used;
            }
            self.events.publish(RuntimeEvent::new(
                "approval.consumed",
                json!({"request_id": request_id, "operation": operation}),
            ));
        }
        Ok(())
    }

    pub async fn get_request(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.requests
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    fn mint_token(&self, request: &ApprovalRequest) -> ApprovalToken {
        let now = Utc::now();
        let mut token = ApprovalToken {
            token: Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            operation: request.operation.clone(),
            resource: request.resource.clone(),
            issued_at: now,
            expires_at: now + Duration::seconds(self.config.token_ttl_seconds),
            single_use: self.config.single_use,
            used: false,
            checksum: String::new(),
        };
        token.checksum = self.token_checksum(&token);
        token
    }

    fn token_checksum(&self, token: &ApprovalToken) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.token.as_bytes());
        hasher.update(b"|");
        hasher.update(token.request_id.as_bytes());
        hasher.update(b"|");
        hasher.update(token.operation.as_bytes());
        hasher.update(b"|");
        hasher.update(token.resource.as_bytes());
        hasher.update(b"|");
        hasher.update(token.issued_at.to_rfc3339().as_bytes());
        hasher.update(b"|");
        hasher.update(self.config.secret.as_bytes());
        format!("{:064x}", hasher.finalize())
    }
}
