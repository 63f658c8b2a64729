use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use tether_types::{CoreError, CoreResult};

use crate::fingerprint::{hash_key, request_fingerprint, validate_key};
use crate::record::{IdempotencyRecord, IdempotencyStatus};
use crate::storage::IdempotencyStore;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub namespace: String,
    pub prefix: String,
    pub default_ttl_seconds: u64,
    pub min_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub lock_timeout_seconds: u64,
    pub fingerprinting: bool,
    /// Tolerated clock skew when deciding a record has expired.
    pub clock_skew_seconds: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_initial_ms: u64,
    pub lock_retry_max_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            prefix: "idem".to_string(),
            default_ttl_seconds: 24 * 60 * 60,
            min_ttl_seconds: 60,
            max_ttl_seconds: 7 * 24 * 60 * 60,
            lock_timeout_seconds: 300,
            fingerprinting: true,
            clock_skew_seconds: 5,
            lock_retry_attempts: 5,
            lock_retry_initial_ms: 100,
            lock_retry_max_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub request_data: Option<Value>,
    pub ttl_seconds: Option<u64>,
    pub actor: Option<String>,
    pub metadata: Option<Value>,
}

/// Proof of ownership for an in-flight operation. Updates must present both
/// the lock id and the record version they were issued against.
#[derive(Debug, Clone)]
pub struct LedgerLock {
    pub namespace: String,
    pub key_hash: String,
    pub lock_id: String,
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub lock_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub should_proceed: bool,
    pub existing_status: Option<IdempotencyStatus>,
    pub cached_result: Option<Value>,
    pub record: Option<IdempotencyRecord>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub result: Value,
    pub cached: bool,
}

/// Exactly-once execution of arbitrary operations keyed by a composite key.
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    config: LedgerConfig,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Look up the key and decide whether the caller should run the
    /// operation. A fingerprint mismatch against a stored record is treated
    /// as a replay attack and aborts.
    pub async fn check(
        &self,
        key: &str,
        request_data: Option<&Value>,
    ) -> CoreResult<CheckOutcome> {
        validate_key(key)?;
        let key_hash = hash_key(&self.config.prefix, key);
        let Some(record) = self.store.get(&self.config.namespace, &key_hash).await? else {
            return Ok(CheckOutcome {
                should_proceed: true,
                existing_status: None,
                cached_result: None,
                record: None,
                reason: None,
            });
        };

        let now = Utc::now();
        let expiry_cutoff =
            record.expires_at + Duration::seconds(self.config.clock_skew_seconds as i64);
        if now > expiry_cutoff {
            self.store.delete(&self.config.namespace, &key_hash).await?;
            return Ok(CheckOutcome {
                should_proceed: true,
                existing_status: Some(IdempotencyStatus::Expired),
                cached_result: None,
                record: None,
                reason: Some("prior record expired".to_string()),
            });
        }

        self.verify_fingerprint(&record, request_data)?;

        let outcome = match record.status {
            IdempotencyStatus::Completed => CheckOutcome {
                should_proceed: false,
                existing_status: Some(record.status),
                cached_result: record.result.clone(),
                record: Some(record),
                reason: Some("operation already completed".to_string()),
            },
            IdempotencyStatus::Pending | IdempotencyStatus::Locked => CheckOutcome {
                should_proceed: false,
                existing_status: Some(record.status),
                cached_result: None,
                record: Some(record),
                reason: Some("operation in flight".to_string()),
            },
            IdempotencyStatus::Failed | IdempotencyStatus::Expired => CheckOutcome {
                should_proceed: true,
                existing_status: Some(record.status),
                cached_result: None,
                record: Some(record),
                reason: None,
            },
        };
        Ok(outcome)
    }

    /// Atomic create-with-lock. On collision the existing record is
    /// re-checked; a stale lock is taken over with bounded exponential
    /// backoff.
    pub async fn start(
        &self,
        key: &str,
        operation: &str,
        opts: StartOptions,
    ) -> CoreResult<LedgerLock> {
        validate_key(key)?;
        let key_hash = hash_key(&self.config.prefix, key);
        let now = Utc::now();
        let ttl = opts
            .ttl_seconds
            .unwrap_or(self.config.default_ttl_seconds)
            .clamp(self.config.min_ttl_seconds, self.config.max_ttl_seconds);
        let lock_id = Uuid::new_v4().to_string();
        let lock_expires_at = now + Duration::seconds(self.config.lock_timeout_seconds as i64);

        let mut record =
            IdempotencyRecord::new(&self.config.namespace, &key_hash, now + Duration::seconds(ttl as i64));
        record.status = IdempotencyStatus::Locked;
        record.lock_id = Some(lock_id.clone());
        record.lock_expires_at = Some(lock_expires_at);
        record.attempts = 1;
        record.actor = opts.actor.clone();
        record.metadata = serde_json::json!({
            "operation": operation,
            "extra": opts.metadata,
        });
        if self.config.fingerprinting {
            record.fingerprint = opts.request_data.as_ref().map(request_fingerprint);
        }

        if self.store.create_if_absent(&record).await? {
            return Ok(LedgerLock {
                namespace: record.namespace,
                key_hash,
                lock_id,
                version: record.version,
                started_at: now,
                lock_expires_at,
            });
        }

        // Collision: someone holds (or held) this key. Re-check, then try to
        // take over a free lock with bounded retries.
        let existing = self
            .store
            .get(&self.config.namespace, &key_hash)
            .await?
            .ok_or_else(|| CoreError::Conflict("record vanished during start".to_string()))?;
        self.verify_fingerprint(&existing, opts.request_data.as_ref())?;
        if existing.status == IdempotencyStatus::Completed {
            return Err(CoreError::Conflict(format!(
                "operation `{operation}` already completed for this key"
            )));
        }

        let mut delay_ms = self.config.lock_retry_initial_ms;
        for attempt in 0..=self.config.lock_retry_attempts {
            if let Some(taken) = self
                .store
                .acquire_lock_if_free(&self.config.namespace, &key_hash, &lock_id, lock_expires_at)
                .await?
            {
                debug!(key_hash = %key_hash, attempt, "took over idempotency lock");
                return Ok(LedgerLock {
                    namespace: taken.namespace,
                    key_hash,
                    lock_id,
                    version: taken.version,
                    started_at: now,
                    lock_expires_at,
                });
            }
            if attempt == self.config.lock_retry_attempts {
                break;
            }
            // jitter keeps competing waiters from retrying in lockstep
            let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=delay_ms / 4);
            tokio::time::sleep(StdDuration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(self.config.lock_retry_max_ms);
        }

        Err(CoreError::Conflict(format!(
            "operation `{operation}` is in flight for this key"
        )))
    }

    pub async fn complete(&self, lock: &LedgerLock, result: Value) -> CoreResult<IdempotencyRecord> {
        self.finish(lock, IdempotencyStatus::Completed, Some(result), None)
            .await
    }

    pub async fn fail(&self, lock: &LedgerLock, error: &str) -> CoreResult<IdempotencyRecord> {
        self.finish(
            lock,
            IdempotencyStatus::Failed,
            None,
            Some(error.to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        lock: &LedgerLock,
        status: IdempotencyStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<IdempotencyRecord> {
        let mut record = self.owned_record(lock).await?;
        record.status = status;
        record.result = result;
        record.error = error;
        record.lock_id = None;
        record.lock_expires_at = None;
        record.updated_at = Utc::now();
        record.processing_duration_ms =
            Some((Utc::now() - lock.started_at).num_milliseconds().max(0) as u64);
        record.version += 1;

        if !self.store.update_if_version(&record, lock.version).await? {
            return Err(CoreError::Lock(
                "record version changed while finishing; lock no longer owned".to_string(),
            ));
        }
        Ok(record)
    }

    pub async fn extend_lock(&self, lock: &mut LedgerLock, seconds: u64) -> CoreResult<()> {
        let mut record = self.owned_record(lock).await?;
        let extended = Utc::now() + Duration::seconds(seconds as i64);
        record.lock_expires_at = Some(extended);
        record.updated_at = Utc::now();
        record.version += 1;

        if !self.store.update_if_version(&record, lock.version).await? {
            return Err(CoreError::Lock(
                "record version changed while extending lock".to_string(),
            ));
        }
        lock.version = record.version;
        lock.lock_expires_at = extended;
        Ok(())
    }

    pub async fn is_lock_valid(&self, lock: &LedgerLock) -> bool {
        match self.owned_record(lock).await {
            Ok(record) => record.lock_is_live(Utc::now()),
            Err(_) => false,
        }
    }

    pub async fn cleanup(&self, before: DateTime<Utc>) -> CoreResult<u64> {
        self.store.cleanup_expired(before).await
    }

    /// Run `op` exactly once for the key: replay a completed result from
    /// cache, refuse while in flight, otherwise acquire the lock, run, and
    /// record the terminal state.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        operation: &str,
        opts: StartOptions,
        op: F,
    ) -> CoreResult<ExecuteOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<Value>>,
    {
        let check = self.check(key, opts.request_data.as_ref()).await?;
        if let Some(IdempotencyStatus::Completed) = check.existing_status {
            let result = check.cached_result.unwrap_or(Value::Null);
            return Ok(ExecuteOutcome {
                result,
                cached: true,
            });
        }

        let lock = self.start(key, operation, opts).await?;
        match op().await {
            Ok(result) => {
                self.complete(&lock, result.clone()).await?;
                Ok(ExecuteOutcome {
                    result,
                    cached: false,
                })
            }
            Err(err) => {
                self.fail(&lock, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    fn verify_fingerprint(
        &self,
        record: &IdempotencyRecord,
        request_data: Option<&Value>,
    ) -> CoreResult<()> {
        if !self.config.fingerprinting {
            return Ok(());
        }
        let (Some(stored), Some(data)) = (&record.fingerprint, request_data) else {
            return Ok(());
        };
        let computed = request_fingerprint(data);
        if stored != &computed {
            return Err(CoreError::Conflict(format!(
                "fingerprint mismatch for key hash {}: request differs from the recorded one",
                &record.key_hash[..12.min(record.key_hash.len())]
            )));
        }
        Ok(())
    }

    async fn owned_record(&self, lock: &LedgerLock) -> CoreResult<IdempotencyRecord> {
        let record = self
            .store
            .get(&lock.namespace, &lock.key_hash)
            .await?
            .ok_or_else(|| CoreError::Lock("record no longer exists".to_string()))?;
        if record.lock_id.as_deref() != Some(lock.lock_id.as_str())
            || record.version != lock.version
        {
            return Err(CoreError::Lock(
                "lock is no longer owned by this caller".to_string(),
            ));
        }
        Ok(record)
    }
}
