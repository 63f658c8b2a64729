use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use tether_types::{CoreError, CoreResult};

use crate::audit::{AuditVerb, StateAuditRecord};
use crate::checksum::content_checksum;

/// One immutable version of a logical key. A new `put` never mutates the
/// value; it writes a fresh entry and flips the supersede pointer on the old
/// one in the same logical transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub id: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub environment: String,
    pub actor: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl StateEntry {
    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now >= self.created_at + Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub environment: String,
    pub actor: String,
    pub tags: HashMap<String, String>,
    pub ttl_seconds: Option<u64>,
}

impl PutOptions {
    pub fn new(environment: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            actor: actor.into(),
            tags: HashMap::new(),
            ttl_seconds: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    pub key: Option<String>,
    pub environment: Option<String>,
    pub tags: HashMap<String, String>,
    pub include_superseded: bool,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct QueryPage {
    pub entries: Vec<StateEntry>,
    pub total: usize,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, StateEntry>,
    // (environment, key) -> id of the current (non-superseded) entry
    current: HashMap<(String, String), String>,
    audit: Vec<StateAuditRecord>,
}

/// Versioned, audited, content-addressed key/value store. Records live one
/// per file under `{base}/entries`, audit records under `{base}/audit`; the
/// in-memory index is rebuilt on open. All mutation happens under a single
/// write lock, which gives the single-writer-per-key guarantee.
pub struct StateStore {
    base: PathBuf,
    inner: RwLock<StoreInner>,
}

impl StateStore {
    pub async fn open(base: impl AsRef<Path>) -> CoreResult<Self> {
        let base = base.as_ref().to_path_buf();
        let entries_dir = base.join("entries");
        let audit_dir = base.join("audit");
        fs::create_dir_all(&entries_dir)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        fs::create_dir_all(&audit_dir)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut inner = StoreInner::default();
        load_records(&entries_dir, |entry: StateEntry| {
            if entry.superseded_at.is_none() {
                let scope = (entry.environment.clone(), entry.key.clone());
                let newer_exists = inner.current.get(&scope).is_some_and(|existing_id| {
                    inner
                        .entries
                        .get(existing_id)
                        .is_some_and(|e| e.version >= entry.version)
                });
                if !newer_exists {
                    inner.current.insert(scope, entry.id.clone());
                }
            }
            inner.entries.insert(entry.id.clone(), entry);
        })
        .await?;
        load_records(&audit_dir, |record: StateAuditRecord| {
            inner.audit.push(record);
        })
        .await?;
        inner.audit.sort_by(|a, b| a.at.cmp(&b.at));

        Ok(Self {
            base,
            inner: RwLock::new(inner),
        })
    }

    /// Current (non-superseded) value for (key, env), absent once TTL elapsed.
    pub async fn get(&self, key: &str, environment: &str) -> Option<Value> {
        self.get_entry(key, environment).await.map(|e| e.value)
    }

    pub async fn get_entry(&self, key: &str, environment: &str) -> Option<StateEntry> {
        let inner = self.inner.read().await;
        let id = inner
            .current
            .get(&(environment.to_string(), key.to_string()))?;
        let entry = inner.entries.get(id)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(entry.clone())
    }

    pub async fn put(&self, key: &str, value: Value, opts: PutOptions) -> CoreResult<StateEntry> {
        let mut inner = self.inner.write().await;
        let scope = (opts.environment.clone(), key.to_string());
        let now = Utc::now();

        let prior_id = inner.current.get(&scope).cloned();
        let prior_version = prior_id
            .as_ref()
            .and_then(|id| inner.entries.get(id))
            .map(|e| e.version)
            .unwrap_or_else(|| {
                // the current pointer is gone after a delete; continue the chain
                inner
                    .entries
                    .values()
                    .filter(|e| e.key == key && e.environment == opts.environment)
                    .map(|e| e.version)
                    .max()
                    .unwrap_or(0)
            });

        let entry = StateEntry {
            id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            value: value.clone(),
            version: prior_version + 1,
            environment: opts.environment.clone(),
            actor: opts.actor.clone(),
            checksum: content_checksum(&value),
            created_at: now,
            superseded_by: None,
            superseded_at: None,
            ttl_seconds: opts.ttl_seconds,
            tags: opts.tags,
        };

        if let Some(prior_id) = prior_id {
            if let Some(prior) = inner.entries.get_mut(&prior_id) {
                prior.superseded_by = Some(entry.id.clone());
                prior.superseded_at = Some(now);
                let prior_snapshot = prior.clone();
                self.persist_entry(&prior_snapshot).await?;
            }
            let supersede = StateAuditRecord::new(
                AuditVerb::Supersede,
                prior_id,
                key,
                &opts.environment,
                &opts.actor,
            );
            self.persist_audit(&supersede).await?;
            inner.audit.push(supersede);
        }

        self.persist_entry(&entry).await?;
        let create = StateAuditRecord::new(
            AuditVerb::Create,
            entry.id.clone(),
            key,
            &opts.environment,
            &opts.actor,
        );
        self.persist_audit(&create).await?;
        inner.audit.push(create);

        inner.current.insert(scope, entry.id.clone());
        inner.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Supersede the current entry with no successor. Returns false when
    /// there is nothing current to delete.
    pub async fn delete(&self, key: &str, environment: &str, actor: &str) -> CoreResult<bool> {
        let mut inner = self.inner.write().await;
        let scope = (environment.to_string(), key.to_string());
        let Some(id) = inner.current.remove(&scope) else {
            return Ok(false);
        };
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(false);
        };
        entry.superseded_at = Some(Utc::now());
        entry.superseded_by = None;
        let snapshot = entry.clone();
        self.persist_entry(&snapshot).await?;

        let record = StateAuditRecord::new(AuditVerb::Delete, id, key, environment, actor);
        self.persist_audit(&record).await?;
        inner.audit.push(record);
        Ok(true)
    }

    /// All versions for (key, env), newest first.
    pub async fn history(&self, key: &str, environment: &str) -> Vec<StateEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<StateEntry> = inner
            .entries
            .values()
            .filter(|e| e.key == key && e.environment == environment)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        entries
    }

    /// Re-issue a prior version's value as a fresh entry tagged with the
    /// version it came from.
    pub async fn rollback(
        &self,
        key: &str,
        version: u64,
        environment: &str,
        actor: &str,
    ) -> CoreResult<StateEntry> {
        let source = {
            let inner = self.inner.read().await;
            inner
                .entries
                .values()
                .find(|e| e.key == key && e.environment == environment && e.version == version)
                .cloned()
        };
        let Some(source) = source else {
            return Err(CoreError::Validation(format!(
                "no version {version} for key `{key}` in `{environment}`"
            )));
        };

        let opts = PutOptions::new(environment, actor)
            .with_tag("rollback_from_version", version.to_string());
        let entry = self.put(key, source.value, opts).await?;

        let mut record = StateAuditRecord::new(
            AuditVerb::Rollback,
            entry.id.clone(),
            key,
            environment,
            actor,
        );
        record.details = Some(serde_json::json!({ "from_version": version }));
        self.persist_audit(&record).await?;
        self.inner.write().await.audit.push(record);
        Ok(entry)
    }

    pub async fn query(&self, query: StateQuery) -> QueryPage {
        let inner = self.inner.read().await;
        let mut matched: Vec<StateEntry> = inner
            .entries
            .values()
            .filter(|e| {
                if !query.include_superseded && e.is_superseded() {
                    return false;
                }
                if let Some(key) = &query.key {
                    if &e.key != key {
                        return false;
                    }
                }
                if let Some(env) = &query.environment {
                    if &e.environment != env {
                        return false;
                    }
                }
                query
                    .tags
                    .iter()
                    .all(|(k, v)| e.tags.get(k).is_some_and(|tag| tag == v))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            (&a.environment, &a.key, b.version).cmp(&(&b.environment, &b.key, a.version))
        });

        let total = matched.len();
        let limit = if query.limit == 0 { 50 } else { query.limit };
        let entries = matched
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();
        QueryPage { entries, total }
    }

    /// `checksum == hash(value)` — detects tampering or corruption on read.
    pub fn verify_integrity(entry: &StateEntry) -> bool {
        content_checksum(&entry.value) == entry.checksum
    }

    pub async fn audit_log(&self) -> Vec<StateAuditRecord> {
        self.inner.read().await.audit.clone()
    }

    pub async fn audit_for_entry(&self, entry_id: &str) -> Vec<StateAuditRecord> {
        self.inner
            .read()
            .await
            .audit
            .iter()
            .filter(|r| r.entry_id == entry_id)
            .cloned()
            .collect()
    }

    async fn persist_entry(&self, entry: &StateEntry) -> CoreResult<()> {
        let path = self.base.join("entries").join(format!("{}.json", entry.id));
        write_json_atomic(&path, entry).await
    }

    async fn persist_audit(&self, record: &StateAuditRecord) -> CoreResult<()> {
        let path = self.base.join("audit").join(format!("{}.json", record.id));
        write_json_atomic(&path, record).await
    }
}

/// Write-then-rename so a crash mid-write never leaves a truncated record.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let raw = serde_json::to_vec_pretty(value).map_err(|e| CoreError::Storage(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &raw)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

/// Load every record in a directory; a corrupt file degrades to absent at
/// the record level and is logged, never fatal to the store.
async fn load_records<T, F>(dir: &Path, mut apply: F) -> CoreResult<()>
where
    T: for<'de> Deserialize<'de>,
    F: FnMut(T),
{
    let mut read_dir = fs::read_dir(dir)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    while let Some(dirent) = read_dir
        .next_entry()
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?
    {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable state record");
                continue;
            }
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(record) => apply(record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt state record skipped");
            }
        }
    }
    Ok(())
}
