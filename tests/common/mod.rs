#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use contact_mirror::core::{ContactCache, ContactDraft};
use contact_mirror::remote::{ContactPage, RemoteDirectoryClient, RemoteError};
use contact_mirror::retry::RetryPolicy;
use contact_mirror::{SyncEngine, SyncOptions};
use serde_json::{json, Value};

/// In-memory remote directory with scriptable failures.
///
/// Contact IDs are `c0000`, `c0001`, ...; the listing pages through them in
/// ID order and uses the next offset as its cursor.
pub struct FakeDirectory {
    pub records: Mutex<BTreeMap<String, Value>>,
    pub page_size: usize,
    /// Remaining `RateLimited` answers per contact ID.
    pub throttled: Mutex<HashMap<String, u32>>,
    pub retry_after: Option<Duration>,
    /// Errors returned by every detail fetch of a contact.
    pub broken: Mutex<HashMap<String, RemoteError>>,
    pub detail_delay: Duration,
    pub fail_create: AtomicBool,
    pub detail_calls: AtomicUsize,
    pub next_id: AtomicUsize,
}

impl FakeDirectory {
    pub fn with_contacts(n: usize) -> Self {
        let records = (0..n)
            .map(|i| (contact_id(i), record(i, "2024-03-01T10:00:00+0000")))
            .collect();
        Self {
            records: Mutex::new(records),
            page_size: 100,
            throttled: Mutex::new(HashMap::new()),
            retry_after: None,
            broken: Mutex::new(HashMap::new()),
            detail_delay: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            detail_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(n),
        }
    }

    pub fn throttle(&self, id: &str, times: u32) {
        self.throttled.lock().unwrap().insert(id.to_string(), times);
    }

    pub fn break_contact(&self, id: &str, err: RemoteError) {
        self.broken.lock().unwrap().insert(id.to_string(), err);
    }

    pub fn put(&self, record: Value) {
        let id = record["contact_id"].as_str().unwrap().to_string();
        self.records.lock().unwrap().insert(id, record);
    }

    pub fn delete(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
    }

    fn read_detail(&self, contact_id: &str) -> Result<Value, RemoteError> {
        {
            let mut throttled = self.throttled.lock().unwrap();
            if let Some(left) = throttled.get_mut(contact_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(RemoteError::RateLimited {
                        retry_after: self.retry_after,
                    });
                }
            }
        }
        if let Some(err) = self.broken.lock().unwrap().get(contact_id) {
            return Err(err.clone());
        }
        self.records
            .lock()
            .unwrap()
            .get(contact_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(contact_id.to_string()))
    }
}

pub fn contact_id(i: usize) -> String {
    format!("c{:04}", i)
}

pub fn record(i: usize, modified: &str) -> Value {
    json!({
        "contact_id": contact_id(i),
        "contact_name": format!("Supplier {} Sp. z o.o.", i),
        "contact_type": if i % 2 == 0 { "vendor" } else { "customer" },
        "cf_vat_id": format!("PL{:010}", 1_000_000 + i),
        "email": format!("billing{}@supplier.pl", i),
        "last_modified_time": modified,
    })
}

#[async_trait]
impl RemoteDirectoryClient for FakeDirectory {
    async fn list_contacts(
        &self,
        _organization_id: &str,
        cursor: Option<&str>,
    ) -> Result<ContactPage, RemoteError> {
        let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let records = self.records.lock().unwrap();
        let page: Vec<Value> = records
            .values()
            .skip(offset)
            .take(self.page_size)
            .map(|r| json!({"contact_id": r["contact_id"], "contact_name": r["contact_name"]}))
            .collect();
        let next = offset + page.len();
        Ok(ContactPage {
            records: page,
            next_cursor: (next < records.len()).then(|| next.to_string()),
        })
    }

    async fn get_contact(
        &self,
        _organization_id: &str,
        contact_id: &str,
    ) -> Result<Value, RemoteError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.read_detail(contact_id);
        // The answer is taken before the delay, like a slow remote that
        // serializes the record and then takes its time responding.
        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        result
    }

    async fn create_contact(
        &self,
        _organization_id: &str,
        draft: &ContactDraft,
    ) -> Result<Value, RemoteError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("502 Bad Gateway".into()));
        }
        let id = contact_id(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut body = draft.to_remote_body();
        body["contact_id"] = json!(id);
        body["last_modified_time"] = json!("2024-05-01T09:00:00+0000");
        self.put(body.clone());
        Ok(body)
    }

    async fn update_contact(
        &self,
        _organization_id: &str,
        contact_id: &str,
        patch: &Value,
    ) -> Result<Value, RemoteError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(contact_id)
            .ok_or_else(|| RemoteError::NotFound(contact_id.to_string()))?;
        if let (Some(r), Some(p)) = (record.as_object_mut(), patch.as_object()) {
            for (k, v) in p {
                r.insert(k.clone(), v.clone());
            }
        }
        Ok(record.clone())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(5),
        jitter: true,
    }
}

pub fn engine_with(client: Arc<FakeDirectory>, options: SyncOptions) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(
        Arc::new(ContactCache::new()),
        client,
        fast_retry(),
        options,
    ))
}
