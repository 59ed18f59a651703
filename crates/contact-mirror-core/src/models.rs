//! Core data models shared by the cache, the matcher, and the sync engine.
//!
//! A [`Contact`] is split into a typed core (identity plus the searchable
//! fields) and an opaque `payload` holding every other remote field
//! verbatim. Derived comparison keys (`normalized_name`, normalized tax ID
//! and email) are private and recomputed whenever their source changes, so
//! they can never drift from the raw values.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::CacheError;
use crate::normalize::{country_iso, normalize_email, normalize_name, normalize_tax_id};

/// Counterparty role as reported by the accounting system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Customer,
    Vendor,
    #[default]
    Unknown,
}

impl ContactType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" => ContactType::Customer,
            "vendor" | "supplier" => ContactType::Vendor,
            _ => ContactType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Customer => "customer",
            ContactType::Vendor => "vendor",
            ContactType::Unknown => "unknown",
        }
    }
}

/// Version marker of a remote record.
///
/// `version` is the remote's own version/ETag when it provides one, and
/// otherwise `sha256:<hex>` of the canonical JSON of the record.
/// `modified_at` is the remote modification time, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Revision {
    pub fn explicit(version: impl Into<String>, modified_at: Option<DateTime<Utc>>) -> Self {
        Self {
            version: version.into(),
            modified_at,
        }
    }

    /// Content-hash revision for records that carry no explicit version.
    ///
    /// `serde_json::Map` keeps keys sorted, so serializing the value is a
    /// canonical form and the hash is stable across processes.
    pub fn content_hash(record: &Value, modified_at: Option<DateTime<Utc>>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(record.to_string().as_bytes());
        Self {
            version: format!("sha256:{:x}", hasher.finalize()),
            modified_at,
        }
    }

    /// Orders two revisions of the same contact.
    ///
    /// Identical versions compare equal. Otherwise the modification
    /// timestamps decide when both sides have one. `None` means the two
    /// cannot be ordered; callers apply the incoming record in that case.
    pub fn compare(&self, other: &Revision) -> Option<Ordering> {
        if self.version == other.version {
            return Some(Ordering::Equal);
        }
        match (self.modified_at, other.modified_at) {
            (Some(a), Some(b)) if a != b => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// True when `self` is strictly older than `other`.
    pub fn is_older_than(&self, other: &Revision) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }
}

/// One counterparty within one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    organization_id: String,
    contact_id: String,
    display_name: String,
    #[serde(default)]
    tax_id: Option<String>,
    /// ISO country used when the tax ID was normalized; persisted so a
    /// reload derives exactly the same key.
    #[serde(default)]
    tax_country: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    contact_type: ContactType,
    #[serde(default)]
    payload: Map<String, Value>,
    last_synced_at: DateTime<Utc>,
    revision: Revision,

    #[serde(skip)]
    normalized_name: String,
    #[serde(skip)]
    normalized_tax_id: Option<String>,
    #[serde(skip)]
    normalized_email: Option<String>,
}

impl Contact {
    pub fn new(
        organization_id: impl Into<String>,
        contact_id: impl Into<String>,
        display_name: impl Into<String>,
        revision: Revision,
    ) -> Self {
        let mut contact = Self {
            organization_id: organization_id.into(),
            contact_id: contact_id.into(),
            display_name: display_name.into(),
            tax_id: None,
            tax_country: None,
            email: None,
            contact_type: ContactType::Unknown,
            payload: Map::new(),
            last_synced_at: Utc::now(),
            revision,
            normalized_name: String::new(),
            normalized_tax_id: None,
            normalized_email: None,
        };
        contact.refresh_derived();
        contact
    }

    pub fn with_tax_id(mut self, raw: impl Into<String>, country_hint: Option<&str>) -> Self {
        self.set_tax_id(Some(raw.into()), country_hint);
        self
    }

    pub fn with_email(mut self, raw: impl Into<String>) -> Self {
        self.set_email(Some(raw.into()));
        self
    }

    pub fn with_contact_type(mut self, contact_type: ContactType) -> Self {
        self.contact_type = contact_type;
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_last_synced_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_synced_at = at;
        self
    }

    /// Build a contact from a full remote record (detail endpoint shape).
    ///
    /// Field extraction:
    /// - name: `contact_name`, falling back to `company_name`
    /// - tax ID: `cf_vat_id`, `cf_tax_id`, then a matching `custom_fields` entry
    /// - email: `email`, falling back to the primary contact person
    /// - revision: `etag`/`version` if present, else a content hash;
    ///   timestamp from `last_modified_time`
    ///
    /// Every field is also kept verbatim in the payload.
    pub fn from_remote_record(organization_id: &str, record: &Value) -> Result<Self, CacheError> {
        let obj = record.as_object().ok_or(CacheError::MissingContactId)?;

        let contact_id = str_field(obj, "contact_id").ok_or(CacheError::MissingContactId)?;
        if organization_id.trim().is_empty() {
            return Err(CacheError::MissingOrganizationId);
        }

        let display_name = str_field(obj, "contact_name")
            .or_else(|| str_field(obj, "company_name"))
            .unwrap_or_default();

        let modified_at = obj
            .get("last_modified_time")
            .and_then(|v| v.as_str())
            .and_then(parse_remote_timestamp);

        let revision = match str_field(obj, "etag").or_else(|| str_field(obj, "version")) {
            Some(v) => Revision::explicit(v, modified_at),
            None => Revision::content_hash(record, modified_at),
        };

        let country = obj
            .get("billing_address")
            .and_then(|a| a.as_object())
            .and_then(|a| str_field(a, "country_code").or_else(|| str_field(a, "country")));

        let mut contact = Contact::new(organization_id, contact_id, display_name, revision)
            .with_contact_type(
                str_field(obj, "contact_type")
                    .map(|t| ContactType::parse(&t))
                    .unwrap_or_default(),
            )
            .with_payload(obj.clone());

        if let Some(tax) = extract_tax_id(obj) {
            contact.set_tax_id(Some(tax), country.as_deref());
        }
        if let Some(email) = extract_email(obj) {
            contact.set_email(Some(email));
        }
        Ok(contact)
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn tax_id(&self) -> Option<&str> {
        self.tax_id.as_deref()
    }

    pub fn normalized_tax_id(&self) -> Option<&str> {
        self.normalized_tax_id.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn normalized_email(&self) -> Option<&str> {
        self.normalized_email.as_deref()
    }

    pub fn contact_type(&self) -> ContactType {
        self.contact_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn last_synced_at(&self) -> DateTime<Utc> {
        self.last_synced_at
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.display_name = display_name.into();
        self.normalized_name = normalize_name(&self.display_name);
    }

    pub fn set_tax_id(&mut self, raw: Option<String>, country_hint: Option<&str>) {
        self.tax_country = country_hint.and_then(country_iso);
        self.tax_id = raw.filter(|t| !t.trim().is_empty());
        self.normalized_tax_id = self
            .tax_id
            .as_deref()
            .and_then(|t| normalize_tax_id(t, self.tax_country.as_deref()));
    }

    pub fn set_email(&mut self, raw: Option<String>) {
        self.email = raw.filter(|e| !e.trim().is_empty());
        self.normalized_email = self.email.as_deref().and_then(normalize_email);
    }

    /// Recompute every derived key from the raw fields.
    ///
    /// Called after deserialization, since derived keys are never persisted.
    pub(crate) fn refresh_derived(&mut self) {
        self.normalized_name = normalize_name(&self.display_name);
        self.normalized_tax_id = self
            .tax_id
            .as_deref()
            .and_then(|t| normalize_tax_id(t, self.tax_country.as_deref()));
        self.normalized_email = self.email.as_deref().and_then(normalize_email);
    }
}

/// Per-organization sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Completion time of the last full sync that was not aborted.
    #[serde(default)]
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Receive time of the last applied webhook event.
    #[serde(default)]
    pub last_webhook_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_webhook_event_id: Option<String>,
}

impl SyncCursor {
    /// True when no full sync has completed within `max_age` of `now`.
    pub fn is_starved(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.last_full_sync_at {
            Some(at) => now - at > max_age,
            None => true,
        }
    }
}

/// Supplier data as extracted from a document. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialSupplier {
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// ISO code or country name; used as the tax-ID prefix hint.
    #[serde(default)]
    pub country: Option<String>,
}

impl PartialSupplier {
    /// Draft for the auto-create path after a `NotFound` resolution.
    pub fn to_draft(&self, contact_type: ContactType) -> Option<ContactDraft> {
        let name = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        Some(ContactDraft {
            display_name: name.to_string(),
            tax_id: self
                .tax_id
                .as_deref()
                .and_then(|t| normalize_tax_id(t, self.country.as_deref())),
            email: self.email.as_deref().and_then(normalize_email),
            country: self.country.as_deref().and_then(country_iso),
            contact_type,
            extra: Map::new(),
        })
    }
}

/// A contact that does not exist remotely yet. Never stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub display_name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub contact_type: ContactType,
    /// Extra remote fields passed through untouched.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ContactDraft {
    pub fn new(display_name: impl Into<String>, contact_type: ContactType) -> Self {
        Self {
            display_name: display_name.into(),
            tax_id: None,
            email: None,
            country: None,
            contact_type,
            extra: Map::new(),
        }
    }

    /// Request body for the remote create endpoint.
    pub fn to_remote_body(&self) -> Value {
        let mut body = self.extra.clone();
        body.insert("contact_name".into(), Value::String(self.display_name.clone()));
        body.insert("company_name".into(), Value::String(self.display_name.clone()));
        if self.contact_type != ContactType::Unknown {
            body.insert(
                "contact_type".into(),
                Value::String(self.contact_type.as_str().to_string()),
            );
        }
        if let Some(tax) = &self.tax_id {
            body.insert(
                "custom_fields".into(),
                serde_json::json!([{ "api_name": "cf_vat_id", "value": tax }]),
            );
        }
        if let Some(email) = &self.email {
            body.insert(
                "contact_persons".into(),
                serde_json::json!([{ "email": email, "is_primary_contact": true }]),
            );
        }
        if let Some(country) = &self.country {
            body.insert(
                "billing_address".into(),
                serde_json::json!({ "country_code": country }),
            );
        }
        Value::Object(body)
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_tax_id(obj: &Map<String, Value>) -> Option<String> {
    if let Some(v) = str_field(obj, "cf_vat_id").or_else(|| str_field(obj, "cf_tax_id")) {
        return Some(v);
    }
    obj.get("custom_fields")
        .and_then(|f| f.as_array())
        .and_then(|fields| {
            fields.iter().find_map(|f| {
                let f = f.as_object()?;
                let api_name = f.get("api_name").and_then(|n| n.as_str())?;
                if api_name == "cf_vat_id" || api_name == "cf_tax_id" {
                    str_field(f, "value")
                } else {
                    None
                }
            })
        })
}

fn extract_email(obj: &Map<String, Value>) -> Option<String> {
    if let Some(v) = str_field(obj, "email") {
        return Some(v);
    }
    let persons = obj.get("contact_persons").and_then(|p| p.as_array())?;
    persons
        .iter()
        .filter_map(|p| p.as_object())
        .find(|p| p.get("is_primary_contact").and_then(|b| b.as_bool()) == Some(true))
        .or_else(|| persons.iter().filter_map(|p| p.as_object()).next())
        .and_then(|p| str_field(p, "email"))
}

/// Parse the remote's timestamp formats (`2024-01-15T10:20:30+0100`,
/// RFC 3339, or a naive UTC timestamp).
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn remote_record_extracts_searchable_fields() {
        let record = json!({
            "contact_id": "460000000026049",
            "contact_name": "Acme Sp. z o.o.",
            "contact_type": "vendor",
            "cf_vat_id": "PL 526-104-08-28",
            "email": "Billing@Acme.PL",
            "last_modified_time": "2024-01-15T10:20:30+0100",
            "billing_address": { "country_code": "PL", "city": "Warszawa" }
        });
        let c = Contact::from_remote_record("org-1", &record).unwrap();
        assert_eq!(c.contact_id(), "460000000026049");
        assert_eq!(c.normalized_name(), "acme");
        assert_eq!(c.normalized_tax_id(), Some("PL5261040828"));
        assert_eq!(c.normalized_email(), Some("billing@acme.pl"));
        assert_eq!(c.contact_type(), ContactType::Vendor);
        assert!(c.revision().version.starts_with("sha256:"));
        assert_eq!(
            c.revision().modified_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 9, 20, 30).unwrap())
        );
        assert_eq!(c.payload()["billing_address"]["city"], "Warszawa");
    }

    #[test]
    fn remote_record_reads_custom_fields_and_contact_persons() {
        let record = json!({
            "contact_id": "1",
            "company_name": "Nordic Parts OÜ",
            "custom_fields": [{ "api_name": "cf_tax_id", "value": "102030405" }],
            "billing_address": { "country": "Estonia" },
            "contact_persons": [
                { "email": "ops@nordic.ee", "is_primary_contact": false },
                { "email": "boss@nordic.ee", "is_primary_contact": true }
            ]
        });
        let c = Contact::from_remote_record("org-1", &record).unwrap();
        assert_eq!(c.display_name(), "Nordic Parts OÜ");
        assert_eq!(c.normalized_tax_id(), Some("EE102030405"));
        assert_eq!(c.email(), Some("boss@nordic.ee"));
    }

    #[test]
    fn remote_record_without_id_is_rejected() {
        let record = json!({ "contact_name": "No Id Ltd" });
        assert!(matches!(
            Contact::from_remote_record("org-1", &record),
            Err(CacheError::MissingContactId)
        ));
    }

    #[test]
    fn content_hash_is_stable_and_content_sensitive() {
        let a = Revision::content_hash(&json!({"b": 1, "a": 2}), None);
        let b = Revision::content_hash(&json!({"a": 2, "b": 1}), None);
        let c = Revision::content_hash(&json!({"a": 3, "b": 1}), None);
        assert_eq!(a, b);
        assert_ne!(a.version, c.version);
    }

    #[test]
    fn revision_ordering_uses_timestamps_only_when_both_present() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let old = Revision::explicit("a", Some(t1));
        let new = Revision::explicit("b", Some(t2));
        assert!(old.is_older_than(&new));
        assert!(!new.is_older_than(&old));
        assert_eq!(old.compare(&old.clone()), Some(Ordering::Equal));

        let untimed = Revision::explicit("c", None);
        assert_eq!(untimed.compare(&new), None);
        assert!(!untimed.is_older_than(&new));
    }

    #[test]
    fn display_name_change_recomputes_normalized_name() {
        let mut c = Contact::new("o", "1", "Alpha GmbH", Revision::explicit("r1", None));
        assert_eq!(c.normalized_name(), "alpha");
        c.set_display_name("Beta Limited");
        assert_eq!(c.normalized_name(), "beta");
    }

    #[test]
    fn draft_body_carries_tax_id_as_custom_field() {
        let supplier = PartialSupplier {
            tax_id: Some("526 104 08 28".into()),
            name: Some("Acme Sp. z o.o.".into()),
            email: Some("Info@Acme.pl".into()),
            country: Some("Poland".into()),
        };
        let draft = supplier.to_draft(ContactType::Vendor).unwrap();
        assert_eq!(draft.tax_id.as_deref(), Some("PL5261040828"));
        let body = draft.to_remote_body();
        assert_eq!(body["contact_name"], "Acme Sp. z o.o.");
        assert_eq!(body["contact_type"], "vendor");
        assert_eq!(body["custom_fields"][0]["value"], "PL5261040828");
        assert_eq!(body["contact_persons"][0]["email"], "info@acme.pl");
        assert_eq!(body["billing_address"]["country_code"], "PL");
    }

    #[test]
    fn starvation_detection() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut cursor = SyncCursor::default();
        assert!(cursor.is_starved(now, chrono::Duration::hours(24)));
        cursor.last_full_sync_at = Some(now - chrono::Duration::hours(2));
        assert!(!cursor.is_starved(now, chrono::Duration::hours(24)));
        assert!(cursor.is_starved(now, chrono::Duration::hours(1)));
    }
}
