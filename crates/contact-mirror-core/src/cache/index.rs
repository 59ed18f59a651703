//! Per-organization contact storage and its lookup indices.
//!
//! Every index maps a normalized key to the *set* of contact IDs holding
//! that key, so duplicates in the remote directory (two vendors sharing an
//! email, say) never shadow each other. Lookups that must return a single
//! contact pick the most recently synced one, then the smallest ID.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::fuzzy::name_confidence;
use crate::models::Contact;
use crate::normalize::{has_alpha_prefix, tax_id_digits};

type KeyIndex = HashMap<String, BTreeSet<String>>;

#[derive(Debug, Default)]
pub(crate) struct OrgShard {
    contacts: HashMap<String, Arc<Contact>>,
    by_tax_id: KeyIndex,
    by_tax_digits: KeyIndex,
    by_name: KeyIndex,
    by_email: KeyIndex,
}

/// Deterministic dump of every index, for consistency checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexFingerprint {
    pub contacts: BTreeSet<String>,
    pub tax_ids: BTreeMap<String, BTreeSet<String>>,
    pub tax_digits: BTreeMap<String, BTreeSet<String>>,
    pub names: BTreeMap<String, BTreeSet<String>>,
    pub emails: BTreeMap<String, BTreeSet<String>>,
}

/// Keys that identify more than one contact in an organization, with the
/// contact IDs sharing each key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DuplicateKeys {
    pub tax_ids: BTreeMap<String, BTreeSet<String>>,
    pub emails: BTreeMap<String, BTreeSet<String>>,
}

impl DuplicateKeys {
    pub fn is_empty(&self) -> bool {
        self.tax_ids.is_empty() && self.emails.is_empty()
    }
}

impl OrgShard {
    pub(crate) fn get(&self, contact_id: &str) -> Option<Arc<Contact>> {
        self.contacts.get(contact_id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.contacts.len()
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Arc<Contact>> {
        self.contacts.values()
    }

    /// Insert or replace; the previous version's index entries are removed
    /// before the new ones are linked.
    pub(crate) fn insert(&mut self, contact: Arc<Contact>) -> Option<Arc<Contact>> {
        let previous = self.contacts.remove(contact.contact_id());
        if let Some(old) = &previous {
            self.unlink(old);
        }
        self.link(&contact);
        self.contacts
            .insert(contact.contact_id().to_string(), contact);
        previous
    }

    pub(crate) fn remove(&mut self, contact_id: &str) -> Option<Arc<Contact>> {
        let removed = self.contacts.remove(contact_id)?;
        self.unlink(&removed);
        Some(removed)
    }

    pub(crate) fn find_by_tax_id(&self, normalized: &str) -> Option<Arc<Contact>> {
        if let Some(hit) = self.pick(self.by_tax_id.get(normalized)) {
            return Some(hit);
        }
        // Prefix-insensitive fallback: a bare-digits query matches any
        // prefix; a prefixed query only matches contacts stored without one.
        let digits = tax_id_digits(normalized)?;
        let query_prefixed = has_alpha_prefix(normalized);
        let ids = self.by_tax_digits.get(&digits)?;
        ids.iter()
            .filter_map(|id| self.contacts.get(id))
            .filter(|c| {
                !query_prefixed || !c.normalized_tax_id().is_some_and(has_alpha_prefix)
            })
            .max_by(|a, b| recency_order(a, b))
            .cloned()
    }

    pub(crate) fn find_by_name(&self, normalized: &str) -> Option<Arc<Contact>> {
        self.pick(self.by_name.get(normalized))
    }

    pub(crate) fn find_by_email(&self, normalized: &str) -> Option<Arc<Contact>> {
        self.pick(self.by_email.get(normalized))
    }

    /// Rank every contact by fuzzy name confidence.
    ///
    /// Sorted by confidence descending, then most recently synced, then
    /// contact ID, so the order is fully deterministic for a given state.
    pub(crate) fn find_by_name_fuzzy(
        &self,
        normalized: &str,
        min_confidence: f64,
    ) -> Vec<(Arc<Contact>, f64)> {
        let mut hits: Vec<(Arc<Contact>, f64)> = self
            .by_name
            .iter()
            .filter_map(|(name, ids)| {
                let confidence = name_confidence(normalized, name)?;
                (confidence >= min_confidence).then_some((ids, confidence))
            })
            .flat_map(|(ids, confidence)| {
                ids.iter()
                    .filter_map(|id| self.contacts.get(id))
                    .map(move |c| (Arc::clone(c), confidence))
            })
            .collect();

        hits.sort_by(|(ca, a), (cb, b)| {
            b.partial_cmp(a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| recency_order(cb, ca))
        });
        hits
    }

    /// Tax-ID and email keys held by more than one contact.
    pub(crate) fn duplicate_keys(&self) -> DuplicateKeys {
        fn shared(index: &KeyIndex) -> BTreeMap<String, BTreeSet<String>> {
            index
                .iter()
                .filter(|(_, ids)| ids.len() > 1)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
        DuplicateKeys {
            tax_ids: shared(&self.by_tax_id),
            emails: shared(&self.by_email),
        }
    }

    pub(crate) fn fingerprint(&self) -> IndexFingerprint {
        fn sorted(index: &KeyIndex) -> BTreeMap<String, BTreeSet<String>> {
            index.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        }
        IndexFingerprint {
            contacts: self.contacts.keys().cloned().collect(),
            tax_ids: sorted(&self.by_tax_id),
            tax_digits: sorted(&self.by_tax_digits),
            names: sorted(&self.by_name),
            emails: sorted(&self.by_email),
        }
    }

    fn pick(&self, ids: Option<&BTreeSet<String>>) -> Option<Arc<Contact>> {
        ids?.iter()
            .filter_map(|id| self.contacts.get(id))
            .max_by(|a, b| recency_order(a, b))
            .cloned()
    }

    fn link(&mut self, contact: &Contact) {
        let id = contact.contact_id();
        for (index, key) in index_keys(contact) {
            self.index_mut(index)
                .entry(key)
                .or_default()
                .insert(id.to_string());
        }
    }

    fn unlink(&mut self, contact: &Contact) {
        let id = contact.contact_id();
        for (index, key) in index_keys(contact) {
            let map = self.index_mut(index);
            if let Some(ids) = map.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    map.remove(&key);
                }
            }
        }
    }

    fn index_mut(&mut self, index: IndexKind) -> &mut KeyIndex {
        match index {
            IndexKind::TaxId => &mut self.by_tax_id,
            IndexKind::TaxDigits => &mut self.by_tax_digits,
            IndexKind::Name => &mut self.by_name,
            IndexKind::Email => &mut self.by_email,
        }
    }
}

#[derive(Clone, Copy)]
enum IndexKind {
    TaxId,
    TaxDigits,
    Name,
    Email,
}

fn index_keys(contact: &Contact) -> Vec<(IndexKind, String)> {
    let mut keys = Vec::with_capacity(4);
    if let Some(tax) = contact.normalized_tax_id() {
        keys.push((IndexKind::TaxId, tax.to_string()));
        if let Some(digits) = tax_id_digits(tax) {
            keys.push((IndexKind::TaxDigits, digits));
        }
    }
    if !contact.normalized_name().is_empty() {
        keys.push((IndexKind::Name, contact.normalized_name().to_string()));
    }
    if let Some(email) = contact.normalized_email() {
        keys.push((IndexKind::Email, email.to_string()));
    }
    keys
}

/// `Greater` means `a` is preferred: more recently synced, then smaller ID.
fn recency_order(a: &Contact, b: &Contact) -> std::cmp::Ordering {
    a.last_synced_at()
        .cmp(&b.last_synced_at())
        .then_with(|| b.contact_id().cmp(a.contact_id()))
}
