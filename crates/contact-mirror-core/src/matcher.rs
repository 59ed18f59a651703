//! Supplier-to-contact resolution.
//!
//! [`MatchResolver::resolve`] walks the cache in a fixed priority order and
//! stops at the first hit:
//!
//! | step | key                | confidence |
//! |------|--------------------|------------|
//! | 1    | tax ID             | 1.0        |
//! | 2    | exact name         | 0.95       |
//! | 3    | email              | 0.85       |
//! | 4    | best fuzzy name    | 0.6 – 0.9  |
//!
//! A structured hit always wins, however well some other candidate scores
//! on fuzzy similarity.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{ContactCache, EMAIL_CONFIDENCE, NAME_EXACT_CONFIDENCE, TAX_ID_CONFIDENCE};
use crate::error::ResolveError;
use crate::fuzzy::{FUZZY_CONFIDENCE_MAX, FUZZY_CONFIDENCE_MIN};
use crate::models::{Contact, PartialSupplier};

/// Default lowest fuzzy confidence accepted as a match.
pub const DEFAULT_FUZZY_FLOOR: f64 = FUZZY_CONFIDENCE_MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    TaxId,
    NameExact,
    Email,
    NameFuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        contact: Arc<Contact>,
        confidence: f64,
        matched_by: MatchedBy,
    },
    /// No candidate; the caller may create the contact remotely.
    NotFound,
}

impl MatchResult {
    pub fn contact(&self) -> Option<&Arc<Contact>> {
        match self {
            MatchResult::Matched { contact, .. } => Some(contact),
            MatchResult::NotFound => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

pub struct MatchResolver {
    cache: Arc<ContactCache>,
    fuzzy_floor: f64,
}

impl MatchResolver {
    pub fn new(cache: Arc<ContactCache>) -> Self {
        Self {
            cache,
            fuzzy_floor: DEFAULT_FUZZY_FLOOR,
        }
    }

    /// Override the fuzzy floor; clamped into the fuzzy confidence band.
    pub fn with_fuzzy_floor(mut self, floor: f64) -> Self {
        self.fuzzy_floor = floor.clamp(FUZZY_CONFIDENCE_MIN, FUZZY_CONFIDENCE_MAX);
        self
    }

    pub fn fuzzy_floor(&self) -> f64 {
        self.fuzzy_floor
    }

    /// Resolve supplier data to a cached contact.
    ///
    /// `Ok(MatchResult::NotFound)` is the normal no-match outcome. Errors
    /// are reserved for an unloaded cache or an organization the cache
    /// has never seen.
    pub fn resolve(
        &self,
        organization_id: &str,
        supplier: &PartialSupplier,
    ) -> Result<MatchResult, ResolveError> {
        if !self.cache.is_ready() {
            return Err(ResolveError::CacheNotLoaded);
        }
        if !self.cache.has_organization(organization_id) {
            return Err(ResolveError::UnknownOrganization(organization_id.to_string()));
        }

        if let Some(tax_id) = non_blank(&supplier.tax_id) {
            if let Some(c) =
                self.cache
                    .find_by_tax_id_hinted(organization_id, tax_id, supplier.country.as_deref())
            {
                return Ok(matched(c, TAX_ID_CONFIDENCE, MatchedBy::TaxId));
            }
        }

        let name = non_blank(&supplier.name);
        if let Some(name) = name {
            if let Some(c) = self.cache.find_by_name_exact(organization_id, name) {
                return Ok(matched(c, NAME_EXACT_CONFIDENCE, MatchedBy::NameExact));
            }
        }

        if let Some(email) = non_blank(&supplier.email) {
            if let Some(c) = self.cache.find_by_email(organization_id, email) {
                return Ok(matched(c, EMAIL_CONFIDENCE, MatchedBy::Email));
            }
        }

        if let Some(name) = name {
            let best = self
                .cache
                .find_by_name_fuzzy(organization_id, name, self.fuzzy_floor)
                .into_iter()
                .next();
            if let Some((c, confidence)) = best {
                return Ok(matched(c, confidence, MatchedBy::NameFuzzy));
            }
        }

        Ok(MatchResult::NotFound)
    }
}

fn matched(contact: Arc<Contact>, confidence: f64, matched_by: MatchedBy) -> MatchResult {
    MatchResult::Matched {
        contact,
        confidence,
        matched_by,
    }
}

fn non_blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
