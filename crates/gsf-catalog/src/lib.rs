//! Display-side catalog filtering and ordering.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use gsf_core::{Scheme, SchemeStatus};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gsf-catalog";

/// User-chosen display filters. `None`, an empty string, and the literal
/// `all` are wildcards that pass everything through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFilter {
    pub category: Option<String>,
    pub funding_type: Option<String>,
    pub status: Option<String>,
}

impl CatalogFilter {
    /// Filter then order for display. The input is never mutated; the
    /// result is a fresh sequence.
    pub fn apply(&self, schemes: &[Scheme], today: NaiveDate) -> Vec<Scheme> {
        let mut out: Vec<Scheme> = schemes
            .iter()
            .filter(|scheme| self.matches(scheme, today))
            .cloned()
            .collect();
        sort_for_display(&mut out, today);
        out
    }

    fn matches(&self, scheme: &Scheme, today: NaiveDate) -> bool {
        if let Some(needle) = active(self.category.as_deref()) {
            if !scheme
                .focus_areas
                .iter()
                .any(|area| contains_word_prefix(area, needle))
            {
                return false;
            }
        }
        if let Some(needle) = active(self.funding_type.as_deref()) {
            if !contains_word_prefix(&scheme.funding_type, needle) {
                return false;
            }
        }
        if let Some(needle) = active(self.status.as_deref()) {
            if !contains_word_prefix(scheme.status_on(today).as_str(), needle) {
                return false;
            }
        }
        true
    }
}

fn active(value: Option<&str>) -> Option<&str> {
    let value = value?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(value)
    }
}

/// Case-insensitive containment where the needle must begin at the start
/// of a word in the haystack: `edu` matches `Higher Education`, `cation`
/// does not.
pub fn contains_word_prefix(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let haystack = haystack.to_lowercase();
    let needle = needle.to_lowercase();

    let mut start = 0;
    while let Some(found) = haystack[start..].find(&needle) {
        let at = start + found;
        let on_boundary = haystack[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        if on_boundary {
            return true;
        }
        start = at + haystack[at..].chars().next().map_or(1, |c| c.len_utf8());
    }
    false
}

/// Stable display ordering: open schemes before everything else, then
/// ascending deadline; schemes without a parsable deadline go last within
/// their status group rather than floating on an undefined comparison.
pub fn sort_for_display(schemes: &mut [Scheme], today: NaiveDate) {
    schemes.sort_by_key(|scheme| {
        let open = scheme.status_on(today) == SchemeStatus::Open;
        (!open, scheme.deadline.is_none(), scheme.deadline)
    });
}

/// Distinct filter options for display dropdowns, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FacetOptions {
    pub categories: Vec<String>,
    pub funding_types: Vec<String>,
    pub statuses: Vec<String>,
}

pub fn facet_options(schemes: &[Scheme], today: NaiveDate) -> FacetOptions {
    let mut categories = BTreeSet::new();
    let mut funding_types = BTreeSet::new();
    let mut statuses = BTreeSet::new();
    for scheme in schemes {
        for area in &scheme.focus_areas {
            if !area.is_empty() {
                categories.insert(area.clone());
            }
        }
        if !scheme.funding_type.is_empty() {
            funding_types.insert(scheme.funding_type.clone());
        }
        statuses.insert(scheme.status_on(today).to_string());
    }
    FacetOptions {
        categories: categories.into_iter().collect(),
        funding_types: funding_types.into_iter().collect(),
        statuses: statuses.into_iter().collect(),
    }
}
