//! Core domain model, in-memory opportunity store and filter engine for Grantboard.

use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "grantboard-core";

/// Identifier of a listing as it appears in the source document.
///
/// Numeric and textual ids are distinct: `1` and `"1"` never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpportunityId {
    Int(i64),
    Text(String),
}

impl OpportunityId {
    /// Interprets user-supplied text (URL segment, CLI argument) as an id,
    /// preferring the numeric form.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed.parse::<i64>() {
            Ok(n) => Self::Int(n),
            Err(_) => Self::Text(trimmed.to_string()),
        }
    }
}

impl FromStr for OpportunityId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for OpportunityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for OpportunityId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Category code carried by a listing. Unknown codes pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub String);

impl Category {
    pub const HEALTH: &'static str = "saude";
    pub const HUMAN_RIGHTS: &'static str = "direitos";
    pub const RESEARCH: &'static str = "pesquisa";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Short display label used on cards.
    pub fn label(&self) -> &str {
        match self.0.as_str() {
            Self::HEALTH => "Saúde",
            Self::HUMAN_RIGHTS => "Dir. Humanos",
            Self::RESEARCH => "Pesquisa",
            other => other,
        }
    }

    /// Upper-cased code used as the detail view heading tag.
    pub fn heading(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single funding/grant listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub title: String,
    pub org: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub deadline: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub saved: bool,
}

/// Which slice of the collection the user is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Saved,
    Category(String),
}

impl CategoryFilter {
    pub fn parse(input: &str) -> Self {
        match input {
            "" | "all" => Self::All,
            "saved" => Self::Saved,
            other => Self::Category(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Saved => "saved",
            Self::Category(code) => code,
        }
    }

    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        match self {
            Self::All => true,
            Self::Saved => opportunity.saved,
            Self::Category(code) => opportunity.category.code() == code,
        }
    }
}

impl FromStr for CategoryFilter {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for CategoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search text plus category selection for the running session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterState {
    pub search: String,
    pub category: CategoryFilter,
}

impl FilterState {
    pub fn new(search: impl Into<String>, category: CategoryFilter) -> Self {
        Self {
            search: search.into(),
            category,
        }
    }
}

/// Membership test for permanently hidden ids.
pub trait DiscardSet {
    fn is_discarded(&self, id: &OpportunityId) -> bool;
}

impl DiscardSet for HashSet<OpportunityId> {
    fn is_discarded(&self, id: &OpportunityId) -> bool {
        self.contains(id)
    }
}

impl DiscardSet for BTreeSet<OpportunityId> {
    fn is_discarded(&self, id: &OpportunityId) -> bool {
        self.contains(id)
    }
}

impl DiscardSet for [OpportunityId] {
    fn is_discarded(&self, id: &OpportunityId) -> bool {
        self.contains(id)
    }
}

/// Computes the visible subset of `records`, in source order.
///
/// Discarded ids are dropped first, then the search text is matched against
/// `title` and `org` ignoring case, then the category filter applies.
pub fn visible_opportunities<'a, D>(
    records: &'a [Opportunity],
    discarded: &D,
    filter: &FilterState,
) -> Vec<&'a Opportunity>
where
    D: DiscardSet + ?Sized,
{
    let needle = filter.search.to_lowercase();
    records
        .iter()
        .filter(|o| !discarded.is_discarded(&o.id))
        .filter(|o| matches_search(o, &needle))
        .filter(|o| filter.category.matches(o))
        .collect()
}

fn matches_search(opportunity: &Opportunity, needle_lower: &str) -> bool {
    needle_lower.is_empty()
        || opportunity.title.to_lowercase().contains(needle_lower)
        || opportunity.org.to_lowercase().contains(needle_lower)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("opportunity {0} not found")]
pub struct NotFound(pub OpportunityId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("duplicate opportunity id {0}")]
pub struct DuplicateId(pub OpportunityId);

/// Authoritative in-memory collection for one session.
#[derive(Debug, Clone, Default)]
pub struct OpportunityStore {
    records: Vec<Opportunity>,
}

impl OpportunityStore {
    pub fn new(records: Vec<Opportunity>) -> Result<Self, DuplicateId> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(&record.id) {
                return Err(DuplicateId(record.id.clone()));
            }
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[Opportunity] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn find_by_id(&self, id: &OpportunityId) -> Result<&Opportunity, NotFound> {
        self.records
            .iter()
            .find(|o| &o.id == id)
            .ok_or_else(|| NotFound(id.clone()))
    }

    /// Maps raw text (URL segment, CLI argument) to the id of a loaded record,
    /// trying the numeric form first and then the textual one.
    pub fn resolve(&self, raw: &str) -> Option<OpportunityId> {
        let raw = raw.trim();
        let numeric = raw.parse::<i64>().ok().map(OpportunityId::Int);
        let textual = OpportunityId::Text(raw.to_string());
        numeric
            .into_iter()
            .chain(std::iter::once(textual))
            .find(|id| self.records.iter().any(|o| &o.id == id))
    }

    fn find_mut(&mut self, id: &OpportunityId) -> Result<&mut Opportunity, NotFound> {
        self.records
            .iter_mut()
            .find(|o| &o.id == id)
            .ok_or_else(|| NotFound(id.clone()))
    }

    /// Flips the bookmark flag and returns its new value.
    pub fn toggle_saved(&mut self, id: &OpportunityId) -> Result<bool, NotFound> {
        let record = self.find_mut(id)?;
        record.saved = !record.saved;
        Ok(record.saved)
    }

    pub fn set_saved(&mut self, id: &OpportunityId, saved: bool) -> Result<(), NotFound> {
        self.find_mut(id)?.saved = saved;
        Ok(())
    }

    /// Number of bookmarked records, discarded or not.
    pub fn saved_count(&self) -> usize {
        self.records.iter().filter(|o| o.saved).count()
    }

    pub fn visible<D>(&self, discarded: &D, filter: &FilterState) -> Vec<&Opportunity>
    where
        D: DiscardSet + ?Sized,
    {
        visible_opportunities(&self.records, discarded, filter)
    }
}
