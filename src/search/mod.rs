//! Query composition for paper and forum listings.
//!
//! Each listing turns loosely-typed query-string parameters into a filter value
//! (dropping anything malformed), then renders that value into one
//! parameterised SQL statement with `QueryBuilder`. Tag filters in "all" mode
//! add one join per tag, so every listing selects `DISTINCT` rows.

pub mod pagination;
pub mod papers;
pub mod posts;

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

pub use pagination::{PageInfo, PageRequest, Paginated};
pub use papers::{PaperFilters, PaperListParams, PaperSort, RELATED_LIMIT, related_papers, search_papers};
pub use posts::{PostFilters, PostListParams, search_posts};

/// Per-field weights for paper text ranking, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    pub title: f64,
    pub abstract_text: f64,
    pub people_and_keywords: f64,
    pub journal: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            title: 1.0,
            abstract_text: 0.4,
            people_and_keywords: 0.2,
            journal: 0.1,
        }
    }
}

/// How a multi-valued tag or keyword filter combines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TagLogic {
    #[default]
    Any,
    All,
}

impl TagLogic {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("and") | Some("all") => Self::All,
            _ => Self::Any,
        }
    }
}

/// Case-insensitive substring pattern for SQLite `REGEXP`.
///
/// SQLite's `lower()` and `LIKE` only fold ASCII, so matching goes through
/// the `regex` crate, which folds the full Unicode range on both sides.
pub(crate) fn contains_pattern(term: &str) -> String {
    format!("(?i){}", regex::escape(term))
}

fn push_bind_list(qb: &mut QueryBuilder<'_, Sqlite>, values: &[String]) {
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
}

/// Trimmed, lower-cased, non-empty, first occurrence wins.
pub(crate) fn normalize_names<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for value in values {
        let name = value.trim().to_lowercase();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn non_empty(raw: Option<&String>) -> Option<String> {
    raw.map(|value| value.trim())
        .filter(|value| !value.is_empty() && *value != "undefined" && *value != "null")
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_pattern_folds_case_and_escapes_metacharacters() {
        let pattern = regex::Regex::new(&contains_pattern("économie (rurale)")).expect("regex");
        assert!(pattern.is_match("Revue d'ÉCONOMIE (Rurale) 12"));
        assert!(!pattern.is_match("economie rurale"));

        let literal = regex::Regex::new(&contains_pattern("100%.*")).expect("regex");
        assert!(literal.is_match("a 100%.* yield"));
        assert!(!literal.is_match("100% yield"));
    }

    #[test]
    fn tag_logic_defaults_to_any() {
        assert_eq!(TagLogic::parse(None), TagLogic::Any);
        assert_eq!(TagLogic::parse(Some("or")), TagLogic::Any);
        assert_eq!(TagLogic::parse(Some("AND")), TagLogic::All);
    }

    #[test]
    fn names_are_normalised_and_deduplicated() {
        assert_eq!(
            normalize_names([" Soil ", "soil", "", "Water"]),
            vec!["soil".to_string(), "water".to_string()]
        );
    }

    #[test]
    fn default_weights_are_strictly_ordered() {
        let w = SearchWeights::default();
        assert!(w.title > w.abstract_text);
        assert!(w.abstract_text > w.people_and_keywords);
        assert!(w.people_and_keywords > w.journal);
    }
}
