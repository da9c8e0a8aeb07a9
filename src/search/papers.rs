use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{
    PageInfo, PageRequest, SearchWeights, TagLogic, contains_pattern, non_empty, normalize_names,
    push_bind_list,
};
use crate::{
    catalog::{YEAR_MAX, YEAR_MIN},
    models::{RankedPaper, RelatedPaper},
};

pub const RELATED_LIMIT: i64 = 5;

/// Raw query string of `GET /api/research/papers/`.
#[derive(Debug, Default, Deserialize)]
pub struct PaperListParams {
    pub q: Option<String>,
    #[serde(default)]
    pub keyword: Vec<String>,
    #[serde(default)]
    pub author: Vec<String>,
    #[serde(default)]
    pub methodology_type: Vec<String>,
    pub min_citations: Option<String>,
    pub max_citations: Option<String>,
    pub year_from: Option<String>,
    pub year_to: Option<String>,
    pub journal: Option<String>,
    pub sort: Option<String>,
    pub keyword_logic: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl PaperListParams {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::from_params(self.page.as_deref(), self.page_size.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperSort {
    Relevance,
    DateNewest,
    DateOldest,
    CitationsHigh,
    CitationsLow,
    TitleAsc,
    TitleDesc,
    Default,
}

impl PaperSort {
    /// Relevance only applies when there is text to rank against.
    pub fn parse(raw: Option<&str>, has_text_query: bool) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("relevance") if has_text_query => Self::Relevance,
            Some("date_newest") => Self::DateNewest,
            Some("date_oldest") => Self::DateOldest,
            Some("citations_high") => Self::CitationsHigh,
            Some("citations_low") => Self::CitationsLow,
            Some("title_asc") => Self::TitleAsc,
            Some("title_desc") => Self::TitleDesc,
            _ => Self::Default,
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::Relevance => {
                "rank DESC, p.publication_year DESC, p.created_at DESC, p.id ASC"
            }
            Self::DateNewest => "p.publication_year DESC, p.id ASC",
            Self::DateOldest => "p.publication_year ASC, p.id ASC",
            Self::CitationsHigh => "p.citation_count DESC, p.id ASC",
            Self::CitationsLow => "p.citation_count ASC, p.id ASC",
            Self::TitleAsc => "p.title COLLATE NOCASE ASC, p.id ASC",
            Self::TitleDesc => "p.title COLLATE NOCASE DESC, p.id ASC",
            Self::Default => "p.publication_year DESC, p.created_at DESC, p.id ASC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperFilters {
    pub terms: Vec<String>,
    pub keywords: Vec<String>,
    pub keyword_logic: TagLogic,
    pub authors: Vec<String>,
    pub methodology_types: Vec<String>,
    pub min_citations: Option<i64>,
    pub max_citations: Option<i64>,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
    pub journal: Option<String>,
    pub sort: PaperSort,
}

impl PaperFilters {
    pub fn from_params(params: &PaperListParams) -> Self {
        let terms = params
            .q
            .as_deref()
            .map(|q| normalize_names(q.split_whitespace()))
            .unwrap_or_default();

        let authors = params
            .author
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect();

        let methodology_types = params
            .methodology_type
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect();

        let sort = PaperSort::parse(params.sort.as_deref(), !terms.is_empty());

        Self {
            keywords: normalize_names(params.keyword.iter().map(String::as_str)),
            keyword_logic: TagLogic::parse(params.keyword_logic.as_deref()),
            authors,
            methodology_types,
            min_citations: parse_citations(params.min_citations.as_ref()),
            max_citations: parse_citations(params.max_citations.as_ref()),
            year_from: parse_year(params.year_from.as_ref()),
            year_to: parse_year(params.year_to.as_ref()),
            journal: non_empty(params.journal.as_ref()),
            terms,
            sort,
        }
    }

    fn requires_every_keyword(&self) -> bool {
        self.keyword_logic == TagLogic::All && self.keywords.len() > 1
    }
}

/// A year in the supported range, or nothing.
pub fn parse_year(raw: Option<&String>) -> Option<i32> {
    non_empty(raw)
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|year| (YEAR_MIN..=YEAR_MAX).contains(year))
}

fn parse_citations(raw: Option<&String>) -> Option<i64> {
    non_empty(raw)
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|count| *count >= 0)
}

#[derive(Debug, Clone, Copy)]
enum TextField {
    Title,
    Abstract,
    Authors,
    Keywords,
    Journal,
}

const TEXT_FIELDS: [TextField; 5] = [
    TextField::Title,
    TextField::Abstract,
    TextField::Authors,
    TextField::Keywords,
    TextField::Journal,
];

impl TextField {
    fn weight(self, weights: &SearchWeights) -> f64 {
        match self {
            Self::Title => weights.title,
            Self::Abstract => weights.abstract_text,
            Self::Authors | Self::Keywords => weights.people_and_keywords,
            Self::Journal => weights.journal,
        }
    }

    fn push_match(self, qb: &mut QueryBuilder<'_, Sqlite>, pattern: &str) {
        match self {
            Self::Title => {
                qb.push("p.title REGEXP ").push_bind(pattern.to_string());
            }
            Self::Abstract => {
                qb.push("p.abstract REGEXP ").push_bind(pattern.to_string());
            }
            Self::Journal => {
                qb.push("p.journal REGEXP ").push_bind(pattern.to_string());
            }
            Self::Authors => {
                qb.push(
                    "EXISTS (SELECT 1 FROM paper_authors ta JOIN authors a ON a.id = ta.author_id \
                     WHERE ta.paper_id = p.id AND a.name REGEXP ",
                );
                qb.push_bind(pattern.to_string()).push(")");
            }
            Self::Keywords => {
                qb.push(
                    "EXISTS (SELECT 1 FROM paper_keywords tk JOIN keywords kw ON kw.id = tk.keyword_id \
                     WHERE tk.paper_id = p.id AND kw.name REGEXP ",
                );
                qb.push_bind(pattern.to_string()).push(")");
            }
        }
    }
}

/// `FROM ... WHERE ...` shared by the count and the page query.
fn push_scope(qb: &mut QueryBuilder<'_, Sqlite>, filters: &PaperFilters) {
    qb.push(" FROM research_papers p");

    if filters.requires_every_keyword() {
        for (idx, keyword) in filters.keywords.iter().enumerate() {
            qb.push(format!(
                " JOIN paper_keywords pk{idx} ON pk{idx}.paper_id = p.id \
                 JOIN keywords k{idx} ON k{idx}.id = pk{idx}.keyword_id AND k{idx}.name = "
            ));
            qb.push_bind(keyword.clone());
        }
    } else if !filters.keywords.is_empty() {
        qb.push(
            " JOIN paper_keywords pk ON pk.paper_id = p.id \
             JOIN keywords k ON k.id = pk.keyword_id AND k.name IN (",
        );
        push_bind_list(qb, &filters.keywords);
        qb.push(")");
    }

    qb.push(" WHERE 1 = 1");

    for term in &filters.terms {
        let pattern = contains_pattern(term);
        qb.push(" AND (");
        for (idx, field) in TEXT_FIELDS.iter().enumerate() {
            if idx > 0 {
                qb.push(" OR ");
            }
            field.push_match(qb, &pattern);
        }
        qb.push(")");
    }

    if !filters.authors.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM paper_authors fa JOIN authors fa_a ON fa_a.id = fa.author_id \
             WHERE fa.paper_id = p.id AND fa_a.name IN (",
        );
        push_bind_list(qb, &filters.authors);
        qb.push("))");
    }

    if !filters.methodology_types.is_empty() {
        qb.push(" AND p.methodology_type IN (");
        push_bind_list(qb, &filters.methodology_types);
        qb.push(")");
    }

    if let Some(min) = filters.min_citations {
        qb.push(" AND p.citation_count >= ").push_bind(min);
    }
    if let Some(max) = filters.max_citations {
        qb.push(" AND p.citation_count <= ").push_bind(max);
    }
    if let Some(from) = filters.year_from {
        qb.push(" AND p.publication_year >= ").push_bind(from);
    }
    if let Some(to) = filters.year_to {
        qb.push(" AND p.publication_year <= ").push_bind(to);
    }
    if let Some(journal) = &filters.journal {
        qb.push(" AND p.journal REGEXP ")
            .push_bind(contains_pattern(journal));
    }
}

/// Sum of field weights hit by each term; zero without a text query.
fn push_rank(qb: &mut QueryBuilder<'_, Sqlite>, filters: &PaperFilters, weights: &SearchWeights) {
    if filters.terms.is_empty() {
        qb.push("CAST(0 AS REAL)");
        return;
    }

    qb.push("CAST((");
    let mut first = true;
    for term in &filters.terms {
        let pattern = contains_pattern(term);
        for field in TEXT_FIELDS {
            if !first {
                qb.push(" + ");
            }
            first = false;
            qb.push("CASE WHEN ");
            field.push_match(qb, &pattern);
            qb.push(" THEN ").push_bind(field.weight(weights)).push(" ELSE 0.0 END");
        }
    }
    qb.push(") AS REAL)");
}

/// One page of papers matching `filters`, plus the page it landed on.
pub async fn search_papers(
    conn: &mut SqliteConnection,
    filters: &PaperFilters,
    page: PageRequest,
    weights: &SearchWeights,
) -> Result<(Vec<RankedPaper>, PageInfo), sqlx::Error> {
    let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT p.id)");
    push_scope(&mut count_qb, filters);
    let (total,): (i64,) = count_qb.build_query_as().fetch_one(&mut *conn).await?;

    let info = page.resolve(total);

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT p.*, ");
    push_rank(&mut qb, filters, weights);
    qb.push(" AS rank");
    push_scope(&mut qb, filters);
    qb.push(" ORDER BY ").push(filters.sort.order_by());
    qb.push(" LIMIT ").push_bind(info.page_size);
    qb.push(" OFFSET ").push_bind(info.offset());

    let papers = qb
        .build_query_as::<RankedPaper>()
        .fetch_all(&mut *conn)
        .await?;

    Ok((papers, info))
}

/// Papers sharing at least one keyword with `paper_id`, most overlap first.
pub async fn related_papers(
    conn: &mut SqliteConnection,
    paper_id: i64,
) -> Result<Vec<RelatedPaper>, sqlx::Error> {
    sqlx::query_as::<_, RelatedPaper>(
        r#"
        SELECT p.*, COUNT(pk.keyword_id) AS matching_keywords
        FROM research_papers p
        JOIN paper_keywords pk ON pk.paper_id = p.id
        WHERE pk.keyword_id IN (SELECT keyword_id FROM paper_keywords WHERE paper_id = ?)
          AND p.id <> ?
        GROUP BY p.id
        ORDER BY matching_keywords DESC, p.publication_year DESC, p.id ASC
        LIMIT ?
        "#,
    )
    .bind(paper_id)
    .bind(paper_id)
    .bind(RELATED_LIMIT)
    .fetch_all(conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> PaperListParams {
        let mut params = PaperListParams::default();
        for (key, value) in pairs {
            let value = value.to_string();
            match *key {
                "q" => params.q = Some(value),
                "keyword" => params.keyword.push(value),
                "author" => params.author.push(value),
                "min_citations" => params.min_citations = Some(value),
                "max_citations" => params.max_citations = Some(value),
                "year_from" => params.year_from = Some(value),
                "year_to" => params.year_to = Some(value),
                "sort" => params.sort = Some(value),
                "keyword_logic" => params.keyword_logic = Some(value),
                "journal" => params.journal = Some(value),
                _ => {}
            }
        }
        params
    }

    #[test]
    fn malformed_ranges_are_dropped() {
        let filters = PaperFilters::from_params(&params(&[
            ("year_from", "undefined"),
            ("year_to", "1850"),
            ("min_citations", "-4"),
            ("max_citations", "lots"),
        ]));
        assert_eq!(filters.year_from, None);
        assert_eq!(filters.year_to, None);
        assert_eq!(filters.min_citations, None);
        assert_eq!(filters.max_citations, None);
    }

    #[test]
    fn valid_ranges_are_kept() {
        let filters = PaperFilters::from_params(&params(&[
            ("year_from", "2010"),
            ("year_to", " 2020 "),
            ("min_citations", "5"),
        ]));
        assert_eq!(filters.year_from, Some(2010));
        assert_eq!(filters.year_to, Some(2020));
        assert_eq!(filters.min_citations, Some(5));
    }

    #[test]
    fn relevance_needs_a_query() {
        assert_eq!(PaperSort::parse(None, true), PaperSort::Relevance);
        assert_eq!(PaperSort::parse(Some("relevance"), false), PaperSort::Default);
        assert_eq!(PaperSort::parse(Some("title_desc"), true), PaperSort::TitleDesc);
        assert_eq!(PaperSort::parse(Some("bogus"), false), PaperSort::Default);
    }

    #[test]
    fn single_keyword_never_uses_per_keyword_joins() {
        let filters = PaperFilters::from_params(&params(&[
            ("keyword", "Soil"),
            ("keyword_logic", "and"),
        ]));
        assert_eq!(filters.keywords, vec!["soil".to_string()]);
        assert!(!filters.requires_every_keyword());

        let filters = PaperFilters::from_params(&params(&[
            ("keyword", "soil"),
            ("keyword", "water"),
            ("keyword_logic", "and"),
        ]));
        assert!(filters.requires_every_keyword());
    }

    #[test]
    fn and_mode_renders_one_join_per_keyword() {
        let filters = PaperFilters::from_params(&params(&[
            ("keyword", "soil"),
            ("keyword", "water"),
            ("keyword", "policy"),
            ("keyword_logic", "and"),
        ]));
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT p.id)");
        push_scope(&mut qb, &filters);
        let sql = qb.sql();
        assert_eq!(sql.matches("JOIN paper_keywords pk").count(), 3);
        assert!(sql.contains("k2.name = ?"));
    }

    #[test]
    fn text_terms_search_every_field() {
        let filters = PaperFilters::from_params(&params(&[("q", "Soil carbon")]));
        assert_eq!(filters.terms, vec!["soil".to_string(), "carbon".to_string()]);

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT p.*, ");
        push_rank(&mut qb, &filters, &SearchWeights::default());
        let sql = qb.sql();
        assert_eq!(sql.matches("CASE WHEN").count(), 10);
    }
}
