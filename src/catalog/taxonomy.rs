//! Authors, keywords and keyword categories, plus the aggregate views built
//! from them (popular keywords, trending papers, filter options).

use std::collections::HashMap;

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::{
    models::{Author, CategoryWithKeywords, Keyword, KeywordCategory, KeywordUsage, ResearchPaper},
    search::contains_pattern,
};

pub const POPULAR_KEYWORDS_DEFAULT: i64 = 20;
pub const TRENDING_DEFAULT: i64 = 10;
pub const LIST_LIMIT_MAX: i64 = 100;

/// Upper bound of `years_available` in filter options.
const FILTER_YEAR_MAX: i32 = 2025;

const REGION_PATTERNS: &[&str] = &[
    "africa",
    "asia",
    "india",
    "europe",
    "america",
    "australia",
    "brazil",
    "china",
    "usa",
    "uk",
    "canada",
    "mexico",
    "north america",
    "south america",
    "latin america",
    "middle east",
    "southeast asia",
    "east asia",
];

/// `?limit=` parsed leniently and capped.
pub fn parse_limit(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(default)
        .min(LIST_LIMIT_MAX)
}

fn name_pattern(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|name| !name.is_empty())
        .map(contains_pattern)
}

pub async fn list_authors(
    conn: &mut SqliteConnection,
    name: Option<&str>,
) -> Result<Vec<Author>, sqlx::Error> {
    match name_pattern(name) {
        Some(pattern) => {
            sqlx::query_as::<_, Author>("SELECT * FROM authors WHERE name REGEXP ? ORDER BY name")
                .bind(pattern)
                .fetch_all(conn)
                .await
        }
        None => {
            sqlx::query_as::<_, Author>("SELECT * FROM authors ORDER BY name")
                .fetch_all(conn)
                .await
        }
    }
}

/// `None` when an author with that name already exists.
pub async fn create_author(
    conn: &mut SqliteConnection,
    name: &str,
    affiliation: &str,
    email: Option<&str>,
) -> Result<Option<Author>, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO authors (name, affiliation, email) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
    )
    .bind(name)
    .bind(affiliation)
    .bind(email)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    sqlx::query_as::<_, Author>("SELECT * FROM authors WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_optional(conn)
        .await
}

pub async fn list_keywords(
    conn: &mut SqliteConnection,
    name: Option<&str>,
) -> Result<Vec<Keyword>, sqlx::Error> {
    match name_pattern(name) {
        Some(pattern) => {
            sqlx::query_as::<_, Keyword>("SELECT * FROM keywords WHERE name REGEXP ? ORDER BY name")
                .bind(pattern)
                .fetch_all(conn)
                .await
        }
        None => {
            sqlx::query_as::<_, Keyword>("SELECT * FROM keywords ORDER BY name")
                .fetch_all(conn)
                .await
        }
    }
}

pub async fn create_keyword(
    conn: &mut SqliteConnection,
    name: &str,
    category_id: Option<i64>,
) -> Result<Option<Keyword>, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO keywords (name, category_id) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
    )
    .bind(name.trim().to_lowercase())
    .bind(category_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    sqlx::query_as::<_, Keyword>("SELECT * FROM keywords WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_optional(conn)
        .await
}

pub async fn find_category(
    conn: &mut SqliteConnection,
    category_id: i64,
) -> Result<Option<KeywordCategory>, sqlx::Error> {
    sqlx::query_as::<_, KeywordCategory>("SELECT * FROM keyword_categories WHERE id = ?")
        .bind(category_id)
        .fetch_optional(conn)
        .await
}

pub async fn create_category(
    conn: &mut SqliteConnection,
    name: &str,
    description: &str,
) -> Result<Option<KeywordCategory>, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO keyword_categories (name, description) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
    )
    .bind(name)
    .bind(description)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    find_category(conn, result.last_insert_rowid()).await
}

pub async fn category_keywords(
    conn: &mut SqliteConnection,
    category_id: i64,
) -> Result<Vec<Keyword>, sqlx::Error> {
    sqlx::query_as::<_, Keyword>("SELECT * FROM keywords WHERE category_id = ? ORDER BY name")
        .bind(category_id)
        .fetch_all(conn)
        .await
}

/// Every category, by name, with its keywords.
pub async fn categories_with_keywords(
    conn: &mut SqliteConnection,
) -> Result<Vec<CategoryWithKeywords>, sqlx::Error> {
    let categories =
        sqlx::query_as::<_, KeywordCategory>("SELECT * FROM keyword_categories ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;
    let keywords = sqlx::query_as::<_, Keyword>(
        "SELECT * FROM keywords WHERE category_id IS NOT NULL ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut by_category: HashMap<i64, Vec<Keyword>> = HashMap::new();
    for keyword in keywords {
        if let Some(category_id) = keyword.category_id {
            by_category.entry(category_id).or_default().push(keyword);
        }
    }

    Ok(categories
        .into_iter()
        .map(|category| CategoryWithKeywords {
            keywords: by_category.remove(&category.id).unwrap_or_default(),
            category,
        })
        .collect())
}

pub async fn popular_keywords(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<KeywordUsage>, sqlx::Error> {
    sqlx::query_as::<_, KeywordUsage>(
        r#"
        SELECT k.id, k.name, k.category_id, COUNT(pk.paper_id) AS paper_count
        FROM keywords k
        LEFT JOIN paper_keywords pk ON pk.keyword_id = k.id
        GROUP BY k.id
        ORDER BY paper_count DESC, k.name ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
}

pub async fn trending_papers(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<ResearchPaper>, sqlx::Error> {
    sqlx::query_as::<_, ResearchPaper>(
        r#"
        SELECT * FROM research_papers
        WHERE citation_trend = 'increasing'
        ORDER BY citation_count DESC, publication_year DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
}

#[derive(Debug, Serialize)]
pub struct KeywordRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Serialize)]
pub struct FilterStats {
    pub total_papers: i64,
    pub total_regions: usize,
    pub total_general_keywords: usize,
}

#[derive(Debug, Serialize)]
pub struct FilterOptions {
    pub methodology_types: Vec<String>,
    pub year_range: YearRange,
    pub years_available: Vec<i32>,
    pub keyword_categories: Vec<CategoryWithKeywords>,
    pub region_keywords: Vec<KeywordRef>,
    pub general_keywords: Vec<KeywordRef>,
    pub stats: FilterStats,
}

/// Matches whole words against the region list. This is stricter than a
/// plain substring test, which would count "causal inference" as "usa".
pub fn is_region_keyword(name: &str) -> bool {
    let words: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let padded = format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "));
    REGION_PATTERNS
        .iter()
        .any(|region| padded.contains(&format!(" {region} ")))
}

pub async fn filter_options(conn: &mut SqliteConnection) -> Result<FilterOptions, sqlx::Error> {
    let methodology_types: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT methodology_type FROM research_papers \
         WHERE methodology_type <> '' AND methodology_type <> 'Unknown' \
         ORDER BY methodology_type",
    )
    .fetch_all(&mut *conn)
    .await?;

    let years: Vec<(i32,)> = sqlx::query_as(
        "SELECT DISTINCT publication_year FROM research_papers \
         WHERE publication_year BETWEEN ? AND ? ORDER BY publication_year",
    )
    .bind(super::YEAR_MIN)
    .bind(FILTER_YEAR_MAX)
    .fetch_all(&mut *conn)
    .await?;

    let keywords = sqlx::query_as::<_, Keyword>("SELECT * FROM keywords ORDER BY name")
        .fetch_all(&mut *conn)
        .await?;

    let (total_papers,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM research_papers")
        .fetch_one(&mut *conn)
        .await?;

    let keyword_categories = categories_with_keywords(conn).await?;

    let (region_keywords, general_keywords): (Vec<_>, Vec<_>) = keywords
        .into_iter()
        .map(|keyword| KeywordRef {
            id: keyword.id,
            name: keyword.name,
        })
        .partition(|keyword| is_region_keyword(&keyword.name));

    Ok(FilterOptions {
        methodology_types: methodology_types.into_iter().map(|(m,)| m).collect(),
        year_range: YearRange {
            min: super::YEAR_MIN,
            max: FILTER_YEAR_MAX,
        },
        years_available: years.into_iter().map(|(year,)| year).collect(),
        keyword_categories,
        stats: FilterStats {
            total_papers,
            total_regions: region_keywords.len(),
            total_general_keywords: general_keywords.len(),
        },
        region_keywords,
        general_keywords,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(parse_limit(None, POPULAR_KEYWORDS_DEFAULT), 20);
        assert_eq!(parse_limit(Some("abc"), TRENDING_DEFAULT), 10);
        assert_eq!(parse_limit(Some("-3"), TRENDING_DEFAULT), 10);
        assert_eq!(parse_limit(Some("5000"), TRENDING_DEFAULT), LIST_LIMIT_MAX);
        assert_eq!(parse_limit(Some("7"), TRENDING_DEFAULT), 7);
    }

    #[test]
    fn region_detection_matches_whole_words() {
        assert!(is_region_keyword("Sub-Saharan Africa"));
        assert!(is_region_keyword("latin america"));
        assert!(!is_region_keyword("soil health"));
        assert!(!is_region_keyword("causal inference"));
    }
}
