//! Research paper storage: validation, slugs, author/keyword links and the
//! hydration of listing rows into full responses.

pub mod taxonomy;

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    error::ValidationErrors,
    models::{
        Author, AuthorInput, CitationTrend, Keyword, KeywordInput, PaperInput, PaperResponse,
        ResearchPaper,
    },
};

pub const TITLE_MAX: usize = 255;
pub const METHODOLOGY_MAX: usize = 50;
pub const YEAR_MIN: i32 = 1900;
pub const YEAR_MAX: i32 = 2100;

/// Lower-case ASCII words joined by `-`; never empty.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("paper");
    }
    slug
}

/// `slugify(title)`, suffixed `-2`, `-3`, ... until no paper uses it.
pub async fn unique_slug(conn: &mut SqliteConnection, title: &str) -> Result<String, sqlx::Error> {
    let base = slugify(title);
    let mut candidate = base.clone();
    let mut suffix = 2;
    loop {
        let taken: Option<(i64,)> = sqlx::query_as("SELECT id FROM research_papers WHERE slug = ?")
            .bind(&candidate)
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_none() {
            return Ok(candidate);
        }
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
}

/// Column values for an insert or update, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperDraft {
    pub title: String,
    pub abstract_text: String,
    pub publication_year: i32,
    pub journal: String,
    pub doi: Option<String>,
    pub url: String,
    pub methodology_type: String,
    pub citation_count: i64,
    pub citation_trend: CitationTrend,
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|v| v.trim().to_string())
}

/// Checks `input` and merges it over `current` for updates.
///
/// With `partial` unset, title, abstract and publication year must be present
/// even when updating; other omitted fields keep their current values.
pub fn validate_paper(
    input: &PaperInput,
    current: Option<&ResearchPaper>,
    partial: bool,
) -> Result<PaperDraft, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let fallback = if partial { current } else { None };

    let title = trimmed(&input.title).or_else(|| fallback.map(|p| p.title.clone()));
    match title.as_deref() {
        None => errors.add("title", "This field is required."),
        Some("") => errors.add("title", "This field may not be blank."),
        Some(title) if title.chars().count() > TITLE_MAX => {
            errors.add("title", "Ensure this field has no more than 255 characters.")
        }
        Some(_) => {}
    }

    let abstract_text =
        trimmed(&input.abstract_text).or_else(|| fallback.map(|p| p.abstract_text.clone()));
    match abstract_text.as_deref() {
        None => errors.add("abstract", "This field is required."),
        Some("") => errors.add("abstract", "This field may not be blank."),
        Some(_) => {}
    }

    let year = input
        .publication_year
        .or_else(|| fallback.map(|p| i64::from(p.publication_year)));
    match year {
        None => errors.add("publication_year", "This field is required."),
        Some(year) if !(i64::from(YEAR_MIN)..=i64::from(YEAR_MAX)).contains(&year) => errors.add(
            "publication_year",
            format!("Publication year must be between {YEAR_MIN} and {YEAR_MAX}."),
        ),
        Some(_) => {}
    }

    let methodology_type = trimmed(&input.methodology_type)
        .or_else(|| current.map(|p| p.methodology_type.clone()))
        .unwrap_or_default();
    if methodology_type.chars().count() > METHODOLOGY_MAX {
        errors.add(
            "methodology_type",
            "Ensure this field has no more than 50 characters.",
        );
    }

    let citation_count = input
        .citation_count
        .or_else(|| current.map(|p| p.citation_count))
        .unwrap_or(0);
    if citation_count < 0 {
        errors.add("citation_count", "Citation count cannot be negative.");
    }

    let citation_trend = match &input.citation_trend {
        Some(raw) => CitationTrend::parse(raw).unwrap_or_else(|| {
            errors.add("citation_trend", format!("\"{raw}\" is not a valid choice."));
            CitationTrend::default()
        }),
        None => current
            .and_then(|p| CitationTrend::parse(&p.citation_trend))
            .unwrap_or_default(),
    };

    if let Some(authors) = &input.authors {
        if authors.iter().any(|author| author.name().trim().is_empty()) {
            errors.add("authors", "Author name may not be blank.");
        }
    }
    if let Some(keywords) = &input.keywords {
        if keywords.iter().any(|keyword| keyword.name().trim().is_empty()) {
            errors.add("keywords", "Keyword name may not be blank.");
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let doi = match &input.doi {
        Some(doi) => Some(doi.trim().to_string()).filter(|doi| !doi.is_empty()),
        None => current.and_then(|p| p.doi.clone()),
    };

    Ok(PaperDraft {
        title: title.unwrap_or_default(),
        abstract_text: abstract_text.unwrap_or_default(),
        publication_year: year
            .and_then(|year| i32::try_from(year).ok())
            .unwrap_or(YEAR_MIN),
        journal: trimmed(&input.journal)
            .or_else(|| current.map(|p| p.journal.clone()))
            .unwrap_or_default(),
        doi,
        url: trimmed(&input.url)
            .or_else(|| current.map(|p| p.url.clone()))
            .unwrap_or_default(),
        methodology_type,
        citation_count,
        citation_trend,
    })
}

pub async fn find_paper_by_slug(
    conn: &mut SqliteConnection,
    slug: &str,
) -> Result<Option<ResearchPaper>, sqlx::Error> {
    sqlx::query_as::<_, ResearchPaper>("SELECT * FROM research_papers WHERE slug = ?")
        .bind(slug)
        .fetch_optional(conn)
        .await
}

async fn find_paper(conn: &mut SqliteConnection, id: i64) -> Result<ResearchPaper, sqlx::Error> {
    sqlx::query_as::<_, ResearchPaper>("SELECT * FROM research_papers WHERE id = ?")
        .bind(id)
        .fetch_one(conn)
        .await
}

/// Reuses an author with the same name; details only apply to new rows.
pub async fn get_or_create_author(
    conn: &mut SqliteConnection,
    input: &AuthorInput,
) -> Result<i64, sqlx::Error> {
    let (affiliation, email) = match input {
        AuthorInput::Name(_) => (String::new(), None),
        AuthorInput::Detailed {
            affiliation, email, ..
        } => (affiliation.clone().unwrap_or_default(), email.clone()),
    };
    let name = input.name().trim();

    sqlx::query(
        "INSERT INTO authors (name, affiliation, email) VALUES (?, ?, ?) \
         ON CONFLICT(name) DO NOTHING",
    )
    .bind(name)
    .bind(affiliation)
    .bind(email)
    .execute(&mut *conn)
    .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM authors WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Keyword names are stored trimmed and lower-cased.
pub async fn get_or_create_keyword(
    conn: &mut SqliteConnection,
    name: &str,
    category_id: Option<i64>,
) -> Result<i64, sqlx::Error> {
    let name = name.trim().to_lowercase();

    sqlx::query("INSERT INTO keywords (name, category_id) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
        .bind(&name)
        .bind(category_id)
        .execute(&mut *conn)
        .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM keywords WHERE name = ?")
        .bind(&name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn replace_authors(
    conn: &mut SqliteConnection,
    paper_id: i64,
    authors: &[AuthorInput],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM paper_authors WHERE paper_id = ?")
        .bind(paper_id)
        .execute(&mut *conn)
        .await?;

    for author in authors {
        let author_id = get_or_create_author(conn, author).await?;
        sqlx::query(
            "INSERT INTO paper_authors (paper_id, author_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(paper_id)
        .bind(author_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn replace_keywords(
    conn: &mut SqliteConnection,
    paper_id: i64,
    keywords: &[KeywordInput],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM paper_keywords WHERE paper_id = ?")
        .bind(paper_id)
        .execute(&mut *conn)
        .await?;

    for keyword in keywords {
        let keyword_id = get_or_create_keyword(conn, keyword.name(), None).await?;
        sqlx::query(
            "INSERT INTO paper_keywords (paper_id, keyword_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(paper_id)
        .bind(keyword_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Inserts a paper and its links. Run inside a transaction.
pub async fn create_paper(
    conn: &mut SqliteConnection,
    draft: &PaperDraft,
    authors: &[AuthorInput],
    keywords: &[KeywordInput],
) -> Result<ResearchPaper, sqlx::Error> {
    let slug = unique_slug(conn, &draft.title).await?;
    let now = Utc::now();

    let result = sqlx::query(
        r#"INSERT INTO research_papers
           (title, slug, abstract, publication_year, journal, doi, url, methodology_type,
            citation_count, citation_trend, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&draft.title)
    .bind(&slug)
    .bind(&draft.abstract_text)
    .bind(draft.publication_year)
    .bind(&draft.journal)
    .bind(&draft.doi)
    .bind(&draft.url)
    .bind(&draft.methodology_type)
    .bind(draft.citation_count)
    .bind(draft.citation_trend.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let paper_id = result.last_insert_rowid();
    replace_authors(conn, paper_id, authors).await?;
    replace_keywords(conn, paper_id, keywords).await?;

    tracing::info!(paper_id, slug = %slug, "created research paper");
    find_paper(conn, paper_id).await
}

/// Rewrites the paper's columns; links are replaced only when given.
/// The slug is kept so existing links stay valid.
pub async fn update_paper(
    conn: &mut SqliteConnection,
    paper_id: i64,
    draft: &PaperDraft,
    authors: Option<&[AuthorInput]>,
    keywords: Option<&[KeywordInput]>,
) -> Result<ResearchPaper, sqlx::Error> {
    sqlx::query(
        r#"UPDATE research_papers
           SET title = ?, abstract = ?, publication_year = ?, journal = ?, doi = ?, url = ?,
               methodology_type = ?, citation_count = ?, citation_trend = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&draft.title)
    .bind(&draft.abstract_text)
    .bind(draft.publication_year)
    .bind(&draft.journal)
    .bind(&draft.doi)
    .bind(&draft.url)
    .bind(&draft.methodology_type)
    .bind(draft.citation_count)
    .bind(draft.citation_trend.as_str())
    .bind(Utc::now())
    .bind(paper_id)
    .execute(&mut *conn)
    .await?;

    if let Some(authors) = authors {
        replace_authors(conn, paper_id, authors).await?;
    }
    if let Some(keywords) = keywords {
        replace_keywords(conn, paper_id, keywords).await?;
    }

    find_paper(conn, paper_id).await
}

pub async fn delete_paper(conn: &mut SqliteConnection, paper_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM research_papers WHERE id = ?")
        .bind(paper_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(FromRow)]
struct PaperAuthorRow {
    paper_id: i64,
    #[sqlx(flatten)]
    author: Author,
}

#[derive(FromRow)]
struct PaperKeywordRow {
    paper_id: i64,
    #[sqlx(flatten)]
    keyword: Keyword,
}

/// A paper with whatever listing-specific score came with it.
pub struct ScoredPaper {
    pub paper: ResearchPaper,
    pub relevance: Option<f64>,
    pub matching_keywords: Option<i64>,
}

impl From<ResearchPaper> for ScoredPaper {
    fn from(paper: ResearchPaper) -> Self {
        Self {
            paper,
            relevance: None,
            matching_keywords: None,
        }
    }
}

/// Attaches authors and keywords with one query each, keeping row order.
pub async fn hydrate_papers(
    conn: &mut SqliteConnection,
    papers: Vec<ScoredPaper>,
) -> Result<Vec<PaperResponse>, sqlx::Error> {
    if papers.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = papers.iter().map(|scored| scored.paper.id).collect();

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT pa.paper_id, a.id, a.name, a.affiliation, a.email \
         FROM paper_authors pa JOIN authors a ON a.id = pa.author_id WHERE pa.paper_id IN (",
    );
    {
        let mut separated = qb.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
    }
    qb.push(") ORDER BY a.name, a.id");
    let author_rows = qb
        .build_query_as::<PaperAuthorRow>()
        .fetch_all(&mut *conn)
        .await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT pk.paper_id, k.id, k.name, k.category_id \
         FROM paper_keywords pk JOIN keywords k ON k.id = pk.keyword_id WHERE pk.paper_id IN (",
    );
    {
        let mut separated = qb.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
    }
    qb.push(") ORDER BY k.name, k.id");
    let keyword_rows = qb
        .build_query_as::<PaperKeywordRow>()
        .fetch_all(&mut *conn)
        .await?;

    let mut authors: HashMap<i64, Vec<Author>> = HashMap::new();
    for row in author_rows {
        authors.entry(row.paper_id).or_default().push(row.author);
    }
    let mut keywords: HashMap<i64, Vec<Keyword>> = HashMap::new();
    for row in keyword_rows {
        keywords.entry(row.paper_id).or_default().push(row.keyword);
    }

    Ok(papers
        .into_iter()
        .map(|scored| {
            let id = scored.paper.id;
            PaperResponse {
                publication_date: scored.paper.publication_year,
                authors: authors.remove(&id).unwrap_or_default(),
                keywords: keywords.remove(&id).unwrap_or_default(),
                relevance: scored.relevance,
                matching_keywords: scored.matching_keywords,
                paper: scored.paper,
            }
        })
        .collect())
}

pub async fn hydrate_paper(
    conn: &mut SqliteConnection,
    paper: ResearchPaper,
) -> Result<PaperResponse, sqlx::Error> {
    let mut hydrated = hydrate_papers(conn, vec![ScoredPaper::from(paper)]).await?;
    hydrated.pop().ok_or(sqlx::Error::RowNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn input(title: &str, year: i64) -> PaperInput {
        PaperInput {
            title: Some(title.to_string()),
            abstract_text: Some("Soil carbon dynamics under cover crops.".to_string()),
            publication_year: Some(year),
            ..PaperInput::default()
        }
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("  Soil & Water: A Review!  "), "soil-water-a-review");
        assert_eq!(slugify("Über—Åland"), "berland");
        assert_eq!(slugify("???"), "paper");
    }

    #[test]
    fn create_requires_core_fields() {
        let errors = validate_paper(&PaperInput::default(), None, false).expect_err("invalid");
        assert!(errors.has("title"));
        assert!(errors.has("abstract"));
        assert!(errors.has("publication_year"));
    }

    #[test]
    fn year_and_trend_are_checked() {
        let mut paper = input("Valid title", 1850);
        paper.citation_trend = Some("sideways".to_string());
        paper.citation_count = Some(-1);
        let errors = validate_paper(&paper, None, false).expect_err("invalid");
        assert!(errors.has("publication_year"));
        assert!(errors.has("citation_trend"));
        assert!(errors.has("citation_count"));
    }

    #[tokio::test]
    async fn duplicate_titles_get_numbered_slugs() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        let mut conn = pool.acquire().await.expect("conn");
        let draft = validate_paper(&input("Cover Crops", 2020), None, false).expect("valid");

        let first = create_paper(&mut conn, &draft, &[], &[]).await.expect("first");
        let second = create_paper(&mut conn, &draft, &[], &[]).await.expect("second");
        let third = create_paper(&mut conn, &draft, &[], &[]).await.expect("third");

        assert_eq!(first.slug, "cover-crops");
        assert_eq!(second.slug, "cover-crops-2");
        assert_eq!(third.slug, "cover-crops-3");
    }

    #[tokio::test]
    async fn keywords_are_normalised_and_shared() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        let mut conn = pool.acquire().await.expect("conn");
        let draft = validate_paper(&input("Agroforestry", 2021), None, false).expect("valid");

        let keywords = vec![
            KeywordInput::Name("  Soil Health ".to_string()),
            KeywordInput::Detailed {
                name: "soil health".to_string(),
            },
        ];
        let authors = vec![AuthorInput::Name("M. Altieri".to_string())];
        let paper = create_paper(&mut conn, &draft, &authors, &keywords)
            .await
            .expect("created");

        let hydrated = hydrate_paper(&mut conn, paper).await.expect("hydrated");
        assert_eq!(hydrated.keywords.len(), 1);
        assert_eq!(hydrated.keywords[0].name, "soil health");
        assert_eq!(hydrated.authors[0].name, "M. Altieri");
        assert_eq!(hydrated.publication_date, 2021);
    }

    #[tokio::test]
    async fn partial_update_keeps_links_and_slug() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        let mut conn = pool.acquire().await.expect("conn");
        let draft = validate_paper(&input("Seed Banks", 2019), None, false).expect("valid");
        let keywords = vec![KeywordInput::Name("seeds".to_string())];
        let paper = create_paper(&mut conn, &draft, &[], &keywords)
            .await
            .expect("created");

        let patch = PaperInput {
            title: Some("Community Seed Banks".to_string()),
            ..PaperInput::default()
        };
        let draft = validate_paper(&patch, Some(&paper), true).expect("valid");
        let updated = update_paper(&mut conn, paper.id, &draft, None, None)
            .await
            .expect("updated");

        assert_eq!(updated.slug, "seed-banks");
        assert_eq!(updated.title, "Community Seed Banks");
        assert_eq!(updated.publication_year, 2019);
        let hydrated = hydrate_paper(&mut conn, updated).await.expect("hydrated");
        assert_eq!(hydrated.keywords.len(), 1);
    }
}
