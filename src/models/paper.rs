use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ResearchPaper {
    pub id: i64,
    pub title: String,
    pub slug: String,
    #[sqlx(rename = "abstract")]
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub publication_year: i32,
    pub journal: String,
    pub doi: Option<String>,
    pub url: String,
    pub methodology_type: String,
    pub citation_count: i64,
    pub citation_trend: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A listing row with its text-search score (0 when no query was given).
#[derive(Debug, Clone, FromRow)]
pub struct RankedPaper {
    #[sqlx(flatten)]
    pub paper: ResearchPaper,
    pub rank: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct RelatedPaper {
    #[sqlx(flatten)]
    pub paper: ResearchPaper,
    pub matching_keywords: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub affiliation: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Keyword {
    pub id: i64,
    pub name: String,
    #[serde(rename = "category")]
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct KeywordCategory {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationTrend {
    Increasing,
    Decreasing,
    #[default]
    Stable,
}

impl CitationTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "increasing" => Some(Self::Increasing),
            "decreasing" => Some(Self::Decreasing),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

/// An author given either as a bare name or as an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthorInput {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        affiliation: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
}

impl AuthorInput {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Detailed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeywordInput {
    Name(String),
    Detailed { name: String },
}

impl KeywordInput {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Detailed { name } => name,
        }
    }
}

/// Create/update body. Every field is optional so PATCH can reuse it;
/// `catalog::validate_paper` decides what a full write needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperInput {
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub publication_year: Option<i64>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub methodology_type: Option<String>,
    pub citation_count: Option<i64>,
    pub citation_trend: Option<String>,
    pub authors: Option<Vec<AuthorInput>>,
    pub keywords: Option<Vec<KeywordInput>>,
}

#[derive(Debug, Serialize)]
pub struct PaperResponse {
    #[serde(flatten)]
    pub paper: ResearchPaper,
    /// Same value as `publication_year`, kept for older clients.
    pub publication_date: i32,
    pub authors: Vec<Author>,
    pub keywords: Vec<Keyword>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching_keywords: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CategoryWithKeywords {
    #[serde(flatten)]
    pub category: KeywordCategory,
    pub keywords: Vec<Keyword>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct KeywordUsage {
    pub id: i64,
    pub name: String,
    #[serde(rename = "category")]
    pub category_id: Option<i64>,
    pub paper_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct NameQuery {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAuthor {
    #[serde(default)]
    pub name: String,
    pub affiliation: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyword {
    #[serde(default)]
    pub name: String,
    pub category: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCategory {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
}
