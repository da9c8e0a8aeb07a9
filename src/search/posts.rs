use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{PageInfo, PageRequest, TagLogic, non_empty, normalize_names};
use crate::models::ForumPost;

/// Raw query string of `GET /api/forum/posts/`.
#[derive(Debug, Default, Deserialize)]
pub struct PostListParams {
    pub search: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tag_logic: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl PostListParams {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::from_params(self.page.as_deref(), self.page_size.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostFilters {
    pub search: Option<String>,
    pub tags: Vec<String>,
    pub tag_logic: TagLogic,
    pub created_from: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl PostFilters {
    pub fn from_params(params: &PostListParams) -> Self {
        // `tags=a,b` and `tags=a&tags=b` are both accepted.
        let tags = normalize_names(params.tags.iter().flat_map(|raw| raw.split(',')));

        Self {
            search: non_empty(params.search.as_ref()),
            tags,
            tag_logic: TagLogic::parse(params.tag_logic.as_deref()),
            created_from: parse_date(params.date_from.as_ref()).map(start_of_day),
            created_before: parse_date(params.date_to.as_ref())
                .and_then(|date| date.checked_add_days(Days::new(1)))
                .map(start_of_day),
        }
    }

    fn requires_every_tag(&self) -> bool {
        self.tag_logic == TagLogic::All && self.tags.len() > 1
    }
}

fn parse_date(raw: Option<&String>) -> Option<NaiveDate> {
    non_empty(raw).and_then(|value| NaiveDate::parse_from_str(&value, "%Y-%m-%d").ok())
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn push_scope(qb: &mut QueryBuilder<'_, Sqlite>, filters: &PostFilters) {
    qb.push(" FROM forum_posts fp");

    if filters.requires_every_tag() {
        for (idx, tag) in filters.tags.iter().enumerate() {
            qb.push(format!(
                " JOIN forum_post_tags pt{idx} ON pt{idx}.post_id = fp.id \
                 JOIN forum_tags t{idx} ON t{idx}.id = pt{idx}.tag_id AND t{idx}.name = "
            ));
            qb.push_bind(tag.clone());
        }
    } else if !filters.tags.is_empty() {
        qb.push(
            " JOIN forum_post_tags pt ON pt.post_id = fp.id \
             JOIN forum_tags t ON t.id = pt.tag_id AND t.name IN (",
        );
        super::push_bind_list(qb, &filters.tags);
        qb.push(")");
    }

    qb.push(" WHERE 1 = 1");

    // instr() keeps the substring match case-sensitive, unlike LIKE.
    if let Some(search) = &filters.search {
        qb.push(" AND (instr(fp.title, ")
            .push_bind(search.clone())
            .push(") > 0 OR instr(fp.content, ")
            .push_bind(search.clone())
            .push(") > 0)");
    }
    if let Some(from) = filters.created_from {
        qb.push(" AND fp.created_at >= ").push_bind(from);
    }
    if let Some(before) = filters.created_before {
        qb.push(" AND fp.created_at < ").push_bind(before);
    }
}

/// One page of posts, pinned posts first, then newest.
pub async fn search_posts(
    conn: &mut SqliteConnection,
    filters: &PostFilters,
    page: PageRequest,
) -> Result<(Vec<ForumPost>, PageInfo), sqlx::Error> {
    let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT fp.id)");
    push_scope(&mut count_qb, filters);
    let (total,): (i64,) = count_qb.build_query_as().fetch_one(&mut *conn).await?;

    let info = page.resolve(total);

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT fp.*");
    push_scope(&mut qb, filters);
    qb.push(" ORDER BY fp.is_pinned DESC, fp.created_at DESC, fp.id DESC");
    qb.push(" LIMIT ").push_bind(info.page_size);
    qb.push(" OFFSET ").push_bind(info.offset());

    let posts = qb.build_query_as::<ForumPost>().fetch_all(&mut *conn).await?;
    Ok((posts, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_and_repeated_tags_merge() {
        let params = PostListParams {
            tags: vec!["Soil, water".to_string(), "policy".to_string(), "soil".to_string()],
            ..Default::default()
        };
        let filters = PostFilters::from_params(&params);
        assert_eq!(filters.tags, vec!["soil", "water", "policy"]);
    }

    #[test]
    fn date_bounds_are_inclusive_days() {
        let params = PostListParams {
            date_from: Some("2024-03-01".to_string()),
            date_to: Some("2024-03-31".to_string()),
            ..Default::default()
        };
        let filters = PostFilters::from_params(&params);
        assert_eq!(
            filters.created_from.map(|d| d.to_rfc3339()),
            Some("2024-03-01T00:00:00+00:00".to_string())
        );
        assert_eq!(
            filters.created_before.map(|d| d.to_rfc3339()),
            Some("2024-04-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn bad_dates_and_blank_search_are_ignored() {
        let params = PostListParams {
            search: Some("   ".to_string()),
            date_from: Some("03/01/2024".to_string()),
            ..Default::default()
        };
        let filters = PostFilters::from_params(&params);
        assert_eq!(filters.search, None);
        assert_eq!(filters.created_from, None);
    }

    #[test]
    fn all_mode_joins_per_tag() {
        let params = PostListParams {
            tags: vec!["a,b".to_string()],
            tag_logic: Some("and".to_string()),
            ..Default::default()
        };
        let filters = PostFilters::from_params(&params);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT fp.id)");
        push_scope(&mut qb, &filters);
        assert_eq!(qb.sql().matches("JOIN forum_post_tags").count(), 2);
    }
}
