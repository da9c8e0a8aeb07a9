use serde::Serialize;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 50;

/// Page and size as asked for by the client, already sanitised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Garbage or non-positive pages become 1; sizes are clamped to `1..=50`.
    pub fn from_params(page: Option<&str>, page_size: Option<&str>) -> Self {
        let page = page
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|page| *page >= 1)
            .unwrap_or(1);
        let page_size = page_size
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|size| size.clamp(1, MAX_PAGE_SIZE))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page, page_size }
    }

    /// Pins the request to an existing page once the total is known.
    pub fn resolve(self, total_items: i64) -> PageInfo {
        let total_items = total_items.max(0);
        let total_pages = ((total_items + self.page_size - 1) / self.page_size).max(1);
        let current_page = self.page.min(total_pages);
        PageInfo {
            current_page,
            total_pages,
            total_items,
            has_next: current_page < total_pages,
            has_previous: current_page > 1,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub current_page: i64,
    pub total_pages: i64,
    pub total_items: i64,
    pub has_next: bool,
    pub has_previous: bool,
    pub page_size: i64,
}

impl PageInfo {
    pub fn offset(&self) -> i64 {
        (self.current_page - 1) * self.page_size
    }
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub results: Vec<T>,
    pub pagination: PageInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_page_size_is_clamped() {
        let request = PageRequest::from_params(None, Some("999"));
        assert_eq!(request.page_size, 50);
        let request = PageRequest::from_params(None, Some("0"));
        assert_eq!(request.page_size, 1);
    }

    #[test]
    fn malformed_values_fall_back() {
        assert_eq!(
            PageRequest::from_params(Some("abc"), Some("ten")),
            PageRequest::default()
        );
        assert_eq!(PageRequest::from_params(Some("-3"), None).page, 1);
    }

    #[test]
    fn page_past_the_end_returns_last_page() {
        let info = PageRequest::from_params(Some("9"), Some("10")).resolve(25);
        assert_eq!(info.total_pages, 3);
        assert_eq!(info.current_page, 3);
        assert!(!info.has_next);
        assert!(info.has_previous);
        assert_eq!(info.offset(), 20);
    }

    #[test]
    fn empty_result_still_has_one_page() {
        let info = PageRequest::default().resolve(0);
        assert_eq!(info.total_pages, 1);
        assert_eq!(info.current_page, 1);
        assert_eq!(info.offset(), 0);
        assert!(!info.has_next && !info.has_previous);
    }
}
