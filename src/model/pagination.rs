use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Offset pagination request. Always normalized before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginateResponse {
    pub total_items: u64,
    pub total_pages: u64,
    pub items_per_page: u32,
    pub previous_page: u64,
    pub current_page: u64,
    pub next_page: u64,
    pub has_previous_page: bool,
    pub has_next_page: bool,
}

impl PaginateResponse {
    pub fn new(total_items: u64, request: PageRequest) -> Self {
        let limit = u64::from(request.limit);
        let total_pages = total_items.div_ceil(limit);
        let current_page = u64::from(request.page);
        let has_previous_page = current_page > 1;
        let has_next_page = current_page < total_pages;

        Self {
            total_items,
            total_pages,
            items_per_page: request.limit,
            previous_page: if has_previous_page { current_page - 1 } else { current_page },
            current_page,
            next_page: if has_next_page { current_page + 1 } else { current_page },
            has_previous_page,
            has_next_page,
        }
    }
}

/// Slices an already filtered and ordered collection.
pub fn paginate<T>(items: Vec<T>, request: PageRequest) -> (PaginateResponse, Vec<T>) {
    let response = PaginateResponse::new(items.len() as u64, request);
    let offset = usize::try_from(request.offset()).unwrap_or(usize::MAX);
    let page = items
        .into_iter()
        .skip(offset)
        .take(request.limit as usize)
        .collect();
    (response, page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        assert_eq!(PageRequest::new(0, 0), PageRequest { page: 1, limit: 1 });
        assert_eq!(PageRequest::new(3, 50_000).limit, MAX_PAGE_LIMIT);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }

    #[test]
    fn response_reports_neighbouring_pages() {
        let response = PaginateResponse::new(45, PageRequest::new(2, 20));
        assert_eq!(response.total_pages, 3);
        assert_eq!(response.previous_page, 1);
        assert_eq!(response.next_page, 3);
        assert!(response.has_previous_page && response.has_next_page);

        let last = PaginateResponse::new(45, PageRequest::new(3, 20));
        assert!(!last.has_next_page);
        assert_eq!(last.next_page, 3);

        let empty = PaginateResponse::new(0, PageRequest::default());
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next_page);
    }

    #[test]
    fn paginate_slices_the_requested_window() {
        let (response, items) = paginate((1..=7).collect::<Vec<_>>(), PageRequest::new(2, 3));
        assert_eq!(items, vec![4, 5, 6]);
        assert_eq!(response.total_items, 7);
        let (_, beyond) = paginate((1..=7).collect::<Vec<_>>(), PageRequest::new(9, 3));
        assert!(beyond.is_empty());
    }
}
