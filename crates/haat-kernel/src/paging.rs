/// Slice bounds of one history page, counted from the newest end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub start: usize,
    pub end: usize,
    pub has_more: bool,
}

impl PageWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Page 1 is the newest `limit` messages; page `p` is
/// `[max(total - p*limit, 0), max(total - (p-1)*limit, 0))`.
pub fn page_window(total: usize, page: u32, limit: u32) -> PageWindow {
    let page = page.max(1) as usize;
    let limit = limit.max(1) as usize;
    let end = total.saturating_sub((page - 1).saturating_mul(limit));
    let start = end.saturating_sub(limit);
    PageWindow {
        start,
        end,
        has_more: start > 0,
    }
}

pub fn clamp_paging(
    page: Option<u32>,
    limit: Option<u32>,
    default_limit: u32,
    max_limit: u32,
) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(default_limit).clamp(1, max_limit.max(1));
    (page, limit)
}
