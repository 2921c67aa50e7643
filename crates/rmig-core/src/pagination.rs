use tracing::debug;

/// How successive pages are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationMode {
    /// Offsets advance by the size of each page. For listings of a set nobody mutates.
    Offset,
    /// Pages start past the items the caller kept in the set (see [`Pagination::keep`]).
    /// For passes that shrink the set they iterate.
    Pinned,
    /// Every page is requested after the last item of the previous page.
    After,
}

#[derive(Debug)]
pub struct PageRequest<'a, T> {
    pub offset: usize,
    pub limit: usize,
    pub after: Option<&'a T>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageReport {
    pub pages_fetched: usize,
    pub items_visited: usize,
}

/// Drives page fetches for one pass.
///
/// The caller pulls pages with [`Pagination::next_page`] and processes them between calls,
/// which keeps the fetch borrow separate from whatever the processing loop mutates. Iteration
/// stops on an empty page, once the number of visited items reaches the total captured by
/// [`Pagination::with_total`], or in [`PaginationMode::After`] after a short page.
#[derive(Debug)]
pub struct Pagination<T> {
    mode: PaginationMode,
    page_size: usize,
    total: Option<u64>,
    last: Option<T>,
    kept: usize,
    exhausted: bool,
    report: PageReport,
}

impl<T: Clone> Pagination<T> {
    pub fn new(mode: PaginationMode, page_size: usize) -> Self {
        Self {
            mode,
            page_size: page_size.max(1),
            total: None,
            last: None,
            kept: 0,
            exhausted: false,
            report: PageReport::default(),
        }
    }

    pub fn offset(page_size: usize) -> Self {
        Self::new(PaginationMode::Offset, page_size)
    }

    pub fn pinned(page_size: usize) -> Self {
        Self::new(PaginationMode::Pinned, page_size)
    }

    pub fn after(page_size: usize) -> Self {
        Self::new(PaginationMode::After, page_size)
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Record items of the last page that remain in the set after processing.
    pub fn keep(&mut self, count: usize) {
        self.kept += count;
    }

    pub fn mode(&self) -> PaginationMode {
        self.mode
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn report(&self) -> PageReport {
        self.report
    }

    pub fn next_page<E>(
        &mut self,
        fetch: impl FnOnce(PageRequest<'_, T>) -> Result<Vec<T>, E>,
    ) -> Result<Option<Vec<T>>, E> {
        if self.exhausted {
            return Ok(None);
        }
        let visited = self.report.items_visited;
        if let Some(total) = self.total {
            if visited as u64 >= total {
                self.exhausted = true;
                return Ok(None);
            }
        }

        let offset = match self.mode {
            PaginationMode::Offset => visited,
            PaginationMode::Pinned => self.kept,
            PaginationMode::After => 0,
        };
        let after = match self.mode {
            PaginationMode::After => self.last.as_ref(),
            PaginationMode::Offset | PaginationMode::Pinned => None,
        };
        debug!(
            mode = ?self.mode,
            offset,
            visited,
            total = ?self.total,
            page_size = self.page_size,
            "fetching page"
        );

        let page = fetch(PageRequest {
            offset,
            limit: self.page_size,
            after,
        })?;
        self.report.pages_fetched += 1;

        if page.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        if self.mode == PaginationMode::After {
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            self.last = page.last().cloned();
        }
        self.report.items_visited += page.len();

        Ok(Some(page))
    }

    pub fn for_each<E>(
        mut self,
        mut fetch: impl FnMut(PageRequest<'_, T>) -> Result<Vec<T>, E>,
        mut callback: impl FnMut(T) -> Result<(), E>,
    ) -> Result<PageReport, E> {
        while let Some(page) = self.next_page(&mut fetch)? {
            for item in page {
                callback(item)?;
            }
        }
        Ok(self.report)
    }

    pub fn collect<E>(
        self,
        fetch: impl FnMut(PageRequest<'_, T>) -> Result<Vec<T>, E>,
    ) -> Result<Vec<T>, E> {
        let mut items = Vec::new();
        self.for_each(fetch, |item| {
            items.push(item);
            Ok(())
        })?;
        Ok(items)
    }
}
