//! Article fetching for pipeline runs.

use crate::models::{Article, PipelineRun};
use crate::repository::Store;

/// Pages articles out of the store for a run's date window, newest first.
pub struct ArticleFetcher {
    store: Store,
}

impl ArticleFetcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Total articles in the run's window, before any limit.
    pub fn count_for_run(&self, run: &PipelineRun) -> crate::repository::Result<i64> {
        self.store
            .articles()
            .count_for_window(run.date_from, run.date_to)
    }

    /// One page of articles for the run.
    pub fn page(
        &self,
        run: &PipelineRun,
        offset: usize,
        size: usize,
    ) -> crate::repository::Result<Vec<Article>> {
        self.store
            .articles()
            .fetch_for_window(run.date_from, run.date_to, size, offset)
    }
}
