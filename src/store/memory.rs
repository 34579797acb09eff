//! In-process implementations of [`MetadataGateway`] and [`StatusCache`]:
//! an `Arc<RwLock<...>>` over plain collections, with no I/O. Kept
//! always-compiled (not behind `#[cfg(test)]`) so integration tests in
//! a separate crate-level `tests/` directory can construct one without
//! the `database` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChildRole, CounterKind, MetadataGateway, StatusCache, StatusRecord};
use crate::error::{CacheError, StoreError};
use crate::model::{Job, JobPatch, JobType, Page, PagePatch, Status};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    pages: HashMap<Uuid, Page>,
}

#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataGateway for InMemoryMetadataStore {
    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        let mut tables = self.inner.write().await;
        if let Some(existing) = tables.jobs.get(&job.job_id) {
            return Ok(existing.clone());
        }
        tables.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let mut tables = self.inner.write().await;
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn find_children(
        &self,
        parent_id: Uuid,
        status_filter: Option<Status>,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.parent_job_id == Some(parent_id))
            .filter(|j| status_filter.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|j| (j.page_number, j.created_at));
        Ok(out)
    }

    async fn delete_cascade(&self, main_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        let child_ids: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|j| j.parent_job_id == Some(main_id))
            .map(|j| j.job_id)
            .collect();
        for id in &child_ids {
            tables.jobs.remove(id);
        }
        tables.pages.retain(|_, p| p.job_id != main_id);
        tables.jobs.remove(&main_id);
        Ok(())
    }

    async fn create_page(&self, page: Page) -> Result<Page, StoreError> {
        let mut tables = self.inner.write().await;
        if let Some(existing) = tables
            .pages
            .values()
            .find(|p| p.job_id == page.job_id && p.page_number == page.page_number)
        {
            return Ok(existing.clone());
        }
        tables.pages.insert(page.page_id, page.clone());
        Ok(page)
    }

    async fn update_page(&self, page_id: Uuid, patch: PagePatch) -> Result<Page, StoreError> {
        let mut tables = self.inner.write().await;
        let page = tables
            .pages
            .get_mut(&page_id)
            .ok_or_else(|| StoreError::PageNotFound { job_id: Uuid::nil(), page_number: -1 })?;
        patch.apply(page);
        Ok(page.clone())
    }

    async fn find_pages(&self, main_id: Uuid) -> Result<Vec<Page>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| p.job_id == main_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.page_number);
        Ok(out)
    }

    async fn find_page_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Page>, StoreError> {
        let tables = self.inner.read().await;
        Ok(tables
            .pages
            .values()
            .find(|p| p.job_id == main_id && p.page_number == page_number)
            .cloned())
    }

    async fn find_page(&self, page_id: Uuid) -> Result<Option<Page>, StoreError> {
        Ok(self.inner.read().await.pages.get(&page_id).cloned())
    }

    async fn transition_page(
        &self,
        main_id: Uuid,
        page_number: i32,
        patch: PagePatch,
        counted_as: CounterKind,
    ) -> Result<(Page, Job), StoreError> {
        let mut tables = self.inner.write().await;

        let page_id = tables
            .pages
            .values()
            .find(|p| p.job_id == main_id && p.page_number == page_number)
            .map(|p| p.page_id)
            .ok_or(StoreError::PageNotFound { job_id: main_id, page_number })?;

        {
            let page = tables.pages.get_mut(&page_id).expect("page_id just located");
            patch.apply(page);
        }

        let counted_status = counted_as.counted_status();
        let count = tables
            .pages
            .values()
            .filter(|p| p.job_id == main_id && p.status == counted_status)
            .count() as i32;

        let job = tables.jobs.get_mut(&main_id).ok_or(StoreError::JobNotFound(main_id))?;
        match counted_as {
            CounterKind::Completed => job.pages_completed = count,
            CounterKind::Failed => job.pages_failed = count,
        }
        let job = job.clone();

        let page = tables.pages.get(&page_id).expect("page_id just located").clone();
        Ok((page, job))
    }

    async fn recount(&self, main_id: Uuid, counted_as: CounterKind) -> Result<Job, StoreError> {
        let mut tables = self.inner.write().await;
        let counted_status = counted_as.counted_status();
        let count = tables
            .pages
            .values()
            .filter(|p| p.job_id == main_id && p.status == counted_status)
            .count() as i32;

        let job = tables.jobs.get_mut(&main_id).ok_or(StoreError::JobNotFound(main_id))?;
        match counted_as {
            CounterKind::Completed => job.pages_completed = count,
            CounterKind::Failed => job.pages_failed = count,
        }
        Ok(job.clone())
    }

    async fn find_dedup(
        &self,
        user_id: &str,
        file_checksum: &str,
    ) -> Result<Option<Job>, StoreError> {
        let tables = self.inner.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.job_type == JobType::Main)
            .filter(|j| j.user_id == user_id)
            .filter(|j| j.file_checksum.as_deref() == Some(file_checksum))
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn list_stuck_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.status == Status::Processing)
            .filter(|j| j.started_at.map(|t| t < older_than).unwrap_or(false))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.started_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn list_stuck_pages(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| p.status == Status::Processing)
            .filter(|p| p.created_at < older_than)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.created_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn list_retryable_failed_pages(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| p.status == Status::Failed && p.retry_count < max_retries)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.updated_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn list_retryable_failed_pages_for(
        &self,
        main_id: Uuid,
        max_retries: i32,
    ) -> Result<Vec<Page>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| p.job_id == main_id)
            .filter(|p| p.status == Status::Failed && p.retry_count < max_retries)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.page_number);
        Ok(out)
    }

    async fn list_cleanup_candidates(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.inner.read().await;
        let mut out: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.job_type == JobType::Main)
            .filter(|j| j.status.is_terminal())
            .filter(|j| j.completed_at.map(|t| t < older_than).unwrap_or(false))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.completed_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn status_histogram(&self) -> Result<Vec<(JobType, Status, i64)>, StoreError> {
        let tables = self.inner.read().await;
        let mut counts: HashMap<(JobType, Status), i64> = HashMap::new();
        for job in tables.jobs.values() {
            *counts.entry((job.job_type, job.status)).or_insert(0) += 1;
        }
        let mut out: Vec<(JobType, Status, i64)> =
            counts.into_iter().map(|((t, s), n)| (t, s, n)).collect();
        out.sort_by_key(|(t, s, _)| (t.as_str(), s.as_str()));
        Ok(out)
    }
}

#[derive(Default)]
struct CacheTables {
    statuses: HashMap<Uuid, StatusRecord>,
    owners: HashMap<Uuid, String>,
    user_jobs: HashMap<String, Vec<Uuid>>,
    pages_total: HashMap<Uuid, i32>,
    page_children: HashMap<Uuid, Vec<Uuid>>,
    single_children: HashMap<(Uuid, ChildRole), Uuid>,
    page_by_number: HashMap<(Uuid, i32), Uuid>,
    results: HashMap<Uuid, serde_json::Value>,
}

#[derive(Clone, Default)]
pub struct InMemoryStatusCache {
    inner: Arc<RwLock<CacheTables>>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn put_status(&self, job_id: Uuid, record: StatusRecord) -> Result<(), CacheError> {
        self.inner.write().await.statuses.insert(job_id, record);
        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<StatusRecord>, CacheError> {
        Ok(self.inner.read().await.statuses.get(&job_id).cloned())
    }

    async fn set_owner(&self, job_id: Uuid, user_id: &str) -> Result<(), CacheError> {
        let mut tables = self.inner.write().await;
        tables.owners.insert(job_id, user_id.to_string());
        tables
            .user_jobs
            .entry(user_id.to_string())
            .or_default()
            .push(job_id);
        Ok(())
    }

    async fn verify_owner(&self, job_id: Uuid, user_id: &str) -> Result<bool, CacheError> {
        Ok(self.inner.read().await.owners.get(&job_id).map(String::as_str) == Some(user_id))
    }

    async fn list_user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Uuid>, CacheError> {
        let tables = self.inner.read().await;
        Ok(tables
            .user_jobs
            .get(user_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn update_progress(&self, job_id: Uuid, value: i32) -> Result<(), CacheError> {
        let mut tables = self.inner.write().await;
        if let Some(record) = tables.statuses.get_mut(&job_id) {
            record.progress = value;
        }
        Ok(())
    }

    async fn add_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<(), CacheError> {
        let mut tables = self.inner.write().await;
        match role {
            ChildRole::Page => {
                tables.page_children.entry(parent_id).or_default().push(child_id);
            }
            ChildRole::Split | ChildRole::Merge => {
                tables.single_children.insert((parent_id, role), child_id);
            }
        }
        Ok(())
    }

    async fn get_page_children(&self, parent_id: Uuid) -> Result<Vec<Uuid>, CacheError> {
        Ok(self
            .inner
            .read()
            .await
            .page_children
            .get(&parent_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
    ) -> Result<Option<Uuid>, CacheError> {
        Ok(self
            .inner
            .read()
            .await
            .single_children
            .get(&(parent_id, role))
            .copied())
    }

    async fn set_child_if_absent(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<bool, CacheError> {
        let mut tables = self.inner.write().await;
        let key = (parent_id, role);
        if tables.single_children.contains_key(&key) {
            return Ok(false);
        }
        tables.single_children.insert(key, child_id);
        Ok(true)
    }

    async fn set_pages_total(&self, main_id: Uuid, n: i32) -> Result<(), CacheError> {
        self.inner.write().await.pages_total.insert(main_id, n);
        Ok(())
    }

    async fn get_pages_total(&self, main_id: Uuid) -> Result<Option<i32>, CacheError> {
        Ok(self.inner.read().await.pages_total.get(&main_id).copied())
    }

    async fn set_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
        page_job_id: Uuid,
    ) -> Result<(), CacheError> {
        self.inner
            .write()
            .await
            .page_by_number
            .insert((main_id, page_number), page_job_id);
        Ok(())
    }

    async fn get_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Uuid>, CacheError> {
        Ok(self
            .inner
            .read()
            .await
            .page_by_number
            .get(&(main_id, page_number))
            .copied())
    }

    async fn count_completed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError> {
        self.count_with_status(main_id, Status::Completed).await
    }

    async fn count_failed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError> {
        self.count_with_status(main_id, Status::Failed).await
    }

    async fn all_page_children_terminal(&self, main_id: Uuid) -> Result<bool, CacheError> {
        let tables = self.inner.read().await;
        let children = tables.page_children.get(&main_id).cloned().unwrap_or_default();
        if children.is_empty() {
            return Ok(false);
        }
        Ok(children.iter().all(|c| {
            tables
                .statuses
                .get(c)
                .map(|r| r.status.is_terminal())
                .unwrap_or(false)
        }))
    }

    async fn set_result(&self, job_id: Uuid, blob: serde_json::Value) -> Result<(), CacheError> {
        self.inner.write().await.results.insert(job_id, blob);
        Ok(())
    }

    async fn get_result(&self, job_id: Uuid) -> Result<Option<serde_json::Value>, CacheError> {
        Ok(self.inner.read().await.results.get(&job_id).cloned())
    }

    async fn purge(&self, main_id: Uuid) -> Result<(), CacheError> {
        let mut tables = self.inner.write().await;
        let children = tables.page_children.remove(&main_id).unwrap_or_default();
        for child in &children {
            tables.statuses.remove(child);
            tables.results.remove(child);
        }
        tables.statuses.remove(&main_id);
        tables.results.remove(&main_id);
        tables.pages_total.remove(&main_id);
        tables.single_children.retain(|(parent, _), _| *parent != main_id);
        tables.page_by_number.retain(|(parent, _), _| *parent != main_id);
        Ok(())
    }
}

impl InMemoryStatusCache {
    async fn count_with_status(&self, main_id: Uuid, status: Status) -> Result<usize, CacheError> {
        let tables = self.inner.read().await;
        let children = tables.page_children.get(&main_id).cloned().unwrap_or_default();
        Ok(children
            .iter()
            .filter(|c| tables.statuses.get(*c).map(|r| r.status == status).unwrap_or(false))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, SourceType};

    #[tokio::test]
    async fn create_job_is_idempotent_on_retry() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let job = Job::new_main(
            "user-1",
            SourceType::File,
            None,
            Some("a.pdf".to_string()),
            Some("application/pdf".to_string()),
            Some(10),
            Some("chk".to_string()),
            now,
        );
        let first = store.create_job(job.clone()).await.unwrap();
        let second = store.create_job(job).await.unwrap();
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn transition_page_recomputes_completed_counter() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let main = Job::new_main(
            "user-1",
            SourceType::File,
            None,
            None,
            None,
            None,
            Some("chk".to_string()),
            now,
        );
        let main = store.create_job(main).await.unwrap();

        let page_job = Job::new_child(JobType::Page, &main, Some(1), now);
        let page = Page::new(main.job_id, 1, page_job.job_id, "pages/x/page_0001.pdf", now);
        store.create_page(page).await.unwrap();

        let mut patch = PagePatch::new(Utc::now());
        patch.status = Some(Status::Completed);
        let (page, job) = store
            .transition_page(main.job_id, 1, patch, CounterKind::Completed)
            .await
            .unwrap();

        assert_eq!(page.status, Status::Completed);
        assert_eq!(job.pages_completed, 1);
    }

    #[tokio::test]
    async fn set_child_if_absent_only_wins_once() {
        let cache = InMemoryStatusCache::new();
        let parent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(cache
            .set_child_if_absent(parent, ChildRole::Merge, a)
            .await
            .unwrap());
        assert!(!cache
            .set_child_if_absent(parent, ChildRole::Merge, b)
            .await
            .unwrap());
        assert_eq!(cache.get_child(parent, ChildRole::Merge).await.unwrap(), Some(a));
    }
}
