//! Postgres-backed [`MetadataGateway`].
//!
//! [`transition_page`] is the one non-mechanical query here: it locks
//! the page row, applies the patch, then locks the parent job row
//! before recomputing its counter via `SELECT COUNT(*)` over the
//! page rows, all inside one transaction. Locking the parent before
//! counting is what keeps two concurrent page completions from both
//! counting off the same stale snapshot and one clobbering the other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CounterKind, MetadataGateway};
use crate::error::StoreError;
use crate::model::{Job, JobPatch, JobType, Page, PagePatch, Status};

#[derive(Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the two migrations this store assumes exist: `jobs` and
    /// `pages`, via a `CREATE TABLE IF NOT EXISTS` bootstrap.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                parent_job_id UUID,
                source_type TEXT,
                source_url TEXT,
                filename TEXT,
                mime_type TEXT,
                file_size_bytes BIGINT,
                file_checksum TEXT,
                upload_object_key TEXT,
                result_object_key TEXT,
                status TEXT NOT NULL,
                progress_percent INT NOT NULL DEFAULT 0,
                error_message TEXT,
                total_pages INT,
                pages_completed INT NOT NULL DEFAULT 0,
                pages_failed INT NOT NULL DEFAULT 0,
                char_count BIGINT,
                has_result_stored BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL,
                page_number INT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS jobs_dedup_idx
                ON jobs (user_id, file_checksum)
                WHERE job_type = 'main' AND file_checksum IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                page_id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES jobs(job_id),
                page_number INT NOT NULL,
                page_job_id UUID NOT NULL,
                minio_page_path TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                retry_count INT NOT NULL DEFAULT 0,
                markdown_content TEXT,
                char_count BIGINT,
                has_result_stored BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (job_id, page_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MetadataGateway for PostgresMetadataStore {
    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                job_id, user_id, job_type, parent_job_id, source_type, source_url,
                filename, mime_type, file_size_bytes, file_checksum,
                upload_object_key, result_object_key, status, progress_percent,
                error_message, total_pages, pages_completed, pages_failed,
                char_count, has_result_stored, created_at, started_at,
                completed_at, updated_at, page_number
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25)
            ON CONFLICT (job_id) DO UPDATE SET job_id = jobs.job_id
            RETURNING *
            "#,
        )
        .bind(job.job_id)
        .bind(&job.user_id)
        .bind(job.job_type)
        .bind(job.parent_job_id)
        .bind(job.source_type)
        .bind(&job.source_url)
        .bind(&job.filename)
        .bind(&job.mime_type)
        .bind(job.file_size_bytes)
        .bind(&job.file_checksum)
        .bind(&job.upload_object_key)
        .bind(&job.result_object_key)
        .bind(job.status)
        .bind(job.progress_percent)
        .bind(&job.error_message)
        .bind(job.total_pages)
        .bind(job.pages_completed)
        .bind(job.pages_failed)
        .bind(job.char_count)
        .bind(job.has_result_stored)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.page_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let mut job = self.find_job(id).await?.ok_or(StoreError::JobNotFound(id))?;
        patch.apply(&mut job);

        let row = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = $2, progress_percent = $3, error_message = $4,
                upload_object_key = $5, result_object_key = $6, total_pages = $7,
                pages_completed = $8, pages_failed = $9, char_count = $10,
                has_result_stored = $11, started_at = $12, completed_at = $13,
                updated_at = $14
            WHERE job_id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(job.status)
        .bind(job.progress_percent)
        .bind(&job.error_message)
        .bind(&job.upload_object_key)
        .bind(&job.result_object_key)
        .bind(job.total_pages)
        .bind(job.pages_completed)
        .bind(job.pages_failed)
        .bind(job.char_count)
        .bind(job.has_result_stored)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_children(
        &self,
        parent_id: Uuid,
        status_filter: Option<Status>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE parent_job_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY page_number NULLS FIRST, created_at
            "#,
        )
        .bind(parent_id)
        .bind(status_filter.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_cascade(&self, main_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages WHERE job_id = $1")
            .bind(main_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE parent_job_id = $1")
            .bind(main_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(main_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_page(&self, page: Page) -> Result<Page, StoreError> {
        let row = sqlx::query_as::<_, Page>(
            r#"
            INSERT INTO pages (
                page_id, job_id, page_number, page_job_id, minio_page_path,
                status, error_message, retry_count, markdown_content, char_count,
                has_result_stored, created_at, completed_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (job_id, page_number) DO UPDATE SET job_id = pages.job_id
            RETURNING *
            "#,
        )
        .bind(page.page_id)
        .bind(page.job_id)
        .bind(page.page_number)
        .bind(page.page_job_id)
        .bind(&page.minio_page_path)
        .bind(page.status)
        .bind(&page.error_message)
        .bind(page.retry_count)
        .bind(&page.markdown_content)
        .bind(page.char_count)
        .bind(page.has_result_stored)
        .bind(page.created_at)
        .bind(page.completed_at)
        .bind(page.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update_page(&self, page_id: Uuid, patch: PagePatch) -> Result<Page, StoreError> {
        let mut page = self
            .find_page(page_id)
            .await?
            .ok_or_else(|| StoreError::PageNotFound { job_id: Uuid::nil(), page_number: -1 })?;
        patch.apply(&mut page);

        let row = sqlx::query_as::<_, Page>(
            r#"
            UPDATE pages SET
                page_job_id = $2, status = $3, error_message = $4, retry_count = $5,
                markdown_content = $6, char_count = $7, has_result_stored = $8,
                completed_at = $9, updated_at = $10
            WHERE page_id = $1
            RETURNING *
            "#,
        )
        .bind(page_id)
        .bind(page.page_job_id)
        .bind(page.status)
        .bind(&page.error_message)
        .bind(page.retry_count)
        .bind(&page.markdown_content)
        .bind(page.char_count)
        .bind(page.has_result_stored)
        .bind(page.completed_at)
        .bind(page.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_pages(&self, main_id: Uuid) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query_as::<_, Page>(
            "SELECT * FROM pages WHERE job_id = $1 ORDER BY page_number",
        )
        .bind(main_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_page_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query_as::<_, Page>(
            "SELECT * FROM pages WHERE job_id = $1 AND page_number = $2",
        )
        .bind(main_id)
        .bind(page_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_page(&self, page_id: Uuid) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE page_id = $1")
            .bind(page_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn transition_page(
        &self,
        main_id: Uuid,
        page_number: i32,
        patch: PagePatch,
        counted_as: CounterKind,
    ) -> Result<(Page, Job), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut page = sqlx::query_as::<_, Page>(
            "SELECT * FROM pages WHERE job_id = $1 AND page_number = $2 FOR UPDATE",
        )
        .bind(main_id)
        .bind(page_number)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::PageNotFound { job_id: main_id, page_number })?;

        patch.apply(&mut page);

        let page = sqlx::query_as::<_, Page>(
            r#"
            UPDATE pages SET
                page_job_id = $2, status = $3, error_message = $4, retry_count = $5,
                markdown_content = $6, char_count = $7, has_result_stored = $8,
                completed_at = $9, updated_at = $10
            WHERE page_id = $1
            RETURNING *
            "#,
        )
        .bind(page.page_id)
        .bind(page.page_job_id)
        .bind(page.status)
        .bind(&page.error_message)
        .bind(page.retry_count)
        .bind(&page.markdown_content)
        .bind(page.char_count)
        .bind(page.has_result_stored)
        .bind(page.completed_at)
        .bind(page.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query_scalar::<_, Uuid>("SELECT job_id FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(main_id)
            .fetch_one(&mut *tx)
            .await?;

        let counted_status = counted_as.counted_status();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages WHERE job_id = $1 AND status = $2",
        )
        .bind(main_id)
        .bind(counted_status)
        .fetch_one(&mut *tx)
        .await?;

        let column = match counted_as {
            CounterKind::Completed => "pages_completed",
            CounterKind::Failed => "pages_failed",
        };
        let sql = format!(
            "UPDATE jobs SET {column} = $2, updated_at = $3 WHERE job_id = $1 RETURNING *"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(main_id)
            .bind(count as i32)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((page, job))
    }

    async fn recount(&self, main_id: Uuid, counted_as: CounterKind) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query_scalar::<_, Uuid>("SELECT job_id FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(main_id)
            .fetch_one(&mut *tx)
            .await?;

        let counted_status = counted_as.counted_status();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages WHERE job_id = $1 AND status = $2",
        )
        .bind(main_id)
        .bind(counted_status)
        .fetch_one(&mut *tx)
        .await?;

        let column = match counted_as {
            CounterKind::Completed => "pages_completed",
            CounterKind::Failed => "pages_failed",
        };
        let sql = format!(
            "UPDATE jobs SET {column} = $2, updated_at = $3 WHERE job_id = $1 RETURNING *"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(main_id)
            .bind(count as i32)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn find_dedup(
        &self,
        user_id: &str,
        file_checksum: &str,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE job_type = 'main' AND user_id = $1 AND file_checksum = $2
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(file_checksum)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_stuck_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'processing' AND started_at < $1
            ORDER BY started_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_stuck_pages(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query_as::<_, Page>(
            r#"
            SELECT * FROM pages
            WHERE status = 'processing' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_retryable_failed_pages(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query_as::<_, Page>(
            r#"
            SELECT * FROM pages
            WHERE status = 'failed' AND retry_count < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_retryable_failed_pages_for(
        &self,
        main_id: Uuid,
        max_retries: i32,
    ) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query_as::<_, Page>(
            r#"
            SELECT * FROM pages
            WHERE job_id = $1 AND status = 'failed' AND retry_count < $2
            ORDER BY page_number
            "#,
        )
        .bind(main_id)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_cleanup_candidates(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE job_type = 'main'
              AND status IN ('completed', 'failed', 'cancelled')
              AND completed_at < $1
            ORDER BY completed_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn status_histogram(&self) -> Result<Vec<(JobType, Status, i64)>, StoreError> {
        let rows: Vec<(JobType, Status, i64)> = sqlx::query_as(
            r#"
            SELECT job_type, status, COUNT(*) as count
            FROM jobs
            GROUP BY job_type, status
            ORDER BY job_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
