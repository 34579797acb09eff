//! Redis-backed [`StatusCache`] implementation.
//!
//! Key families: `status:{job_id}`, `owner:{job_id}`,
//! `user_jobs:{user_id}`, `pages_total:{main_id}`,
//! `children:{main_id}:{role}`, `result:{job_id}`,
//! `page_job_by_number:{main_id}:{N}`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{ChildRole, StatusCache, StatusRecord};
use crate::error::CacheError;
use crate::model::Status;

#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
}

impl RedisStatusCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn status_key(job_id: Uuid) -> String {
        format!("status:{job_id}")
    }
    fn owner_key(job_id: Uuid) -> String {
        format!("owner:{job_id}")
    }
    fn user_jobs_key(user_id: &str) -> String {
        format!("user_jobs:{user_id}")
    }
    fn pages_total_key(main_id: Uuid) -> String {
        format!("pages_total:{main_id}")
    }
    fn children_key(parent_id: Uuid, role: ChildRole) -> String {
        format!("children:{parent_id}:{}", role.as_str())
    }
    fn result_key(job_id: Uuid) -> String {
        format!("result:{job_id}")
    }
    fn page_by_number_key(main_id: Uuid, page_number: i32) -> String {
        format!("page_job_by_number:{main_id}:{page_number}")
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn put_status(&self, job_id: Uuid, record: StatusRecord) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&record)
            .map_err(|e| CacheError::Backend(format!("serialize status record: {e}")))?;
        let _: () = conn.set(Self::status_key(job_id), json).await?;
        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<StatusRecord>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::status_key(job_id)).await?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| CacheError::Backend(format!("deserialize status record: {e}"))),
        }
    }

    async fn set_owner(&self, job_id: Uuid, user_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::owner_key(job_id), user_id).await?;
        let _: () = conn.sadd(Self::user_jobs_key(user_id), job_id.to_string()).await?;
        Ok(())
    }

    async fn verify_owner(&self, job_id: Uuid, user_id: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.get(Self::owner_key(job_id)).await?;
        Ok(owner.as_deref() == Some(user_id))
    }

    async fn list_user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Uuid>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.smembers(Self::user_jobs_key(user_id)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .take(limit)
            .collect())
    }

    async fn update_progress(&self, job_id: Uuid, value: i32) -> Result<(), CacheError> {
        if let Some(mut record) = self.get_status(job_id).await? {
            record.progress = value;
            self.put_status(job_id, record).await?;
        }
        Ok(())
    }

    async fn add_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match role {
            ChildRole::Page => {
                let _: () = conn
                    .rpush(Self::children_key(parent_id, role), child_id.to_string())
                    .await?;
            }
            ChildRole::Split | ChildRole::Merge => {
                let _: () = conn
                    .set(Self::children_key(parent_id, role), child_id.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn get_page_children(&self, parent_id: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::children_key(parent_id, ChildRole::Page), 0, -1)
            .await?;
        Ok(raw.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
    }

    async fn get_child(
        &self,
        parent_id: Uuid,
        role: ChildRole,
    ) -> Result<Option<Uuid>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::children_key(parent_id, role)).await?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    async fn set_child_if_absent(
        &self,
        parent_id: Uuid,
        role: ChildRole,
        child_id: Uuid,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX);
        let result: Option<String> = conn
            .set_options(Self::children_key(parent_id, role), child_id.to_string(), opts)
            .await?;
        Ok(result.is_some())
    }

    async fn set_pages_total(&self, main_id: Uuid, n: i32) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::pages_total_key(main_id), n).await?;
        Ok(())
    }

    async fn get_pages_total(&self, main_id: Uuid) -> Result<Option<i32>, CacheError> {
        let mut conn = self.conn.clone();
        let v: Option<i32> = conn.get(Self::pages_total_key(main_id)).await?;
        Ok(v)
    }

    async fn set_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
        page_job_id: Uuid,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(Self::page_by_number_key(main_id, page_number), page_job_id.to_string())
            .await?;
        Ok(())
    }

    async fn get_page_child_by_number(
        &self,
        main_id: Uuid,
        page_number: i32,
    ) -> Result<Option<Uuid>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::page_by_number_key(main_id, page_number)).await?;
        Ok(raw.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    async fn count_completed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError> {
        self.count_page_children_with_status(main_id, Status::Completed).await
    }

    async fn count_failed_page_children(&self, main_id: Uuid) -> Result<usize, CacheError> {
        self.count_page_children_with_status(main_id, Status::Failed).await
    }

    async fn all_page_children_terminal(&self, main_id: Uuid) -> Result<bool, CacheError> {
        let children = self.get_page_children(main_id).await?;
        if children.is_empty() {
            return Ok(false);
        }
        for child in children {
            let status = self.get_status(child).await?;
            match status {
                Some(record) if record.status.is_terminal() => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn set_result(&self, job_id: Uuid, blob: serde_json::Value) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&blob)
            .map_err(|e| CacheError::Backend(format!("serialize result: {e}")))?;
        let _: () = conn.set(Self::result_key(job_id), json).await?;
        Ok(())
    }

    async fn get_result(&self, job_id: Uuid) -> Result<Option<serde_json::Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::result_key(job_id)).await?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| CacheError::Backend(format!("deserialize result: {e}"))),
        }
    }

    async fn purge(&self, main_id: Uuid) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let page_children = self.get_page_children(main_id).await.unwrap_or_default();

        let mut keys = vec![
            Self::status_key(main_id),
            Self::result_key(main_id),
            Self::pages_total_key(main_id),
            Self::children_key(main_id, ChildRole::Split),
            Self::children_key(main_id, ChildRole::Page),
            Self::children_key(main_id, ChildRole::Merge),
        ];
        for child in &page_children {
            keys.push(Self::status_key(*child));
            keys.push(Self::result_key(*child));
        }

        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

impl RedisStatusCache {
    async fn count_page_children_with_status(
        &self,
        main_id: Uuid,
        status: Status,
    ) -> Result<usize, CacheError> {
        let children = self.get_page_children(main_id).await?;
        let mut count = 0;
        for child in children {
            if let Some(record) = self.get_status(child).await? {
                if record.status == status {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}
