use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use bazaar_core::{MediaId, StoreId};
use bazaar_media::{Attachment, Media, MediaStatus};

use super::{PgTx, PostgresStore, map_sqlx_error, parse_tag};
use crate::error::ServiceResult;
use crate::repositories::{AttachmentRepository, MediaRepository};

#[async_trait]
impl MediaRepository<PgTx> for PostgresStore {
    async fn delete(&self, tx: &mut PgTx, id: MediaId) -> ServiceResult<()> {
        sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("media_delete", e))?;
        Ok(())
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> ServiceResult<Vec<Media>> {
        let rows = sqlx::query(
            r#"
            SELECT id, store_id, status, object_key, created_at
            FROM media
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("media_list_pending_before", e))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(Media {
                    id: MediaId::from_uuid(row.try_get("id")?),
                    store_id: StoreId::from_uuid(row.try_get("store_id")?),
                    status: parse_tag::<MediaStatus>("media.status", &status)?,
                    object_key: row.try_get("object_key")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AttachmentRepository<PgTx> for PostgresStore {
    async fn list_by_media_id(&self, media_id: MediaId) -> ServiceResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, media_id FROM media_attachments WHERE media_id = $1",
        )
        .bind(media_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("attachments_list_by_media_id", e))?;

        rows.iter()
            .map(|row| {
                Ok(Attachment {
                    entity_type: row.try_get("entity_type")?,
                    entity_id: row.try_get("entity_id")?,
                    media_id: MediaId::from_uuid(row.try_get("media_id")?),
                })
            })
            .collect()
    }

    async fn delete(
        &self,
        tx: &mut PgTx,
        entity_type: &str,
        entity_id: &str,
        media_id: MediaId,
    ) -> ServiceResult<()> {
        sqlx::query(
            r#"
            DELETE FROM media_attachments
            WHERE entity_type = $1 AND entity_id = $2 AND media_id = $3
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(media_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("attachment_delete", e))?;
        Ok(())
    }

    async fn delete_by_media_id(&self, tx: &mut PgTx, media_id: MediaId) -> ServiceResult<u64> {
        let result = sqlx::query("DELETE FROM media_attachments WHERE media_id = $1")
            .bind(media_id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("attachments_delete_by_media_id", e))?;
        Ok(result.rows_affected())
    }
}
