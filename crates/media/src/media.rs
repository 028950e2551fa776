use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::{DomainError, MediaId, StoreId};

/// Upload state of a media row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    /// Presigned but never confirmed by the client.
    Pending,
    Uploaded,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Uploaded => "uploaded",
            MediaStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for MediaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MediaStatus::Pending),
            "uploaded" => Ok(MediaStatus::Uploaded),
            "failed" => Ok(MediaStatus::Failed),
            other => Err(DomainError::unknown_tag("media status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub id: MediaId,
    pub store_id: StoreId,
    pub status: MediaStatus,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}

impl Media {
    /// Still pending and created strictly before `cutoff`.
    pub fn is_stale_pending(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == MediaStatus::Pending && self.created_at < cutoff
    }
}

/// Link between a media row and the entity that uses it
/// (e.g. `license/<id>`, `product/<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub entity_type: String,
    /// Canonical string form of the owning entity's id.
    pub entity_id: String,
    pub media_id: MediaId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_old_pending_rows_are_stale() {
        let now = Utc::now();
        let mut media = Media {
            id: MediaId::new(),
            store_id: StoreId::new(),
            status: MediaStatus::Pending,
            object_key: "uploads/a.png".into(),
            created_at: now - Duration::days(8),
        };
        let cutoff = now - Duration::days(7);
        assert!(media.is_stale_pending(cutoff));

        media.status = MediaStatus::Uploaded;
        assert!(!media.is_stale_pending(cutoff));

        media.status = MediaStatus::Pending;
        media.created_at = now - Duration::days(6);
        assert!(!media.is_stale_pending(cutoff));
    }

    #[test]
    fn status_tags_round_trip() {
        for status in [MediaStatus::Pending, MediaStatus::Uploaded, MediaStatus::Failed] {
            assert_eq!(status.as_str().parse::<MediaStatus>().unwrap(), status);
        }
        assert!("gone".parse::<MediaStatus>().is_err());
    }
}
