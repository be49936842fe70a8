//! `SQLite` implementation of the [`DownloadIndex`] port.

use async_trait::async_trait;
use base64::Engine as _;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use dlvault_core::{
    DownloadIndex, DownloadRecord, DownloadState, FailureReason, IndexError, NotMetRequirements,
};

/// Persists download records to `SQLite` for durability across restarts.
pub struct SqliteDownloadIndex {
    pool: SqlitePool,
}

impl SqliteDownloadIndex {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DownloadIndex for SqliteDownloadIndex {
    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>, IndexError> {
        let row = sqlx::query("SELECT * FROM download_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::storage(e.to_string()))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn get_states(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRecord>, IndexError> {
        let rows = sqlx::query("SELECT * FROM download_records")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexError::storage(e.to_string()))?;

        rows.iter()
            .map(row_to_record)
            .filter(|r| match r {
                Ok(record) => states.is_empty() || states.contains(&record.state),
                Err(_) => true,
            })
            .collect()
    }

    async fn put(&self, record: &DownloadRecord) -> Result<(), IndexError> {
        let stream_keys_json =
            serde_json::to_string(&record.stream_keys).map_err(|e| IndexError::Serialization(e.to_string()))?;
        let custom_metadata_b64 =
            base64::engine::general_purpose::STANDARD.encode(&record.custom_metadata);
        let state_str = state_to_str(record.state);
        let failure_reason_str = failure_reason_to_str(record.failure_reason);

        sqlx::query(
            r#"
            INSERT INTO download_records (
                id, kind, uri, cache_key, stream_keys, custom_metadata,
                state, failure_reason, not_met_requirements, manual_stop_reason,
                start_time_ms, update_time_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                uri = excluded.uri,
                cache_key = excluded.cache_key,
                stream_keys = excluded.stream_keys,
                custom_metadata = excluded.custom_metadata,
                state = excluded.state,
                failure_reason = excluded.failure_reason,
                not_met_requirements = excluded.not_met_requirements,
                manual_stop_reason = excluded.manual_stop_reason,
                start_time_ms = excluded.start_time_ms,
                update_time_ms = excluded.update_time_ms
            "#,
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(&record.uri)
        .bind(&record.cache_key)
        .bind(&stream_keys_json)
        .bind(&custom_metadata_b64)
        .bind(state_str)
        .bind(failure_reason_str)
        .bind(record.not_met_requirements.bits() as i64)
        .bind(record.manual_stop_reason as i64)
        .bind(record.start_time_ms)
        .bind(record.update_time_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexError::storage(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM download_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::storage(e.to_string()))?;
        Ok(())
    }

    async fn set_manual_stop_reason(&self, reason: i32) -> Result<(), IndexError> {
        sqlx::query("UPDATE download_records SET manual_stop_reason = ?")
            .bind(reason as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::storage(e.to_string()))?;
        Ok(())
    }

    async fn set_manual_stop_reason_for(&self, id: &str, reason: i32) -> Result<(), IndexError> {
        sqlx::query("UPDATE download_records SET manual_stop_reason = ? WHERE id = ?")
            .bind(reason as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::storage(e.to_string()))?;
        Ok(())
    }
}

fn state_to_str(state: DownloadState) -> &'static str {
    match state {
        DownloadState::Queued => "queued",
        DownloadState::Stopped => "stopped",
        DownloadState::Downloading => "downloading",
        DownloadState::Completed => "completed",
        DownloadState::Failed => "failed",
        DownloadState::Removing => "removing",
        DownloadState::Restarting => "restarting",
        DownloadState::Removed => "removed",
    }
}

fn str_to_state(s: &str) -> Result<DownloadState, IndexError> {
    Ok(match s {
        "queued" => DownloadState::Queued,
        "stopped" => DownloadState::Stopped,
        "downloading" => DownloadState::Downloading,
        "completed" => DownloadState::Completed,
        "failed" => DownloadState::Failed,
        "removing" => DownloadState::Removing,
        "restarting" => DownloadState::Restarting,
        "removed" => DownloadState::Removed,
        other => return Err(IndexError::Serialization(format!("unknown state '{other}'"))),
    })
}

fn failure_reason_to_str(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::None => "none",
        FailureReason::Unknown => "unknown",
    }
}

fn str_to_failure_reason(s: &str) -> FailureReason {
    match s {
        "unknown" => FailureReason::Unknown,
        _ => FailureReason::None,
    }
}

fn row_to_record(row: &SqliteRow) -> Result<DownloadRecord, IndexError> {
    let map_err = |e: sqlx::Error| IndexError::storage(format!("column read error: {e}"));

    let id: String = row.try_get("id").map_err(map_err)?;
    let kind: String = row.try_get("kind").map_err(map_err)?;
    let uri: String = row.try_get("uri").map_err(map_err)?;
    let cache_key: Option<String> = row.try_get("cache_key").map_err(map_err)?;
    let stream_keys_json: String = row.try_get("stream_keys").map_err(map_err)?;
    let custom_metadata_b64: String = row.try_get("custom_metadata").map_err(map_err)?;
    let state_str: String = row.try_get("state").map_err(map_err)?;
    let failure_reason_str: String = row.try_get("failure_reason").map_err(map_err)?;
    let not_met_requirements: i64 = row.try_get("not_met_requirements").map_err(map_err)?;
    let manual_stop_reason: i64 = row.try_get("manual_stop_reason").map_err(map_err)?;
    let start_time_ms: i64 = row.try_get("start_time_ms").map_err(map_err)?;
    let update_time_ms: i64 = row.try_get("update_time_ms").map_err(map_err)?;

    let stream_keys: Vec<String> = serde_json::from_str(&stream_keys_json)
        .map_err(|e| IndexError::Serialization(e.to_string()))?;
    let custom_metadata = base64::engine::general_purpose::STANDARD
        .decode(custom_metadata_b64.as_bytes())
        .map_err(|e| IndexError::Serialization(e.to_string()))?;

    Ok(DownloadRecord {
        id,
        kind,
        uri,
        cache_key,
        stream_keys,
        custom_metadata,
        state: str_to_state(&state_str)?,
        failure_reason: str_to_failure_reason(&failure_reason_str),
        not_met_requirements: NotMetRequirements::from_bits_truncate(not_met_requirements as u32),
        manual_stop_reason: manual_stop_reason as i32,
        start_time_ms,
        update_time_ms,
    })
}
