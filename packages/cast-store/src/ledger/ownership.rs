// Ownership ledger: one row per logical file entry
use super::{from_db, to_db};
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::models::{OwnershipEntry, Visibility};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;

const COLUMNS: &str = "id, fingerprint, owner_id, uploader_name, display_name, tags, \
                       visibility, is_duplicate, download_count, created_at";

fn entry_from_row(row: &SqliteRow) -> CoreResult<OwnershipEntry> {
    let fingerprint: String = row.try_get("fingerprint")?;
    let tags: String = row.try_get("tags")?;
    let visibility: String = row.try_get("visibility")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(OwnershipEntry {
        id: row.try_get("id")?,
        fingerprint: Fingerprint::from_str(&fingerprint)?,
        owner_id: row.try_get("owner_id")?,
        uploader_name: row.try_get("uploader_name")?,
        display_name: row.try_get("display_name")?,
        tags: serde_json::from_str(&tags).map_err(|e| {
            CoreError::StorageUnavailable(format!("corrupt tags in metadata: {}", e))
        })?,
        visibility: Visibility::from_str(&visibility)?,
        is_duplicate: row.try_get("is_duplicate")?,
        download_count: from_db(row.try_get("download_count")?, "download_count")?,
        created_at,
    })
}

fn encode_tags(tags: &[String]) -> CoreResult<String> {
    serde_json::to_string(tags)
        .map_err(|e| CoreError::InvalidArgument(format!("unencodable tags: {}", e)))
}

pub async fn insert(conn: &mut SqliteConnection, entry: &OwnershipEntry) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO ownership_entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        COLUMNS
    ))
    .bind(&entry.id)
    .bind(entry.fingerprint.to_hex())
    .bind(&entry.owner_id)
    .bind(&entry.uploader_name)
    .bind(&entry.display_name)
    .bind(encode_tags(&entry.tags)?)
    .bind(entry.visibility.as_str())
    .bind(entry.is_duplicate)
    .bind(to_db(entry.download_count)?)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> CoreResult<Option<OwnershipEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM ownership_entries WHERE id = ?",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Returns `false` if there was no such entry
pub async fn delete(conn: &mut SqliteConnection, id: &str) -> CoreResult<bool> {
    let result = sqlx::query("DELETE FROM ownership_entries WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Whether `owner_id` holds at least one live entry for `fingerprint`
pub async fn owner_holds(
    conn: &mut SqliteConnection,
    owner_id: &str,
    fingerprint: &Fingerprint,
) -> CoreResult<bool> {
    let held: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM ownership_entries WHERE owner_id = ? AND fingerprint = ?)",
    )
    .bind(owner_id)
    .bind(fingerprint.to_hex())
    .fetch_one(&mut *conn)
    .await?;

    Ok(held)
}

pub async fn count_for_fingerprint(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> CoreResult<u64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM ownership_entries WHERE fingerprint = ?")
            .bind(fingerprint.to_hex())
            .fetch_one(&mut *conn)
            .await?;

    from_db(count, "entry count")
}

/// Live entry count for every referenced fingerprint
pub async fn counts_by_fingerprint(
    conn: &mut SqliteConnection,
) -> CoreResult<HashMap<Fingerprint, u64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT fingerprint, COUNT(*) FROM ownership_entries GROUP BY fingerprint",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(fingerprint, count)| -> CoreResult<(Fingerprint, u64)> {
            Ok((
                Fingerprint::from_str(&fingerprint)?,
                from_db(count, "entry count")?,
            ))
        })
        .collect()
}

/// Bytes each owner should be charged: the size of every distinct content
/// they hold at least one entry for
pub async fn held_bytes_by_owner(conn: &mut SqliteConnection) -> CoreResult<HashMap<String, u64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT held.owner_id, SUM(c.byte_size)
         FROM (SELECT DISTINCT owner_id, fingerprint FROM ownership_entries) AS held
         JOIN content_records c ON c.fingerprint = held.fingerprint
         GROUP BY held.owner_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(owner, bytes)| -> CoreResult<(String, u64)> {
            Ok((owner, from_db(bytes, "held bytes")?))
        })
        .collect()
}

pub async fn list_for_owner(
    conn: &mut SqliteConnection,
    owner_id: &str,
) -> CoreResult<Vec<OwnershipEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM ownership_entries WHERE owner_id = ? ORDER BY rowid",
        COLUMNS
    ))
    .bind(owner_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

pub async fn set_display_name(
    conn: &mut SqliteConnection,
    id: &str,
    display_name: &str,
) -> CoreResult<bool> {
    let result = sqlx::query("UPDATE ownership_entries SET display_name = ? WHERE id = ?")
        .bind(display_name)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_visibility(
    conn: &mut SqliteConnection,
    id: &str,
    visibility: Visibility,
) -> CoreResult<bool> {
    let result = sqlx::query("UPDATE ownership_entries SET visibility = ? WHERE id = ?")
        .bind(visibility.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_tags(conn: &mut SqliteConnection, id: &str, tags: &[String]) -> CoreResult<bool> {
    let result = sqlx::query("UPDATE ownership_entries SET tags = ? WHERE id = ?")
        .bind(encode_tags(tags)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Returns the new counter, or `None` if the entry is gone
pub async fn increment_downloads(
    conn: &mut SqliteConnection,
    id: &str,
) -> CoreResult<Option<u64>> {
    let count: Option<i64> = sqlx::query_scalar(
        "UPDATE ownership_entries SET download_count = download_count + 1
         WHERE id = ? RETURNING download_count",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    count.map(|c| from_db(c, "download_count")).transpose()
}
