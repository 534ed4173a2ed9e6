// Fingerprint index: fingerprint -> location, type, size and reference count
use super::{from_db, to_db};
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::models::ContentRecord;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;

const COLUMNS: &str =
    "fingerprint, content_type, byte_size, physical_location, ref_count, created_at";

fn record_from_row(row: &SqliteRow) -> CoreResult<ContentRecord> {
    let fingerprint: String = row.try_get("fingerprint")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(ContentRecord {
        fingerprint: Fingerprint::from_str(&fingerprint)?,
        content_type: row.try_get("content_type")?,
        byte_size: from_db(row.try_get("byte_size")?, "byte_size")?,
        physical_location: row.try_get("physical_location")?,
        ref_count: from_db(row.try_get("ref_count")?, "ref_count")?,
        created_at,
    })
}

pub async fn get(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> CoreResult<Option<ContentRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM content_records WHERE fingerprint = ?",
        COLUMNS
    ))
    .bind(fingerprint.to_hex())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Insert a record with `ref_count = 1` unless one already exists.
///
/// Returns `true` if this call created the record.
pub async fn create_if_absent(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
    content_type: &str,
    byte_size: u64,
) -> CoreResult<bool> {
    let result = sqlx::query(
        "INSERT INTO content_records
            (fingerprint, content_type, byte_size, physical_location, ref_count, created_at)
         VALUES (?, ?, ?, ?, 1, ?)
         ON CONFLICT (fingerprint) DO NOTHING",
    )
    .bind(fingerprint.to_hex())
    .bind(content_type)
    .bind(to_db(byte_size)?)
    .bind(fingerprint.physical_location())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Returns the new count
pub async fn increment_ref_count(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> CoreResult<u64> {
    let count: Option<i64> = sqlx::query_scalar(
        "UPDATE content_records SET ref_count = ref_count + 1
         WHERE fingerprint = ? RETURNING ref_count",
    )
    .bind(fingerprint.to_hex())
    .fetch_optional(&mut *conn)
    .await?;

    match count {
        Some(count) => from_db(count, "ref_count"),
        None => Err(CoreError::NotFound(format!("content {}", fingerprint))),
    }
}

/// Returns the remaining count. Never goes below zero.
pub async fn decrement_ref_count(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> CoreResult<u64> {
    let count: Option<i64> = sqlx::query_scalar(
        "UPDATE content_records SET ref_count = ref_count - 1
         WHERE fingerprint = ? AND ref_count > 0 RETURNING ref_count",
    )
    .bind(fingerprint.to_hex())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(count) = count {
        return from_db(count, "ref_count");
    }

    if get(conn, fingerprint).await?.is_some() {
        Err(CoreError::InvalidArgument(format!(
            "reference count of {} is already zero",
            fingerprint
        )))
    } else {
        Err(CoreError::NotFound(format!("content {}", fingerprint)))
    }
}

/// Delete the record only if nothing references it any more.
pub async fn delete_if_zero(
    conn: &mut SqliteConnection,
    fingerprint: &Fingerprint,
) -> CoreResult<bool> {
    let result =
        sqlx::query("DELETE FROM content_records WHERE fingerprint = ? AND ref_count = 0")
            .bind(fingerprint.to_hex())
            .execute(&mut *conn)
            .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn all(conn: &mut SqliteConnection) -> CoreResult<Vec<ContentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM content_records ORDER BY fingerprint",
        COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(record_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetadataDb;

    #[tokio::test]
    async fn test_create_if_absent_once() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let fp = Fingerprint::compute(b"content");

        assert!(get(&mut conn, &fp).await.unwrap().is_none());
        assert!(create_if_absent(&mut conn, &fp, "text/plain", 7).await.unwrap());
        assert!(!create_if_absent(&mut conn, &fp, "application/pdf", 7).await.unwrap());

        let record = get(&mut conn, &fp).await.unwrap().unwrap();
        assert_eq!(record.ref_count, 1);
        assert_eq!(record.byte_size, 7);
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.physical_location, fp.to_hex());
    }

    #[tokio::test]
    async fn test_ref_count_lifecycle() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let fp = Fingerprint::compute(b"refs");

        create_if_absent(&mut conn, &fp, "text/plain", 4).await.unwrap();
        assert_eq!(increment_ref_count(&mut conn, &fp).await.unwrap(), 2);

        assert_eq!(decrement_ref_count(&mut conn, &fp).await.unwrap(), 1);
        assert!(!delete_if_zero(&mut conn, &fp).await.unwrap());

        assert_eq!(decrement_ref_count(&mut conn, &fp).await.unwrap(), 0);
        assert!(matches!(
            decrement_ref_count(&mut conn, &fp).await,
            Err(CoreError::InvalidArgument(_))
        ));

        assert!(delete_if_zero(&mut conn, &fp).await.unwrap());
        assert!(get(&mut conn, &fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_record() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let fp = Fingerprint::compute(b"absent");

        assert!(matches!(
            increment_ref_count(&mut conn, &fp).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            decrement_ref_count(&mut conn, &fp).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(!delete_if_zero(&mut conn, &fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_sorted() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        for data in [&b"a"[..], b"b", b"c"] {
            let fp = Fingerprint::compute(data);
            create_if_absent(&mut conn, &fp, "text/plain", 1).await.unwrap();
        }

        let records = all(&mut conn).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records
            .windows(2)
            .all(|w| w[0].fingerprint.to_hex() < w[1].fingerprint.to_hex()));
    }
}
