// Quota ledger: bytes charged against a per-owner limit
use super::{from_db, to_db};
use crate::error::{CoreError, CoreResult};
use crate::models::QuotaRecord;
use sqlx::SqliteConnection;
use std::collections::HashMap;

fn record(bytes_charged: i64, byte_limit: i64) -> CoreResult<QuotaRecord> {
    Ok(QuotaRecord {
        bytes_charged: from_db(bytes_charged, "bytes_charged")?,
        byte_limit: from_db(byte_limit, "byte_limit")?,
    })
}

pub async fn get(conn: &mut SqliteConnection, owner_id: &str) -> CoreResult<Option<QuotaRecord>> {
    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT bytes_charged, byte_limit FROM quota_records WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(charged, limit)| record(charged, limit)).transpose()
}

/// Read an owner's quota without creating it
pub async fn get_or_default(
    conn: &mut SqliteConnection,
    owner_id: &str,
    default_limit: u64,
) -> CoreResult<QuotaRecord> {
    Ok(get(conn, owner_id).await?.unwrap_or(QuotaRecord {
        bytes_charged: 0,
        byte_limit: default_limit,
    }))
}

/// Create the owner's record with the default limit on first activity
pub async fn ensure(
    conn: &mut SqliteConnection,
    owner_id: &str,
    default_limit: u64,
) -> CoreResult<QuotaRecord> {
    sqlx::query(
        "INSERT INTO quota_records (owner_id, bytes_charged, byte_limit) VALUES (?, 0, ?)
         ON CONFLICT (owner_id) DO NOTHING",
    )
    .bind(owner_id)
    .bind(to_db(default_limit)?)
    .execute(&mut *conn)
    .await?;

    get(conn, owner_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("quota for {}", owner_id)))
}

/// Add `bytes` to the owner's charge if the result stays within the limit.
///
/// On `QuotaExceeded` nothing is changed.
pub async fn charge_bytes(
    conn: &mut SqliteConnection,
    owner_id: &str,
    bytes: u64,
    default_limit: u64,
) -> CoreResult<QuotaRecord> {
    let current = ensure(conn, owner_id, default_limit).await?;

    let updated: Option<(i64, i64)> = sqlx::query_as(
        "UPDATE quota_records SET bytes_charged = bytes_charged + ?1
         WHERE owner_id = ?2 AND bytes_charged + ?1 <= byte_limit
         RETURNING bytes_charged, byte_limit",
    )
    .bind(to_db(bytes)?)
    .bind(owner_id)
    .fetch_optional(&mut *conn)
    .await?;

    match updated {
        Some((charged, limit)) => record(charged, limit),
        None => Err(CoreError::QuotaExceeded {
            owner_id: owner_id.to_string(),
            requested: bytes,
            charged: current.bytes_charged,
            limit: current.byte_limit,
        }),
    }
}

/// Subtract `bytes` from the owner's charge, flooring at zero.
///
/// Returns `None` if the owner has no record.
pub async fn uncharge_bytes(
    conn: &mut SqliteConnection,
    owner_id: &str,
    bytes: u64,
) -> CoreResult<Option<QuotaRecord>> {
    let Some(current) = get(conn, owner_id).await? else {
        return Ok(None);
    };

    if current.bytes_charged < bytes {
        tracing::warn!(
            owner_id,
            charged = current.bytes_charged,
            bytes,
            "uncharge exceeds charged bytes, flooring at zero"
        );
    }

    let (charged, limit): (i64, i64) = sqlx::query_as(
        "UPDATE quota_records SET bytes_charged = MAX(bytes_charged - ?, 0)
         WHERE owner_id = ? RETURNING bytes_charged, byte_limit",
    )
    .bind(to_db(bytes)?)
    .bind(owner_id)
    .fetch_one(&mut *conn)
    .await?;

    record(charged, limit).map(Some)
}

/// Set the owner's limit. A limit below the current charge is allowed and
/// only blocks further charges.
pub async fn set_limit(
    conn: &mut SqliteConnection,
    owner_id: &str,
    byte_limit: u64,
) -> CoreResult<QuotaRecord> {
    let (charged, limit): (i64, i64) = sqlx::query_as(
        "INSERT INTO quota_records (owner_id, bytes_charged, byte_limit) VALUES (?, 0, ?)
         ON CONFLICT (owner_id) DO UPDATE SET byte_limit = excluded.byte_limit
         RETURNING bytes_charged, byte_limit",
    )
    .bind(owner_id)
    .bind(to_db(byte_limit)?)
    .fetch_one(&mut *conn)
    .await?;

    record(charged, limit)
}

pub async fn all(conn: &mut SqliteConnection) -> CoreResult<HashMap<String, QuotaRecord>> {
    let rows: Vec<(String, i64, i64)> =
        sqlx::query_as("SELECT owner_id, bytes_charged, byte_limit FROM quota_records")
            .fetch_all(&mut *conn)
            .await?;

    rows.into_iter()
        .map(|(owner, charged, limit)| -> CoreResult<(String, QuotaRecord)> {
            Ok((owner, record(charged, limit)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetadataDb;

    #[tokio::test]
    async fn test_default_without_record() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let quota = get_or_default(&mut conn, "u1", 100).await.unwrap();
        assert_eq!(quota.bytes_charged, 0);
        assert_eq!(quota.byte_limit, 100);
        assert!(get(&mut conn, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_charge_within_limit() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let quota = charge_bytes(&mut conn, "u1", 60, 100).await.unwrap();
        assert_eq!(quota.bytes_charged, 60);

        // Exactly at the limit is allowed
        let quota = charge_bytes(&mut conn, "u1", 40, 100).await.unwrap();
        assert_eq!(quota.bytes_charged, 100);
    }

    #[tokio::test]
    async fn test_charge_over_limit_is_rejected_without_mutation() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        charge_bytes(&mut conn, "u1", 90, 100).await.unwrap();
        let err = charge_bytes(&mut conn, "u1", 11, 100).await.unwrap_err();

        match err {
            CoreError::QuotaExceeded {
                requested,
                charged,
                limit,
                ..
            } => {
                assert_eq!((requested, charged, limit), (11, 90, 100));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(get(&mut conn, "u1").await.unwrap().unwrap().bytes_charged, 90);
    }

    #[tokio::test]
    async fn test_uncharge_floors_at_zero() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        assert!(uncharge_bytes(&mut conn, "nobody", 5).await.unwrap().is_none());

        charge_bytes(&mut conn, "u1", 30, 100).await.unwrap();
        let quota = uncharge_bytes(&mut conn, "u1", 10).await.unwrap().unwrap();
        assert_eq!(quota.bytes_charged, 20);

        let quota = uncharge_bytes(&mut conn, "u1", 50).await.unwrap().unwrap();
        assert_eq!(quota.bytes_charged, 0);
    }

    #[tokio::test]
    async fn test_set_limit() {
        let db = MetadataDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let quota = set_limit(&mut conn, "u1", 500).await.unwrap();
        assert_eq!(quota.byte_limit, 500);

        charge_bytes(&mut conn, "u1", 400, 100).await.unwrap();

        // Lowering below the charge keeps the charge and blocks new ones
        let quota = set_limit(&mut conn, "u1", 300).await.unwrap();
        assert_eq!(quota.bytes_charged, 400);
        assert!(charge_bytes(&mut conn, "u1", 1, 100).await.is_err());
        assert!(charge_bytes(&mut conn, "u1", 0, 100).await.is_err());

        let all = all(&mut conn).await.unwrap();
        assert_eq!(all["u1"].byte_limit, 300);
    }
}
