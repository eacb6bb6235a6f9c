//! Postgres-backed request store.
//!
//! Schema: `migrations/0001_request_records.sql`. Every write is a single
//! conditional statement, so the database enforces the same guards as the
//! in-memory store:
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | `create` | `ON CONFLICT … DO UPDATE … WHERE expires_at <= now` (only an expired row is replaced) |
//! | `transition` | `WHERE status = ANY(allowed_from) AND expires_at > now` |
//! | `claim_requeue` | `WHERE status = 'PENDING' AND updated_at <= cutoff AND expires_at > now` |
//! | `get` | `WHERE expires_at > now` |
//!
//! SQLx errors are mapped to `RequestStoreError::Storage`; malformed JSON
//! columns map to `RequestStoreError::Serialization`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use handoff_core::{OwnerId, RequestId};

use super::store::{RequestStore, RequestStoreError, log_refused_transition};
use super::types::{
    CreateOutcome, NewRequest, RequestError, RequestRecord, RequestResult, RequestStatus,
    Transition, TransitionOutcome, expiry_from,
};

/// Default table name used by the migration.
pub const DEFAULT_TABLE: &str = "request_records";

const SCHEMA: &str = include_str!("../../migrations/0001_request_records.sql");

const COLUMNS: &str =
    "request_id, owner_id, status, payload, result, error, created_at, updated_at, expires_at";

#[derive(Debug, Clone)]
pub struct PostgresRequestStore {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresRequestStore {
    /// Create a store over `table` (see [`DEFAULT_TABLE`]).
    ///
    /// The table name is interpolated into SQL, so it must be a plain
    /// lower-case identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, RequestStoreError> {
        let table = table.into();
        let valid = table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && table
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(RequestStoreError::Storage(format!(
                "invalid table name: {table:?}"
            )));
        }

        Ok(Self {
            pool: Arc::new(pool),
            table,
        })
    }

    /// Apply the bundled schema. Idempotent; only valid for [`DEFAULT_TABLE`].
    pub async fn ensure_schema(&self) -> Result<(), RequestStoreError> {
        if self.table != DEFAULT_TABLE {
            return Err(RequestStoreError::Storage(format!(
                "bundled schema only creates {DEFAULT_TABLE}, not {}",
                self.table
            )));
        }
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| RequestStoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn current_status(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Option<RequestStatus>, RequestStoreError> {
        let sql = format!(
            "SELECT status FROM {} WHERE request_id = $1 AND owner_id = $2 AND expires_at > $3",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(request_id.as_str())
            .bind(owner_id.as_str())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| map_sqlx_error("current_status", e))?;
            parse_status(&status)
        })
        .transpose()
    }
}

#[async_trait]
impl RequestStore for PostgresRequestStore {
    #[instrument(
        skip(self, request),
        fields(request_id = %request.request_id, owner_id = %request.owner_id),
        err
    )]
    async fn create(&self, request: NewRequest) -> Result<CreateOutcome, RequestStoreError> {
        let now = Utc::now();
        let record = request.into_record(now);

        let sql = format!(
            r#"
            INSERT INTO {table} ({COLUMNS})
            VALUES ($1, $2, $3, $4, NULL, NULL, $5, $5, $6)
            ON CONFLICT (request_id, owner_id) DO UPDATE SET
                status = EXCLUDED.status,
                payload = EXCLUDED.payload,
                result = NULL,
                error = NULL,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                expires_at = EXCLUDED.expires_at
            WHERE {table}.expires_at <= $5
            RETURNING {COLUMNS}
            "#,
            table = self.table
        );

        let inserted = sqlx::query(&sql)
            .bind(record.request_id.as_str())
            .bind(record.owner_id.as_str())
            .bind(record.status.as_str())
            .bind(&record.payload)
            .bind(now)
            .bind(record.expires_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create", e))?;

        if let Some(row) = inserted {
            return Ok(CreateOutcome::Created(record_from_row(&row)?));
        }

        // Conflict with a live row: report it unchanged.
        match self.get(&record.request_id, &record.owner_id).await? {
            Some(existing) => Ok(CreateOutcome::Existing(existing)),
            None => Err(RequestStoreError::Storage(format!(
                "request {} vanished during create",
                record.request_id
            ))),
        }
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn get(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<Option<RequestRecord>, RequestStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE request_id = $1 AND owner_id = $2 AND expires_at > $3",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(request_id.as_str())
            .bind(owner_id.as_str())
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(
        skip(self, transition),
        fields(request_id = %request_id, target = %transition.status()),
        err
    )]
    async fn transition(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        transition: Transition,
    ) -> Result<TransitionOutcome, RequestStoreError> {
        let target = transition.status();
        if target == RequestStatus::Pending {
            return Err(RequestStoreError::InvalidTransition(
                "records cannot be moved back to PENDING".to_string(),
            ));
        }

        let allowed_from: Vec<String> = [
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ]
        .into_iter()
        .filter(|s| s.can_transition_to(target))
        .map(|s| s.as_str().to_string())
        .collect();

        let now = Utc::now();
        let result = transition.result().map(to_json).transpose()?;
        let error = transition.error().map(to_json).transpose()?;
        let expires_at = transition.ttl().map(|ttl| expiry_from(now, ttl));

        let sql = format!(
            r#"
            UPDATE {} SET
                status = $3,
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                updated_at = $6,
                expires_at = COALESCE($7, expires_at)
            WHERE request_id = $1
              AND owner_id = $2
              AND expires_at > $6
              AND status = ANY($8)
            RETURNING {COLUMNS}
            "#,
            self.table
        );

        let updated = sqlx::query(&sql)
            .bind(request_id.as_str())
            .bind(owner_id.as_str())
            .bind(target.as_str())
            .bind(result)
            .bind(error)
            .bind(now)
            .bind(expires_at)
            .bind(&allowed_from)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;

        if let Some(row) = updated {
            return Ok(TransitionOutcome::Applied(record_from_row(&row)?));
        }

        match self.current_status(request_id, owner_id, now).await? {
            Some(current) => {
                log_refused_transition(request_id, current, target);
                Ok(TransitionOutcome::Ignored { current })
            }
            None => Err(RequestStoreError::NotFound(request_id.clone())),
        }
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn claim_requeue(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RequestStoreError> {
        let sql = format!(
            r#"
            UPDATE {} SET updated_at = $4
            WHERE request_id = $1
              AND owner_id = $2
              AND status = $3
              AND updated_at <= $5
              AND expires_at > $4
            "#,
            self.table
        );
        let done = sqlx::query(&sql)
            .bind(request_id.as_str())
            .bind(owner_id.as_str())
            .bind(RequestStatus::Pending.as_str())
            .bind(Utc::now())
            .bind(stale_before)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_requeue", e))?;
        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn delete(
        &self,
        request_id: &RequestId,
        owner_id: &OwnerId,
    ) -> Result<(), RequestStoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE request_id = $1 AND owner_id = $2",
            self.table
        );
        sqlx::query(&sql)
            .bind(request_id.as_str())
            .bind(owner_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self) -> Result<usize, RequestStoreError> {
        let sql = format!("DELETE FROM {} WHERE expires_at <= $1", self.table);
        let done = sqlx::query(&sql)
            .bind(Utc::now())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(done.rows_affected() as usize)
    }
}

fn record_from_row(row: &PgRow) -> Result<RequestRecord, RequestStoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_row", e);

    let request_id: String = row.try_get("request_id").map_err(get_err)?;
    let owner_id: String = row.try_get("owner_id").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(get_err)?;
    let result: Option<serde_json::Value> = row.try_get("result").map_err(get_err)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(get_err)?;

    Ok(RequestRecord {
        request_id: RequestId::parse(&request_id)
            .map_err(|e| RequestStoreError::Serialization(e.to_string()))?,
        owner_id: OwnerId::from_hashed(owner_id),
        status: parse_status(&status)?,
        payload,
        result: result.map(from_json::<RequestResult>).transpose()?,
        error: error.map(from_json::<RequestError>).transpose()?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        expires_at: row.try_get("expires_at").map_err(get_err)?,
    })
}

fn parse_status(s: &str) -> Result<RequestStatus, RequestStoreError> {
    RequestStatus::parse(s)
        .ok_or_else(|| RequestStoreError::Serialization(format!("unknown status {s:?}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RequestStoreError> {
    serde_json::to_value(value).map_err(|e| RequestStoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, RequestStoreError> {
    serde_json::from_value(value).map_err(|e| RequestStoreError::Serialization(e.to_string()))
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> RequestStoreError {
    RequestStoreError::Storage(format!("{operation}: {err}"))
}
