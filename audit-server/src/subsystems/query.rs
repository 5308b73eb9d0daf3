//! Query & lifecycle layer over the two audit tables.
//!
//! All SQL for `security_chat_logs` and `security_chat_sessions` lives here:
//! the capture writes, the admin listings, statistics, the expiry sweep, and
//! the deletion variants. Filters arrive pre-validated from audit-core and
//! are rendered with `QueryBuilder` so the count and page queries share one
//! condition set.

use anyhow::Result;
use audit_core::model::{
    CapturedMessage, ChatLog, ChatLogList, ChatSession, ChatSessionList, MessageFilter,
    PlatformBucket, SessionFilter, Stats,
};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

// ============================================================================
// WRITE PATH
// ============================================================================

/// One log row ready to persist. Built by the capture pipeline.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub session_id: String,
    pub request_id: Option<String>,
    pub client_request_id: Option<String>,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    pub platform: Option<String>,
    pub model: Option<String>,
    pub request_path: Option<String>,
    pub stream: bool,
    pub status_code: Option<i32>,
    pub messages: Vec<CapturedMessage>,
    pub message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Session aggregate merge input, derived from the same capture event.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub account_id: Option<i64>,
    pub group_id: Option<i64>,
    pub platform: Option<String>,
    pub model: Option<String>,
    pub message_preview: Option<String>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert_chat_log(pool: &PgPool, record: &LogRecord) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO security_chat_logs (
            session_id, request_id, client_request_id,
            user_id, api_key_id, account_id, group_id,
            platform, model, request_path, stream, status_code,
            messages, message_preview, created_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING id
        "#,
    )
    .bind(&record.session_id)
    .bind(&record.request_id)
    .bind(&record.client_request_id)
    .bind(record.user_id)
    .bind(record.api_key_id)
    .bind(record.account_id)
    .bind(record.group_id)
    .bind(&record.platform)
    .bind(&record.model)
    .bind(&record.request_path)
    .bind(record.stream)
    .bind(record.status_code)
    .bind(sqlx::types::Json(&record.messages))
    .bind(&record.message_preview)
    .bind(record.created_at)
    .bind(record.expires_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Atomic insert-or-merge of the session aggregate. The single-statement
/// upsert keeps the merge correct under concurrent writers: nullable ids
/// only fill gaps, strings only replace emptiness, timestamps only move
/// forward, and `first_at` is never overwritten.
pub async fn upsert_session(pool: &PgPool, record: &SessionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO security_chat_sessions (
            session_id, user_id, api_key_id, account_id, group_id,
            platform, model, message_preview, first_at, last_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (session_id) DO UPDATE SET
            user_id = COALESCE(EXCLUDED.user_id, security_chat_sessions.user_id),
            api_key_id = COALESCE(EXCLUDED.api_key_id, security_chat_sessions.api_key_id),
            account_id = COALESCE(EXCLUDED.account_id, security_chat_sessions.account_id),
            group_id = COALESCE(EXCLUDED.group_id, security_chat_sessions.group_id),
            platform = COALESCE(NULLIF(EXCLUDED.platform, ''), security_chat_sessions.platform),
            model = COALESCE(NULLIF(EXCLUDED.model, ''), security_chat_sessions.model),
            message_preview = COALESCE(NULLIF(EXCLUDED.message_preview, ''), security_chat_sessions.message_preview),
            last_at = GREATEST(security_chat_sessions.last_at, EXCLUDED.last_at),
            expires_at = GREATEST(security_chat_sessions.expires_at, EXCLUDED.expires_at)
        "#,
    )
    .bind(&record.session_id)
    .bind(record.user_id)
    .bind(record.api_key_id)
    .bind(record.account_id)
    .bind(record.group_id)
    .bind(&record.platform)
    .bind(&record.model)
    .bind(&record.message_preview)
    .bind(record.first_at)
    .bind(record.last_at)
    .bind(record.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// LISTINGS
// ============================================================================

fn push_session_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &SessionFilter,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    qb.push(" WHERE s.last_at >= ").push_bind(start);
    qb.push(" AND s.last_at <= ").push_bind(end);

    let session_id = filter.session_id.trim();
    if !session_id.is_empty() {
        qb.push(" AND s.session_id = ").push_bind(session_id.to_string());
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND s.user_id = ").push_bind(user_id);
    }
    if let Some(api_key_id) = filter.api_key_id {
        qb.push(" AND s.api_key_id = ").push_bind(api_key_id);
    }
    if let Some(account_id) = filter.account_id {
        qb.push(" AND s.account_id = ").push_bind(account_id);
    }
    if let Some(group_id) = filter.group_id {
        qb.push(" AND s.group_id = ").push_bind(group_id);
    }
    let platform = filter.platform.trim();
    if !platform.is_empty() {
        qb.push(" AND s.platform = ").push_bind(platform.to_string());
    }
    let model = filter.model.trim();
    if !model.is_empty() {
        qb.push(" AND s.model = ").push_bind(model.to_string());
    }
    let query = filter.query.trim();
    if !query.is_empty() {
        let pattern = format!("%{query}%");
        qb.push(" AND (s.session_id LIKE ").push_bind(pattern.clone());
        qb.push(" OR s.message_preview LIKE ").push_bind(pattern);
        qb.push(")");
    }
}

fn push_log_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &MessageFilter,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    qb.push(" WHERE 1 = 1");

    let session_id = filter.session_id.trim();
    if !session_id.is_empty() {
        qb.push(" AND session_id = ").push_bind(session_id.to_string());
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(api_key_id) = filter.api_key_id {
        qb.push(" AND api_key_id = ").push_bind(api_key_id);
    }
    if let Some(account_id) = filter.account_id {
        qb.push(" AND account_id = ").push_bind(account_id);
    }
    if let Some(group_id) = filter.group_id {
        qb.push(" AND group_id = ").push_bind(group_id);
    }
    let platform = filter.platform.trim();
    if !platform.is_empty() {
        qb.push(" AND platform = ").push_bind(platform.to_string());
    }
    let model = filter.model.trim();
    if !model.is_empty() {
        qb.push(" AND model = ").push_bind(model.to_string());
    }
    let request_path = filter.request_path.trim();
    if !request_path.is_empty() {
        qb.push(" AND request_path = ").push_bind(request_path.to_string());
    }
    if !filter.ignore_time_range {
        qb.push(" AND created_at >= ").push_bind(start);
        qb.push(" AND created_at <= ").push_bind(end);
    }
}

fn session_from_row(row: &PgRow) -> Result<ChatSession, sqlx::Error> {
    Ok(ChatSession {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        api_key_id: row.try_get("api_key_id")?,
        account_id: row.try_get("account_id")?,
        group_id: row.try_get("group_id")?,
        platform: row.try_get("platform")?,
        model: row.try_get("model")?,
        message_preview: row.try_get("message_preview")?,
        first_at: row.try_get("first_at")?,
        last_at: row.try_get("last_at")?,
        expires_at: row.try_get("expires_at")?,
        request_count: row.try_get("request_count")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ChatLog, sqlx::Error> {
    let messages: sqlx::types::Json<Vec<CapturedMessage>> = row.try_get("messages")?;
    Ok(ChatLog {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        request_id: row.try_get("request_id")?,
        client_request_id: row.try_get("client_request_id")?,
        user_id: row.try_get("user_id")?,
        api_key_id: row.try_get("api_key_id")?,
        account_id: row.try_get("account_id")?,
        group_id: row.try_get("group_id")?,
        platform: row.try_get("platform")?,
        model: row.try_get("model")?,
        request_path: row.try_get("request_path")?,
        stream: row.try_get("stream")?,
        status_code: row.try_get("status_code")?,
        messages: messages.0,
        message_preview: row.try_get("message_preview")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

/// Sessions ordered by recency. `request_count` is derived from the log
/// table per row; the `IS NOT DISTINCT FROM` comparisons keep NULL identity
/// columns from collapsing counts across callers.
pub async fn list_sessions(pool: &PgPool, filter: &SessionFilter) -> Result<ChatSessionList> {
    let (page, page_size, start, end) = filter.normalize();

    let mut count_qb =
        QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM security_chat_sessions s");
    push_session_conditions(&mut count_qb, filter, start, end);
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT s.session_id, s.user_id, s.api_key_id, s.account_id, s.group_id,
               s.platform, s.model, s.message_preview, s.first_at, s.last_at, s.expires_at,
               (SELECT COUNT(*) FROM security_chat_logs l
                 WHERE l.session_id = s.session_id
                   AND l.user_id IS NOT DISTINCT FROM s.user_id
                   AND l.api_key_id IS NOT DISTINCT FROM s.api_key_id) AS request_count
        FROM security_chat_sessions s
        "#,
    );
    push_session_conditions(&mut qb, filter, start, end);
    qb.push(" ORDER BY s.last_at DESC LIMIT ").push_bind(page_size);
    qb.push(" OFFSET ").push_bind((page - 1) * page_size);

    let rows = qb.build().fetch_all(pool).await?;
    let items = rows
        .iter()
        .map(session_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ChatSessionList {
        items,
        total,
        page,
        page_size,
    })
}

/// Log rows in conversation order. Refuses to scan the whole table: without
/// a session id the filter must opt in via `allow_empty_session`.
pub async fn list_messages(pool: &PgPool, filter: &MessageFilter) -> Result<ChatLogList> {
    let (page, page_size, start, end) = filter.normalize();

    if filter.session_id.trim().is_empty() && !filter.allow_empty_session {
        return Ok(ChatLogList {
            items: Vec::new(),
            total: 0,
            page,
            page_size,
        });
    }

    let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM security_chat_logs");
    push_log_conditions(&mut count_qb, filter, start, end);
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT id, session_id, request_id, client_request_id,
               user_id, api_key_id, account_id, group_id,
               platform, model, request_path, stream, status_code,
               messages, message_preview, created_at, expires_at
        FROM security_chat_logs
        "#,
    );
    push_log_conditions(&mut qb, filter, start, end);
    qb.push(" ORDER BY created_at ASC LIMIT ").push_bind(page_size);
    qb.push(" OFFSET ").push_bind((page - 1) * page_size);

    let rows = qb.build().fetch_all(pool).await?;
    let items = rows
        .iter()
        .map(log_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ChatLogList {
        items,
        total,
        page,
        page_size,
    })
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Aggregates over the filtered log set, plus the physical size of the log
/// table (which includes TOAST and indexes, independent of the filter).
pub async fn get_stats(pool: &PgPool, filter: &MessageFilter) -> Result<Stats> {
    let (_, _, start, end) = filter.normalize();

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT COUNT(*) AS request_count,
               COUNT(DISTINCT session_id) AS session_count,
               COALESCE(SUM(pg_column_size(messages)), 0)::BIGINT AS estimated_bytes
        FROM security_chat_logs
        "#,
    );
    push_log_conditions(&mut qb, filter, start, end);
    let row = qb.build().fetch_one(pool).await?;
    let request_count: i64 = row.try_get("request_count")?;
    let session_count: i64 = row.try_get("session_count")?;
    let estimated_bytes: i64 = row.try_get("estimated_bytes")?;

    let table_bytes: i64 =
        sqlx::query_scalar("SELECT pg_total_relation_size('security_chat_logs')::BIGINT")
            .fetch_one(pool)
            .await?;

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT CASE
                 WHEN LOWER(COALESCE(platform, '')) LIKE '%opencode%' THEN 'opencode'
                 WHEN LOWER(COALESCE(platform, '')) LIKE '%codex%' THEN 'codex'
                 ELSE 'other'
               END AS key,
               COUNT(*) AS count
        FROM security_chat_logs
        "#,
    );
    push_log_conditions(&mut qb, filter, start, end);
    qb.push(" GROUP BY 1");
    let rows = qb.build().fetch_all(pool).await?;
    let platform_buckets = rows
        .iter()
        .map(|row| {
            Ok(PlatformBucket {
                key: row.try_get("key")?,
                count: row.try_get("count")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    Ok(Stats {
        request_count,
        session_count,
        estimated_bytes,
        table_bytes,
        platform_buckets,
    })
}

// ============================================================================
// EXPIRY AND DELETION
// ============================================================================

/// Delete everything past its expiry. Logs and sessions are swept
/// independently; a session outliving all of its logs is handled by its own
/// expires_at, not by cascade.
pub async fn delete_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<(u64, u64)> {
    let logs = sqlx::query("DELETE FROM security_chat_logs WHERE expires_at < $1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    let sessions = sqlx::query("DELETE FROM security_chat_sessions WHERE expires_at < $1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok((logs, sessions))
}

/// Delete one session and its logs, optionally scoped to a caller identity.
pub async fn delete_session(
    pool: &PgPool,
    session_id: &str,
    user_id: Option<i64>,
    api_key_id: Option<i64>,
) -> Result<(u64, u64)> {
    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM security_chat_logs WHERE session_id = ");
    qb.push_bind(session_id.to_string());
    push_identity_scope(&mut qb, user_id, api_key_id);
    let logs = qb.build().execute(pool).await?.rows_affected();

    let mut qb =
        QueryBuilder::<Postgres>::new("DELETE FROM security_chat_sessions WHERE session_id = ");
    qb.push_bind(session_id.to_string());
    push_identity_scope(&mut qb, user_id, api_key_id);
    let sessions = qb.build().execute(pool).await?.rows_affected();

    Ok((logs, sessions))
}

/// Delete an explicit id set.
pub async fn delete_sessions(
    pool: &PgPool,
    session_ids: &[String],
    user_id: Option<i64>,
    api_key_id: Option<i64>,
) -> Result<(u64, u64)> {
    if session_ids.is_empty() {
        return Ok((0, 0));
    }

    let mut qb =
        QueryBuilder::<Postgres>::new("DELETE FROM security_chat_logs WHERE session_id = ANY(");
    qb.push_bind(session_ids.to_vec());
    qb.push(")");
    push_identity_scope(&mut qb, user_id, api_key_id);
    let logs = qb.build().execute(pool).await?.rows_affected();

    let mut qb =
        QueryBuilder::<Postgres>::new("DELETE FROM security_chat_sessions WHERE session_id = ANY(");
    qb.push_bind(session_ids.to_vec());
    qb.push(")");
    push_identity_scope(&mut qb, user_id, api_key_id);
    let sessions = qb.build().execute(pool).await?.rows_affected();

    Ok((logs, sessions))
}

/// Delete every session matching a session filter, logs first so the filter
/// subquery still sees the session rows.
pub async fn delete_sessions_by_filter(
    pool: &PgPool,
    filter: &SessionFilter,
) -> Result<(u64, u64)> {
    let (_, _, start, end) = filter.normalize();

    let mut qb = QueryBuilder::<Postgres>::new(
        "DELETE FROM security_chat_logs WHERE session_id IN (SELECT s.session_id FROM security_chat_sessions s",
    );
    push_session_conditions(&mut qb, filter, start, end);
    qb.push(")");
    let logs = qb.build().execute(pool).await?.rows_affected();

    let mut qb = QueryBuilder::<Postgres>::new(
        "DELETE FROM security_chat_sessions WHERE session_id IN (SELECT s.session_id FROM security_chat_sessions s",
    );
    push_session_conditions(&mut qb, filter, start, end);
    qb.push(")");
    let sessions = qb.build().execute(pool).await?.rows_affected();

    Ok((logs, sessions))
}

/// Delete log rows matching a message filter, then sweep sessions that no
/// longer have any logs at all.
pub async fn delete_logs_by_filter(pool: &PgPool, filter: &MessageFilter) -> Result<(u64, u64)> {
    let (_, _, start, end) = filter.normalize();

    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM security_chat_logs");
    push_log_conditions(&mut qb, filter, start, end);
    let logs = qb.build().execute(pool).await?.rows_affected();

    let sessions = sqlx::query(
        r#"
        DELETE FROM security_chat_sessions s
        WHERE NOT EXISTS (
            SELECT 1 FROM security_chat_logs l WHERE l.session_id = s.session_id
        )
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();

    Ok((logs, sessions))
}

fn push_identity_scope(
    qb: &mut QueryBuilder<'_, Postgres>,
    user_id: Option<i64>,
    api_key_id: Option<i64>,
) {
    if let Some(user_id) = user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(api_key_id) = api_key_id {
        qb.push(" AND api_key_id = ").push_bind(api_key_id);
    }
}
