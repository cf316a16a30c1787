//! libSQL backend — async `MemberStore` and `FollowupLedger` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{FollowupRecord, Member, MemberUpdate, NewMember};
use crate::onboarding::state::OnboardingState;
use crate::store::migrations;
use crate::store::traits::{FollowupLedger, MemberStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn member_exists(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM members WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("member_exists: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("member_exists: {e}"))),
        }
    }

    async fn query_members(
        &self,
        context: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Member>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut members = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => members.push(row_to_member(&row).map_err(|e| match e {
                    DatabaseError::Serialization(msg) => {
                        DatabaseError::Serialization(format!("{context}: {msg}"))
                    }
                    other => other,
                })?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
            }
        }
        Ok(members)
    }

    async fn fetch_member(&self, context: &str, id: &str) -> Result<Member, DatabaseError> {
        self.get_member(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "member".into(),
                id: format!("{id} ({context})"),
            })
    }
}

#[cfg(test)]
impl LibSqlBackend {
    /// Put a member straight into `state`, skipping transition checks.
    pub(crate) async fn force_state(&self, id: &str, state: OnboardingState) {
        self.conn()
            .execute(
                "UPDATE members SET onboarding_state = ?1, is_onboarded = ?2 WHERE id = ?3",
                params![state.as_str(), state.is_terminal() as i64, id],
            )
            .await
            .unwrap();
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text comparison orders
/// timestamps correctly.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "unparseable timestamp {s:?}"
    )))
}

fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

const MEMBER_COLUMNS: &str = "id, username, onboarding_state, is_onboarded, first_name, last_name, email, bio, nickname, verification_code, joined_at, onboarded_at, created_at, updated_at";

/// Map a libsql Row to a Member. Column order matches MEMBER_COLUMNS.
fn row_to_member(row: &libsql::Row) -> Result<Member, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(e.to_string());
    let is_onboarded: i64 = row.get(3).map_err(col)?;
    let joined_str: String = row.get(10).map_err(col)?;
    let onboarded_str: Option<String> = row.get(11).ok();
    let created_str: String = row.get(12).map_err(col)?;
    let updated_str: String = row.get(13).map_err(col)?;

    Ok(Member {
        id: row.get(0).map_err(col)?,
        username: row.get(1).map_err(col)?,
        onboarding_state: row.get(2).map_err(col)?,
        is_onboarded: is_onboarded != 0,
        first_name: row.get(4).ok(),
        last_name: row.get(5).ok(),
        email: row.get(6).ok(),
        bio: row.get(7).ok(),
        nickname: row.get(8).ok(),
        verification_code: row.get(9).ok(),
        joined_at: parse_datetime(&joined_str)?,
        onboarded_at: parse_optional_datetime(&onboarded_str)?,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

// ── MemberStore ─────────────────────────────────────────────────────

#[async_trait]
impl MemberStore for LibSqlBackend {
    async fn get_member(&self, id: &str) -> Result<Option<Member>, DatabaseError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1");
        let mut members = self
            .query_members("get_member", &sql, vec![id.into()])
            .await?;
        Ok(members.pop())
    }

    async fn get_member_by_code(&self, code: &str) -> Result<Option<Member>, DatabaseError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE verification_code = ?1");
        let mut members = self
            .query_members("get_member_by_code", &sql, vec![code.into()])
            .await?;
        Ok(members.pop())
    }

    async fn create_member(&self, new: &NewMember) -> Result<Member, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO members (id, username, onboarding_state, is_onboarded, joined_at, created_at, updated_at) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
                params![
                    new.id.clone(),
                    new.username.clone(),
                    OnboardingState::Joined.as_str(),
                    fmt_datetime(new.joined_at),
                    now,
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("member {} already exists", new.id))
                } else {
                    DatabaseError::Query(format!("create_member: {msg}"))
                }
            })?;

        self.fetch_member("create_member", &new.id).await
    }

    async fn update_member(
        &self,
        id: &str,
        update: &MemberUpdate,
    ) -> Result<Member, DatabaseError> {
        if let Some(to) = update.onboarding_state {
            let from = match update.expected_state {
                Some(from) => Some(from),
                None => self.fetch_member("update_member", id).await?.state().ok(),
            };
            let allowed = match from {
                Some(from) => from == to || from.can_transition_to(to),
                None => to == OnboardingState::Joined,
            };
            if !allowed {
                return Err(DatabaseError::Constraint(format!(
                    "member {id} cannot move from {} to {to}",
                    from.map_or("an unknown state", |s| s.as_str())
                )));
            }
        }

        let now = Utc::now();
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(state) = update.onboarding_state {
            sets.push("onboarding_state");
            values.push(state.as_str().into());
            sets.push("is_onboarded");
            values.push(libsql::Value::Integer(state.is_terminal() as i64));
            sets.push("onboarded_at");
            values.push(if state.is_terminal() {
                fmt_datetime(now).into()
            } else {
                libsql::Value::Null
            });
        }
        let text_fields = [
            ("first_name", &update.first_name),
            ("last_name", &update.last_name),
            ("email", &update.email),
            ("bio", &update.bio),
            ("nickname", &update.nickname),
            ("verification_code", &update.verification_code),
        ];
        for (column, value) in text_fields {
            if let Some(value) = value {
                sets.push(column);
                values.push(value.clone().into());
            }
        }
        sets.push("updated_at");
        values.push(fmt_datetime(now).into());

        let assignments = sets
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "UPDATE members SET {assignments} WHERE id = ?{}",
            values.len() + 1
        );
        values.push(id.into());
        if let Some(expected) = update.expected_state {
            sql.push_str(&format!(" AND onboarding_state = ?{}", values.len() + 1));
            values.push(expected.as_str().into());
        }

        let count = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_member: {e}")))?;

        if count == 0 {
            if !self.member_exists(id).await? {
                return Err(DatabaseError::NotFound {
                    entity: "member".into(),
                    id: id.to_string(),
                });
            }
            return Err(DatabaseError::StaleState {
                id: id.to_string(),
                expected: update
                    .expected_state
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            });
        }

        self.fetch_member("update_member", id).await
    }

    async fn reset_member(
        &self,
        id: &str,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<Member, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE members SET username = ?1, onboarding_state = ?2, is_onboarded = 0, first_name = NULL, last_name = NULL, email = NULL, bio = NULL, nickname = NULL, verification_code = NULL, onboarded_at = NULL, joined_at = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    username,
                    OnboardingState::Joined.as_str(),
                    fmt_datetime(joined_at),
                    fmt_datetime(Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_member: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "member".into(),
                id: id.to_string(),
            });
        }
        self.fetch_member("reset_member", id).await
    }

    async fn list_stalled_members(
        &self,
        state: OnboardingState,
        cutoff: DateTime<Utc>,
        excluding_followup_type: &str,
    ) -> Result<Vec<Member>, DatabaseError> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM members m
             WHERE m.onboarding_state = ?1
               AND m.joined_at <= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM onboard_followups f
                   WHERE f.member_id = m.id
                     AND f.followup_type = ?3
                     AND f.stalled_since = m.joined_at
               )
             ORDER BY m.joined_at ASC"
        );
        self.query_members(
            "list_stalled_members",
            &sql,
            vec![
                state.as_str().into(),
                fmt_datetime(cutoff).into(),
                excluding_followup_type.into(),
            ],
        )
        .await
    }

    async fn delete_member(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM onboard_followups WHERE member_id = ?1",
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_member: {e}")))?;
        let count = conn
            .execute("DELETE FROM members WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_member: {e}")))?;
        Ok(count > 0)
    }
}

// ── FollowupLedger ──────────────────────────────────────────────────

#[async_trait]
impl FollowupLedger for LibSqlBackend {
    async fn followup_exists(
        &self,
        member_id: &str,
        followup_type: &str,
        stalled_since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM onboard_followups WHERE member_id = ?1 AND followup_type = ?2 AND stalled_since = ?3 LIMIT 1",
                params![member_id, followup_type, fmt_datetime(stalled_since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("followup_exists: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("followup_exists: {e}"))),
        }
    }

    async fn append_followup(
        &self,
        member_id: &str,
        followup_type: &str,
        stalled_since: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO onboard_followups (id, member_id, followup_type, stalled_since, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    member_id,
                    followup_type,
                    fmt_datetime(stalled_since),
                    fmt_datetime(at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_followup: {e}")))?;
        Ok(count > 0)
    }

    async fn list_followups(&self, member_id: &str) -> Result<Vec<FollowupRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT member_id, followup_type, stalled_since, created_at FROM onboard_followups WHERE member_id = ?1 ORDER BY created_at ASC",
                params![member_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_followups: {e}")))?;

        let col = |e: libsql::Error| DatabaseError::Serialization(format!("list_followups: {e}"));
        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let stalled_str: String = row.get(2).map_err(col)?;
                    let created_str: String = row.get(3).map_err(col)?;
                    records.push(FollowupRecord {
                        member_id: row.get(0).map_err(col)?,
                        followup_type: row.get(1).map_err(col)?,
                        stalled_since: parse_datetime(&stalled_str)?,
                        created_at: parse_datetime(&created_str)?,
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_followups: {e}"))),
            }
        }
        Ok(records)
    }
}
