//! Session database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Session, StoredMessage};

const SESSION_COLUMNS: &str = "id, state, directory, adapter, runner_session_id, approval_mode, \
     name, summary, exit_code, runner_header, platform, platform_thread_id, \
     created_at, started_at, ended_at, last_activity_at";

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session row.
    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, state, directory, adapter, runner_session_id, approval_mode,
                name, summary, exit_code, runner_header, platform, platform_thread_id,
                created_at, started_at, ended_at, last_activity_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.state.to_string())
        .bind(&session.directory)
        .bind(session.adapter.to_string())
        .bind(&session.runner_session_id)
        .bind(session.approval_mode.to_string())
        .bind(&session.name)
        .bind(&session.summary)
        .bind(session.exit_code)
        .bind(&session.runner_header)
        .bind(&session.platform)
        .bind(&session.platform_thread_id)
        .bind(&session.created_at)
        .bind(&session.started_at)
        .bind(&session.ended_at)
        .bind(&session.last_activity_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Get a session by id.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    /// List all sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// Write a full session snapshot.
    pub async fn update(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                state = ?, directory = ?, adapter = ?, runner_session_id = ?,
                approval_mode = ?, name = ?, summary = ?, exit_code = ?,
                runner_header = ?, platform = ?, platform_thread_id = ?,
                started_at = ?, ended_at = ?, last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.state.to_string())
        .bind(&session.directory)
        .bind(session.adapter.to_string())
        .bind(&session.runner_session_id)
        .bind(session.approval_mode.to_string())
        .bind(&session.name)
        .bind(&session.summary)
        .bind(session.exit_code)
        .bind(&session.runner_header)
        .bind(&session.platform)
        .bind(&session.platform_thread_id)
        .bind(&session.started_at)
        .bind(&session.ended_at)
        .bind(&session.last_activity_at)
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .context("updating session")?;

        Ok(())
    }

    /// Delete a session row and its stored messages.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session messages")?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(())
    }

    /// Append a conversation message; seq is assigned atomically per session.
    pub async fn add_message(&self, message: &StoredMessage) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE session_id = ?",
        )
        .bind(&message.session_id)
        .fetch_one(&self.pool)
        .await
        .context("reading max message seq")?;
        let seq = row.0 + 1;

        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, seq, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(seq)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        Ok(seq)
    }

    /// Fetch conversation history for a session in seq order.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            "SELECT id, session_id, role, content, seq, created_at \
             FROM messages WHERE session_id = ? ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        Ok(messages)
    }

    /// Number of stored messages for a session.
    pub async fn message_count(&self, session_id: &str) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .context("counting messages")?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::models::{ApprovalMode, RunnerKind, SessionState};
    use crate::util::{new_id, now_ts};

    fn sample_session() -> Session {
        Session {
            id: new_id("sess"),
            state: SessionState::Created,
            directory: Some("/tmp/p".to_string()),
            adapter: RunnerKind::Subprocess,
            runner_session_id: None,
            approval_mode: ApprovalMode::Interactive,
            name: "New session".to_string(),
            summary: None,
            exit_code: None,
            runner_header: None,
            platform: None,
            platform_thread_id: None,
            created_at: now_ts(),
            started_at: None,
            ended_at: None,
            last_activity_at: Some(now_ts()),
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let session = sample_session();
        repo.create(&session).await.unwrap();

        let loaded = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.state, SessionState::Created);
        assert_eq!(loaded.adapter, RunnerKind::Subprocess);
    }

    #[tokio::test]
    async fn test_update_persists_state() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let mut session = sample_session();
        repo.create(&session).await.unwrap();

        session.state = SessionState::Running;
        session.runner_session_id = Some("ext-1".to_string());
        repo.update(&session).await.unwrap();

        let loaded = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Running);
        assert_eq!(loaded.runner_session_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_delete_removes_messages() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let session = sample_session();
        repo.create(&session).await.unwrap();

        let msg = StoredMessage {
            id: new_id("msg"),
            session_id: session.id.clone(),
            role: "user".to_string(),
            content: r#"[{"type":"text","text":"hi"}]"#.to_string(),
            seq: 0,
            created_at: now_ts(),
        };
        let seq = repo.add_message(&msg).await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(repo.message_count(&session.id).await.unwrap(), 1);

        repo.delete(&session.id).await.unwrap();
        assert!(repo.get(&session.id).await.unwrap().is_none());
        assert_eq!(repo.message_count(&session.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_seq_is_monotonic() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let session = sample_session();
        repo.create(&session).await.unwrap();

        for expected in 1..=3 {
            let msg = StoredMessage {
                id: new_id("msg"),
                session_id: session.id.clone(),
                role: "user".to_string(),
                content: "[]".to_string(),
                seq: 0,
                created_at: now_ts(),
            };
            assert_eq!(repo.add_message(&msg).await.unwrap(), expected);
        }

        let messages = repo.list_messages(&session.id).await.unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
