//! SQLite persistence for projects, messages, and generated files.
//!
//! One writer at a time: all access goes through `DbHandle`, which serializes
//! on a mutex and runs on tokio's blocking pool. The assistant turn and its
//! file reconciliation commit in a single transaction so a crash can never
//! leave files without the message that produced them.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::engine::context::ArtifactMap;

pub mod models;

pub use models::{Message, Project, ProjectFile, ProjectStatus, Role, language_for_path};

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Startup initialization and
    /// tests only; never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// RFC 3339 with nanosecond precision. Fixed width, so lexicographic string
/// order matches chronological order.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    owner_id TEXT NOT NULL,
                    current_phase INTEGER NOT NULL DEFAULT 1,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    phase INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS project_files (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    file_path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    language TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(project_id, file_path)
                );

                CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);
                CREATE INDEX IF NOT EXISTS idx_messages_project
                    ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_messages_project_phase
                    ON messages(project_id, phase, created_at);
                CREATE INDEX IF NOT EXISTS idx_files_project ON project_files(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, description: &str, owner_id: &str) -> Result<Project> {
        let id = new_id();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, description, owner_id, current_phase, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 'active', ?5, ?5)",
                params![id, name, description, owner_id, ts],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, owner_id, current_phase, status, created_at, updated_at
                 FROM projects WHERE owner_id = ?1 ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![owner_id], row_to_project)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, owner_id, current_phase, status, created_at, updated_at
                 FROM projects WHERE id = ?1",
            )
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], row_to_project)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    /// Delete a project and, via cascade, its messages and files.
    /// Returns false when no such project existed.
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(n > 0)
    }

    pub fn set_current_phase(&self, id: &str, phase: i64) -> Result<Project> {
        if !(1..=crate::engine::dispatch::PHASE_COUNT).contains(&phase) {
            anyhow::bail!("Phase {} is outside 1..=14", phase);
        }
        let n = self
            .conn
            .execute(
                "UPDATE projects SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase, now(), id],
            )
            .context("Failed to update current_phase")?;
        if n == 0 {
            anyhow::bail!("Project {} not found", id);
        }
        self.get_project(id)?
            .context("Project not found after update")
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn append_message(
        &self,
        project_id: &str,
        phase: i64,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        insert_message(&self.conn, project_id, phase, role, content)
    }

    /// Full log for a project, oldest first. `rowid` breaks timestamp ties in
    /// insertion order.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        self.query_messages(
            "SELECT id, project_id, phase, role, content, created_at FROM messages
             WHERE project_id = ?1 ORDER BY created_at, rowid",
            params![project_id],
        )
    }

    /// Log for one project+phase, oldest first. This is what handlers see as
    /// prior conversation.
    pub fn list_phase_messages(&self, project_id: &str, phase: i64) -> Result<Vec<Message>> {
        self.query_messages(
            "SELECT id, project_id, phase, role, content, created_at FROM messages
             WHERE project_id = ?1 AND phase = ?2 ORDER BY created_at, rowid",
            params![project_id, phase],
        )
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params, row_to_message)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        Ok(messages)
    }

    // ── Files ─────────────────────────────────────────────────────────

    pub fn list_files(&self, project_id: &str) -> Result<Vec<ProjectFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, file_path, content, language, created_at, updated_at
                 FROM project_files WHERE project_id = ?1 ORDER BY file_path",
            )
            .context("Failed to prepare list_files")?;
        let rows = stmt
            .query_map(params![project_id], row_to_file)
            .context("Failed to query files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read file row")?);
        }
        Ok(files)
    }

    /// Upsert a batch of generated files in one transaction.
    pub fn reconcile_files(
        &self,
        project_id: &str,
        artifacts: &ArtifactMap,
    ) -> Result<Vec<ProjectFile>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let files = upsert_artifacts(&tx, project_id, artifacts)?;
        tx.commit().context("Failed to commit file reconciliation")?;
        Ok(files)
    }

    /// Record a completed dispatch: the assistant message plus any generated
    /// files, atomically. Either both land or neither does.
    pub fn record_assistant_turn(
        &self,
        project_id: &str,
        phase: i64,
        content: &str,
        artifacts: &ArtifactMap,
    ) -> Result<(Message, Vec<ProjectFile>)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let message = insert_message(&tx, project_id, phase, Role::Assistant, content)?;
        let files = upsert_artifacts(&tx, project_id, artifacts)?;
        tx.commit().context("Failed to commit assistant turn")?;
        Ok((message, files))
    }
}

fn insert_message(
    conn: &Connection,
    project_id: &str,
    phase: i64,
    role: Role,
    content: &str,
) -> Result<Message> {
    let message = Message {
        id: new_id(),
        project_id: project_id.to_string(),
        phase,
        role,
        content: content.to_string(),
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO messages (id, project_id, phase, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.id,
            message.project_id,
            message.phase,
            message.role.as_str(),
            message.content,
            message.created_at
        ],
    )
    .context("Failed to insert message")?;
    Ok(message)
}

/// Upsert every artifact file. The stored path is `collection/relative_path`.
/// On conflict the row keeps its `id` and `created_at`; content, language,
/// and `updated_at` are replaced. Files absent from `artifacts` are untouched.
fn upsert_artifacts(
    conn: &Connection,
    project_id: &str,
    artifacts: &ArtifactMap,
) -> Result<Vec<ProjectFile>> {
    let mut files = Vec::new();
    for (collection, entries) in artifacts {
        for (rel_path, content) in entries {
            let file_path = format!("{}/{}", collection, rel_path);
            let ts = now();
            conn.execute(
                "INSERT INTO project_files (id, project_id, file_path, content, language, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(project_id, file_path) DO UPDATE SET
                     content = excluded.content,
                     language = excluded.language,
                     updated_at = excluded.updated_at",
                params![
                    new_id(),
                    project_id,
                    file_path,
                    content,
                    language_for_path(&file_path),
                    ts
                ],
            )
            .context("Failed to upsert project file")?;
            let file = conn
                .query_row(
                    "SELECT id, project_id, file_path, content, language, created_at, updated_at
                     FROM project_files WHERE project_id = ?1 AND file_path = ?2",
                    params![project_id, file_path],
                    row_to_file,
                )
                .context("Failed to read back upserted file")?;
            files.push(file);
        }
    }
    Ok(files)
}

// ── Row mappers ───────────────────────────────────────────────────────

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(5)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        current_phase: row.get(4)?,
        status: ProjectStatus::from_str(&status).unwrap_or(ProjectStatus::Active),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        project_id: row.get(1)?,
        phase: row.get(2)?,
        role: Role::from_str(&role).unwrap_or(Role::Assistant),
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectFile> {
    Ok(ProjectFile {
        id: row.get(0)?,
        project_id: row.get(1)?,
        file_path: row.get(2)?,
        content: row.get(3)?,
        language: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn db() -> EngineDb {
        EngineDb::new_in_memory().unwrap()
    }

    fn artifacts(entries: &[(&str, &str, &str)]) -> ArtifactMap {
        let mut map = ArtifactMap::new();
        for (collection, path, content) in entries {
            map.entry(collection.to_string())
                .or_insert_with(BTreeMap::new)
                .insert(path.to_string(), content.to_string());
        }
        map
    }

    #[test]
    fn create_and_get_project() {
        let db = db();
        let p = db.create_project("Demo", "a demo", "user-1").unwrap();
        assert_eq!(p.current_phase, 1);
        assert_eq!(p.status, ProjectStatus::Active);
        assert_eq!(p.created_at, p.updated_at);

        let fetched = db.get_project(&p.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Demo");
        assert!(db.get_project("missing").unwrap().is_none());
    }

    #[test]
    fn list_projects_is_owner_scoped() {
        let db = db();
        db.create_project("Mine", "", "user-1").unwrap();
        db.create_project("Theirs", "", "user-2").unwrap();

        let mine = db.list_projects("user-1").unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "Mine");
    }

    #[test]
    fn set_current_phase_validates_range() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        let p = db.set_current_phase(&p.id, 5).unwrap();
        assert_eq!(p.current_phase, 5);

        assert!(db.set_current_phase(&p.id, 0).is_err());
        assert!(db.set_current_phase(&p.id, 15).is_err());
        assert!(db.set_current_phase("missing", 3).is_err());
    }

    #[test]
    fn messages_come_back_in_append_order() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            db.append_message(&p.id, 1, role, &format!("turn {i}")).unwrap();
        }

        let log = db.list_messages(&p.id).unwrap();
        assert_eq!(log.len(), 10);
        for (i, m) in log.iter().enumerate() {
            assert_eq!(m.content, format!("turn {i}"));
        }
        // Timestamps never decrease along the log.
        for pair in log.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn phase_messages_are_filtered_and_ordered() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        db.append_message(&p.id, 1, Role::User, "one").unwrap();
        db.append_message(&p.id, 2, Role::User, "two").unwrap();
        db.append_message(&p.id, 1, Role::Assistant, "three").unwrap();

        let phase1 = db.list_phase_messages(&p.id, 1).unwrap();
        assert_eq!(phase1.len(), 2);
        assert_eq!(phase1[0].content, "one");
        assert_eq!(phase1[1].content, "three");
    }

    #[test]
    fn reconcile_creates_one_row_per_file() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        let files = db
            .reconcile_files(
                &p.id,
                &artifacts(&[
                    ("frontend", "src/App.tsx", "export default 1"),
                    ("backend", "main.py", "app = 1"),
                ]),
            )
            .unwrap();
        assert_eq!(files.len(), 2);

        let stored = db.list_files(&p.id).unwrap();
        let paths: Vec<&str> = stored.iter().map(|f| f.file_path.as_str()).collect();
        assert_eq!(paths, vec!["backend/main.py", "frontend/src/App.tsx"]);
        assert_eq!(stored[1].language.as_deref(), Some("typescript"));
    }

    #[test]
    fn reconcile_is_an_upsert_keyed_by_path() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        db.reconcile_files(
            &p.id,
            &artifacts(&[
                ("frontend", "src/App.tsx", "v1"),
                ("backend", "main.py", "untouched"),
            ]),
        )
        .unwrap();
        let before = db.list_files(&p.id).unwrap();

        // Second generation rewrites only App.tsx.
        db.reconcile_files(&p.id, &artifacts(&[("frontend", "src/App.tsx", "v2")]))
            .unwrap();
        let after = db.list_files(&p.id).unwrap();

        assert_eq!(after.len(), 2, "no duplicate row for the same path");
        let app_before = before.iter().find(|f| f.file_path.ends_with("App.tsx")).unwrap();
        let app_after = after.iter().find(|f| f.file_path.ends_with("App.tsx")).unwrap();
        assert_eq!(app_after.id, app_before.id);
        assert_eq!(app_after.created_at, app_before.created_at);
        assert_eq!(app_after.content, "v2");

        let other = after.iter().find(|f| f.file_path == "backend/main.py").unwrap();
        assert_eq!(other.content, "untouched");
    }

    #[test]
    fn identical_reconcile_is_idempotent() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        let batch = artifacts(&[("frontend", "src/App.tsx", "same")]);
        let first = db.reconcile_files(&p.id, &batch).unwrap();
        let second = db.reconcile_files(&p.id, &batch).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].content, second[0].content);
        assert_eq!(db.list_files(&p.id).unwrap().len(), 1);
    }

    #[test]
    fn record_assistant_turn_is_atomic_and_complete() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        db.append_message(&p.id, 2, Role::User, "generate").unwrap();

        let (message, files) = db
            .record_assistant_turn(
                &p.id,
                2,
                "done",
                &artifacts(&[("frontend", "src/App.tsx", "x")]),
            )
            .unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(files.len(), 1);

        let log = db.list_messages(&p.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].id, message.id);
    }

    #[test]
    fn delete_project_cascades() {
        let db = db();
        let p = db.create_project("Demo", "", "u").unwrap();
        db.append_message(&p.id, 1, Role::User, "hi").unwrap();
        db.reconcile_files(&p.id, &artifacts(&[("frontend", "a.ts", "x")]))
            .unwrap();

        assert!(db.delete_project(&p.id).unwrap());
        assert!(!db.delete_project(&p.id).unwrap());
        assert!(db.get_project(&p.id).unwrap().is_none());
        assert!(db.list_messages(&p.id).unwrap().is_empty());
        assert!(db.list_files(&p.id).unwrap().is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let project_id = {
            let db = EngineDb::new(&path).unwrap();
            let p = db.create_project("Durable", "", "u").unwrap();
            db.append_message(&p.id, 1, Role::User, "hello").unwrap();
            p.id
        };

        let db = EngineDb::new(&path).unwrap();
        let p = db.get_project(&project_id).unwrap().unwrap();
        assert_eq!(p.name, "Durable");
        assert_eq!(db.list_messages(&project_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handle_runs_on_blocking_pool() {
        let handle = DbHandle::new(db());
        let p = handle
            .call(|db| db.create_project("Async", "", "u"))
            .await
            .unwrap();
        let fetched = handle
            .call(move |db| db.get_project(&p.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "Async");
    }
}
