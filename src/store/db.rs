use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the application database.
///
/// Wraps `AppDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AppDb>>,
}

impl DbHandle {
    pub fn new(db: AppDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open the database at `path`, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(AppDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(AppDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&AppDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests,
    /// never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, AppDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

pub const STALE_REVIEW_SUMMARY: &str = "Review timed out or encountered an error";

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct AppDb {
    conn: Connection,
}

impl AppDb {
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
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    github_enabled INTEGER NOT NULL DEFAULT 0,
                    github_repo_name TEXT,
                    github_repo_url TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    role TEXT NOT NULL,
                    type TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
                    sandbox_url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    files TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    run_id TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    output TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    PRIMARY KEY (run_id, stage)
                );

                CREATE TABLE IF NOT EXISTS reviews (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    score INTEGER,
                    summary TEXT,
                    architecture_diagram TEXT,
                    complexity_graph TEXT,
                    total_files INTEGER NOT NULL DEFAULT 0,
                    total_issues INTEGER NOT NULL DEFAULT 0,
                    critical_issues INTEGER NOT NULL DEFAULT 0,
                    high_issues INTEGER NOT NULL DEFAULT 0,
                    medium_issues INTEGER NOT NULL DEFAULT 0,
                    low_issues INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS review_files (
                    id TEXT PRIMARY KEY,
                    review_id TEXT NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
                    file_path TEXT NOT NULL,
                    language TEXT,
                    lines_of_code INTEGER NOT NULL DEFAULT 0,
                    complexity INTEGER NOT NULL DEFAULT 0,
                    score INTEGER
                );

                CREATE TABLE IF NOT EXISTS code_issues (
                    id TEXT PRIMARY KEY,
                    review_id TEXT NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
                    file_id TEXT REFERENCES review_files(id) ON DELETE SET NULL,
                    type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    file_path TEXT,
                    line_start INTEGER,
                    line_end INTEGER,
                    code TEXT,
                    recommendation TEXT,
                    fix_code TEXT,
                    cwe_id TEXT,
                    cvss_score REAL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_reviews_project ON reviews(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_review_files_review ON review_files(review_id);
                CREATE INDEX IF NOT EXISTS idx_code_issues_review ON code_issues(review_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, user_id: &str, name: &str) -> Result<Project> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO projects (id, user_id, name) VALUES (?1, ?2, ?3)",
                params![id, user_id, name],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, github_enabled, github_repo_name, github_repo_url, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    /// The project, only if it belongs to `user_id`.
    pub fn get_project_for_user(&self, id: &str, user_id: &str) -> Result<Option<Project>> {
        Ok(self
            .get_project(id)?
            .filter(|project| project.user_id == user_id))
    }

    pub fn update_project_github(
        &self,
        id: &str,
        enabled: bool,
        repo_name: Option<&str>,
        repo_url: Option<&str>,
    ) -> Result<Project> {
        self.conn
            .execute(
                &format!(
                    "UPDATE projects SET github_enabled = ?1, github_repo_name = ?2, github_repo_url = ?3, updated_at = {NOW}
                     WHERE id = ?4"
                ),
                params![enabled, repo_name, repo_url, id],
            )
            .context("Failed to update project GitHub settings")?;
        self.get_project(id)?
            .context("Project not found after GitHub update")
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn create_message(
        &self,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
    ) -> Result<Message> {
        self.create_message_with_fragment(project_id, content, role, message_type, None)
    }

    /// Insert a message and, optionally, its fragment in one transaction.
    pub fn create_message_with_fragment(
        &self,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<Message> {
        self.insert_message(&new_id(), project_id, content, role, message_type, fragment)
    }

    /// Insert a run's assistant result under a caller-chosen id. If a message
    /// with that id exists it is returned unchanged and nothing is written.
    pub fn create_result_message(
        &self,
        id: &str,
        project_id: &str,
        content: &str,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<Message> {
        if let Some(existing) = self.get_message(id)? {
            return Ok(existing);
        }
        self.insert_message(id, project_id, content, MessageRole::Assistant, message_type, fragment)
    }

    fn insert_message(
        &self,
        id: &str,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<Message> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO messages (id, project_id, content, role, type) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, project_id, content, role.as_str(), message_type.as_str()],
        )
        .context("Failed to insert message")?;

        if let Some(fragment) = fragment {
            let files =
                serde_json::to_string(&fragment.files).context("Failed to serialize fragment files")?;
            tx.execute(
                "INSERT INTO fragments (id, message_id, sandbox_url, title, files) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new_id(), id, fragment.sandbox_url, fragment.title, files],
            )
            .context("Failed to insert fragment")?;
        }
        tx.execute(
            &format!("UPDATE projects SET updated_at = {NOW} WHERE id = ?1"),
            params![project_id],
        )
        .context("Failed to touch project")?;
        tx.commit().context("Failed to commit message")?;

        self.get_message(id)?
            .context("Message not found after insert")
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], MessageRow::from_row)
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    /// All messages of a project, oldest first, with fragments.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let sql = format!("{MESSAGE_SELECT} WHERE m.project_id = ?1 ORDER BY m.created_at ASC, m.rowid ASC");
        self.query_messages(&sql, params![project_id])
    }

    /// The newest `limit` messages of a project, newest first.
    pub fn recent_messages(&self, project_id: &str, limit: usize) -> Result<Vec<Message>> {
        let sql = format!(
            "{MESSAGE_SELECT} WHERE m.project_id = ?1 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2"
        );
        self.query_messages(&sql, params![project_id, limit as i64])
    }

    /// Fragment of the most recent assistant message that has one.
    pub fn latest_fragment(&self, project_id: &str) -> Result<Option<Fragment>> {
        let sql = format!(
            "{MESSAGE_SELECT} WHERE m.project_id = ?1 AND m.role = 'ASSISTANT' AND f.id IS NOT NULL
             ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1"
        );
        Ok(self
            .query_messages(&sql, params![project_id])?
            .into_iter()
            .next()
            .and_then(|m| m.fragment))
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(messages)
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn get_checkpoint(&self, run_id: &str, stage: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT output FROM checkpoints WHERE run_id = ?1 AND stage = ?2",
                params![run_id, stage],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query checkpoint")
    }

    /// Record a stage output. The first stored output for a key is kept.
    pub fn put_checkpoint(&self, run_id: &str, stage: &str, output: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO checkpoints (run_id, stage, output) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, stage) DO NOTHING",
                params![run_id, stage, output],
            )
            .context("Failed to store checkpoint")?;
        Ok(())
    }

    pub fn list_checkpoint_stages(&self, run_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT stage FROM checkpoints WHERE run_id = ?1 ORDER BY created_at, rowid")
            .context("Failed to prepare checkpoint query")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))
            .context("Failed to query checkpoints")?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("Failed to read checkpoint row")?);
        }
        Ok(stages)
    }

    // ── Reviews ───────────────────────────────────────────────────────

    pub fn create_review(&self, project_id: &str, total_files: i64) -> Result<Review> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO reviews (id, project_id, status, total_files) VALUES (?1, ?2, ?3, ?4)",
                params![id, project_id, ReviewStatus::InProgress.as_str(), total_files],
            )
            .context("Failed to insert review")?;
        self.get_review(&id)?
            .context("Review not found after insert")
    }

    pub fn complete_review(&self, id: &str, completion: &ReviewCompletion) -> Result<Review> {
        self.conn
            .execute(
                &format!(
                    "UPDATE reviews SET status = ?1, score = ?2, summary = ?3, architecture_diagram = ?4,
                     complexity_graph = ?5, total_issues = ?6, critical_issues = ?7, high_issues = ?8,
                     medium_issues = ?9, low_issues = ?10, completed_at = {NOW}
                     WHERE id = ?11"
                ),
                params![
                    ReviewStatus::Completed.as_str(),
                    completion.score,
                    completion.summary,
                    completion.architecture_diagram,
                    completion.complexity_graph,
                    completion.total_issues,
                    completion.critical_issues,
                    completion.high_issues,
                    completion.medium_issues,
                    completion.low_issues,
                    id,
                ],
            )
            .context("Failed to complete review")?;
        self.get_review(id)?
            .context("Review not found after completion")
    }

    pub fn fail_review(&self, id: &str, summary: &str) -> Result<Review> {
        self.conn
            .execute(
                "UPDATE reviews SET status = ?1, summary = ?2 WHERE id = ?3",
                params![ReviewStatus::Failed.as_str(), summary, id],
            )
            .context("Failed to mark review as failed")?;
        self.get_review(id)?
            .context("Review not found after failure update")
    }

    /// Mark reviews of a project stuck IN_PROGRESS for longer than
    /// `older_than_minutes` as FAILED. Returns how many were updated.
    pub fn fail_stale_reviews(&self, project_id: &str, older_than_minutes: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE reviews SET status = ?1, summary = ?2
                 WHERE project_id = ?3 AND status = ?4
                   AND created_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-' || ?5 || ' minutes')",
                params![
                    ReviewStatus::Failed.as_str(),
                    STALE_REVIEW_SUMMARY,
                    project_id,
                    ReviewStatus::InProgress.as_str(),
                    older_than_minutes,
                ],
            )
            .context("Failed to clean up stale reviews")
    }

    pub fn add_review_file(&self, review_id: &str, file: &NewReviewFile) -> Result<String> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO review_files (id, review_id, file_path, language, lines_of_code, complexity, score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    review_id,
                    file.file_path,
                    file.language,
                    file.lines_of_code,
                    file.complexity,
                    file.score,
                ],
            )
            .context("Failed to insert review file")?;
        Ok(id)
    }

    pub fn find_review_file_id(&self, review_id: &str, file_path: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT id FROM review_files WHERE review_id = ?1 AND file_path = ?2 ORDER BY rowid LIMIT 1",
                params![review_id, file_path],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query review file")
    }

    pub fn add_code_issue(
        &self,
        review_id: &str,
        file_id: Option<&str>,
        issue: &NewCodeIssue,
    ) -> Result<String> {
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO code_issues (id, review_id, file_id, type, severity, title, description, file_path,
                 line_start, line_end, code, recommendation, fix_code, cwe_id, cvss_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    id,
                    review_id,
                    file_id,
                    issue.issue_type.as_str(),
                    issue.severity.as_str(),
                    issue.title,
                    issue.description,
                    issue.file_path,
                    issue.line_start,
                    issue.line_end,
                    issue.code,
                    issue.recommendation,
                    issue.fix_code,
                    issue.cwe_id,
                    issue.cvss_score,
                ],
            )
            .context("Failed to insert code issue")?;
        Ok(id)
    }

    pub fn get_review(&self, id: &str) -> Result<Option<Review>> {
        let sql = format!("{REVIEW_SELECT} WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], ReviewRow::from_row)
            .optional()
            .context("Failed to query review")?;
        row.map(ReviewRow::into_review).transpose()
    }

    /// Reviews of a project, newest first.
    pub fn list_reviews(&self, project_id: &str) -> Result<Vec<Review>> {
        let sql = format!("{REVIEW_SELECT} WHERE project_id = ?1 ORDER BY created_at DESC, rowid DESC");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_reviews")?;
        let rows = stmt
            .query_map(params![project_id], ReviewRow::from_row)
            .context("Failed to query reviews")?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row.context("Failed to read review row")?.into_review()?);
        }
        Ok(reviews)
    }

    /// A review with its files and issues, issues sorted by severity then type.
    pub fn get_review_detail(&self, id: &str) -> Result<Option<ReviewDetail>> {
        let Some(review) = self.get_review(id)? else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, review_id, file_path, language, lines_of_code, complexity, score
                 FROM review_files WHERE review_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare review files query")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(ReviewFile {
                    id: row.get(0)?,
                    review_id: row.get(1)?,
                    file_path: row.get(2)?,
                    language: row.get(3)?,
                    lines_of_code: row.get(4)?,
                    complexity: row.get(5)?,
                    score: row.get(6)?,
                    issues: Vec::new(),
                })
            })
            .context("Failed to query review files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read review file row")?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, review_id, file_id, type, severity, title, description, file_path, line_start,
                 line_end, code, recommendation, fix_code, cwe_id, cvss_score
                 FROM code_issues WHERE review_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare code issues query")?;
        let rows = stmt
            .query_map(params![id], CodeIssueRow::from_row)
            .context("Failed to query code issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read code issue row")?.into_issue()?);
        }
        issues.sort_by_key(|i| (i.severity, i.issue_type));

        for file in &mut files {
            file.issues = issues
                .iter()
                .filter(|i| i.file_id.as_deref() == Some(file.id.as_str()))
                .cloned()
                .collect();
        }

        Ok(Some(ReviewDetail {
            review,
            files,
            issues,
        }))
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        github_enabled: row.get(3)?,
        github_repo_name: row.get(4)?,
        github_repo_url: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.project_id, m.content, m.role, m.type, m.created_at,
        f.id, f.sandbox_url, f.title, f.files, f.created_at
     FROM messages m LEFT JOIN fragments f ON f.message_id = m.id";

/// Intermediate row struct for reading messages (with their optional
/// fragment) from SQLite before converting enum and JSON columns.
struct MessageRow {
    id: String,
    project_id: String,
    content: String,
    role: String,
    message_type: String,
    created_at: String,
    fragment_id: Option<String>,
    sandbox_url: Option<String>,
    title: Option<String>,
    files: Option<String>,
    fragment_created_at: Option<String>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            content: row.get(2)?,
            role: row.get(3)?,
            message_type: row.get(4)?,
            created_at: row.get(5)?,
            fragment_id: row.get(6)?,
            sandbox_url: row.get(7)?,
            title: row.get(8)?,
            files: row.get(9)?,
            fragment_created_at: row.get(10)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let fragment = match self.fragment_id {
            Some(fragment_id) => {
                let files: BTreeMap<String, String> =
                    serde_json::from_str(self.files.as_deref().unwrap_or("{}"))
                        .context("Failed to parse fragment files")?;
                Some(Fragment {
                    id: fragment_id,
                    message_id: self.id.clone(),
                    sandbox_url: self.sandbox_url.unwrap_or_default(),
                    title: self.title.unwrap_or_default(),
                    files,
                    created_at: self.fragment_created_at.unwrap_or_default(),
                })
            }
            None => None,
        };
        Ok(Message {
            id: self.id,
            project_id: self.project_id,
            content: self.content,
            role: MessageRole::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            message_type: MessageType::from_str(&self.message_type)
                .map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
            fragment,
        })
    }
}

const REVIEW_SELECT: &str = "SELECT id, project_id, status, score, summary, architecture_diagram, complexity_graph,
        total_files, total_issues, critical_issues, high_issues, medium_issues, low_issues, created_at, completed_at
     FROM reviews";

struct ReviewRow {
    review: Review,
    status: String,
}

impl ReviewRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            status: row.get(2)?,
            review: Review {
                id: row.get(0)?,
                project_id: row.get(1)?,
                status: ReviewStatus::Pending,
                score: row.get(3)?,
                summary: row.get(4)?,
                architecture_diagram: row.get(5)?,
                complexity_graph: row.get(6)?,
                total_files: row.get(7)?,
                total_issues: row.get(8)?,
                critical_issues: row.get(9)?,
                high_issues: row.get(10)?,
                medium_issues: row.get(11)?,
                low_issues: row.get(12)?,
                created_at: row.get(13)?,
                completed_at: row.get(14)?,
            },
        })
    }

    fn into_review(self) -> Result<Review> {
        Ok(Review {
            status: ReviewStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            ..self.review
        })
    }
}

struct CodeIssueRow {
    id: String,
    review_id: String,
    file_id: Option<String>,
    issue_type: String,
    severity: String,
    title: String,
    description: String,
    file_path: Option<String>,
    line_start: Option<i64>,
    line_end: Option<i64>,
    code: Option<String>,
    recommendation: Option<String>,
    fix_code: Option<String>,
    cwe_id: Option<String>,
    cvss_score: Option<f64>,
}

impl CodeIssueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            review_id: row.get(1)?,
            file_id: row.get(2)?,
            issue_type: row.get(3)?,
            severity: row.get(4)?,
            title: row.get(5)?,
            description: row.get(6)?,
            file_path: row.get(7)?,
            line_start: row.get(8)?,
            line_end: row.get(9)?,
            code: row.get(10)?,
            recommendation: row.get(11)?,
            fix_code: row.get(12)?,
            cwe_id: row.get(13)?,
            cvss_score: row.get(14)?,
        })
    }

    fn into_issue(self) -> Result<CodeIssue> {
        Ok(CodeIssue {
            id: self.id,
            review_id: self.review_id,
            file_id: self.file_id,
            issue_type: IssueType::from_str(&self.issue_type).map_err(|e| anyhow::anyhow!(e))?,
            severity: Severity::from_str(&self.severity).map_err(|e| anyhow::anyhow!(e))?,
            title: self.title,
            description: self.description,
            file_path: self.file_path,
            line_start: self.line_start,
            line_end: self.line_end,
            code: self.code,
            recommendation: self.recommendation,
            fix_code: self.fix_code,
            cwe_id: self.cwe_id,
            cvss_score: self.cvss_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(files: &[(&str, &str)]) -> NewFragment {
        NewFragment {
            sandbox_url: "https://3000-sbx.localhost".into(),
            title: "Todo App".into(),
            files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('projects', 'messages', 'fragments', 'checkpoints', 'reviews', 'review_files', 'code_issues')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 7);
        Ok(())
    }

    #[test]
    fn test_create_and_get_project() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("user_1", "quiet-river")?;
        assert_eq!(project.name, "quiet-river");
        assert!(!project.github_enabled);

        assert!(db.get_project_for_user(&project.id, "user_1")?.is_some());
        assert!(db.get_project_for_user(&project.id, "user_2")?.is_none());
        assert!(db.get_project("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_project_github() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let updated = db.update_project_github(
            &project.id,
            true,
            Some("todo"),
            Some("https://github.com/octo/todo"),
        )?;
        assert!(updated.github_enabled);
        assert_eq!(updated.github_repo_name.as_deref(), Some("todo"));
        Ok(())
    }

    #[test]
    fn test_message_with_fragment_roundtrip() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let message = db.create_message_with_fragment(
            &project.id,
            "Here is your app",
            MessageRole::Assistant,
            MessageType::Result,
            Some(&fragment(&[("app/page.tsx", "export default 1")])),
        )?;

        let fragment = message.fragment.expect("fragment should be attached");
        assert_eq!(fragment.title, "Todo App");
        assert_eq!(fragment.files["app/page.tsx"], "export default 1");
        Ok(())
    }

    #[test]
    fn test_recent_messages_newest_first_and_capped() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        for i in 0..12 {
            db.create_message(&project.id, &format!("m{}", i), MessageRole::User, MessageType::Result)?;
        }

        let recent = db.recent_messages(&project.id, 10)?;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m11");
        assert_eq!(recent[9].content, "m2");

        let all = db.list_messages(&project.id)?;
        assert_eq!(all.len(), 12);
        assert_eq!(all[0].content, "m0");
        Ok(())
    }

    #[test]
    fn test_latest_fragment_skips_messages_without_fragment() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        assert!(db.latest_fragment(&project.id)?.is_none());

        db.create_message_with_fragment(
            &project.id,
            "v1",
            MessageRole::Assistant,
            MessageType::Result,
            Some(&fragment(&[("a.ts", "1")])),
        )?;
        db.create_message_with_fragment(
            &project.id,
            "v2",
            MessageRole::Assistant,
            MessageType::Result,
            Some(&fragment(&[("a.ts", "2")])),
        )?;
        db.create_message(&project.id, "oops", MessageRole::Assistant, MessageType::Error)?;

        let latest = db.latest_fragment(&project.id)?.expect("fragment");
        assert_eq!(latest.files["a.ts"], "2");
        Ok(())
    }

    #[test]
    fn test_checkpoint_first_write_wins() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        assert!(db.get_checkpoint("run-1", "get-sandbox-id")?.is_none());
        db.put_checkpoint("run-1", "get-sandbox-id", "\"a\"")?;
        db.put_checkpoint("run-1", "get-sandbox-id", "\"b\"")?;
        db.put_checkpoint("run-1", "get-previous-messages", "[]")?;
        assert_eq!(
            db.get_checkpoint("run-1", "get-sandbox-id")?.as_deref(),
            Some("\"a\"")
        );
        assert_eq!(
            db.list_checkpoint_stages("run-1")?,
            vec!["get-sandbox-id", "get-previous-messages"]
        );
        Ok(())
    }

    #[test]
    fn test_review_lifecycle() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let review = db.create_review(&project.id, 1)?;
        assert_eq!(review.status, ReviewStatus::InProgress);

        let file_id = db.add_review_file(
            &review.id,
            &NewReviewFile {
                file_path: "app/page.tsx".into(),
                language: Some("typescript".into()),
                lines_of_code: 10,
                complexity: 3,
                score: Some(80),
            },
        )?;
        assert_eq!(
            db.find_review_file_id(&review.id, "app/page.tsx")?.as_deref(),
            Some(file_id.as_str())
        );

        let issue = |severity| NewCodeIssue {
            issue_type: IssueType::Bug,
            severity,
            title: "t".into(),
            description: "d".into(),
            file_path: Some("app/page.tsx".into()),
            line_start: None,
            line_end: None,
            code: None,
            recommendation: None,
            fix_code: None,
            cwe_id: None,
            cvss_score: None,
        };
        db.add_code_issue(&review.id, Some(&file_id), &issue(Severity::Low))?;
        db.add_code_issue(&review.id, Some(&file_id), &issue(Severity::Critical))?;
        db.add_code_issue(&review.id, None, &issue(Severity::Info))?;

        db.complete_review(
            &review.id,
            &ReviewCompletion {
                score: Some(80),
                summary: Some("ok".into()),
                total_issues: 3,
                critical_issues: 1,
                low_issues: 1,
                ..Default::default()
            },
        )?;

        let detail = db.get_review_detail(&review.id)?.expect("review");
        assert_eq!(detail.review.status, ReviewStatus::Completed);
        assert!(detail.review.completed_at.is_some());
        assert_eq!(detail.issues.len(), 3);
        assert_eq!(detail.issues[0].severity, Severity::Critical);
        assert_eq!(detail.files[0].issues.len(), 2);
        Ok(())
    }

    #[test]
    fn test_fail_review_records_reason() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let review = db.create_review(&project.id, 2)?;
        let failed = db.fail_review(&review.id, "Review failed: bad json")?;
        assert_eq!(failed.status, ReviewStatus::Failed);
        assert_eq!(failed.summary.as_deref(), Some("Review failed: bad json"));
        Ok(())
    }

    #[test]
    fn test_create_result_message_is_idempotent() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let fragment = NewFragment {
            sandbox_url: "https://3000-x.sandbox.local".into(),
            title: "First".into(),
            files: BTreeMap::from([("a.ts".to_string(), "1".to_string())]),
        };
        let first = db.create_result_message("run-msg", &project.id, "hello", MessageType::Result, Some(&fragment))?;
        let second = db.create_result_message("run-msg", &project.id, "other", MessageType::Error, None)?;
        assert_eq!(first, second);
        assert_eq!(db.list_messages(&project.id)?.len(), 1);
        assert_eq!(second.fragment.map(|f| f.title), Some("First".to_string()));
        Ok(())
    }

    #[test]
    fn test_fail_stale_reviews_only_touches_old_in_progress() -> Result<()> {
        let db = AppDb::new_in_memory()?;
        let project = db.create_project("u", "p")?;
        let stale = db.create_review(&project.id, 1)?;
        let fresh = db.create_review(&project.id, 1)?;
        let done = db.create_review(&project.id, 1)?;
        db.complete_review(&done.id, &ReviewCompletion::default())?;
        db.conn.execute(
            "UPDATE reviews SET created_at = '2020-01-01T00:00:00.000Z' WHERE id IN (?1, ?2)",
            params![stale.id, done.id],
        )?;

        assert_eq!(db.fail_stale_reviews(&project.id, 5)?, 1);
        let stale = db.get_review(&stale.id)?.expect("stale");
        assert_eq!(stale.status, ReviewStatus::Failed);
        assert_eq!(stale.summary.as_deref(), Some(STALE_REVIEW_SUMMARY));
        assert_eq!(db.get_review(&fresh.id)?.expect("fresh").status, ReviewStatus::InProgress);
        assert_eq!(db.get_review(&done.id)?.expect("done").status, ReviewStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let project = handle.call(|db| db.create_project("u", "p")).await?;
        let id = project.id.clone();
        let fetched = handle.call(move |db| db.get_project(&id)).await?;
        assert_eq!(fetched.map(|p| p.name), Some("p".to_string()));
        Ok(())
    }
}
