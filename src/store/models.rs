use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub github_enabled: bool,
    pub github_repo_name: Option<String>,
    pub github_repo_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "ASSISTANT" => Ok(Self::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Kind of a stored message. User turns are stored as `Result` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Result,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESULT" => Ok(Self::Result),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub created_at: String,
    pub fragment: Option<Fragment>,
}

/// Snapshot of the files a successful run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    pub message_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFragment {
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
}

// ── Reviews ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

/// Declaration order is display order, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRITICAL" => Ok(Self::Critical),
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            "INFO" => Ok(Self::Info),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    Security,
    Bug,
    CodeQuality,
    Performance,
    BestPractice,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Security => "SECURITY",
            Self::Bug => "BUG",
            Self::CodeQuality => "CODE_QUALITY",
            Self::Performance => "PERFORMANCE",
            Self::BestPractice => "BEST_PRACTICE",
        }
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SECURITY" => Ok(Self::Security),
            "BUG" => Ok(Self::Bug),
            "CODE_QUALITY" => Ok(Self::CodeQuality),
            "PERFORMANCE" => Ok(Self::Performance),
            "BEST_PRACTICE" => Ok(Self::BestPractice),
            _ => Err(format!("Invalid issue type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub project_id: String,
    pub status: ReviewStatus,
    pub score: Option<i64>,
    pub summary: Option<String>,
    pub architecture_diagram: Option<String>,
    pub complexity_graph: Option<String>,
    pub total_files: i64,
    pub total_issues: i64,
    pub critical_issues: i64,
    pub high_issues: i64,
    pub medium_issues: i64,
    pub low_issues: i64,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Fields written when a review finishes successfully.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewCompletion {
    pub score: Option<i64>,
    pub summary: Option<String>,
    pub architecture_diagram: Option<String>,
    pub complexity_graph: Option<String>,
    pub total_issues: i64,
    pub critical_issues: i64,
    pub high_issues: i64,
    pub medium_issues: i64,
    pub low_issues: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFile {
    pub id: String,
    pub review_id: String,
    pub file_path: String,
    pub language: Option<String>,
    pub lines_of_code: i64,
    pub complexity: i64,
    pub score: Option<i64>,
    #[serde(default)]
    pub issues: Vec<CodeIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeIssue {
    pub id: String,
    pub review_id: String,
    pub file_id: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub code: Option<String>,
    pub recommendation: Option<String>,
    pub fix_code: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
}

/// Issue as reported by the model, before it is stored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCodeIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub file_path: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub code: Option<String>,
    pub recommendation: Option<String>,
    pub fix_code: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReviewFile {
    pub file_path: String,
    pub language: Option<String>,
    #[serde(default)]
    pub lines_of_code: i64,
    #[serde(default)]
    pub complexity: i64,
    pub score: Option<i64>,
}

/// A review with its files (each carrying its issues) and all issues.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDetail {
    #[serde(flatten)]
    pub review: Review,
    pub files: Vec<ReviewFile>,
    pub issues: Vec<CodeIssue>,
}
