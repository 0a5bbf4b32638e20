//! AI code review of the files a project's agent produced.
//!
//! The model is asked for one JSON object describing an overall score, two
//! Mermaid diagrams, per-file metrics and a list of issues. The reply is
//! stored as a `Review` with its `ReviewFile`s and `CodeIssue`s.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::errors::ReviewError;
use crate::store::{
    DbHandle, Fragment, NewCodeIssue, NewReviewFile, ReviewCompletion, ReviewDetail, Severity,
};
use crate::util::extract_json_object;

pub const REVIEW_MODEL: &str = "gpt-4o";

static BRANCH_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(if|else|for|while|switch|case|catch|try|throw)\b").unwrap()
});

const BRANCH_OPERATORS: [&str; 3] = ["&&", "||", "?"];

/// A file submitted for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInputFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Language tag for a path, by extension.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let (_, ext) = path.rsplit_once('.')?;
    let language = match ext.to_lowercase().as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "java" => "java",
        "go" => "go",
        "rs" => "rust",
        "cpp" => "cpp",
        "c" => "c",
        "cs" => "csharp",
        "php" => "php",
        "rb" => "ruby",
        "swift" => "swift",
        "kt" => "kotlin",
        _ => return None,
    };
    Some(language)
}

/// Every file of a fragment, tagged with its language.
pub fn files_from_fragment(fragment: &Fragment) -> Vec<ReviewInputFile> {
    fragment
        .files
        .iter()
        .map(|(path, content)| ReviewInputFile {
            path: path.clone(),
            content: content.clone(),
            language: language_for_path(path).map(str::to_string),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetrics {
    pub lines_of_code: usize,
    pub complexity: usize,
}

/// Non-blank line count and a branch-count complexity estimate (base 1).
pub fn calculate_file_metrics(content: &str) -> FileMetrics {
    let lines_of_code = content.lines().filter(|l| !l.trim().is_empty()).count();
    let keywords = BRANCH_KEYWORDS.find_iter(content).count();
    let operators: usize = BRANCH_OPERATORS
        .iter()
        .map(|op| content.matches(op).count())
        .sum();
    FileMetrics {
        lines_of_code,
        complexity: 1 + keywords + operators,
    }
}

/// Strip characters the Mermaid renderer chokes on in node labels.
pub fn sanitize_mermaid(diagram: &str) -> String {
    diagram
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '(' | ')' | ':'))
        .map(|c| if c == '/' || c == '.' { '_' } else { c })
        .collect()
}

pub fn build_review_prompt(files: &[ReviewInputFile]) -> String {
    let files_content = files
        .iter()
        .map(|f| {
            format!(
                "\nFile: {}\nLanguage: {}\n```\n{}\n```\n",
                f.path,
                f.language.as_deref().unwrap_or("unknown"),
                f.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are an expert code reviewer. Analyze the following code files and provide a comprehensive review.

Files to review:
{files_content}

Provide your analysis in valid JSON format with the following structure:
{{
  "score": <number 0-100>,
  "summary": "<overall summary>",
  "architectureDiagram": "<mermaid diagram syntax>",
  "complexityGraph": "<mermaid diagram syntax>",
  "files": [
    {{
      "filePath": "<path>",
      "language": "<language>",
      "linesOfCode": <number>,
      "complexity": <number 0-100>,
      "score": <number 0-100>
    }}
  ],
  "issues": [
    {{
      "type": "SECURITY or BUG or CODE_QUALITY or PERFORMANCE or BEST_PRACTICE",
      "severity": "CRITICAL or HIGH or MEDIUM or LOW or INFO",
      "title": "<short title>",
      "description": "<detailed description>",
      "filePath": "<path>",
      "lineStart": <number>,
      "lineEnd": <number>,
      "code": "<affected code snippet>",
      "recommendation": "<fix recommendation>",
      "fixCode": "<suggested fixed code>",
      "cweId": "<CWE-XXX if applicable>",
      "cvssScore": <number 0-10 if applicable>
    }}
  ]
}}

Analyze for:
1. Overall code quality score (0-100)
2. Security vulnerabilities (with CWE IDs and CVSS scores if applicable)
3. Bugs and potential issues
4. Code quality issues
5. Performance concerns
6. Best practice violations
7. Architecture diagram in Mermaid format
8. Complexity analysis graph in Mermaid format

Provide comprehensive, actionable feedback. Return ONLY valid JSON, no markdown formatting."#
    )
}

/// The model's review, as parsed from its JSON reply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    pub score: Option<f64>,
    pub summary: Option<String>,
    pub architecture_diagram: Option<String>,
    pub complexity_graph: Option<String>,
    #[serde(default)]
    pub files: Vec<NewReviewFile>,
    #[serde(default)]
    pub issues: Vec<NewCodeIssue>,
}

impl ReviewReport {
    /// Parse a reply, tolerating prose or fences around the JSON object.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        match serde_json::from_str(text) {
            Ok(report) => Ok(report),
            Err(direct) => {
                let Some(object) = extract_json_object(text) else {
                    anyhow::bail!("Review response is not valid JSON: {}", direct);
                };
                serde_json::from_str(&object)
                    .map_err(|e| anyhow::anyhow!("Review response is not valid JSON: {}", e))
            }
        }
    }

    /// Summary fields for the review row, with diagrams sanitized.
    pub fn completion(&self) -> ReviewCompletion {
        let count = |severity: Severity| {
            self.issues.iter().filter(|i| i.severity == severity).count() as i64
        };
        ReviewCompletion {
            score: self.score.map(|s| s.round() as i64),
            summary: self.summary.clone(),
            architecture_diagram: self.architecture_diagram.as_deref().map(sanitize_mermaid),
            complexity_graph: self.complexity_graph.as_deref().map(sanitize_mermaid),
            total_issues: self.issues.len() as i64,
            critical_issues: count(Severity::Critical),
            high_issues: count(Severity::High),
            medium_issues: count(Severity::Medium),
            low_issues: count(Severity::Low),
        }
    }
}

pub struct Reviewer {
    model: Arc<dyn ChatModel>,
    db: DbHandle,
}

impl Reviewer {
    pub fn new(model: Arc<dyn ChatModel>, db: DbHandle) -> Self {
        Self { model, db }
    }

    /// Files to review for a project: the given ones, or the latest fragment's.
    pub async fn collect_files(
        &self,
        project_id: &str,
        files: Option<Vec<ReviewInputFile>>,
    ) -> Result<Vec<ReviewInputFile>, ReviewError> {
        if let Some(files) = files.filter(|f| !f.is_empty()) {
            return Ok(files
                .into_iter()
                .map(|mut f| {
                    if f.language.is_none() {
                        f.language = language_for_path(&f.path).map(str::to_string);
                    }
                    f
                })
                .collect());
        }
        let project_id = project_id.to_string();
        let fragment = self
            .db
            .call(move |db| db.latest_fragment(&project_id))
            .await?;
        let files = fragment.map(|f| files_from_fragment(&f)).unwrap_or_default();
        if files.is_empty() {
            return Err(ReviewError::NoFiles);
        }
        Ok(files)
    }

    /// Create a review for `files` and fill it from the model's reply.
    ///
    /// Once the review row exists, any failure marks it FAILED and is
    /// returned as `ReviewError::Failed`.
    pub async fn generate(
        &self,
        project_id: &str,
        files: Vec<ReviewInputFile>,
    ) -> Result<ReviewDetail, ReviewError> {
        if files.is_empty() {
            return Err(ReviewError::NoFiles);
        }
        let pid = project_id.to_string();
        let total_files = files.len() as i64;
        let review = self
            .db
            .call(move |db| db.create_review(&pid, total_files))
            .await?;
        info!(review_id = %review.id, project_id, files = total_files, "Starting code review");

        match self.analyze(&review.id, &files).await {
            Ok(detail) => Ok(detail),
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(review_id = %review.id, error = %reason, "Code review failed");
                let (id, summary) = (review.id.clone(), format!("Review failed: {}", reason));
                if let Err(update) = self.db.call(move |db| db.fail_review(&id, &summary)).await {
                    warn!(review_id = %review.id, error = %update, "Failed to mark review as failed");
                }
                Err(ReviewError::Failed {
                    review_id: review.id,
                    reason,
                })
            }
        }
    }

    async fn analyze(
        &self,
        review_id: &str,
        files: &[ReviewInputFile],
    ) -> anyhow::Result<ReviewDetail> {
        let request = ChatRequest {
            model: REVIEW_MODEL.to_string(),
            messages: vec![ChatMessage::user(build_review_prompt(files))],
            temperature: Some(0.1),
            max_tokens: Some(4096),
            json_response: true,
            ..Default::default()
        };
        let response = self.model.complete(&request).await?;
        let report = ReviewReport::parse(response.content.as_deref().unwrap_or_default())?;
        let completion = report.completion();

        let review_id = review_id.to_string();
        let detail = self
            .db
            .call(move |db| {
                db.complete_review(&review_id, &completion)?;
                for file in &report.files {
                    db.add_review_file(&review_id, file)?;
                }
                for issue in &report.issues {
                    let file_id = match &issue.file_path {
                        Some(path) => db.find_review_file_id(&review_id, path)?,
                        None => None,
                    };
                    db.add_code_issue(&review_id, file_id.as_deref(), issue)?;
                }
                db.get_review_detail(&review_id)?
                    .ok_or_else(|| anyhow::anyhow!("Review {} disappeared", review_id))
            })
            .await?;
        info!(
            review_id = %detail.review.id,
            score = ?detail.review.score,
            issues = detail.review.total_issues,
            "Code review completed"
        );
        Ok(detail)
    }
}
