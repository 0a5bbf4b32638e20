//! End-to-end workflow scenarios against the in-memory sandbox, a scripted
//! model and a real (in-memory) database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vibe::agent::ScriptedChatModel;
use vibe::agent::llm::{ChatResponse, Role};
use vibe::config::VibeConfig;
use vibe::errors::GENERIC_FAILURE_MESSAGE;
use vibe::sandbox::memory::{MemorySandboxProvider, ScriptedCommand};
use vibe::store::{DbHandle, Message, MessageRole, MessageType};
use vibe::workflow::{
    CheckpointStore, CodeAgentWorkflow, MemoryCheckpointStore, RunEvent, SqliteCheckpointStore,
};

struct Harness {
    db: DbHandle,
    sandboxes: MemorySandboxProvider,
    model: Arc<ScriptedChatModel>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: VibeConfig,
}

impl Harness {
    fn new(model: ScriptedChatModel) -> Self {
        let mut config = VibeConfig::default();
        config.workflow.retry_backoff_ms = 1;
        Self {
            db: DbHandle::in_memory().unwrap(),
            sandboxes: MemorySandboxProvider::new(),
            model: Arc::new(model),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            config,
        }
    }

    fn workflow(&self) -> CodeAgentWorkflow {
        CodeAgentWorkflow::new(
            self.db.clone(),
            Arc::new(self.sandboxes.clone()),
            self.model.clone(),
            self.checkpoints.clone(),
            Arc::new(self.config.clone()),
        )
    }

    async fn project(&self) -> String {
        self.db
            .call(|db| db.create_project("user-1", "demo"))
            .await
            .unwrap()
            .id
    }

    async fn messages(&self, project_id: &str) -> Vec<Message> {
        let pid = project_id.to_string();
        self.db.call(move |db| db.list_messages(&pid)).await.unwrap()
    }

    async fn assistant_messages(&self, project_id: &str) -> Vec<Message> {
        self.messages(project_id)
            .await
            .into_iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .collect()
    }
}

fn event(project_id: &str, value: &str) -> RunEvent {
    RunEvent {
        project_id: project_id.to_string(),
        value: value.to_string(),
    }
}

fn todo_app_script() -> Vec<ChatResponse> {
    vec![
        ChatResponse::tool_call("c1", "terminal", json!({"command": "npm install uuid --yes"})),
        ChatResponse::tool_call(
            "c2",
            "createOrUpdateFile",
            json!({"files": [
                {"path": "app/page.tsx", "content": "export default function Page() { return <Todo /> }"},
                {"path": "app/todo.tsx", "content": "export function Todo() { return null }"}
            ]}),
        ),
        ChatResponse::text("<task_summary>\nCreated a todo list app with add and delete.\n</task_summary>"),
        ChatResponse::text("Todo List"),
        ChatResponse::text("I built a todo list app where you can add and delete tasks."),
    ]
}

#[tokio::test]
async fn test_todo_app_run_produces_result_with_fragment() {
    let h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    let project_id = h.project().await;

    let output = h
        .workflow()
        .run("run-todo", &event(&project_id, "build a todo list app"))
        .await
        .unwrap();

    assert_eq!(output.url, "https://3000-mem-1.sandbox.local");
    assert_eq!(output.title, "Todo List");
    assert!(output.summary.contains("<task_summary>"));
    assert_eq!(
        output.files.keys().cloned().collect::<Vec<_>>(),
        vec!["app/page.tsx".to_string(), "app/todo.tsx".to_string()]
    );

    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    let record = &messages[0];
    assert_eq!(record.message_type, MessageType::Result);
    assert_eq!(record.content, "I built a todo list app where you can add and delete tasks.");
    let fragment = record.fragment.as_ref().expect("fragment");
    assert_eq!(fragment.title, "Todo List");
    assert_eq!(fragment.sandbox_url, output.url);
    assert_eq!(fragment.files, output.files);

    assert_eq!(h.sandboxes.create_count(), 1);
    assert_eq!(h.sandboxes.timeout("mem-1"), Some(Duration::from_secs(1200)));
    assert_eq!(h.sandboxes.files("mem-1"), output.files);
    assert_eq!(h.sandboxes.command_log(), vec!["npm install uuid --yes".to_string()]);
}

#[tokio::test]
async fn test_sandbox_creation_failure_records_error() {
    let h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    h.sandboxes.fail_create("template not found");
    let project_id = h.project().await;

    let output = h
        .workflow()
        .run("run-fail", &event(&project_id, "build a todo list app"))
        .await
        .unwrap();
    assert!(output.files.is_empty());

    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
    assert_eq!(messages[0].content, GENERIC_FAILURE_MESSAGE);
    assert!(messages[0].fragment.is_none());
    assert!(h.model.requests().is_empty());
    assert_eq!(h.sandboxes.create_attempts(), 3);
}

#[tokio::test]
async fn test_transient_sandbox_failure_is_retried() {
    let h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    h.sandboxes.fail_next_creates("transient 503", 1);
    let project_id = h.project().await;

    let output = h
        .workflow()
        .run("run-flaky", &event(&project_id, "build a todo list app"))
        .await
        .unwrap();

    assert_eq!(h.sandboxes.create_attempts(), 2);
    assert_eq!(h.sandboxes.create_count(), 1);
    assert_eq!(output.url, "https://3000-mem-1.sandbox.local");
    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Result);
}

#[tokio::test]
async fn test_failed_build_is_reported_to_the_agent() {
    let h = Harness::new(ScriptedChatModel::new(vec![
        ChatResponse::tool_call("c1", "terminal", json!({"command": "npm run build"})),
        ChatResponse::text("<task_summary>Could not build.</task_summary>"),
        ChatResponse::text("Broken build"),
        ChatResponse::text("The build failed."),
    ]));
    h.sandboxes.script_command(
        "npm run build",
        ScriptedCommand::Fail {
            exit_code: 1,
            stdout: "partial".into(),
            stderr: "Type error".into(),
        },
    );
    let project_id = h.project().await;

    h.workflow()
        .run("run-build", &event(&project_id, "make it"))
        .await
        .unwrap();

    let requests = h.model.requests();
    let tool_result = requests[1]
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .and_then(|m| m.content.clone())
        .expect("tool result");
    assert!(tool_result.starts_with("Command failed: "));
    assert!(tool_result.contains("\nstdout:partial\nstderr: Type error"));

    // A summary without files is still a failed run.
    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
}

#[tokio::test]
async fn test_iteration_ceiling_ends_run_as_error() {
    let h = Harness::new(
        ScriptedChatModel::new(vec![]).with_fallback(ChatResponse::tool_call(
            "c1",
            "terminal",
            json!({"command": "ls"}),
        )),
    );
    let project_id = h.project().await;

    let output = h
        .workflow()
        .run("run-loop", &event(&project_id, "never finish"))
        .await
        .unwrap();

    assert_eq!(h.model.requests().len(), 15);
    assert_eq!(h.sandboxes.command_log().len(), 15);
    assert!(output.summary.is_empty());
    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
}

#[tokio::test]
async fn test_history_is_last_ten_messages_oldest_first() {
    let h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    let project_id = h.project().await;
    for i in 1..=12 {
        let pid = project_id.clone();
        let role = if i % 2 == 1 { MessageRole::User } else { MessageRole::Assistant };
        h.db.call(move |db| db.create_message(&pid, &format!("m{}", i), role, MessageType::Result))
            .await
            .unwrap();
    }

    h.workflow()
        .run("run-history", &event(&project_id, "next"))
        .await
        .unwrap();

    let first = &h.model.requests()[0];
    assert_eq!(first.messages[0].role, Role::System);
    let turns: Vec<(Role, String)> = first.messages[1..]
        .iter()
        .map(|m| (m.role, m.content.clone().unwrap_or_default()))
        .collect();
    let mut expected: Vec<(Role, String)> = (3..=12)
        .map(|i| {
            let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
            (role, format!("m{}", i))
        })
        .collect();
    expected.push((Role::User, "next".to_string()));
    assert_eq!(turns, expected);
}

#[tokio::test]
async fn test_github_not_found_leaves_record_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "octo"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/todo"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    h.config.github.api_base = server.uri();
    h.config.github.token = Some("ghp_test".into());
    let project_id = h.project().await;
    let pid = project_id.clone();
    h.db.call(move |db| db.update_project_github(&pid, true, Some("todo"), None))
        .await
        .unwrap();

    h.workflow()
        .run("run-push", &event(&project_id, "build a todo list app"))
        .await
        .unwrap();

    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Result);
    assert_eq!(
        messages[0].content,
        "I built a todo list app where you can add and delete tasks."
    );
    assert!(messages[0].fragment.is_some());
    assert_eq!(
        h.checkpoints.load("run-push", "auto-push-to-github").await.unwrap(),
        Some("null".to_string())
    );
}

#[tokio::test]
async fn test_reinvoking_a_finished_run_is_a_no_op() {
    let h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    let project_id = h.project().await;
    let workflow = h.workflow();
    let ev = event(&project_id, "build a todo list app");

    let first = workflow.run("run-same", &ev).await.unwrap();
    let requests = h.model.requests().len();
    let second = workflow.run("run-same", &ev).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.model.requests().len(), requests);
    assert_eq!(h.sandboxes.create_count(), 1);
    assert_eq!(h.assistant_messages(&project_id).await.len(), 1);
}

/// Checkpoint store whose first write of one stage is lost.
struct LosesOneWrite {
    inner: SqliteCheckpointStore,
    stage: &'static str,
    tripped: AtomicBool,
}

#[async_trait]
impl CheckpointStore for LosesOneWrite {
    async fn load(&self, run_id: &str, stage: &str) -> anyhow::Result<Option<String>> {
        self.inner.load(run_id, stage).await
    }

    async fn save(&self, run_id: &str, stage: &str, output: String) -> anyhow::Result<()> {
        if stage == self.stage && !self.tripped.swap(true, Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.save(run_id, stage, output).await
    }
}

#[tokio::test]
async fn test_resume_after_lost_checkpoint_keeps_exactly_one_record() {
    let mut h = Harness::new(ScriptedChatModel::new(todo_app_script()));
    h.checkpoints = Arc::new(LosesOneWrite {
        inner: SqliteCheckpointStore::new(h.db.clone()),
        stage: "save-result",
        tripped: AtomicBool::new(false),
    });
    let project_id = h.project().await;
    let workflow = h.workflow();
    let ev = event(&project_id, "build a todo list app");

    assert!(workflow.run("run-resume", &ev).await.is_err());
    let requests = h.model.requests().len();

    let output = workflow.run("run-resume", &ev).await.unwrap();
    assert_eq!(output.title, "Todo List");
    assert_eq!(h.model.requests().len(), requests);
    assert_eq!(h.sandboxes.create_count(), 1);

    let messages = h.assistant_messages(&project_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Result);

    let stages = h
        .db
        .call(|db| db.list_checkpoint_stages("run-resume"))
        .await
        .unwrap();
    assert!(stages.contains(&"save-result".to_string()));
    assert!(stages.contains(&"run-network".to_string()));
}
