#![cfg(unix)]

use clawkeeper::config::Settings;
use clawkeeper::gateway::{ChatGateway, GatewayError};
use clawkeeper::inbox::InboundMessage;
use clawkeeper::runtime::{drain_inbox_once, tick_scheduler, HostContext};
use clawkeeper::scheduler::{ContextMode, NewTask, RunStatus, ScheduleKind, TaskStatus};
use clawkeeper::shared::TenantId;
use clawkeeper::store::ChatRecord;
use clawkeeper::tenant::Tenant;
use clawkeeper::worker::{OUTPUT_END_MARKER, OUTPUT_START_MARKER};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const T: i64 = 1_704_067_200;

#[derive(Default)]
struct RecordingGateway {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingGateway {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl ChatGateway for RecordingGateway {
    fn send_message(&self, chat: &str, text: &str) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((chat.to_string(), text.to_string()));
        Ok(())
    }

    fn sync_groups(&self) -> Result<Vec<ChatRecord>, GatewayError> {
        Ok(Vec::new())
    }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn success_line(result: &str, session: &str) -> String {
    format!(
        "echo '{OUTPUT_START_MARKER}'\n\
         echo '{{\"status\":\"success\",\"result\":\"{result}\",\"newSessionId\":\"{session}\"}}'\n\
         echo '{OUTPUT_END_MARKER}'\n"
    )
}

struct Harness {
    _dir: TempDir,
    ctx: HostContext,
    gateway: Arc<RecordingGateway>,
    family: Tenant,
}

impl Harness {
    fn new(worker_body: &str) -> Self {
        let dir = tempdir().expect("tempdir");
        let worker = dir.path().join("worker.sh");
        write_script(&worker, worker_body);

        let settings: Settings = serde_yaml::from_str(&format!(
            "state_root: {}\nmain_tenant:\n  id: main\n  chat: main@g.us\nworker:\n  binary: {}\n  timeout_seconds: 10\n",
            dir.path().join("state").display(),
            worker.display()
        ))
        .expect("settings");
        settings.validate().expect("valid settings");

        let gateway = Arc::new(RecordingGateway::default());
        let ctx = HostContext::open_with_gateway(&settings, gateway.clone()).expect("context");
        ctx.register_main_tenant(&settings, T).expect("main tenant");
        let family = ctx
            .registry
            .register(&TenantId::parse("family").expect("id"), "Family", "family@g.us", T)
            .expect("family");

        Self {
            _dir: dir,
            ctx,
            gateway,
            family,
        }
    }

    fn schedule(&self, kind: ScheduleKind, value: &str, mode: ContextMode) -> String {
        self.ctx
            .scheduler
            .create_task(
                NewTask {
                    tenant_id: self.family.id.clone(),
                    chat_target: self.family.chat_target.clone(),
                    prompt: "check the calendar".to_string(),
                    schedule_kind: kind,
                    schedule_value: value.to_string(),
                    context_mode: mode,
                },
                T - 60,
            )
            .expect("create task")
            .id
            .to_string()
    }

    fn workdir(&self) -> std::path::PathBuf {
        self.ctx.paths.groups_dir().join("family")
    }

    fn drop_inbound(&self, name: &str, text: &str) {
        let message = InboundMessage {
            chat: "family@g.us".to_string(),
            sender: "4915100@s.whatsapp.net".to_string(),
            sender_name: "Dana".to_string(),
            text: text.to_string(),
            timestamp: T,
            message_id: name.to_string(),
        };
        fs::write(
            self.ctx.paths.inbox_incoming_dir().join(format!("{name}.json")),
            serde_json::to_vec(&message).expect("encode"),
        )
        .expect("write inbound");
    }
}

#[test]
fn once_task_runs_delivers_and_retires() {
    let body = format!("#!/bin/sh\ncat > input.json\n{}", success_line("Time to stretch", "s-1"));
    let harness = Harness::new(&body);
    let task_id = harness.schedule(ScheduleKind::Once, "2024-01-01T00:00:00Z", ContextMode::Isolated);

    assert_eq!(tick_scheduler(&harness.ctx, T).expect("tick"), 1);

    let task = harness.ctx.scheduler.load_task(&task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.next_run, None);
    assert_eq!(task.last_run, Some(T));
    assert_eq!(task.last_result.as_deref(), Some("Time to stretch"));
    assert_eq!(
        harness.gateway.sent(),
        vec![("family@g.us".to_string(), "Time to stretch".to_string())]
    );

    let input: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(harness.workdir().join("input.json")).expect("input"),
    )
    .expect("json");
    assert_eq!(input["isScheduledTask"], true);
    assert!(input.get("sessionId").is_none());
    // Isolated runs never persist a session.
    assert_eq!(
        harness.ctx.store.get_session(&harness.family.id).expect("session"),
        None
    );

    // A retired task is never picked up again.
    assert_eq!(tick_scheduler(&harness.ctx, T + 86_400).expect("tick"), 0);
}

#[test]
fn failing_interval_task_still_advances() {
    let harness = Harness::new("#!/bin/sh\necho 'boom' >&2\nexit 1\n");
    let task_id = harness.schedule(ScheduleKind::Interval, "3600", ContextMode::Isolated);
    let before = harness.ctx.scheduler.load_task(&task_id).expect("task");
    assert_eq!(before.next_run, Some(T - 60 + 3600));

    // Not due yet.
    assert_eq!(tick_scheduler(&harness.ctx, T).expect("tick"), 0);

    let run_at = T + 3600;
    assert_eq!(tick_scheduler(&harness.ctx, run_at).expect("tick"), 1);
    let task = harness.ctx.scheduler.load_task(&task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Active);
    assert_eq!(task.next_run, Some(run_at + 3600));
    assert!(task
        .last_result
        .as_deref()
        .is_some_and(|r| r.starts_with("Error:")));
    assert!(harness.gateway.sent().is_empty());

    let logs = harness
        .ctx
        .store
        .list_run_logs(&task.id)
        .expect("run logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Error);
    assert!(logs[0].error.as_deref().unwrap_or("").contains("boom"));
}

#[test]
fn group_context_resumes_and_stores_the_session() {
    let body = format!("#!/bin/sh\ncat > input.json\n{}", success_line("", "s-new"));
    let harness = Harness::new(&body);
    harness
        .ctx
        .store
        .set_session(&harness.family.id, "s-old", T)
        .expect("seed session");
    harness.schedule(ScheduleKind::Interval, "60", ContextMode::Group);

    assert_eq!(tick_scheduler(&harness.ctx, T).expect("tick"), 1);

    let input: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(harness.workdir().join("input.json")).expect("input"),
    )
    .expect("json");
    assert_eq!(input["sessionId"], "s-old");
    assert_eq!(
        harness
            .ctx
            .store
            .get_session(&harness.family.id)
            .expect("session")
            .as_deref(),
        Some("s-new")
    );
    // Empty result text is not delivered.
    assert!(harness.gateway.sent().is_empty());
}

#[test]
fn mailbox_requests_written_during_a_turn_are_applied_after_it() {
    let body = format!(
        "#!/bin/sh\ncat > /dev/null\n\
         printf '%s' '{{\"targetChat\":\"family@g.us\",\"body\":\"from the worker\"}}' > \"$CLAWKEEPER_IPC_DIR/messages/.pending\"\n\
         mv \"$CLAWKEEPER_IPC_DIR/messages/.pending\" \"$CLAWKEEPER_IPC_DIR/messages/1-note.json\"\n\
         printf '%s' '{{\"targetChat\":\"main@g.us\",\"body\":\"escalate\"}}' > \"$CLAWKEEPER_IPC_DIR/messages/.pending\"\n\
         mv \"$CLAWKEEPER_IPC_DIR/messages/.pending\" \"$CLAWKEEPER_IPC_DIR/messages/2-note.json\"\n\
         {}",
        success_line("done", "s-1")
    );
    let harness = Harness::new(&body);
    harness.drop_inbound("m1", "@Andy remind everyone");

    let report = drain_inbox_once(&harness.ctx).expect("drain inbox");
    assert_eq!(report.turns, 1);

    let sent = harness.gateway.sent();
    assert_eq!(
        sent,
        vec![
            ("family@g.us".to_string(), "from the worker".to_string()),
            ("family@g.us".to_string(), "done".to_string()),
        ]
    );
    assert!(fs::read_dir(harness.ctx.paths.ipc_dir().join("family/messages"))
        .expect("messages dir")
        .next()
        .is_none());
}

#[test]
fn inbox_routes_triggered_messages_in_order_and_skips_the_rest() {
    let body = format!(
        "#!/bin/sh\ncat >> inputs.jsonl\necho >> inputs.jsonl\n{}",
        success_line("ack", "s-1")
    );
    let harness = Harness::new(&body);
    harness.drop_inbound("a-first", "@Andy first");
    harness.drop_inbound("b-chatter", "no trigger here");
    harness.drop_inbound("c-second", "@andy second");

    let report = drain_inbox_once(&harness.ctx).expect("drain");
    assert_eq!(report.turns, 2);
    assert_eq!(report.ignored, 1);

    let prompts = fs::read_to_string(harness.workdir().join("inputs.jsonl"))
        .expect("inputs")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).expect("json")["prompt"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(prompts, vec!["Dana: @Andy first", "Dana: @andy second"]);

    // The second live turn resumes the session the first one returned.
    assert_eq!(
        harness
            .ctx
            .store
            .get_session(&harness.family.id)
            .expect("session")
            .as_deref(),
        Some("s-1")
    );
    assert!(fs::read_dir(harness.ctx.paths.inbox_processing_dir())
        .expect("processing")
        .next()
        .is_none());
    assert!(fs::read_dir(harness.ctx.paths.inbox_incoming_dir())
        .expect("incoming")
        .next()
        .is_none());
}
