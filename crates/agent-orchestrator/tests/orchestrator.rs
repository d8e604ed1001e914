//! End-to-end orchestration against fake tracker, workspace and agent.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use agent_orchestrator::issue::{BlockingIssue, IssueComment};
use agent_orchestrator::orchestrator::ACKNOWLEDGEMENT;
use agent_orchestrator::persistence::StateStore;
use agent_orchestrator::trigger::TriggerComment;
use agent_orchestrator::{AgentSessionStatus, ThreadContext, Trigger};
use agent_runner::RunnerError;
use chrono::Utc;
use common::*;
use linear::ActivityContent;
use tokio::sync::Notify;

fn assignment(issue_id: &str) -> Trigger {
    Trigger::Assignment {
        issue_id: issue_id.into(),
    }
}

fn user_comment(id: &str, body: &str, parent_id: Option<&str>) -> TriggerComment {
    TriggerComment {
        id: id.into(),
        body: body.into(),
        author_id: Some("user-1".into()),
        parent_id: parent_id.map(Into::into),
    }
}

fn issue_comment(id: &str, author: &str, body: &str, offset_secs: i64) -> IssueComment {
    IssueComment {
        id: id.into(),
        body: body.into(),
        author_id: Some(author.into()),
        author_name: None,
        created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
        parent_id: None,
    }
}

async fn all_agent_sessions_terminal(h: &Harness) -> bool {
    let sessions = h.orchestrator.context().agent_sessions.all().await;
    !sessions.is_empty() && sessions.iter().all(|s| s.status.is_terminal())
}

#[tokio::test]
async fn test_assignment_acknowledges_works_and_resolves_root_thread() {
    let h = Harness::new(vec![Turn::Finish(vec![
        init("conv-1"),
        assistant_text("conv-1", "Looking at the redirect handler."),
        success("conv-1", "Fixed the redirect."),
    ])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    h.tracker.queue_comment_ids(&["agent-root-123"]).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();

    wait_for("thread resolution", || async {
        h.tracker.resolutions().await.len() == 1
    })
    .await;

    let comments = h.tracker.comments().await;
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].body, ACKNOWLEDGEMENT);
    assert_eq!(comments[0].parent_id, None);
    assert_eq!(comments[1].parent_id.as_deref(), Some("agent-root-123"));
    assert!(comments[1].body.starts_with("Fixed the redirect."));
    assert!(comments[1].body.contains("*Cost for last run: $0.25, Duration: 12s*"));
    assert!(!comments[1].body.contains("Total estimated cost"));

    assert_eq!(
        h.tracker.resolutions().await,
        vec![("agent-root-123".to_string(), Some(comments[1].id.clone()))]
    );

    let activities = h.tracker.activities.lock().await.clone();
    assert_eq!(activities.len(), 3);
    assert!(matches!(activities[0].content, ActivityContent::Thought { .. }));
    assert!(matches!(
        &activities[2].content,
        ActivityContent::Response { body } if body == "Fixed the redirect."
    ));

    let requests = h.backend.requests().await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.contains("Fix the login redirect"));
    assert!(requests[0].resume_session_id.is_none());
    assert_eq!(requests[0].allowed_tools, vec!["Read", "Bash"]);

    // The runner stays up between turns
    assert!(h.orchestrator.context().registry.has("issue-1").await);
    let sessions = h.orchestrator.context().agent_sessions.all().await;
    assert_eq!(sessions[0].status, AgentSessionStatus::Complete);
    assert_eq!(sessions[0].claude_session_id.as_deref(), Some("conv-1"));
}

#[tokio::test]
async fn test_reply_thread_takes_priority_over_agent_root() {
    let h = Harness::new(vec![
        Turn::Finish(vec![init("conv-1"), success("conv-1", "First pass done.")]),
        Turn::Finish(vec![success("conv-1", "Updated per your note.")]),
    ]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    h.tracker.queue_comment_ids(&["agent-root-123"]).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("first resolution", || async {
        h.tracker.resolutions().await.len() == 1
    })
    .await;

    h.orchestrator
        .handle_trigger(Trigger::Reply {
            issue_id: "issue-1".into(),
            comment: user_comment(
                "reply-789",
                "Please also handle logout",
                Some("user-comment-456"),
            ),
        })
        .await
        .unwrap();
    wait_for("second resolution", || async {
        h.tracker.resolutions().await.len() == 2
    })
    .await;

    let comments = h.tracker.comments().await;
    let answer = comments.last().unwrap();
    assert_eq!(answer.parent_id.as_deref(), Some("user-comment-456"));
    assert!(answer.body.starts_with("Updated per your note."));
    assert!(answer.body.contains("Total estimated cost for this issue: $0.50"));

    let resolutions = h.tracker.resolutions().await;
    assert_eq!(resolutions[1].0, "user-comment-456");
    assert_eq!(resolutions[1].1.as_deref(), Some(answer.id.as_str()));
    assert!(resolutions.iter().filter(|(id, _)| id == "agent-root-123").count() == 1);

    let requests = h.backend.requests().await;
    assert_eq!(requests[1].prompt, "Please also handle logout");
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("conv-1"));

    let handle = h.orchestrator.context().registry.get("issue-1").await.unwrap();
    wait_for("reply thread cleared", || async {
        handle.lock().await.thread.current_parent_id.is_none()
    })
    .await;
    assert_eq!(handle.lock().await.thread.target(), Some("agent-root-123"));
}

#[tokio::test]
async fn test_reply_during_running_turn_is_answered_in_its_own_thread() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(vec![
        Turn::Gated {
            before: vec![init("conv-1")],
            gate: gate.clone(),
            after: vec![success("conv-1", "Answer to the original task.")],
        },
        Turn::Finish(vec![success("conv-1", "Answer to the reply.")]),
    ]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    h.tracker.queue_comment_ids(&["agent-root-123"]).await;
    let ctx = h.orchestrator.context();

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("first turn running", || async {
        ctx.agent_sessions
            .get("agent-session-1")
            .await
            .is_some_and(|s| s.claude_session_id.is_some())
    })
    .await;

    h.orchestrator
        .handle_trigger(Trigger::Reply {
            issue_id: "issue-1".into(),
            comment: user_comment("reply-789", "What about logout?", Some("user-comment-456")),
        })
        .await
        .unwrap();

    // Nothing moves to the reply until its turn starts
    {
        let handle = ctx.registry.get("issue-1").await.unwrap();
        let session = handle.lock().await;
        assert_eq!(session.thread.current_parent_id, None);
        assert_eq!(session.agent_session_id.as_deref(), Some("agent-session-1"));
    }

    gate.notify_one();
    wait_for("both answers resolved", || async {
        h.tracker.resolutions().await.len() == 2
    })
    .await;

    let comments = h.tracker.comments().await;
    let original = comments
        .iter()
        .find(|c| c.body.starts_with("Answer to the original task."))
        .unwrap();
    let answer = comments
        .iter()
        .find(|c| c.body.starts_with("Answer to the reply."))
        .unwrap();
    assert_eq!(original.parent_id.as_deref(), Some("agent-root-123"));
    assert_eq!(answer.parent_id.as_deref(), Some("user-comment-456"));

    let resolved: Vec<_> = h
        .tracker
        .resolutions()
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(resolved, vec!["agent-root-123", "user-comment-456"]);

    let first = ctx.agent_sessions.get("agent-session-1").await.unwrap();
    let second = ctx.agent_sessions.get("agent-session-2").await.unwrap();
    assert_eq!(first.status, AgentSessionStatus::Complete);
    assert_eq!(second.status, AgentSessionStatus::Complete);

    let contents = |entries: Vec<agent_orchestrator::AgentSessionEntry>| {
        entries.into_iter().map(|e| e.content).collect::<Vec<_>>()
    };
    let first_entries = contents(ctx.agent_sessions.entries("agent-session-1").await);
    assert!(first_entries.contains(&"Answer to the original task.".to_string()));
    assert!(!first_entries.contains(&"Answer to the reply.".to_string()));
    assert_eq!(
        contents(ctx.agent_sessions.entries("agent-session-2").await),
        vec!["Answer to the reply."]
    );
}

#[tokio::test]
async fn test_final_response_without_thread_is_not_resolved() {
    let h = Harness::new(vec![]);

    let posted = h
        .orchestrator
        .post_final_response_and_resolve("issue-1", "Done.", &ThreadContext::default())
        .await;

    assert!(posted);
    let comments = h.tracker.comments().await;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].parent_id, None);
    assert!(h.tracker.resolutions().await.is_empty());
}

#[tokio::test]
async fn test_failed_post_skips_resolution() {
    let h = Harness::new(vec![]);
    let thread = ThreadContext::with_root("agent-root-123");

    h.tracker.fail_comments.store(true, Ordering::SeqCst);
    assert!(
        !h.orchestrator
            .post_final_response_and_resolve("issue-1", "Done.", &thread)
            .await
    );

    h.tracker.fail_comments.store(false, Ordering::SeqCst);
    h.tracker.reject_comments.store(true, Ordering::SeqCst);
    assert!(
        !h.orchestrator
            .post_final_response_and_resolve("issue-1", "Done.", &thread)
            .await
    );

    assert!(h.tracker.resolutions().await.is_empty());
}

#[tokio::test]
async fn test_blocked_issue_is_gated() {
    let h = Harness::new(vec![]);
    let mut blocked = issue("issue-1", "TEAM-1");
    blocked.blocked_by.push(BlockingIssue {
        id: "issue-0".into(),
        identifier: Some("TEAM-0".into()),
    });
    h.tracker.add_issue(blocked).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();

    let notices = h.tracker.plain_comments.lock().await.clone();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].1.contains("blocked by issue TEAM-0"));
    assert!(h.tracker.comments().await.is_empty());
    assert!(h.provisioner.ensured.lock().await.is_empty());
    assert!(h.backend.requests().await.is_empty());
    assert!(!h.orchestrator.context().registry.has("issue-1").await);
}

#[tokio::test]
async fn test_blocked_issue_proceeds_with_permission() {
    let h = Harness::new(vec![]);
    let mut blocked = issue("issue-1", "TEAM-1");
    blocked.blocked_by.push(BlockingIssue {
        id: "issue-0".into(),
        identifier: Some("TEAM-0".into()),
    });
    blocked.comments = vec![
        issue_comment("c1", AGENT_USER, "This issue is blocked by TEAM-0.", 0),
        issue_comment("c2", "user-1", "Go ahead anyway", 1),
    ];
    h.tracker.add_issue(blocked).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();

    wait_for("agent start", || async {
        h.backend.requests().await.len() == 1
    })
    .await;
    assert!(h.tracker.plain_comments.lock().await.is_empty());
}

#[tokio::test]
async fn test_token_limit_restarts_with_fresh_session() {
    let h = Harness::new(vec![
        Turn::Finish(vec![init("conv-1"), token_limit("conv-1")]),
        Turn::Finish(vec![init("conv-2"), success("conv-2", "Resumed and finished.")]),
    ]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    h.tracker.queue_comment_ids(&["agent-root-123"]).await;

    let ctx = h.orchestrator.context();
    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();

    wait_for("resumed answer", || async {
        h.tracker.resolutions().await.len() == 1
    })
    .await;

    let requests = h.backend.requests().await;
    assert_eq!(requests.len(), 2);
    assert!(requests[1].prompt.contains("ran out of context"));
    assert!(requests[1].resume_session_id.is_none());

    let agent_sessions = ctx.agent_sessions.sessions_for_issue("issue-1").await;
    assert_eq!(agent_sessions.len(), 2);
    wait_for("first agent session closed", || async {
        ctx.agent_sessions
            .get(&agent_sessions[0].id)
            .await
            .is_some_and(|s| s.status.is_terminal())
    })
    .await;
    assert_eq!(
        ctx.agent_sessions.get(&agent_sessions[0].id).await.unwrap().status,
        AgentSessionStatus::Complete
    );
    assert_eq!(agent_sessions[0].claude_session_id.as_deref(), Some("conv-1"));
    assert_eq!(agent_sessions[1].claude_session_id.as_deref(), Some("conv-2"));

    let current = ctx.registry.get("issue-1").await.unwrap();
    {
        let session = current.lock().await;
        assert!(session.is_live());
        assert_eq!(session.agent_session_id.as_deref(), Some(agent_sessions[1].id.as_str()));
    }

    // The token-limit result itself is never mirrored
    let activities = h.tracker.activities.lock().await.clone();
    assert!(activities
        .iter()
        .all(|a| !matches!(&a.content, ActivityContent::Error { body } if body.contains("too long"))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let comments = h.tracker.comments().await;
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[1].parent_id.as_deref(), Some("agent-root-123"));
    assert!(comments[1].body.starts_with("Resumed and finished."));
    assert!(comments.iter().all(|c| !c.body.contains("exited unexpectedly")));
    assert_eq!(ctx.registry.live_count().await, 1);
}

#[tokio::test]
async fn test_crash_posts_error_without_resolving() {
    let h = Harness::new(vec![Turn::Finish(vec![
        init("conv-1"),
        Err(RunnerError::ProcessExited {
            code: Some(2),
            stderr: "panic in tool".into(),
        }),
    ])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    h.tracker.queue_comment_ids(&["agent-root-123"]).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();

    wait_for("error comment", || async { h.tracker.comments().await.len() == 2 }).await;
    let comments = h.tracker.comments().await;
    assert!(comments[1]
        .body
        .starts_with("Agent process for issue TEAM-1 exited unexpectedly with code 2."));
    assert!(comments[1].body.contains("panic in tool"));
    assert_eq!(comments[1].parent_id.as_deref(), Some("agent-root-123"));
    assert!(h.tracker.resolutions().await.is_empty());

    wait_for("session release", || async {
        !h.orchestrator.context().registry.has("issue-1").await
    })
    .await;
    let sessions = h.orchestrator.context().agent_sessions.all().await;
    assert_eq!(sessions[0].status, AgentSessionStatus::Error);
    let activities = h.tracker.activities.lock().await.clone();
    assert!(matches!(
        activities.last().map(|a| &a.content),
        Some(ActivityContent::Error { .. })
    ));
}

#[tokio::test]
async fn test_unassignment_stops_quietly_and_mention_resumes() {
    let h = Harness::new(vec![Turn::Hang(vec![init("conv-1")])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    let ctx = h.orchestrator.context();

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("conversation id", || async {
        ctx.agent_sessions
            .sessions_for_issue("issue-1")
            .await
            .iter()
            .any(|s| s.claude_session_id.is_some())
    })
    .await;

    h.orchestrator
        .handle_trigger(Trigger::Unassignment {
            issue_id: "issue-1".into(),
        })
        .await
        .unwrap();
    assert!(!ctx.registry.has("issue-1").await);

    wait_for("agent session completion", || all_agent_sessions_terminal(&h)).await;
    let sessions = ctx.agent_sessions.all().await;
    assert_eq!(sessions[0].status, AgentSessionStatus::Complete);
    assert_eq!(h.tracker.comments().await.len(), 1, "only the acknowledgement");

    h.orchestrator
        .handle_trigger(Trigger::Mention {
            issue_id: "issue-1".into(),
            comment: user_comment("c-5", "Can you also update the docs?", None),
        })
        .await
        .unwrap();

    wait_for("resumed turn", || async { h.backend.requests().await.len() == 2 }).await;
    let requests = h.backend.requests().await;
    assert_eq!(requests[1].prompt, "Can you also update the docs?");
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("conv-1"));
    assert_eq!(h.tracker.comments().await.len(), 1, "no second acknowledgement");
}

#[tokio::test]
async fn test_mention_without_history_starts_with_full_prompt() {
    let h = Harness::new(vec![Turn::Finish(vec![
        init("conv-1"),
        success("conv-1", "Answered."),
    ])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    h.orchestrator
        .handle_trigger(Trigger::Mention {
            issue_id: "issue-1".into(),
            comment: user_comment("c-9", "@agent what <breaks> here?", None),
        })
        .await
        .unwrap();

    wait_for("resolution", || async {
        h.tracker.resolutions().await.len() == 1
    })
    .await;

    let requests = h.backend.requests().await;
    assert!(requests[0].prompt.contains("Fix the login redirect"));
    assert!(requests[0].prompt.contains("<new_comment id=\"c-9\">"));
    assert!(requests[0].prompt.contains("what &lt;breaks&gt; here?"));

    let comments = h.tracker.comments().await;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].parent_id.as_deref(), Some("c-9"));
    assert_eq!(h.tracker.resolutions().await[0].0, "c-9");
}

#[tokio::test]
async fn test_own_and_unrouted_comments_are_ignored() {
    let h = Harness::new(vec![]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    let own = TriggerComment {
        author_id: Some(AGENT_USER.into()),
        ..user_comment("c-1", "@agent note to self", None)
    };
    h.orchestrator
        .handle_trigger(Trigger::Mention {
            issue_id: "issue-1".into(),
            comment: own,
        })
        .await
        .unwrap();
    h.orchestrator
        .handle_trigger(Trigger::NewComment {
            issue_id: "issue-1".into(),
            comment: user_comment("c-2", "Unrelated chatter", None),
        })
        .await
        .unwrap();

    assert!(h.provisioner.ensured.lock().await.is_empty());
    assert!(h.backend.requests().await.is_empty());
    assert!(h.tracker.comments().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_assignments_start_one_session() {
    let h = Harness::new(vec![]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.handle_trigger(assignment("issue-1")).await })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.unwrap().unwrap();
    }

    wait_for("agent start", || async { h.backend.requests().await.len() == 1 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.backend.requests().await.len(), 1);
    assert_eq!(h.provisioner.ensured.lock().await.len(), 1);
    assert_eq!(h.tracker.comments().await.len(), 1);
    assert_eq!(h.orchestrator.context().registry.live_count().await, 1);
}

#[tokio::test]
async fn test_local_sessions_are_not_mirrored() {
    let tracker = FakeTracker::new();
    tracker.tracker_sessions.store(false, Ordering::SeqCst);
    let h = Harness::with_tracker(
        tracker,
        vec![Turn::Finish(vec![init("conv-1"), success("conv-1", "Done.")])],
    );
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("resolution", || async {
        h.tracker.resolutions().await.len() == 1
    })
    .await;

    assert!(h.tracker.activities.lock().await.is_empty());
    let sessions = h.orchestrator.context().agent_sessions.all().await;
    assert_eq!(sessions.len(), 1);
    assert!(!sessions[0].synced);
    assert_eq!(sessions[0].status, AgentSessionStatus::Complete);
}

#[tokio::test]
async fn test_stopping_before_first_message_releases_local_reservation() {
    let tracker = FakeTracker::new();
    tracker.tracker_sessions.store(false, Ordering::SeqCst);
    let h = Harness::with_tracker(tracker, vec![Turn::Hang(vec![])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    let ctx = h.orchestrator.context();

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("agent start", || async { h.backend.requests().await.len() == 1 }).await;

    let handle = ctx.registry.get("issue-1").await.unwrap();
    let reserved = handle.lock().await.agent_session_id.clone().unwrap();
    assert!(ctx.agent_sessions.is_reserved(&reserved).await);

    h.orchestrator
        .handle_trigger(Trigger::Unassignment {
            issue_id: "issue-1".into(),
        })
        .await
        .unwrap();

    wait_for("reservation released", || async {
        !ctx.agent_sessions.is_reserved(&reserved).await
    })
    .await;
    assert!(ctx.agent_sessions.all().await.is_empty());
}

#[tokio::test]
async fn test_startup_picks_up_open_assigned_issues() {
    let h = Harness::new(vec![]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;
    let mut done = issue("issue-2", "TEAM-2");
    done.state_type = Some("completed".into());
    h.tracker.add_issue(done).await;

    let started = h.orchestrator.startup().await.unwrap();

    assert_eq!(started, 1);
    assert!(h.orchestrator.context().registry.has("issue-1").await);
    assert!(!h.orchestrator.context().registry.has("issue-2").await);
    assert!(h.tracker.comments().await.is_empty(), "no acknowledgement on startup");
}

#[tokio::test]
async fn test_shutdown_stops_sessions_and_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let h = Harness::build(
        FakeTracker::new(),
        vec![Turn::Hang(vec![init("conv-1")])],
        |ctx| ctx.with_state_store(StateStore::new(&state_path)),
    );
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("agent start", || async { h.backend.requests().await.len() == 1 }).await;

    h.orchestrator.shutdown().await;
    wait_for("session release", || async {
        !h.orchestrator.context().registry.has("issue-1").await
    })
    .await;

    let saved = StateStore::new(&state_path).load().await.unwrap().unwrap();
    assert_eq!(saved.sessions.len(), 1);
    assert_eq!(saved.sessions[0].issue_id, "issue-1");
    assert_eq!(h.tracker.comments().await.len(), 1, "no error comment on shutdown");
}

#[tokio::test]
async fn test_garbage_collection_drops_finished_sessions() {
    let h = Harness::new(vec![Turn::Finish(vec![init("conv-1"), success("conv-1", "Done.")])]);
    h.tracker.add_issue(issue("issue-1", "TEAM-1")).await;

    h.orchestrator.handle_trigger(assignment("issue-1")).await.unwrap();
    wait_for("completion", || all_agent_sessions_terminal(&h)).await;

    assert_eq!(
        h.orchestrator
            .collect_garbage(chrono::Duration::hours(1))
            .await,
        0
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.orchestrator
            .collect_garbage(chrono::Duration::milliseconds(5))
            .await,
        1
    );
    assert!(h.orchestrator.context().agent_sessions.all().await.is_empty());
}
