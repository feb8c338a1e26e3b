//! Watcher integration tests
//!
//! A parent session and a watcher session each run their own scripted provider.

mod common;

use std::sync::Arc;

use common::*;
use tether_core::provider::{ProviderRegistry, ScriptedProvider, ScriptedTurn};
use tether_core::tools::ToolRegistry;
use tether_core::{ChunkKind, Config, RoleAuthority, SessionManager, SessionRole, SessionStatus};
use tokio::sync::Notify;

struct Pair {
    manager: SessionManager,
    parent_provider: Arc<ScriptedProvider>,
    watcher_provider: Arc<ScriptedProvider>,
}

fn pair_with(parent_turns: Vec<ScriptedTurn>, watcher_turns: Vec<ScriptedTurn>, config: Config) -> Pair {
    let parent_provider = Arc::new(ScriptedProvider::new(parent_turns));
    let watcher_provider = Arc::new(ScriptedProvider::new(watcher_turns).with_model("reviewer-1"));
    let mut providers = ProviderRegistry::new().with_default("scripted");
    providers
        .register_instance("scripted", parent_provider.clone())
        .register_instance("reviewer", watcher_provider.clone());
    let manager = SessionManager::new(config, Arc::new(providers), Arc::new(ToolRegistry::new()));
    Pair {
        manager,
        parent_provider,
        watcher_provider,
    }
}

fn pair(parent_turns: Vec<ScriptedTurn>, watcher_turns: Vec<ScriptedTurn>) -> Pair {
    pair_with(parent_turns, watcher_turns, common::config())
}

fn supervisor() -> SessionRole {
    SessionRole::new("reviewer", RoleAuthority::Supervisor).with_description("Check for unsafe edits.")
}

mod observation_tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_evaluates_after_parent_turn() {
        let p = pair(
            vec![ScriptedTurn::new().text("Hi")],
            vec![ScriptedTurn::new().text("Looks fine")],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&parent, "Hello").unwrap();
        wait_for_done(&p.manager, &parent, 1).await;
        wait_for_done(&p.manager, &watcher, 1).await;

        let prompt = p.watcher_provider.requests()[0]
            .last_user_message()
            .unwrap()
            .to_string();
        assert_eq!(
            prompt,
            format!(
                "You are watching session {} as reviewer (Supervisor authority). Check for unsafe edits.\n\n\
                 Recent activity:\n[user] Hello\n[assistant] Hi\n\n\
                 Evaluate this activity and decide whether the session needs to hear from you.\n\n\
                 To send it a message, reply with:\n\
                 [INTERJECT]\nurgent: false\ncontent: your message\n[/INTERJECT]\n\
                 Use `urgent: true` only to stop the current turn for a critical problem.\n\n\
                 Otherwise reply with:\n\
                 [CONTINUE]\noptional reasoning\n[/CONTINUE]",
                parent
            )
        );

        let watcher_output = kinds(&p.manager.buffered_output(&watcher, None).unwrap());
        assert!(watcher_output.contains(&text("Looks fine")));
        assert_eq!(p.parent_provider.calls(), 1);

        let summaries = p.manager.list();
        assert_eq!(summaries[1].parent_id.as_deref(), Some(parent.as_str()));
        assert_eq!(summaries[1].model, "reviewer-1");
    }

    #[tokio::test]
    async fn test_watcher_evaluates_after_silence() {
        let mut config = common::config();
        config.execution.watcher_silence_timeout_secs = 1;
        let never = Arc::new(Notify::new());
        let p = pair_with(
            vec![ScriptedTurn::new().text("thinking about it").wait(never)],
            vec![ScriptedTurn::new().text("Parent looks stuck")],
            config,
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&parent, "Long task").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;

        assert_eq!(p.manager.status(&parent).unwrap(), SessionStatus::Running);
        let prompt = p.watcher_provider.requests()[0]
            .last_user_message()
            .unwrap()
            .to_string();
        assert!(prompt.contains("[user] Long task"));
    }

    #[tokio::test]
    async fn test_user_prompt_to_watcher_runs_turn() {
        let p = pair(vec![], vec![ScriptedTurn::new().text("Nothing to report")]);
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&watcher, "Status?").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;

        assert_eq!(
            p.watcher_provider.requests()[0].last_user_message(),
            Some("Status?")
        );
        assert_eq!(p.parent_provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_evaluation_runs_after_watcher_was_interrupted() {
        let never = Arc::new(Notify::new());
        let p = pair(
            vec![ScriptedTurn::new().text("Hi")],
            vec![
                ScriptedTurn::new().wait(never),
                ScriptedTurn::new().text("Looks fine"),
            ],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&watcher, "Status?").unwrap();
        wait_until("watcher provider call", || p.watcher_provider.calls() == 1).await;
        assert!(p.manager.interrupt(&watcher).unwrap());
        wait_until("watcher interrupted", || {
            p.manager.status(&watcher).unwrap() == SessionStatus::Interrupted
        })
        .await;

        p.manager.send_input(&parent, "Hello").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;

        assert_eq!(p.watcher_provider.calls(), 2);
        let output = kinds(&p.manager.buffered_output(&watcher, None).unwrap());
        assert!(output.contains(&text("Looks fine")));
        assert_eq!(
            output
                .iter()
                .filter(|k| matches!(k, ChunkKind::Interrupted { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_evaluation_output_carries_observed_ids() {
        let p = pair(
            vec![ScriptedTurn::new().thinking("hmm").text("Hi")],
            vec![ScriptedTurn::new().text("Looks fine")],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();
        p.manager.send_input(&parent, "Hello").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;

        // The parent's user echo and text; thinking is not observed
        let expected = Some(vec![format!("{}-0", parent), format!("{}-2", parent)]);
        let output = p.manager.buffered_output(&watcher, None).unwrap();
        assert!(!output.is_empty());
        for chunk in &output {
            assert_eq!(chunk.observed_correlation_ids, expected, "{:?}", chunk.kind);
        }

        // A prompt typed into the watcher is not an evaluation
        p.manager.send_input(&watcher, "Status?").unwrap();
        wait_for_done(&p.manager, &watcher, 2).await;
        let last = p.manager.buffered_output(&watcher, Some(1)).unwrap();
        assert_eq!(last[0].observed_correlation_ids, None);
    }

    #[tokio::test]
    async fn test_cleared_role_stops_evaluation() {
        let p = pair(
            vec![ScriptedTurn::new().text("one"), ScriptedTurn::new().text("two")],
            vec![ScriptedTurn::new().text("Looks fine")],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.clear_role(&watcher).unwrap();
        assert_eq!(p.manager.role(&watcher).unwrap(), None);
        p.manager.send_input(&parent, "first").unwrap();
        wait_for_done(&p.manager, &parent, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(p.watcher_provider.calls(), 0);

        p.manager
            .set_role(&watcher, SessionRole::new("tester", RoleAuthority::Peer))
            .unwrap();
        p.manager.send_input(&parent, "second").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;

        let prompt = p.watcher_provider.requests()[0]
            .last_user_message()
            .unwrap()
            .to_string();
        assert!(prompt.contains("as tester (Peer authority)"));
        // Observations from before the role was set were dropped
        assert!(!prompt.contains("[user] first"));
        assert!(prompt.contains("[user] second"));
        assert_eq!(p.manager.list()[1].role.as_deref(), Some("tester"));
    }
}

mod subscription_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_mid_stream_replays_then_streams() {
        let gate = Arc::new(Notify::new());
        let mut config = common::config();
        config.sessions.echo_user_input = false;
        let p = pair_with(
            vec![
                ScriptedTurn::new()
                    .thinking("1")
                    .thinking("2")
                    .thinking("3")
                    .wait(gate.clone())
                    .thinking("4"),
            ],
            vec![],
            config,
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        p.manager.send_input(&parent, "go").unwrap();
        wait_until("three chunks", || {
            p.manager.buffered_output(&parent, None).unwrap().len() == 3
        })
        .await;

        let mut subscription = p.manager.subscribe_watcher(&parent).unwrap();
        assert_eq!(seqs(&subscription.replay), vec![0, 1, 2]);
        gate.notify_one();

        let mut live = Vec::new();
        for _ in 0..2 {
            let chunk = tokio::time::timeout(WAIT, subscription.receiver.recv())
                .await
                .unwrap()
                .unwrap();
            live.push(chunk);
        }
        assert_eq!(seqs(&live), vec![3, 4]);
        assert_eq!(kinds(&live), vec![thinking("4"), ChunkKind::Done]);
        assert!(subscription.receiver.try_recv().is_err());
    }
}

mod injection_tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_inject_runs_parent_turn() {
        let p = pair(vec![ScriptedTurn::new().text("Running tests now")], vec![]);
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.watcher_inject(&watcher, "Stop and run the tests").unwrap();
        wait_for_done(&p.manager, &parent, 1).await;

        let expected = format!(
            "[WATCHER: reviewer | Authority: Supervisor | Session: {}] Stop and run the tests",
            watcher
        );
        let output = kinds(&p.manager.buffered_output(&parent, None).unwrap());
        assert_eq!(
            output,
            vec![
                ChunkKind::WatcherInput {
                    content: expected.clone()
                },
                text("Running tests now"),
                ChunkKind::Done,
            ]
        );
        assert_eq!(
            p.parent_provider.requests()[0].last_user_message(),
            Some(expected.as_str())
        );
    }

    #[tokio::test]
    async fn test_interjection_in_evaluation_reaches_parent() {
        let p = pair(
            vec![
                ScriptedTurn::new().text("Deleting the failing tests"),
                ScriptedTurn::new().text("Restoring them"),
            ],
            vec![ScriptedTurn::new().text(
                "Bad idea.\n[INTERJECT]\nurgent: false\ncontent: Do not delete tests.\n[/INTERJECT]",
            )],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&parent, "Make CI green").unwrap();
        wait_for_done(&p.manager, &parent, 2).await;

        let expected = format!(
            "[WATCHER: reviewer | Authority: Supervisor | Session: {}] Do not delete tests.",
            watcher
        );
        let output = kinds(&p.manager.buffered_output(&parent, None).unwrap());
        assert_eq!(
            output[3..],
            [
                ChunkKind::WatcherInput {
                    content: expected.clone()
                },
                text("Restoring them"),
                ChunkKind::Done,
            ]
        );
        assert_eq!(
            p.parent_provider.requests()[1].last_user_message(),
            Some(expected.as_str())
        );
    }

    #[tokio::test]
    async fn test_urgent_interjection_interrupts_parent() {
        let never = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let p = pair(
            vec![
                ScriptedTurn::new().text("Dropping the table").tool_call("t1", "missing_tool", serde_json::json!({})),
                ScriptedTurn::new().wait(never),
                ScriptedTurn::new().text("Stopping"),
            ],
            vec![ScriptedTurn::new().wait(gate.clone()).text(
                "[INTERJECT]\nurgent: true\ncontent: Stop, that is production.\n[/INTERJECT]",
            )],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.send_input(&parent, "Clean the database").unwrap();
        wait_until("parent blocked in second call", || p.parent_provider.calls() == 2).await;
        wait_until("watcher evaluating", || p.watcher_provider.calls() == 1).await;
        gate.notify_one();

        wait_for_done(&p.manager, &parent, 1).await;
        let output = kinds(&p.manager.buffered_output(&parent, None).unwrap());
        let interrupted = output
            .iter()
            .position(|k| matches!(k, ChunkKind::Interrupted { .. }))
            .expect("parent was interrupted");
        assert_eq!(
            output[interrupted + 1..],
            [
                ChunkKind::WatcherInput {
                    content: format!(
                        "[WATCHER: reviewer | Authority: Supervisor | Session: {}] Stop, that is production.",
                        watcher
                    )
                },
                text("Stopping"),
                ChunkKind::Done,
            ]
        );
        assert_eq!(p.parent_provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_role_without_auto_inject_keeps_interjection() {
        let p = pair(
            vec![ScriptedTurn::new().text("Hi")],
            vec![ScriptedTurn::new().text(
                "[INTERJECT]\nurgent: false\ncontent: Say more.\n[/INTERJECT]",
            )],
        );
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(
                &parent,
                "reviewer",
                supervisor().with_auto_inject(false),
                Some("reviewer"),
            )
            .unwrap();

        p.manager.send_input(&parent, "Hello").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(p.parent_provider.calls(), 1);
        let output = kinds(&p.manager.buffered_output(&parent, None).unwrap());
        assert!(!output.iter().any(|k| matches!(k, ChunkKind::WatcherInput { .. })));
    }

    #[tokio::test]
    async fn test_inject_from_non_watcher_is_rejected() {
        let p = pair(vec![], vec![]);
        let parent = p.manager.create("main", ".", None).unwrap();
        assert!(p.manager.watcher_inject(&parent, "hello").is_err());
    }

    #[tokio::test]
    async fn test_destroying_parent_orphans_watcher() {
        let p = pair(vec![], vec![ScriptedTurn::new().text("still here")]);
        let parent = p.manager.create("main", ".", None).unwrap();
        let watcher = p
            .manager
            .create_watcher(&parent, "reviewer", supervisor(), Some("reviewer"))
            .unwrap();

        p.manager.destroy(&parent).await.unwrap();
        assert_eq!(p.manager.get_parent(&watcher).unwrap(), None);
        assert!(p.manager.watcher_inject(&watcher, "hello").is_err());

        p.manager.send_input(&watcher, "ping").unwrap();
        wait_for_done(&p.manager, &watcher, 1).await;
        assert!(kinds(&p.manager.buffered_output(&watcher, None).unwrap()).contains(&text("still here")));
    }
}
