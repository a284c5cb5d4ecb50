//! 会话编排集成测试：停止、冷却轮换、错误隔离、并行分发、多轮交流、路由

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;

    use chorus::agent::{AgentStatus, StreamEvent};
    use chorus::config::AppConfig;
    use chorus::core::{DispatchMode, SessionError};
    use chorus::llm::{LlmProfiles, Script, ScriptedLlm, Step};
    use chorus::memory::{InMemoryMessageStore, Message, MessageStore};
    use chorus::persona::{FilePersonaStore, InMemoryPersonaStore, Persona, PersonaStore, RosterDefaults};
    use chorus::runtime::{EventStream, RuntimeSession, SessionRouter, SessionServices, EXPLICIT_STOP_REASON};
    use chorus::scheduler::{ConstantRelevance, ParticipantPhase, TurnScheduler};
    use chorus::tools::{RegistryDispatcher, ToolRegistry};

    fn services_with(
        llm: Arc<ScriptedLlm>,
        personas: Arc<dyn PersonaStore>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> (SessionServices, Arc<InMemoryMessageStore>) {
        let mut cfg = AppConfig::default();
        tweak(&mut cfg);
        let store = Arc::new(InMemoryMessageStore::new());
        let dispatcher = RegistryDispatcher::new(ToolRegistry::new(), cfg.tools.tool_timeout());
        let scheduler =
            TurnScheduler::new(cfg.scheduler.clone()).with_relevance(Arc::new(ConstantRelevance(0.0)));
        let services = SessionServices::from_config(
            &cfg,
            personas,
            store.clone(),
            LlmProfiles::new(llm),
            Arc::new(dispatcher),
        )
        .with_scheduler(scheduler);
        (services, store)
    }

    fn services(
        llm: Arc<ScriptedLlm>,
        personas: Vec<Persona>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> (SessionServices, Arc<InMemoryMessageStore>) {
        services_with(llm, Arc::new(InMemoryPersonaStore::new(personas)), tweak)
    }

    async fn collect(stream: chorus::runtime::EventStream) -> Vec<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(5), stream.collect_all())
            .await
            .expect("event stream did not finish")
    }

    fn started(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::AgentStart { persona, .. } => Some(persona.clone()),
                _ => None,
            })
            .collect()
    }

    fn end_of<'a>(events: &'a [StreamEvent], who: &str) -> Option<(&'a str, &'a AgentStatus)> {
        events.iter().find_map(|e| match e {
            StreamEvent::AgentEnd {
                persona,
                content,
                status,
            } if persona == who => Some((content.as_str(), status)),
            _ => None,
        })
    }

    /// 读事件直到出现 `done` 认可的 chunk；返回已读事件
    async fn read_until(stream: &mut EventStream, mut done: impl FnMut(&StreamEvent) -> bool) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .expect("stream ended early");
            let stop = done(&ev);
            events.push(ev);
            if stop {
                return events;
            }
        }
    }

    fn chunk_persona(ev: &StreamEvent) -> Option<&str> {
        match ev {
            StreamEvent::AgentChunk { persona, .. } => Some(persona.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_stop_mid_stream_cancels_speaker_and_skips_rest() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push("a", vec![Step::text("A done")]);
        llm.push("b", vec![Step::text("B part"), Step::Pending]);
        llm.push("c", vec![Step::text("C never")]);
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
            Persona::new("c", "Cat").with_proactivity(0.7),
        ];
        let (services, store) = services(llm.clone(), personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let mut stream = handle.submit(Message::user("user", "hello all")).await.unwrap();
        let mut events = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .expect("stream ended before b spoke");
            let b_chunk = matches!(&ev, StreamEvent::AgentChunk { persona, .. } if persona == "b");
            events.push(ev);
            if b_chunk {
                break;
            }
        }
        assert!(handle.stop("user stop").await);
        events.extend(collect(stream).await);

        assert_eq!(started(&events), vec!["a", "b"]);
        assert_eq!(end_of(&events, "a"), Some(("A done", &AgentStatus::Completed)));
        assert_eq!(end_of(&events, "b"), Some(("B part", &AgentStatus::Cancelled)));
        assert!(events.iter().all(|e| e.persona() != Some("c")));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::SessionStopped {
                reason: "user stop".into()
            })
        );
        assert_eq!(llm.calls_for("c"), 0);

        let log = store.tail("room", -1).await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(!log[1].partial);
        assert_eq!(log[2].content, "B part");
        assert!(log[2].partial);
    }

    #[tokio::test]
    async fn test_sequential_speakers_see_earlier_replies() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push("a", vec![Step::text("A first")]);
        llm.push("b", vec![Step::text("B second")]);
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
        ];
        let (services, _store) = services(llm.clone(), personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "hi")).await.unwrap()).await;
        assert_eq!(started(&events), vec!["a", "b"]);

        let b_prompt = llm
            .prompts()
            .into_iter()
            .find(|p| p.persona == "b")
            .unwrap();
        assert!(b_prompt.turns.iter().any(|t| t.content == "a: A first"));
    }

    #[tokio::test]
    async fn test_each_completed_speaker_emits_one_start_and_end() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
        ];
        let (services, _store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "hi")).await.unwrap()).await;
        for who in ["a", "b"] {
            let mine: Vec<&StreamEvent> = events.iter().filter(|e| e.persona() == Some(who)).collect();
            assert!(matches!(mine.first(), Some(StreamEvent::AgentStart { .. })));
            assert!(matches!(
                mine.last(),
                Some(StreamEvent::AgentEnd { status: AgentStatus::Completed, .. })
            ));
            let starts = mine
                .iter()
                .filter(|e| matches!(e, StreamEvent::AgentStart { .. }))
                .count();
            let ends = mine
                .iter()
                .filter(|e| matches!(e, StreamEvent::AgentEnd { .. }))
                .count();
            assert_eq!((starts, ends), (1, 1));
        }
    }

    #[tokio::test]
    async fn test_failed_speaker_does_not_abort_turn() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_script("a", Script::Reject("rate limited".into()));
        llm.push("b", vec![Step::text("still here")]);
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
        ];
        let (services, store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "hi")).await.unwrap()).await;
        assert!(matches!(end_of(&events, "a"), Some(("", AgentStatus::Errored { .. }))));
        assert_eq!(end_of(&events, "b"), Some(("still here", &AgentStatus::Completed)));
        // the failed speaker left nothing in the log
        let log = store.tail("room", -1).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].speaker, "b");
    }

    #[tokio::test]
    async fn test_cooldown_rotates_speakers() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9).with_max_agents(1),
            Persona::new("b", "Ben").with_proactivity(0.5).with_max_agents(1),
        ];
        let (services, _store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let mut order = Vec::new();
        for text in ["one", "two", "three"] {
            let events = collect(handle.submit(Message::user("user", text)).await.unwrap()).await;
            order.extend(started(&events));
        }
        assert_eq!(order, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_mention_overrides_cooldown() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9).with_max_agents(1),
            Persona::new("b", "Ben").with_proactivity(0.5).with_max_agents(1),
        ];
        let (services, _store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let first = collect(handle.submit(Message::user("user", "one")).await.unwrap()).await;
        assert_eq!(started(&first), vec!["a"]);
        let second = collect(handle.submit(Message::user("user", "@a again please")).await.unwrap()).await;
        assert_eq!(started(&second), vec!["a"]);
    }

    #[tokio::test]
    async fn test_misconfigured_persona_is_skipped() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("broken", "Broken").with_proactivity(2.0),
        ];
        let (services, _store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "@broken hi")).await.unwrap()).await;
        assert_eq!(started(&events), vec!["a"]);
    }

    #[tokio::test]
    async fn test_structurally_invalid_roster_refuses_to_start() {
        let llm = Arc::new(ScriptedLlm::new());
        let (empty, _) = services(llm.clone(), vec![], |_| {});
        assert!(matches!(
            RuntimeSession::start("room", empty).await,
            Err(SessionError::InvalidConfig(_))
        ));

        let dupes = vec![Persona::new("a", "Ann"), Persona::new("A", "Other Ann")];
        let (dupes, _) = services(llm, dupes, |_| {});
        let router = SessionRouter::new(dupes);
        assert!(matches!(
            router.submit("room", Message::user("user", "hi")).await,
            Err(SessionError::InvalidConfig(_))
        ));
        assert_eq!(router.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_parallel_dispatch_keeps_per_speaker_order() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(
            "a",
            vec![Step::text("a1 "), Step::Delay(Duration::from_millis(20)), Step::text("a2")],
        );
        llm.push("b", vec![Step::text("b1 "), Step::text("b2")]);
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
        ];
        let (services, store) = services(llm, personas, |cfg| {
            cfg.session.dispatch_mode = DispatchMode::Parallel;
            cfg.session.parallelism = 2;
        });
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "go")).await.unwrap()).await;
        for (who, expected) in [("a", vec!["a1 ", "a2"]), ("b", vec!["b1 ", "b2"])] {
            let chunks: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::AgentChunk { persona, text } if persona == who => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(chunks, expected);
            assert!(matches!(end_of(&events, who), Some((_, AgentStatus::Completed))));
        }
        assert_eq!(store.len("room").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_parallel_speakers_respect_permit_limit() {
        let llm = Arc::new(ScriptedLlm::new());
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
            Persona::new("c", "Cat").with_proactivity(0.7),
        ];
        for p in &personas {
            llm.push(
                &p.handle,
                vec![Step::text("x"), Step::Delay(Duration::from_millis(40)), Step::text("y")],
            );
        }
        let (services, _store) = services(llm, personas, |cfg| {
            cfg.session.dispatch_mode = DispatchMode::Parallel;
            cfg.session.parallelism = 2;
        });
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "go")).await.unwrap()).await;
        let (mut live, mut peak) = (0usize, 0usize);
        for ev in &events {
            match ev {
                StreamEvent::AgentStart { .. } => {
                    live += 1;
                    peak = peak.max(live);
                }
                StreamEvent::AgentEnd { .. } => live -= 1,
                _ => {}
            }
        }
        assert_eq!(peak, 2);
        for who in ["a", "b", "c"] {
            assert_eq!(end_of(&events, who), Some(("xy", &AgentStatus::Completed)));
        }
    }

    #[tokio::test]
    async fn test_parallel_stop_cancels_running_and_skips_waiting() {
        let llm = Arc::new(ScriptedLlm::new());
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
            Persona::new("c", "Cat").with_proactivity(0.7),
        ];
        for p in &personas {
            llm.push(&p.handle, vec![Step::text("part"), Step::Pending]);
        }
        let (services, store) = services(llm.clone(), personas, |cfg| {
            cfg.session.dispatch_mode = DispatchMode::Parallel;
            cfg.session.parallelism = 1;
        });
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let mut stream = handle.submit(Message::user("user", "go")).await.unwrap();
        let mut events = read_until(&mut stream, |ev| chunk_persona(ev).is_some()).await;
        let speaker = events
            .iter()
            .find_map(chunk_persona)
            .map(str::to_string)
            .unwrap();
        assert!(handle.stop("user stop").await);
        events.extend(collect(stream).await);

        assert_eq!(started(&events), vec![speaker.clone()]);
        assert_eq!(end_of(&events, &speaker), Some(("part", &AgentStatus::Cancelled)));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::SessionStopped {
                reason: "user stop".into()
            })
        );
        for who in ["a", "b", "c"].into_iter().filter(|w| *w != speaker) {
            assert_eq!(llm.calls_for(who), 0);
        }
        let log = store.tail("room", -1).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].partial);
    }

    #[tokio::test]
    async fn test_parallel_speaker_marked_speaking_once_started() {
        let llm = Arc::new(ScriptedLlm::new());
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9),
            Persona::new("b", "Ben").with_proactivity(0.8),
            Persona::new("c", "Cat").with_proactivity(0.7),
        ];
        for p in &personas {
            llm.push(&p.handle, vec![Step::text("part"), Step::Pending]);
        }
        let (services, _store) = services(llm, personas, |cfg| {
            cfg.session.dispatch_mode = DispatchMode::Parallel;
            cfg.session.parallelism = 2;
        });
        let handle = RuntimeSession::start("room", services).await.unwrap();
        let mut view = handle.watch_participants();

        let mut stream = handle.submit(Message::user("user", "go")).await.unwrap();
        let mut chunked = Vec::new();
        let mut events = read_until(&mut stream, |ev| {
            if let Some(who) = chunk_persona(ev) {
                chunked.push(who.to_string());
            }
            chunked.len() == 2
        })
        .await;

        let snapshot = tokio::time::timeout(
            Duration::from_secs(2),
            view.wait_for(|ps| ps.iter().filter(|p| p.phase() == ParticipantPhase::Speaking).count() == 2),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        for p in &snapshot {
            let expected = if chunked.contains(&p.handle) {
                ParticipantPhase::Speaking
            } else {
                ParticipantPhase::Selected
            };
            assert_eq!(p.phase(), expected, "{}", p.handle);
        }

        assert!(handle.stop("user stop").await);
        events.extend(collect(stream).await);
        assert_eq!(started(&events).len(), 2);
        for p in handle.participants() {
            let expected = if chunked.contains(&p.handle) {
                ParticipantPhase::Cooldown
            } else {
                ParticipantPhase::Idle
            };
            assert_eq!(p.phase(), expected, "{}", p.handle);
        }
    }

    #[tokio::test]
    async fn test_stop_command_while_streaming_stops_session() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push("a", vec![Step::text("part"), Step::Pending]);
        llm.push("b", vec![Step::text("later")]);
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9).with_max_agents(1),
            Persona::new("b", "Ben").with_proactivity(0.5).with_max_agents(1),
        ];
        let (services, store) = services(llm, personas, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let mut stream = handle.submit(Message::user("user", "hi")).await.unwrap();
        let mut events = read_until(&mut stream, |ev| chunk_persona(ev) == Some("a")).await;

        let ack = handle.submit(Message::user("user", "停止对话！")).await.unwrap();
        assert!(collect(ack).await.is_empty());
        events.extend(collect(stream).await);
        assert_eq!(end_of(&events, "a"), Some(("part", &AgentStatus::Cancelled)));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::SessionStopped {
                reason: EXPLICIT_STOP_REASON.into()
            })
        );
        let log = store.tail("room", -1).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|m| m.content != "停止对话！"));

        // nothing running: the same words are an ordinary message
        let next = collect(handle.submit(Message::user("user", "stop")).await.unwrap()).await;
        assert_eq!(started(&next), vec!["b"]);
        let log = store.tail("room", -1).await.unwrap();
        assert_eq!(log[2].content, "stop");
    }

    #[tokio::test]
    async fn test_follow_up_exchange_until_limit() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9).with_max_agents(1),
            Persona::new("b", "Ben").with_proactivity(0.5).with_max_agents(1),
        ];
        let (services, store) = services(llm, personas, |cfg| cfg.session.max_exchanges = 2);
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let events = collect(handle.submit(Message::user("user", "start")).await.unwrap()).await;
        assert_eq!(started(&events), vec!["a", "b"]);
        assert_eq!(store.len("room").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_queued_user_message_ends_exchange_early() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let personas = vec![
            Persona::new("a", "Ann").with_proactivity(0.9).with_max_agents(1),
            Persona::new("b", "Ben").with_proactivity(0.5).with_max_agents(1),
        ];
        let (services, _store) = services(llm, personas, |cfg| cfg.session.max_exchanges = 3);
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let first = handle.submit(Message::user("user", "one")).await.unwrap();
        let second = handle.submit(Message::user("user", "two")).await.unwrap();
        assert_eq!(started(&collect(first).await), vec!["a"]);
        assert_eq!(started(&collect(second).await), vec!["b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_stop_while_idle_notifies_observers() {
        let llm = Arc::new(ScriptedLlm::new());
        let (services, _store) = services(llm, vec![Persona::new("a", "Ann")], |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();
        let mut observer = handle.subscribe();

        assert!(!handle.stop("nothing running").await);
        let ev = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            StreamEvent::SessionStopped {
                reason: "nothing running".into()
            }
        );
    }

    #[tokio::test]
    async fn test_roster_file_edits_apply_next_turn() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[personas]]
handle = "a"
name = "Ann"
proactivity = 0.9
"#
        )
        .unwrap();
        file.flush().unwrap();

        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        let store = Arc::new(FilePersonaStore::new(file.path(), RosterDefaults::default()));
        let (services, _log) = services_with(llm, store, |_| {});
        let handle = RuntimeSession::start("room", services).await.unwrap();

        let first = collect(handle.submit(Message::user("user", "hi")).await.unwrap()).await;
        assert_eq!(started(&first), vec!["a"]);

        std::fs::write(
            file.path(),
            r#"
[[personas]]
handle = "z"
name = "Zed"
proactivity = 0.9
"#,
        )
        .unwrap();
        let second = collect(handle.submit(Message::user("user", "hi again")).await.unwrap()).await;
        assert_eq!(started(&second), vec!["z"]);
    }

    #[tokio::test]
    async fn test_router_keeps_sessions_apart() {
        let llm = Arc::new(ScriptedLlm::new().with_fallback("ok"));
        // no cooldown: with the default penalty a cooling lone persona stays silent
        // even after the cold-room retry halves it
        let personas = vec![Persona::new("a", "Ann").with_proactivity(0.9).with_cooldown(0)];
        let (services, store) = services(llm, personas, |cfg| cfg.session.idle_session_secs = 0);
        let router = SessionRouter::new(services);

        collect(router.submit("one", Message::user("u1", "hi")).await.unwrap()).await;
        collect(router.submit("two", Message::user("u2", "hey")).await.unwrap()).await;
        collect(router.submit("one", Message::user("u1", "again")).await.unwrap()).await;

        assert_eq!(router.active_count().await, 2);
        assert_eq!(store.len("one").await.unwrap(), 4);
        assert_eq!(store.len("two").await.unwrap(), 2);

        let a = router.get_or_start("one").await.unwrap();
        let b = router.get_or_start("one").await.unwrap();
        assert_eq!(a.session_id(), b.session_id());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.reap_idle().await, 2);
        assert_eq!(router.active_count().await, 0);
    }
}
