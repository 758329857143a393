//! End-to-end routing scenarios on a single world.

use std::sync::Arc;

use agent_world::testing::{settle, EventRecorder, Reply, ScriptedProvider};
use agent_world::{
    Agent, AgentStatus, LlmMessage, ModelConfig, Role, StreamKind, Usage, World,
    WorldSettings,
};

fn world(provider: &Arc<ScriptedProvider>, settings: WorldSettings) -> World {
    World::new("Scenario", settings, provider.clone()).unwrap()
}

fn add(world: &World, name: &str, model: &str) {
    world
        .add_agent(Agent::new(name, ModelConfig::new("test", model)).unwrap())
        .unwrap();
}

fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

#[tokio::test]
async fn human_message_reaches_every_agent_once() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-alice", text("on it"))
            .reply("m-bob", text("me too")),
    );
    let world = world(&provider, WorldSettings::default());
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");

    let id = world.publish("Good morning, team", "human");
    settle(&world).await;

    for agent in ["alice", "bob"] {
        let memory = world.memory(agent).unwrap();
        let copies = memory.iter().filter(|m| m.id == id).count();
        assert_eq!(copies, 1, "{} should hold the human message once", agent);
    }
    // Both replied to the human; neither answered the other's chatter.
    assert_eq!(provider.call_count("m-alice"), 1);
    assert_eq!(provider.call_count("m-bob"), 1);
}

#[tokio::test]
async fn agents_never_record_their_own_messages_as_inbound() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-alice", text("@bob what do you think?"))
            .reply("m-bob", text("Looks fine.")),
    );
    let world = world(&provider, WorldSettings::default());
    // One call each: bob's answer to alice is throttled instead of chaining.
    world.set_turn_limit(1).unwrap();
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");

    world.publish("@alice review this", "human");
    settle(&world).await;

    for agent in ["alice", "bob"] {
        let memory = world.memory(agent).unwrap();
        assert!(memory
            .iter()
            .filter(|m| m.role == Role::User)
            .all(|m| m.sender != agent));
    }

    let alice = world.memory("alice").unwrap();
    assert_eq!(alice.len(), 3);
    assert_eq!(alice[1].role, Role::Assistant);
    assert_eq!(alice[2].content, "@alice Looks fine.");
}

#[tokio::test]
async fn backlog_beyond_bus_capacity_is_not_lost() {
    let provider = Arc::new(ScriptedProvider::new());
    let settings = WorldSettings {
        bus_capacity: 8,
        ..WorldSettings::default()
    };
    let world = world(&provider, settings);
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");

    // Published back to back, far more than an observer queue holds.
    for i in 0..200 {
        world.publish(format!("@nobody note {}", i), "human");
    }
    settle(&world).await;

    for agent in ["alice", "bob"] {
        let memory = world.memory(agent).unwrap();
        assert_eq!(memory.len(), 200, "{} lost messages", agent);
        assert_eq!(memory[0].content, "@nobody note 0");
        assert_eq!(memory[199].content, "@nobody note 199");
    }
    assert_eq!(provider.calls().len(), 0);
}

#[tokio::test]
async fn only_leading_mentions_trigger_responses() {
    let provider = Arc::new(ScriptedProvider::new().reply("m-bob", text("hi")));
    let world = world(&provider, WorldSettings::default());
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");

    // A mid-line mention addresses nobody; from an agent it is plain chatter.
    world.publish("Hello @bob, how are you", "alice");
    settle(&world).await;
    assert_eq!(provider.call_count("m-bob"), 0);

    world.publish("@bob hello", "human");
    settle(&world).await;
    assert_eq!(provider.call_count("m-bob"), 1);

    world.publish("Quick note.\n@bob hello again", "human");
    settle(&world).await;
    assert_eq!(provider.call_count("m-bob"), 2);

    // Alice was never addressed and has no script.
    assert_eq!(provider.call_count("m-alice"), 0);
}

#[tokio::test]
async fn human_message_without_mentions_addresses_everyone() {
    let provider = Arc::new(ScriptedProvider::new().default_reply(text("ack")));
    let world = world(&provider, WorldSettings::default());
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");
    add(&world, "carol", "m-carol");

    world.publish("Hello @bob, how are you", "human");
    settle(&world).await;

    assert_eq!(provider.calls().len(), 3);
}

#[tokio::test]
async fn agent_chain_stops_at_turn_limit_with_one_notice() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-a", text("@b ping"))
            .reply("m-b", text("pong")),
    );
    let world = world(&provider, WorldSettings::default());
    world.set_turn_limit(3).unwrap();
    add(&world, "a", "m-a");
    add(&world, "b", "m-b");
    let mut recorder = EventRecorder::new(&world);

    world.publish("@a start", "human");
    settle(&world).await;
    recorder.drain();

    assert_eq!(provider.call_count("m-a"), 3);
    assert_eq!(provider.call_count("m-b"), 3);
    assert_eq!(world.agent("a").unwrap().llm_call_count, 3);
    assert_eq!(world.agent("b").unwrap().llm_call_count, 3);

    // The notice is a message from the throttled agent, addressed to the human.
    let notices = limit_notices(&recorder, "a");
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("turn limit"));
    assert!(limit_notices(&recorder, "b").is_empty());
    for agent in ["a", "b"] {
        assert_eq!(world.agent(agent).unwrap().status, AgentStatus::Active);
    }
    // b heard it; nobody answered it.
    let b_memory = world.memory("b").unwrap();
    assert!(b_memory.last().unwrap().content.starts_with("@human a reached"));

    // Replies to another agent are addressed to it.
    let from_b = recorder.messages_from("b");
    assert_eq!(from_b.len(), 3);
    assert!(from_b.iter().all(|m| m.content == "@a pong"));

    // A human message resets both budgets and a fresh chain can run.
    world.publish("@a again", "human");
    settle(&world).await;
    recorder.drain();

    assert_eq!(provider.call_count("m-a"), 6);
    assert_eq!(provider.call_count("m-b"), 6);
    assert_eq!(limit_notices(&recorder, "a").len(), 2);
}

fn limit_notices(recorder: &EventRecorder, agent: &str) -> Vec<String> {
    recorder
        .messages_from(agent)
        .into_iter()
        .filter(|m| m.content.starts_with("@human") && m.content.contains("turn limit"))
        .map(|m| m.content.clone())
        .collect()
}

#[tokio::test]
async fn system_message_resets_turn_budget() {
    let provider = Arc::new(ScriptedProvider::new().reply("m-a", text("done")));
    let world = world(&provider, WorldSettings::default());
    world.set_turn_limit(1).unwrap();
    add(&world, "a", "m-a");
    add(&world, "b", "m-b");

    world.publish("@a go", "human");
    settle(&world).await;
    assert_eq!(world.agent("a").unwrap().llm_call_count, 1);

    // Throttled: another agent asks, a stays silent.
    world.publish("@a once more", "b");
    settle(&world).await;
    assert_eq!(provider.call_count("m-a"), 1);

    world.publish("@a go", "system");
    settle(&world).await;
    assert_eq!(provider.call_count("m-a"), 2);
    assert_eq!(world.agent("a").unwrap().llm_call_count, 1);
}

#[tokio::test]
async fn addressed_agent_answers_while_observer_stays_silent() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-alice", text("Here is the summary."))
            .reply("m-bob", text("unused")),
    );
    let world = world(&provider, WorldSettings::default());
    world.set_turn_limit(2).unwrap();
    add(&world, "alice", "m-alice");
    add(&world, "bob", "m-bob");
    let mut recorder = EventRecorder::new(&world);

    world.publish("@alice summarize", "human");
    settle(&world).await;
    recorder.drain();

    let bob = world.agent("bob").unwrap();
    assert_eq!(bob.memory.len(), 2);
    assert_eq!(bob.llm_call_count, 0);
    assert_eq!(provider.call_count("m-bob"), 0);

    let alice = world.agent("alice").unwrap();
    assert_eq!(alice.llm_call_count, 1);

    // Reply to a human carries no automatic prefix.
    let replies = recorder.messages_from("alice");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].content, "Here is the summary.");
}

#[tokio::test]
async fn failed_model_call_is_isolated() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-a", Reply::Fail("rate limited".into()))
            .reply("m-b", text("still here")),
    );
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    add(&world, "b", "m-b");
    let mut recorder = EventRecorder::new(&world);

    world.publish("status?", "human");
    settle(&world).await;
    recorder.drain();

    let a = world.agent("a").unwrap();
    assert_eq!(a.status, AgentStatus::Error);
    assert_eq!(a.llm_call_count, 0);
    assert_eq!(a.memory.len(), 2, "human message plus b's reply");
    assert!(a.memory.iter().all(|m| m.role == Role::User));

    let errors: Vec<_> = recorder
        .stream_events()
        .into_iter()
        .filter(|e| e.agent_id == "a")
        .filter(|e| matches!(e.kind, StreamKind::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(recorder.messages_from("a").is_empty());

    let b = world.agent("b").unwrap();
    assert_eq!(b.status, AgentStatus::Active);
    assert_eq!(b.llm_call_count, 1);

    // The next successful call clears the error status.
    provider.set_reply("m-a", text("recovered"));
    world.publish("@a try again", "human");
    settle(&world).await;
    assert_eq!(world.agent("a").unwrap().status, AgentStatus::Active);
}

#[tokio::test]
async fn failure_mid_stream_leaves_memory_untouched() {
    let provider = Arc::new(ScriptedProvider::new().reply(
        "m-a",
        Reply::FailMidStream {
            chunks: vec!["Partial".into()],
            error: "connection reset".into(),
        },
    ));
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    let mut recorder = EventRecorder::new(&world);

    world.publish("@a explain", "human");
    settle(&world).await;
    recorder.drain();

    let kinds: Vec<_> = recorder
        .stream_events()
        .into_iter()
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(kinds[0], StreamKind::Start);
    assert_eq!(kinds[1], StreamKind::Chunk { content: "Partial".into() });
    assert!(matches!(kinds[2], StreamKind::Error { .. }));
    assert_eq!(kinds.len(), 3);

    assert_eq!(world.memory("a").unwrap().len(), 1);
    assert_eq!(world.agent("a").unwrap().llm_call_count, 0);
}

#[tokio::test]
async fn counting_failed_calls_is_a_policy() {
    let provider = Arc::new(ScriptedProvider::new().reply("m-a", Reply::Fail("boom".into())));
    let settings = WorldSettings {
        count_failed_calls: true,
        ..WorldSettings::default()
    };
    let world = world(&provider, settings);
    add(&world, "a", "m-a");

    world.publish("hello", "human");
    settle(&world).await;
    assert_eq!(world.agent("a").unwrap().llm_call_count, 1);
}

#[tokio::test]
async fn stream_events_are_ordered_and_correlated() {
    let provider = Arc::new(ScriptedProvider::new().reply(
        "m-a",
        Reply::Chunks {
            chunks: vec!["Hel".into(), "".into(), "lo".into()],
            usage: Some(Usage::new(12, 2)),
        },
    ));
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    let mut recorder = EventRecorder::new(&world);

    world.publish("hi", "human");
    settle(&world).await;
    recorder.drain();

    let reply = recorder.messages_from("a")[0].clone();
    assert_eq!(reply.content, "Hello");

    let events = recorder.stream_events();
    assert!(events.iter().all(|e| e.message_id == reply.id));
    assert!(events.iter().all(|e| e.world_id == world.id()));

    let kinds: Vec<_> = events.iter().map(|e| e.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            StreamKind::Start,
            StreamKind::Chunk { content: "Hel".into() },
            StreamKind::Chunk { content: "lo".into() },
            StreamKind::End {
                content: "Hello".into(),
                usage: Usage::new(12, 2),
            },
        ]
    );

    // The remembered reply shares the published id.
    let memory = world.memory("a").unwrap();
    assert_eq!(memory[1].id, reply.id);
}

#[tokio::test]
async fn usage_is_estimated_when_provider_reports_none() {
    let provider = Arc::new(ScriptedProvider::new().reply("m-a", text("abcde")));
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    let mut recorder = EventRecorder::new(&world);

    // Prompt is "human: hey" (10 chars).
    world.publish("hey", "human");
    settle(&world).await;
    recorder.drain();

    let end = recorder
        .stream_events()
        .into_iter()
        .find_map(|e| match &e.kind {
            StreamKind::End { usage, .. } => Some(*usage),
            _ => None,
        })
        .unwrap();
    assert_eq!(end, Usage::new(3, 2));
}

#[tokio::test]
async fn pass_token_hands_control_back() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("m-a", text("@b your turn"))
            .reply("m-b", text("<world>pass</world>")),
    );
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    add(&world, "b", "m-b");
    let mut recorder = EventRecorder::new(&world);

    world.publish("@a begin", "human");
    settle(&world).await;
    recorder.drain();

    let from_b = recorder.messages_from("b");
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].content, "@human b is passing control back to you.");
    // Nobody answers the hand-back.
    assert_eq!(provider.call_count("m-a"), 1);

    let b_memory = world.memory("b").unwrap();
    assert_eq!(b_memory.last().unwrap().content, "<world>pass</world>");
}

#[tokio::test]
async fn prompt_uses_memory_window_and_system_prompt() {
    let provider = Arc::new(ScriptedProvider::new().reply("m-a", text("ok")));
    let settings = WorldSettings {
        memory_window: 3,
        ..WorldSettings::default()
    };
    let world = world(&provider, settings);
    world
        .add_agent(
            Agent::new(
                "a",
                ModelConfig::new("test", "m-a").with_system_prompt("You are terse."),
            )
            .unwrap(),
        )
        .unwrap();

    for i in 0..3 {
        world.publish(format!("message {}", i), "human");
        settle(&world).await;
    }

    // Memory: m0, ok, m1, ok, m2 when the third call is made.
    let prompt = provider.last_prompt("m-a").unwrap();
    assert_eq!(
        prompt,
        vec![
            LlmMessage::system("You are terse."),
            LlmMessage::user("human: message 1"),
            LlmMessage::assistant("ok"),
            LlmMessage::user("human: message 2"),
        ]
    );
}

#[tokio::test]
async fn inactive_agent_listens_but_never_answers() {
    let provider = Arc::new(ScriptedProvider::new().default_reply(text("hi")));
    let world = world(&provider, WorldSettings::default());
    add(&world, "a", "m-a");
    world.set_agent_status("a", AgentStatus::Inactive).unwrap();

    world.publish("@a are you there?", "human");
    settle(&world).await;

    assert_eq!(provider.calls().len(), 0);
    assert_eq!(world.memory("a").unwrap().len(), 1);
}

#[tokio::test]
async fn worlds_do_not_share_traffic() {
    let provider = Arc::new(ScriptedProvider::new().default_reply(text("hi")));
    let first = World::new("First", WorldSettings::default(), provider.clone()).unwrap();
    let second = World::new("Second", WorldSettings::default(), provider.clone()).unwrap();
    add(&first, "a", "m-first");
    add(&second, "a", "m-second");
    let mut recorder = EventRecorder::new(&second);

    first.publish("hello first", "human");
    settle(&first).await;
    settle(&second).await;
    recorder.drain();

    assert_eq!(first.memory("a").unwrap().len(), 2);
    assert!(second.memory("a").unwrap().is_empty());
    assert!(recorder.messages().is_empty());
    assert!(recorder.events().is_empty());
    assert_eq!(provider.call_count("m-second"), 0);
}

#[tokio::test]
async fn unsubscribed_handler_stops_receiving() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let provider = Arc::new(ScriptedProvider::new());
    let world = world(&provider, WorldSettings::default());
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let subscription = world.subscribe_messages(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    world.publish("one", "human");

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    subscription.unsubscribe();
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while world.bus().message_subscriber_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    world.publish("two", "human");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
