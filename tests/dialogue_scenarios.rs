//! End-to-end dialogue scenarios: the controller driven over a real bus
//! with a scripted token generator standing in for the LLM.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use remdis::bus::{MessageBus, Subscription, topics};
use remdis::config::SystemConfig;
use remdis::dialogue::controller::{DialogueController, DialogueEvent, DialogueState};
use remdis::error::Result;
use remdis::iu::{IncrementalUnit, IuPayload, UpdateType};
use remdis::llm::{GenerationRequest, ResponseGenerator};
use remdis::module::{IncrementalModule, ModuleContext, TopicIu};
use remdis::prompts::PromptSet;

/// One canned LLM response.
#[derive(Clone)]
struct Script {
    first_delay: Duration,
    token_delay: Duration,
    tokens: Vec<&'static str>,
    /// Fail with this message after all tokens were sent.
    fail_after: Option<&'static str>,
}

impl Script {
    fn instant(tokens: Vec<&'static str>) -> Self {
        Self {
            first_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            tokens,
            fail_after: None,
        }
    }

    fn slow(tokens: Vec<&'static str>, token_delay: Duration) -> Self {
        Self {
            first_delay: Duration::ZERO,
            token_delay,
            tokens,
            fail_after: None,
        }
    }
}

/// Replays scripted responses in order; falls back to a one-chunk default
/// once the queue is empty.
struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest, tx: mpsc::Sender<String>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Script::instant(vec!["Okay."]));

        tokio::select! {
            () = request.cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(script.first_delay) => {}
        }
        for token in &script.tokens {
            if request.cancel.is_cancelled() {
                return Ok(());
            }
            if tx.send((*token).to_owned()).await.is_err() {
                return Ok(());
            }
            tokio::select! {
                () = request.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(script.token_delay) => {}
            }
        }
        match script.fail_after {
            Some(msg) => Err(remdis::RemdisError::LlmFailed(msg.to_owned())),
            None => Ok(()),
        }
    }
}

/// Drives the controller by hand: bus input via `deliver`, internal events
/// pumped from the receiver the spawned generation tasks write to.
struct Driver {
    controller: DialogueController,
    ctx: ModuleContext<DialogueEvent>,
    events: mpsc::UnboundedReceiver<DialogueEvent>,
    text_sub: Subscription,
    state_sub: Subscription,
    /// Last partial on the current ASR hypothesis chain.
    asr_last: Option<IncrementalUnit>,
}

impl Driver {
    async fn start(config: SystemConfig, generator: Arc<dyn ResponseGenerator>) -> Self {
        let bus = MessageBus::new(&config.bus);
        let (event_tx, events) = mpsc::unbounded_channel();
        let ctx = ModuleContext::new(bus.clone(), event_tx, CancellationToken::new());
        let text_sub = bus.subscribe(topics::DIALOGUE_TEXT);
        let state_sub = bus.subscribe(topics::SYSTEM_STATE);
        let mut controller = DialogueController::new(config, PromptSet::default(), generator);
        controller.on_start(&ctx).await.expect("on_start");
        Self {
            controller,
            ctx,
            events,
            text_sub,
            state_sub,
            asr_last: None,
        }
    }

    async fn deliver(&mut self, topic: &'static str, iu: IncrementalUnit) {
        self.controller
            .on_iu(TopicIu { topic, iu }, &self.ctx)
            .await
            .expect("on_iu");
    }

    async fn asr_partial(&mut self, text: &str, stability: f32) {
        let payload = IuPayload::AsrToken {
            text: text.to_owned(),
            stability,
        };
        let iu = match &self.asr_last {
            None => IncrementalUnit::new_add("asr", payload),
            Some(prev) => IncrementalUnit::new_revision(prev, payload),
        };
        self.asr_last = Some(iu.clone());
        self.deliver(topics::ASR_PARTIAL, iu).await;
    }

    async fn asr_commit(&mut self, text: &str) {
        self.asr_last = None;
        let iu = IncrementalUnit::new_add(
            "asr",
            IuPayload::AsrCommit {
                text: text.to_owned(),
            },
        );
        self.deliver(topics::ASR_COMMIT, iu).await;
    }

    async fn vap(&mut self, probability: f32) {
        let iu = IncrementalUnit::new_add("vap", IuPayload::Vap { probability });
        self.deliver(topics::VAP_PROB, iu).await;
    }

    async fn intent(&mut self) {
        let iu = IncrementalUnit::new_add("intention", IuPayload::Intent { silence_secs: 5.0 });
        self.deliver(topics::INTENT_TIMEOUT, iu).await;
    }

    /// Simulate the TTS adapter finishing the current utterance.
    async fn tts_finished(&mut self) {
        let add = IncrementalUnit::new_add(
            "tts",
            IuPayload::TtsAudio {
                samples: vec![0.0; 8],
                sample_rate: 24_000,
            },
        );
        let commit = IncrementalUnit::new_commit(&add);
        self.deliver(topics::TTS_AUDIO, add).await;
        self.deliver(topics::TTS_AUDIO, commit).await;
    }

    /// Process internal events (tokens, completions) for `dur`.
    async fn pump(&mut self, dur: Duration) {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    self.controller
                        .on_event(event, &self.ctx)
                        .await
                        .expect("on_event");
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn drain_text(&mut self) -> Vec<IncrementalUnit> {
        let mut out = Vec::new();
        while let Some(iu) = self.text_sub.try_recv() {
            out.push(iu);
        }
        out
    }

    fn drain_states(&mut self) -> Vec<IncrementalUnit> {
        let mut out = Vec::new();
        while let Some(iu) = self.state_sub.try_recv() {
            out.push(iu);
        }
        out
    }

    /// Pump until at least `n` TEXT ADDs were observed; panics after `max`.
    async fn pump_until_text_adds(&mut self, n: usize, max: Duration) -> Vec<IncrementalUnit> {
        let deadline = tokio::time::Instant::now() + max;
        let mut seen = Vec::new();
        loop {
            self.pump(Duration::from_millis(20)).await;
            seen.extend(self.drain_text());
            let adds = seen
                .iter()
                .filter(|iu| iu.update_type == UpdateType::Add)
                .count();
            if adds >= n {
                return seen;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} TEXT adds, saw {adds}: {seen:?}"
            );
        }
    }
}

fn test_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.bus.buff_size = 64;
    config.dialogue.response_generation_timeout_secs = 1.0;
    config
}

fn action_of(iu: &IncrementalUnit) -> &str {
    match &iu.payload {
        IuPayload::SystemState { action, .. } => action,
        other => panic!("expected SYSTEM_STATE, got {other:?}"),
    }
}

#[tokio::test]
async fn simple_turn_produces_committed_response() {
    let generator = ScriptedGenerator::new(vec![Script::instant(vec![
        "Why did the scarecrow win an award?",
        " Because he was outstanding in his field.",
    ])]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("tell me a joke", 0.9).await;
    driver.asr_commit("tell me a joke").await;
    driver.pump(Duration::from_millis(300)).await;

    let text = driver.drain_text();
    let adds: Vec<_> = text
        .iter()
        .filter(|iu| iu.update_type == UpdateType::Add)
        .collect();
    assert!(!adds.is_empty(), "at least one TEXT add: {text:?}");
    assert_eq!(
        text.last().expect("units").update_type,
        UpdateType::Commit,
        "the chain ends with a COMMIT"
    );

    // One user entry plus one system entry.
    assert_eq!(driver.controller.history().len(), 2);
    assert_eq!(driver.controller.state(), DialogueState::Speaking);

    driver.tts_finished().await;
    assert_eq!(driver.controller.state(), DialogueState::Idle);
}

#[tokio::test]
async fn barge_in_revokes_the_text_chain() {
    let generator = ScriptedGenerator::new(vec![Script::slow(
        vec![
            "One.", " Two.", " Three.", " Four.", " Five.", " Six.", " Seven.", " Eight.",
        ],
        Duration::from_millis(30),
    )]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("what are the numbers", 0.9).await;
    driver.asr_commit("what are the numbers").await;

    let seen = driver.pump_until_text_adds(3, Duration::from_secs(3)).await;
    assert_eq!(driver.controller.state(), DialogueState::Speaking);
    assert!(seen.iter().all(|iu| iu.update_type == UpdateType::Add));

    // User interrupts with stable speech.
    driver.asr_partial("wait stop", 0.8).await;
    assert_eq!(driver.controller.state(), DialogueState::Listening);

    driver.pump(Duration::from_millis(200)).await;
    let after = driver.drain_text();
    let revokes: Vec<_> = after
        .iter()
        .filter(|iu| iu.update_type == UpdateType::Revoke)
        .collect();
    assert_eq!(revokes.len(), 1, "exactly one REVOKE: {after:?}");

    // No further ADDs on the revoked chain: everything published earlier
    // links back to the head; nothing after the revoke may.
    let revoke_pos = after
        .iter()
        .position(|iu| iu.update_type == UpdateType::Revoke)
        .expect("revoke present");
    for iu in &after[revoke_pos + 1..] {
        assert_ne!(iu.update_type, UpdateType::Add, "chain kept growing: {after:?}");
    }

    // The interrupted response was recorded as an interrupted system turn.
    let interrupted = driver
        .controller
        .history()
        .turns()
        .filter(|t| t.interrupted)
        .count();
    assert_eq!(interrupted, 1);
}

#[tokio::test]
async fn silence_timeout_prompts_once() {
    let generator = ScriptedGenerator::new(vec![Script::instant(vec!["Still there?"])]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.intent().await;
    assert_eq!(driver.controller.state(), DialogueState::TimeoutPrompt);
    driver.pump(Duration::from_millis(300)).await;

    let text = driver.drain_text();
    assert!(
        text.iter().any(|iu| iu.update_type == UpdateType::Add),
        "timeout prompt emitted a TEXT chain: {text:?}"
    );
    assert_eq!(driver.controller.timeout_count(), 1);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn timeout_prompts_cool_down_after_budget() {
    let mut config = test_config();
    config.intention.block_time_secs = 60.0;
    let generator = ScriptedGenerator::new(vec![]);
    let mut driver = Driver::start(config, generator.clone()).await;

    for _ in 0..3 {
        driver.intent().await;
        driver.pump(Duration::from_millis(200)).await;
        driver.tts_finished().await;
    }
    assert_eq!(generator.calls(), 3);

    // The fourth trigger lands in the cooldown instead of prompting.
    driver.intent().await;
    driver.pump(Duration::from_millis(100)).await;
    assert_eq!(generator.calls(), 3);
    assert_eq!(driver.controller.state(), DialogueState::Idle);
}

#[tokio::test]
async fn llm_timeout_recovers_to_listening() {
    let mut config = test_config();
    config.dialogue.response_generation_timeout_secs = 0.2;
    let generator = ScriptedGenerator::new(vec![Script {
        first_delay: Duration::from_secs(5),
        token_delay: Duration::ZERO,
        tokens: vec!["too late"],
        fail_after: None,
    }]);
    let mut driver = Driver::start(config, generator.clone()).await;

    driver.asr_partial("tell me something", 0.9).await;
    driver.pump(Duration::from_millis(600)).await;

    // No text was ever published, and the controller kept listening.
    assert!(driver.drain_text().is_empty());
    assert_eq!(driver.controller.state(), DialogueState::Listening);

    let states = driver.drain_states();
    assert_eq!(
        action_of(states.last().expect("states published")),
        "idle",
        "failure surfaced to the UI as idle"
    );
}

#[tokio::test]
async fn divergent_revision_restarts_generation() {
    let generator = ScriptedGenerator::new(vec![
        Script::slow(vec!["Hi", " there", ", hello!"], Duration::from_millis(50)),
        Script::instant(vec!["Do you need help?"]),
    ]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("hello", 0.6).await;
    driver.pump(Duration::from_millis(80)).await;
    assert_eq!(generator.calls(), 1);

    // The hypothesis is rewritten: "hello" -> "help".
    driver.asr_partial("help", 0.6).await;
    driver.pump(Duration::from_millis(50)).await;
    assert_eq!(generator.calls(), 2, "divergence restarts the generation");

    driver.asr_commit("help").await;
    driver.pump(Duration::from_millis(300)).await;

    let text = driver.drain_text();
    let adds: Vec<_> = text
        .iter()
        .filter(|iu| iu.update_type == UpdateType::Add)
        .collect();
    assert!(!adds.is_empty());
    // The response comes from the restarted generation.
    match &adds[0].payload {
        IuPayload::Text { text } => assert!(text.contains("help"), "got {text:?}"),
        other => panic!("expected TEXT, got {other:?}"),
    }
}

#[tokio::test]
async fn one_token_extension_continues_generation() {
    let generator = ScriptedGenerator::new(vec![Script::slow(
        vec!["Sounds", " fun."],
        Duration::from_millis(40),
    )]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("I went to", 0.6).await;
    driver.pump(Duration::from_millis(30)).await;
    driver.asr_partial("I went to Paris", 0.6).await;
    assert_eq!(
        generator.calls(),
        1,
        "a one-token extension keeps the in-flight generation"
    );
}

#[tokio::test]
async fn vap_threshold_closes_the_turn() {
    let generator = ScriptedGenerator::new(vec![Script::instant(vec!["Nice."])]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("I finished the report", 0.6).await;
    driver.vap(0.6).await;
    assert_eq!(driver.controller.state(), DialogueState::Listening);

    driver.vap(0.8).await;
    assert_ne!(driver.controller.state(), DialogueState::Listening);
    driver.pump(Duration::from_millis(300)).await;
    assert_eq!(driver.controller.history().len(), 2);
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let generator = ScriptedGenerator::new(vec![]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    let iu = IncrementalUnit::new_add(
        "asr",
        IuPayload::AsrToken {
            text: "hello".to_owned(),
            stability: 0.6,
        },
    );
    driver.deliver(topics::ASR_PARTIAL, iu.clone()).await;
    driver.pump(Duration::from_millis(50)).await;
    let calls_after_first = generator.calls();
    assert_eq!(calls_after_first, 1);

    driver.deliver(topics::ASR_PARTIAL, iu).await;
    driver.pump(Duration::from_millis(50)).await;
    assert_eq!(generator.calls(), calls_after_first, "duplicate re-delivery is a no-op");
    assert_eq!(driver.controller.state(), DialogueState::Listening);
}

#[tokio::test]
async fn causality_violation_is_dropped_not_fatal() {
    let generator = ScriptedGenerator::new(vec![]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    let ghost = IncrementalUnit::new_add(
        "asr",
        IuPayload::AsrToken {
            text: "never sent".to_owned(),
            stability: 0.5,
        },
    );
    let orphan = IncrementalUnit::new_commit(&ghost);
    driver.deliver(topics::ASR_PARTIAL, orphan).await;

    assert_eq!(driver.controller.state(), DialogueState::Idle);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn backchannel_forwards_concept_and_respects_verbal_cap() {
    let generator = ScriptedGenerator::new(vec![]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("I went to Paris last summer and", 0.4).await;
    driver.drain_states();
    driver.drain_text();

    let suggestion = |phrase: Option<&str>| {
        IncrementalUnit::new_add(
            "text_vap",
            IuPayload::Backchannel {
                intensity: 7,
                expression: "joy".to_owned(),
                action: "nod".to_owned(),
                concept: "Paris".to_owned(),
                phrase: phrase.map(str::to_owned),
            },
        )
    };

    // Three verbal suggestions in one user turn; the default cap is two.
    for _ in 0..3 {
        driver.deliver(topics::BC_SUGGEST, suggestion(Some("uh-huh"))).await;
    }

    let states = driver.drain_states();
    let with_concept = states
        .iter()
        .filter(|iu| match &iu.payload {
            IuPayload::SystemState { concept, .. } => concept.as_deref() == Some("Paris"),
            _ => false,
        })
        .count();
    assert_eq!(with_concept, 3, "every suggestion drives the avatar");

    let text = driver.drain_text();
    let verbal_chains = text
        .iter()
        .filter(|iu| iu.update_type == UpdateType::Add)
        .count();
    assert_eq!(verbal_chains, 2, "verbal cap per user turn: {text:?}");

    // A voiced acknowledgment moves the controller to BACKCHANNEL even
    // while the user holds the floor, and listening resumes once the
    // phrase has played.
    assert_eq!(driver.controller.state(), DialogueState::Backchannel);
    driver.tts_finished().await;
    assert_eq!(driver.controller.state(), DialogueState::Listening);

    // The main response pipeline was never disturbed.
    assert!(generator.calls() <= 1);
}

#[tokio::test]
async fn backchannel_during_thinking_resumes_the_response() {
    let generator = ScriptedGenerator::new(vec![Script {
        first_delay: Duration::from_millis(150),
        token_delay: Duration::ZERO,
        tokens: vec!["Paris is lovely in June."],
        fail_after: None,
    }]);
    let mut driver = Driver::start(test_config(), generator.clone()).await;

    driver.asr_partial("I went to Paris", 0.9).await;
    driver.asr_commit("I went to Paris").await;
    assert_eq!(driver.controller.state(), DialogueState::Thinking);

    // A verbal acknowledgment lands before the first response token.
    let suggestion = IncrementalUnit::new_add(
        "text_vap",
        IuPayload::Backchannel {
            intensity: 6,
            expression: "joy".to_owned(),
            action: "nod".to_owned(),
            concept: "Paris".to_owned(),
            phrase: Some("oh wow".to_owned()),
        },
    );
    driver.deliver(topics::BC_SUGGEST, suggestion).await;
    assert_eq!(driver.controller.state(), DialogueState::Backchannel);

    // Response tokens arrive while the phrase plays; they are held back.
    driver.pump(Duration::from_millis(300)).await;
    let held = driver.drain_text();
    let response_adds = held
        .iter()
        .filter(|iu| {
            iu.update_type == UpdateType::Add
                && matches!(&iu.payload, IuPayload::Text { text } if text.contains("Paris"))
        })
        .count();
    assert_eq!(response_adds, 0, "response must wait for the phrase: {held:?}");

    // The phrase finishes: the controller resumes and speaks the response.
    driver.tts_finished().await;
    assert_eq!(driver.controller.state(), DialogueState::Speaking);
    let text = driver.drain_text();
    assert!(
        text.iter().any(|iu| {
            matches!(&iu.payload, IuPayload::Text { text } if text.contains("Paris is lovely"))
        }),
        "held response flushed after the backchannel: {text:?}"
    );
    assert_eq!(text.last().expect("units").update_type, UpdateType::Commit);
    assert_eq!(driver.controller.history().len(), 2);
}

/// Minimal TTS adapter honoring the stated interface: consumes TEXT chains,
/// produces a TTS_AUDIO chain, commits when the text chain commits.
struct FakeTts {
    current: Option<IncrementalUnit>,
}

#[async_trait]
impl IncrementalModule for FakeTts {
    type Event = ();

    fn name(&self) -> &'static str {
        "tts"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[topics::DIALOGUE_TEXT]
    }

    async fn on_iu(&mut self, input: TopicIu, ctx: &ModuleContext<()>) -> Result<()> {
        match input.iu.update_type {
            UpdateType::Add => {
                let payload = IuPayload::TtsAudio {
                    samples: vec![0.0; 16],
                    sample_rate: 24_000,
                };
                let iu = match &self.current {
                    None => IncrementalUnit::new_add("tts", payload),
                    Some(prev) => IncrementalUnit::new_revision(prev, payload),
                };
                self.current = Some(iu.clone());
                ctx.bus().publish(topics::TTS_AUDIO, iu).await;
            }
            UpdateType::Commit => {
                if let Some(prev) = self.current.take() {
                    let commit = IncrementalUnit::new_commit(&prev);
                    ctx.bus().publish(topics::TTS_AUDIO, commit).await;
                }
            }
            UpdateType::Revoke => {
                if let Some(prev) = self.current.take() {
                    let revoke = IncrementalUnit::new_revoke(&prev);
                    ctx.bus().publish(topics::TTS_AUDIO, revoke).await;
                }
            }
        }
        Ok(())
    }
}

/// Full wiring through the module runner: typed input in, UI events out.
#[tokio::test]
async fn full_pipeline_round_trip() {
    use remdis::module::ModuleRunner;
    use remdis::ui::{UiBridge, UiCommand, UiEvent, UserInputPublisher};

    let config = test_config();
    let bus = MessageBus::new(&config.bus);
    let cancel = CancellationToken::new();
    let runner = ModuleRunner::new(bus.clone(), cancel.clone(), Duration::from_millis(200));

    let generator = ScriptedGenerator::new(vec![Script::instant(vec!["Hello, friend."])]);
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();

    let handles = vec![
        runner.spawn(DialogueController::new(
            config.clone(),
            PromptSet::default(),
            generator.clone() as Arc<dyn ResponseGenerator>,
        )),
        runner.spawn(FakeTts { current: None }),
        runner.spawn(UiBridge::new(ui_tx)),
    ];
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut publisher = UserInputPublisher::new(bus.clone());
    publisher
        .publish(UiCommand::UserInput {
            text: "hi".to_owned(),
            is_final: true,
        })
        .await;

    // The conversation completes: the system speaks and finishes.
    let mut spoke = false;
    let mut finished = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(spoke && finished) {
        let event = tokio::time::timeout_at(deadline, ui_rx.recv())
            .await
            .expect("pipeline completed in time")
            .expect("event stream open");
        match event {
            UiEvent::NewText { role, text } if role == "system" => {
                assert!(text.contains("Hello"));
                spoke = true;
            }
            UiEvent::SystemFinishedSpeaking => finished = true,
            _ => {}
        }
    }

    for handle in handles.into_iter().rev() {
        handle.shutdown();
        handle.join().await;
    }
}
