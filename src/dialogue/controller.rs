//! Turn-taking state machine merging ASR, VAP, and intent streams into
//! coherent turns.
//!
//! The controller runs speculative response generation: every ASR partial
//! refreshes a prompt snapshot, and the in-flight generation survives only
//! while the user draft stays within one token of that snapshot. Generated
//! tokens are chunked on punctuation into TEXT units for TTS; chunks are
//! held back while the user still holds the floor and flushed once the turn
//! boundary is decided. Cancellation revokes whatever was already published
//! on the chain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::topics;
use crate::config::SystemConfig;
use crate::dialogue::chunker::TokenChunker;
use crate::dialogue::history::{DialogueHistory, DialogueTurn, Role};
use crate::error::{RemdisError, Result};
use crate::iu::{ChainTracker, IncrementalUnit, IuPayload, Observation, UpdateType};
use crate::llm::{GenerationRequest, ResponseGenerator, run_generation};
use crate::module::{IncrementalModule, ModuleContext, TopicIu};
use crate::prompts::PromptSet;

/// Producer name stamped on every unit this module publishes.
const PRODUCER: &str = "dialogue";

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    /// No user activity; waiting.
    Idle,
    /// User ASR partials arriving.
    Listening,
    /// Committed to respond; waiting for the first speakable chunk.
    Thinking,
    /// System TEXT chunks being flushed to TTS.
    Speaking,
    /// Short verbal acknowledgment in progress.
    Backchannel,
    /// Generating a filler because the user fell silent.
    TimeoutPrompt,
}

impl DialogueState {
    fn action(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Backchannel => "backchannel",
            Self::TimeoutPrompt => "prompting",
        }
    }
}

/// Why a generation was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenerationKind {
    /// Speculative or committed response to the user draft.
    Response,
    /// Filler after user silence.
    Timeout,
}

/// Internal events delivered through the module runtime.
#[derive(Debug)]
pub enum DialogueEvent {
    Token { generation_id: u64, text: String },
    GenerationDone { generation_id: u64 },
    GenerationFailed { generation_id: u64, error: RemdisError },
    CooldownOver,
}

/// The user's in-progress utterance.
#[derive(Debug)]
struct UserDraft {
    text: String,
    started_at: DateTime<Utc>,
    /// Timestamp of the newest ASR revision, for VAP reconciliation.
    last_revision_ts: DateTime<Utc>,
}

/// Transient state of one speculative response generation.
struct ResponseDraft {
    /// User draft text the prompt was snapshotted from.
    snapshot_user_text: String,
    partial_text: String,
    chunks_flushed: u32,
    /// Chunks ready while the user still holds the floor.
    pending_chunks: Vec<String>,
    generation_id: u64,
    kind: GenerationKind,
    cancel: CancellationToken,
    /// Last TEXT unit published on this draft's chain.
    last_unit: Option<IncrementalUnit>,
    chunker: TokenChunker,
    started_at: DateTime<Utc>,
    /// The token stream has ended; the draft survives until flushed.
    done: bool,
}

/// The dialogue turn-taking controller.
pub struct DialogueController {
    config: SystemConfig,
    prompts: PromptSet,
    generator: Arc<dyn ResponseGenerator>,
    state: DialogueState,
    history: DialogueHistory,
    chains: ChainTracker,
    user_draft: Option<UserDraft>,
    draft: Option<ResponseDraft>,
    next_generation_id: u64,
    timeout_count: u32,
    cooling_down: bool,
    verbal_backchannels: u32,
    last_vap_at: Option<Instant>,
    /// State to restore once an in-progress backchannel finishes.
    resume_state: Option<DialogueState>,
}

impl DialogueController {
    pub fn new(
        config: SystemConfig,
        prompts: PromptSet,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let history = DialogueHistory::new(config.dialogue.history_length);
        Self {
            config,
            prompts,
            generator,
            state: DialogueState::Idle,
            history,
            chains: ChainTracker::new(),
            user_draft: None,
            draft: None,
            next_generation_id: 0,
            timeout_count: 0,
            cooling_down: false,
            verbal_backchannels: 0,
            last_vap_at: None,
            resume_state: None,
        }
    }

    pub fn state(&self) -> DialogueState {
        self.state
    }

    pub fn history(&self) -> &DialogueHistory {
        &self.history
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    async fn set_state(&mut self, state: DialogueState, ctx: &ModuleContext<DialogueEvent>) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        if state != DialogueState::Backchannel {
            // Any other exit from BACKCHANNEL (new partials, a commit, a
            // failure) supersedes the pending resume.
            self.resume_state = None;
        }
        self.publish_state(ctx, None).await;
    }

    async fn publish_state(&self, ctx: &ModuleContext<DialogueEvent>, concept: Option<String>) {
        let iu = IncrementalUnit::new_add(
            PRODUCER,
            IuPayload::SystemState {
                expression: "neutral".to_owned(),
                action: self.state.action().to_owned(),
                progress: None,
                current_text: self.draft.as_ref().map(|d| d.partial_text.clone()),
                concept,
            },
        );
        ctx.bus().publish(topics::SYSTEM_STATE, iu).await;
    }

    /// Whether generated chunks may go straight to TTS.
    fn flushing_active(&self) -> bool {
        matches!(
            self.state,
            DialogueState::Thinking | DialogueState::Speaking | DialogueState::TimeoutPrompt
        )
    }

    fn vap_stale(&self) -> bool {
        let expected = Duration::from_millis(self.config.vap.expected_period_ms);
        match self.last_vap_at {
            Some(at) => at.elapsed() > expected * 2,
            None => true,
        }
    }

    // --- generation lifecycle ---

    fn render_prompt(&self, kind: GenerationKind, user_text: &str) -> String {
        let history = self
            .history
            .render(self.config.dialogue.max_message_num_in_context);
        match kind {
            GenerationKind::Response => self.prompts.response.render(&history, user_text),
            GenerationKind::Timeout => self.prompts.timeout.render(&history, user_text),
        }
    }

    /// Start a new generation, cancelling any in-flight draft first.
    /// At most one generation is ever active.
    async fn start_generation(
        &mut self,
        kind: GenerationKind,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        self.cancel_draft(ctx).await;

        let user_text = self
            .user_draft
            .as_ref()
            .map(|d| d.text.clone())
            .unwrap_or_default();
        let prompt = self.render_prompt(kind, &user_text);

        self.next_generation_id += 1;
        let generation_id = self.next_generation_id;
        let cancel = CancellationToken::new();
        let request = GenerationRequest {
            prompt,
            generation_id,
            cancel: cancel.clone(),
            first_token_timeout: self.config.dialogue.response_generation_timeout(),
            max_tokens: self.config.chatgpt.max_tokens,
            temperature: self.config.chatgpt.temperature,
        };

        self.draft = Some(ResponseDraft {
            snapshot_user_text: user_text,
            partial_text: String::new(),
            chunks_flushed: 0,
            pending_chunks: Vec::new(),
            generation_id,
            kind,
            cancel,
            last_unit: None,
            chunker: TokenChunker::new(self.config.chatgpt.split_chars()),
            started_at: Utc::now(),
            done: false,
        });

        let generator = Arc::clone(&self.generator);
        let events = ctx.events();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<String>(64);
            let driver = tokio::spawn(run_generation(generator, request, tx));
            while let Some(text) = rx.recv().await {
                if events
                    .send(DialogueEvent::Token {
                        generation_id,
                        text,
                    })
                    .is_err()
                {
                    return;
                }
            }
            let outcome = match driver.await {
                Ok(Ok(())) => DialogueEvent::GenerationDone { generation_id },
                Ok(Err(error)) => DialogueEvent::GenerationFailed {
                    generation_id,
                    error,
                },
                Err(e) => DialogueEvent::GenerationFailed {
                    generation_id,
                    error: RemdisError::LlmFailed(format!("driver task died: {e}")),
                },
            };
            let _ = events.send(outcome);
        });
        debug!(generation_id, ?kind, "generation started");
    }

    /// Cancel the in-flight draft, revoking anything already published on
    /// its chain.
    async fn cancel_draft(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        draft.cancel.cancel();
        if let Some(last) = &draft.last_unit {
            let revoke = IncrementalUnit::new_revoke(last);
            ctx.bus().publish(topics::DIALOGUE_TEXT, revoke).await;
            debug!(
                generation_id = draft.generation_id,
                chunks = draft.chunks_flushed,
                "revoked cancelled draft"
            );
        }
    }

    /// Publish one chunk as a TEXT unit on the draft's chain.
    async fn flush_chunk(&mut self, chunk: String, ctx: &ModuleContext<DialogueEvent>) {
        let Some(draft) = self.draft.as_mut() else {
            return;
        };
        let iu = match &draft.last_unit {
            None => IncrementalUnit::new_add(PRODUCER, IuPayload::Text { text: chunk }),
            Some(last) => IncrementalUnit::new_revision(last, IuPayload::Text { text: chunk }),
        };
        draft.last_unit = Some(iu.clone());
        draft.chunks_flushed += 1;
        ctx.bus().publish(topics::DIALOGUE_TEXT, iu).await;

        if self.state != DialogueState::Speaking {
            self.set_state(DialogueState::Speaking, ctx).await;
        }
    }

    /// Flush everything held back, commit the chain, and fold the response
    /// into history. Called once the generation is done and the turn
    /// boundary has been decided.
    async fn finalize_response(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        let Some(mut draft) = self.draft.take() else {
            return;
        };
        let pending: Vec<String> = draft.pending_chunks.drain(..).collect();
        let tail = draft.chunker.finish();
        self.draft = Some(draft);

        for chunk in pending {
            self.flush_chunk(chunk, ctx).await;
        }
        if let Some(chunk) = tail {
            self.flush_chunk(chunk, ctx).await;
        }

        let draft = self.draft.take().expect("draft present");
        if let Some(last) = &draft.last_unit {
            let commit = IncrementalUnit::new_commit(last);
            ctx.bus().publish(topics::DIALOGUE_TEXT, commit).await;
        }

        let text = draft.partial_text.trim().to_owned();
        if !text.is_empty() {
            self.history.push(DialogueTurn {
                role: Role::System,
                text,
                started_at: draft.started_at,
                ended_at: Utc::now(),
                interrupted: false,
            });
        }

        if draft.chunks_flushed > 0 {
            // Stay in SPEAKING until TTS reports the utterance finished.
            self.set_state(DialogueState::Speaking, ctx).await;
        } else {
            info!(
                generation_id = draft.generation_id,
                "generation produced no speakable text"
            );
            self.set_state(DialogueState::Idle, ctx).await;
        }
    }

    // --- user turn handling ---

    /// More than one token of divergence between the generation snapshot
    /// and the current draft forces a restart.
    fn diverges(snapshot: &str, current: &str) -> bool {
        if snapshot == current {
            return false;
        }
        if !current.starts_with(snapshot) {
            return true;
        }
        current[snapshot.len()..].split_whitespace().count() > 1
    }

    async fn handle_asr_partial(
        &mut self,
        text: String,
        stability: f32,
        timestamp: DateTime<Utc>,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        self.timeout_count = 0;
        self.cooling_down = false;

        match self.state {
            DialogueState::Speaking | DialogueState::TimeoutPrompt => {
                if stability < self.config.dialogue.barge_in_stability {
                    // Unstable speech while the system talks; likely echo.
                    return;
                }
                self.barge_in(ctx).await;
            }
            DialogueState::Idle | DialogueState::Backchannel => {
                self.set_state(DialogueState::Listening, ctx).await;
            }
            DialogueState::Listening | DialogueState::Thinking => {}
        }

        let now = Utc::now();
        match self.user_draft.as_mut() {
            Some(draft) => {
                draft.text = text.clone();
                draft.last_revision_ts = timestamp;
            }
            None => {
                self.user_draft = Some(UserDraft {
                    text: text.clone(),
                    started_at: now,
                    last_revision_ts: timestamp,
                });
            }
        }

        if self.state == DialogueState::Thinking {
            // The turn boundary was premature; the user kept talking.
            self.set_state(DialogueState::Listening, ctx).await;
        }

        let restart = match &self.draft {
            Some(draft) => {
                draft.kind != GenerationKind::Response
                    || Self::diverges(&draft.snapshot_user_text, &text)
            }
            None => true,
        };
        if restart {
            self.start_generation(GenerationKind::Response, ctx).await;
        }
    }

    /// User speech interrupting system speech: revoke in-flight output and
    /// mark the system turn interrupted.
    async fn barge_in(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        info!("barge-in: user interrupted system speech");
        let streaming = self
            .draft
            .as_ref()
            .map(|d| (d.partial_text.trim().to_owned(), d.started_at));
        match streaming {
            Some((spoken, started_at)) => {
                // The response was still streaming: record what was said so
                // far as an interrupted system turn.
                self.cancel_draft(ctx).await;
                if !spoken.is_empty() {
                    self.history.push(DialogueTurn {
                        role: Role::System,
                        text: spoken,
                        started_at,
                        ended_at: Utc::now(),
                        interrupted: true,
                    });
                }
            }
            None => self.history.mark_last_system_interrupted(),
        }
        self.set_state(DialogueState::Listening, ctx).await;
    }

    /// Close the user turn and commit to responding.
    async fn end_of_user_turn(
        &mut self,
        final_text: Option<String>,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        let Some(user) = self.user_draft.take() else {
            debug!("turn boundary with no open user draft, ignoring");
            return;
        };
        let text = final_text.unwrap_or_else(|| user.text.clone());

        if self.vap_stale() {
            debug!("VAP silent, ASR commit is the turn authority");
        }

        // A final text differing from the snapshot restarts the generation
        // before the turn closes, so the response answers what was actually
        // said.
        let restart = match &self.draft {
            Some(draft) => {
                draft.kind != GenerationKind::Response
                    || Self::diverges(&draft.snapshot_user_text, &text)
            }
            None => true,
        };

        self.history.push(DialogueTurn {
            role: Role::User,
            text: text.clone(),
            started_at: user.started_at,
            ended_at: Utc::now(),
            interrupted: false,
        });
        self.verbal_backchannels = 0;

        self.set_state(DialogueState::Thinking, ctx).await;

        if restart {
            // The prompt must be rebuilt from history plus the final text;
            // the turn is already in history, so the draft slot is empty.
            self.user_draft = Some(UserDraft {
                text,
                started_at: user.started_at,
                last_revision_ts: user.last_revision_ts,
            });
            self.start_generation(GenerationKind::Response, ctx).await;
            self.user_draft = None;
            return;
        }

        // Continue the in-flight speculative generation: release what it
        // already produced.
        self.release_pending(ctx).await;
    }

    async fn handle_vap(
        &mut self,
        probability: f32,
        timestamp: DateTime<Utc>,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        self.last_vap_at = Some(Instant::now());
        if self.state != DialogueState::Listening {
            return;
        }
        // Reconcile cross-topic timing: a probability computed before the
        // newest ASR revision (beyond the window) describes a stale draft.
        if let Some(user) = &self.user_draft {
            let window = chrono::Duration::milliseconds(self.config.vap.reconcile_window_ms as i64);
            if timestamp + window < user.last_revision_ts {
                debug!("stale VAP probability ignored");
                return;
            }
        }
        if probability >= self.config.vap.threshold {
            debug!(probability, "VAP predicts end of user turn");
            self.end_of_user_turn(None, ctx).await;
        }
    }

    async fn handle_asr_commit(&mut self, text: String, ctx: &ModuleContext<DialogueEvent>) {
        self.timeout_count = 0;
        self.cooling_down = false;
        match self.state {
            DialogueState::Listening => {
                self.end_of_user_turn(Some(text), ctx).await;
            }
            DialogueState::Thinking => {
                // VAP already closed the turn; the commit only confirms it.
                debug!("ASR commit after VAP-predicted boundary");
            }
            DialogueState::Idle | DialogueState::Backchannel => {
                // Typed input or a single-shot recognition: a whole turn at
                // once.
                self.user_draft = Some(UserDraft {
                    text: text.clone(),
                    started_at: Utc::now(),
                    last_revision_ts: Utc::now(),
                });
                self.end_of_user_turn(Some(text), ctx).await;
            }
            DialogueState::Speaking | DialogueState::TimeoutPrompt => {
                self.barge_in(ctx).await;
                self.user_draft = Some(UserDraft {
                    text: text.clone(),
                    started_at: Utc::now(),
                    last_revision_ts: Utc::now(),
                });
                self.end_of_user_turn(Some(text), ctx).await;
            }
        }
    }

    async fn handle_asr_revoke(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        debug!("ASR revoked the user draft");
        self.user_draft = None;
        self.cancel_draft(ctx).await;
        if self.state == DialogueState::Listening || self.state == DialogueState::Thinking {
            self.set_state(DialogueState::Idle, ctx).await;
        }
    }

    async fn handle_intent(&mut self, silence_secs: f64, ctx: &ModuleContext<DialogueEvent>) {
        if self.state != DialogueState::Idle || self.cooling_down {
            return;
        }
        self.timeout_count += 1;
        if self.timeout_count > self.config.intention.max_timeout_num {
            info!(
                count = self.timeout_count - 1,
                "timeout prompt budget spent, cooling down"
            );
            self.cooling_down = true;
            self.timeout_count = 0;
            let events = ctx.events();
            let block = self.config.intention.block_time();
            tokio::spawn(async move {
                tokio::time::sleep(block).await;
                let _ = events.send(DialogueEvent::CooldownOver);
            });
            return;
        }
        info!(
            silence_secs,
            count = self.timeout_count,
            "user silent, prompting"
        );
        self.set_state(DialogueState::TimeoutPrompt, ctx).await;
        self.start_generation(GenerationKind::Timeout, ctx).await;
    }

    async fn handle_backchannel(
        &mut self,
        intensity: u8,
        expression: String,
        action: String,
        concept: String,
        phrase: Option<String>,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        if self.state == DialogueState::Speaking {
            return;
        }
        // Expression, action, and concept drive the avatar regardless of
        // whether anything is said aloud.
        let state_iu = IncrementalUnit::new_add(
            PRODUCER,
            IuPayload::SystemState {
                expression,
                action,
                progress: None,
                current_text: None,
                concept: Some(concept),
            },
        );
        ctx.bus().publish(topics::SYSTEM_STATE, state_iu).await;

        let Some(phrase) = phrase else {
            return;
        };
        if self.verbal_backchannels >= self.config.text_vap.max_verbal_backchannel_num {
            debug!("verbal backchannel budget for this turn spent");
            return;
        }
        self.verbal_backchannels += 1;
        debug!(intensity, %phrase, "verbal backchannel");

        // A short chain of its own, routed to TTS without touching the main
        // draft or its generation.
        let add = IncrementalUnit::new_add(PRODUCER, IuPayload::Text { text: phrase });
        let commit = IncrementalUnit::new_commit(&add);
        ctx.bus().publish(topics::DIALOGUE_TEXT, add).await;
        ctx.bus().publish(topics::DIALOGUE_TEXT, commit).await;

        if self.state != DialogueState::Speaking && self.state != DialogueState::Backchannel {
            self.resume_state = Some(self.state);
            self.set_state(DialogueState::Backchannel, ctx).await;
        }
    }

    /// Leave the BACKCHANNEL state, restoring whatever was underway before
    /// the acknowledgment and releasing any chunks held back meanwhile.
    async fn resume_after_backchannel(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        let next = self.resume_state.take().unwrap_or(DialogueState::Idle);
        self.set_state(next, ctx).await;
        self.release_pending(ctx).await;
    }

    /// Flush chunks buffered while flushing was off, and finalize if the
    /// generation already ended.
    async fn release_pending(&mut self, ctx: &ModuleContext<DialogueEvent>) {
        if !self.flushing_active() {
            return;
        }
        let pending: Vec<String> = self
            .draft
            .as_mut()
            .map(|d| d.pending_chunks.drain(..).collect())
            .unwrap_or_default();
        for chunk in pending {
            self.flush_chunk(chunk, ctx).await;
        }
        if self.draft.as_ref().is_some_and(|d| d.done) {
            self.finalize_response(ctx).await;
        }
    }

    async fn handle_tts(&mut self, iu: &IncrementalUnit, ctx: &ModuleContext<DialogueEvent>) {
        match iu.update_type {
            UpdateType::Commit => match self.state {
                DialogueState::Speaking => {
                    debug!("system finished speaking");
                    self.set_state(DialogueState::Idle, ctx).await;
                }
                DialogueState::Backchannel => {
                    self.resume_after_backchannel(ctx).await;
                }
                _ => {}
            },
            UpdateType::Revoke => match self.state {
                // TTS gave up mid-utterance: treat as finished prematurely.
                DialogueState::Speaking => {
                    warn!("TTS revoked its chain, returning to idle");
                    self.set_state(DialogueState::Idle, ctx).await;
                }
                DialogueState::Backchannel => {
                    warn!("TTS revoked the backchannel phrase");
                    self.resume_after_backchannel(ctx).await;
                }
                _ => {}
            },
            UpdateType::Add => {}
        }
    }

    // --- internal events ---

    fn is_current_generation(&self, generation_id: u64) -> bool {
        self.draft
            .as_ref()
            .is_some_and(|d| d.generation_id == generation_id)
    }

    async fn handle_token(
        &mut self,
        generation_id: u64,
        text: String,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        if !self.is_current_generation(generation_id) {
            // Token from a cancelled generation raced the cancel.
            return;
        }
        let flushing = self.flushing_active();
        let chunk = {
            let draft = self.draft.as_mut().expect("current draft");
            draft.partial_text.push_str(&text);
            draft.chunker.push(&text)
        };
        if let Some(chunk) = chunk {
            if flushing {
                self.flush_chunk(chunk, ctx).await;
            } else {
                self.draft
                    .as_mut()
                    .expect("current draft")
                    .pending_chunks
                    .push(chunk);
            }
        }
    }

    async fn handle_generation_done(
        &mut self,
        generation_id: u64,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        if !self.is_current_generation(generation_id) {
            return;
        }
        self.draft.as_mut().expect("current draft").done = true;
        if self.flushing_active() {
            self.finalize_response(ctx).await;
        }
        // Otherwise the user still holds the floor; the finished draft waits
        // for the turn boundary.
    }

    async fn handle_generation_failed(
        &mut self,
        generation_id: u64,
        error: RemdisError,
        ctx: &ModuleContext<DialogueEvent>,
    ) {
        if !self.is_current_generation(generation_id) {
            return;
        }
        warn!("generation failed: {error}");
        self.cancel_draft(ctx).await;
        // No automatic retry within the turn; the user can simply continue.
        self.state = if self.user_draft.is_some() {
            DialogueState::Listening
        } else {
            DialogueState::Idle
        };
        self.resume_state = None;
        // Surface the recovery to the UI as idle, whatever the internal
        // state, so the avatar visibly stops mid-gesture.
        let iu = IncrementalUnit::new_add(
            PRODUCER,
            IuPayload::SystemState {
                expression: "neutral".to_owned(),
                action: "idle".to_owned(),
                progress: None,
                current_text: None,
                concept: None,
            },
        );
        ctx.bus().publish(topics::SYSTEM_STATE, iu).await;
    }
}

#[async_trait]
impl IncrementalModule for DialogueController {
    type Event = DialogueEvent;

    fn name(&self) -> &'static str {
        PRODUCER
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[
            topics::ASR_PARTIAL,
            topics::ASR_COMMIT,
            topics::VAP_PROB,
            topics::INTENT_TIMEOUT,
            topics::BC_SUGGEST,
            topics::TTS_AUDIO,
        ]
    }

    async fn on_start(&mut self, ctx: &ModuleContext<DialogueEvent>) -> Result<()> {
        self.publish_state(ctx, None).await;
        Ok(())
    }

    async fn on_iu(&mut self, input: TopicIu, ctx: &ModuleContext<DialogueEvent>) -> Result<()> {
        let iu = input.iu;
        match self.chains.observe(&iu) {
            Ok(Observation::Fresh) => {}
            Ok(Observation::Duplicate) => return Ok(()),
            Err(violation) => {
                warn!(topic = input.topic, "dropping unit: {violation}");
                return Ok(());
            }
        }

        match (input.topic, iu.update_type, &iu.payload) {
            (topics::ASR_PARTIAL, UpdateType::Add, IuPayload::AsrToken { text, stability }) => {
                self.handle_asr_partial(text.clone(), *stability, iu.timestamp, ctx)
                    .await;
            }
            (topics::ASR_PARTIAL, UpdateType::Revoke, _) => {
                self.handle_asr_revoke(ctx).await;
            }
            (topics::ASR_PARTIAL, UpdateType::Commit, _) => {
                // The recognizer sealed the hypothesis chain; the final text
                // arrives on `asr.commit`.
            }
            (topics::ASR_COMMIT, _, IuPayload::AsrCommit { text }) => {
                self.handle_asr_commit(text.clone(), ctx).await;
            }
            (topics::VAP_PROB, _, IuPayload::Vap { probability }) => {
                self.handle_vap(*probability, iu.timestamp, ctx).await;
            }
            (topics::INTENT_TIMEOUT, _, IuPayload::Intent { silence_secs }) => {
                self.handle_intent(*silence_secs, ctx).await;
            }
            (
                topics::BC_SUGGEST,
                _,
                IuPayload::Backchannel {
                    intensity,
                    expression,
                    action,
                    concept,
                    phrase,
                },
            ) => {
                self.handle_backchannel(
                    *intensity,
                    expression.clone(),
                    action.clone(),
                    concept.clone(),
                    phrase.clone(),
                    ctx,
                )
                .await;
            }
            (topics::TTS_AUDIO, _, _) => {
                self.handle_tts(&iu, ctx).await;
            }
            _ => {
                debug!(topic = input.topic, "unexpected payload, ignoring");
            }
        }
        Ok(())
    }

    async fn on_event(
        &mut self,
        event: DialogueEvent,
        ctx: &ModuleContext<DialogueEvent>,
    ) -> Result<()> {
        match event {
            DialogueEvent::Token {
                generation_id,
                text,
            } => self.handle_token(generation_id, text, ctx).await,
            DialogueEvent::GenerationDone { generation_id } => {
                self.handle_generation_done(generation_id, ctx).await;
            }
            DialogueEvent::GenerationFailed {
                generation_id,
                error,
            } => {
                self.handle_generation_failed(generation_id, error, ctx)
                    .await;
            }
            DialogueEvent::CooldownOver => {
                debug!("timeout cooldown over");
                self.cooling_down = false;
            }
        }
        Ok(())
    }

    async fn on_shutdown(&mut self, ctx: &ModuleContext<DialogueEvent>) -> Result<()> {
        self.cancel_draft(ctx).await;
        self.state = DialogueState::Idle;
        self.publish_state(ctx, None).await;
        Ok(())
    }
}
