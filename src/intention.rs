//! Silence watchdog: prompts the agent when the user goes quiet.
//!
//! Tracks the most recent activity on the ASR and TTS streams and publishes
//! an INTENT unit once silence exceeds the configured threshold. After
//! firing, the baseline resets so the next unit only fires after another
//! full window of silence; the dialogue controller decides how many prompts
//! to actually voice.

use async_trait::async_trait;
use std::time::Instant;
use tracing::info;

use crate::bus::topics;
use crate::config::SystemConfig;
use crate::error::Result;
use crate::iu::{IncrementalUnit, IuPayload};
use crate::module::{IncrementalModule, ModuleContext, TopicIu};

const PRODUCER: &str = "intention";

#[derive(Debug)]
pub enum IntentionEvent {
    Tick,
}

pub struct IntentionModule {
    config: SystemConfig,
    last_activity: Instant,
}

impl IntentionModule {
    pub fn new(config: SystemConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
        }
    }
}

#[async_trait]
impl IncrementalModule for IntentionModule {
    type Event = IntentionEvent;

    fn name(&self) -> &'static str {
        PRODUCER
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[topics::ASR_PARTIAL, topics::TTS_AUDIO]
    }

    async fn on_start(&mut self, ctx: &ModuleContext<IntentionEvent>) -> Result<()> {
        self.last_activity = Instant::now();
        let events = ctx.events();
        let cancel = ctx.cancel();
        let period = self.config.intention.watchdog_period();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if events.send(IntentionEvent::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_iu(&mut self, _input: TopicIu, _ctx: &ModuleContext<IntentionEvent>) -> Result<()> {
        // Any unit on a watched stream counts as activity.
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn on_event(
        &mut self,
        event: IntentionEvent,
        ctx: &ModuleContext<IntentionEvent>,
    ) -> Result<()> {
        let IntentionEvent::Tick = event;
        let silence = self.last_activity.elapsed();
        if silence < self.config.dialogue.max_silence_time() {
            return Ok(());
        }
        let silence_secs = silence.as_secs_f64();
        info!(silence_secs, "user silence threshold exceeded");
        let iu = IncrementalUnit::new_add(PRODUCER, IuPayload::Intent { silence_secs });
        ctx.bus().publish(topics::INTENT_TIMEOUT, iu).await;
        // Re-arm: the next unit needs another full window of silence.
        self.last_activity = Instant::now();
        Ok(())
    }
}
