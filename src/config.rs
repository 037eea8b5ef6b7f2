//! Configuration types for the dialogue system.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RemdisError, Result};

/// Top-level configuration, loaded once at startup and passed to each module
/// as an immutable snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Voice-activity-projection settings.
    pub vap: VapConfig,
    /// Dialogue controller settings.
    pub dialogue: DialogueConfig,
    /// LLM adapter settings.
    pub chatgpt: ChatGptConfig,
    /// Text-VAP backchannel adapter settings.
    pub text_vap: TextVapConfig,
    /// Silence watchdog settings.
    pub intention: IntentionConfig,
    /// Message bus settings.
    pub bus: BusConfig,
    /// Module runtime settings.
    pub runtime: RuntimeConfig,
}

/// Voice-activity-projection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VapConfig {
    /// Turn-taking probability at or above which the user turn is taken as
    /// finished.
    pub threshold: f32,
    /// Expected interval between VAP probability updates, in milliseconds.
    ///
    /// When no VAP unit arrives for twice this period the adapter is treated
    /// as silent and ASR commits become the only turn boundary.
    pub expected_period_ms: u64,
    /// Reconciliation window for VAP vs ASR timestamps, in milliseconds.
    /// VAP probabilities older than the newest ASR revision by more than
    /// this are ignored.
    pub reconcile_window_ms: u64,
}

impl Default for VapConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            expected_period_ms: 200,
            reconcile_window_ms: 200,
        }
    }
}

/// Dialogue controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Number of past turns kept in the dialogue history.
    pub history_length: usize,
    /// Number of history turns included in a prompt snapshot.
    pub max_message_num_in_context: usize,
    /// Deadline for the first LLM token, in seconds.
    pub response_generation_timeout_secs: f64,
    /// User silence threshold before a timeout prompt, in seconds.
    pub max_silence_time_secs: f64,
    /// ASR stability at or above which user speech interrupts the system.
    pub barge_in_stability: f32,
    /// Short verbal acknowledgments, ordered from mild to strong.
    pub backchannels: Vec<String>,
    /// Directory holding prompt template overrides (`response.txt`,
    /// `backchannel.txt`, `timeout.txt`). Built-in templates otherwise.
    pub prompt_dir: Option<PathBuf>,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            history_length: 5,
            max_message_num_in_context: 5,
            response_generation_timeout_secs: 3.0,
            max_silence_time_secs: 5.0,
            barge_in_stability: 0.5,
            backchannels: vec![
                "mm-hm".to_owned(),
                "uh-huh".to_owned(),
                "yeah".to_owned(),
                "right".to_owned(),
                "oh wow".to_owned(),
            ],
            prompt_dir: None,
        }
    }
}

impl DialogueConfig {
    pub fn response_generation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.response_generation_timeout_secs)
    }

    pub fn max_silence_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_silence_time_secs)
    }
}

/// LLM adapter configuration for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatGptConfig {
    /// Base URL of the API endpoint.
    pub api_url: String,
    /// Model identifier.
    pub api_model: String,
    /// API key; empty for unauthenticated local servers.
    pub api_key: String,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Punctuation set on which streamed tokens are chunked for TTS.
    /// Accepts a bare character set (",.?!") or a bracketed one ("[,.?!]").
    pub split_pattern: String,
}

impl Default for ChatGptConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_owned(),
            api_model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            max_tokens: 128,
            temperature: 0.7,
            split_pattern: ",.?!".to_owned(),
        }
    }
}

impl ChatGptConfig {
    /// The chunking punctuation as a character set.
    pub fn split_chars(&self) -> Vec<char> {
        self.split_pattern
            .trim_start_matches('[')
            .trim_end_matches(']')
            .chars()
            .collect()
    }
}

/// Text-VAP backchannel adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextVapConfig {
    /// Invoke the backchannel LLM once every this many ASR partials.
    pub text_vap_interval: u32,
    /// Maximum verbal backchannels per user turn.
    pub max_verbal_backchannel_num: u32,
}

impl Default for TextVapConfig {
    fn default() -> Self {
        Self {
            text_vap_interval: 3,
            max_verbal_backchannel_num: 2,
        }
    }
}

/// Silence watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentionConfig {
    /// Consecutive timeout prompts before the cooldown kicks in.
    pub max_timeout_num: u32,
    /// Cooldown after `max_timeout_num` consecutive prompts, in seconds.
    pub block_time_secs: f64,
    /// Watchdog polling period, in milliseconds.
    pub watchdog_period_ms: u64,
}

impl Default for IntentionConfig {
    fn default() -> Self {
        Self {
            max_timeout_num: 3,
            block_time_secs: 10.0,
            watchdog_period_ms: 500,
        }
    }
}

impl IntentionConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_secs_f64(self.block_time_secs)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue depth before the drop-oldest policy applies.
    pub buff_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buff_size: 10 }
    }
}

/// Module runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long shutdown drains pending input before cancelling, in
    /// milliseconds.
    pub shutdown_drain_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_drain_ms: 500,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

impl SystemConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RemdisError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| RemdisError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` on serialization failure, `Io` on write failure.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RemdisError::ConfigInvalid(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/remdis/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/remdis-config"))
            .join("remdis")
            .join("config.toml")
    }

    /// Reject values no module can run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vap.threshold) {
            return Err(RemdisError::ConfigInvalid(format!(
                "vap.threshold must be in [0, 1], got {}",
                self.vap.threshold
            )));
        }
        if self.dialogue.history_length == 0 {
            return Err(RemdisError::ConfigInvalid(
                "dialogue.history_length must be positive".to_owned(),
            ));
        }
        if self.dialogue.response_generation_timeout_secs <= 0.0 {
            return Err(RemdisError::ConfigInvalid(
                "dialogue.response_generation_timeout_secs must be positive".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dialogue.barge_in_stability) {
            return Err(RemdisError::ConfigInvalid(format!(
                "dialogue.barge_in_stability must be in [0, 1], got {}",
                self.dialogue.barge_in_stability
            )));
        }
        if self.chatgpt.split_chars().is_empty() {
            return Err(RemdisError::ConfigInvalid(
                "chatgpt.split_pattern must name at least one character".to_owned(),
            ));
        }
        if self.text_vap.text_vap_interval == 0 {
            return Err(RemdisError::ConfigInvalid(
                "text_vap.text_vap_interval must be positive".to_owned(),
            ));
        }
        if self.bus.buff_size == 0 {
            return Err(RemdisError::ConfigInvalid(
                "bus.buff_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vap.threshold, 0.75);
        assert_eq!(config.dialogue.history_length, 5);
        assert_eq!(config.intention.max_timeout_num, 3);
        assert_eq!(config.bus.buff_size, 10);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");

        let mut config = SystemConfig::default();
        config.vap.threshold = 0.6;
        config.chatgpt.api_model = "gpt-4o".to_owned();
        config.save_to_file(&path).expect("save");

        let loaded = SystemConfig::from_file(&path).expect("load");
        assert_eq!(loaded.vap.threshold, 0.6);
        assert_eq!(loaded.chatgpt.api_model, "gpt-4o");
        assert_eq!(loaded.dialogue.history_length, 5);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[vap]\nthreshold = 0.9\n").expect("write");

        let loaded = SystemConfig::from_file(&path).expect("load");
        assert_eq!(loaded.vap.threshold, 0.9);
        assert_eq!(loaded.text_vap.text_vap_interval, 3);
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut config = SystemConfig::default();
        config.vap.threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(RemdisError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn bracketed_split_pattern_accepted() {
        let mut config = SystemConfig::default();
        config.chatgpt.split_pattern = "[,.?!]".to_owned();
        assert_eq!(config.chatgpt.split_chars(), vec![',', '.', '?', '!']);
    }
}
