//! Configuration for the voice bridge.
//!
//! All settings come from environment variables (the deployment ships a
//! read-only `.env` bundle that `dotenvy` loads before startup). Defaults
//! follow the PBX-side conventions: RTP ports from 12000 upward, transcripts
//! under the Asterisk monitor spool, 20 ms ulaw framing.
//!
//! # Modules
//! - `env`: environment variable parsing helpers

use std::path::PathBuf;
use std::time::Duration;

mod env;

use crate::core::error::{BridgeError, BridgeResult};
use crate::utils::parse_phrase_list;

/// Turn-detection settings sent to the realtime endpoint.
///
/// Only `server_vad` and `semantic_vad` are accepted; anything else collapses
/// to `server_vad` with defaults. Numeric knobs are coerced to finite values.
#[derive(Debug, Clone, PartialEq)]
pub enum VadSettings {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    SemanticVad,
}

impl VadSettings {
    fn from_env() -> Self {
        match env::var_or("VAD_TYPE", "server_vad").as_str() {
            "semantic_vad" => VadSettings::SemanticVad,
            other => {
                if other != "server_vad" {
                    tracing::warn!("unsupported VAD_TYPE {other:?}, using server_vad");
                }
                let threshold: f32 = env::parse_or("VAD_THRESHOLD", 0.6);
                VadSettings::ServerVad {
                    threshold: if threshold.is_finite() { threshold } else { 0.6 },
                    prefix_padding_ms: env::parse_or("VAD_PREFIX_PADDING_MS", 200),
                    silence_duration_ms: env::parse_or("VAD_SILENCE_DURATION_MS", 600),
                }
            }
        }
    }
}

/// SMTP settings for post-call transcript delivery.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_secure: bool,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub from: String,
    /// Comma-separated in the environment, split here.
    pub to: Vec<String>,
    pub subject_template: String,
    pub body_template: String,
}

impl EmailSettings {
    fn from_env() -> Option<Self> {
        if !env::var_bool("EMAIL_ENABLED", false) {
            return None;
        }
        let smtp_host = env::var("SMTP_HOST")?;
        let from = env::var("EMAIL_FROM")?;
        let to: Vec<String> = env::var("EMAIL_TO")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if to.is_empty() {
            tracing::warn!("EMAIL_ENABLED is set but EMAIL_TO is empty, disabling email");
            return None;
        }
        Some(Self {
            smtp_host,
            smtp_port: env::parse_or("SMTP_PORT", 587),
            smtp_secure: env::var_bool("SMTP_SECURE", false),
            smtp_user: env::var("SMTP_USER"),
            smtp_pass: env::var("SMTP_PASS"),
            from,
            to,
            subject_template: env::var_or(
                "EMAIL_SUBJECT_TEMPLATE",
                "Call transcript from {{callerId}}",
            ),
            body_template: env::var_or(
                "EMAIL_BODY_TEMPLATE",
                "Call {{channelId}} from {{callerId}} ended ({{reason}}).\n\n",
            ),
        })
    }
}

/// Bridge configuration.
///
/// Groups the PBX control connection, the realtime endpoint, media settings,
/// trigger phrases and the teardown timing knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // PBX control (ARI)
    pub ari_url: String,
    pub ari_username: String,
    pub ari_password: String,
    pub ari_app: String,

    // Realtime endpoint
    pub openai_api_key: String,
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    pub system_prompt: String,
    pub initial_message: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub vad: VadSettings,

    // Media
    pub rtp_port_start: u16,
    pub max_concurrent_calls: usize,
    pub silence_padding_ms: u64,

    // Trigger phrases (normalized at load)
    pub redirection_queue: Option<String>,
    pub redirection_queue_context: Option<String>,
    pub redirection_phrases: Vec<String>,
    pub agent_terminate_phrases: Vec<String>,

    // Transcripts
    pub recordings_dir: PathBuf,

    // Timing
    pub call_duration_limit: Option<Duration>,
    pub cleanup_grace: Duration,
    pub terminate_fallback: Duration,
    pub termination_watchdog: Duration,
    pub shutdown_timeout: Duration,

    // Health probe (0 disables)
    pub health_port: u16,

    // Transcript email (None when disabled)
    pub email: Option<EmailSettings>,
}

impl BridgeConfig {
    /// Load the configuration from the environment and validate the required
    /// settings.
    pub fn from_env() -> BridgeResult<Self> {
        let config = Self {
            ari_url: env::var_or("ARI_URL", "http://127.0.0.1:8088/ari"),
            ari_username: env::var("ARI_USERNAME").unwrap_or_default(),
            ari_password: env::var("ARI_PASSWORD").unwrap_or_default(),
            ari_app: env::var_or("ARI_APP", "voicebridge"),

            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            realtime_url: env::var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime"),
            realtime_model: env::var_or("REALTIME_MODEL", "gpt-4o-realtime-preview"),
            voice: env::var_or("OPENAI_VOICE", "alloy"),
            system_prompt: env::var_or("SYSTEM_PROMPT", "You are a helpful phone assistant."),
            initial_message: env::var_or("INITIAL_MESSAGE", "Hi"),
            transcription_model: env::var_or("TRANSCRIPTION_MODEL", "whisper-1"),
            transcription_language: env::var_or("TRANSCRIPTION_LANGUAGE", "en"),
            vad: VadSettings::from_env(),

            rtp_port_start: env::parse_or("RTP_PORT_START", 12000),
            max_concurrent_calls: env::parse_or("MAX_CONCURRENT_CALLS", 10usize),
            silence_padding_ms: env::parse_or("SILENCE_PADDING_MS", 100u64),

            redirection_queue: env::var("REDIRECTION_QUEUE"),
            redirection_queue_context: env::var("REDIRECTION_QUEUE_CONTEXT"),
            redirection_phrases: env::var("REDIRECTION_PHRASES")
                .map(|v| parse_phrase_list(&v))
                .unwrap_or_default(),
            agent_terminate_phrases: env::var("AGENT_TERMINATE_PHRASES")
                .map(|v| parse_phrase_list(&v))
                .unwrap_or_default(),

            recordings_dir: PathBuf::from(env::var_or(
                "RECORDINGS_DIR",
                "/var/spool/asterisk/monitor",
            )),

            call_duration_limit: match env::parse_or("CALL_DURATION_LIMIT_SECONDS", 0u64) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            cleanup_grace: Duration::from_millis(env::parse_or("CLEANUP_GRACE_MS", 1500u64)),
            terminate_fallback: Duration::from_millis(env::parse_or(
                "TERMINATE_FALLBACK_MS",
                8000u64,
            )),
            termination_watchdog: Duration::from_millis(env::parse_or(
                "TERMINATION_WATCHDOG_MS",
                8000u64,
            )),
            shutdown_timeout: Duration::from_millis(env::parse_or("SHUTDOWN_TIMEOUT_MS", 8000u64)),

            health_port: env::parse_or("HEALTH_PORT", 0u16),

            email: EmailSettings::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BridgeResult<()> {
        if self.ari_username.is_empty() || self.ari_password.is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "ARI_USERNAME and ARI_PASSWORD are required".into(),
            ));
        }
        if self.openai_api_key.is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "OPENAI_API_KEY is required".into(),
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(BridgeError::InvalidConfiguration(
                "MAX_CONCURRENT_CALLS must be at least 1".into(),
            ));
        }
        if usize::from(self.rtp_port_start) + self.max_concurrent_calls > usize::from(u16::MAX) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "RTP port range {}..{} exceeds the UDP port space",
                self.rtp_port_start,
                usize::from(self.rtp_port_start) + self.max_concurrent_calls
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_bridge_env() {
        for key in [
            "ARI_URL",
            "ARI_USERNAME",
            "ARI_PASSWORD",
            "ARI_APP",
            "OPENAI_API_KEY",
            "VAD_TYPE",
            "VAD_THRESHOLD",
            "AGENT_TERMINATE_PHRASES",
            "REDIRECTION_PHRASES",
            "CALL_DURATION_LIMIT_SECONDS",
            "EMAIL_ENABLED",
            "SMTP_HOST",
            "EMAIL_FROM",
            "EMAIL_TO",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn requires_credentials() {
        clear_bridge_env();
        assert!(matches!(
            BridgeConfig::from_env(),
            Err(BridgeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn loads_with_defaults() {
        clear_bridge_env();
        unsafe {
            std::env::set_var("ARI_USERNAME", "ari");
            std::env::set_var("ARI_PASSWORD", "secret");
            std::env::set_var("OPENAI_API_KEY", "sk-test");
            std::env::set_var(
                "AGENT_TERMINATE_PHRASES",
                "'thanks, goodbye','auf wiedersehen'",
            );
            std::env::set_var("CALL_DURATION_LIMIT_SECONDS", "60");
        }

        let config = BridgeConfig::from_env().unwrap();
        assert_eq!(config.rtp_port_start, 12000);
        assert_eq!(config.silence_padding_ms, 100);
        assert_eq!(config.cleanup_grace, Duration::from_millis(1500));
        assert_eq!(config.call_duration_limit, Some(Duration::from_secs(60)));
        assert_eq!(
            config.agent_terminate_phrases,
            vec!["thanks, goodbye", "auf wiedersehen"]
        );
        assert_eq!(
            config.vad,
            VadSettings::ServerVad {
                threshold: 0.6,
                prefix_padding_ms: 200,
                silence_duration_ms: 600,
            }
        );
        assert!(config.email.is_none());
        clear_bridge_env();
    }

    #[test]
    #[serial]
    fn unknown_vad_type_collapses_to_server_vad() {
        clear_bridge_env();
        unsafe {
            std::env::set_var("ARI_USERNAME", "ari");
            std::env::set_var("ARI_PASSWORD", "secret");
            std::env::set_var("OPENAI_API_KEY", "sk-test");
            std::env::set_var("VAD_TYPE", "client_vad");
            std::env::set_var("VAD_THRESHOLD", "inf");
        }

        let config = BridgeConfig::from_env().unwrap();
        match config.vad {
            VadSettings::ServerVad { threshold, .. } => assert_eq!(threshold, 0.6),
            other => panic!("expected server_vad, got {other:?}"),
        }
        clear_bridge_env();
    }

    #[test]
    #[serial]
    fn email_needs_host_and_recipients() {
        clear_bridge_env();
        unsafe {
            std::env::set_var("ARI_USERNAME", "ari");
            std::env::set_var("ARI_PASSWORD", "secret");
            std::env::set_var("OPENAI_API_KEY", "sk-test");
            std::env::set_var("EMAIL_ENABLED", "true");
        }
        assert!(BridgeConfig::from_env().unwrap().email.is_none());

        unsafe {
            std::env::set_var("SMTP_HOST", "mail.example.org");
            std::env::set_var("EMAIL_FROM", "bridge@example.org");
            std::env::set_var("EMAIL_TO", "ops@example.org, sales@example.org");
        }
        let email = BridgeConfig::from_env().unwrap().email.unwrap();
        assert_eq!(email.to, vec!["ops@example.org", "sales@example.org"]);
        assert_eq!(email.smtp_port, 587);
        clear_bridge_env();
    }
}
