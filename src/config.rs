use clap::Parser;
use serde_json::{json, Value};

/// Realtime voice bridge: relays browser microphone audio to an
/// end-to-end speech dialog service and streams synthesized replies
/// and dialog events back over the same WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    // ── Upstream dialog service ────────────────────────────────────────

    /// Realtime dialog WebSocket endpoint
    #[arg(long, default_value = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue")]
    pub upstream_url: String,

    /// X-Api-App-ID credential (or set DIALOG_APP_ID)
    #[arg(long, env = "DIALOG_APP_ID", default_value = "")]
    pub app_id: String,

    /// X-Api-App-Key credential (or set DIALOG_APP_KEY)
    #[arg(long, env = "DIALOG_APP_KEY", default_value = "")]
    pub app_key: String,

    /// X-Api-Access-Key credential (or set DIALOG_ACCESS_KEY)
    #[arg(long, env = "DIALOG_ACCESS_KEY", default_value = "")]
    pub access_key: String,

    /// X-Api-Resource-Id for the realtime dialog resource
    #[arg(long, env = "DIALOG_RESOURCE_ID", default_value = "volc.speech.dialog")]
    pub resource_id: String,

    // ── ASR ────────────────────────────────────────────────────────────

    /// End-of-speech smoothing window in milliseconds
    #[arg(long, default_value_t = 1500)]
    pub end_smooth_window_ms: u32,

    /// Let the service run its own voice-activity detection
    #[arg(long, default_value_t = false)]
    pub enable_custom_vad: bool,

    /// Enable two-pass recognition refinement
    #[arg(long, default_value_t = false)]
    pub enable_asr_twopass: bool,

    // ── TTS ────────────────────────────────────────────────────────────

    /// Speaker voice for synthesized replies
    #[arg(long, default_value = "zh_female_vv_jupiter_bigtts")]
    pub speaker: String,

    /// Audio container format the service synthesizes into
    #[arg(long, default_value = "pcm")]
    pub tts_format: String,

    /// Synthesized audio sample rate
    #[arg(long, default_value_t = 24_000)]
    pub tts_sample_rate: u32,

    /// Synthesized audio channel count
    #[arg(long, default_value_t = 1)]
    pub tts_channel: u32,

    // ── Dialog persona ─────────────────────────────────────────────────

    /// Resume an existing dialog instead of starting a fresh one
    #[arg(long)]
    pub dialog_id: Option<String>,

    /// Name the assistant answers to (also spoken in the greeting)
    #[arg(long, default_value = "小智")]
    pub bot_name: String,

    /// System role describing who the assistant is
    #[arg(long, default_value = "你是一个友好的语音助手，擅长用口语化的中文陪用户聊天，回答准确而简短。")]
    pub system_role: String,

    /// Speaking style hint passed to the dialog model
    #[arg(long, default_value = "语气亲切自然，语速适中，回答简洁。")]
    pub speaking_style: String,

    /// Optional character manifest for persona-heavy deployments
    #[arg(long)]
    pub character_manifest: Option<String>,

    /// City used for location-aware answers (weather, local queries)
    #[arg(long)]
    pub location_city: Option<String>,

    /// Maximum web-search results the dialog model may cite
    #[arg(long, default_value_t = 10)]
    pub websearch_result_count: u32,

    /// Service-side receive timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub recv_timeout: u32,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations the upstream service would refuse anyway,
    /// before any socket is opened.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        if self.host.is_empty() {
            problems.push("host must not be empty".to_owned());
        }
        if self.port == 0 {
            problems.push("port must not be 0".to_owned());
        }
        for (name, value) in [
            ("app-id", &self.app_id),
            ("app-key", &self.app_key),
            ("access-key", &self.access_key),
            ("resource-id", &self.resource_id),
        ] {
            if value.is_empty() {
                problems.push(format!("credential --{name} is required"));
            }
        }
        if self.speaker.is_empty() {
            problems.push("--speaker is required".to_owned());
        }
        if self.tts_format.is_empty() {
            problems.push("--tts-format must not be empty".to_owned());
        }
        if self.tts_sample_rate == 0 {
            problems.push("--tts-sample-rate must be positive".to_owned());
        }
        if self.tts_channel == 0 {
            problems.push("--tts-channel must be positive".to_owned());
        }
        if self.bot_name.is_empty() || self.bot_name.chars().count() > 20 {
            problems.push("--bot-name must be 1..=20 characters".to_owned());
        }
        if self.system_role.is_empty() {
            problems.push("--system-role is required".to_owned());
        }
        if !(500..=50_000).contains(&self.end_smooth_window_ms) {
            problems.push("--end-smooth-window-ms must be within 500..=50000".to_owned());
        }
        if self.websearch_result_count > 10 {
            problems.push("--websearch-result-count must be at most 10".to_owned());
        }
        if !(10..=120).contains(&self.recv_timeout) {
            problems.push("--recv-timeout must be within 10..=120".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", problems.join("; "))
        }
    }

    /// JSON payload of the StartSession frame.
    pub fn session_payload(&self) -> Value {
        let mut payload = json!({
            "asr": {
                "extra": {
                    "end_smooth_window_ms": self.end_smooth_window_ms,
                    "enable_custom_vad": self.enable_custom_vad,
                    "enable_asr_twopass": self.enable_asr_twopass,
                }
            },
            "tts": {
                "speaker": self.speaker,
                "audio_config": {
                    "channel": self.tts_channel,
                    "format": self.tts_format,
                    "sample_rate": self.tts_sample_rate,
                }
            },
            "dialog": {
                "bot_name": self.bot_name,
                "system_role": self.system_role,
                "speaking_style": self.speaking_style,
                "extra": {
                    "recv_timeout": self.recv_timeout,
                    "volc_websearch_result_count": self.websearch_result_count,
                }
            }
        });

        let dialog = &mut payload["dialog"];
        if let Some(id) = &self.dialog_id {
            dialog["dialog_id"] = json!(id);
        }
        if let Some(manifest) = &self.character_manifest {
            dialog["character_manifest"] = json!(manifest);
        }
        if let Some(city) = &self.location_city {
            dialog["location"] = json!({ "city": city });
        }

        payload
    }

    /// Greeting spoken right after the session opens. The template text
    /// is observable behavior; only the bot name varies.
    pub fn greeting(&self) -> String {
        format!("你好，我是{}，有什么可以帮你的吗？", self.bot_name)
    }
}
