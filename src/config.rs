use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.revolt.chat";
pub const DEFAULT_VORTEX_URL: &str = "wss://vortex.revolt.chat";

/// Client-wide settings shared by every voice connection.
#[derive(Debug, Clone)]
pub struct RevoiceConfig {
    pub api_url: String,
    pub vortex_url: String,
    /// Delay between reconnect attempts after an unexpected socket close.
    pub reconnect_delay: Duration,
    /// Timeout applied to correlated signaling requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for RevoiceConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            vortex_url: DEFAULT_VORTEX_URL.to_string(),
            reconnect_delay: Duration::from_millis(3000),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Settings for a [`MediaPlayer`](crate::media::MediaPlayer).
#[derive(Debug, Clone)]
pub struct MediaOptions {
    /// Local UDP port the transcoder streams RTP to. `0` picks a free port.
    pub port: u16,
    /// Forward ffmpeg stderr to the log.
    pub log_output: bool,
    /// Extra arguments spliced into the ffmpeg invocation before the output
    /// mapping.
    pub custom_args: Vec<String>,
    /// Playback start offset as `HH:MM:SS`.
    pub start: String,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            port: 5030,
            log_output: false,
            custom_args: Vec::new(),
            start: "00:00:00".to_string(),
        }
    }
}
