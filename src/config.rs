use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Loudness profile applied by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub enabled: bool,
    pub target_lufs: f32,
    pub target_lra: f32,
    pub target_tp: f32,
    /// Tracks at or above this length get the cheaper single-pass filter.
    pub long_track_secs: u64,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            enabled: true,
            target_lufs: -16.0,
            target_lra: 11.0,
            target_tp: -1.5,
            long_track_secs: 7200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_max: usize,
    pub playlist_max: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub idle_advance_delay: Duration,
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
    pub switch_settle_delay: Duration,
    pub resolve_timeout: Duration,
    pub volume: f32,
    pub normalization: Normalization,
    pub ffmpeg_path: String,
    pub ffmpeg_log_level: String,
    pub ytdlp_path: String,
    pub ytdlp_cookies: Option<PathBuf>,
    pub stderr_tail_bytes: usize,
    pub command_prefix: String,
    pub command_cooldown_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_max: 200,
            playlist_max: 200,
            max_retries: 2,
            retry_delay: Duration::from_millis(2000),
            idle_advance_delay: Duration::from_millis(1000),
            inactivity_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            switch_settle_delay: Duration::from_millis(500),
            resolve_timeout: Duration::from_secs(30),
            volume: 0.7,
            normalization: Normalization::default(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_log_level: "error".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            ytdlp_cookies: None,
            stderr_tail_bytes: 500,
            command_prefix: "!".to_string(),
            command_cooldown_secs: 3,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from `lookup`, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let norm = defaults.normalization.clone();

        let volume: f32 = parse_or(&lookup, "VOLUME", defaults.volume)?;
        if !(0.0..=2.0).contains(&volume) {
            return Err(ConfigError::InvalidValue {
                key: "VOLUME",
                value: volume.to_string(),
                reason: "expected a value between 0.0 and 2.0".to_string(),
            });
        }

        let queue_max: usize = parse_or(&lookup, "QUEUE_MAX_SIZE", defaults.queue_max)?;
        if queue_max == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_MAX_SIZE",
                value: "0".to_string(),
                reason: "queue must hold at least one track".to_string(),
            });
        }

        Ok(Self {
            queue_max,
            playlist_max: parse_or(&lookup, "PLAYLIST_MAX_SIZE", defaults.playlist_max)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            retry_delay: millis_or(&lookup, "RETRY_DELAY_MS", defaults.retry_delay)?,
            idle_advance_delay: millis_or(&lookup, "IDLE_ADVANCE_DELAY_MS", defaults.idle_advance_delay)?,
            inactivity_timeout: secs_or(&lookup, "INACTIVITY_TIMEOUT_SECS", defaults.inactivity_timeout)?,
            connect_timeout: secs_or(&lookup, "CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            switch_settle_delay: millis_or(&lookup, "SWITCH_SETTLE_DELAY_MS", defaults.switch_settle_delay)?,
            resolve_timeout: secs_or(&lookup, "RESOLVE_TIMEOUT_SECS", defaults.resolve_timeout)?,
            volume,
            normalization: Normalization {
                enabled: parse_or(&lookup, "NORMALIZATION_ENABLED", norm.enabled)?,
                target_lufs: parse_or(&lookup, "TARGET_LUFS", norm.target_lufs)?,
                target_lra: parse_or(&lookup, "TARGET_LRA", norm.target_lra)?,
                target_tp: parse_or(&lookup, "TARGET_TP", norm.target_tp)?,
                long_track_secs: parse_or(&lookup, "LONG_TRACK_SECS", norm.long_track_secs)?,
            },
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ffmpeg_log_level: lookup("FFMPEG_LOG_LEVEL").unwrap_or(defaults.ffmpeg_log_level),
            ytdlp_path: lookup("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ytdlp_cookies: lookup("YTDLP_COOKIES")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            stderr_tail_bytes: parse_or(&lookup, "STDERR_TAIL_BYTES", defaults.stderr_tail_bytes)?,
            command_prefix: lookup("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),
            command_cooldown_secs: parse_or(&lookup, "COMMAND_COOLDOWN_SECS", defaults.command_cooldown_secs)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|why| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: why.to_string(),
        }),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn secs_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}
