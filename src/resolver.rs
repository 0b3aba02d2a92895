use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{QueueError, QueueResult};
use crate::models::{Platform, TrackInfo};

const UNKNOWN_TRACK_TITLE: &str = "Unknown Track";

/// Looks up stream URLs and metadata for platform links.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Returns a direct, time-limited media URL for `source_url`.
    async fn resolve_direct_url(&self, source_url: &str) -> QueueResult<String>;

    async fn resolve_metadata(&self, source_url: &str) -> QueueResult<TrackInfo>;

    async fn resolve_playlist(&self, source_url: &str, platform: Platform) -> QueueResult<Vec<TrackInfo>>;

    async fn search(&self, query: &str) -> QueueResult<Option<TrackInfo>>;
}

#[derive(Deserialize)]
struct VideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<Thumbnail>>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

/// Resolver backed by the `yt-dlp` executable.
pub struct YtDlp {
    program: String,
    cookies: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(settings: &Settings) -> Self {
        Self {
            program: settings.ytdlp_path.clone(),
            cookies: settings.ytdlp_cookies.clone(),
            timeout: settings.resolve_timeout,
        }
    }

    fn command(&self, target: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(target)
            .arg("--no-warnings")
            .arg("--no-config")
            .kill_on_drop(true);

        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }

        command
    }

    async fn run(&self, mut command: Command, target: &str) -> QueueResult<String> {
        let output: Output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| QueueError::ResolutionFailed(format!("yt-dlp timed out for {target}")))?
            .map_err(|why| QueueError::ResolutionFailed(format!("yt-dlp failed to start: {why}")))?;

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| QueueError::ResolutionFailed("Error reading yt-dlp stdout".to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp exited with {} for {target}: {}", output.status, stderr.trim());

            return Err(QueueError::ResolutionFailed(format!(
                "yt-dlp exited with {}",
                output.status
            )));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl StreamResolver for YtDlp {
    async fn resolve_direct_url(&self, source_url: &str) -> QueueResult<String> {
        let mut command = self.command(source_url);
        command.args(["-f", "bestaudio", "--get-url", "--no-playlist"]);

        let stdout = self.run(command, source_url).await?;

        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| QueueError::ResolutionFailed("yt-dlp returned no URL".to_string()))
    }

    async fn resolve_metadata(&self, source_url: &str) -> QueueResult<TrackInfo> {
        let mut command = self.command(source_url);
        command.args(["--dump-json", "--no-playlist"]);

        let stdout = self.run(command, source_url).await?;
        let info = parse_video_info(&stdout)?;

        Ok(info.into_track_info(source_url))
    }

    async fn resolve_playlist(&self, source_url: &str, platform: Platform) -> QueueResult<Vec<TrackInfo>> {
        info!("Getting songs from playlist {source_url}");

        let mut command = self.command(source_url);
        command.args(["--dump-json", "--flat-playlist"]);

        let stdout = self.run(command, source_url).await?;

        Ok(parse_playlist(&stdout, platform))
    }

    async fn search(&self, query: &str) -> QueueResult<Option<TrackInfo>> {
        let target = format!("ytsearch1:{query}");
        let mut command = self.command(&target);
        command.arg("--dump-json");

        let stdout = self.run(command, &target).await?;

        if stdout.trim().is_empty() {
            return Ok(None);
        }

        let info = parse_video_info(&stdout)?;
        match info.webpage_url.clone() {
            Some(url) => Ok(Some(info.into_track_info(&url))),
            None => Ok(None),
        }
    }
}

impl VideoInfo {
    fn into_track_info(self, fallback_url: &str) -> TrackInfo {
        TrackInfo {
            title: self.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
            url: self.webpage_url.unwrap_or_else(|| fallback_url.to_string()),
            duration: seconds(self.duration),
            thumbnail: self.thumbnail,
        }
    }
}

fn seconds(duration: Option<f64>) -> u64 {
    duration
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| secs.round() as u64)
        .unwrap_or(0)
}

fn parse_video_info(stdout: &str) -> QueueResult<VideoInfo> {
    let line = stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| QueueError::ResolutionFailed("yt-dlp returned no metadata".to_string()))?;

    serde_json::from_str(line)
        .map_err(|why| QueueError::ResolutionFailed(format!("Unreadable yt-dlp metadata: {why}")))
}

fn parse_playlist(stdout: &str, platform: Platform) -> Vec<TrackInfo> {
    let lines: Vec<&str> = stdout.lines().filter(|line| !line.trim().is_empty()).collect();

    let tracks: Vec<TrackInfo> = lines
        .iter()
        .filter_map(|line| {
            let entry: PlaylistEntry = serde_json::from_str(line).ok()?;

            let url = entry.url.or_else(|| {
                entry.id.as_ref().map(|id| match platform {
                    Platform::YouTube => format!("https://www.youtube.com/watch?v={id}"),
                    Platform::SoundCloud => format!("https://soundcloud.com/{}", id.trim_start_matches('/')),
                })
            })?;

            let thumbnail = entry.thumbnail.or_else(|| {
                entry
                    .thumbnails
                    .and_then(|thumbnails| thumbnails.into_iter().next().map(|thumbnail| thumbnail.url))
            });

            Some(TrackInfo {
                title: entry.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
                url,
                duration: seconds(entry.duration),
                thumbnail,
            })
        })
        .collect();

    if tracks.len() < lines.len() {
        debug!("{} playlist entries skipped due to errors during parsing", lines.len() - tracks.len());
    }

    tracks
}
