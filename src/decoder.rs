use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{Normalization, Settings};
use crate::error::{QueueError, QueueResult};
use crate::models::Track;
use crate::resolver::StreamResolver;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const PCM_FORMAT: &str = "s16le";

const DYNAMIC_FILTER: &str = "dynaudnorm=f=500:g=31:p=0.95:m=10.0:r=0.9:b=1";

/// Raw interleaved PCM handed to the voice sink.
pub struct PcmStream(Box<dyn Read + Send>);

impl PcmStream {
    pub fn new<R: Read + Send + 'static>(reader: R) -> Self {
        Self(Box::new(reader))
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.0
    }
}

/// A running transcoder owned by exactly one guild queue.
pub trait DecoderProcess: Send + Sync {
    /// Kills the process if it is still running and reaps it. Idempotent.
    fn terminate(&mut self);
}

pub struct DecodedStream {
    pub process: Box<dyn DecoderProcess>,
    pub output: PcmStream,
}

pub trait Transcoder: Send + Sync {
    fn spawn(&self, direct_url: &str, track: &Track) -> QueueResult<DecodedStream>;
}

/// Picks the loudness filter graph for a track of `duration` seconds.
pub fn loudness_filter(normalization: &Normalization, duration: u64) -> Option<String> {
    if !normalization.enabled {
        return None;
    }

    if duration < normalization.long_track_secs {
        Some(format!(
            "loudnorm=I={}:LRA={}:TP={}",
            normalization.target_lufs, normalization.target_lra, normalization.target_tp
        ))
    } else {
        Some(DYNAMIC_FILTER.to_string())
    }
}

pub fn ffmpeg_args(settings: &Settings, direct_url: &str, duration: u64) -> Vec<String> {
    let mut args: Vec<String> = [
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "5",
        "-analyzeduration",
        "0",
        "-loglevel",
        settings.ffmpeg_log_level.as_str(),
        "-i",
        direct_url,
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();

    if let Some(filter) = loudness_filter(&settings.normalization, duration) {
        args.push("-af".to_string());
        args.push(filter);
    }

    args.extend([
        "-f".to_string(),
        PCM_FORMAT.to_string(),
        "-ar".to_string(),
        SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        CHANNELS.to_string(),
        "pipe:1".to_string(),
    ]);

    args
}

/// Keeps the last `capacity` bytes written to it.
#[derive(Clone)]
pub struct StderrTail {
    buffer: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = bytes.len().saturating_sub(self.capacity);
        buffer.extend(&bytes[skip..]);

        let overflow = buffer.len().saturating_sub(self.capacity);
        buffer.drain(..overflow);
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes: Vec<u8> = buffer.iter().copied().collect();

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Treats a prematurely closed pipe as the end of the track.
pub struct DecoderOutput<R> {
    inner: R,
    title: String,
}

impl<R: Read> DecoderOutput<R> {
    pub fn new(inner: R, title: &str) -> Self {
        Self {
            inner,
            title: title.to_string(),
        }
    }
}

impl<R: Read> Read for DecoderOutput<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Err(why)
                if matches!(
                    why.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Stream closed for {} (likely finished playing): {why}", self.title);
                Ok(0)
            }
            other => other,
        }
    }
}

pub struct FfmpegProcess {
    child: Option<Child>,
    stderr: StderrTail,
    title: String,
}

impl DecoderProcess for FfmpegProcess {
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                debug!("FFmpeg for {} exited cleanly", self.title);
                return;
            }
            Ok(Some(status)) => {
                warn!("FFmpeg for {} exited with {status}", self.title);
                let tail = self.stderr.contents();
                if !tail.trim().is_empty() {
                    warn!("FFmpeg stderr output: {}", tail.trim());
                }
                return;
            }
            Ok(None) => {}
            Err(why) => warn!("Could not poll FFmpeg for {}: {why}", self.title),
        }

        if let Err(why) = child.kill() {
            debug!("FFmpeg kill for {} failed: {why}", self.title);
        }

        let title = self.title.clone();
        let mut reap = move || match child.wait() {
            Ok(status) => debug!("FFmpeg for {title} terminated ({status})"),
            Err(why) => warn!("Could not reap FFmpeg for {title}: {why}"),
        };

        // Callers hold the guild lock; the wait happens off the async workers.
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub struct FfmpegTranscoder {
    settings: Arc<Settings>,
}

impl FfmpegTranscoder {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, direct_url: &str, track: &Track) -> QueueResult<DecodedStream> {
        let args = ffmpeg_args(&self.settings, direct_url, track.duration);

        if loudness_filter(&self.settings.normalization, track.duration).is_some() {
            if track.duration < self.settings.normalization.long_track_secs {
                debug!("Using loudnorm: target {} LUFS", self.settings.normalization.target_lufs);
            } else {
                debug!("Using dynaudnorm for long track ({})", track.formatted_duration());
            }
        }

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|why| QueueError::DecoderSpawnFailed(why.to_string()))?;

        let stderr = StderrTail::new(self.settings.stderr_tail_bytes);

        if let Some(mut pipe) = child.stderr.take() {
            let tail = stderr.clone();
            let title = track.title.clone();

            tokio::task::spawn_blocking(move || {
                let mut chunk = [0u8; 1024];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => tail.push(&chunk[..read]),
                    }
                }
                debug!("FFmpeg stderr closed for {title}");
            });
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(QueueError::DecoderSpawnFailed("FFmpeg stdout was not captured".to_string()));
            }
        };

        info!("FFmpeg started for {} (pid {})", track.title, child.id());

        Ok(DecodedStream {
            output: PcmStream::new(DecoderOutput::new(stdout, &track.title)),
            process: Box::new(FfmpegProcess {
                child: Some(child),
                stderr,
                title: track.title.clone(),
            }),
        })
    }
}

/// Turns a track into a decoded PCM stream: resolve, validate, spawn.
pub struct DecoderPipeline {
    resolver: Arc<dyn StreamResolver>,
    transcoder: Arc<dyn Transcoder>,
    resolve_timeout: Duration,
}

impl DecoderPipeline {
    pub fn new(resolver: Arc<dyn StreamResolver>, transcoder: Arc<dyn Transcoder>, settings: &Settings) -> Self {
        Self {
            resolver,
            transcoder,
            resolve_timeout: settings.resolve_timeout,
        }
    }

    /// Looks up the direct media URL for `track` and checks it is fetchable.
    pub async fn resolve(&self, track: &Track) -> QueueResult<String> {
        let resolved = tokio::time::timeout(self.resolve_timeout, self.resolver.resolve_direct_url(&track.url))
            .await
            .map_err(|_| QueueError::ResolutionFailed(format!("Timed out resolving {}", track.url)))??;

        let direct_url = resolved.trim();
        if direct_url.is_empty() || !direct_url.starts_with("http") {
            return Err(QueueError::ResolutionFailed("Resolver returned an invalid URL".to_string()));
        }

        debug!("Got direct audio URL: {}...", direct_url.chars().take(100).collect::<String>());

        Ok(direct_url.to_string())
    }

    /// Starts the decoder for a URL returned by [`DecoderPipeline::resolve`].
    pub fn spawn(&self, direct_url: &str, track: &Track) -> QueueResult<DecodedStream> {
        self.transcoder.spawn(direct_url, track)
    }
}
