use std::sync::{Arc, Weak};

use tracing::{debug, warn};
use tracing_futures::Instrument;

use crate::decoder::PcmStream;
use crate::error::{QueueError, QueueResult};
use crate::guild_queue::GuildQueue;
use crate::transport::{TrackControl, VoiceConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
}

/// Carries a track's end notification back to the queue that started it.
///
/// The epoch identifies the session and `track` the start within it, so a
/// notification from a replaced session or an earlier track is recognised as stale.
#[derive(Clone)]
pub struct SessionNotifier {
    queue: Weak<GuildQueue>,
    epoch: u64,
    track: u64,
}

impl SessionNotifier {
    pub fn spawn_track_ended(&self) {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.track_ended().await });
    }

    pub async fn track_ended(&self) {
        match self.queue.upgrade() {
            Some(queue) => {
                let span = queue.span();
                queue.on_track_end(self.epoch, self.track).instrument(span).await
            }
            None => debug!("Track ended after its queue was dropped"),
        }
    }
}

struct ActiveTrack {
    seq: u64,
    control: Box<dyn TrackControl>,
}

/// Binds decoded audio to a connection's sink for one guild.
///
/// A session is never reattached to a different connection: switching
/// channels or stopping replaces it through [`PlaybackSession::rebuild`].
pub struct PlaybackSession {
    epoch: u64,
    sink: Option<Arc<dyn VoiceConnection>>,
    active: Option<ActiveTrack>,
    status: PlayerStatus,
    next_seq: u64,
}

impl PlaybackSession {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            sink: None,
            active: None,
            status: PlayerStatus::Idle,
            next_seq: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn status(&self) -> PlayerStatus {
        self.status
    }

    /// Whether a started track has not yet reported its end.
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    pub fn attach(&mut self, sink: Arc<dyn VoiceConnection>) {
        self.sink = Some(sink);
    }

    /// Drops the sink and any active track and moves to a new epoch, so no
    /// notification wired before the rebuild is accepted afterwards.
    pub fn rebuild(&mut self) {
        *self = PlaybackSession::new(self.epoch + 1);
    }

    pub async fn start(&mut self, stream: PcmStream, queue: Weak<GuildQueue>) -> QueueResult<()> {
        let sink = self.sink.clone().ok_or(QueueError::NotConnected)?;

        self.next_seq += 1;
        let notifier = SessionNotifier {
            queue,
            epoch: self.epoch,
            track: self.next_seq,
        };

        let control = sink.play(stream, notifier).await?;

        self.active = Some(ActiveTrack {
            seq: self.next_seq,
            control,
        });
        self.status = PlayerStatus::Playing;

        Ok(())
    }

    /// Whether an end notification for `(epoch, track)` refers to the active track.
    pub fn is_current(&self, epoch: u64, track: u64) -> bool {
        self.epoch == epoch && self.active.as_ref().map(|active| active.seq) == Some(track)
    }

    /// Forgets the active track after its end notification was accepted.
    pub fn finish(&mut self) {
        self.active = None;
        self.status = PlayerStatus::Idle;
    }

    pub fn pause(&mut self) -> bool {
        if self.status != PlayerStatus::Playing {
            return false;
        }

        match self.active.as_ref().map(|active| active.control.pause()) {
            Some(Ok(())) => {
                self.status = PlayerStatus::Paused;
                true
            }
            Some(Err(why)) => {
                warn!("Pause failed: {why}");
                false
            }
            None => false,
        }
    }

    pub fn resume(&mut self) -> bool {
        if self.status != PlayerStatus::Paused {
            return false;
        }

        match self.active.as_ref().map(|active| active.control.resume()) {
            Some(Ok(())) => {
                self.status = PlayerStatus::Playing;
                true
            }
            Some(Err(why)) => {
                warn!("Resume failed: {why}");
                false
            }
            None => false,
        }
    }

    /// Stops the active track. Its end notification stays valid, so the
    /// queue still advances once the transport reports the end.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };

        if self.status == PlayerStatus::Idle {
            return false;
        }
        self.status = PlayerStatus::Idle;

        if let Err(why) = active.control.stop() {
            warn!("Stop failed: {why}");
        }

        true
    }
}
