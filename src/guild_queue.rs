use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Span};
use tracing_futures::Instrument;

use crate::config::Settings;
use crate::decoder::{DecodedStream, DecoderPipeline, DecoderProcess};
use crate::error::{QueueError, QueueResult};
use crate::models::Track;
use crate::retry::{RetryDecision, RetryLedger};
use crate::session::{PlaybackSession, PlayerStatus};
use crate::transport::{ConnectionNotifier, VoiceConnection, VoiceTransport};

/// Messages a guild queue emits for the chat layer.
#[derive(Debug, Clone)]
pub enum QueueNotice {
    NowPlaying { guild_id: u64, track: Track },
    TrackDropped { guild_id: u64, track: Track, reason: String },
    Disconnected { guild_id: u64, reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Inactivity,
    ConnectionLost,
}

/// Result of one attempt to move to the next track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Started,
    /// The queue was empty; the inactivity timer is armed.
    Drained,
    /// Another advance was in flight or a track is still active.
    Busy,
    NotConnected,
    RetryScheduled,
    Dropped,
    /// The queue was reset or switched channels while the track was being resolved.
    Abandoned,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayOutcome {
    /// 1-based queue position of the first added track.
    pub position: usize,
    pub added: usize,
    pub started: bool,
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub guild_id: u64,
    pub link: &'static str,
    pub channel_id: Option<u64>,
    pub status: PlayerStatus,
    pub current: Option<Track>,
    pub queued: usize,
    pub advancing: bool,
    pub awaiting_next: bool,
    pub retry_count: u32,
    pub retry_clear: bool,
    pub inactivity_armed: bool,
    pub decoder_live: bool,
}

enum Link {
    Disconnected,
    Connecting { channel_id: u64 },
    Connected(Arc<dyn VoiceConnection>),
}

struct InactivityTimer {
    seq: u64,
    handle: JoinHandle<()>,
}

struct GuildState {
    queue: VecDeque<Track>,
    current: Option<Track>,
    link: Link,
    session: PlaybackSession,
    decoder: Option<Box<dyn DecoderProcess>>,
    /// Single-flight guard for `advance_to_next`.
    advancing: bool,
    /// Set by an accepted end notification until the scheduled advance runs.
    awaiting_next: bool,
    retry: RetryLedger,
    inactivity: Option<InactivityTimer>,
    timer_seq: u64,
}

impl GuildState {
    fn cancel_inactivity(&mut self) {
        if let Some(timer) = self.inactivity.take() {
            debug!("Inactivity timer cancelled");
            timer.handle.abort();
        }
    }

    fn terminate_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.terminate();
        }
    }

    fn reset_flags(&mut self) {
        self.current = None;
        self.advancing = false;
        self.awaiting_next = false;
        self.retry.reset();
    }

    fn connected_channel(&self) -> Option<u64> {
        match &self.link {
            Link::Connected(connection) => Some(connection.channel_id()),
            _ => None,
        }
    }
}

/// Queue, voice connection and playback state for one guild.
pub struct GuildQueue {
    guild_id: u64,
    settings: Arc<Settings>,
    transport: Arc<dyn VoiceTransport>,
    pipeline: Arc<DecoderPipeline>,
    notices: Option<UnboundedSender<QueueNotice>>,
    this: Weak<GuildQueue>,
    state: Mutex<GuildState>,
}

impl GuildQueue {
    pub fn new(
        guild_id: u64,
        settings: Arc<Settings>,
        transport: Arc<dyn VoiceTransport>,
        pipeline: Arc<DecoderPipeline>,
        notices: Option<UnboundedSender<QueueNotice>>,
    ) -> Arc<Self> {
        let state = GuildState {
            queue: VecDeque::new(),
            current: None,
            link: Link::Disconnected,
            session: PlaybackSession::new(0),
            decoder: None,
            advancing: false,
            awaiting_next: false,
            retry: RetryLedger::new(settings.max_retries),
            inactivity: None,
            timer_seq: 0,
        };

        Arc::new_cyclic(|this| Self {
            guild_id,
            settings,
            transport,
            pipeline,
            notices,
            this: this.clone(),
            state: Mutex::new(state),
        })
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn span(&self) -> Span {
        info_span!("guild", id = self.guild_id)
    }

    /// Appends `track` and returns its 1-based position.
    pub async fn enqueue(&self, track: Track) -> QueueResult<usize> {
        let mut state = self.state.lock().await;

        if state.queue.len() >= self.settings.queue_max {
            return Err(QueueError::QueueFull(self.settings.queue_max));
        }

        info!("Added {} to queue, queue length: {}", track.title, state.queue.len() + 1);
        state.queue.push_back(track);
        state.cancel_inactivity();

        Ok(state.queue.len())
    }

    /// Enqueues `tracks` and starts playback in `channel_id`.
    ///
    /// Fails with `QueueFull` without enqueuing anything if the batch does not
    /// fit. If joining the channel fails, the tracks added here are taken back
    /// out before the error is returned.
    pub async fn enqueue_and_play(&self, tracks: Vec<Track>, channel_id: u64) -> QueueResult<PlayOutcome> {
        let position = {
            let mut state = self.state.lock().await;
            let available = self.settings.queue_max.saturating_sub(state.queue.len());

            if tracks.len() > available || available == 0 {
                return Err(QueueError::QueueFull(self.settings.queue_max));
            }

            let position = state.queue.len() + 1;
            state.queue.extend(tracks.iter().cloned());
            state.cancel_inactivity();

            info!("Added {} track(s) at position {position}", tracks.len());
            position
        };

        match self.play(channel_id).await {
            Ok(started) => Ok(PlayOutcome {
                position,
                added: tracks.len(),
                started,
            }),
            Err(why) if why.is_connection_error() => {
                self.retract(&tracks).await;
                Err(why)
            }
            Err(why) => Err(why),
        }
    }

    async fn retract(&self, tracks: &[Track]) {
        let mut state = self.state.lock().await;

        for track in tracks.iter().rev() {
            if let Some(index) = state.queue.iter().rposition(|queued| queued == track) {
                state.queue.remove(index);
            }
        }

        info!("Removed {} track(s) from queue after connection failure", tracks.len());
    }

    /// Ensures a connection to `channel_id` and starts playback if idle.
    ///
    /// Returns `true` only if this call started a track.
    pub async fn play(&self, channel_id: u64) -> QueueResult<bool> {
        info!("Play called for channel {channel_id}");

        let mut state = self.state.lock().await;

        let connected = match &state.link {
            Link::Connected(connection) => Some(connection.channel_id()),
            Link::Connecting { channel_id: pending } => {
                debug!("Connection to {pending} already in progress");
                return Ok(false);
            }
            Link::Disconnected => None,
        };

        let switched = match connected {
            Some(current) if current == channel_id => {
                debug!("Already connected to channel {channel_id}, skipping connection setup");

                let idle = state.current.is_none() && !state.queue.is_empty() && !state.advancing;
                drop(state);

                if idle {
                    return Ok(self.advance_to_next(None).await == Advance::Started);
                }
                return Ok(false);
            }
            Some(_) => {
                self.switch_channels(&mut state).await;
                true
            }
            None => false,
        };

        state.link = Link::Connecting { channel_id };
        let epoch = state.session.epoch();
        drop(state);

        if switched {
            tokio::time::sleep(self.settings.switch_settle_delay).await;
        }

        self.connect(channel_id, epoch).await
    }

    async fn switch_channels(&self, state: &mut GuildState) {
        info!("Switching channels");

        let saved = mem::take(&mut state.queue);

        state.terminate_decoder();

        if let Link::Connected(connection) = mem::replace(&mut state.link, Link::Disconnected) {
            connection.destroy().await;
        }

        state.session.rebuild();
        state.reset_flags();
        state.cancel_inactivity();

        state.queue = saved;
        info!("Moved to new channel with fresh player, keeping {} song(s) in queue", state.queue.len());
    }

    async fn connect(&self, channel_id: u64, epoch: u64) -> QueueResult<bool> {
        if !self.still_connecting(epoch).await {
            debug!("Queue was reset before connecting to {channel_id}");
            return Ok(false);
        }

        info!("Creating voice connection for channel {channel_id}");

        let notifier = ConnectionNotifier::new(self.this.clone(), epoch);
        let connection = match self.transport.open(self.guild_id, channel_id, notifier).await {
            Ok(connection) => connection,
            Err(why) => {
                error!("Failed to create voice connection: {why}");
                self.abandon_connecting(epoch).await;
                return Err(connection_error(why));
            }
        };

        let failure = match tokio::time::timeout(self.settings.connect_timeout, connection.ready()).await {
            Err(_) => Some(QueueError::ConnectionTimeout),
            Ok(Err(why)) => Some(connection_error(why)),
            Ok(Ok(())) => None,
        };

        if let Some(why) = failure {
            error!("Voice connection to {channel_id} failed: {why}");
            connection.destroy().await;
            self.abandon_connecting(epoch).await;
            return Err(why);
        }

        let mut state = self.state.lock().await;

        if state.session.epoch() != epoch || !matches!(state.link, Link::Connecting { .. }) {
            info!("Queue was reset while connecting, dropping the new connection");
            connection.destroy().await;
            return Ok(false);
        }

        state.session.attach(connection.clone());
        state.link = Link::Connected(connection);
        info!("Connection ready and player attached for channel {channel_id}");

        let idle = state.current.is_none() && !state.queue.is_empty();
        drop(state);

        if idle {
            info!("Starting playback");
            return Ok(self.advance_to_next(None).await == Advance::Started);
        }

        Ok(false)
    }

    async fn still_connecting(&self, epoch: u64) -> bool {
        let state = self.state.lock().await;
        state.session.epoch() == epoch && matches!(state.link, Link::Connecting { .. })
    }

    async fn abandon_connecting(&self, epoch: u64) {
        let mut state = self.state.lock().await;

        if state.session.epoch() == epoch && matches!(state.link, Link::Connecting { .. }) {
            state.link = Link::Disconnected;
        }
    }

    /// Dequeues the head and starts it. Concurrent calls collapse into one.
    ///
    /// `expected_epoch` is set by timer-driven triggers, which give up if the
    /// session was rebuilt after they were scheduled.
    pub(crate) async fn advance_to_next(&self, expected_epoch: Option<u64>) -> Advance {
        let mut state = self.state.lock().await;

        if expected_epoch.is_some_and(|epoch| epoch != state.session.epoch()) {
            debug!("Ignoring advance scheduled for a replaced session");
            return Advance::Stale;
        }

        if state.advancing {
            debug!("Already processing next song, skipping");
            return Advance::Busy;
        }

        if state.session.has_active() {
            debug!("A track is still active, skipping advance");
            return Advance::Busy;
        }

        if !state.session.is_attached() {
            debug!("No voice connection to play on");
            return Advance::NotConnected;
        }

        state.advancing = true;
        state.awaiting_next = false;

        let Some(track) = state.queue.pop_front() else {
            info!("No more songs in queue");
            state.current = None;
            state.advancing = false;
            self.arm_inactivity(&mut state);
            return Advance::Drained;
        };

        state.current = Some(track.clone());
        state.cancel_inactivity();
        state.terminate_decoder();

        let epoch = state.session.epoch();
        info!("Preparing to play: {} ({})", track.title, track.url);
        drop(state);

        let resolved = self.pipeline.resolve(&track).await;

        let mut state = self.state.lock().await;

        if state.session.epoch() != epoch {
            info!("Queue changed while resolving {}, discarding it", track.title);
            return Advance::Abandoned;
        }

        // The decoder is only spawned under the lock, after the epoch check.
        state.terminate_decoder();

        let started = match resolved.and_then(|direct_url| self.pipeline.spawn(&direct_url, &track)) {
            Ok(DecodedStream { mut process, output }) => {
                match state.session.start(output, self.this.clone()).await {
                    Ok(()) => {
                        state.decoder = Some(process);
                        Ok(())
                    }
                    Err(why) => {
                        process.terminate();
                        Err(why)
                    }
                }
            }
            Err(why) => Err(why),
        };

        match started {
            Ok(()) => {
                info!("Audio resource started playing: {}", track.title);
                state.retry.register_success(&track.url);
                state.advancing = false;
                self.notify(QueueNotice::NowPlaying {
                    guild_id: self.guild_id,
                    track,
                });
                Advance::Started
            }
            Err(why) => self.handle_failure(&mut state, track, why),
        }
    }

    fn handle_failure(&self, state: &mut GuildState, track: Track, why: QueueError) -> Advance {
        error!("Failed to play {} ({}): {why}", track.title, track.url);

        state.advancing = false;
        let epoch = state.session.epoch();

        match state.retry.register_failure(&track.url) {
            RetryDecision::Retry { attempt } => {
                info!("Requeueing {} for retry {attempt}/{}", track.title, self.settings.max_retries);
                state.queue.push_front(track);
                state.current = None;
                self.schedule_advance(self.settings.retry_delay, epoch);
                Advance::RetryScheduled
            }
            decision => {
                match decision {
                    RetryDecision::AlreadyRetried => info!("Song already retried, skipping {}", track.title),
                    _ => info!("Max retries reached, skipping {}", track.title),
                }

                state.current = None;
                self.notify(QueueNotice::TrackDropped {
                    guild_id: self.guild_id,
                    track,
                    reason: why.to_string(),
                });

                if !state.session.stop() {
                    self.schedule_advance(self.settings.idle_advance_delay, epoch);
                }

                Advance::Dropped
            }
        }
    }

    fn schedule_advance(&self, delay: Duration, epoch: u64) {
        let queue = self.this.clone();

        self.spawn_guild_task(async move {
            tokio::time::sleep(delay).await;

            if let Some(queue) = queue.upgrade() {
                queue.advance_to_next(Some(epoch)).await;
            }
        });
    }

    /// Handles a track's end notification from the transport.
    pub(crate) async fn on_track_end(&self, epoch: u64, track: u64) {
        let mut state = self.state.lock().await;

        if !state.session.is_current(epoch, track) {
            debug!("Ignoring stale end notification ({epoch}/{track})");
            return;
        }

        info!("Player idle");
        state.session.finish();
        state.terminate_decoder();

        if state.awaiting_next {
            return;
        }

        state.awaiting_next = true;
        self.schedule_advance(self.settings.idle_advance_delay, epoch);
    }

    /// Handles the transport reporting that the connection opened at `epoch` dropped.
    pub(crate) async fn on_connection_lost(&self, epoch: u64) {
        let mut state = self.state.lock().await;

        if state.session.epoch() != epoch || !matches!(state.link, Link::Connected(_)) {
            debug!("Ignoring disconnect for a replaced connection");
            return;
        }

        self.drop_connection(&mut state).await;
    }

    /// Handles the bot being removed from `channel_id` by someone else.
    pub async fn disconnected_from(&self, channel_id: u64) {
        let mut state = self.state.lock().await;

        if state.connected_channel() != Some(channel_id) {
            return;
        }

        self.drop_connection(&mut state).await;
    }

    async fn drop_connection(&self, state: &mut GuildState) {
        warn!("Voice connection lost, keeping {} song(s) in queue", state.queue.len());

        state.terminate_decoder();
        state.cancel_inactivity();
        state.session.rebuild();

        if let Link::Connected(connection) = mem::replace(&mut state.link, Link::Disconnected) {
            connection.destroy().await;
        }

        state.current = None;
        state.advancing = false;
        state.awaiting_next = false;

        self.notify(QueueNotice::Disconnected {
            guild_id: self.guild_id,
            reason: DisconnectReason::ConnectionLost,
        });
    }

    pub async fn skip(&self) -> bool {
        let mut state = self.state.lock().await;

        let Some(title) = state.current.as_ref().map(|track| track.title.clone()) else {
            return false;
        };

        if !state.session.stop() {
            return false;
        }

        info!("Skipping {title}");
        state.terminate_decoder();
        true
    }

    /// Clears the queue and releases the decoder, player and connection.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.reset(&mut state).await;
    }

    async fn reset(&self, state: &mut GuildState) {
        info!("Stopping music");

        state.queue.clear();
        state.reset_flags();
        state.cancel_inactivity();
        state.terminate_decoder();
        state.session.stop();
        state.session.rebuild();

        if let Link::Connected(connection) = mem::replace(&mut state.link, Link::Disconnected) {
            connection.destroy().await;
        }
    }

    fn arm_inactivity(&self, state: &mut GuildState) {
        state.cancel_inactivity();
        state.timer_seq += 1;

        let seq = state.timer_seq;
        let queue = self.this.clone();
        let timeout = self.settings.inactivity_timeout;

        let handle = self.spawn_guild_task(async move {
            tokio::time::sleep(timeout).await;

            if let Some(queue) = queue.upgrade() {
                queue.on_inactivity(seq).await;
            }
        });

        debug!("Inactivity timer armed for {}s", timeout.as_secs());
        state.inactivity = Some(InactivityTimer { seq, handle });
    }

    async fn on_inactivity(&self, seq: u64) {
        let mut state = self.state.lock().await;

        match &state.inactivity {
            Some(timer) if timer.seq == seq => state.inactivity = None,
            _ => return,
        }

        info!("Inactivity timeout reached. Disconnecting.");
        self.reset(&mut state).await;

        self.notify(QueueNotice::Disconnected {
            guild_id: self.guild_id,
            reason: DisconnectReason::Inactivity,
        });
    }

    pub async fn pause(&self) -> bool {
        let mut state = self.state.lock().await;
        state.current.is_some() && state.session.pause()
    }

    pub async fn resume(&self) -> bool {
        let mut state = self.state.lock().await;
        state.current.is_some() && state.session.resume()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.session.status() == PlayerStatus::Paused
    }

    pub async fn get_current(&self) -> Option<Track> {
        self.state.lock().await.current.clone()
    }

    pub async fn get_queued(&self) -> Vec<Track> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn available_slots(&self) -> usize {
        let state = self.state.lock().await;
        self.settings.queue_max.saturating_sub(state.queue.len())
    }

    pub async fn connected_channel(&self) -> Option<u64> {
        self.state.lock().await.connected_channel()
    }

    /// Randomly reorders the queued tracks and returns how many there are.
    pub async fn shuffle(&self) -> usize {
        let mut state = self.state.lock().await;
        state.queue.make_contiguous().shuffle(&mut thread_rng());
        state.queue.len()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;

        let (link, channel_id) = match &state.link {
            Link::Disconnected => ("disconnected", None),
            Link::Connecting { channel_id } => ("connecting", Some(*channel_id)),
            Link::Connected(connection) => ("connected", Some(connection.channel_id())),
        };

        QueueSnapshot {
            guild_id: self.guild_id,
            link,
            channel_id,
            status: state.session.status(),
            current: state.current.clone(),
            queued: state.queue.len(),
            advancing: state.advancing,
            awaiting_next: state.awaiting_next,
            retry_count: state.retry.count(),
            retry_clear: state.retry.is_clear(),
            inactivity_armed: state.inactivity.is_some(),
            decoder_live: state.decoder.is_some(),
        }
    }

    fn notify(&self, notice: QueueNotice) {
        if let Some(notices) = &self.notices {
            if notices.send(notice).is_err() {
                debug!("Notice receiver is gone");
            }
        }
    }

    fn spawn_guild_task<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(self.span()))
    }
}

fn connection_error(why: QueueError) -> QueueError {
    if why.is_connection_error() {
        why
    } else {
        QueueError::ConnectionFailed(why.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::sleep;

    use super::*;
    use crate::testing::{track, FakeTranscoder, FakeTransport, ScriptedResolver};

    struct Harness {
        queue: Arc<GuildQueue>,
        transport: Arc<FakeTransport>,
        resolver: Arc<ScriptedResolver>,
        transcoder: Arc<FakeTranscoder>,
        notices: UnboundedReceiver<QueueNotice>,
    }

    impl Harness {
        fn drain_notices(&mut self) -> Vec<QueueNotice> {
            let mut notices = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                notices.push(notice);
            }
            notices
        }
    }

    fn harness(settings: Settings) -> Harness {
        let settings = Arc::new(settings);
        let transport = Arc::new(FakeTransport::new());
        let resolver = Arc::new(ScriptedResolver::new());
        let transcoder = Arc::new(FakeTranscoder::new());
        let pipeline = Arc::new(DecoderPipeline::new(resolver.clone(), transcoder.clone(), &settings));
        let (sender, notices) = mpsc::unbounded_channel();

        let queue = GuildQueue::new(7, settings, transport.clone(), pipeline, Some(sender));

        Harness {
            queue,
            transport,
            resolver,
            transcoder,
            notices,
        }
    }

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|track| track.title.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_rejects_when_full() {
        let h = harness(Settings {
            queue_max: 3,
            ..Settings::default()
        });

        for (index, name) in ["a", "b", "c"].into_iter().enumerate() {
            assert_eq!(h.queue.enqueue(track(name)).await.unwrap(), index + 1);
        }

        assert!(matches!(h.queue.enqueue(track("d")).await, Err(QueueError::QueueFull(3))));
        assert!(matches!(
            h.queue.enqueue_and_play(vec![track("d")], 1).await,
            Err(QueueError::QueueFull(3))
        ));
        assert_eq!(h.queue.get_queued().await.len(), 3);
        assert_eq!(h.queue.available_slots().await, 0);
        assert!(h.transport.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_that_does_not_fit_is_rejected_whole() {
        let h = harness(Settings {
            queue_max: 3,
            ..Settings::default()
        });
        h.queue.enqueue(track("a")).await.unwrap();

        let result = h
            .queue
            .enqueue_and_play(vec![track("b"), track("c"), track("d")], 1)
            .await;

        assert!(matches!(result, Err(QueueError::QueueFull(3))));
        assert_eq!(titles(&h.queue.get_queued().await), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_order_and_skip_advances() {
        let mut h = harness(Settings::default());

        let outcome = h
            .queue
            .enqueue_and_play(vec![track("a"), track("b"), track("c")], 1)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PlayOutcome {
                position: 1,
                added: 3,
                started: true
            }
        );
        assert_eq!(h.queue.get_current().await, Some(track("a")));
        assert_eq!(titles(&h.queue.get_queued().await), ["b", "c"]);

        assert!(h.queue.skip().await);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert_eq!(titles(&h.queue.get_queued().await), ["c"]);
        assert_eq!(h.transcoder.live(), 1);
        assert_eq!(h.transcoder.max_live(), 1);

        let started: Vec<String> = h
            .drain_notices()
            .into_iter()
            .filter_map(|notice| match notice {
                QueueNotice::NowPlaying { track, .. } => Some(track.title),
                _ => None,
            })
            .collect();
        assert_eq!(started, ["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn play_on_connected_channel_does_not_restart() {
        let h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await.unwrap();

        let outcome = h.queue.enqueue_and_play(vec![track("c")], 1).await.unwrap();

        assert_eq!(outcome.position, 2);
        assert!(!outcome.started);
        assert_eq!(h.queue.get_current().await, Some(track("a")));
        assert_eq!(h.transport.connections().len(), 1);
        assert_eq!(h.transcoder.spawned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_track_is_retried_once_then_dropped() {
        let mut h = harness(Settings::default());
        h.resolver.always_fail(&track("a").url);

        let outcome = h
            .queue
            .enqueue_and_play(vec![track("a"), track("b")], 1)
            .await
            .unwrap();
        assert!(!outcome.started);
        assert_eq!(titles(&h.queue.get_queued().await), ["a", "b"]);

        sleep(Duration::from_secs(5)).await;

        assert_eq!(h.resolver.calls_for(&track("a").url), 2);
        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert!(h.queue.get_queued().await.is_empty());

        let snapshot = h.queue.snapshot().await;
        assert!(snapshot.retry_clear);
        assert!(!snapshot.advancing);

        assert!(h.drain_notices().iter().any(|notice| matches!(
            notice,
            QueueNotice::TrackDropped { track, .. } if track.title == "a"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let h = harness(Settings::default());
        h.resolver.fail_times(&track("a").url, 1);

        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();
        sleep(Duration::from_secs(3)).await;

        assert_eq!(h.queue.get_current().await, Some(track("a")));
        assert!(h.queue.snapshot().await.retry_clear);
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_spawn_failure_is_handled_like_resolution_failure() {
        let h = harness(Settings::default());
        h.transcoder.fail_spawns();

        h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await.unwrap();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(h.queue.get_current().await, None);
        assert!(h.queue.get_queued().await.is_empty());
        assert_eq!(h.transcoder.live(), 0);
        assert!(h.queue.snapshot().await.inactivity_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_channels_keeps_the_queue() {
        let h = harness(Settings::default());
        h.queue
            .enqueue_and_play(vec![track("a"), track("b"), track("c")], 1)
            .await
            .unwrap();

        let started = h.queue.play(2).await.unwrap();

        assert!(started);
        assert!(h.transport.connection(0).is_destroyed());
        assert_eq!(h.queue.connected_channel().await, Some(2));
        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert_eq!(titles(&h.queue.get_queued().await), ["c"]);
        assert_eq!(h.transcoder.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_notification_from_old_channel_is_ignored() {
        let h = harness(Settings::default());
        h.queue
            .enqueue_and_play(vec![track("a"), track("b"), track("c")], 1)
            .await
            .unwrap();
        let stale = h.transport.connection(0).last_notifier();

        h.queue.play(2).await.unwrap();
        stale.track_ended().await;
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert_eq!(titles(&h.queue.get_queued().await), ["c"]);
        assert!(!h.queue.snapshot().await.awaiting_next);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_switch_keeps_queue_and_clears_state() {
        let h = harness(Settings::default());
        h.queue
            .enqueue_and_play(vec![track("a"), track("b"), track("c")], 1)
            .await
            .unwrap();
        h.transport.hang(2);

        let result = h.queue.play(2).await;

        assert!(matches!(result, Err(QueueError::ConnectionTimeout)));
        assert_eq!(titles(&h.queue.get_queued().await), ["b", "c"]);
        assert_eq!(h.queue.get_current().await, None);
        assert!(h.transport.connection(0).is_destroyed());
        assert!(h.transport.connection(1).is_destroyed());
        assert_eq!(h.transcoder.live(), 0);

        let snapshot = h.queue.snapshot().await;
        assert_eq!(snapshot.link, "disconnected");
        assert!(snapshot.retry_clear);
        assert!(!snapshot.advancing);
        assert!(!snapshot.awaiting_next);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failure_takes_back_new_tracks() {
        let h = harness(Settings::default());
        h.queue.enqueue(track("x")).await.unwrap();
        h.transport.hang(1);

        let result = h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await;

        assert!(matches!(result, Err(QueueError::ConnectionTimeout)));
        assert_eq!(titles(&h.queue.get_queued().await), ["x"]);
        assert_eq!(h.queue.snapshot().await.link, "disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_a_connection_error() {
        let h = harness(Settings::default());
        h.transport.fail_open();

        let result = h.queue.enqueue_and_play(vec![track("a")], 1).await;

        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
        assert!(h.queue.get_queued().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_advances_collapse() {
        let h = harness(Settings::default());
        let gate = h.resolver.hold();
        h.queue.enqueue(track("a")).await.unwrap();
        h.queue.enqueue(track("b")).await.unwrap();

        let first = tokio::spawn({
            let queue = h.queue.clone();
            async move { queue.play(1).await }
        });
        sleep(Duration::from_millis(10)).await;

        assert_eq!(h.queue.advance_to_next(None).await, Advance::Busy);
        assert!(h.queue.snapshot().await.advancing);

        gate.notify_one();
        assert!(first.await.unwrap().unwrap());

        assert_eq!(h.resolver.total_calls(), 1);
        assert_eq!(h.queue.get_current().await, Some(track("a")));
        assert_eq!(titles(&h.queue.get_queued().await), ["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_during_resolve_never_runs_two_decoders() {
        let h = harness(Settings::default());
        let gate = h.resolver.hold();
        for name in ["a", "b", "c"] {
            h.queue.enqueue(track(name)).await.unwrap();
        }

        let first = tokio::spawn({
            let queue = h.queue.clone();
            async move { queue.play(1).await }
        });
        sleep(Duration::from_millis(10)).await;

        assert!(h.queue.play(2).await.unwrap());
        assert_eq!(h.transcoder.live(), 1);

        gate.notify_one();
        assert!(!first.await.unwrap().unwrap());

        assert_eq!(h.transcoder.spawned(), 1);
        assert_eq!(h.transcoder.live(), 1);
        assert_eq!(h.transcoder.max_live(), 1);
        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert_eq!(titles(&h.queue.get_queued().await), ["c"]);
        assert!(!h.queue.snapshot().await.advancing);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_resolve_discards_the_track() {
        let h = harness(Settings::default());
        let gate = h.resolver.hold();
        h.queue.enqueue(track("a")).await.unwrap();

        let first = tokio::spawn({
            let queue = h.queue.clone();
            async move { queue.play(1).await }
        });
        sleep(Duration::from_millis(10)).await;

        h.queue.stop().await;
        h.queue.enqueue(track("b")).await.unwrap();
        assert!(h.queue.play(1).await.unwrap());

        gate.notify_one();
        assert!(!first.await.unwrap().unwrap());

        assert_eq!(h.transcoder.spawned(), 1);
        assert_eq!(h.transcoder.max_live(), 1);
        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert!(h.queue.get_queued().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_scheduled_before_stop_is_dropped() {
        let h = harness(Settings::default());
        h.resolver.always_fail(&track("a").url);
        h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await.unwrap();
        let epoch = h.queue.state.lock().await.session.epoch();

        h.queue.stop().await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(h.resolver.total_calls(), 1);
        assert_eq!(h.queue.get_current().await, None);
        assert!(h.queue.get_queued().await.is_empty());
        assert_eq!(h.transcoder.spawned(), 0);
        assert_eq!(h.queue.advance_to_next(Some(epoch)).await, Advance::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_end_notification_advances_once() {
        let h = harness(Settings::default());
        h.queue
            .enqueue_and_play(vec![track("a"), track("b"), track("c")], 1)
            .await
            .unwrap();
        let notifier = h.transport.connection(0).last_notifier();

        notifier.track_ended().await;
        notifier.track_ended().await;
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.queue.get_current().await, Some(track("b")));
        assert_eq!(titles(&h.queue.get_queued().await), ["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_disconnects_after_timeout() {
        let mut h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();

        h.queue.skip().await;
        sleep(Duration::from_secs(2)).await;

        let snapshot = h.queue.snapshot().await;
        assert!(snapshot.inactivity_armed);
        assert_eq!(snapshot.current, None);
        assert_eq!(snapshot.link, "connected");

        sleep(Duration::from_secs(301)).await;

        assert!(h.transport.connection(0).is_destroyed());
        assert_eq!(h.queue.snapshot().await.link, "disconnected");
        assert!(h.drain_notices().iter().any(|notice| matches!(
            notice,
            QueueNotice::Disconnected {
                reason: DisconnectReason::Inactivity,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_cancels_inactivity() {
        let h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();
        h.queue.skip().await;
        sleep(Duration::from_secs(200)).await;

        h.queue.enqueue(track("b")).await.unwrap();
        sleep(Duration::from_secs(200)).await;

        assert!(!h.transport.connection(0).is_destroyed());
        assert!(!h.queue.snapshot().await.inactivity_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_keeps_queue_for_next_play() {
        let mut h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await.unwrap();

        h.transport.notifier(0).connection_lost().await;

        assert_eq!(h.queue.get_current().await, None);
        assert_eq!(titles(&h.queue.get_queued().await), ["b"]);
        assert_eq!(h.queue.connected_channel().await, None);
        assert_eq!(h.transcoder.live(), 0);
        assert!(h.drain_notices().iter().any(|notice| matches!(
            notice,
            QueueNotice::Disconnected {
                reason: DisconnectReason::ConnectionLost,
                ..
            }
        )));

        assert!(h.queue.play(1).await.unwrap());
        assert_eq!(h.queue.get_current().await, Some(track("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_cancels_inactivity() {
        let mut h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();
        h.queue.skip().await;
        sleep(Duration::from_secs(2)).await;
        assert!(h.queue.snapshot().await.inactivity_armed);

        h.transport.notifier(0).connection_lost().await;

        assert!(!h.queue.snapshot().await.inactivity_armed);

        sleep(Duration::from_secs(400)).await;

        let disconnects: Vec<DisconnectReason> = h
            .drain_notices()
            .into_iter()
            .filter_map(|notice| match notice {
                QueueNotice::Disconnected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(disconnects, [DisconnectReason::ConnectionLost]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_from_other_channel_is_ignored() {
        let h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();

        h.queue.disconnected_from(2).await;
        assert_eq!(h.queue.connected_channel().await, Some(1));

        h.queue.disconnected_from(1).await;
        assert_eq!(h.queue.connected_channel().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume() {
        let h = harness(Settings::default());
        assert!(!h.queue.pause().await);

        h.queue.enqueue_and_play(vec![track("a")], 1).await.unwrap();

        assert!(!h.queue.resume().await);
        assert!(h.queue.pause().await);
        assert!(h.queue.is_paused().await);
        assert!(!h.queue.pause().await);
        assert!(h.queue.resume().await);
        assert!(!h.queue.is_paused().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_releases_everything() {
        let h = harness(Settings::default());
        h.queue.enqueue_and_play(vec![track("a"), track("b")], 1).await.unwrap();

        h.queue.stop().await;
        h.queue.stop().await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(h.queue.get_current().await, None);
        assert!(h.queue.get_queued().await.is_empty());
        assert!(h.transport.connection(0).is_destroyed());
        assert_eq!(h.transcoder.live(), 0);
        assert_eq!(h.transcoder.spawned(), 1);

        assert!(!h.queue.play(1).await.unwrap());
        assert_eq!(h.transport.connections().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shuffle_keeps_every_track() {
        let h = harness(Settings::default());
        for name in ["a", "b", "c", "d"] {
            h.queue.enqueue(track(name)).await.unwrap();
        }

        assert_eq!(h.queue.shuffle().await, 4);

        let mut queued = titles(&h.queue.get_queued().await)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        queued.sort();
        assert_eq!(queued, ["a", "b", "c", "d"]);
    }
}
