use std::sync::Arc;

use async_trait::async_trait;
use songbird::error::{JoinError, TrackError};
use songbird::id::{ChannelId, GuildId};
use songbird::input::{Codec, Container, Input, Reader};
use songbird::tracks::TrackHandle;
use songbird::{Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::decoder::PcmStream;
use crate::error::{QueueError, QueueResult};
use crate::session::SessionNotifier;
use crate::transport::{ConnectionNotifier, TrackControl, VoiceConnection, VoiceTransport};

/// Voice transport backed by the songbird manager registered with the gateway client.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    volume: f32,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, volume: f32) -> Self {
        Self { manager, volume }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn open(
        &self,
        guild_id: u64,
        channel_id: u64,
        notifier: ConnectionNotifier,
    ) -> QueueResult<Arc<dyn VoiceConnection>> {
        let call = self.manager.get_or_insert(GuildId(guild_id));

        let join = {
            let mut handler = call.lock().await;

            handler.remove_all_global_events();
            handler.add_global_event(Event::Core(CoreEvent::DriverDisconnect), DisconnectNotifier { notifier });

            handler.join(ChannelId(channel_id)).await.map_err(join_error)?
        };

        Ok(Arc::new(SongbirdConnection {
            guild_id,
            channel_id,
            manager: self.manager.clone(),
            call,
            join: Mutex::new(Some(join)),
            volume: self.volume,
        }))
    }
}

pub struct SongbirdConnection {
    guild_id: u64,
    channel_id: u64,
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    join: Mutex<Option<songbird::join::Join>>,
    volume: f32,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel_id(&self) -> u64 {
        self.channel_id
    }

    async fn ready(&self) -> QueueResult<()> {
        let join = self.join.lock().await.take();

        if let Some(join) = join {
            join.await.map_err(join_error)?;
            info!("Connection is ready in channel {}", self.channel_id);
        }

        let mut handler = self.call.lock().await;

        if handler.is_deaf() {
            debug!("Already deafened");
        } else if let Err(why) = handler.deafen(true).await {
            info!("Deafen failed due to {why:?}");
        }

        Ok(())
    }

    async fn play(&self, stream: PcmStream, notifier: SessionNotifier) -> QueueResult<Box<dyn TrackControl>> {
        let source = Input::new(true, Reader::Extension(stream.into_reader()), Codec::Pcm, Container::Raw, None);

        let handle = {
            let mut handler = self.call.lock().await;
            handler.stop();
            handler.play_source(source)
        };

        handle.set_volume(self.volume).map_err(track_error)?;
        handle
            .add_event(Event::Track(TrackEvent::End), TrackEndNotifier { notifier })
            .map_err(track_error)?;

        Ok(Box::new(SongbirdTrack { handle }))
    }

    async fn destroy(&self) {
        let owns_call = self
            .manager
            .get(GuildId(self.guild_id))
            .map_or(false, |current| Arc::ptr_eq(&current, &self.call));

        if owns_call {
            if let Err(why) = self.manager.remove(GuildId(self.guild_id)).await {
                debug!("Voice connection was already gone: {why:?}");
            }
            return;
        }

        let mut handler = self.call.lock().await;
        handler.remove_all_global_events();
        if let Err(why) = handler.leave().await {
            debug!("Leaving replaced call failed: {why:?}");
        }
    }
}

struct SongbirdTrack {
    handle: TrackHandle,
}

impl TrackControl for SongbirdTrack {
    fn pause(&self) -> QueueResult<()> {
        self.handle.pause().map_err(track_error)
    }

    fn resume(&self) -> QueueResult<()> {
        self.handle.play().map_err(track_error)
    }

    fn stop(&self) -> QueueResult<()> {
        self.handle.stop().map_err(track_error)
    }
}

struct TrackEndNotifier {
    notifier: SessionNotifier,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!("End notifier triggered");
        self.notifier.spawn_track_ended();

        None
    }
}

struct DisconnectNotifier {
    notifier: ConnectionNotifier,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        warn!("Voice driver disconnected");

        let notifier = self.notifier.clone();
        tokio::spawn(async move { notifier.connection_lost().await });

        None
    }
}

fn join_error(why: JoinError) -> QueueError {
    match why {
        JoinError::TimedOut => QueueError::ConnectionTimeout,
        other => QueueError::ConnectionFailed(other.to_string()),
    }
}

fn track_error(why: TrackError) -> QueueError {
    QueueError::Playback(why.to_string())
}
