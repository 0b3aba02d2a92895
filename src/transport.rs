use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;
use tracing_futures::Instrument;

use crate::decoder::PcmStream;
use crate::error::QueueResult;
use crate::guild_queue::GuildQueue;
use crate::session::SessionNotifier;

/// Controls the single track currently fed into a connection.
pub trait TrackControl: Send + Sync {
    fn pause(&self) -> QueueResult<()>;

    fn resume(&self) -> QueueResult<()>;

    /// Stops the track. The transport reports the end through the track's notifier.
    fn stop(&self) -> QueueResult<()>;
}

/// One attachment to one voice channel.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> u64;

    /// Resolves once the handshake completes. Callers bound this with a timeout.
    async fn ready(&self) -> QueueResult<()>;

    /// Starts `stream` on this connection, replacing whatever was playing.
    async fn play(&self, stream: PcmStream, notifier: SessionNotifier) -> QueueResult<Box<dyn TrackControl>>;

    async fn destroy(&self);
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Begins joining `channel_id` and returns the half-open handle.
    async fn open(
        &self,
        guild_id: u64,
        channel_id: u64,
        notifier: ConnectionNotifier,
    ) -> QueueResult<Arc<dyn VoiceConnection>>;
}

/// Reports transport-level disconnects back to the queue that opened the connection.
#[derive(Clone)]
pub struct ConnectionNotifier {
    queue: Weak<GuildQueue>,
    epoch: u64,
}

impl ConnectionNotifier {
    pub fn new(queue: Weak<GuildQueue>, epoch: u64) -> Self {
        Self { queue, epoch }
    }

    pub async fn connection_lost(&self) {
        match self.queue.upgrade() {
            Some(queue) => {
                let span = queue.span();
                queue.on_connection_lost(self.epoch).instrument(span).await
            }
            None => debug!("Connection lost after its queue was dropped"),
        }
    }
}
