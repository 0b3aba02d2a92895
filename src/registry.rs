use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::info;
use tracing_futures::Instrument;

use crate::config::Settings;
use crate::decoder::DecoderPipeline;
use crate::guild_queue::{GuildQueue, QueueNotice};
use crate::transport::VoiceTransport;

/// Owns at most one [`GuildQueue`] per guild.
pub struct QueueRegistry {
    settings: Arc<Settings>,
    transport: Arc<dyn VoiceTransport>,
    pipeline: Arc<DecoderPipeline>,
    notices: Option<UnboundedSender<QueueNotice>>,
    queues: RwLock<HashMap<u64, Arc<GuildQueue>>>,
}

impl QueueRegistry {
    pub fn new(
        settings: Arc<Settings>,
        transport: Arc<dyn VoiceTransport>,
        pipeline: Arc<DecoderPipeline>,
        notices: Option<UnboundedSender<QueueNotice>>,
    ) -> Self {
        Self {
            settings,
            transport,
            pipeline,
            notices,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the guild's queue, creating it on first use.
    pub async fn get(&self, guild_id: u64) -> Arc<GuildQueue> {
        if let Some(queue) = self.queues.read().await.get(&guild_id) {
            return queue.clone();
        }

        let mut queues = self.queues.write().await;
        queues
            .entry(guild_id)
            .or_insert_with(|| {
                info!("Creating queue for guild {guild_id}");
                GuildQueue::new(
                    guild_id,
                    self.settings.clone(),
                    self.transport.clone(),
                    self.pipeline.clone(),
                    self.notices.clone(),
                )
            })
            .clone()
    }

    /// Returns the queue only if one already exists.
    pub async fn existing(&self, guild_id: u64) -> Option<Arc<GuildQueue>> {
        self.queues.read().await.get(&guild_id).cloned()
    }

    /// Stops and forgets the guild's queue. Does nothing if there is none.
    pub async fn delete(&self, guild_id: u64) {
        let removed = self.queues.write().await.remove(&guild_id);

        if let Some(queue) = removed {
            info!("Deleting queue for guild {}", queue.guild_id());
            let span = queue.span();
            queue.stop().instrument(span).await;
        }
    }

    /// Stops every queue. Used on process shutdown.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<GuildQueue>> = self.queues.write().await.drain().map(|(_, queue)| queue).collect();

        info!("Shutting down {} queue(s)", queues.len());

        for queue in queues {
            let span = queue.span();
            queue.stop().instrument(span).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }
}
