use std::cmp::min;
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            Args, CommandResult, DispatchError,
            macros::{command, group, hook},
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
    Result as SerenityResult,
};
use serenity::client::Context;
use serenity::framework::standard::CommandError;
use serenity::http::Http;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, UserId};
use serenity::model::prelude::{GuildId, VoiceState};
use songbird::{SerenityInit, Songbird};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::classifier::classify;
use crate::config::Settings;
use crate::decoder::{DecoderPipeline, FfmpegTranscoder};
use crate::error::QueueError;
use crate::guild_queue::{DisconnectReason, QueueNotice};
use crate::models::Track;
use crate::registry::QueueRegistry;
use crate::resolver::{StreamResolver, YtDlp};
use crate::voice::SongbirdTransport;

mod classifier;
mod config;
mod decoder;
mod error;
mod guild_queue;
mod models;
mod registry;
mod resolver;
mod retry;
mod session;
#[cfg(test)]
mod testing;
mod transport;
mod voice;

struct Handler;

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

pub struct JukeboxMap;

/// Shared services handed to every command.
pub struct Jukebox {
    pub settings: Arc<Settings>,
    pub registry: Arc<QueueRegistry>,
    pub resolver: Arc<dyn StreamResolver>,
    /// Text channel each guild last issued a command from, where notices are posted.
    pub announce_channels: Arc<RwLock<HashMap<u64, ChannelId>>>,
}

impl serenity::prelude::TypeMapKey for JukeboxMap {
    type Value = Arc<Jukebox>;
}

const QUEUE_PAGE_SIZE: usize = 20;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let (Some(bot_id), Some(guild_id)) = (get_bot_id(&ctx).await, new.guild_id) else {
            return;
        };

        let Ok(jukebox) = get_jukebox(&ctx).await else {
            return;
        };

        let Some(queue) = jukebox.registry.existing(guild_id.0).await else {
            return;
        };

        let old_channel = old.and_then(|state| state.channel_id);

        if new.user_id.0 == bot_id {
            if new.channel_id.is_none() {
                info!("Bot was disconnected from voice in guild {}", guild_id.0);

                let channel = match old_channel {
                    Some(channel) => Some(channel.0),
                    None => queue.connected_channel().await,
                };

                if let Some(channel) = channel {
                    queue.disconnected_from(channel).await;
                }
            }

            return;
        }

        let Some(left) = old_channel.filter(|channel| new.channel_id != Some(*channel)) else {
            return;
        };

        if queue.connected_channel().await != Some(left.0) {
            return;
        }

        let listeners = ctx
            .cache
            .guild(guild_id)
            .map(|guild| count_listeners(&guild, left, bot_id))
            .unwrap_or(0);

        if listeners == 0 {
            info!("Everyone left channel {} in guild {}, stopping", left.0, guild_id.0);

            queue.stop().await;
            announce(&ctx.http, &jukebox, guild_id.0, "Everyone left the voice channel, so I stopped the music.").await;
        }
    }
}

fn count_listeners(guild: &Guild, channel: ChannelId, bot_id: u64) -> usize {
    guild
        .voice_states
        .values()
        .filter(|state| state.channel_id == Some(channel))
        .filter(|state| state.user_id.0 != bot_id)
        .filter(|state| !state.member.as_ref().map_or(false, |member| member.user.bot))
        .count()
}

#[group]
#[commands(play, playlist, skip, stop, pause, resume, queue, nowplaying, shuffle, cleanup, debug, help)]
struct General;

#[hook]
async fn after(_ctx: &Context, msg: &Message, command_name: &str, command_result: CommandResult) {
    if let Err(why) = command_result {
        warn!("Command '{command_name}' from {} failed: {why:?}", msg.author.name);
    }
}

#[hook]
async fn dispatch_error(ctx: &Context, msg: &Message, error: DispatchError, command_name: &str) {
    if let DispatchError::Ratelimited(info) = error {
        if info.is_first_try {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("Slow down! Try `{command_name}` again in {} seconds.", info.rate_limit.as_secs().max(1)))
                    .await,
            );
        }
    } else {
        debug!("Dispatch error for '{command_name}': {error:?}");
    }
}

#[tokio::main]
async fn main() {
    let env_file = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if env_file.is_err() {
        info!(".env file not found, using the process environment");
    }

    // Configure the client with your Discord bot token in the environment.
    let token = env::var("DISCORD_TOKEN")
        .expect("Expected a token in the environment");

    let settings = Arc::new(Settings::from_env().expect("Invalid configuration"));

    let framework = StandardFramework::new()
        .configure(|c| {
            c.prefix(&settings.command_prefix)
        })
        .bucket("playback", |b| b.delay(settings.command_cooldown_secs))
        .await
        .after(after)
        .on_dispatch_error(dispatch_error)
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();

    let resolver: Arc<dyn StreamResolver> = Arc::new(YtDlp::new(&settings));
    let pipeline = Arc::new(DecoderPipeline::new(
        resolver.clone(),
        Arc::new(FfmpegTranscoder::new(settings.clone())),
        &settings,
    ));
    let transport = Arc::new(SongbirdTransport::new(songbird.clone(), settings.volume));

    let (notices, notice_receiver) = mpsc::unbounded_channel();
    let registry = Arc::new(QueueRegistry::new(settings.clone(), transport, pipeline, Some(notices)));

    let jukebox = Arc::new(Jukebox {
        settings: settings.clone(),
        registry: registry.clone(),
        resolver,
        announce_channels: Arc::new(RwLock::new(HashMap::new())),
    });

    let mut client = Client::builder(&token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(songbird)
        .await
        .expect("Err creating client");

    {
        let mut w = client.data.write().await;
        w.insert::<JukeboxMap>(jukebox.clone());
    }

    tokio::spawn(relay_notices(notice_receiver, client.cache_and_http.http.clone(), jukebox));

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");

    registry.shutdown().await;
}

/// Posts queue notices to the text channel each guild last used.
async fn relay_notices(mut notices: UnboundedReceiver<QueueNotice>, http: Arc<Http>, jukebox: Arc<Jukebox>) {
    while let Some(notice) = notices.recv().await {
        let (guild_id, text) = match notice {
            QueueNotice::NowPlaying { guild_id, track } => (guild_id, format!("🎶 Now playing: {}", describe(&track))),
            QueueNotice::TrackDropped { guild_id, track, reason } => {
                (guild_id, format!("Skipping **{}**, it could not be played: {reason}", track.title))
            }
            QueueNotice::Disconnected { guild_id, reason: DisconnectReason::Inactivity } => {
                (guild_id, "Left the voice channel due to inactivity.".to_string())
            }
            QueueNotice::Disconnected { guild_id, reason: DisconnectReason::ConnectionLost } => (
                guild_id,
                "Lost the voice connection. The queue was kept, use play to continue.".to_string(),
            ),
        };

        announce(&http, &jukebox, guild_id, text).await;
    }
}

async fn announce(http: &Arc<Http>, jukebox: &Jukebox, guild_id: u64, text: impl std::fmt::Display) {
    let channel = jukebox.announce_channels.read().await.get(&guild_id).copied();

    match channel {
        Some(channel) => check_msg(channel.say(http, text).await),
        None => debug!("No text channel known for guild {guild_id}"),
    }
}

fn describe(track: &Track) -> String {
    format!(
        "**[{}]({})** `{}` requested by {}",
        track.title,
        track.url,
        track.formatted_duration(),
        track.requested_by
    )
}

#[command]
#[only_in(guilds)]
#[bucket = "playback"]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    with_reaction(ctx, msg, play_song(ctx, msg, args.message().trim())).await
}

#[command]
#[only_in(guilds)]
#[bucket = "playback"]
async fn playlist(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    with_reaction(ctx, msg, play_playlist(ctx, msg, args.message().trim())).await
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let prefix = get_jukebox(ctx).await?.settings.command_prefix.clone();

    let message = format!(
        r#"
**Commands:**
    **{prefix}play [URL|Title]** - Plays (or adds to the queue) a track given a YouTube/SoundCloud URL or a search query.
    **{prefix}playlist [URL]** - Adds every track of a YouTube playlist or SoundCloud set to the queue.
    **{prefix}skip** - Skips the current track (stops if nothing else is queued).
    **{prefix}stop** - Stops the current track, clears the queue and leaves the voice channel.
    **{prefix}pause** - Pauses the current track.
    **{prefix}resume** - Resumes the currently paused track.
    **{prefix}queue** - Shows the queue of tracks.
    **{prefix}nowplaying** - Shows the current track.
    **{prefix}shuffle** - Reorders the queue randomly.
    **{prefix}cleanup** - Resets the player for this server.
    **{prefix}debug** - Shows the player state.
    "#
    );

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn with_reaction<F>(ctx: &Context, msg: &Message, action: F) -> CommandResult
where
    F: Future<Output = CommandResult>,
{
    let bot_id = get_bot_id(ctx).await;

    let loading_emoji = Unicode("⏳".to_string());

    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let result = action.await;

    if let Some(bot_id) = bot_id {
        msg.channel_id.delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji).await?;
    }

    let answer_emoji = match result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    result
}

async fn play_song(ctx: &Context, msg: &Message, user_input: &str) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let voice_channel = get_voice_channel(ctx, msg).await?;

    if user_input.is_empty() {
        check_msg(msg.reply(ctx, "Please provide a URL or a search query.").await);

        return Err(CommandError::from("Missing play input"));
    }

    info!("User input is {user_input}");

    let jukebox = get_jukebox(ctx).await?;
    remember_channel(&jukebox, guild_id, msg.channel_id).await;

    let classification = classify(user_input);

    if classification.is_playlist {
        info!("Detected playlist {:?} in {user_input}", classification.playlist_id);

        return queue_playlist(ctx, msg, &jukebox, guild_id, voice_channel, user_input).await;
    }

    let info = match classification.url.as_deref().filter(|_| classification.is_url) {
        Some(url) => {
            debug!("Resolving {} link {url} (track {:?})", classification.platform, classification.track_id);
            jukebox.resolver.resolve_metadata(url).await
        }
        None => jukebox.resolver.search(user_input).await.and_then(|found| {
            found.ok_or_else(|| QueueError::ResolutionFailed(format!("No results for {user_input}")))
        }),
    };

    let info = match info {
        Ok(info) => info,
        Err(why) => {
            check_msg(msg.channel_id.say(&ctx.http, format!("Could not load song for input {user_input}")).await);

            return Err(why.into());
        }
    };

    let track = info.into_track(&msg.author.name, classification.platform);
    let queue = jukebox.registry.get(guild_id.0).await;

    match queue.enqueue_and_play(vec![track.clone()], voice_channel.0).await {
        Ok(outcome) => {
            if !outcome.started {
                check_msg(
                    msg.channel_id
                        .say(&ctx.http, format!("Added to queue at position {}: {}", outcome.position, describe(&track)))
                        .await,
                );
            }

            Ok(())
        }
        Err(why) => {
            check_msg(msg.channel_id.say(&ctx.http, why.to_string()).await);

            Err(why.into())
        }
    }
}

async fn play_playlist(ctx: &Context, msg: &Message, user_input: &str) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let voice_channel = get_voice_channel(ctx, msg).await?;

    let jukebox = get_jukebox(ctx).await?;
    remember_channel(&jukebox, guild_id, msg.channel_id).await;

    if !classify(user_input).is_playlist {
        check_msg(msg.reply(ctx, "That doesn't look like a playlist link.").await);

        return Err(CommandError::from("Not a playlist"));
    }

    queue_playlist(ctx, msg, &jukebox, guild_id, voice_channel, user_input).await
}

async fn queue_playlist(
    ctx: &Context,
    msg: &Message,
    jukebox: &Jukebox,
    guild_id: GuildId,
    voice_channel: ChannelId,
    user_input: &str,
) -> CommandResult {
    let classification = classify(user_input);
    let url = classification.url.as_deref().unwrap_or(user_input);

    let infos = match jukebox.resolver.resolve_playlist(url, classification.platform).await {
        Ok(infos) if !infos.is_empty() => infos,
        Ok(_) => {
            check_msg(msg.channel_id.say(&ctx.http, "No playable tracks found in that playlist.").await);

            return Err(CommandError::from("Empty playlist"));
        }
        Err(why) => {
            check_msg(msg.channel_id.say(&ctx.http, format!("Could not load playlist {user_input}")).await);

            return Err(why.into());
        }
    };

    let queue = jukebox.registry.get(guild_id.0).await;
    let limit = min(jukebox.settings.playlist_max, queue.available_slots().await);

    if limit == 0 {
        let full = QueueError::QueueFull(jukebox.settings.queue_max);
        check_msg(msg.channel_id.say(&ctx.http, full.to_string()).await);

        return Err(full.into());
    }

    let total = infos.len();
    let tracks: Vec<Track> = infos
        .into_iter()
        .take(limit)
        .map(|info| info.into_track(&msg.author.name, classification.platform))
        .collect();
    let added = tracks.len();

    match queue.enqueue_and_play(tracks, voice_channel.0).await {
        Ok(_) => {
            let mut reply = format!("Added {added} tracks from the playlist to the queue.");
            if added < total {
                reply.push_str(&format!(" {} tracks were left out because of the queue limit.", total - added));
            }

            check_msg(msg.channel_id.say(&ctx.http, reply).await);

            Ok(())
        }
        Err(why) => {
            check_msg(msg.channel_id.say(&ctx.http, why.to_string()).await);

            Err(why.into())
        }
    }
}

#[command]
#[only_in(guilds)]
#[bucket = "playback"]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    info!("SKIP - Skip command invoked from guild {}!", guild_id.0);

    let Some(queue) = jukebox.registry.existing(guild_id.0).await else {
        check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing.").await);

        return Ok(());
    };

    let Some(current) = queue.get_current().await else {
        check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing.").await);

        return Ok(());
    };

    if queue.get_queued().await.is_empty() {
        info!("SKIP - Nothing queued after {}, stopping", current.title);

        queue.stop().await;
        check_msg(msg.channel_id.say(&ctx.http, "Skipped. The queue is empty, so I stopped.").await);

        return Ok(());
    }

    if queue.skip().await {
        check_msg(msg.channel_id.say(&ctx.http, format!("Skipped **{}**", current.title)).await);
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[bucket = "playback"]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    match jukebox.registry.existing(guild_id.0).await {
        Some(queue) if queue.connected_channel().await.is_some() => {
            queue.stop().await;
            check_msg(msg.channel_id.say(&ctx.http, "Stopped the music and cleared the queue.").await);
        }
        Some(queue) => {
            queue.stop().await;
            check_msg(msg.reply(ctx, "Not in a voice channel").await);
        }
        None => check_msg(msg.reply(ctx, "Not in a voice channel").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    let paused = match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => queue.pause().await,
        None => false,
    };

    if paused {
        check_msg(msg.channel_id.say(&ctx.http, "Paused.").await);
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing.").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("unpause")]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    let resumed = match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => queue.resume().await,
        None => false,
    };

    if resumed {
        check_msg(msg.channel_id.say(&ctx.http, "Resumed.").await);
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "Nothing is paused.").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    let (current, songs) = match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => (queue.get_current().await, queue.get_queued().await),
        None => (None, Vec::new()),
    };

    if current.is_none() && songs.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "The queue is empty!").await);

        return Ok(());
    }

    let mut reply = String::new();

    if let Some(current) = current {
        reply.push_str(&format!("**Now playing**: {}\n", describe(&current)));
    }

    if !songs.is_empty() {
        let songs_titles: Vec<String> = songs
            .iter()
            .take(QUEUE_PAGE_SIZE)
            .enumerate()
            .map(|(index, song)| format!("{} - {} [{}]", index + 1, song.title, song.formatted_duration()))
            .collect();

        reply.push_str(&format!("**Queue**:\n```{}```", songs_titles.join("\n")));

        if songs.len() > QUEUE_PAGE_SIZE {
            reply.push_str(&format!("...and {} more", songs.len() - QUEUE_PAGE_SIZE));
        }
    }

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("np")]
async fn nowplaying(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    let (current, paused) = match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => (queue.get_current().await, queue.is_paused().await),
        None => (None, false),
    };

    match current {
        Some(track) => {
            let state = if paused { "⏸️ Paused" } else { "🎶 Now playing" };
            check_msg(msg.channel_id.say(&ctx.http, format!("{state}: {} on {}", describe(&track), track.platform)).await);
        }
        None => check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing.").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    info!("Shuffle - Shuffle command invoked from guild {}!", guild_id.0);

    let shuffled = match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => queue.shuffle().await,
        None => 0,
    };

    if shuffled > 1 {
        msg.react(&ctx.http, Unicode("👍".to_string())).await?;
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "Not enough songs in the queue to shuffle.").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn cleanup(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    jukebox.registry.delete(guild_id.0).await;
    jukebox.announce_channels.write().await.remove(&guild_id.0);

    check_msg(msg.channel_id.say(&ctx.http, "Player reset for this server.").await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn debug(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let jukebox = get_jukebox(ctx).await?;

    match jukebox.registry.existing(guild_id.0).await {
        Some(queue) => {
            let snapshot = queue.snapshot().await;
            let players = jukebox.registry.len().await;
            check_msg(msg.channel_id.say(&ctx.http, format!("```{snapshot:#?}```Active players: {players}")).await);
        }
        None => check_msg(msg.channel_id.say(&ctx.http, "No player exists for this server.").await),
    }

    Ok(())
}

async fn remember_channel(jukebox: &Jukebox, guild_id: GuildId, channel_id: ChannelId) {
    jukebox.announce_channels.write().await.insert(guild_id.0, channel_id);
}

async fn get_voice_channel(ctx: &Context, msg: &Message) -> CommandResult<ChannelId> {
    let channel_id = get_guild(ctx, msg)?
        .voice_states.get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    match channel_id {
        Some(channel) => Ok(channel),
        None => {
            check_msg(msg.reply(ctx, "You need to be in a voice channel to play music!").await);

            Err(CommandError::from("Not in a voice channel"))
        }
    }
}

async fn get_bot_id(ctx: &Context) -> Option<u64> {
    let data = ctx.data.read().await;
    data.get::<BotDataMap>().map(|data| data.id)
}

async fn get_jukebox(ctx: &Context) -> CommandResult<Arc<Jukebox>> {
    let data = ctx.data.read().await;
    data.get::<JukeboxMap>().cloned().ok_or(CommandError::from("Jukebox not initialised"))
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}
