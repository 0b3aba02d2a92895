//! In-memory resolver, decoder and voice transport used by unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::decoder::{DecodedStream, DecoderProcess, PcmStream, Transcoder};
use crate::error::{QueueError, QueueResult};
use crate::models::{Platform, Track, TrackInfo};
use crate::resolver::StreamResolver;
use crate::session::SessionNotifier;
use crate::transport::{ConnectionNotifier, TrackControl, VoiceConnection, VoiceTransport};

pub fn track(name: &str) -> Track {
    Track {
        title: name.to_string(),
        url: format!("https://www.youtube.com/watch?v={name}"),
        duration: 180,
        thumbnail: None,
        requested_by: "tester".to_string(),
        platform: Platform::YouTube,
    }
}

#[derive(Default)]
struct Script {
    /// Remaining failures per URL, `None` for always.
    failures: HashMap<String, Option<usize>>,
    malformed: HashSet<String>,
    calls: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ScriptedResolver {
    script: Mutex<Script>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_fail(&self, url: &str) {
        self.script.lock().unwrap().failures.insert(url.to_string(), None);
    }

    pub fn fail_times(&self, url: &str, times: usize) {
        self.script.lock().unwrap().failures.insert(url.to_string(), Some(times));
    }

    pub fn return_malformed(&self, url: &str) {
        self.script.lock().unwrap().malformed.insert(url.to_string());
    }

    /// Makes the next resolution wait until the returned handle is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.script.lock().unwrap().calls.get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().calls.values().sum()
    }
}

#[async_trait]
impl StreamResolver for ScriptedResolver {
    async fn resolve_direct_url(&self, source_url: &str) -> QueueResult<String> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = self.script.lock().unwrap();
        *script.calls.entry(source_url.to_string()).or_default() += 1;

        let failing = match script.failures.get_mut(source_url) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if failing {
            return Err(QueueError::ResolutionFailed(format!("no formats for {source_url}")));
        }

        if script.malformed.contains(source_url) {
            return Ok("not a url".to_string());
        }

        Ok(source_url.replace("https://www.youtube.com/watch?v=", "https://media.example/"))
    }

    async fn resolve_metadata(&self, source_url: &str) -> QueueResult<TrackInfo> {
        Ok(TrackInfo {
            title: source_url.to_string(),
            url: source_url.to_string(),
            duration: 180,
            thumbnail: None,
        })
    }

    async fn resolve_playlist(&self, _source_url: &str, _platform: Platform) -> QueueResult<Vec<TrackInfo>> {
        Ok(Vec::new())
    }

    async fn search(&self, _query: &str) -> QueueResult<Option<TrackInfo>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FakeTranscoder {
    spawned: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    fail: AtomicBool,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Processes spawned and not yet terminated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl Transcoder for FakeTranscoder {
    fn spawn(&self, _direct_url: &str, track: &Track) -> QueueResult<DecodedStream> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::DecoderSpawnFailed(format!("ffmpeg missing for {}", track.title)));
        }

        self.spawned.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(DecodedStream {
            process: Box::new(FakeProcess {
                live: self.live.clone(),
                terminated: false,
            }),
            output: PcmStream::new(io::empty()),
        })
    }
}

struct FakeProcess {
    live: Arc<AtomicUsize>,
    terminated: bool,
}

impl DecoderProcess for FakeProcess {
    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct FakeTransport {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    notifiers: Mutex<Vec<ConnectionNotifier>>,
    hanging: Mutex<HashSet<u64>>,
    fail_open: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections to `channel_id` never finish their handshake.
    pub fn hang(&self, channel_id: u64) {
        self.hanging.lock().unwrap().insert(channel_id);
    }

    pub fn fail_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn notifier(&self, index: usize) -> ConnectionNotifier {
        self.notifiers.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn open(
        &self,
        _guild_id: u64,
        channel_id: u64,
        notifier: ConnectionNotifier,
    ) -> QueueResult<Arc<dyn VoiceConnection>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionFailed("gateway unavailable".to_string()));
        }

        let mut connection = FakeConnection::new(channel_id);
        connection.hangs = self.hanging.lock().unwrap().contains(&channel_id);
        let connection = Arc::new(connection);

        self.connections.lock().unwrap().push(connection.clone());
        self.notifiers.lock().unwrap().push(notifier);

        Ok(connection)
    }
}

pub struct FakeConnection {
    channel_id: u64,
    hangs: bool,
    destroyed: AtomicBool,
    notifiers: Mutex<Vec<SessionNotifier>>,
}

impl FakeConnection {
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            hangs: false,
            destroyed: AtomicBool::new(false),
            notifiers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// End notifier of the most recently started track.
    pub fn last_notifier(&self) -> SessionNotifier {
        self.notifiers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing was played on this connection")
    }
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    fn channel_id(&self) -> u64 {
        self.channel_id
    }

    async fn ready(&self) -> QueueResult<()> {
        if self.hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn play(&self, _stream: PcmStream, notifier: SessionNotifier) -> QueueResult<Box<dyn TrackControl>> {
        self.notifiers.lock().unwrap().push(notifier.clone());

        Ok(Box::new(FakeTrack {
            notifier,
            stopped: AtomicBool::new(false),
        }))
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

struct FakeTrack {
    notifier: SessionNotifier,
    stopped: AtomicBool,
}

impl TrackControl for FakeTrack {
    fn pause(&self) -> QueueResult<()> {
        Ok(())
    }

    fn resume(&self) -> QueueResult<()> {
        Ok(())
    }

    fn stop(&self) -> QueueResult<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notifier.spawn_track_ended();
        }
        Ok(())
    }
}
