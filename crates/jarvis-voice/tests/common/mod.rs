//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::prelude::*;
use jarvis_voice::{
    AudioBuffer, ChatMessage, CollaboratorError, DeviceFactory, GenerationReply, LocalSpeech,
    LocalSpeechControl, LocalSpeechEnd, LocalSynthesizer, LocalUtterance, LocalVoice,
    OutputDevice, RawRecognition, Recognizer, SoundId, SoundPlayback, SpeechSynthesizer,
    TextGenerator, VoiceConfig, VoiceResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Let every ready task run. Time is paused in these tests, so this is instant.
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn status(code: u16) -> CollaboratorError {
    CollaboratorError::Status {
        code,
        body: String::new(),
    }
}

/// Base64 PCM16 payload holding `frames` mono samples.
pub fn pcm_payload(frames: usize) -> String {
    let bytes: Vec<u8> = (0..frames).flat_map(|i| ((i as i16) * 8).to_le_bytes()).collect();
    BASE64_STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Output device
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceState {
    next_id: SoundId,
    playing: HashMap<SoundId, oneshot::Sender<()>>,
    /// Senders of stopped sounds, kept so tests can deliver late completions.
    stopped: HashMap<SoundId, oneshot::Sender<()>>,
    live: usize,
    max_live: usize,
    played: Vec<SoundId>,
    stops: Vec<SoundId>,
    cues: Vec<usize>,
    suspended: bool,
    closed: bool,
}

#[derive(Default)]
pub struct FakeDevice {
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    /// Natural completion, or a late completion for an already-stopped sound.
    pub fn complete(&self, id: SoundId) {
        let mut state = self.state.lock().unwrap();
        if let Some(done) = state.playing.remove(&id) {
            state.live -= 1;
            let _ = done.send(());
        } else if let Some(done) = state.stopped.remove(&id) {
            let _ = done.send(());
        }
    }

    pub fn played(&self) -> Vec<SoundId> {
        self.state.lock().unwrap().played.clone()
    }

    pub fn stops(&self) -> Vec<SoundId> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    /// Frame counts of the cue tones played so far.
    pub fn cues(&self) -> Vec<usize> {
        self.state.lock().unwrap().cues.clone()
    }

    pub fn suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl OutputDevice for FakeDevice {
    fn play(&self, _buffer: AudioBuffer) -> VoiceResult<SoundPlayback> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let (tx, done) = oneshot::channel();
        state.playing.insert(id, tx);
        state.played.push(id);
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(SoundPlayback { id, done })
    }

    fn stop(&self, id: SoundId) {
        let mut state = self.state.lock().unwrap();
        if let Some(done) = state.playing.remove(&id) {
            state.live -= 1;
            state.stopped.insert(id, done);
        }
        state.stops.push(id);
    }

    fn play_cue(&self, buffer: AudioBuffer) -> VoiceResult<()> {
        self.state.lock().unwrap().cues.push(buffer.frame_count());
        Ok(())
    }

    fn suspend(&self) -> VoiceResult<()> {
        self.state.lock().unwrap().suspended = true;
        Ok(())
    }

    fn resume(&self) -> VoiceResult<()> {
        self.state.lock().unwrap().suspended = false;
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

pub struct FakeDevices {
    pub device: Arc<FakeDevice>,
    pub opens: AtomicUsize,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            device: Arc::new(FakeDevice::default()),
            opens: AtomicUsize::new(0),
        })
    }
}

impl DeviceFactory for FakeDevices {
    fn open(&self) -> VoiceResult<Arc<dyn OutputDevice>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GenerationReply, CollaboratorError>>>,
    calls: Mutex<Vec<(String, usize)>>,
    latency: Duration,
}

impl ScriptedGenerator {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency,
        })
    }

    pub fn push(&self, result: Result<GenerationReply, CollaboratorError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn reply(&self, text: &str) {
        self.push(Ok(GenerationReply {
            text: text.to_string(),
            sources: Vec::new(),
        }));
    }

    /// Utterances received so far.
    pub fn utterances(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    /// History length sent with each call.
    pub fn history_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        utterance: &str,
        history: &[ChatMessage],
    ) -> Result<GenerationReply, CollaboratorError> {
        self.calls
            .lock()
            .unwrap()
            .push((utterance.to_string(), history.len()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(GenerationReply {
                text: "Very good, sir.".to_string(),
                sources: Vec::new(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Remote synthesis
// ---------------------------------------------------------------------------

pub struct ScriptedSynth {
    script: Mutex<VecDeque<Result<String, CollaboratorError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSynth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, result: Result<String, CollaboratorError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str) -> Result<String, CollaboratorError> {
        self.calls.lock().unwrap().push(text.to_string());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(pcm_payload(2_400)))
    }
}

// ---------------------------------------------------------------------------
// Local synthesis
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLocalControl {
    pub paused: AtomicBool,
    pub cancelled: AtomicBool,
}

impl LocalSpeechControl for FakeLocalControl {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLocal {
    spoken: Mutex<Vec<LocalUtterance>>,
    ends: Mutex<Vec<oneshot::Sender<LocalSpeechEnd>>>,
    controls: Mutex<Vec<Arc<FakeLocalControl>>>,
}

impl FakeLocal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().iter().map(|u| u.text.clone()).collect()
    }

    pub fn utterances(&self) -> Vec<LocalUtterance> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn control(&self, index: usize) -> Arc<FakeLocalControl> {
        self.controls.lock().unwrap()[index].clone()
    }

    /// Finish the most recent utterance.
    pub fn finish_last(&self) {
        if let Some(end) = self.ends.lock().unwrap().pop() {
            let _ = end.send(LocalSpeechEnd::Finished);
        }
    }
}

impl LocalSynthesizer for FakeLocal {
    fn voices(&self) -> Vec<LocalVoice> {
        vec![
            LocalVoice {
                name: "English_(America)".to_string(),
                language: "en-us".to_string(),
            },
            LocalVoice {
                name: "English_(Great_Britain)".to_string(),
                language: "en-gb".to_string(),
            },
        ]
    }

    fn speak(&self, utterance: LocalUtterance) -> VoiceResult<LocalSpeech> {
        let (tx, done) = oneshot::channel();
        let control = Arc::new(FakeLocalControl::default());
        self.spoken.lock().unwrap().push(utterance);
        self.ends.lock().unwrap().push(tx);
        self.controls.lock().unwrap().push(control.clone());
        Ok(LocalSpeech { control, done })
    }
}

// ---------------------------------------------------------------------------
// Recognition
// ---------------------------------------------------------------------------

pub struct FakeRecognizer {
    feed: Mutex<Option<mpsc::Sender<RawRecognition>>>,
    pub starts: AtomicUsize,
    available: bool,
}

impl FakeRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            feed: Mutex::new(None),
            starts: AtomicUsize::new(0),
            available: true,
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            feed: Mutex::new(None),
            starts: AtomicUsize::new(0),
            available: false,
        })
    }

    /// Deliver one result into the live recognition session.
    pub async fn emit(&self, item: RawRecognition) {
        for _ in 0..100 {
            let feed = self.feed.lock().unwrap().clone();
            if let Some(feed) = feed {
                if feed.send(item.clone()).await.is_ok() {
                    settle().await;
                    return;
                }
            }
            settle().await;
        }
        panic!("no live recognition session");
    }

    pub async fn say(&self, text: &str) {
        self.emit(RawRecognition::Final(text.to_string())).await;
    }

    /// End the current session the way the host engine does after silence.
    pub fn end_session(&self) {
        self.feed.lock().unwrap().take();
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn start(&self, _language: &str) -> VoiceResult<mpsc::Receiver<RawRecognition>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// Default config with the local store disabled.
pub fn test_config() -> VoiceConfig {
    VoiceConfig::default()
}
