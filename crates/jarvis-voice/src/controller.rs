//! **TurnController**: the session state machine.
//!
//! One task owns every piece of mutable session state and serializes all inputs
//! through a single event loop: recognition events, UI signals, timer fires,
//! dispatch completions and player reports. Each completion carries the id of
//! the turn, timer generation or playback handle it belongs to and is dropped
//! if that owner is no longer current.
//!
//! ```text
//!  SpeechInputStream ──┐
//!  UI signals ─────────┤                ┌─> CommandDispatcher (task) ─┐
//!  wake / error timers ┼─> event loop ──┤                             │
//!  player reports ─────┘      ^         └─> VoiceOutputPlayer ──> AudioSession
//!                             └──────── completion events ───────────┘
//! ```

use crate::audio::{AudioSession, CueKind, DeviceFactory};
use crate::config::VoiceConfig;
use crate::dispatcher::{CommandDispatcher, DispatchReply, TextGenerator};
use crate::error::{CollaboratorError, VoiceError, VoiceResult};
use crate::local_tts::LocalSynthesizer;
use crate::speech_input::{
    InputFailure, Recognizer, SpeechEvent, SpeechInputOptions, SpeechInputStream,
};
use crate::state::{AssistantState, ChatHistory, ChatMessage, SessionSnapshot, Turn};
use crate::store::HistoryStore;
use crate::timer::Timeout;
use crate::voice_output::{
    PlayerEvent, PlayerNotifier, SpeakOutcome, SpeechSynthesizer, VoiceOutputPlayer,
};
use crate::wake::WakeMatcher;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LISTENING_PROMPT: &str = "Listening...";
const DISPATCH_FAILURE: &str = "Uplink Interrupted.";
const OUTPUT_FAILURE: &str = "Vocal matrix critical failure.";

/// Inputs from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
    /// Start listening without a wake phrase. Accepted from IDLE, SPEAKING or ERROR.
    Activate,
    /// Leave LISTENING for IDLE.
    Deactivate,
    /// Typed command; skips recognition but follows the normal dispatch path.
    Submit(String),
    /// Drop the pending reply and any playback, then return to IDLE.
    StopVoice,
    /// Pause or resume the active playback handle.
    TogglePause,
    /// Connectivity hint; offline replies go straight to the local voice.
    SetOnline(bool),
}

#[derive(Debug)]
enum ControllerEvent {
    Speech(SpeechEvent),
    Ui(UiSignal),
    WakeTimeout(u64),
    ErrorTimeout(u64),
    Dispatched {
        turn: u64,
        outcome: Result<DispatchReply, CollaboratorError>,
    },
    Player(PlayerEvent),
    Shutdown(oneshot::Sender<()>),
}

/// External collaborators the controller drives.
pub struct ControllerDeps {
    pub recognizer: Arc<dyn Recognizer>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub local: Option<Arc<dyn LocalSynthesizer>>,
    pub devices: Arc<dyn DeviceFactory>,
    pub store: Option<Arc<dyn HistoryStore>>,
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl ControllerHandle {
    /// Post a UI signal. Fails once the controller has shut down.
    pub fn send(&self, signal: UiSignal) -> VoiceResult<()> {
        self.events
            .send(ControllerEvent::Ui(signal))
            .map_err(|_| VoiceError::ChannelSend("turn controller has stopped".to_string()))
    }

    /// Manual activation (the microphone button).
    pub fn activate(&self) -> VoiceResult<()> {
        self.send(UiSignal::Activate)
    }

    /// Manual deactivation while listening.
    pub fn deactivate(&self) -> VoiceResult<()> {
        self.send(UiSignal::Deactivate)
    }

    /// Dispatch typed text as if it had been heard after the wake phrase.
    pub fn submit(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(UiSignal::Submit(text.into()))
    }

    /// Silence the assistant: cancel synthesis, stop playback, clear pause.
    pub fn stop_voice(&self) -> VoiceResult<()> {
        self.send(UiSignal::StopVoice)
    }

    /// Flip pause on whatever is speaking; no-op when nothing is.
    pub fn toggle_pause(&self) -> VoiceResult<()> {
        self.send(UiSignal::TogglePause)
    }

    /// Report network reachability.
    pub fn set_online(&self, online: bool) -> VoiceResult<()> {
        self.send(UiSignal::SetOnline(online))
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Tear the session down and wait for it. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events.send(ControllerEvent::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

pub struct TurnController {
    config: VoiceConfig,
    wake: WakeMatcher,
    state: AssistantState,
    transcript: String,
    history: ChatHistory,
    online: bool,
    /// ERROR that only an explicit user action clears.
    fatal: bool,
    detect_cued: bool,
    wake_timer: Timeout<ControllerEvent>,
    error_timer: Timeout<ControllerEvent>,
    dispatcher: Arc<CommandDispatcher>,
    player: VoiceOutputPlayer,
    next_turn: u64,
    current_turn: Option<Turn>,
    in_flight: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    state_tx: watch::Sender<AssistantState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    store: Option<Arc<dyn HistoryStore>>,
}

impl TurnController {
    /// Start the session: recognition supervisor plus the controller task.
    pub fn spawn(config: VoiceConfig, deps: ControllerDeps) -> VoiceResult<ControllerHandle> {
        config.validate()?;
        let wake = WakeMatcher::new(&config.wake.phrase, config.wake.greeting.as_deref())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AssistantState::Idle);

        let history = match &deps.store {
            Some(store) => match store.load_history() {
                Ok(messages) => {
                    info!(messages = messages.len(), "history restored");
                    ChatHistory::from_messages(messages)
                }
                Err(e) => {
                    warn!(error = %e, "history could not be loaded; starting empty");
                    ChatHistory::new()
                }
            },
            None => ChatHistory::new(),
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: AssistantState::Idle,
            transcript: String::new(),
            history: history.shared(),
            paused: false,
            online: true,
        });

        let player_events = events_tx.clone();
        let notify: PlayerNotifier = Arc::new(move |event| {
            let _ = player_events.send(ControllerEvent::Player(event));
        });
        let player = VoiceOutputPlayer::new(
            AudioSession::new(deps.devices, config.synthesis.sample_rate),
            deps.synthesizer,
            deps.local,
            config.synthesis.clone(),
            config.fallback.clone(),
            notify,
        );

        let input = SpeechInputStream::spawn(
            deps.recognizer,
            SpeechInputOptions {
                language: config.recognition.language.clone(),
                restart_delay: config.recognition.restart_delay(),
            },
            state_rx,
        );

        let controller = TurnController {
            dispatcher: Arc::new(CommandDispatcher::new(deps.generator, &config.dispatch)),
            wake_timer: Timeout::new("wake", events_tx.clone(), ControllerEvent::WakeTimeout),
            error_timer: Timeout::new("error", events_tx.clone(), ControllerEvent::ErrorTimeout),
            config,
            wake,
            state: AssistantState::Idle,
            transcript: String::new(),
            history,
            online: true,
            fatal: false,
            detect_cued: false,
            player,
            next_turn: 0,
            current_turn: None,
            in_flight: None,
            events: events_tx.clone(),
            state_tx,
            snapshot_tx,
            store: deps.store,
        };

        tokio::spawn(controller.run(input, events_rx));
        info!("turn controller started");

        Ok(ControllerHandle {
            events: events_tx,
            snapshots: snapshot_rx,
        })
    }

    async fn run(
        mut self,
        mut input: SpeechInputStream,
        mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let mut input_open = true;
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                speech = input.next(), if input_open => match speech {
                    Some(speech) => ControllerEvent::Speech(speech),
                    None => {
                        debug!("speech input ended");
                        input_open = false;
                        continue;
                    }
                },
                else => break,
            };

            if let ControllerEvent::Shutdown(ack) = event {
                self.teardown(&input);
                let _ = ack.send(());
                break;
            }
            self.handle(event);
            self.publish();
        }

        // Late shutdown requests still get an answer.
        events.close();
        while let Some(event) = events.recv().await {
            if let ControllerEvent::Shutdown(ack) = event {
                let _ = ack.send(());
            }
        }
        info!("turn controller stopped");
    }

    fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Speech(SpeechEvent::Interim(text)) => self.on_interim(text),
            ControllerEvent::Speech(SpeechEvent::Final(text)) => self.on_final(&text),
            ControllerEvent::Speech(SpeechEvent::Error(failure)) => self.on_input_failure(failure),
            ControllerEvent::Ui(signal) => self.on_ui(signal),
            ControllerEvent::WakeTimeout(generation) => self.on_wake_timeout(generation),
            ControllerEvent::ErrorTimeout(generation) => self.on_error_timeout(generation),
            ControllerEvent::Dispatched { turn, outcome } => self.on_dispatched(turn, outcome),
            ControllerEvent::Player(PlayerEvent::Synthesized { request, outcome }) => {
                if let Some(started) = self.player.on_synthesized(request, outcome) {
                    self.apply_speak(started);
                }
            }
            ControllerEvent::Player(PlayerEvent::Finished { handle }) => {
                if self.player.on_finished(handle) && self.state == AssistantState::Speaking {
                    self.go_idle();
                }
            }
            ControllerEvent::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn set_state(&mut self, next: AssistantState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "state transition");
        if self.state == AssistantState::Listening {
            self.wake_timer.disarm();
        }
        if next == AssistantState::Listening {
            self.detect_cued = false;
        }
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn go_idle(&mut self) {
        self.wake_timer.disarm();
        self.set_state(AssistantState::Idle);
        self.transcript.clear();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state,
            transcript: self.transcript.clone(),
            history: self.history.shared(),
            paused: self.player.is_paused(),
            online: self.online,
        });
    }

    fn append(&mut self, message: ChatMessage) {
        self.history.push(message);
        if let Some(store) = &self.store {
            if let Err(e) = store.save_history(self.history.messages()) {
                warn!(error = %e, "history not saved");
            }
        }
    }

    fn on_interim(&mut self, text: String) {
        if self.state == AssistantState::Error {
            return;
        }
        let awake = self.state.is_awake();
        if awake || self.wake.contains(&text) {
            self.transcript = text;
        }
        if awake {
            self.wake_timer.arm(self.config.wake.activity_timeout());
            if !self.detect_cued {
                self.detect_cued = true;
                self.player.play_cue(CueKind::Detect);
            }
        }
    }

    fn on_final(&mut self, raw: &str) {
        let text = raw.trim().to_lowercase();
        if text.is_empty() {
            return;
        }
        self.detect_cued = false;
        debug!(heard = %text, state = %self.state, "final transcript");

        match self.state {
            AssistantState::Error => debug!("final transcript ignored while in ERROR"),
            AssistantState::Idle => {
                if !self.wake.contains(&text) {
                    return;
                }
                let command = self.wake.trailing_command(&text).unwrap_or_default();
                self.set_state(AssistantState::Listening);
                if command.chars().count() > 2 {
                    self.dispatch(&command);
                } else {
                    self.transcript = self.config.wake.greeting_reply.clone();
                    self.wake_timer.arm(self.config.wake.wake_timeout());
                }
            }
            AssistantState::Listening => {
                let command = self.wake.strip_leading(&text);
                if command.chars().count() > 1 {
                    self.wake_timer.disarm();
                    self.player.play_cue(CueKind::End);
                    self.dispatch(&command);
                }
            }
            AssistantState::Thinking => {
                // Only a fresh wake phrase may replace the command in flight.
                if self.wake.contains(&text) {
                    if let Some(command) = self.wake.trailing_command(&text) {
                        if command.chars().count() > 2 {
                            self.dispatch(&command);
                        }
                    }
                }
            }
            AssistantState::Speaking => {
                let command = self.wake.strip_leading(&text);
                if command.chars().count() > 1 {
                    info!("barge-in");
                    self.dispatch(&command);
                }
            }
        }
    }

    /// Start a new turn. Always begins with no armed wake timer and no playback.
    fn dispatch(&mut self, command: &str) {
        let command = command.trim();
        if command.chars().count() < 2 {
            return;
        }
        self.wake_timer.disarm();
        self.error_timer.disarm();
        self.fatal = false;
        self.player.interrupt();
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }

        self.set_state(AssistantState::Thinking);
        self.transcript = format!("Processing: \"{}\"", command);

        let prior = self.history.recent(self.config.dispatch.history_window).to_vec();
        self.append(ChatMessage::user(command));

        self.next_turn += 1;
        let turn = Turn::new(self.next_turn, command);
        info!(turn = turn.id, utterance = %turn.utterance, online = self.online, "dispatching");

        if !self.online {
            self.current_turn = None;
            let reply = self.config.session.offline_reply.clone();
            self.append(ChatMessage::assistant(reply.clone(), Vec::new()));
            self.set_state(AssistantState::Speaking);
            let started = self.player.speak(&reply, false);
            self.apply_speak(started);
            return;
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events.clone();
        let utterance = turn.utterance.clone();
        let id = turn.id;
        self.in_flight = Some(tokio::spawn(async move {
            let outcome = dispatcher.dispatch(&utterance, &prior).await;
            let _ = events.send(ControllerEvent::Dispatched { turn: id, outcome });
        }));
        self.current_turn = Some(turn);
    }

    fn on_dispatched(&mut self, turn: u64, outcome: Result<DispatchReply, CollaboratorError>) {
        let current = match &self.current_turn {
            Some(current) if current.id == turn && self.state == AssistantState::Thinking => {
                current.clone()
            }
            _ => {
                debug!(turn, "stale dispatch result ignored");
                return;
            }
        };
        self.current_turn = None;
        self.in_flight = None;

        match outcome {
            Ok(reply) => {
                info!(
                    turn,
                    elapsed_ms = current.started.elapsed().as_millis() as u64,
                    "reply received"
                );
                self.append(ChatMessage::assistant(reply.text.clone(), reply.sources));
                self.set_state(AssistantState::Speaking);
                let started = self.player.speak(&reply.text, self.online);
                self.apply_speak(started);
            }
            Err(e) => {
                warn!(turn, error = %e, "dispatch failed");
                self.enter_error(DISPATCH_FAILURE, Some(self.config.dispatch.error_return()));
            }
        }
    }

    fn apply_speak(&mut self, outcome: SpeakOutcome) {
        match outcome {
            SpeakOutcome::Skipped => self.go_idle(),
            SpeakOutcome::Pending(_) | SpeakOutcome::Started(_) => {}
            SpeakOutcome::Failed => {
                self.enter_error(OUTPUT_FAILURE, Some(self.config.synthesis.error_return()))
            }
        }
    }

    /// `return_after: None` marks a session-fatal error.
    fn enter_error(&mut self, message: &str, return_after: Option<Duration>) {
        self.wake_timer.disarm();
        self.player.interrupt();
        self.set_state(AssistantState::Error);
        self.transcript = message.to_string();
        self.fatal = return_after.is_none();
        match return_after {
            Some(after) => {
                self.error_timer.arm(after);
            }
            None => self.error_timer.disarm(),
        }
    }

    fn on_input_failure(&mut self, failure: InputFailure) {
        if self.state == AssistantState::Error && self.fatal {
            return;
        }
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        self.current_turn = None;
        self.enter_error(failure.message(), None);
    }

    fn on_wake_timeout(&mut self, generation: u64) {
        if !self.wake_timer.fire(generation) {
            return;
        }
        if self.state == AssistantState::Listening {
            info!("no follow-up, going back to sleep");
            self.go_idle();
        }
    }

    fn on_error_timeout(&mut self, generation: u64) {
        if !self.error_timer.fire(generation) {
            return;
        }
        if self.state == AssistantState::Error && !self.fatal {
            self.go_idle();
        }
    }

    fn on_ui(&mut self, signal: UiSignal) {
        debug!(?signal, state = %self.state, "ui signal");
        match signal {
            UiSignal::Activate => {
                self.player.ensure_device();
                if matches!(
                    self.state,
                    AssistantState::Idle | AssistantState::Speaking | AssistantState::Error
                ) {
                    self.player.interrupt();
                    self.error_timer.disarm();
                    self.fatal = false;
                    self.set_state(AssistantState::Listening);
                    self.transcript = LISTENING_PROMPT.to_string();
                    self.player.play_cue(CueKind::Start);
                    self.wake_timer.arm(self.config.wake.manual_timeout());
                }
            }
            UiSignal::Deactivate => {
                if self.state == AssistantState::Listening {
                    self.wake_timer.disarm();
                    self.player.play_cue(CueKind::End);
                    self.go_idle();
                }
            }
            UiSignal::Submit(text) => self.dispatch(&text),
            UiSignal::StopVoice => {
                self.player.interrupt();
                if let Some(task) = self.in_flight.take() {
                    task.abort();
                }
                self.current_turn = None;
                self.error_timer.disarm();
                self.fatal = false;
                self.go_idle();
            }
            UiSignal::TogglePause => {
                if let Some(paused) = self.player.toggle_pause() {
                    info!(paused, "playback pause toggled");
                }
            }
            UiSignal::SetOnline(online) => {
                if self.online != online {
                    info!(online, "connectivity changed");
                }
                self.online = online;
            }
        }
    }

    fn teardown(&mut self, input: &SpeechInputStream) {
        self.wake_timer.disarm();
        self.error_timer.disarm();
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        self.current_turn = None;
        input.stop();
        self.player.close();
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                warn!(error = %e, "history not flushed");
            }
        }
        info!("session torn down");
    }
}
