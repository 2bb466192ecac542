//! # JARVIS Voice - Turn/Session Orchestration
//!
//! Turns a continuous stream of speech-recognition events into discrete user
//! turns, dispatches each turn to a text-generation service and speaks the reply,
//! falling back to local synthesis when the network or remote quota fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Turn Controller                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐      │
//! │  │ Speech Input │ → │  Wake / Turn │ → │ CommandDispatcher│      │
//! │  │ (restarting) │   │    Logic     │   │  (retry/backoff) │      │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘      │
//! │                            ↓                     ↓               │
//! │  ┌──────────────┐   ┌──────────────────────────────────┐         │
//! │  │ AudioSession │ ← │ VoiceOutputPlayer (remote TTS or │         │
//! │  │   (rodio)    │   │  local fallback, barge-in)       │         │
//! │  └──────────────┘   └──────────────────────────────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod gemini;
pub mod local_tts;
pub mod retry;
pub mod sanitize;
pub mod speech_input;
pub mod state;
pub mod store;
pub mod timer;
pub mod voice_output;
pub mod wake;

pub use audio::{
    decode_pcm16, decode_pcm16_base64, render_cue, AudioBuffer, AudioSession, CueKind,
    DeviceFactory, OutputDevice, SoundId, SoundPlayback, PCM_SAMPLE_RATE,
};
pub use config::VoiceConfig;
pub use controller::{ControllerDeps, ControllerHandle, TurnController, UiSignal};
pub use device::{RodioDevice, RodioDeviceFactory};
pub use dispatcher::{
    CommandDispatcher, DispatchReply, GenerationReply, TextGenerator, UNSTABLE_LINK_REPLY,
};
pub use error::{CollaboratorError, VoiceError, VoiceResult};
pub use gemini::GeminiClient;
pub use local_tts::{
    choose_voice, EspeakSynthesizer, LocalSpeech, LocalSpeechControl, LocalSpeechEnd,
    LocalSynthesizer, LocalUtterance, LocalVoice,
};
pub use retry::{with_retry, RetryPolicy};
pub use sanitize::{sanitize_for_speech, ACKNOWLEDGEMENT};
pub use speech_input::{
    InputFailure, RawRecognition, RecognitionErrorCode, Recognizer, SpeechEvent,
    SpeechInputControl, SpeechInputOptions, SpeechInputStream,
};
pub use state::{AssistantState, ChatHistory, ChatMessage, Role, SessionSnapshot, Turn};
pub use store::{HistoryStore, SledHistoryStore};
pub use timer::Timeout;
pub use voice_output::{
    PlaybackHandle, PlaybackPath, PlayerEvent, PlayerNotifier, SpeakOutcome, SpeechSynthesizer,
    SynthesisFailure, VoiceOutputPlayer,
};
pub use wake::WakeMatcher;
