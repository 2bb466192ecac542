//! Local, network-free speech synthesis used as the fallback output path.

use crate::config::FallbackConfig;
use crate::error::{VoiceError, VoiceResult};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVoice {
    pub name: String,
    pub language: String,
}

/// One request to the local engine. `rate` and `pitch` are relative, 1.0 = engine default.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUtterance {
    pub text: String,
    pub rate: f32,
    pub pitch: f32,
    pub voice: Option<String>,
}

/// How a local utterance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSpeechEnd {
    Finished,
    Cancelled,
    Failed(String),
}

/// Native controls of a running local utterance.
pub trait LocalSpeechControl: Send + Sync {
    fn cancel(&self);
    fn pause(&self);
    fn resume(&self);
}

/// A started utterance: controls plus the end signal.
pub struct LocalSpeech {
    pub control: Arc<dyn LocalSpeechControl>,
    pub done: oneshot::Receiver<LocalSpeechEnd>,
}

/// Device-native text-to-speech.
pub trait LocalSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<LocalVoice>;
    /// Start speaking. Returning `Ok` is the "start" signal.
    fn speak(&self, utterance: LocalUtterance) -> VoiceResult<LocalSpeech>;
}

/// First voice matching a preferred hint (by name or language), then any
/// English voice, else `None` for the engine default.
pub fn choose_voice(voices: &[LocalVoice], preferred: &[String]) -> Option<String> {
    for hint in preferred {
        let hint = hint.to_lowercase();
        if hint.is_empty() {
            continue;
        }
        let found = voices.iter().find(|v| {
            v.language.to_lowercase() == hint || v.name.to_lowercase().contains(&hint)
        });
        if let Some(voice) = found {
            return Some(voice.name.clone());
        }
    }
    voices
        .iter()
        .find(|v| v.language.to_lowercase().starts_with("en"))
        .map(|v| v.name.clone())
}

/// espeak-ng driven through a child process.
pub struct EspeakSynthesizer {
    command: String,
    voices: Vec<LocalVoice>,
}

impl EspeakSynthesizer {
    /// Probe the engine by listing its voices.
    pub async fn detect(config: &FallbackConfig) -> VoiceResult<Self> {
        let output = Command::new(&config.command)
            .arg("--voices")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VoiceError::LocalSynthesis(format!("{}: {}", config.command, e)))?;
        if !output.status.success() {
            return Err(VoiceError::LocalSynthesis(format!(
                "{} --voices exited with {}",
                config.command, output.status
            )));
        }
        let voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
        info!(command = %config.command, voices = voices.len(), "local synthesizer ready");
        Ok(Self {
            command: config.command.clone(),
            voices,
        })
    }
}

/// Parse the `--voices` table: `Pty Language Age/Gender VoiceName File Other`.
fn parse_voice_list(listing: &str) -> Vec<LocalVoice> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, language, _, name, ..] => Some(LocalVoice {
                    name: name.to_string(),
                    language: language.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

struct EspeakControl {
    pid: Option<u32>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl EspeakControl {
    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) with a pid we spawned; a stale pid only yields ESRCH.
            let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
            if rc != 0 {
                debug!(pid, signal, "signal not delivered");
            }
        }
    }
}

impl LocalSpeechControl for EspeakControl {
    fn cancel(&self) {
        let sender = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            #[cfg(unix)]
            self.signal(libc::SIGCONT);
            let _ = sender.send(());
        }
    }

    fn pause(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGSTOP);
        #[cfg(not(unix))]
        warn!("local synthesis pause is not supported on this platform");
    }

    fn resume(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGCONT);
    }
}

impl LocalSynthesizer for EspeakSynthesizer {
    fn voices(&self) -> Vec<LocalVoice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: LocalUtterance) -> VoiceResult<LocalSpeech> {
        // espeak-ng: 175 wpm and pitch 50 are the defaults.
        let words_per_minute = (175.0 * utterance.rate).clamp(80.0, 450.0).round() as u32;
        let pitch = (50.0 * utterance.pitch).clamp(0.0, 99.0).round() as u32;

        let mut command = Command::new(&self.command);
        command
            .arg("-s")
            .arg(words_per_minute.to_string())
            .arg("-p")
            .arg(pitch.to_string());
        if let Some(voice) = &utterance.voice {
            command.arg("-v").arg(voice);
        }
        let mut child = command
            .arg("--")
            .arg(&utterance.text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::LocalSynthesis(e.to_string()))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done) = oneshot::channel();
        let control = Arc::new(EspeakControl {
            pid: child.id(),
            cancel: Mutex::new(Some(cancel_tx)),
        });

        tokio::spawn(async move {
            let end = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => LocalSpeechEnd::Finished,
                    Ok(status) => LocalSpeechEnd::Failed(format!("exited with {}", status)),
                    Err(e) => LocalSpeechEnd::Failed(e.to_string()),
                },
                _ = cancel_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill local synthesizer");
                    }
                    LocalSpeechEnd::Cancelled
                }
            };
            debug!(?end, "local utterance ended");
            let _ = done_tx.send(end);
        });

        Ok(LocalSpeech { control, done })
    }
}
