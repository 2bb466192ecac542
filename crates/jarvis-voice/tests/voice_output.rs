mod common;

use common::{pcm_payload, settle, status, FakeDevices, FakeLocal, ScriptedSynth};
use jarvis_voice::config::{FallbackConfig, SynthesisConfig};
use jarvis_voice::{
    decode_pcm16_base64, AudioBuffer, AudioSession, CollaboratorError, LocalSynthesizer,
    PlaybackPath, PlayerEvent, PlayerNotifier, SpeakOutcome, VoiceOutputPlayer,
    PCM_SAMPLE_RATE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Rig {
    player: VoiceOutputPlayer,
    events: mpsc::UnboundedReceiver<PlayerEvent>,
    devices: Arc<FakeDevices>,
    synth: Arc<ScriptedSynth>,
    local: Arc<FakeLocal>,
}

fn rig_with(local_enabled: bool) -> Rig {
    let devices = FakeDevices::new();
    let synth = ScriptedSynth::new();
    let local = FakeLocal::new();
    let (tx, events) = mpsc::unbounded_channel();
    let notify: PlayerNotifier = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let player = VoiceOutputPlayer::new(
        AudioSession::new(devices.clone(), PCM_SAMPLE_RATE),
        synth.clone(),
        local_enabled.then(|| local.clone() as Arc<dyn LocalSynthesizer>),
        SynthesisConfig::default(),
        FallbackConfig::default(),
        notify,
    );
    Rig {
        player,
        events,
        devices,
        synth,
        local,
    }
}

fn rig() -> Rig {
    rig_with(true)
}

impl Rig {
    /// Wait for the synthesis report and hand it to the player.
    async fn deliver_synthesis(&mut self) -> Option<SpeakOutcome> {
        match self.events.recv().await {
            Some(PlayerEvent::Synthesized { request, outcome }) => {
                self.player.on_synthesized(request, outcome)
            }
            other => panic!("expected a synthesis report, got {other:?}"),
        }
    }

    async fn next_finished(&mut self) -> u64 {
        match self.events.recv().await {
            Some(PlayerEvent::Finished { handle }) => handle,
            other => panic!("expected a finished report, got {other:?}"),
        }
    }
}

fn tone() -> AudioBuffer {
    decode_pcm16_base64(&pcm_payload(480), PCM_SAMPLE_RATE, 1).unwrap()
}

#[tokio::test(start_paused = true)]
async fn empty_text_is_skipped() {
    let mut rig = rig();
    assert_eq!(rig.player.speak("   ", true), SpeakOutcome::Skipped);
    settle().await;
    assert!(rig.synth.calls().is_empty());
    assert!(rig.local.spoken().is_empty());
    assert!(!rig.player.is_active());
}

#[tokio::test(start_paused = true)]
async fn remote_audio_plays_on_the_primary_path() {
    let mut rig = rig();
    let outcome = rig.player.speak("Good *evening*, sir.", true);
    assert!(matches!(outcome, SpeakOutcome::Pending(_)));
    assert!(rig.player.has_pending());

    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Primary)));
    assert_eq!(rig.synth.calls(), vec!["Good evening, sir.".to_string()]);
    assert_eq!(rig.player.active_path(), Some(PlaybackPath::Primary));

    let sound = rig.devices.device.played()[0];
    rig.devices.device.complete(sound);
    let handle = rig.next_finished().await;
    assert!(rig.player.on_finished(handle));
    assert!(!rig.player.is_active());
}

#[tokio::test(start_paused = true)]
async fn offline_goes_straight_to_local_voice() {
    let mut rig = rig();
    let outcome = rig.player.speak("I am offline at the moment.", false);
    assert_eq!(outcome, SpeakOutcome::Started(PlaybackPath::Fallback));
    settle().await;

    assert!(rig.synth.calls().is_empty());
    assert_eq!(rig.local.spoken(), vec!["I am offline at the moment.".to_string()]);
    let utterance = &rig.local.utterances()[0];
    assert_eq!(utterance.voice.as_deref(), Some("English_(Great_Britain)"));
}

#[tokio::test(start_paused = true)]
async fn empty_payload_falls_back_with_sanitized_text() {
    let mut rig = rig();
    rig.synth.push(Ok(String::new()));

    rig.player.speak("## Status\n**All** systems nominal.", true);
    let started = rig.deliver_synthesis().await;

    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Fallback)));
    assert_eq!(rig.local.spoken(), vec!["Status All systems nominal.".to_string()]);
    assert!(rig.devices.device.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_falls_back() {
    let mut rig = rig();
    rig.synth.push(Ok("***not base64***".to_string()));

    rig.player.speak("Right away.", true);
    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Fallback)));
}

#[tokio::test(start_paused = true)]
async fn transient_synthesis_error_is_retried_once() {
    let mut rig = rig();
    rig.synth.push(Err(status(500)));

    rig.player.speak("One moment.", true);
    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Primary)));
    assert_eq!(rig.synth.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn single_rate_limit_is_retried_without_cooldown() {
    let mut rig = rig();
    rig.synth.push(Err(status(429)));

    rig.player.speak("Rate limited once.", true);
    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Primary)));
    assert_eq!(rig.synth.calls().len(), 2);

    let outcome = rig.player.speak("Next reply.", true);
    assert!(matches!(outcome, SpeakOutcome::Pending(_)));
}

#[tokio::test(start_paused = true)]
async fn persistent_rate_limit_triggers_cooldown() {
    let mut rig = rig();
    rig.synth.push(Err(status(429)));
    rig.synth.push(Err(status(429)));

    rig.player.speak("First reply.", true);
    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Fallback)));
    assert_eq!(rig.synth.calls().len(), 2);

    // Inside the cooldown the remote path is not attempted.
    let outcome = rig.player.speak("Second reply.", true);
    assert_eq!(outcome, SpeakOutcome::Started(PlaybackPath::Fallback));
    settle().await;
    assert_eq!(rig.synth.calls().len(), 2);

    tokio::time::sleep(Duration::from_secs(61)).await;
    let outcome = rig.player.speak("Third reply.", true);
    assert!(matches!(outcome, SpeakOutcome::Pending(_)));
    rig.deliver_synthesis().await;
    assert_eq!(rig.synth.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_body_is_not_retried() {
    let mut rig = rig();
    rig.synth.push(Err(CollaboratorError::Status {
        code: 403,
        body: r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#.into(),
    }));

    rig.player.speak("Out of quota.", true);
    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Fallback)));
    assert_eq!(rig.synth.calls().len(), 1);
    assert_eq!(
        rig.player.speak("Still out.", true),
        SpeakOutcome::Started(PlaybackPath::Fallback)
    );
}

#[tokio::test(start_paused = true)]
async fn superseded_synthesis_result_is_ignored() {
    let mut rig = rig();
    let first = match rig.player.speak("First.", true) {
        SpeakOutcome::Pending(request) => request,
        other => panic!("unexpected {other:?}"),
    };
    let second = rig.player.speak("Second.", true);
    assert!(matches!(second, SpeakOutcome::Pending(r) if r != first));

    assert_eq!(rig.player.on_synthesized(first, Ok(tone())), None);
    assert!(rig.devices.device.played().is_empty());

    let started = rig.deliver_synthesis().await;
    assert_eq!(started, Some(SpeakOutcome::Started(PlaybackPath::Primary)));
    assert_eq!(rig.devices.device.played().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_reply_stops_the_old_one_and_ignores_its_late_completion() {
    let mut rig = rig();
    rig.player.speak("A long answer.", true);
    rig.deliver_synthesis().await;
    let old_sound = rig.devices.device.played()[0];

    rig.player.speak("A short answer.", true);
    assert_eq!(rig.devices.device.stops(), vec![old_sound]);
    rig.deliver_synthesis().await;
    assert_eq!(rig.devices.device.max_live(), 1);

    // The stopped sound reports completion anyway.
    rig.devices.device.complete(old_sound);
    let stale = rig.next_finished().await;
    assert!(!rig.player.on_finished(stale));
    assert!(rig.player.is_active());
}

#[tokio::test(start_paused = true)]
async fn pause_suspends_the_device_for_primary_audio() {
    let mut rig = rig();
    assert_eq!(rig.player.toggle_pause(), None);

    rig.player.speak("Playing now.", true);
    rig.deliver_synthesis().await;

    assert_eq!(rig.player.toggle_pause(), Some(true));
    assert!(rig.devices.device.suspended());
    assert_eq!(rig.player.toggle_pause(), Some(false));
    assert!(!rig.devices.device.suspended());
}

#[tokio::test(start_paused = true)]
async fn pause_uses_local_control_for_fallback() {
    let mut rig = rig();
    rig.player.speak("Offline voice.", false);

    assert_eq!(rig.player.toggle_pause(), Some(true));
    assert!(rig.local.control(0).paused.load(std::sync::atomic::Ordering::SeqCst));
    assert!(rig.player.is_paused());

    rig.player.interrupt();
    assert!(rig.local.control(0).cancelled.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!rig.player.is_paused());
}

#[tokio::test(start_paused = true)]
async fn local_completion_finishes_the_handle() {
    let mut rig = rig();
    rig.player.speak("Done soon.", false);
    rig.local.finish_last();
    let handle = rig.next_finished().await;
    assert!(rig.player.on_finished(handle));
}

#[tokio::test(start_paused = true)]
async fn no_path_available_fails() {
    let mut rig = rig_with(false);
    assert_eq!(rig.player.speak("Anyone there?", false), SpeakOutcome::Failed);

    rig.synth.push(Err(CollaboratorError::EmptyPayload));
    rig.player.speak("Still nobody?", true);
    assert_eq!(rig.deliver_synthesis().await, Some(SpeakOutcome::Failed));
}

#[tokio::test(start_paused = true)]
async fn close_releases_the_device() {
    let mut rig = rig();
    rig.player.speak("Closing.", true);
    rig.deliver_synthesis().await;
    rig.player.close();
    rig.player.close();
    assert!(rig.devices.device.closed());
    assert!(!rig.player.is_active());
}
