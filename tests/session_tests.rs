// Integration tests for the voice session
//
// Wires the recorder, protocol handler and playback queue to the in-memory
// transport and plays the bridge's side of the conversation by hand.

mod common;

use anyhow::Result;
use common::{fast_config, wait_for, MockFactory, RecordingSink};
use loqa_voice::audio::{codec, AudioBackendConfig, AudioFrame, ChannelBackend};
use loqa_voice::connection::{ConnectionManager, ConnectionState};
use loqa_voice::protocol::{Role, SessionPhase};
use loqa_voice::session::{RecorderManager, SessionNotice, SessionOptions, VoiceSession};
use loqa_voice::VoiceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    factory: MockFactory,
    session: VoiceSession,
    mic: mpsc::Sender<AudioFrame>,
    sink: RecordingSink,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
}

fn harness(sink_delay: Duration) -> Harness {
    let factory = MockFactory::new();
    let (backend, mic) = ChannelBackend::new(16);
    let sink = RecordingSink::new(sink_delay);
    let options = SessionOptions {
        connection: fast_config(),
        ..SessionOptions::default()
    };

    let session = VoiceSession::new(
        options,
        Arc::new(factory.clone()),
        Box::new(backend),
        Box::new(sink.clone()),
    );
    let notices = session.take_notices().expect("notices");

    Harness {
        factory,
        session,
        mic,
        sink,
        notices,
    }
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<SessionNotice>) -> SessionNotice {
    tokio::time::timeout(Duration::from_secs(2), notices.recv())
        .await
        .expect("notice in time")
        .expect("notice channel open")
}

#[tokio::test]
async fn test_handshake_sends_session_update() -> Result<()> {
    let h = harness(Duration::ZERO);
    h.session.start().await?;

    assert!(wait_for(Duration::from_secs(1), || !h.factory.sent_of_type("session.update").is_empty()).await);
    let update = &h.factory.sent_of_type("session.update")[0];
    assert_eq!(update["session"]["input_audio_format"], "pcm16");
    assert_eq!(update["session"]["sample_rate"], 24000);

    assert_eq!(h.session.snapshot().await.phase, SessionPhase::Active);
    assert!(h.session.take_notices().is_none(), "Notices can be taken once");
    Ok(())
}

#[tokio::test]
async fn test_captured_frames_are_forwarded() -> Result<()> {
    let h = harness(Duration::ZERO);
    h.session.start().await?;

    h.mic.send(AudioFrame::new(vec![1, 2, 3, 4], 24000, 1)).await?;
    let mut last = AudioFrame::new(vec![5, 6], 24000, 1);
    last.is_final = true;
    h.mic.send(last).await?;

    assert!(wait_for(Duration::from_secs(1), || h.factory.sent_of_type("input_audio_buffer.append").len() == 2).await);
    let appends = h.factory.sent_of_type("input_audio_buffer.append");
    assert_eq!(appends[0]["audio"], codec::encode(&[1, 2, 3, 4]));
    assert!(appends[0].get("is_final").is_none());
    assert_eq!(appends[1]["is_final"], true);

    let stats = h.session.snapshot().await.recorder;
    assert_eq!(stats.frames_sent, 2);
    assert_eq!(stats.frames_dropped, 0);
    Ok(())
}

#[tokio::test]
async fn test_response_builds_turns_and_plays_audio() -> Result<()> {
    let mut h = harness(Duration::ZERO);
    h.session.start().await?;

    h.factory
        .push(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"what time is it"}"#)
        .await;
    h.factory.push(r#"{"type":"response.text.delta","delta":"It is "}"#).await;
    h.factory.push(r#"{"type":"response.text.delta","delta":"noon"}"#).await;
    let audio = format!(
        r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
        codec::encode(&[10, 20, 30])
    );
    h.factory.push(&audio).await;
    h.factory.push(r#"{"type":"response.text.done"}"#).await;

    let SessionNotice::TurnFinalized(user) = next_notice(&mut h.notices).await else {
        panic!("expected the user turn first");
    };
    assert_eq!(user.role, Role::User);
    assert_eq!(user.content, "what time is it");

    let SessionNotice::TurnFinalized(reply) = next_notice(&mut h.notices).await else {
        panic!("expected the assistant turn");
    };
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "It is noon");
    assert!(!reply.interrupted);

    assert!(wait_for(Duration::from_secs(1), || h.sink.played().len() == 1).await);
    assert_eq!(h.sink.played()[0], vec![10, 20, 30]);

    let snapshot = h.session.snapshot().await;
    assert_eq!(snapshot.turns.len(), 2);
    assert_eq!(snapshot.frames_played, 1);
    Ok(())
}

#[tokio::test]
async fn test_bridge_error_is_surfaced() -> Result<()> {
    let mut h = harness(Duration::ZERO);
    h.session.start().await?;

    h.factory
        .push(r#"{"type":"error","message":"transcription failed: upstream error: 503"}"#)
        .await;

    assert_eq!(
        next_notice(&mut h.notices).await,
        SessionNotice::BridgeError("transcription failed: upstream error: 503".into())
    );
    let snapshot = h.session.snapshot().await;
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("transcription failed: upstream error: 503")
    );
    Ok(())
}

#[tokio::test]
async fn test_connection_drop_interrupts_turn_and_flushes_playback() -> Result<()> {
    let mut h = harness(Duration::from_millis(300));
    h.session.start().await?;

    h.factory.push(r#"{"type":"response.text.delta","delta":"Let me"}"#).await;
    for _ in 0..3 {
        let audio = format!(
            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
            codec::encode(&[1; 8])
        );
        h.factory.push(&audio).await;
    }
    assert!(wait_for(Duration::from_secs(1), || h.session.playback().is_speaking()).await);

    h.factory.drop_connection(1006).await;

    let SessionNotice::TurnFinalized(turn) = next_notice(&mut h.notices).await else {
        panic!("expected the interrupted turn");
    };
    assert_eq!(turn.content, "Let me");
    assert!(turn.interrupted);

    assert!(wait_for(Duration::from_secs(1), || !h.session.playback().is_speaking()).await);
    assert!(h.sink.interrupts() >= 1);

    // Reconnects and completes a fresh handshake
    assert!(wait_for(Duration::from_secs(2), || h.factory.sent_of_type("session.update").len() == 2).await);
    assert_eq!(h.session.connection().state(), ConnectionState::Open);
    assert!(h.sink.played().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_messages_before_handshake_are_ignored() -> Result<()> {
    let h = harness(Duration::ZERO);
    h.factory.skip_handshake();
    h.session.start().await?;

    h.factory.push(r#"{"type":"response.text.delta","delta":"early"}"#).await;
    h.factory
        .push(r#"{"type":"session.connected","session_id":"late"}"#)
        .await;
    h.factory.push(r#"{"type":"response.text.delta","delta":"hi"}"#).await;

    assert!(wait_for(Duration::from_secs(1), || h.factory.sent_of_type("session.update").len() == 1).await);
    let mut turns = Vec::new();
    for _ in 0..100 {
        turns = h.session.snapshot().await.turns;
        if !turns.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].content, "hi");
    Ok(())
}

#[tokio::test]
async fn test_stop_closes_and_reports() -> Result<()> {
    let h = harness(Duration::ZERO);
    h.session.start().await?;
    h.session.commit_turn()?;
    assert_eq!(h.factory.sent_of_type("input_audio_buffer.commit").len(), 1);

    let snapshot = h.session.stop().await;

    assert_eq!(snapshot.connection.state, ConnectionState::Idle);
    assert_eq!(h.factory.close_codes(), vec![1000]);
    assert_eq!(h.session.commit_turn(), Err(VoiceError::NotConnected));

    // Frames after stop are not forwarded
    let _ = h.mic.send(AudioFrame::new(vec![1], 24000, 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.factory.sent_of_type("input_audio_buffer.append").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_recorder_counts_frames_dropped_while_disconnected() -> Result<()> {
    let factory = MockFactory::new();
    let connection = ConnectionManager::new(fast_config(), Arc::new(factory.clone()));
    let (backend, mic) = ChannelBackend::new(16);
    let mut recorder = RecorderManager::new(Box::new(backend), connection.clone(), AudioBackendConfig::default());

    recorder.start().await?;
    assert!(recorder.is_recording());
    assert!(matches!(recorder.start().await, Err(VoiceError::DeviceUnavailable(_))));

    for _ in 0..3 {
        mic.send(AudioFrame::new(vec![0; 240], 24000, 1)).await?;
    }
    assert!(wait_for(Duration::from_secs(1), || recorder.stats().frames_dropped == 3).await);
    assert_eq!(recorder.stats().frames_sent, 0);

    // Capture keeps running; once connected, frames flow
    connection.connect().await?;
    mic.send(AudioFrame::new(vec![0; 240], 24000, 1)).await?;
    assert!(wait_for(Duration::from_secs(1), || recorder.stats().frames_sent == 1).await);
    assert_eq!(recorder.stats().frames_captured, 4);

    recorder.stop().await?;
    recorder.stop().await?;
    assert!(!recorder.is_recording());
    Ok(())
}

#[tokio::test]
async fn test_recorder_downmixes_stereo_capture() -> Result<()> {
    let factory = MockFactory::new();
    let connection = ConnectionManager::new(fast_config(), Arc::new(factory.clone()));
    connection.connect().await?;
    let (backend, mic) = ChannelBackend::new(4);
    let mut recorder = RecorderManager::new(Box::new(backend), connection, AudioBackendConfig::default());
    recorder.start().await?;

    // 48kHz stereo -> 24kHz mono
    mic.send(AudioFrame::new(vec![100, 300, 0, 0, 50, 150, 0, 0], 48000, 2)).await?;

    assert!(wait_for(Duration::from_secs(1), || factory.sent_of_type("input_audio_buffer.append").len() == 1).await);
    let append = &factory.sent_of_type("input_audio_buffer.append")[0];
    assert_eq!(append["audio"], codec::encode(&[200, 100]));

    recorder.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_start_again_after_reconnect_exhausted() -> Result<()> {
    let mut h = harness(Duration::ZERO);
    h.session.start().await?;

    h.factory.fail_next(usize::MAX);
    h.factory.drop_connection(1006).await;

    let terminal = loop {
        match next_notice(&mut h.notices).await {
            SessionNotice::Terminal(err) => break err,
            _ => continue,
        }
    };
    assert_eq!(terminal, VoiceError::ReconnectExhausted { attempts: 5 });
    assert!(wait_for(Duration::from_secs(1), || h.session.connection().state() == ConnectionState::Idle).await);

    // Capture kept running; frames are counted as dropped
    h.mic.send(AudioFrame::new(vec![0; 240], 24000, 1)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.factory.sent_of_type("input_audio_buffer.append").is_empty());
    assert_eq!(h.session.snapshot().await.recorder.frames_dropped, 1);

    h.factory.fail_next(0);
    h.session.start().await?;
    assert_eq!(h.session.connection().state(), ConnectionState::Open);

    h.mic.send(AudioFrame::new(vec![3; 240], 24000, 1)).await?;
    assert!(wait_for(Duration::from_secs(1), || h.factory.sent_of_type("input_audio_buffer.append").len() == 1).await);

    let stats = h.session.snapshot().await.recorder;
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.frames_dropped, 1);
    Ok(())
}

#[tokio::test]
async fn test_stop_then_start_resumes_capture() -> Result<()> {
    let h = harness(Duration::ZERO);
    h.session.start().await?;
    h.session.stop().await;

    h.session.start().await?;
    assert_eq!(h.session.connection().state(), ConnectionState::Open);
    assert_eq!(h.factory.connects(), 2);

    h.mic.send(AudioFrame::new(vec![1, 2], 24000, 1)).await?;
    assert!(wait_for(Duration::from_secs(1), || h.factory.sent_of_type("input_audio_buffer.append").len() == 1).await);
    Ok(())
}
