// End-to-end tests for the session engine
//
// The engine runs against an in-memory link, a scripted microphone and a
// recording audio sink, so every turn of the hands-free loop can be driven
// and observed deterministically.

mod common;

use anyhow::Result;
use common::*;
use handsfree_voice::audio::AudioFrame;
use handsfree_voice::session::{ConnectionStatus, SendMode, SessionState};
use handsfree_voice::transport::{LinkEvent, Outgoing, WireMessage};
use handsfree_voice::VoiceError;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn is_end_marker(item: &Outgoing) -> bool {
    matches!(item, Outgoing::Message(WireMessage::Text(t)) if t == "__end__")
}

fn is_binary(item: &Outgoing) -> bool {
    matches!(item, Outgoing::Message(WireMessage::Binary(_)))
}

#[tokio::test]
async fn test_streaming_utterance_sends_one_end_marker() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let mic = h.next_mic().await;

    // 60ms of speech, then 2s of silence; the endpoint fires at 1.5s
    feed(&mic, utterance(3, 2000)).await;

    let snapshot = h
        .wait_until("the utterance to be sent", |s| s.utterances_sent == 1)
        .await;
    assert_eq!(snapshot.state, SessionState::AwaitingReply);

    let sent = server.drain();
    assert_eq!(sent.iter().filter(|m| is_end_marker(m)).count(), 1);
    assert!(is_end_marker(sent.last().unwrap()), "nothing follows the end marker");
    // 3 voiced frames plus the 77 silent ones up to the endpoint
    assert_eq!(sent.iter().filter(|m| is_binary(m)).count(), 80);

    // Capture is down until the reply has played
    assert_eq!(h.mic.stops.load(Ordering::SeqCst), 1);
    assert!(mic.send(silent(5000)).await.is_err());

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_utterance_sends_wav_clip_then_end() -> Result<()> {
    let mut h = harness(test_config(SendMode::Batch));

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let mic = h.next_mic().await;

    feed(&mic, utterance(5, 2000)).await;
    h.wait_until("the clip to be sent", |s| s.utterances_sent == 1)
        .await;

    let sent = server.drain();
    assert_eq!(sent.len(), 2, "one clip and one end marker: {:?}", sent.len());
    match &sent[0] {
        Outgoing::Message(WireMessage::Binary(clip)) => assert_eq!(&clip[..4], b"RIFF"),
        other => panic!("expected a WAV clip, got {:?}", other),
    }
    assert!(is_end_marker(&sent[1]));

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_silent_utterance_is_not_sent() -> Result<()> {
    let mut h = harness(test_config(SendMode::Batch));

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let mic = h.next_mic().await;

    feed(&mic, utterance(0, 2000)).await;
    // Capture keeps running, so the last frame has been processed once the
    // channel takes one more
    mic.send(silent(2000)).await?;
    mic.send(silent(2020)).await?;

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.utterances_sent, 0);
    assert!(snapshot.is_active);
    assert!(server.drain().is_empty());

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_reply_tokens_accumulate_and_audio_starts_immediately() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    let _mic = h.next_mic().await;

    server.say("__mic__:hi there").await;
    server.say("__stream__:Hel").await;
    server.say("__stream__:lo").await;
    server.say(&reply_payload(0.5)).await;

    let snapshot = h
        .wait_until("reply playback", |s| s.state == SessionState::Playing)
        .await;
    assert_eq!(snapshot.reply_text, "Hello");
    assert_eq!(snapshot.transcript, "hi there");

    let scheduled = h.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].start, 0.0);
    assert!((scheduled[0].duration - 0.5).abs() < 1e-6);

    // Capture yields to playback
    assert_eq!(h.mic.stops.load(Ordering::SeqCst), 1);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_reply_buffers_play_back_to_back() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    let _mic = h.next_mic().await;

    server.say(&reply_payload(1.0)).await;
    h.wait_until("first buffer", |s| s.state == SessionState::Playing)
        .await;

    // The device clock has moved on, but B still queues behind A
    h.set_clock(0.3);
    server.say(&reply_payload(0.5)).await;
    server.say("__stream__:done").await;
    h.wait_until("second buffer", |s| s.reply_text == "done").await;

    let scheduled = h.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(scheduled[0].start, 0.0);
    assert!((scheduled[1].start - 1.0).abs() < 1e-6);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_listening_resumes_after_playback_drains() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    let _mic = h.next_mic().await;

    server.say(&reply_payload(0.2)).await;
    server.say(&reply_payload(0.2)).await;
    server.say("__stream__:ok").await;
    h.wait_until("both buffers", |s| s.reply_text == "ok").await;

    let ids: Vec<u64> = h.scheduled().iter().map(|e| e.id).collect();
    assert_eq!(ids.len(), 2);

    h.completions.send(ids[0])?;
    h.completions.send(ids[1])?;

    let snapshot = h
        .wait_until("auto-resume", |s| s.replies_played == 1)
        .await;
    assert_eq!(snapshot.state, SessionState::Listening);
    assert!(snapshot.is_recording);

    // A fresh capture was started for the next turn
    let _mic = h.next_mic().await;
    assert_eq!(h.mic.starts.load(Ordering::SeqCst), 2);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_undecodable_reply_is_dropped() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    let _mic = h.next_mic().await;

    // base64 of "ABC": not audio
    server.say("QUJD").await;
    let snapshot = h
        .wait_until("the payload to be dropped", |s| s.payloads_dropped == 1)
        .await;
    assert_eq!(snapshot.state, SessionState::Listening);
    assert!(h.scheduled().is_empty());

    // Unknown text is logged and skipped
    server.say("__mystery__:42").await;
    server.say(&reply_payload(0.1)).await;
    h.wait_until("the next payload to play", |s| {
        s.state == SessionState::Playing
    })
    .await;
    assert_eq!(h.scheduled().len(), 1);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_session_id_is_resumed_on_every_reconnect() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    let _mic = h.next_mic().await;

    server.say("__session__:S1").await;
    h.wait_until("the session id", |s| s.session_id.as_deref() == Some("S1"))
        .await;

    // Two link losses in a row
    drop(server);
    let mut second = h.next_link().await;
    assert_eq!(
        second.next_message().await,
        Some(WireMessage::Text("__session__:S1".to_string()))
    );
    second.say("__session__:S1").await;

    drop(second);
    let mut third = h.next_link().await;
    assert_eq!(
        third.next_message().await,
        Some(WireMessage::Text("__session__:S1".to_string()))
    );

    // A different id is not adopted
    third.say("__session__:S2").await;
    third.say("__stream__:still here").await;
    let snapshot = h
        .wait_until("the reconnected link", |s| s.reply_text == "still here")
        .await;
    assert_eq!(snapshot.session_id.as_deref(), Some("S1"));
    assert_eq!(snapshot.connection, ConnectionStatus::Connected);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_batch_turn_survives_link_lost_at_endpoint() -> Result<()> {
    let mut config = test_config(SendMode::Batch);
    config.endpoint.silence_duration = Duration::from_millis(200);
    let mut h = harness(config);

    h.handle.start().await?;
    let server = h.next_link().await;
    let mic = h.next_mic().await;

    // The server is gone before the engine reads any of the utterance, so
    // the clip send is the first to notice
    drop(server);
    feed(&mic, utterance(3, 400)).await;

    let mut next = h.next_link().await;
    match next.next_message().await {
        Some(WireMessage::Binary(clip)) => assert_eq!(&clip[..4], b"RIFF"),
        other => panic!("expected the held clip, got {:?}", other),
    }
    assert_eq!(
        next.next_message().await,
        Some(WireMessage::Text("__end__".to_string()))
    );

    let snapshot = h
        .wait_until("the turn to be delivered", |s| s.utterances_sent == 1)
        .await;
    assert_eq!(snapshot.state, SessionState::AwaitingReply);
    assert_eq!(snapshot.connection, ConnectionStatus::Connected);
    assert_eq!(h.link.attempts.load(Ordering::SeqCst), 2);

    // The turn completes normally on the new link
    next.say(&reply_payload(0.2)).await;
    let id = {
        h.wait_until("the reply", |s| s.state == SessionState::Playing)
            .await;
        h.scheduled()[0].id
    };
    h.completions.send(id)?;
    h.wait_until("listening again", |s| s.replies_played == 1)
        .await;
    let _mic = h.next_mic().await;

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_streaming_frames_held_across_lost_link() -> Result<()> {
    let mut config = test_config(SendMode::Streaming);
    config.endpoint.silence_duration = Duration::from_millis(200);
    let mut h = harness(config);

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let mic = h.next_mic().await;

    feed(&mic, vec![voiced(0), voiced(20)]).await;
    for _ in 0..2 {
        assert!(matches!(server.next_message().await, Some(WireMessage::Binary(_))));
    }

    // Link dies mid-utterance; the next frame's send fails
    drop(server);
    let rest: Vec<AudioFrame> = (2..4)
        .map(|i| voiced(i * FRAME_MS))
        .chain((4..20).map(|i| silent(i * FRAME_MS)))
        .collect();
    feed(&mic, rest).await;

    let mut next = h.next_link().await;
    h.wait_until("the utterance to finish", |s| s.utterances_sent == 1)
        .await;

    let sent = next.drain();
    // Frames at 40ms and 60ms were held, then silence up to the endpoint at 300ms
    assert_eq!(sent.iter().filter(|m| is_binary(m)).count(), 14);
    assert_eq!(sent.len(), 15);
    assert!(is_end_marker(sent.last().unwrap()));

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, SessionState::AwaitingReply);
    assert_eq!(snapshot.connection, ConnectionStatus::Connected);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_end_conversation_forgets_the_session() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    server.say("__session__:S1").await;
    h.wait_until("the session id", |s| s.session_id.is_some())
        .await;

    h.handle.end_conversation().await?;
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.session_id, None);
    assert_eq!(snapshot.state, SessionState::Idle);

    // The next conversation starts without a resume
    h.handle.start().await?;
    let mut fresh = h.next_link().await;
    assert!(fresh.drain().is_empty());

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_twice_tears_down_once() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let _mic = h.next_mic().await;

    h.handle.stop().await?;
    h.handle.stop().await?;

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.is_recording);
    assert!(!snapshot.is_active);
    assert_eq!(snapshot.connection, ConnectionStatus::Disconnected);

    let mut closes = 0;
    while let Some(item) = server.outgoing.recv().await {
        if matches!(item, Outgoing::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
    assert_eq!(h.mic.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.lock().unwrap().stop_alls, 1);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_reply_after_stop_is_ignored() -> Result<()> {
    let mut h = harness(test_config(SendMode::Streaming));

    h.handle.start().await?;
    let server = h.next_link().await;
    h.handle.stop().await?;

    // The link is gone; nothing the server says reaches playback
    let _ = server
        .incoming
        .send(LinkEvent::Message(WireMessage::Text(reply_payload(0.1))))
        .await;
    tokio::task::yield_now().await;

    assert!(h.scheduled().is_empty());
    assert_eq!(h.handle.snapshot().state, SessionState::Idle);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_closes_link_once_and_keeps_session() -> Result<()> {
    let mut config = test_config(SendMode::Streaming);
    config.inactivity_timeout = Duration::from_secs(10);
    let mut h = harness(config);

    h.handle.start().await?;
    let mut server = h.next_link().await;
    let mic = h.next_mic().await;

    server.say("__session__:S1").await;
    h.wait_until("the session id", |s| s.session_id.is_some())
        .await;

    let snapshot = h
        .wait_until("the idle link to close", |s| {
            s.connection == ConnectionStatus::Disconnected
        })
        .await;
    assert_eq!(snapshot.session_id.as_deref(), Some("S1"));
    assert!(snapshot.is_recording, "the session outlives the link");

    let mut closes = 0;
    while let Some(item) = server.outgoing.recv().await {
        if matches!(item, Outgoing::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
    assert!(h.links.try_recv().is_err(), "no eager reconnect");

    // Speaking again brings the link back with the same session
    mic.send(voiced(0)).await?;
    let mut next = h.next_link().await;
    assert_eq!(
        next.next_message().await,
        Some(WireMessage::Text("__session__:S1".to_string()))
    );
    assert!(matches!(next.next_message().await, Some(WireMessage::Binary(_))));

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_consecutive_connect_failures() -> Result<()> {
    let h = harness(test_config(SendMode::Streaming));
    h.link.fail.store(true, Ordering::SeqCst);

    h.handle.start().await?;

    let snapshot = h
        .wait_until("reconnects to be exhausted", |s| {
            s.connection == ConnectionStatus::Failed
        })
        .await;
    assert!(!snapshot.is_recording);
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("3 failed"));
    assert_eq!(h.link.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.mic.stops.load(Ordering::SeqCst), 1);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_capture_failure_reports_and_stays_idle() -> Result<()> {
    let h = harness(test_config(SendMode::Streaming));
    h.mic.fail.store(true, Ordering::SeqCst);

    let result = h.handle.start().await;
    assert!(matches!(result, Err(VoiceError::CaptureUnavailable(_))));

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.is_recording);
    assert!(snapshot.last_error.is_some());
    assert_eq!(h.link.attempts.load(Ordering::SeqCst), 0);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_pending_capture_acquisition() -> Result<()> {
    let h = harness(test_config(SendMode::Streaming));
    h.mic.hang.store(true, Ordering::SeqCst);

    let handle = h.handle.clone();
    let start = tokio::spawn(async move { handle.start().await });

    h.mic.entered.notified().await;
    h.handle.stop().await?;

    assert!(start.await?.is_ok());
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.is_recording);
    assert_eq!(h.link.attempts.load(Ordering::SeqCst), 0);

    h.handle.shutdown().await?;
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_handle_reports_closed_engine() -> Result<()> {
    let h = harness(test_config(SendMode::Streaming));

    h.handle.shutdown().await?;
    h.task.await?;

    assert!(matches!(h.handle.start().await, Err(VoiceError::SessionClosed)));
    Ok(())
}
