//! End-to-end engine tests against the virtual backend

use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use live_audio_core::audio::VirtualBackend;
use live_audio_core::config::EngineConfig;
use live_audio_core::playback::MemoryLoader;
use live_audio_core::error::SessionError;
use live_audio_core::{
    AudioEngine, EngineHandle, Error, ErrorKind, PlaybackState, SessionState, Track,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    backend: VirtualBackend,
    loader: Arc<MemoryLoader>,
    handle: EngineHandle,
    engine: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        live_audio_core::logging::init_for_tests();
        let backend = VirtualBackend::new();
        let loader = Arc::new(MemoryLoader::new());
        let (engine, handle) = AudioEngine::new(
            EngineConfig::default(),
            Arc::new(backend.clone()),
            loader.clone(),
        );
        Self {
            backend,
            loader,
            handle,
            engine: engine.spawn(),
        }
    }
}

/// Mono PCM16 WAV of `seconds` at 8kHz
fn wav(seconds: f64) -> Vec<u8> {
    let samples = (seconds * 8000.0) as u32;
    let data_len = samples * 2;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8000u32.to_le_bytes());
    out.extend_from_slice(&16000u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

/// `seconds` of silent 24kHz PCM16, base64 encoded
fn chunk(seconds: f64) -> String {
    let samples = (seconds * 24000.0) as usize;
    base64::engine::general_purpose::STANDARD.encode(vec![0u8; samples * 2])
}

async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, condition: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(TIMEOUT, rx.wait_for(condition))
        .await
        .expect("timed out waiting for state")
        .expect("engine dropped its state")
        .clone()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn loaded(track: &Track) -> impl FnMut(&PlaybackState) -> bool + '_ {
    move |s| {
        s.active_track.as_ref() == Some(track)
            && s.is_playing
            && s.duration_seconds > 0.0
            && s.last_error.is_none()
    }
}

#[tokio::test]
async fn test_single_track_playback() -> anyhow::Result<()> {
    let h = Harness::new();
    let track = Track::file("intro.wav");
    h.loader.insert("intro.wav", wav(2.0));
    let mut playback = h.handle.subscribe();

    h.handle.play_single(track.clone())?;
    let state = wait_for(&mut playback, loaded(&track)).await;
    assert_eq!(state.duration_seconds, 2.0);
    assert_eq!(h.backend.active_voices().len(), 1);

    h.backend.advance(0.5);
    wait_for(&mut playback, |s| s.position_seconds > 0.0).await;

    h.handle.seek(-5.0)?;
    wait_for(&mut playback, |s| s.position_seconds == 0.0).await;
    h.handle.seek(60.0)?;
    wait_for(&mut playback, |s| s.position_seconds == 2.0).await;

    h.handle.stop()?;
    let state = wait_for(&mut playback, |s| s.active_track.is_none()).await;
    assert_eq!(state, PlaybackState::default());
    eventually(|| h.backend.live_outputs() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_missing_track_surfaces_error() {
    let h = Harness::new();
    let mut playback = h.handle.subscribe();

    h.handle.play_single(Track::file("missing.wav")).unwrap();
    let state = wait_for(&mut playback, |s| s.last_error.is_some()).await;
    assert!(matches!(state.last_error, Some(ErrorKind::PlaybackFailed(_))));
    assert!(!state.is_playing);
    assert_eq!(h.backend.live_outputs(), 0);
}

#[tokio::test]
async fn test_queue_advances_and_recovers_with_retry() {
    let h = Harness::new();
    let tracks: Vec<Track> = ["a.wav", "b.wav", "c.wav"].into_iter().map(Track::file).collect();
    h.loader.insert("a.wav", wav(1.0));
    h.loader.insert("b.wav", b"not audio".to_vec());
    h.loader.insert("c.wav", wav(1.0));
    let mut playback = h.handle.subscribe();
    let mut queue = h.handle.subscribe_queue();

    h.handle.start_queue(tracks.clone(), None).unwrap();
    wait_for(&mut playback, loaded(&tracks[0])).await;

    // A ends, B is delegated and fails to decode
    h.backend.advance(1.0);
    let snapshot = wait_for(&mut queue, |q| q.current_index == Some(1)).await;
    assert!(snapshot.active);
    let state = wait_for(&mut playback, |s| s.last_error.is_some()).await;
    assert_eq!(state.active_track.as_ref(), Some(&tracks[1]));
    assert!(matches!(state.last_error, Some(ErrorKind::PlaybackFailed(_))));
    assert!(!state.is_playing);

    // Nothing is playing, so time passing must not move the queue
    h.backend.advance(5.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.borrow().current_index, Some(1));

    h.loader.insert("b.wav", wav(1.0));
    h.handle.retry().unwrap();
    wait_for(&mut playback, loaded(&tracks[1])).await;

    h.backend.advance(1.0);
    wait_for(&mut queue, |q| q.current_index == Some(2)).await;
    wait_for(&mut playback, loaded(&tracks[2])).await;

    h.backend.advance(1.0);
    let snapshot = wait_for(&mut queue, |q| !q.active).await;
    assert_eq!(snapshot.current_index, None);
    wait_for(&mut playback, |s| s.active_track.is_none()).await;
    eventually(|| h.backend.live_outputs() == 0).await;
}

#[tokio::test]
async fn test_queue_skips() {
    let h = Harness::new();
    let tracks: Vec<Track> = ["a.wav", "b.wav"].into_iter().map(Track::file).collect();
    for track in &tracks {
        h.loader.insert(track.locator.clone(), wav(3.0));
    }
    let mut playback = h.handle.subscribe();
    let mut queue = h.handle.subscribe_queue();

    h.handle.start_queue(tracks.clone(), Some(9)).unwrap();
    wait_for(&mut queue, |q| q.current_index == Some(1)).await;
    wait_for(&mut playback, loaded(&tracks[1])).await;

    h.handle.previous().unwrap();
    wait_for(&mut queue, |q| q.current_index == Some(0)).await;
    wait_for(&mut playback, loaded(&tracks[0])).await;

    h.handle.next().unwrap();
    wait_for(&mut playback, loaded(&tracks[1])).await;
    h.handle.next().unwrap();
    wait_for(&mut queue, |q| !q.active).await;
    wait_for(&mut playback, |s| s.active_track.is_none()).await;
}

#[tokio::test]
async fn test_stop_queue_with_end_in_flight() {
    let h = Harness::new();
    let tracks: Vec<Track> = ["a.wav", "b.wav"].into_iter().map(Track::file).collect();
    for track in &tracks {
        h.loader.insert(track.locator.clone(), wav(1.0));
    }
    let mut playback = h.handle.subscribe();
    let mut queue = h.handle.subscribe_queue();

    h.handle.start_queue(tracks.clone(), None).unwrap();
    wait_for(&mut playback, loaded(&tracks[0])).await;

    // The end of A is queued on the device channel as the stop goes in
    h.backend.advance(1.0);
    h.handle.stop_queue().unwrap();

    let snapshot = wait_for(&mut queue, |q| !q.active).await;
    assert_eq!(snapshot.current_index, None);
    wait_for(&mut playback, |s| *s == PlaybackState::default()).await;
    eventually(|| h.backend.live_outputs() == 0).await;

    // Nothing may restart once the stop has settled
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*playback.borrow(), PlaybackState::default());
    assert!(!queue.borrow().active);
    assert!(h.backend.active_voices().is_empty());
}

#[tokio::test]
async fn test_session_round_trip() -> anyhow::Result<()> {
    let h = Harness::new();
    let frames = Arc::new(Mutex::new(Vec::<Bytes>::new()));
    let turns = Arc::new(AtomicUsize::new(0));

    let sink = frames.clone();
    let counter = turns.clone();
    let session = h
        .handle
        .start_session(
            move |frame| sink.lock().push(frame),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )?;
    let mut snapshots = session.subscribe();
    let id = session.id();

    wait_for(&mut snapshots, |s| {
        s.session_id == Some(id) && s.state == SessionState::Connecting
    })
    .await;
    assert_eq!(h.backend.live_inputs(), 1);

    // Audio may arrive before the handshake
    session.server_audio(chunk(0.5))?;
    session.opened()?;
    wait_for(&mut snapshots, |s| s.state == SessionState::Speaking).await;
    session.server_audio(chunk(0.5))?;
    wait_for(&mut snapshots, |s| s.chunks_scheduled == 2).await;

    let voices = h.backend.active_voices();
    assert_eq!(voices.len(), 2);
    assert_eq!(voices[0].end, voices[1].start);

    h.backend.advance(1.0);
    wait_for(&mut snapshots, |s| s.state == SessionState::Listening).await;
    assert_eq!(turns.load(Ordering::SeqCst), 1);

    h.backend.capture_block(0.25);
    eventually(|| !frames.lock().is_empty()).await;
    // 4096 samples at 48kHz become 1365 PCM16 samples at 16kHz
    assert_eq!(frames.lock()[0].len(), 1365 * 2);

    session.user_stop()?;
    wait_for(&mut snapshots, |s| s.state == SessionState::Analyzing).await;
    assert_eq!(h.backend.live_inputs(), 0);

    session.closed()?;
    wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
    assert_eq!(h.backend.live_outputs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_remote_error_then_acknowledge() {
    let h = Harness::new();
    let session = h.handle.start_session(|_| {}, || {}).unwrap();
    let mut snapshots = session.subscribe();
    let id = session.id();

    session.opened().unwrap();
    wait_for(&mut snapshots, |s| {
        s.session_id == Some(id) && s.state == SessionState::Listening
    })
    .await;
    session.server_audio("@@garbage@@").unwrap();
    wait_for(&mut snapshots, |s| s.chunks_dropped == 1).await;
    assert_eq!(snapshots.borrow().state, SessionState::Listening);

    session.remote_error("connection reset").unwrap();
    let snapshot = wait_for(&mut snapshots, |s| s.state == SessionState::Error).await;
    assert_eq!(snapshot.error, Some(ErrorKind::TransportClosed("connection reset".into())));
    assert_eq!(h.backend.live_outputs(), 0);
    assert_eq!(h.backend.live_inputs(), 0);

    session.acknowledge().unwrap();
    let snapshot = wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn test_session_and_playback_exclude_each_other() {
    let h = Harness::new();
    let track = Track::file("a.wav");
    h.loader.insert("a.wav", wav(2.0));
    let mut playback = h.handle.subscribe();

    h.handle.play_single(track.clone()).unwrap();
    wait_for(&mut playback, loaded(&track)).await;

    let session = h.handle.start_session(|_| {}, || {}).unwrap();
    let mut snapshots = session.subscribe();
    let id = session.id();
    wait_for(&mut snapshots, |s| {
        s.session_id == Some(id) && s.state == SessionState::Connecting
    })
    .await;
    wait_for(&mut playback, |s| s.active_track.is_none()).await;
    assert_eq!(h.backend.live_outputs(), 1);
    assert_eq!(h.backend.outputs_opened(), 2);

    h.handle.play_single(track.clone()).unwrap();
    wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
    wait_for(&mut playback, loaded(&track)).await;
    assert_eq!(h.backend.live_inputs(), 0);

    // Commands for the ended session are ignored
    session.opened().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshots.borrow().state, SessionState::Idle);
}

#[tokio::test]
async fn test_stop_session_allows_restart() {
    let h = Harness::new();
    for _ in 0..3 {
        let session = h.handle.start_session(|_| {}, || {}).unwrap();
        let mut snapshots = session.subscribe();
        let id = session.id();
        session.opened().unwrap();
        wait_for(&mut snapshots, |s| {
        s.session_id == Some(id) && s.state == SessionState::Listening
    })
    .await;

        h.handle.stop_session(&session).unwrap();
        wait_for(&mut snapshots, |s| s.state == SessionState::Idle).await;
        assert_eq!(h.backend.live_outputs(), 0);
        assert_eq!(h.backend.live_inputs(), 0);
    }
    assert_eq!(h.backend.inputs_opened(), 3);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = Harness::new();
    h.loader.insert("a.wav", wav(2.0));
    let track = Track::file("a.wav");
    let mut playback = h.handle.subscribe();

    h.handle.play_single(track.clone()).unwrap();
    wait_for(&mut playback, loaded(&track)).await;

    h.handle.shutdown().unwrap();
    tokio::time::timeout(TIMEOUT, h.engine).await.unwrap().unwrap();
    assert_eq!(h.backend.live_outputs(), 0);
    assert!(matches!(
        h.handle.pause(),
        Err(Error::Session(SessionError::EngineStopped))
    ));
}
