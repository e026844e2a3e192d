mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{context, wait_for, RecordingNotifier, Script, ScriptedDetector, ScriptedOpener};
use helmet_guard::{LogLevel, Monitor, NoopConfigWriter, PipelineEngine, PipelineError, SourceConfig};

const CLEAN: u8 = 0;
const VIOLATION: u8 = 1;
const BROKEN: u8 = 2;

fn logged(monitor_logs: &[helmet_guard::LogEntry], level: LogLevel, needle: &str) -> usize {
    monitor_logs
        .iter()
        .filter(|entry| entry.level == level && entry.message.contains(needle))
        .count()
}

#[test]
fn looping_clip_counts_violations_and_throttles_alerts() {
    // Three-frame clip played five times over: violations land on frames 2 and 5.
    let opener = ScriptedOpener::new().with("clip", Script::limited(&[CLEAN, VIOLATION, CLEAN], 5));
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = context(
        opener.clone(),
        ScriptedDetector::new(&[VIOLATION], &[]),
        Arc::clone(&notifier),
    );
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("clip"), ctx, true).expect("engine starts");
    assert!(wait_for(|| {
        let stats = store.stats();
        stats.total_detections == 5 && stats.violations_detected == 2
    }));
    thread::sleep(Duration::from_millis(50));
    engine.stop();

    let stats = store.stats();
    assert_eq!(stats.total_detections, 5);
    assert_eq!(stats.violations_detected, 2);
    assert_eq!(stats.notifications_sent, 1);
    assert!(!stats.camera_active);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "-100123");
    assert!(sent[0].0 > 0);

    let (_, violation) = store.frame().expect("frame published");
    assert!(violation, "last frame of the run was the violation");
    assert_eq!(opener.events(), vec!["open:clip", "close:clip"]);
}

#[test]
fn detector_failures_publish_raw_frames_and_are_rate_limited_in_the_log() {
    let opener = ScriptedOpener::new().with("clip", Script::limited(&[BROKEN], 3));
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = context(opener, ScriptedDetector::new(&[], &[BROKEN]), notifier);
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("clip"), ctx, true).expect("engine starts");
    assert!(wait_for(|| store.frame().is_some()));
    thread::sleep(Duration::from_millis(100));
    engine.stop();

    let stats = store.stats();
    assert_eq!(stats.total_detections, 0);
    assert_eq!(stats.violations_detected, 0);
    let (_, violation) = store.frame().expect("raw frame published");
    assert!(!violation);
    assert_eq!(logged(&store.logs(), LogLevel::Error, "detection error"), 1);
}

#[test]
fn inactive_detection_still_publishes_frames() {
    let opener = ScriptedOpener::new().with("cam", Script::looping(&[VIOLATION]));
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = context(
        opener,
        ScriptedDetector::new(&[VIOLATION], &[]),
        Arc::clone(&notifier),
    );
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("cam"), ctx, false).expect("engine starts");
    assert!(wait_for(|| store.frame().is_some()));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(store.stats().violations_detected, 0);
    assert!(notifier.sent().is_empty());

    assert!(engine.toggle_detection());
    assert!(store.detection_active());
    assert!(wait_for(|| store.stats().violations_detected > 0));
    assert!(wait_for(|| notifier.sent().len() == 1));

    assert!(!engine.toggle_detection());
    engine.stop();
    let logs = store.logs();
    assert_eq!(logged(&logs, LogLevel::System, "detection enabled"), 1);
    assert_eq!(logged(&logs, LogLevel::System, "detection disabled"), 1);
}

#[test]
fn refused_alert_does_not_start_the_cooldown() {
    let opener = ScriptedOpener::new().with("cam", Script::looping(&[VIOLATION]));
    let notifier = Arc::new(RecordingNotifier::default());
    notifier.set_refuse(true);
    let ctx = context(
        opener,
        ScriptedDetector::new(&[VIOLATION], &[]),
        Arc::clone(&notifier),
    );
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("cam"), ctx, true).expect("engine starts");
    assert!(wait_for(|| logged(&store.logs(), LogLevel::Error, "alert not sent") > 0));
    assert_eq!(store.stats().notifications_sent, 0);

    notifier.set_refuse(false);
    assert!(wait_for(|| store.stats().notifications_sent == 1));
    thread::sleep(Duration::from_millis(30));
    engine.stop();

    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(store.stats().notifications_sent, 1);
}

#[test]
fn refused_alerts_do_not_flood_the_log() {
    let opener = ScriptedOpener::new().with("cam", Script::looping(&[VIOLATION]));
    let notifier = Arc::new(RecordingNotifier::default());
    notifier.set_refuse(true);
    let mut ctx = context(
        opener,
        ScriptedDetector::new(&[VIOLATION], &[]),
        Arc::clone(&notifier),
    );
    ctx.settings.detection_log_every = 50;
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("cam"), ctx, true).expect("engine starts");
    assert!(wait_for(|| notifier.attempts() >= 150));
    engine.stop();

    let attempts = notifier.attempts();
    let logs = store.logs();
    let refusals = logged(&logs, LogLevel::Error, "alert not sent");
    assert!(refusals >= 3);
    assert!(
        refusals <= attempts / 50 + 1,
        "{refusals} refusal entries for {attempts} attempts"
    );
    assert_eq!(logged(&logs, LogLevel::System, "camera started"), 1);
    assert_eq!(store.stats().notifications_sent, 0);
}

#[test]
fn source_that_keeps_ending_is_paced_by_the_frame_interval() {
    // No frames at all: every read reports end of stream and rewinds.
    let opener = ScriptedOpener::new().with("empty", Script::looping(&[]));
    let mut ctx = context(
        opener.clone(),
        ScriptedDetector::new(&[], &[]),
        Arc::new(RecordingNotifier::default()),
    );
    ctx.settings.frame_interval = Duration::from_millis(10);
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("empty"), ctx, true).expect("engine starts");
    thread::sleep(Duration::from_millis(300));
    engine.stop();

    let reads = opener.reads();
    assert!(reads > 0);
    assert!(reads < 100, "{reads} reads in 300ms");
    assert!(store.frame().is_none());
    assert_eq!(opener.events(), vec!["open:empty", "close:empty"]);
}

#[test]
fn stop_is_idempotent() {
    let opener = ScriptedOpener::new().with("cam", Script::looping(&[CLEAN]));
    let ctx = context(
        opener.clone(),
        ScriptedDetector::new(&[], &[]),
        Arc::new(RecordingNotifier::default()),
    );
    let store = Arc::clone(&ctx.store);

    let mut engine =
        PipelineEngine::start(SourceConfig::file("cam"), ctx, true).expect("engine starts");
    assert!(engine.is_running());
    engine.stop();
    engine.stop();
    drop(engine);

    assert!(!store.camera_active());
    assert_eq!(opener.events(), vec!["open:cam", "close:cam"]);
    assert_eq!(logged(&store.logs(), LogLevel::System, "pipeline stopped"), 1);
}

#[test]
fn unavailable_source_fails_to_start() {
    let opener = ScriptedOpener::new().with("gone", Script::unavailable());
    let ctx = context(
        opener,
        ScriptedDetector::new(&[], &[]),
        Arc::new(RecordingNotifier::default()),
    );
    let store = Arc::clone(&ctx.store);

    let err = PipelineEngine::start(SourceConfig::file("gone"), ctx, true)
        .err()
        .expect("start fails");
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert!(!store.camera_active());
    assert_eq!(logged(&store.logs(), LogLevel::Error, "failed to start camera"), 1);
}

#[test]
fn changing_source_closes_the_old_one_before_opening_the_new_one() {
    let opener = ScriptedOpener::new()
        .with("a", Script::looping(&[CLEAN]))
        .with("b", Script::looping(&[VIOLATION]))
        .with("gone", Script::unavailable());
    let ctx = context(
        opener.clone(),
        ScriptedDetector::new(&[VIOLATION], &[]),
        Arc::new(RecordingNotifier::default()),
    );
    let store = Arc::clone(&ctx.store);
    let monitor = Monitor::new(
        ctx,
        SourceConfig::file("a"),
        Box::new(NoopConfigWriter),
        "/nonexistent/helmet-media",
    );

    monitor.start().expect("first generation");
    assert!(wait_for(|| store.frame().is_some()));
    monitor
        .change_source(SourceConfig::file("b"))
        .expect("second generation");
    assert_eq!(opener.events(), vec!["open:a", "close:a", "open:b"]);
    assert_eq!(monitor.active_source(), SourceConfig::file("b"));
    assert!(monitor.is_running());

    // Detection stays on across generations.
    assert!(wait_for(|| store.stats().violations_detected > 0));

    let err = monitor
        .change_source(SourceConfig::file("gone"))
        .expect_err("unavailable source");
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert!(!monitor.is_running());
    assert!(!store.camera_active());
    assert_eq!(monitor.active_source(), SourceConfig::file("b"));
    assert_eq!(
        opener.events(),
        vec!["open:a", "close:a", "open:b", "close:b"]
    );

    monitor.shutdown();
}

#[test]
fn stalled_read_keeps_the_next_source_closed_until_it_returns() {
    let opener = ScriptedOpener::new()
        .with("a", Script::blocking(&[CLEAN], Duration::from_millis(400)))
        .with("b", Script::looping(&[CLEAN]));
    let mut ctx = context(
        opener.clone(),
        ScriptedDetector::new(&[], &[]),
        Arc::new(RecordingNotifier::default()),
    );
    ctx.settings.stop_timeout = Duration::from_millis(50);
    let store = Arc::clone(&ctx.store);
    let monitor = Monitor::new(
        ctx,
        SourceConfig::file("a"),
        Box::new(NoopConfigWriter),
        "/nonexistent/helmet-media",
    );

    monitor.start().expect("first generation");
    assert!(wait_for(|| opener.reads() > 0));
    let err = monitor
        .change_source(SourceConfig::file("b"))
        .expect_err("old source still held");
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert_eq!(opener.events(), vec!["open:a"]);
    assert_eq!(monitor.active_source(), SourceConfig::file("a"));
    assert!(!monitor.is_running());
    assert_eq!(logged(&store.logs(), LogLevel::Error, "stalled read"), 1);

    // The detached loop closes its source once the read returns.
    assert!(wait_for(|| opener.events().len() == 2));
    monitor
        .change_source(SourceConfig::file("b"))
        .expect("retry after release");
    assert_eq!(opener.events(), vec!["open:a", "close:a", "open:b"]);
    assert_eq!(monitor.active_source(), SourceConfig::file("b"));

    monitor.shutdown();
}
