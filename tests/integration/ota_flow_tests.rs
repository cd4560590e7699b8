//! End-to-end update scenarios: happy path, network flake, retry
//! exhaustion, cancellation, duplicate admission.

use std::sync::Arc;
use std::time::Duration;

use outpost::app::commands::OtaRequest;
use outpost::app::ota::{load_record, OtaEngine, OtaTimings, PersistState, WorkerPorts};
use outpost::telemetry::publisher::EventPublisher;

use crate::mock_ports::{
    assert_progress_invariant, DownloadScript, FixedClock, MockBank, MockBoot, MockSettings,
    RecordingLink, ScriptedDownloader,
};

const UUID_A: &str = "11111111-1111-1111-1111-111111111111";
const UUID_B: &str = "22222222-2222-2222-2222-222222222222";

fn timings() -> OtaTimings {
    OtaTimings {
        request_timeout: Duration::from_secs(5),
        max_retries: 5,
        retry_delay: Duration::from_millis(1),
        reboot_delay: Duration::from_millis(1),
    }
}

fn publisher_for(link: &RecordingLink) -> EventPublisher {
    EventPublisher::new(Arc::new(link.clone()), Arc::new(FixedClock(1_700_000_000)))
}

fn request(uuid: &str) -> OtaRequest {
    OtaRequest {
        uuid: uuid.to_owned(),
        download_url: "https://updates.example/fw.bin".to_owned(),
    }
}

fn entry(status: &str, progress: i32, code: &str) -> (String, i32, String) {
    (status.to_owned(), progress, code.to_owned())
}

/// `Ack, Downloading(0..=100 step 10)` prefix of a clean download.
fn happy_download_prefix() -> Vec<(String, i32, String)> {
    let mut expected = vec![entry("Acknowledged", 0, ""), entry("Downloading", 0, "")];
    for p in (10..=100).step_by(10) {
        expected.push(entry("Downloading", p, ""));
    }
    expected
}

// ── S1: happy path ───────────────────────────────────────────

#[test]
fn happy_path_emits_full_trace_and_persists_reboot() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    let bank = MockBank::new();
    let boot = MockBoot::new();
    let engine = OtaEngine::new(timings());

    let http = ScriptedDownloader::new(vec![DownloadScript::Succeed {
        total: 1000,
        chunk: 100,
    }]);

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: bank.clone(),
                boot: boot.clone(),
                http,
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    let mut expected = happy_download_prefix();
    expected.push(entry("Deploying", 0, ""));
    expected.push(entry("Deployed", 0, ""));
    expected.push(entry("Rebooting", 0, ""));

    let trace = link.trace_for(UUID_A);
    assert_eq!(trace, expected);
    assert_progress_invariant(&trace);

    // The image landed in the bank and the bootloader was told to test it.
    assert_eq!(bank.data().len(), 1000);
    assert!(boot.upgrade_requested());
    assert!(boot.reboot_requested());

    // The persisted record survives the (simulated) reboot.
    let record = load_record(&mut settings.clone()).unwrap();
    assert_eq!(record.state, Some(PersistState::Reboot));
    assert_eq!(record.uuid.as_deref(), Some(UUID_A));

    // On hardware the device resets here; the token is never released.
    assert!(engine.is_busy());
}

// ── S2: network flake, fourth attempt succeeds ───────────────

#[test]
fn transient_failures_retry_and_recover() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    let bank = MockBank::new();
    let boot = MockBoot::new();
    let engine = OtaEngine::new(timings());

    let http = ScriptedDownloader::new(vec![
        DownloadScript::Refuse,
        DownloadScript::Refuse,
        DownloadScript::Refuse,
        DownloadScript::Succeed {
            total: 1000,
            chunk: 100,
        },
    ]);

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: bank.clone(),
                boot: boot.clone(),
                http,
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    let mut expected = vec![entry("Acknowledged", 0, "")];
    for _ in 0..3 {
        expected.push(entry("Downloading", 0, ""));
        expected.push(entry("Error", 0, "ErrorNetwork"));
    }
    expected.push(entry("Downloading", 0, ""));
    for p in (10..=100).step_by(10) {
        expected.push(entry("Downloading", p, ""));
    }
    expected.push(entry("Deploying", 0, ""));
    expected.push(entry("Deployed", 0, ""));
    expected.push(entry("Rebooting", 0, ""));

    let trace = link.trace_for(UUID_A);
    assert_eq!(trace, expected);
    assert_progress_invariant(&trace);

    // Each attempt re-erases the bank before writing.
    assert_eq!(bank.erase_count(), 4);
}

// ── S3: retries exhausted ────────────────────────────────────

#[test]
fn exhausted_retries_end_in_failure_and_idle_record() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    let engine = OtaEngine::new(timings());

    // No scripts at all: every attempt is refused.
    let http = ScriptedDownloader::new(vec![]);

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: MockBank::new(),
                boot: MockBoot::new(),
                http,
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    let mut expected = vec![entry("Acknowledged", 0, "")];
    for _ in 0..5 {
        expected.push(entry("Downloading", 0, ""));
        expected.push(entry("Error", 0, "ErrorNetwork"));
    }
    expected.push(entry("Failure", 0, "ErrorNetwork"));

    assert_eq!(link.trace_for(UUID_A), expected);

    let record = load_record(&mut settings.clone()).unwrap();
    assert_eq!(record.state, Some(PersistState::Idle));
    assert_eq!(record.uuid, None);
    assert!(!engine.is_busy());
}

// ── S4: cancel during download ───────────────────────────────

#[test]
fn cancel_mid_download_unwinds_with_canceled() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    let engine = Arc::new(OtaEngine::new(timings()));

    // After the chunk that reports 30%, issue a Cancel carrying a
    // different uuid (the engine cancels whatever is running).
    let hook_engine = engine.clone();
    let hook_publisher = publisher_for(&link);
    let mut hook_settings = settings.clone();
    let http = ScriptedDownloader::new(vec![DownloadScript::Succeed {
        total: 1000,
        chunk: 100,
    }])
    .with_chunk_hook(Box::new(move |index| {
        if index == 2 {
            hook_engine
                .handle_cancel(UUID_B, &mut hook_settings, &hook_publisher)
                .unwrap();
        }
    }));

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: MockBank::new(),
                boot: MockBoot::new(),
                http,
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    let expected = vec![
        entry("Acknowledged", 0, ""),
        entry("Downloading", 0, ""),
        entry("Downloading", 10, ""),
        entry("Downloading", 20, ""),
        entry("Downloading", 30, ""),
        entry("Failure", 0, "Canceled"),
    ];
    assert_eq!(link.trace_for(UUID_A), expected);

    // The uuid mismatch is surfaced in the terminal event message.
    let failure = link.all().into_iter().last().unwrap();
    assert!(failure.message.contains("does not match"));

    let record = load_record(&mut settings.clone()).unwrap();
    assert_eq!(record.state, Some(PersistState::Idle));
    assert_eq!(record.uuid, None);
    assert!(!engine.is_busy());
}

#[test]
fn cancel_without_running_update_is_rejected() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    let engine = OtaEngine::new(timings());

    assert!(engine
        .handle_cancel(UUID_A, &mut settings, &publisher)
        .is_err());

    let trace = link.trace_for(UUID_A);
    assert_eq!(trace, vec![entry("Failure", 0, "InvalidRequest")]);
    let rejection = link.all().into_iter().next().unwrap();
    assert!(rejection.message.contains("no OTA update running"));
}

// ── S5: duplicate update while one is running ────────────────

#[test]
fn second_update_is_rejected_while_first_runs() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    let engine = Arc::new(OtaEngine::new(timings()));

    // From inside the first transfer, try to admit a second update.
    let hook_engine = engine.clone();
    let hook_publisher = publisher_for(&link);
    let hook_settings = settings.clone();
    let mut second_ports = Some(WorkerPorts {
        settings: hook_settings,
        bank: MockBank::new(),
        boot: MockBoot::new(),
        http: ScriptedDownloader::new(vec![]),
    });
    let http = ScriptedDownloader::new(vec![DownloadScript::Succeed {
        total: 1000,
        chunk: 100,
    }])
    .with_chunk_hook(Box::new(move |index| {
        if index == 0 {
            if let Some(ports) = second_ports.take() {
                let res = hook_engine.handle_update(request(UUID_B), ports, &hook_publisher);
                assert!(res.is_err());
            }
        }
    }));

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: MockBank::new(),
                boot: MockBoot::new(),
                http,
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    // B got exactly one rejection event, with its own uuid.
    assert_eq!(
        link.trace_for(UUID_B),
        vec![entry("Failure", 0, "UpdateAlreadyInProgress")]
    );

    // A was unaffected and ran to the reboot request.
    let trace_a = link.trace_for(UUID_A);
    assert_eq!(trace_a.last().unwrap().0, "Rebooting");
    assert_progress_invariant(&trace_a);
}

// ── Failure mapping details ──────────────────────────────────

#[test]
fn settings_init_failure_surfaces_as_io_error() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let settings = MockSettings::new();
    settings.fail_init(true);
    let engine = OtaEngine::new(timings());

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: settings.clone(),
                bank: MockBank::new(),
                boot: MockBoot::new(),
                http: ScriptedDownloader::new(vec![]),
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    assert_eq!(
        link.trace_for(UUID_A),
        vec![entry("Acknowledged", 0, ""), entry("Failure", 0, "IOError")]
    );
    assert!(!engine.is_busy());
}

#[test]
fn erase_failure_retries_then_fails_internal() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let bank = MockBank::new();
    bank.fail_erase(true);
    let engine = OtaEngine::new(timings());

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: MockSettings::new(),
                bank: bank.clone(),
                boot: MockBoot::new(),
                http: ScriptedDownloader::new(vec![DownloadScript::Succeed {
                    total: 100,
                    chunk: 100,
                }]),
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    let mut expected = vec![entry("Acknowledged", 0, "")];
    for _ in 0..5 {
        expected.push(entry("Downloading", 0, ""));
        expected.push(entry("Error", 0, "InternalError"));
    }
    expected.push(entry("Failure", 0, "InternalError"));
    assert_eq!(link.trace_for(UUID_A), expected);
}

// ── Event stream sanity across a mixed run ───────────────────

#[test]
fn recorded_events_carry_publisher_timestamp() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let engine = OtaEngine::new(timings());

    engine
        .handle_update(
            request(UUID_A),
            WorkerPorts {
                settings: MockSettings::new(),
                bank: MockBank::new(),
                boot: MockBoot::new(),
                http: ScriptedDownloader::new(vec![DownloadScript::Succeed {
                    total: 100,
                    chunk: 100,
                }]),
            },
            &publisher,
        )
        .unwrap();
    engine.wait_for_worker();

    assert!(link.all().iter().all(|e| e.timestamp == 1_700_000_000));
}
