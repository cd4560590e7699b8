//! Boot-time reconciliation scenarios: the first action at agent start
//! decides the fate of an update that was in flight across the reboot.

use std::sync::Arc;
use std::time::Duration;

use outpost::app::ota::{
    load_record, OtaEngine, OtaTimings, PersistState, OTA_NAMESPACE, REQUEST_ID_KEY, STATE_KEY,
};
use outpost::app::ports::{SettingsPort, SwapType};
use outpost::telemetry::publisher::EventPublisher;

use crate::mock_ports::{FixedClock, MockBoot, MockSettings, RecordingLink};

const UUID: &str = "33333333-3333-3333-3333-333333333333";

fn engine() -> OtaEngine {
    OtaEngine::new(OtaTimings {
        request_timeout: Duration::from_secs(5),
        max_retries: 5,
        retry_delay: Duration::from_millis(1),
        reboot_delay: Duration::from_millis(1),
    })
}

fn publisher_for(link: &RecordingLink) -> EventPublisher {
    EventPublisher::new(Arc::new(link.clone()), Arc::new(FixedClock(1_700_000_000)))
}

/// Stage the persisted record a worker leaves behind right before reboot.
fn stage_record(settings: &mut MockSettings, state: PersistState, uuid: &str) {
    settings
        .save(OTA_NAMESPACE, STATE_KEY, &[state as u8])
        .unwrap();
    let mut raw = uuid.as_bytes().to_vec();
    raw.push(0);
    settings.save(OTA_NAMESPACE, REQUEST_ID_KEY, &raw).unwrap();
}

fn assert_cleared(settings: &MockSettings) {
    let record = load_record(&mut settings.clone()).unwrap();
    assert_eq!(record.state, Some(PersistState::Idle));
    assert_eq!(record.uuid, None);
}

#[test]
fn fresh_swap_confirms_and_reports_success() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    stage_record(&mut settings, PersistState::Reboot, UUID);

    let mut boot = MockBoot::new();
    boot.script_swap_type(SwapType::None);
    boot.script_confirmed(false);

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert_eq!(
        link.trace_for(UUID),
        vec![("Success".to_owned(), 0, "".to_owned())]
    );
    assert_eq!(boot.confirm_calls(), 1);
    assert_cleared(&settings);
}

#[test]
fn reverted_image_reports_system_rollback() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    stage_record(&mut settings, PersistState::Reboot, UUID);

    let mut boot = MockBoot::new();
    boot.script_swap_type(SwapType::Revert);

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert_eq!(
        link.trace_for(UUID),
        vec![("Failure".to_owned(), 0, "SystemRollback".to_owned())]
    );
    assert_eq!(boot.confirm_calls(), 0);
    assert_cleared(&settings);
}

#[test]
fn failed_swap_reports_internal_error() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    stage_record(&mut settings, PersistState::Reboot, UUID);

    let mut boot = MockBoot::new();
    boot.script_swap_type(SwapType::Fail);

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    // A swap failure maps to InternalError on the wire.
    assert_eq!(
        link.trace_for(UUID),
        vec![("Failure".to_owned(), 0, "InternalError".to_owned())]
    );
    assert_cleared(&settings);
}

#[test]
fn crash_mid_update_reports_internal_error() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    // The previous run died between IN_PROGRESS and REBOOT.
    stage_record(&mut settings, PersistState::InProgress, UUID);

    let mut boot = MockBoot::new();

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert_eq!(
        link.trace_for(UUID),
        vec![("Failure".to_owned(), 0, "InternalError".to_owned())]
    );
    assert_cleared(&settings);
}

#[test]
fn already_confirmed_image_is_not_an_ota_boot() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    stage_record(&mut settings, PersistState::Reboot, UUID);

    let mut boot = MockBoot::new();
    boot.script_swap_type(SwapType::None);
    boot.script_confirmed(true);

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert_eq!(
        link.trace_for(UUID),
        vec![("Failure".to_owned(), 0, "InternalError".to_owned())]
    );
    assert_eq!(boot.confirm_calls(), 0);
    assert_cleared(&settings);
}

#[test]
fn no_pending_record_stays_quiet() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    let mut boot = MockBoot::new();

    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert!(link.all().is_empty());
    assert_eq!(boot.confirm_calls(), 0);
    // The record is normalised to IDLE either way.
    assert_cleared(&settings);
}

#[test]
fn malformed_request_id_reads_as_no_pending() {
    let link = RecordingLink::new();
    let publisher = publisher_for(&link);
    let mut settings = MockSettings::new();
    settings
        .save(OTA_NAMESPACE, STATE_KEY, &[PersistState::Reboot as u8])
        .unwrap();
    settings
        .save(OTA_NAMESPACE, REQUEST_ID_KEY, b"not-a-uuid\0")
        .unwrap();

    let mut boot = MockBoot::new();
    engine().reconcile_boot(&mut settings, &mut boot, &publisher);

    assert!(link.all().is_empty());
    assert_cleared(&settings);
}
