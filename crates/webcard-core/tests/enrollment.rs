//! Fingerprint enrollment flows per card family.

// Silence unused crate dependency warnings for test binary
use async_trait as _;
use chrono as _;
use futures as _;
use hex as _;
#[cfg(feature = "pcsc")]
use pcsc as _;
#[cfg(feature = "http")]
use reqwest as _;
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use std::sync::Arc;

use serde_json::{Value, json};
use webcard_core::enrollment::{EnrollmentOutcome, enroll};
use webcard_core::mock::{MockHost, MockReader, MockService, RecordingPresenter, structured};
use webcard_core::reader::CommandOutcome;
use webcard_core::{
    CardFamily, CardIdentity, CardSession, Config, Confirmation, Engine, Error, UiEvent,
};

fn setup(family: CardFamily) -> (Engine, Arc<RecordingPresenter>, Arc<MockReader>, CardSession) {
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = Engine::new(
        Config::default(),
        Arc::new(MockService::new()),
        Arc::new(MockHost::new()),
        presenter.clone(),
    );
    let reader = MockReader::new("reader-1", "3B8F8001");
    let session = CardSession::new(
        reader.clone(),
        CardIdentity {
            card_id: "card-1".to_string(),
            family,
        },
    );
    (engine, presenter, reader, session)
}

fn finger_status(status: &str) -> Value {
    json!({"finger_status": status})
}

#[tokio::test]
async fn family_d_collects_missing_touches_then_finalizes_once() {
    let (engine, presenter, reader, session) = setup(CardFamily::D);
    // Finger 0: four touches, the first already captured. Finger 1 is done.
    reader.push_response(
        "GetEnrollStatus",
        structured(json!({
            "finger_status": "Enroll wip",
            "max_touches": 4,
            "touches_details": [[0, 1]]
        })),
    );
    reader.push_response("GetEnrollStatus", structured(finger_status("Finalized")));
    reader.push_failure("EnrollFingerprint");

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::Enrolled);
    // Three pending touches plus one retry.
    assert_eq!(reader.transceived("EnrollFingerprint"), 4);
    assert_eq!(reader.transceived("FinalizeEnroll"), 1);

    let touch_ids: Vec<String> = reader
        .transcript()
        .into_iter()
        .filter(|t| t.template == "EnrollFingerprint")
        .filter_map(|t| t.params.and_then(|p| p.get("touch_id").cloned()))
        .collect();
    assert_eq!(touch_ids, ["02", "02", "03", "04"]);

    assert_eq!(
        presenter.events_where(|e| matches!(e, UiEvent::TouchFailed { .. })),
        [UiEvent::TouchFailed { finger: 0, touch: 1 }]
    );
    assert_eq!(
        presenter.events_where(|e| matches!(e, UiEvent::TouchCompleted { .. })).len(),
        3
    );
    assert_eq!(
        presenter.events_where(|e| matches!(e, UiEvent::FingerFinalized { .. })),
        [
            UiEvent::FingerFinalized { finger: 0 },
            UiEvent::FingerFinalized { finger: 1 }
        ]
    );
    assert!(presenter.events().contains(&UiEvent::EnrollmentComplete));
    assert_eq!(
        presenter.confirmations(),
        [Confirmation::BeginEnrollment { finger: 0 }]
    );
}

#[tokio::test]
async fn family_d_touches_reached_is_verified_and_finalized() {
    let (engine, presenter, reader, session) = setup(CardFamily::D);
    reader.push_response("GetEnrollStatus", structured(finger_status("Touches reached")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Finalized")));
    // Verification script: before, finalize, after.
    reader.push_response("GetEnrollStatus", structured(finger_status("Touches reached")));
    reader.push_response(
        "GetEnrollStatus",
        structured(finger_status("Enrolled not allowed")),
    );

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::Enrolled);
    assert_eq!(reader.transceived("FinalizeEnroll"), 1);
    assert_eq!(reader.transceived("EnrollFingerprint"), 0);
    assert!(presenter.confirmations().is_empty());
}

#[tokio::test]
async fn family_d_failed_verification_is_reported() {
    let (engine, _presenter, reader, session) = setup(CardFamily::D);
    reader.push_response("GetEnrollStatus", structured(finger_status("Touches reached")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Finalized")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Touches reached")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Enroll wip")));

    let err = enroll(&engine, &session).await.unwrap_err();
    assert!(matches!(err, Error::FinalizeFailed(0)));
}

#[tokio::test]
async fn family_d_invalid_finger_is_reset_after_confirmation() {
    let (engine, presenter, reader, session) = setup(CardFamily::D);
    reader.push_response("GetEnrollStatus", structured(finger_status("Finger invalid")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Not enrolled")));

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::ResetCompleted);
    assert_eq!(reader.transceived("ResetEnroll"), 1);
    assert_eq!(presenter.confirmations(), [Confirmation::ResetEnrollment]);
}

#[tokio::test]
async fn family_d_declined_reset_is_an_integrity_error() {
    let (engine, presenter, reader, session) = setup(CardFamily::D);
    presenter.answer(false);
    reader.push_response("GetEnrollStatus", structured(finger_status("Finger invalid")));
    reader.push_response("GetEnrollStatus", structured(finger_status("Finalized")));

    let err = enroll(&engine, &session).await.unwrap_err();

    assert!(matches!(err, Error::EnrollmentIntegrity(_)));
    assert_eq!(reader.transceived("ResetEnroll"), 0);
}

#[tokio::test]
async fn family_t_retries_a_failed_touch_and_asks_for_reload() {
    let (engine, presenter, reader, session) = setup(CardFamily::T);
    reader.respond(
        "GetEnrollStatus",
        structured(json!({
            "BiometricMode": "normal",
            "VerificationStatus": "enrollment",
            "TouchedEnrolled": 2,
            "TouchedRemain": 1,
            "FingerToEnroll": 0,
            "FingerNumberToEnroll": 1
        })),
    );
    reader.push_failure("EnrollFingerprint");

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::ReloadRequired);
    assert_eq!(reader.transceived("EnrollFingerprint"), 2);
    assert_eq!(
        presenter.confirmations(),
        [
            Confirmation::BeginEnrollment { finger: 0 },
            Confirmation::RetryTouch { finger: 0, touch: 2 }
        ]
    );
    assert!(presenter.events().contains(&UiEvent::ReloadRequested));
}

#[tokio::test]
async fn family_t_outside_enrollment_is_enrolled() {
    let (engine, _presenter, reader, session) = setup(CardFamily::T);
    reader.respond(
        "GetEnrollStatus",
        structured(json!({"BiometricMode": "normal", "VerificationStatus": "verification"})),
    );

    let outcome = enroll(&engine, &session).await.unwrap();
    assert_eq!(outcome, EnrollmentOutcome::Enrolled);
}

#[tokio::test]
async fn family_t_refused_status_read_needs_confirmation() {
    let (engine, presenter, reader, session) = setup(CardFamily::T);
    reader.respond("GetEnrollStatus", CommandOutcome::raw("6A82"));
    presenter.answer(false);

    let err = enroll(&engine, &session).await.unwrap_err();

    assert!(matches!(err, Error::EnrollmentUnverified));
    assert_eq!(presenter.confirmations(), [Confirmation::AssumeEnrolled]);
    assert_eq!(reader.transceived("EnrollFingerprint"), 0);
}

#[tokio::test]
async fn family_t_failed_status_read_is_enrolled_only_when_confirmed() {
    let (engine, presenter, reader, session) = setup(CardFamily::T);
    reader.push_failure("GetEnrollStatus");

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::Enrolled);
    assert_eq!(presenter.confirmations(), [Confirmation::AssumeEnrolled]);
}

#[tokio::test]
async fn family_f_unreadable_status_needs_confirmation() {
    let (engine, presenter, reader, session) = setup(CardFamily::F);
    reader.push_failure("GetEnrollStatus");
    presenter.answer(false);

    let err = enroll(&engine, &session).await.unwrap_err();

    assert!(matches!(err, Error::EnrollmentUnverified));
    assert_eq!(presenter.confirmations(), [Confirmation::AssumeEnrolled]);
}

#[tokio::test]
async fn family_f_postponed_when_user_declines() {
    let (engine, presenter, reader, session) = setup(CardFamily::F);
    reader.respond("GetEnrollStatus", structured(json!({"Status": "finger1"})));
    presenter.answer(false);

    let outcome = enroll(&engine, &session).await.unwrap();

    assert_eq!(outcome, EnrollmentOutcome::Postponed);
    assert_eq!(reader.transceived("EnrollFingerprint"), 0);
}
