//! Page controller flows driven by reader events.

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

use serde_json::json;
use tokio::sync::mpsc;
use webcard_core::mock::{MockHost, MockReader, MockService, RecordingPresenter, structured};
use webcard_core::service::{AtrCandidates, OneOrMany, PersonalizationRequest, SupportedCard};
use webcard_core::{
    Config, Confirmation, Engine, Level, PageController, PageMode, ReaderEvent, ReaderStatus,
    UiEvent,
};

const ATR: &str = "3B8F800180";

struct Harness {
    service: Arc<MockService>,
    host: Arc<MockHost>,
    presenter: Arc<RecordingPresenter>,
    controller: Arc<PageController>,
}

fn harness(family: &str, mode: PageMode) -> Harness {
    let service = Arc::new(MockService::new());
    service.set_supported_cards(vec![SupportedCard {
        atr: "3B-8F-80".to_string(),
        family: family.to_string(),
    }]);
    service.set_candidates(
        ATR,
        AtrCandidates {
            ids: Some(OneOrMany::One("card-1".to_string())),
            families: Some(OneOrMany::One(family.to_string())),
            probe: None,
        },
    );
    let host = Arc::new(MockHost::new());
    let presenter = Arc::new(RecordingPresenter::new());
    let engine = Arc::new(Engine::new(
        Config::default(),
        service.clone(),
        host.clone(),
        presenter.clone(),
    ));
    Harness {
        service,
        host,
        presenter,
        controller: PageController::new(engine, mode),
    }
}

fn dashboard() -> PageMode {
    PageMode::Dashboard {
        email: "ada@example.com".to_string(),
    }
}

fn enrolled_d_card(reader: &MockReader) {
    reader.respond(
        "GetEnrollStatus",
        structured(json!({"finger_status": "Finalized"})),
    );
    reader.respond(
        "ReadSequenceInfo",
        structured(json!({"Account": [], "OTP_type": [], "Account_len": [0]})),
    );
}

#[tokio::test]
async fn scan_classifies_readers_and_loads_the_supported_card() {
    let h = harness("D", dashboard());
    let reader = MockReader::new("reader-1", ATR);
    enrolled_d_card(&reader);
    h.host.attach(MockReader::empty("reader-0"));
    h.host.attach(MockReader::new("reader-2", "3B6E00"));
    h.host.attach(reader.clone());

    let slots = h.controller.scan().await.unwrap();
    h.controller.settle().await;

    let statuses: Vec<_> = slots.iter().map(|slot| slot.status).collect();
    assert_eq!(
        statuses,
        [
            ReaderStatus::Empty,
            ReaderStatus::Unsupported,
            ReaderStatus::Supported
        ]
    );

    let session = h.controller.session().unwrap();
    assert_eq!(session.card_id(), "card-1");
    assert_eq!(session.reader_name(), "reader-1");

    let events = h.presenter.events();
    assert!(events.contains(&UiEvent::CardRecognized {
        reader: "reader-1".to_string(),
        card_id: "card-1".to_string(),
        family: "D".to_string(),
    }));
    assert!(events.contains(&UiEvent::EnrollmentComplete));
    assert!(events.contains(&UiEvent::NoSequences));

    // A second scan keeps the session and the cached card list.
    h.controller.scan().await.unwrap();
    assert_eq!(h.service.supported_calls(), 1);
    assert_eq!(h.service.atr_checks(), 1);
}

#[tokio::test]
async fn event_loop_loads_and_unloads_cards() {
    let h = harness("D", dashboard());
    let reader = MockReader::new("reader-1", ATR);
    enrolled_d_card(&reader);

    let (tx, rx) = mpsc::channel(4);
    tx.send(ReaderEvent::CardInserted(reader.clone())).await.unwrap();
    drop(tx);
    Arc::clone(&h.controller).run(rx).await;
    h.controller.settle().await;
    assert!(h.controller.session().is_some());

    let disconnects = reader.disconnects();
    h.controller
        .handle_event(ReaderEvent::CardRemoved {
            reader: "reader-1".to_string(),
        })
        .await;

    assert!(h.controller.session().is_none());
    assert_eq!(reader.disconnects(), disconnects + 1);
    assert!(h.presenter.events().contains(&UiEvent::CardRemoved {
        reader: "reader-1".to_string()
    }));
}

#[tokio::test]
async fn unknown_card_is_reported_not_loaded() {
    let h = harness("D", dashboard());
    let reader = MockReader::new("reader-1", "3B0000");

    h.controller
        .handle_event(ReaderEvent::CardInserted(reader.clone()))
        .await;

    assert!(h.controller.session().is_none());
    assert!(reader.transcript().is_empty());
    assert!(
        h.presenter
            .events()
            .iter()
            .any(|e| matches!(e, UiEvent::Message { level: Level::Error, .. }))
    );
}

#[tokio::test]
async fn personalize_page_binds_an_empty_card() {
    let request = PersonalizationRequest {
        token: "tok-1".to_string(),
        realm: "wibio".to_string(),
    };
    let h = harness("T", PageMode::Personalize(request));
    let reader = MockReader::new("reader-1", ATR);
    reader.respond("GetCardUuid_V2", structured(json!({"uuid": "tok-1"})));
    reader.respond(
        "ReadSequenceInfo",
        structured(json!({"Account": [], "OTP_type": [], "Account_len": [0]})),
    );

    h.controller.load_interface(reader.clone()).await.unwrap();
    h.controller.settle().await;

    assert_eq!(reader.transceived("PersonalizeD"), 1);
    assert_eq!(h.service.personalization_calls(), 1);
    assert_eq!(h.presenter.confirmations(), [Confirmation::Personalize]);
    assert!(h.presenter.events().contains(&UiEvent::PersonalizationComplete));
}

#[tokio::test]
async fn personalize_page_rejects_a_foreign_card() {
    let request = PersonalizationRequest {
        token: "tok-1".to_string(),
        realm: "wibio".to_string(),
    };
    let h = harness("T", PageMode::Personalize(request));
    let reader = MockReader::new("reader-1", ATR);
    reader.respond("GetCardUuid_V2", structured(json!({"uuid": "someone-else"})));

    h.controller.load_interface(reader.clone()).await.unwrap();
    h.controller.settle().await;

    assert_eq!(reader.transceived("PersonalizeD"), 0);
    assert!(h.presenter.confirmations().is_empty());
    assert!(
        h.presenter
            .events()
            .iter()
            .any(|e| matches!(e, UiEvent::Message { level: Level::Error, .. }))
    );
}

#[tokio::test]
async fn declined_deletion_sends_nothing() {
    let h = harness("D", dashboard());
    let reader = MockReader::new("reader-1", ATR);
    enrolled_d_card(&reader);
    h.controller.load_interface(reader.clone()).await.unwrap();
    h.controller.settle().await;

    h.presenter.answer(false);
    let deleted = h.controller.delete_sequence("mail").await.unwrap();

    assert!(!deleted);
    assert_eq!(reader.transceived("DeleteOtpToken"), 0);
    assert!(h.service.verify_calls().is_empty());
}
