//! Card recognition from the reader's ATR.

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
use serde_json as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use std::sync::Arc;

use webcard_core::mock::{MockHost, MockReader, MockService, RecordingPresenter};
use webcard_core::reader::{ApduTemplate, CommandOutcome};
use webcard_core::recognition::recognize;
use webcard_core::service::{AtrCandidates, OneOrMany};
use webcard_core::{CardFamily, Config, Engine, Error, ReaderSession};

const ATR: &str = "3B8F800180";
const PROBE: &str = "80CA0001";

fn engine(service: &Arc<MockService>) -> Engine {
    Engine::new(
        Config::default(),
        service.clone(),
        Arc::new(MockHost::new()),
        Arc::new(RecordingPresenter::new()),
    )
}

fn candidates(ids: &[&str], families: &[&str], probe: Option<&str>) -> AtrCandidates {
    let list = |values: &[&str]| {
        Some(OneOrMany::Many(
            values.iter().map(|value| (*value).to_string()).collect(),
        ))
    };
    AtrCandidates {
        ids: list(ids),
        families: list(families),
        probe: probe.map(ApduTemplate::new),
    }
}

#[tokio::test]
async fn single_candidate_needs_no_probe() {
    let service = Arc::new(MockService::new());
    service.set_candidates(ATR, candidates(&["card-7"], &["D"], Some(PROBE)));
    let engine = engine(&service);
    let reader = MockReader::new("reader-1", ATR);
    let session: Arc<dyn ReaderSession> = reader.clone();

    let identity = recognize(&engine, &session).await.unwrap();

    assert_eq!(identity.card_id, "card-7");
    assert_eq!(identity.family, CardFamily::D);
    assert_eq!(service.atr_checks(), 1);
    assert!(reader.transcript().is_empty());
}

#[tokio::test]
async fn ambiguous_atr_is_resolved_by_one_probe() {
    let service = Arc::new(MockService::new());
    service.set_candidates(
        ATR,
        candidates(&["card-a", "card-b", "card-c"], &["F", "T", "D"], Some(PROBE)),
    );
    let engine = engine(&service);
    let reader = MockReader::new("reader-1", ATR);
    reader.respond(PROBE, CommandOutcome::raw("9000").with_index(1));
    let session: Arc<dyn ReaderSession> = reader.clone();

    let identity = recognize(&engine, &session).await.unwrap();

    assert_eq!(identity.card_id, "card-b");
    assert_eq!(identity.family, CardFamily::T);
    assert_eq!(service.atr_checks(), 1);
    assert_eq!(reader.transceived(PROBE), 1);
    assert_eq!(reader.disconnects(), 1);
}

#[tokio::test]
async fn probe_index_out_of_range_is_unresolved() {
    let service = Arc::new(MockService::new());
    service.set_candidates(
        ATR,
        candidates(&["card-a", "card-b"], &["F", "T"], Some(PROBE)),
    );
    let engine = engine(&service);
    let reader = MockReader::new("reader-1", ATR);
    reader.respond(PROBE, CommandOutcome::raw("9000").with_index(5));
    let session: Arc<dyn ReaderSession> = reader.clone();

    let err = recognize(&engine, &session).await.unwrap_err();
    assert!(matches!(err, Error::AmbiguousCardUnresolved(_)));
}

#[tokio::test]
async fn ambiguous_atr_without_probe_is_unresolved() {
    let service = Arc::new(MockService::new());
    service.set_candidates(ATR, candidates(&["card-a", "card-b"], &["F", "T"], None));
    let engine = engine(&service);
    let reader = MockReader::new("reader-1", ATR);
    let session: Arc<dyn ReaderSession> = reader.clone();

    let err = recognize(&engine, &session).await.unwrap_err();
    assert!(matches!(err, Error::AmbiguousCardUnresolved(_)));
    assert!(reader.transcript().is_empty());
}

#[tokio::test]
async fn unknown_atr_is_not_found() {
    let service = Arc::new(MockService::new());
    let engine = engine(&service);
    let session: Arc<dyn ReaderSession> = MockReader::new("reader-1", ATR);

    let err = recognize(&engine, &session).await.unwrap_err();
    assert!(matches!(err, Error::CardNotFound(ref atr) if atr == ATR));
}

#[tokio::test]
async fn empty_reader_is_not_found() {
    let service = Arc::new(MockService::new());
    let engine = engine(&service);
    let session: Arc<dyn ReaderSession> = MockReader::empty("reader-1");

    let err = recognize(&engine, &session).await.unwrap_err();
    assert!(matches!(err, Error::CardNotFound(_)));
    assert_eq!(service.atr_checks(), 0);
}
