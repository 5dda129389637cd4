//! Webcard Core Library
//!
//! This crate drives Wibio smartcards through a host-provided reader: it
//! recognizes cards, runs server-defined command scripts against them,
//! enrolls fingerprints, personalizes fresh cards and reads one-time
//! passwords.
//!
//! # Overview
//!
//! Cards are not programmed with hard-coded APDUs. Workflows speak in
//! command scripts such as `[SelectBeCard][LoginBeCard][ReadSequenceInfo]`;
//! each command name is resolved per card through a remote command service
//! and the resulting templates are sent to the reader in order.
//!
//! This library provides:
//!
//! - **Script Engine**: parsing, cached resolution, sequential execution and
//!   dynamic-form expansion of command scripts
//! - **Recognition**: card identity and family from the reader's ATR
//! - **Enrollment**: fingerprint enrollment state machines per card family
//! - **OTP**: sequence discovery, HOTP/TOTP retrieval and deletion
//! - **Personalization** and **Identity** reading
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 PageController (reader events)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Recognition │  Enrollment  │     OTP     │ Personalize/Ident. │
//! ├─────────────────────────────────────────────────────────────┤
//! │                           Engine                             │
//! │  ┌─────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐  │
//! │  │ Script  │  │ Resolver │  │ Executor │  │  Classifier  │  │
//! │  │ Parser  │  │ + Cache  │  │          │  │              │  │
//! │  └─────────┘  └──────────┘  └──────────┘  └──────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ CommandService (HTTP) │ ReaderHost/Session (PC/SC) │ Presenter│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use webcard_core::classify::{count, is_success, parse};
//! use webcard_core::mock::{MockHost, MockReader, MockService, RecordingPresenter, structured};
//! use webcard_core::session::{CardFamily, CardIdentity, CardSession};
//! use webcard_core::{Config, Engine};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Engine::new(
//!     Config::default(),
//!     Arc::new(MockService::new()),
//!     Arc::new(MockHost::new()),
//!     Arc::new(RecordingPresenter::new()),
//! );
//!
//! let reader = MockReader::new("reader-1", "3B8F8001");
//! reader.respond("ReadSequenceInfo", structured(json!({"Sequence": ["1"]})));
//! let session = CardSession::new(
//!     reader,
//!     CardIdentity { card_id: "card-1".to_string(), family: CardFamily::F },
//! );
//!
//! let results = engine
//!     .run_script(&session, "[SelectBeCard][ReadSequenceInfo]")
//!     .await
//!     .unwrap();
//! assert_eq!(count(Some(results.as_slice())), 2);
//! assert!(is_success(results.get(1)));
//! assert!(parse(results.get(1)).is_some());
//! # }
//! ```
//!
//! # Hosts
//!
//! The engine never assumes a concrete reader or server. Implement
//! [`reader::ReaderHost`], [`reader::ReaderSession`],
//! [`service::CommandService`] and [`presenter::Presenter`] for your
//! platform, or use the bundled ones:
//!
//! - `reader::PcscHost`: PC/SC readers (feature `pcsc`)
//! - `service::HttpCommandService`: the HTTP command service (feature
//!   `http`)
//! - [`mock`]: in-memory collaborators for tests and demos
//!
//! # Feature Flags
//!
//! - `http` (default): the `reqwest` command-service client
//! - `pcsc`: PC/SC hardware readers

// Modules
pub mod classify;
pub mod config;
pub mod controller;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod executor;
pub mod form;
pub mod identity;
pub mod mock;
pub mod otp;
pub mod personalize;
pub mod presenter;
pub mod reader;
pub mod recognition;
pub mod resolver;
pub mod script;
pub mod service;
pub mod session;

// Re-exports for convenience
pub use config::Config;
pub use controller::{PageController, PageMode, ReaderSlot, ReaderStatus};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use executor::{ExecutionResult, ExecutionStatus};
pub use presenter::{Confirmation, Level, Presenter, UiEvent};
pub use reader::{ReaderEvent, ReaderHost, ReaderInfo, ReaderSession};
pub use service::CommandService;
pub use session::{CancelToken, CardFamily, CardIdentity, CardSession, SessionContext};
