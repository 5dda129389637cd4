//! Webcard CLI Example
//!
//! This example drives a Wibio card through the system's PC/SC daemon and
//! the remote command service, on macOS, Linux and Windows.
//!
//! # Prerequisites
//!
//! - A supported Wibio card in a PC/SC reader
//! - PC/SC daemon running (built-in on macOS/Windows, `pcscd` on Linux)
//! - An API key for the command service in `WEBCARD_API_KEY`
//!
//! # Quick Start
//!
//! ```bash
//! export WEBCARD_API_KEY=...
//! cargo run --example webcard-cli -p webcard-core --features pcsc -- readers
//! cargo run --example webcard-cli -p webcard-core --features pcsc -- recognize
//! cargo run --example webcard-cli -p webcard-core --features pcsc -- sequences
//! ```
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `readers` | List readers and classify the cards they hold |
//! | `recognize` | Identify the card in the first supported reader |
//! | `run <script>` | Run a command script, e.g. `[SelectBeCard][ReadSequenceInfo]` |
//! | `sequences` | List the OTP sequences stored on the card |
//! | `otp <sequence> <email>` | Read one OTP for a sequence bound to `email` |
//!
//! Set `RUST_LOG=webcard_core=debug` to see every command sent.

#![expect(unused_crate_dependencies, reason = "needed for CLI example")]

use std::env;
use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use webcard_core::controller::classify_reader;
use webcard_core::otp::{OtpType, ensure_bound, list_sequences, read_hotp, read_totp};
use webcard_core::presenter::FormRequest;
use webcard_core::reader::{PcscHost, Payload};
use webcard_core::recognition::recognize;
use webcard_core::service::HttpCommandService;
use webcard_core::{
    CardSession, Config, Confirmation, Engine, Error, Presenter, ReaderHost, ReaderSession,
    ReaderStatus, Result, UiEvent,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return;
    }

    let outcome = match args[1].as_str() {
        "readers" => cmd_readers().await,
        "recognize" => cmd_recognize().await,
        "run" => cmd_run(&args[2..]).await,
        "sequences" => cmd_sequences().await,
        "otp" => cmd_otp(&args[2..]).await,
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_help();
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
    }
}

fn print_help() {
    println!(
        r#"Webcard CLI

USAGE:
    webcard-cli <COMMAND>

COMMANDS:
    readers                 List readers and the cards they hold
    recognize               Identify the card in the first supported reader
    run <script>            Run a command script against the card
    sequences               List the OTP sequences on the card
    otp <sequence> <email>  Read an OTP for a sequence bound to email
    help                    Show this help message

ENVIRONMENT:
    WEBCARD_API_KEY         API key for the command service
    WEBCARD_BASE_URL        Command service URL
    WEBCARD_CHANNEL         Lookup channel (default NFC)

EXAMPLES:
    cargo run --example webcard-cli --features pcsc -- readers
    cargo run --example webcard-cli --features pcsc -- run "[SelectBeCard][ReadSequenceInfo]"
    cargo run --example webcard-cli --features pcsc -- otp 42 ada@example.com
"#
    );
}

// =============================================================================
// Terminal presenter
// =============================================================================

/// Prints events to stdout and asks confirmations on the terminal.
struct TerminalPresenter;

#[async_trait]
impl Presenter for TerminalPresenter {
    fn emit(&self, event: UiEvent) {
        match event {
            UiEvent::Message { level, text } => println!("[{level:?}] {text}"),
            UiEvent::PresencePrompt(true) => println!("Place your finger on the sensor..."),
            UiEvent::ReaderBusy(_) | UiEvent::PresencePrompt(false) => {}
            other => println!("{other:?}"),
        }
    }

    async fn confirm(&self, prompt: Confirmation) -> bool {
        let question = format!("{prompt:?}");
        tokio::task::spawn_blocking(move || ask(&question))
            .await
            .unwrap_or(false)
    }

    async fn fill_form(&self, request: &FormRequest) -> Result<Map<String, Value>> {
        // Non-interactive: every choice takes its preselected value.
        Ok(request
            .choices
            .iter()
            .filter_map(|choice| {
                choice
                    .default
                    .clone()
                    .map(|value| (choice.key.clone(), value))
            })
            .collect())
    }
}

fn ask(question: &str) -> bool {
    print!("{question}? [y/N] ");
    io::stdout().flush().ok();

    let mut answer = String::new();
    io::stdin().read_line(&mut answer).ok();
    matches!(answer.trim(), "y" | "Y" | "yes")
}

// =============================================================================
// Commands
// =============================================================================

async fn engine() -> Result<(Engine, Arc<PcscHost>)> {
    let config = Config::default().with_env_overrides()?;
    let host = Arc::new(PcscHost::new(config.api_key.clone().unwrap_or_default())?);
    let service = HttpCommandService::from_host(&config, host.as_ref()).await?;
    let engine = Engine::new(
        config,
        Arc::new(service),
        host.clone(),
        Arc::new(TerminalPresenter),
    );
    Ok((engine, host))
}

async fn first_card(engine: &Engine, host: &PcscHost) -> Result<Arc<dyn ReaderSession>> {
    let supported = engine.service().supported_cards().await?;
    host.readers()
        .await?
        .into_iter()
        .find(|reader| classify_reader(reader.info(), &supported) == ReaderStatus::Supported)
        .ok_or_else(|| Error::CardNotFound("no reader holds a supported card".to_string()))
}

async fn connect_card() -> Result<(Engine, CardSession)> {
    let (engine, host) = engine().await?;
    let reader = first_card(&engine, &host).await?;
    let identity = recognize(&engine, &reader).await?;
    println!(
        "Card {} (family {}) in {}\n",
        identity.card_id,
        identity.family,
        reader.info().name
    );
    Ok((engine, CardSession::new(reader, identity)))
}

async fn cmd_readers() -> Result<()> {
    println!("Searching for readers...\n");

    let (engine, host) = engine().await?;
    let supported = engine.service().supported_cards().await?;
    let readers = host.readers().await?;
    if readers.is_empty() {
        println!("No readers found.");
        println!("\nMake sure:");
        println!("  - Your reader is plugged in");
        println!("  - The PC/SC daemon is running");
        println!("    - macOS: launchctl list | grep pcscd");
        println!("    - Linux: systemctl status pcscd");
        return Ok(());
    }

    println!("Found {} reader(s):\n", readers.len());
    for (i, reader) in readers.iter().enumerate() {
        let info = reader.info();
        let status = classify_reader(info, &supported);
        match &info.atr {
            Some(atr) => println!("  [{}] {} {status:?} (ATR {atr})", i + 1, info.name),
            None => println!("  [{}] {} {status:?}", i + 1, info.name),
        }
    }
    Ok(())
}

async fn cmd_recognize() -> Result<()> {
    println!("Recognizing card...\n");
    connect_card().await.map(|_| ())
}

async fn cmd_run(args: &[String]) -> Result<()> {
    let Some(script) = args.first() else {
        eprintln!("Usage: run <script>");
        eprintln!("Example: run \"[SelectBeCard][ReadSequenceInfo]\"");
        return Ok(());
    };

    let (engine, session) = connect_card().await?;
    let results = engine.run_script(&session, script).await?;

    println!("{} result(s):\n", results.len());
    for (i, result) in results.iter().enumerate() {
        let payload = match &result.payload {
            Some(Payload::Structured(map)) => Value::Object(map.clone()).to_string(),
            Some(Payload::Raw(code)) => code.clone(),
            None => "-".to_string(),
        };
        println!(
            "  [{}] {:<20} {:?} {:>5} ms  {payload}",
            i + 1,
            result.name,
            result.status,
            result.elapsed_ms()
        );
    }
    Ok(())
}

async fn cmd_sequences() -> Result<()> {
    let (engine, session) = connect_card().await?;
    let entries = list_sequences(&engine, &session).await?;

    if entries.is_empty() {
        println!("No OTP sequences on this card.");
    } else {
        println!("Found {} sequence(s):\n", entries.len());
        for entry in &entries {
            println!("  {entry}");
        }
    }
    Ok(())
}

async fn cmd_otp(args: &[String]) -> Result<()> {
    let [sequence, email, ..] = args else {
        eprintln!("Usage: otp <sequence> <email>");
        return Ok(());
    };

    let (engine, session) = connect_card().await?;
    let entry = list_sequences(&engine, &session)
        .await?
        .into_iter()
        .find(|entry| &entry.label == sequence)
        .ok_or_else(|| Error::OtpUnavailable(sequence.clone()))?;

    ensure_bound(&engine, &entry.label, email).await?;
    let otp = match entry.otp_type {
        OtpType::Hotp => read_hotp(&engine, &session, &entry.label).await?,
        OtpType::Totp => read_totp(&engine, &session, &entry.label).await?,
    };

    println!("{entry}");
    println!("  OTP: {otp}");
    Ok(())
}
