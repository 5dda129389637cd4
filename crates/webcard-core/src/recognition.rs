//! Card recognition.
//!
//! A card is identified by its reader's ATR. When the service knows several
//! cards with the same ATR it also returns an identity-probe command; the
//! probe is sent once and the index in its response picks the candidate.

use std::sync::Arc;

use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::ExecutionStatus;
use crate::reader::ReaderSession;
use crate::resolver::ResolvedCommand;
use crate::service::AtrCandidates;
use crate::session::{CancelToken, CardFamily, CardIdentity};

/// Name under which the identity probe is executed.
const PROBE_COMMAND: &str = "GetVersion";

/// Identifies the card in `reader`.
///
/// # Errors
///
/// - [`Error::CardNotFound`] if the reader has no ATR or no candidate
///   matches it
/// - [`Error::AmbiguousCardUnresolved`] if several candidates match and the
///   probe does not single one out
pub async fn recognize(engine: &Engine, reader: &Arc<dyn ReaderSession>) -> Result<CardIdentity> {
    let atr = reader
        .info()
        .atr
        .clone()
        .ok_or_else(|| Error::CardNotFound(String::new()))?;

    let candidates = engine
        .service()
        .check_card_by_atr(&engine.config().channel, &atr)
        .await?;

    let index = match candidates.ids().len() {
        0 => return Err(Error::CardNotFound(atr)),
        1 => 0,
        count => probe(engine, reader, &candidates, count).await?,
    };

    let family = candidates.family_at(index).ok_or_else(|| {
        Error::AmbiguousCardUnresolved(format!("no card family for candidate {index}"))
    })?;
    let identity = CardIdentity {
        card_id: candidates.ids()[index].clone(),
        family: CardFamily::from(family),
    };
    debug!(%atr, card_id = %identity.card_id, family = %identity.family, "card recognized");
    Ok(identity)
}

async fn probe(
    engine: &Engine,
    reader: &Arc<dyn ReaderSession>,
    candidates: &AtrCandidates,
    count: usize,
) -> Result<usize> {
    let template = candidates
        .probe
        .clone()
        .filter(|template| !template.is_empty())
        .ok_or_else(|| {
            Error::AmbiguousCardUnresolved(format!("{count} candidates and no identity probe"))
        })?;

    debug!(count, "probing card identity");
    let probe = ResolvedCommand::direct(PROBE_COMMAND, template);
    let results = engine
        .run(reader, None, vec![probe], &CancelToken::new())
        .await?;

    results
        .first()
        .filter(|result| result.status == ExecutionStatus::Ok)
        .and_then(|result| result.index)
        .filter(|index| *index < count)
        .ok_or_else(|| {
            Error::AmbiguousCardUnresolved("identity probe returned no usable index".to_string())
        })
}
