//! Exclusive document claims and cross-device handoff tokens.
//!
//! A claim assigns ownership of a character record to one account. The
//! record lives at `characterClaims/{characterId}` and is only ever
//! mutated through a compare-and-set transaction, never a read-then-write
//! pair, so two accounts that both observe "unclaimed" cannot both win.
//!
//! Handoff between accounts goes through short-lived single-use tokens
//! (see [`create_claim_token`] / [`consume_claim_token`]) so the two
//! sides never need a synchronous handshake.

use satchel_store::{KeyedStore, Transition};
use serde_json::Value;
use tracing::debug;

mod token;

pub use token::{
    ClaimTokenParams, ClaimTokenRecord, DEFAULT_TOKEN_TTL_MS, IssuedToken, consume_claim_token,
    create_claim_token,
};

/// Claim and token failures.
///
/// Token consumption collapses every logical refusal into
/// [`ClaimError::TokenInvalid`] so a caller cannot probe which tokens
/// exist.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("Character already claimed")]
    AlreadyClaimed,

    #[error("Character claimed by another account")]
    HeldByAnother,

    #[error("Claim token invalid or expired")]
    TokenInvalid,

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("claim record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] satchel_store::StoreError),
}

fn claim_key(character_id: &str) -> String {
    format!("characterClaims/{character_id}")
}

/// Claim exclusive ownership of `character_id` for `uid`.
///
/// A single atomic transaction: an absent record or one already holding
/// `uid` commits the claim (re-claiming your own character is allowed); a
/// record holding any other account aborts and surfaces
/// [`ClaimError::AlreadyClaimed`].
pub async fn claim_character_lock(
    store: &dyn KeyedStore,
    character_id: &str,
    uid: &str,
) -> Result<(), ClaimError> {
    if character_id.is_empty() {
        return Err(ClaimError::MissingField("character id"));
    }
    if uid.is_empty() {
        return Err(ClaimError::MissingField("user id"));
    }

    let owner = Value::String(uid.to_string());
    let outcome = store
        .transact(&claim_key(character_id), &mut |current| match current {
            None => Transition::Write(owner.clone()),
            Some(existing) if *existing == owner => Transition::Write(owner.clone()),
            Some(_) => Transition::Abort,
        })
        .await?;

    if !outcome.committed {
        debug!(character_id, "claim refused, already held");
        return Err(ClaimError::AlreadyClaimed);
    }
    debug!(character_id, "claim granted");
    Ok(())
}

/// Release the claim on `character_id` held by `uid`.
///
/// Clears the record only when `uid` is the current holder. An absent
/// claim is a no-op success (releasing twice is fine); a claim held by a
/// different account is refused without being touched.
pub async fn release_character_lock(
    store: &dyn KeyedStore,
    character_id: &str,
    uid: &str,
) -> Result<(), ClaimError> {
    if character_id.is_empty() {
        return Err(ClaimError::MissingField("character id"));
    }
    if uid.is_empty() {
        return Err(ClaimError::MissingField("user id"));
    }

    let owner = Value::String(uid.to_string());
    let mut held_by_other = false;
    let outcome = store
        .transact(&claim_key(character_id), &mut |current| match current {
            None => Transition::Abort,
            Some(existing) if *existing == owner => Transition::Remove,
            Some(_) => {
                held_by_other = true;
                Transition::Abort
            }
        })
        .await?;

    if outcome.committed || !held_by_other {
        debug!(character_id, "claim released");
        return Ok(());
    }
    Err(ClaimError::HeldByAnother)
}
