//! Single-use, time-limited claim handoff tokens.
//!
//! The current owner (or an authority acting for them) issues a token;
//! the receiving account consumes it, then completes the transfer by
//! claiming the character for itself. Consumption is a single
//! transaction, so a token can be spent at most once no matter how many
//! devices race on it.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use satchel_store::{KeyedStore, Transition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ClaimError;

/// Tokens expire fifteen minutes after issuance unless overridden.
pub const DEFAULT_TOKEN_TTL_MS: u64 = 15 * 60 * 1000;

/// Stored token record, camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTokenRecord {
    pub token: String,
    pub character_id: String,
    pub source_uid: String,
    /// When set, only this account may consume the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_uid: Option<String>,
    /// Opaque extra data carried along for the receiving side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

/// Inputs for [`create_claim_token`].
#[derive(Debug, Clone)]
pub struct ClaimTokenParams {
    pub character_id: String,
    pub source_uid: String,
    pub target_uid: Option<String>,
    pub payload: Option<Value>,
    pub expires_in_ms: u64,
}

impl ClaimTokenParams {
    pub fn new(character_id: impl Into<String>, source_uid: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            source_uid: source_uid.into(),
            target_uid: None,
            payload: None,
            expires_in_ms: DEFAULT_TOKEN_TTL_MS,
        }
    }
}

/// A freshly issued token plus the record written for it.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub record: ClaimTokenRecord,
}

fn token_key(token: &str) -> String {
    format!("claimTokens/{token}")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a token: two 12-hex-character segments joined by `-`, each
/// from 6 bytes of OS entropy. Not guessable, not sequential.
fn generate_token() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{}-{}", &hex[..12], &hex[12..])
}

/// Issue a handoff token for a character.
///
/// The record is written unconditionally: at this entropy a collision on
/// the token identifier is not a practical concern, so no compare-and-set
/// is needed on the create path.
pub async fn create_claim_token(
    store: &dyn KeyedStore,
    params: ClaimTokenParams,
) -> Result<IssuedToken, ClaimError> {
    if params.character_id.is_empty() {
        return Err(ClaimError::MissingField("character id"));
    }
    if params.source_uid.is_empty() {
        return Err(ClaimError::MissingField("source uid"));
    }

    let token = generate_token();
    let created_at = now_ms();
    let record = ClaimTokenRecord {
        token: token.clone(),
        character_id: params.character_id,
        source_uid: params.source_uid,
        target_uid: params.target_uid,
        payload: params.payload,
        created_at,
        expires_at: created_at.saturating_add(params.expires_in_ms as i64),
        used_at: None,
        used_by: None,
    };

    store
        .write(&token_key(&token), serde_json::to_value(&record)?)
        .await?;
    debug!(character_id = %record.character_id, "claim token issued");
    Ok(IssuedToken { token, record })
}

/// Consume a handoff token for `consumer_uid`.
///
/// A single transaction that aborts when the record is absent, already
/// used, expired (`expires_at < now`; expiring exactly now is still
/// valid), or targeted at a different account. Every refusal surfaces the
/// same [`ClaimError::TokenInvalid`]; the caller cannot tell which
/// condition failed, so the token namespace cannot be probed.
///
/// On success the returned record still carries `character_id` and
/// `source_uid` so the caller can finish the transfer, e.g. by claiming
/// the character for `consumer_uid`.
pub async fn consume_claim_token(
    store: &dyn KeyedStore,
    token: &str,
    consumer_uid: &str,
) -> Result<ClaimTokenRecord, ClaimError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ClaimError::MissingField("claim token"));
    }
    if consumer_uid.is_empty() {
        return Err(ClaimError::MissingField("user id"));
    }

    let now = now_ms();
    let outcome = store
        .transact(&token_key(token), &mut |current| {
            let Some(current) = current else {
                return Transition::Abort;
            };
            let Ok(mut record) = serde_json::from_value::<ClaimTokenRecord>(current.clone())
            else {
                return Transition::Abort;
            };
            if record.used_at.is_some() {
                return Transition::Abort;
            }
            if record.expires_at < now {
                return Transition::Abort;
            }
            if record
                .target_uid
                .as_deref()
                .is_some_and(|target| target != consumer_uid)
            {
                return Transition::Abort;
            }
            record.used_at = Some(now);
            record.used_by = Some(consumer_uid.to_string());
            match serde_json::to_value(&record) {
                Ok(next) => Transition::Write(next),
                Err(_) => Transition::Abort,
            }
        })
        .await?;

    if !outcome.committed {
        debug!("claim token refused");
        return Err(ClaimError::TokenInvalid);
    }
    let value = outcome.value.ok_or(ClaimError::TokenInvalid)?;
    Ok(serde_json::from_value(value)?)
}
