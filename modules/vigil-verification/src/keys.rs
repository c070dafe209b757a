// Identity key helpers: find `npub1...` tokens in text and compare them with
// a relay pubkey in hex.

use std::sync::OnceLock;

use bech32::{Bech32, Hrp};
use regex::Regex;
use tracing::debug;

use crate::error::{Result, VerificationError};

const NPUB_HRP: &str = "npub";

fn npub_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"npub1[02-9ac-hj-np-z]{58}").expect("valid regex"))
}

/// First `npub1...` token in `text`.
pub fn find_npub(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    npub_pattern().find(&lowered).map(|m| m.as_str().to_string())
}

/// Key advertised in a tagged post, written `#<tag>:npub1...`.
pub fn find_tagged_npub(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(
        r"#{}\s*:\s*(npub1[02-9ac-hj-np-z]{{58}})",
        regex::escape(&tag.to_lowercase())
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(&text.to_lowercase())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Decode an `npub` into its 32 key bytes.
pub fn decode_npub(npub: &str) -> Result<[u8; 32]> {
    let (hrp, data) =
        bech32::decode(npub).map_err(|e| VerificationError::MalformedKey(e.to_string()))?;
    if hrp.to_string() != NPUB_HRP {
        return Err(VerificationError::MalformedKey(format!(
            "expected npub prefix, got {hrp}"
        )));
    }
    data.try_into().map_err(|d: Vec<u8>| {
        VerificationError::MalformedKey(format!("expected 32 bytes, got {}", d.len()))
    })
}

pub fn encode_npub(key: &[u8; 32]) -> Result<String> {
    let hrp = Hrp::parse(NPUB_HRP).map_err(|e| VerificationError::MalformedKey(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, key).map_err(|e| VerificationError::MalformedKey(e.to_string()))
}

/// Whether `npub` encodes the same key as `hex_pubkey`.
///
/// An undecodable npub is a mismatch; an unparseable relay pubkey is an error.
pub fn npub_matches_pubkey(npub: &str, hex_pubkey: &str) -> Result<bool> {
    let expected = hex::decode(hex_pubkey.trim())
        .map_err(|e| VerificationError::MalformedKey(format!("relay pubkey: {e}")))?;
    if expected.len() != 32 {
        return Err(VerificationError::MalformedKey(format!(
            "relay pubkey has {} bytes",
            expected.len()
        )));
    }

    match decode_npub(npub) {
        Ok(decoded) => Ok(decoded.as_slice() == expected.as_slice()),
        Err(e) => {
            debug!(npub, error = %e, "Ignoring undecodable npub");
            Ok(false)
        }
    }
}
