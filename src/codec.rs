//! Wire format: RPC envelopes and the per-frame obfuscation codec.
//!
//! Every non-heartbeat frame is a JSON envelope with single-letter keys,
//! serialized, stripped of its outer braces, and XOR-obfuscated against a
//! rolling counter seeded by the frame's first byte.  The obfuscation is
//! deliberately not cryptography; it makes mis-wired peers fail loudly and
//! discourages casual inspection.  Confidentiality requires TLS underneath.
//!
//! Correlation ids carry a leading tag byte on the wire: `c` for a call,
//! `r` for its result, followed by a 4-character random suffix that round
//! trips from call to result.  The classifiers strip the tag on accept.

use serde::{Deserialize, Serialize};

/// Schema-free argument/return mapping carried by envelopes.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The heartbeat frame: a single `@` text frame, out-of-band of the codec.
pub const BEAT: &str = "@";

/// Default heartbeat period in seconds; the server reaper runs one second
/// slower, tolerating a single missed beat window.
pub const DEFAULT_TICKER_SECS: u64 = 5;

/// A request for a remote waiter method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "a")]
    pub waiter: String,
    #[serde(rename = "b")]
    pub method: String,
    #[serde(rename = "c", default)]
    pub input: JsonMap,
    /// `c` + suffix when built for sending; the classifier strips the
    /// tag on decode, leaving the bare suffix.
    #[serde(rename = "d", default)]
    pub correlation: String,
}

/// The response to a [`CallEnvelope`], matched by correlation suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "a")]
    pub waiter: String,
    #[serde(rename = "b")]
    pub method: String,
    #[serde(rename = "c", default)]
    pub output: JsonMap,
    /// Empty string means success.
    #[serde(rename = "d", default)]
    pub err: String,
    /// `r` + suffix when built for sending; the classifier strips the
    /// tag on decode, leaving the bare suffix.
    #[serde(rename = "e", default)]
    pub correlation: String,
}

impl CallEnvelope {
    /// Build a call frame body.  Waiter and method are normalized here so
    /// the receiving side can look them up directly.
    pub fn new(waiter: &str, method: &str, input: JsonMap, suffix: &str) -> Self {
        CallEnvelope {
            waiter: normalize(waiter),
            method: normalize(method),
            input,
            correlation: format!("c{suffix}"),
        }
    }
}

impl ResultEnvelope {
    /// Build the response frame for `call`, re-tagging its suffix with `r`.
    pub fn reply_to(call: &CallEnvelope, outcome: Result<JsonMap, String>) -> Self {
        let (output, err) = match outcome {
            Ok(map) => (map, String::new()),
            Err(err) => (JsonMap::new(), err),
        };
        ResultEnvelope {
            waiter: call.waiter.clone(),
            method: call.method.clone(),
            output,
            err,
            correlation: format!("r{}", call.correlation),
        }
    }
}

/// Advance the obfuscation counter one position.
///
/// `0xff` wraps to `0x00` -- the wrap is part of the wire contract, both
/// ends must step identically or every frame after the wrap is garbage.
fn step(key: u8) -> u8 {
    if key == 0xff { 0x00 } else { key + 1 }
}

fn obfuscate(body: &[u8], seed: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    let mut key = seed;
    out.push(seed);
    for &byte in body {
        key = step(key);
        out.push(byte ^ key);
    }
    out
}

fn encode_with_seed<T: Serialize>(envelope: &T, seed: u8) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_string(envelope)?;
    // Envelopes always serialize to a JSON object; drop the outer braces
    // so the first obfuscated byte is not a predictable `{`.
    let body = &json.as_bytes()[1..json.len() - 1];
    Ok(obfuscate(body, seed))
}

/// Serialize and obfuscate one envelope into a wire frame.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, serde_json::Error> {
    encode_with_seed(envelope, rand::random::<u8>())
}

/// Reverse the obfuscation and re-wrap the JSON object body.
fn deobfuscate(frame: &[u8]) -> Option<String> {
    let (&seed, body) = frame.split_first()?;
    let mut plain = Vec::with_capacity(body.len() + 2);
    let mut key = seed;
    plain.push(b'{');
    for &byte in body {
        key = step(key);
        plain.push(byte ^ key);
    }
    plain.push(b'}');
    String::from_utf8(plain).ok()
}

/// Classify a frame as a call: decodable, non-empty method, correlation
/// tagged `c`.  Returns the envelope with the tag stripped, or `None`.
pub fn decode_call(frame: &[u8]) -> Option<CallEnvelope> {
    let json = deobfuscate(frame)?;
    let mut envelope: CallEnvelope = serde_json::from_str(&json).ok()?;
    if envelope.method.is_empty() || !envelope.correlation.starts_with('c') {
        return None;
    }
    envelope.correlation.remove(0);
    Some(envelope)
}

/// Classify a frame as a result: decodable, non-empty method, correlation
/// tagged `r`.  Returns the envelope with the tag stripped, or `None`.
pub fn decode_result(frame: &[u8]) -> Option<ResultEnvelope> {
    let json = deobfuscate(frame)?;
    let mut envelope: ResultEnvelope = serde_json::from_str(&json).ok()?;
    if envelope.method.is_empty() || !envelope.correlation.starts_with('r') {
        return None;
    }
    envelope.correlation.remove(0);
    Some(envelope)
}

/// Normalize a waiter or method name to lower snake-case.
///
/// The first character is lower-cased; every later upper-case character is
/// prefixed with `_` and lower-cased: `SetUserInfo` -> `set_user_info`.
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
