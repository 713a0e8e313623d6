//! Interpretation of revert payloads returned by failed calls.
//!
//! A revert is seen in two shapes depending on the node: raw ABI-encoded
//! bytes (`data`), and/or a human-readable `message` that sometimes embeds the
//! decoded error. Both are kept in [`RawRevert`] and every decoder here is a
//! pure function over it.

use crate::error::UndecodableRevert;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use once_cell::sync::Lazy;
use regex::Regex;

pub const SENDER_ADDRESS_RESULT: &str = "SenderAddressResult(address)";
pub const FAILED_OP: &str = "FailedOp(uint256,string)";
const ERROR_STRING: &str = "Error(string)";
const PANIC: &str = "Panic(uint256)";

const NO_REASON: &str = "<no revert reason>";

static SENDER_RESULT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"SenderAddressResult\(\s*"?(0x[0-9a-fA-F]{40})"?\s*\)"#).unwrap()
});

static QUOTED_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["'](0x[0-9a-fA-F]{40})["']"#).unwrap());

static FAILED_OP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"FailedOp\(\s*(\d+)\s*,\s*"([^"]*)"\s*\)"#).unwrap());

/// Raw failure of a call, as returned by the node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRevert {
    pub data: Bytes,
    pub message: String,
}

impl RawRevert {
    pub fn new(data: impl Into<Bytes>, message: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            message: message.into(),
        }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(data, String::new())
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(Bytes::new(), message)
    }

    /// ABI-encodes a custom error, the way a contract would revert with it.
    pub fn custom_error(signature: &str, args: &[Token]) -> Self {
        let mut data = id(signature).to_vec();
        data.extend(abi::encode(args));
        Self::from_data(data)
    }

    fn selector(&self) -> Option<[u8; 4]> {
        let data = self.data.as_ref();
        (data.len() >= 4).then(|| [data[0], data[1], data[2], data[3]])
    }

    fn decode_args(&self, signature: &str, types: &[ParamType]) -> Option<Vec<Token>> {
        if self.selector()? != id(signature) {
            return None;
        }
        abi::decode(types, &self.data[4..]).ok()
    }

    fn error_string(&self) -> Option<String> {
        self.decode_args(ERROR_STRING, &[ParamType::String])?
            .pop()?
            .into_string()
    }

    /// Every human-readable text carried by the revert.
    fn texts(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if !self.message.is_empty() {
            out.push(self.message.clone());
        }
        if let Some(s) = self.error_string() {
            out.push(s);
        }
        out
    }
}

/// A single way of pulling an address out of a revert.
pub type AddressStrategy = fn(&RawRevert) -> Option<Address>;

/// Address strategies in the order they are tried: structural first, textual second.
pub const ADDRESS_STRATEGIES: &[(&str, AddressStrategy)] = &[
    ("sender-address-result", sender_address_result),
    ("trailing-address-word", trailing_address_word),
    ("message-sender-address-result", message_sender_address_result),
    ("message-quoted-address", message_quoted_address),
];

/// Extracts the address carried by a revert, or fails with the decoded reason.
pub fn decode_address(raw: &RawRevert) -> Result<Address, UndecodableRevert> {
    for (name, strategy) in ADDRESS_STRATEGIES {
        if let Some(address) = strategy(raw) {
            tracing::debug!(strategy = name, address = ?address, "decoded address from revert");
            return Ok(address);
        }
    }
    Err(UndecodableRevert {
        reason: decode_reason(raw),
        raw: raw.clone(),
    })
}

/// Best-effort human-readable reason. Never fails.
pub fn decode_reason(raw: &RawRevert) -> String {
    if let Some(reason) = raw.error_string().filter(|s| !s.is_empty()) {
        return reason;
    }
    if let Some((op_index, reason)) = failed_op(raw) {
        return format!("op #{op_index}: {reason}");
    }
    if let Some(code) = raw
        .decode_args(PANIC, &[ParamType::Uint(256)])
        .and_then(|mut t| t.pop())
        .and_then(Token::into_uint)
    {
        return format!("panic code {code:#x}");
    }
    if let Some(address) = sender_address_result(raw) {
        return format!("SenderAddressResult({address:?})");
    }
    if !raw.message.trim().is_empty() {
        return raw.message.trim().to_string();
    }
    if !raw.data.is_empty() {
        return format!("unrecognized revert data 0x{}", hex::encode(raw.data.as_ref()));
    }
    NO_REASON.to_string()
}

/// The dispatcher's `FailedOp(opIndex, reason)`, from data or from the message text.
pub fn failed_op(raw: &RawRevert) -> Option<(usize, String)> {
    if let Some(mut tokens) =
        raw.decode_args(FAILED_OP, &[ParamType::Uint(256), ParamType::String])
    {
        let reason = tokens.pop()?.into_string()?;
        let index = tokens.pop()?.into_uint()?;
        if index > U256::from(usize::MAX) {
            return None;
        }
        return Some((index.as_usize(), reason));
    }
    raw.texts().iter().find_map(|text| {
        let caps = FAILED_OP_RE.captures(text)?;
        let index = caps.get(1)?.as_str().parse().ok()?;
        Some((index, caps.get(2)?.as_str().to_string()))
    })
}

fn non_zero(address: Address) -> Option<Address> {
    (!address.is_zero()).then_some(address)
}

fn sender_address_result(raw: &RawRevert) -> Option<Address> {
    raw.decode_args(SENDER_ADDRESS_RESULT, &[ParamType::Address])?
        .pop()?
        .into_address()
        .and_then(non_zero)
}

/// Custom errors whose last argument is an address: selector followed by whole
/// words, last word left-padded with 12 zero bytes. A word whose leading four
/// address bytes are all zero is read as an integer, not an address.
fn trailing_address_word(raw: &RawRevert) -> Option<Address> {
    let data = raw.data.as_ref();
    if data.len() < 36 || (data.len() - 4) % 32 != 0 {
        return None;
    }
    let selector = raw.selector()?;
    if [ERROR_STRING, FAILED_OP, PANIC]
        .iter()
        .any(|sig| id(sig) == selector)
    {
        return None;
    }
    let word = &data[data.len() - 32..];
    if word[..12].iter().any(|b| *b != 0) || word[12..16].iter().all(|b| *b == 0) {
        return None;
    }
    non_zero(Address::from_slice(&word[12..]))
}

fn message_sender_address_result(raw: &RawRevert) -> Option<Address> {
    raw.texts().iter().find_map(|text| {
        SENDER_RESULT_RE
            .captures(text)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
            .and_then(non_zero)
    })
}

fn message_quoted_address(raw: &RawRevert) -> Option<Address> {
    raw.texts().iter().find_map(|text| {
        QUOTED_ADDRESS_RE
            .captures(text)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
            .and_then(non_zero)
    })
}
