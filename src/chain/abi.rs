//! Minimal Solidity ABI encoding for the handful of calls we make.

use anyhow::{anyhow, bail, Context, Result};
use num_bigint::BigUint;
use sha3::{Digest, Keccak256};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiToken {
    Address(String),
    Uint(BigUint),
}

/// A contract call: canonical signature plus static arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiCall {
    pub signature: &'static str,
    pub args: Vec<AbiToken>,
}

impl AbiCall {
    pub fn new(signature: &'static str, args: Vec<AbiToken>) -> Self {
        Self { signature, args }
    }

    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature.as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Selector followed by one 32-byte word per argument.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + 32 * self.args.len());
        out.extend_from_slice(&self.selector());
        for arg in &self.args {
            let word = match arg {
                AbiToken::Address(addr) => {
                    let raw = parse_address(addr)?;
                    let mut word = [0u8; 32];
                    word[12..].copy_from_slice(&raw);
                    word
                }
                AbiToken::Uint(v) => uint_word(v)?,
            };
            out.extend_from_slice(&word);
        }
        Ok(out)
    }

    pub fn encode_hex(&self) -> Result<String> {
        Ok(format!("0x{}", hex::encode(self.encode()?)))
    }
}

pub fn balance_of(holder: &str) -> AbiCall {
    AbiCall::new("balanceOf(address)", vec![AbiToken::Address(holder.to_string())])
}

pub fn token_uri(token_id: BigUint) -> AbiCall {
    AbiCall::new("tokenURI(uint256)", vec![AbiToken::Uint(token_id)])
}

pub fn parse_address(addr: &str) -> Result<[u8; 20]> {
    let trimmed = addr.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if body.len() != 40 {
        bail!("invalid address length: {}", addr);
    }
    let bytes = hex::decode(body).with_context(|| format!("invalid address hex: {}", addr))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Token ids arrive as decimal strings, occasionally as 0x-hex.
pub fn parse_uint(raw: &str) -> Result<BigUint> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x") {
        Some(hex_part) => BigUint::parse_bytes(hex_part.as_bytes(), 16),
        None => BigUint::parse_bytes(raw.as_bytes(), 10),
    };
    parsed.ok_or_else(|| anyhow!("not an unsigned integer: {:?}", raw))
}

fn uint_word(v: &BigUint) -> Result<[u8; 32]> {
    let bytes = v.to_bytes_be();
    if bytes.len() > 32 {
        bail!("uint256 overflow: {}", v);
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(word)
}

pub fn decode_bytes32(data: &[u8]) -> Result<[u8; 32]> {
    if data.len() < 32 {
        bail!("expected 32-byte word, got {} bytes", data.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&data[..32]);
    Ok(out)
}

pub fn decode_uint(data: &[u8]) -> Result<BigUint> {
    Ok(BigUint::from_bytes_be(&decode_bytes32(data)?))
}

/// Decodes a single dynamic `string` return value.
pub fn decode_string(data: &[u8]) -> Result<String> {
    let offset = word_as_usize(data, 0).context("string offset")?;
    let len = word_as_usize(data, offset).context("string length")?;
    let start = offset
        .checked_add(32)
        .ok_or_else(|| anyhow!("string offset {} out of range", offset))?;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| anyhow!("string runs past return data"))?;
    String::from_utf8(data[start..end].to_vec()).context("string is not utf-8")
}

fn word_as_usize(data: &[u8], at: usize) -> Result<usize> {
    let word = at
        .checked_add(32)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| anyhow!("return data too short at offset {}", at))?;
    if word[..24].iter().any(|b| *b != 0) {
        bail!("word at offset {} exceeds usize", at);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(buf))
        .map_err(|_| anyhow!("word at offset {} exceeds usize", at))
}
