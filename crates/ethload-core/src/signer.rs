//! Signer gateway.
//!
//! The driver assembles legacy transaction fields and hands them to a
//! [`TxSigner`] together with the sender's key, getting back an opaque raw
//! transaction. [`LocalSigner`] is the in-process implementation.

use std::str::FromStr;

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use serde::Serialize;

use crate::error::CallError;
use crate::wallet::PrivateKey;

/// Fields of a legacy (EIP-155) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxFields {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas: u64,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub value: u128,
    /// Call data, hex with optional `0x` prefix. Empty for plain transfers.
    pub data: String,
    pub chain_id: u64,
}

pub trait TxSigner: Send + Sync {
    fn name(&self) -> &'static str;

    fn address_of(&self, key: &PrivateKey) -> Result<String, CallError>;

    /// Returns the signed transaction as `0x`-prefixed hex.
    fn sign(&self, tx: &TxFields, key: &PrivateKey) -> Result<String, CallError>;
}

/// Validates a 20-byte hex address and returns it lower-cased with a `0x`
/// prefix.
pub fn normalize_address(address: &str) -> Result<String, String> {
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    if digits.len() != 40 {
        return Err(format!("address {address:?} is not 20 bytes"));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("address {address:?} is not hex"));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Decodes call data with or without a `0x` prefix.
pub fn decode_data(data: &str) -> Result<Vec<u8>, String> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| format!("call data is not hex: {e}"))
}

/// Signs EIP-155 legacy transactions with a local secp256k1 key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSigner;

impl LocalSigner {
    fn key_signer(key: &PrivateKey) -> Result<PrivateKeySigner, CallError> {
        PrivateKeySigner::from_slice(key.as_bytes())
            .map_err(|e| CallError::Signing(format!("invalid secp256k1 key: {e}")))
    }

    fn legacy(tx: &TxFields) -> Result<TxLegacy, String> {
        let to = match &tx.to {
            Some(to) => {
                let to = normalize_address(to)?;
                TxKind::Call(Address::from_str(&to).map_err(|e| format!("address {to}: {e}"))?)
            }
            None => TxKind::Create,
        };
        Ok(TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas,
            to,
            value: U256::from(tx.value),
            input: Bytes::from(decode_data(&tx.data)?),
        })
    }
}

impl TxSigner for LocalSigner {
    fn name(&self) -> &'static str {
        "secp256k1"
    }

    fn address_of(&self, key: &PrivateKey) -> Result<String, CallError> {
        let signer = Self::key_signer(key)?;
        Ok(format!("0x{}", hex::encode(signer.address().as_slice())))
    }

    fn sign(&self, tx: &TxFields, key: &PrivateKey) -> Result<String, CallError> {
        if tx.chain_id == 0 {
            return Err(CallError::Signing("chain id must be non-zero".into()));
        }
        let unsigned = Self::legacy(tx).map_err(CallError::Signing)?;
        let signer = Self::key_signer(key)?;
        let signature = signer
            .sign_hash_sync(&unsigned.signature_hash())
            .map_err(|e| CallError::Signing(e.to_string()))?;
        let envelope = TxEnvelope::from(unsigned.into_signed(signature));
        Ok(format!("0x{}", hex::encode(envelope.encoded_2718())))
    }
}
