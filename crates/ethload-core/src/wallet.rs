use rand::{RngCore, SeedableRng};
use std::fmt;

use crate::context::round_robin;
use crate::error::CallError;
use crate::signer::TxSigner;

/// 32-byte secp256k1 secret. `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CallError> {
        if bytes.iter().all(|b| *b == 0) {
            return Err(CallError::Signing("private key must not be zero".into()));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CallError> {
        let digits = s.trim().strip_prefix("0x").unwrap_or(s.trim());
        let bytes = hex::decode(digits)
            .map_err(|e| CallError::Signing(format!("private key is not hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            CallError::Signing(format!("private key must be 32 bytes, got {}", v.len()))
        })?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub address: String,
    pub key: PrivateKey,
}

impl Wallet {
    pub fn from_key(key: PrivateKey, signer: &dyn TxSigner) -> Result<Self, CallError> {
        let address = signer.address_of(&key)?;
        Ok(Self { address, key })
    }
}

/// Ephemeral wallets for one run. Nonces are not stored here; they belong to
/// the nonce coordinator.
#[derive(Debug, Clone, Default)]
pub struct WalletPool {
    wallets: Vec<Wallet>,
}

impl WalletPool {
    pub fn new(wallets: Vec<Wallet>) -> Self {
        Self { wallets }
    }

    /// Derives `count` wallets from a deterministic seed.
    pub fn generate(count: usize, seed: u64, signer: &dyn TxSigner) -> Result<Self, CallError> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut wallets = Vec::with_capacity(count);

        while wallets.len() < count {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // An all-zero draw is not a usable key; take the next one.
            let Ok(key) = PrivateKey::from_bytes(secret) else {
                continue;
            };
            wallets.push(Wallet::from_key(key, signer)?);
        }

        Ok(Self { wallets })
    }

    /// Wallet assigned to a worker, round-robin over the pool.
    pub fn for_worker(&self, worker: usize) -> Option<&Wallet> {
        round_robin(&self.wallets, worker)
    }

    pub fn wallets(&self) -> &[Wallet] {
        &self.wallets
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}
