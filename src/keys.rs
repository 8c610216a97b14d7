//! Key and identity codec: NIP-19 `npub`/`nsec` strings and secp256k1 keys.

use bech32::{primitives::iter::Fe32IterExt, Bech32, Fe32, Hrp};
use secp256k1::{Secp256k1, SecretKey};

use crate::error::{Error, Result};

const CHECKSUM_LEN: usize = 6;

/// Kind of key an identity string carries, named by its human-readable prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// `npub` public key.
    Public,
    /// `nsec` private key.
    Private,
}

impl IdentityKind {
    /// Human-readable prefix used in the encoded form.
    pub fn prefix(self) -> &'static str {
        match self {
            IdentityKind::Public => "npub",
            IdentityKind::Private => "nsec",
        }
    }

    fn hrp(self) -> Result<Hrp> {
        Hrp::parse(self.prefix()).map_err(|e| Error::InvalidEncoding(e.to_string()))
    }

    fn from_hrp(hrp: &Hrp) -> Option<Self> {
        [IdentityKind::Public, IdentityKind::Private]
            .into_iter()
            .find(|kind| kind.hrp().map(|h| &h == hrp).unwrap_or(false))
    }
}

/// Decode a checksummed identity string into its kind and 32 raw bytes.
///
/// Fails with [`Error::InvalidEncoding`] when the checksum does not validate,
/// the prefix is not `npub`/`nsec`, or the payload is not 32 bytes.
pub fn decode(identity: &str) -> Result<(IdentityKind, [u8; 32])> {
    let (hrp, data) =
        bech32::decode(identity.trim()).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    let kind = IdentityKind::from_hrp(&hrp)
        .ok_or_else(|| Error::InvalidEncoding(format!("unrecognized prefix {hrp}")))?;
    Ok((kind, to_key_bytes(&data)?))
}

/// Decode an identity string that must be of the given kind.
pub fn decode_as(kind: IdentityKind, identity: &str) -> Result<[u8; 32]> {
    let (got, bytes) = decode(identity)?;
    if got != kind {
        return Err(Error::InvalidEncoding(format!(
            "expected {}, got {}",
            kind.prefix(),
            got.prefix()
        )));
    }
    Ok(bytes)
}

/// Encode 32 bytes as a checksummed identity string.
pub fn encode(bytes: &[u8; 32], kind: IdentityKind) -> Result<String> {
    bech32::encode::<Bech32>(kind.hrp()?, bytes).map_err(|e| Error::InvalidEncoding(e.to_string()))
}

/// Compatibility shim for previously stored `npub` values with bad checksums.
///
/// Strict decoding is tried first. Otherwise the data part is read without
/// its trailing checksum characters, skipping anything outside the bech32
/// alphabet. Only `npub` strings are accepted; private keys are never
/// decoded leniently.
pub fn decode_lenient(identity: &str) -> Result<[u8; 32]> {
    let identity = identity.trim();
    if let Ok(bytes) = decode_as(IdentityKind::Public, identity) {
        return Ok(bytes);
    }
    if !identity.is_ascii() {
        return Err(Error::InvalidEncoding("npub must be ASCII".into()));
    }
    let lower = identity.to_ascii_lowercase();
    let payload = lower
        .strip_prefix("npub1")
        .ok_or_else(|| Error::InvalidEncoding("lenient decoding only accepts npub".into()))?;
    let data = &payload[..payload.len().saturating_sub(CHECKSUM_LEN)];
    let bytes: Vec<u8> = data
        .chars()
        .filter_map(|c| Fe32::from_char(c).ok())
        .fes_to_bytes()
        .collect();
    let key = to_key_bytes(&bytes)?;
    tracing::warn!("accepted npub with invalid checksum through lenient decoding");
    Ok(key)
}

/// Derive the x-only public key for a private key.
pub fn derive_public_key(secret: &[u8; 32]) -> Result<[u8; 32]> {
    let sk = SecretKey::from_slice(secret).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    let secp = Secp256k1::signing_only();
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Hex form of [`derive_public_key`].
pub fn derive_public_key_hex(secret: &SecretKey) -> String {
    let secp = Secp256k1::signing_only();
    hex::encode(secret.x_only_public_key(&secp).0.serialize())
}

/// Parse a configured private key given either as `nsec` or as 64 hex chars.
pub fn load_secret_key(value: &str) -> Result<SecretKey> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidEncoding("no private key configured".into()));
    }
    let bytes = if value.starts_with("nsec") {
        decode_as(IdentityKind::Private, value)?
    } else {
        let raw = hex::decode(value).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        to_key_bytes(&raw)?
    };
    SecretKey::from_slice(&bytes).map_err(|e| Error::InvalidEncoding(e.to_string()))
}

/// Generate a fresh random private key.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}

fn to_key_bytes(data: &[u8]) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(data)
        .map_err(|_| Error::InvalidEncoding(format!("expected 32 bytes, got {}", data.len())))
}
