//! Token signers.
//!
//! A [`TokenSigner`] produces the raw JWT signature bytes for a
//! `header.payload` string: PKCS#1 v1.5 over SHA-256 for RSA keys,
//! fixed-width r‖s for P-256 keys. [`FileSigner`] signs with an
//! in-memory private key; agent-backed signers live client-side and
//! reuse [`ecdsa_ssh_signature_to_fixed`] to re-encode agent output.

use p256::ecdsa::signature::Signer as _;
use rsa::BigUint;
use rsa::signature::{SignatureEncoding, Signer as _};
use ssh_key::private::KeypairData;
use ssh_key::{PrivateKey, PublicKey};

use super::AuthError;

pub trait TokenSigner: Send + Sync {
    fn public_key(&self) -> &PublicKey;

    /// Sign the JWT signing input, returning signature bytes in the
    /// layout the JWT algorithm for this key expects.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError>;
}

/// Signer over an unencrypted private key loaded from disk (or
/// generated in tests).
pub struct FileSigner {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl FileSigner {
    pub fn new(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key().clone();
        Self {
            private_key,
            public_key,
        }
    }

    /// Load an unencrypted OpenSSH private key. Encrypted keys are
    /// rejected; use an agent for those.
    pub fn load(pem: &str) -> Result<Self, AuthError> {
        let private_key = PrivateKey::from_openssh(pem).map_err(|e| AuthError::Signing(e.to_string()))?;
        if private_key.is_encrypted() {
            return Err(AuthError::Signing("encrypted keys not supported".to_string()));
        }
        Ok(Self::new(private_key))
    }
}

impl TokenSigner for FileSigner {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self.private_key.key_data() {
            KeypairData::Rsa(keypair) => {
                let n = mpint_to_uint(&keypair.public.n)?;
                let e = mpint_to_uint(&keypair.public.e)?;
                let d = mpint_to_uint(&keypair.private.d)?;
                let p = mpint_to_uint(&keypair.private.p)?;
                let q = mpint_to_uint(&keypair.private.q)?;
                let key = rsa::RsaPrivateKey::from_components(n, e, d, vec![p, q])
                    .map_err(|e| AuthError::Signing(e.to_string()))?;
                let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key);
                let signature = signing_key
                    .try_sign(message)
                    .map_err(|e| AuthError::Signing(e.to_string()))?;
                Ok(signature.to_vec())
            }
            KeypairData::Ecdsa(ssh_key::private::EcdsaKeypair::NistP256 { private, .. }) => {
                let key = p256::ecdsa::SigningKey::from_slice(private.as_slice())
                    .map_err(|e| AuthError::Signing(e.to_string()))?;
                let signature: p256::ecdsa::Signature = key
                    .try_sign(message)
                    .map_err(|e| AuthError::Signing(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
            other => Err(AuthError::UnsupportedKeyType(
                other.algorithm().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string()),
            )),
        }
    }
}

/// Convert an SSH-encoded ECDSA signature (two length-prefixed
/// mpints) into the fixed 64-byte r‖s layout ES256 expects.
pub fn ecdsa_ssh_signature_to_fixed(ssh_sig: &[u8]) -> Result<Vec<u8>, AuthError> {
    fn read_mpint<'a>(input: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), AuthError> {
        if input.len() < 4 {
            return Err(AuthError::Signing("truncated ECDSA signature".to_string()));
        }
        let len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
        let rest = &input[4..];
        if rest.len() < len {
            return Err(AuthError::Signing("truncated ECDSA signature".to_string()));
        }
        Ok((&rest[..len], &rest[len..]))
    }

    fn fixed32(scalar: &[u8]) -> Result<[u8; 32], AuthError> {
        let scalar = match scalar.iter().position(|&b| b != 0) {
            Some(start) => &scalar[start..],
            None => &[],
        };
        if scalar.len() > 32 {
            return Err(AuthError::Signing("ECDSA scalar too large".to_string()));
        }
        let mut out = [0u8; 32];
        out[32 - scalar.len()..].copy_from_slice(scalar);
        Ok(out)
    }

    let (r, rest) = read_mpint(ssh_sig)?;
    let (s, _) = read_mpint(rest)?;
    let mut fixed = Vec::with_capacity(64);
    fixed.extend_from_slice(&fixed32(r)?);
    fixed.extend_from_slice(&fixed32(s)?);
    Ok(fixed)
}

fn mpint_to_uint(mpint: &ssh_key::Mpint) -> Result<BigUint, AuthError> {
    let bytes = mpint
        .as_positive_bytes()
        .ok_or_else(|| AuthError::Signing("negative RSA component".to_string()))?;
    Ok(BigUint::from_bytes_be(bytes))
}
