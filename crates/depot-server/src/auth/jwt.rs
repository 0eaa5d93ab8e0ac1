//! JWT creation and verification.
//!
//! Tokens are signed by SSH private keys (possibly held in an agent)
//! and carry the signing key's SHA-256 fingerprint. Verification
//! resolves the fingerprint against the configured allowlist and
//! checks the signature with the key's crypto-level public key. Only
//! RS256 and ES256 are accepted; notably no HS256 and no `none`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use ssh_key::EcdsaCurve;
use ssh_key::public::KeyData;

use super::{AuthConfig, AuthError};
use crate::auth::signer::TokenSigner;

/// Maximum token lifetime. `exp` beyond `iat` + this is rejected.
pub const MAX_TOKEN_AGE_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtAlgorithm {
    Rs256,
    Es256,
}

impl JwtAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            JwtAlgorithm::Rs256 => "RS256",
            JwtAlgorithm::Es256 => "ES256",
        }
    }

    /// The JWT algorithm an SSH key signs with, if it is usable at
    /// all. RSA keys sign RS256, NIST P-256 keys sign ES256;
    /// everything else (ed25519, FIDO2, larger curves) is unusable.
    pub fn for_key(key: &KeyData) -> Result<Self, AuthError> {
        match key {
            KeyData::Rsa(_) => Ok(JwtAlgorithm::Rs256),
            KeyData::Ecdsa(ecdsa) if matches!(ecdsa.curve(), EcdsaCurve::NistP256) => Ok(JwtAlgorithm::Es256),
            other => Err(AuthError::UnsupportedKeyType(other.algorithm().to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub key_fingerprint: String,
    pub iat: i64,
    pub exp: i64,
}

/// Create a token for the signer's key, valid for the maximum age.
pub fn create_jwt(signer: &dyn TokenSigner) -> Result<String, AuthError> {
    let algorithm = JwtAlgorithm::for_key(signer.public_key().key_data())?;
    let now = jiff::Timestamp::now().as_second();
    let claims = Claims {
        key_fingerprint: signer.public_key().fingerprint(ssh_key::HashAlg::Sha256).to_string(),
        iat: now,
        exp: now + MAX_TOKEN_AGE_SECONDS,
    };

    let header = serde_json::json!({"typ": "JWT", "alg": algorithm.name()});
    let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
    let claims_json = serde_json::to_string(&claims).map_err(|e| AuthError::Signing(e.to_string()))?;
    let claims_b64 = URL_SAFE_NO_PAD.encode(claims_json);

    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = signer.sign(signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// Verify a token against the allowlist and return the fingerprint of
/// the key that signed it.
pub fn verify_jwt(token: &str, config: &AuthConfig) -> Result<String, AuthError> {
    let header = jsonwebtoken::decode_header(token).map_err(|e| AuthError::Verification(e.to_string()))?;
    let algorithm = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::ES256 => Algorithm::ES256,
        other => return Err(AuthError::Verification(format!("unexpected signing method: {other:?}"))),
    };

    // The fingerprint claim picks the verification key, so it has to
    // be read before signature validation.
    let claims = peek_claims(token)?;
    let key = config
        .find_by_fingerprint(&claims.key_fingerprint)
        .ok_or_else(|| AuthError::Verification("key not found in authorized keys".to_string()))?;

    let decoding_key = decoding_key_for(key.public_key.key_data())?;
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;
    validation.required_spec_claims = ["exp".to_string()].into_iter().collect();

    let verified = jsonwebtoken::decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| AuthError::Verification(e.to_string()))?;

    let claims = verified.claims;
    if claims.exp > claims.iat + MAX_TOKEN_AGE_SECONDS {
        return Err(AuthError::Verification("token lifetime exceeds 24 hours".to_string()));
    }

    Ok(claims.key_fingerprint)
}

fn peek_claims(token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.split('.');
    let payload = parts
        .nth(1)
        .ok_or_else(|| AuthError::Verification("malformed token".to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::Verification(e.to_string()))?;
    serde_json::from_slice(&decoded).map_err(|e| AuthError::Verification(e.to_string()))
}

/// Build a jsonwebtoken decoding key from the raw components of an
/// SSH public key.
fn decoding_key_for(key: &KeyData) -> Result<DecodingKey, AuthError> {
    match key {
        KeyData::Rsa(rsa) => {
            let n = rsa
                .n
                .as_positive_bytes()
                .ok_or_else(|| AuthError::Verification("negative RSA modulus".to_string()))?;
            let e = rsa
                .e
                .as_positive_bytes()
                .ok_or_else(|| AuthError::Verification("negative RSA exponent".to_string()))?;
            Ok(DecodingKey::from_rsa_raw_components(n, e))
        }
        KeyData::Ecdsa(ecdsa) if matches!(ecdsa.curve(), EcdsaCurve::NistP256) => {
            // SEC1 uncompressed point: 0x04 || x || y, 32 bytes each.
            let sec1 = ecdsa.as_sec1_bytes();
            if sec1.len() != 65 || sec1[0] != 0x04 {
                return Err(AuthError::Verification("malformed EC point".to_string()));
            }
            let x = URL_SAFE_NO_PAD.encode(&sec1[1..33]);
            let y = URL_SAFE_NO_PAD.encode(&sec1[33..65]);
            DecodingKey::from_ec_components(&x, &y).map_err(|e| AuthError::Verification(e.to_string()))
        }
        other => Err(AuthError::UnsupportedKeyType(other.algorithm().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use ssh_key::PrivateKey;
    use ssh_key::private::KeypairData;

    use super::*;
    use crate::auth::signer::FileSigner;

    fn generate(algorithm: ssh_key::Algorithm) -> PrivateKey {
        PrivateKey::random(&mut rand_core::OsRng, algorithm).unwrap()
    }

    fn config_for(keys: &[(&PrivateKey, &str)]) -> AuthConfig {
        let input: String = keys
            .iter()
            .map(|(key, perm)| format!("{perm} {}\n", key.public_key().to_openssh().unwrap()))
            .collect();
        AuthConfig::parse(&input).unwrap()
    }

    #[test]
    fn ecdsa_token_round_trips() {
        let key = generate(ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        });
        let config = config_for(&[(&key, "w")]);
        let signer = FileSigner::new(key.clone());

        let token = create_jwt(&signer).unwrap();
        let fingerprint = verify_jwt(&token, &config).unwrap();
        assert_eq!(fingerprint, key.public_key().fingerprint(ssh_key::HashAlg::Sha256).to_string());
    }

    #[test]
    #[ignore = "4096-bit RSA key generation is slow without optimizations"]
    fn rsa_token_round_trips() {
        let key = generate(ssh_key::Algorithm::Rsa { hash: None });
        if !matches!(key.key_data(), KeypairData::Rsa(_)) {
            panic!("expected an RSA keypair");
        }
        let config = config_for(&[(&key, "r")]);
        let signer = FileSigner::new(key.clone());

        let token = create_jwt(&signer).unwrap();
        verify_jwt(&token, &config).unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let signing = generate(ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        });
        let other = generate(ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        });
        let config = config_for(&[(&other, "w")]);

        let token = create_jwt(&FileSigner::new(signing)).unwrap();
        assert!(verify_jwt(&token, &config).is_err());
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let key = generate(ssh_key::Algorithm::Ecdsa {
            curve: ssh_key::EcdsaCurve::NistP256,
        });
        let config = config_for(&[(&key, "w")]);
        let token = create_jwt(&FileSigner::new(key)).unwrap();

        let mut tampered = token.clone();
        tampered.truncate(token.len() - 4);
        tampered.push_str("AAAA");
        assert!(verify_jwt(&tampered, &config).is_err());
    }

    #[test]
    fn ed25519_keys_cannot_mint_tokens() {
        let key = generate(ssh_key::Algorithm::Ed25519);
        let err = create_jwt(&FileSigner::new(key)).unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedKeyType(_)));
    }
}
