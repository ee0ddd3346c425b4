use crate::{Error, Seed};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{pkcs8::EncodePrivateKey, SigningKey, VerifyingKey};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use patchbay_controller_core::{Subject, DEFAULT_INTERNAL_PREFIX};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

const KEY_INFO: &[u8] = b"patchbay identity signing key v1";

/// Default identity token lifetime: 5 years.
pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Issues and verifies the long-lived identity tokens handed to exporter
/// and client resources. The Ed25519 key pair is derived from the seed, so
/// previously-issued tokens remain valid across restarts.
pub struct IdentitySigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    public: VerifyingKey,
    issuer: String,
    audience: String,
    subject_prefix: String,
    lifetime: Duration,
    kid: String,
}

impl IdentitySigner {
    pub fn new(
        seed: &Seed,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        lifetime: Option<Duration>,
    ) -> Result<Self, Error> {
        let signing = SigningKey::from_bytes(&seed.derive(KEY_INFO));
        let public = signing.verifying_key();

        let der = signing
            .to_pkcs8_der()
            .map_err(|e| Error::Key(format!("failed to encode signing key: {e}")))?;
        let encoding = EncodingKey::from_ed_der(der.as_bytes());

        let x = URL_SAFE_NO_PAD.encode(public.as_bytes());
        let decoding = DecodingKey::from_ed_components(&x)?;

        let kid = URL_SAFE_NO_PAD.encode(&Sha256::digest(public.as_bytes())[..8]);

        Ok(Self {
            encoding,
            decoding,
            public,
            issuer: issuer.into(),
            audience: audience.into(),
            subject_prefix: DEFAULT_INTERNAL_PREFIX.to_string(),
            lifetime: lifetime.unwrap_or(DEFAULT_LIFETIME),
            kid,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mints an identity token whose subject is the canonical name of the
    /// given resource.
    pub fn mint(&self, subject: &Subject) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: format!("{}{subject}", self.subject_prefix),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + self.lifetime.as_secs() as i64,
        };
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        Ok(encode(&header, &claims, &self.encoding)?)
    }

    /// Verifies an identity token and returns its subject.
    pub fn verify(&self, token: &str) -> Result<String, Error> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims.sub)
    }

    /// The JSON Web Key Set published at the issuer's `jwks_uri`.
    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "alg": "EdDSA",
                "use": "sig",
                "kid": self.kid,
                "x": URL_SAFE_NO_PAD.encode(self.public.as_bytes()),
            }]
        })
    }
}

impl std::fmt::Debug for IdentitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySigner")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}
