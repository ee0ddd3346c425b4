use crate::{Error, Seed};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const KEY_INFO: &[u8] = b"patchbay stream token key v1";

/// Default stream token lifetime; bounds the Dial-to-Stream setup window,
/// not the lifetime of the forwarded stream itself.
pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamClaims {
    /// Opaque stream id; the pairing key on the router.
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// A pair of one-time tokens minted per Dial, sharing one stream id.
#[derive(Clone, Debug)]
pub struct StreamTokens {
    pub stream_id: String,
    pub client_token: String,
    pub exporter_token: String,
    pub expires_in: Duration,
}

/// Mints and verifies the ephemeral bearer tokens that authorize a single
/// stream pairing. These are symmetric (HMAC) and deliberately do not reuse
/// the identity key; the router derives the same key from the shared seed.
pub struct StreamSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl StreamSigner {
    pub fn new(seed: &Seed, lifetime: Option<Duration>) -> Self {
        let key = seed.derive(KEY_INFO);
        Self {
            encoding: EncodingKey::from_secret(&key),
            decoding: DecodingKey::from_secret(&key),
            lifetime: lifetime.unwrap_or(DEFAULT_LIFETIME),
        }
    }

    /// Mints the token pair for one Dial: one half for the client, one for
    /// the exporter, both carrying the same fresh stream id and pinned to
    /// the chosen router's stream audience.
    pub fn mint_pair(&self, audience: &str) -> Result<StreamTokens, Error> {
        let stream_id = format!("{:032x}", rand::random::<u128>());
        Ok(StreamTokens {
            client_token: self.mint(&stream_id, audience)?,
            exporter_token: self.mint(&stream_id, audience)?,
            stream_id,
            expires_in: self.lifetime,
        })
    }

    fn mint(&self, stream_id: &str, audience: &str) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = StreamClaims {
            sub: stream_id.to_string(),
            aud: audience.to_string(),
            iat: now,
            exp: now + self.lifetime.as_secs() as i64,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Verifies a stream token against this router's audience.
    pub fn verify(&self, token: &str, audience: &str) -> Result<StreamClaims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        validation.leeway = 0;

        let data = decode::<StreamClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for StreamSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSigner")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const AUDIENCE: &str = "router.example:8443";

    fn signer() -> StreamSigner {
        StreamSigner::new(&Seed::new(b"an adequately long seed").unwrap(), None)
    }

    #[test]
    fn pair_shares_one_stream_id() {
        let signer = signer();
        let tokens = signer.mint_pair(AUDIENCE).unwrap();
        let client = signer.verify(&tokens.client_token, AUDIENCE).unwrap();
        let exporter = signer.verify(&tokens.exporter_token, AUDIENCE).unwrap();
        assert_eq!(client.sub, exporter.sub);
        assert_eq!(client.sub, tokens.stream_id);
    }

    #[test]
    fn pairs_are_unique() {
        let signer = signer();
        let a = signer.mint_pair(AUDIENCE).unwrap();
        let b = signer.mint_pair(AUDIENCE).unwrap();
        assert_ne!(a.stream_id, b.stream_id);
    }

    #[test]
    fn rejects_wrong_audience() {
        let signer = signer();
        let tokens = signer.mint_pair(AUDIENCE).unwrap();
        assert_eq!(
            signer.verify(&tokens.client_token, "other-router:8443"),
            Err(Error::WrongAudience)
        );
    }

    #[test]
    fn rejects_identity_tokens() {
        // A token from the identity family must not verify as a stream
        // token even though both keys derive from the same seed.
        let seed = Seed::new(b"an adequately long seed").unwrap();
        let identity = crate::IdentitySigner::new(&seed, "https://c.example", AUDIENCE, None)
            .unwrap()
            .mint(&patchbay_controller_core::Subject {
                namespace: "default".to_string(),
                kind: patchbay_controller_core::Kind::Client,
                name: "c1".to_string(),
            })
            .unwrap();
        assert!(signer().verify(&identity, AUDIENCE).is_err());
    }

    #[test]
    fn rejects_expired() {
        let seed = Seed::new(b"an adequately long seed").unwrap();
        let signer = StreamSigner::new(&seed, Some(Duration::ZERO));
        let tokens = signer.mint_pair(AUDIENCE).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(
            signer.verify(&tokens.client_token, AUDIENCE),
            Err(Error::Expired)
        );
    }
}
