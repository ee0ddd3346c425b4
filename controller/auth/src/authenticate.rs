use crate::{bearer, token, Error};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use patchbay_controller_token::IdentitySigner;
use serde::Deserialize;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tracing::trace;

/// One way of turning a bearer token into a subject string.
pub trait Verify: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, token: &str) -> Result<String, token::Error>;
}

/// The ordered union of verifiers tried for every call. The first verifier
/// to accept the token wins; when all reject, the last failure is surfaced.
pub struct Authenticator {
    verifiers: Vec<Box<dyn Verify>>,
}

impl Authenticator {
    pub fn new(signer: Arc<IdentitySigner>) -> Self {
        Self {
            verifiers: vec![Box::new(InternalVerifier(signer))],
        }
    }

    pub fn push(&mut self, verifier: Box<dyn Verify>) {
        self.verifiers.push(verifier);
    }

    pub fn authenticate(&self, metadata: &MetadataMap) -> Result<String, Error> {
        let token = bearer(metadata)?;

        let mut last = token::Error::Malformed("no verifiers configured".to_string());
        for verifier in &self.verifiers {
            match verifier.verify(token) {
                Ok(subject) => {
                    trace!(verifier = verifier.name(), %subject, "authenticated");
                    return Ok(subject);
                }
                Err(error) => {
                    trace!(verifier = verifier.name(), %error, "verifier rejected token");
                    last = error;
                }
            }
        }
        Err(Error::Unauthenticated(last))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field(
                "verifiers",
                &self.verifiers.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

struct InternalVerifier(Arc<IdentitySigner>);

impl Verify for InternalVerifier {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn verify(&self, token: &str) -> Result<String, token::Error> {
        self.0.verify(token)
    }
}

/// An external OIDC verifier pinned to one issuer. Keys are provided as an
/// inline JWKS document in configuration; fetching them from the issuer's
/// discovery endpoint is left to deployment tooling.
pub struct OidcVerifier {
    issuer: String,
    audiences: Vec<String>,
    keys: Vec<(Option<String>, Algorithm, DecodingKey)>,
    username_claim: String,
    username_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    // RSA
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    // OKP
    #[serde(default)]
    x: Option<String>,
}

impl OidcVerifier {
    pub fn new(
        issuer: impl Into<String>,
        audiences: Vec<String>,
        jwks: &serde_json::Value,
        username_claim: Option<String>,
        username_prefix: Option<String>,
    ) -> Result<Self, token::Error> {
        let doc: JwksDocument = serde_json::from_value(jwks.clone())
            .map_err(|e| token::Error::Key(format!("invalid JWKS document: {e}")))?;

        let mut keys = Vec::with_capacity(doc.keys.len());
        for jwk in doc.keys {
            let (alg, key) = match jwk.kty.as_str() {
                "RSA" => {
                    let (n, e) = jwk.n.as_deref().zip(jwk.e.as_deref()).ok_or_else(|| {
                        token::Error::Key("RSA key missing n/e components".to_string())
                    })?;
                    let alg = match jwk.alg.as_deref() {
                        None | Some("RS256") => Algorithm::RS256,
                        Some("RS384") => Algorithm::RS384,
                        Some("RS512") => Algorithm::RS512,
                        Some(other) => {
                            return Err(token::Error::Key(format!(
                                "unsupported RSA algorithm {other:?}"
                            )))
                        }
                    };
                    (alg, DecodingKey::from_rsa_components(n, e)?)
                }
                "OKP" => {
                    let x = jwk.x.as_deref().ok_or_else(|| {
                        token::Error::Key("OKP key missing x component".to_string())
                    })?;
                    (Algorithm::EdDSA, DecodingKey::from_ed_components(x)?)
                }
                other => {
                    return Err(token::Error::Key(format!("unsupported key type {other:?}")))
                }
            };
            keys.push((jwk.kid, alg, key));
        }
        if keys.is_empty() {
            return Err(token::Error::Key("JWKS document has no keys".to_string()));
        }

        Ok(Self {
            issuer: issuer.into(),
            audiences,
            keys,
            username_claim: username_claim.unwrap_or_else(|| "sub".to_string()),
            username_prefix,
        })
    }
}

impl Verify for OidcVerifier {
    fn name(&self) -> &'static str {
        "oidc"
    }

    fn verify(&self, token: &str) -> Result<String, token::Error> {
        let header = decode_header(token)?;

        let mut last = token::Error::BadSignature;
        for (kid, alg, key) in &self.keys {
            if let (Some(kid), Some(header_kid)) = (kid, &header.kid) {
                if kid != header_kid {
                    continue;
                }
            }

            let mut validation = Validation::new(*alg);
            validation.set_issuer(&[&self.issuer]);
            let audiences = self.audiences.iter().map(String::as_str).collect::<Vec<_>>();
            validation.set_audience(&audiences);
            validation.set_required_spec_claims(&["exp", "iss", "aud"]);

            match decode::<serde_json::Value>(token, key, &validation) {
                Ok(data) => {
                    let username = data
                        .claims
                        .get(self.username_claim.as_str())
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            token::Error::Malformed(format!(
                                "claim {:?} missing or not a string",
                                self.username_claim
                            ))
                        })?;
                    return Ok(match &self.username_prefix {
                        Some(prefix) => format!("{prefix}{username}"),
                        None => username.to_string(),
                    });
                }
                Err(error) => last = error.into(),
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_controller_core::{Kind, Subject};
    use patchbay_controller_token::Seed;
    use pretty_assertions::assert_eq;

    fn signer() -> Arc<IdentitySigner> {
        Arc::new(
            IdentitySigner::new(
                &Seed::new(b"an adequately long seed").unwrap(),
                "https://controller.example",
                "patchbay-controller",
                None,
            )
            .unwrap(),
        )
    }

    fn metadata(token: &str) -> MetadataMap {
        let mut m = MetadataMap::new();
        m.insert("authorization", format!("Bearer {token}").parse().unwrap());
        m
    }

    #[test]
    fn internal_tokens_authenticate() {
        let signer = signer();
        let token = signer
            .mint(&Subject {
                namespace: "default".to_string(),
                kind: Kind::Client,
                name: "c1".to_string(),
            })
            .unwrap();

        let authenticator = Authenticator::new(signer);
        assert_eq!(
            authenticator.authenticate(&metadata(&token)).unwrap(),
            "internal:default/client/c1"
        );
    }

    #[test]
    fn later_verifiers_are_tried_in_order() {
        struct Fixed(&'static str);
        impl Verify for Fixed {
            fn name(&self) -> &'static str {
                "fixed"
            }
            fn verify(&self, _: &str) -> Result<String, token::Error> {
                Ok(self.0.to_string())
            }
        }

        let mut authenticator = Authenticator::new(signer());
        authenticator.push(Box::new(Fixed("alice@example.com")));
        assert_eq!(
            authenticator.authenticate(&metadata("not.a.jwt")).unwrap(),
            "alice@example.com"
        );
    }

    #[test]
    fn garbage_tokens_are_unauthenticated() {
        let authenticator = Authenticator::new(signer());
        assert!(matches!(
            authenticator.authenticate(&metadata("not.a.jwt")),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn oidc_verifier_checks_jwks_and_maps_username() {
        // Reuse the internal signer's JWKS as the "external" issuer's keys.
        let signer = signer();
        let token = signer
            .mint(&Subject {
                namespace: "default".to_string(),
                kind: Kind::Client,
                name: "c1".to_string(),
            })
            .unwrap();

        let verifier = OidcVerifier::new(
            "https://controller.example",
            vec!["patchbay-controller".to_string()],
            &signer.jwks(),
            None,
            Some("oidc:".to_string()),
        )
        .unwrap();
        assert_eq!(
            verifier.verify(&token).unwrap(),
            "oidc:internal:default/client/c1"
        );

        let wrong_issuer = OidcVerifier::new(
            "https://elsewhere.example",
            vec!["patchbay-controller".to_string()],
            &signer.jwks(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            wrong_issuer.verify(&token),
            Err(token::Error::WrongIssuer)
        );
    }
}
