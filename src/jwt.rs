use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TokenAcquisitionError;
use crate::types::Signer;

/// Grant type for exchanging a signed assertion at the OAuth token endpoint
pub(crate) const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Audience of assertions sent to the OAuth token endpoint
pub(crate) const OAUTH_AUDIENCE: &str = "https://oauth2.googleapis.com/token";
/// Maximum lifetime Google accepts for a service account JWT
pub(crate) const JWT_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize, Debug)]
struct Header<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

/// Claims for a service account JWT
///
/// See https://developers.google.com/identity/protocols/oauth2/service-account#authorizingrequests
/// and https://google.aip.dev/auth/4111 for the self-signed variant.
#[derive(Serialize, Debug)]
pub(crate) struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl<'a> Claims<'a> {
    /// Claims for an assertion exchanged at the OAuth token endpoint
    pub(crate) fn exchange(email: &'a str, scopes: &[String], now: DateTime<Utc>) -> Self {
        let mut claims = Self::self_signed(email, OAUTH_AUDIENCE, now);
        claims.scope = Some(scopes.join(" "));
        claims
    }

    /// Claims for a JWT used directly as a bearer token against `audience`
    pub(crate) fn self_signed(email: &'a str, audience: &'a str, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Claims {
            iss: email,
            sub: email,
            aud: audience,
            iat,
            exp: iat + JWT_LIFETIME_SECS,
            scope: None,
        }
    }

    pub(crate) fn to_jwt(
        &self,
        signer: &Signer,
        key_id: &str,
    ) -> Result<String, TokenAcquisitionError> {
        let header = Header {
            alg: "RS256",
            typ: "JWT",
            kid: key_id,
        };

        let mut jwt = String::new();
        encode_segment(&header, &mut jwt)?;
        jwt.push('.');
        encode_segment(self, &mut jwt)?;

        let signature = signer.sign(jwt.as_bytes())?;
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(&signature, &mut jwt);
        Ok(jwt)
    }
}

fn encode_segment(value: &impl Serialize, out: &mut String) -> Result<(), TokenAcquisitionError> {
    let json = serde_json::to_vec(value)
        .map_err(|_| TokenAcquisitionError::Signing("failed to serialize JWT segment"))?;
    URL_SAFE_NO_PAD.encode_string(json, out);
    Ok(())
}
