use super::LoginError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A JSON web token split into its decoded parts. The signature is kept
/// as raw bytes and never verified.
#[derive(Debug, Clone)]
pub struct Jwt {
    pub header: Value,
    pub claims: Value,
    pub signature: Vec<u8>,
}

fn decode_part(part: &str) -> Result<Vec<u8>, LoginError> {
    Ok(URL_SAFE_NO_PAD.decode(part.trim_end_matches('='))?)
}

impl Jwt {
    pub fn parse(token: &str) -> Result<Self, LoginError> {
        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(LoginError::JwtParts);
        };

        let header: Value = serde_json::from_slice(&decode_part(header)?)?;
        let claims: Value = serde_json::from_slice(&decode_part(claims)?)?;
        if !header.is_object() || !claims.is_object() {
            return Err(LoginError::NotAnObject);
        }
        Ok(Self {
            header,
            claims,
            signature: decode_part(signature)?,
        })
    }

    pub fn claims_as<T: DeserializeOwned>(&self) -> Result<T, LoginError> {
        Ok(T::deserialize(&self.claims)?)
    }

    pub fn claim_str(&self, name: &'static str) -> Result<&str, LoginError> {
        self.claims
            .get(name)
            .and_then(Value::as_str)
            .ok_or(LoginError::MissingClaim(name))
    }
}

/// Builds an unsigned token from claims.
#[cfg(test)]
pub fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384"}"#);
    let claims = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{claims}.")
}
