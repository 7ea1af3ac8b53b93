//! Interprets the login packet: the client data token and the
//! authentication envelope that carries the player's identity.

use crate::protocol::{packet::Login, AUTH_ENVELOPE_PROTOCOL};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

mod jwt;

pub use jwt::Jwt;

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("expected exactly 3 JWT parts delimited by a period")]
    JwtParts,
    #[error("malformed base64url payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JWT header and claims must be JSON objects")]
    NotAnObject,
    #[error("missing claim '{0}'")]
    MissingClaim(&'static str),
    #[error("full authentication is disabled on this proxy")]
    OnlineModeDisabled,
    #[error("guest logins are not supported")]
    GuestLogin,
    #[error("unknown authentication type {0}")]
    UnknownAuthType(i64),
    #[error("expected a single certificate, found {0}")]
    ChainLength(usize),
    #[error("expected exactly one certificate with identity data, found {0}")]
    IdentityCount(usize),
    #[error("invalid identity UUID '{0}'")]
    InvalidUuid(String),
}

/// Authentication types of the login envelope.
mod auth_type {
    pub const FULL: i64 = 0;
    pub const GUEST: i64 = 1;
    pub const SELF_SIGNED: i64 = 2;
}

/// Claims of the client data token the relay reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientData {
    pub third_party_name: String,
    pub client_random_id: i64,
    pub self_signed_id: String,
    #[serde(rename = "DeviceOS")]
    pub device_os: i32,
    pub game_version: String,
}

/// Player identity extracted from the authentication envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub xuid: String,
    pub uuid: Uuid,
}

/// Everything the relay keeps from a successful login.
#[derive(Debug, Clone)]
pub struct LoginData {
    pub username: String,
    pub uuid: Uuid,
    pub xuid: String,
    pub protocol: i32,
    pub client_data: ClientData,
    /// Authentication envelope, replayed verbatim to backends.
    pub auth_info_json: String,
    pub client_data_jwt: String,
}

impl LoginData {
    /// The login packet replayed to a backend server.
    pub fn to_packet(&self) -> Login {
        Login {
            protocol: self.protocol,
            auth_info_json: self.auth_info_json.clone(),
            client_data_jwt: self.client_data_jwt.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    #[serde(rename = "AuthenticationType")]
    authentication_type: Option<i64>,
    #[serde(rename = "Certificate")]
    certificate: Option<String>,
    #[serde(rename = "Token")]
    token: Option<String>,
    chain: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CertificateChain {
    chain: Vec<String>,
}

/// Offline UUID of an external id: a version 3 UUID in the nil namespace.
pub fn derive_uuid(xuid: &str) -> Uuid {
    Uuid::new_v3(&Uuid::nil(), format!("pocket-auth-1-xuid:{xuid}").as_bytes())
}

/// Decodes and validates a login packet.
pub fn parse_login(login: &Login, online_mode: bool) -> Result<LoginData, LoginError> {
    let client_data: ClientData = Jwt::parse(&login.client_data_jwt)?.claims_as()?;
    let identity = parse_identity(&login.auth_info_json, login.protocol, online_mode)?;
    let username = if identity.display_name.is_empty() {
        client_data.third_party_name.clone()
    } else {
        identity.display_name
    };

    Ok(LoginData {
        username,
        uuid: identity.uuid,
        xuid: identity.xuid,
        protocol: login.protocol,
        client_data,
        auth_info_json: login.auth_info_json.clone(),
        client_data_jwt: login.client_data_jwt.clone(),
    })
}

pub fn parse_identity(
    auth_info_json: &str,
    protocol: i32,
    online_mode: bool,
) -> Result<Identity, LoginError> {
    let envelope: AuthEnvelope = serde_json::from_str(auth_info_json)?;

    match envelope.authentication_type {
        Some(auth_type::FULL) => {
            if !online_mode {
                return Err(LoginError::OnlineModeDisabled);
            }
            let token = envelope.token.ok_or(LoginError::MissingClaim("Token"))?;
            identity_from_token(&Jwt::parse(&token)?)
        }
        Some(auth_type::GUEST) => Err(LoginError::GuestLogin),
        Some(auth_type::SELF_SIGNED) | None => {
            let chain = match (envelope.certificate, envelope.chain) {
                (Some(certificate), _) => {
                    serde_json::from_str::<CertificateChain>(&certificate)?.chain
                }
                (None, Some(chain)) => chain,
                (None, None) => return Err(LoginError::MissingClaim("chain")),
            };
            if protocol >= AUTH_ENVELOPE_PROTOCOL && chain.len() != 1 {
                return Err(LoginError::ChainLength(chain.len()));
            }
            identity_from_chain(&chain)
        }
        Some(other) => Err(LoginError::UnknownAuthType(other)),
    }
}

fn identity_from_token(token: &Jwt) -> Result<Identity, LoginError> {
    let xuid = token.claim_str("xid")?.to_owned();
    let display_name = token.claim_str("xname")?.to_owned();
    let uuid = token
        .claim_str("cpid")
        .ok()
        .and_then(|cpid| Uuid::parse_str(cpid).ok())
        .unwrap_or_else(|| derive_uuid(&xuid));
    Ok(Identity {
        display_name,
        xuid,
        uuid,
    })
}

fn identity_from_chain(chain: &[String]) -> Result<Identity, LoginError> {
    let mut extra_data = Vec::new();
    for certificate in chain {
        let jwt = Jwt::parse(certificate)?;
        if let Some(data) = jwt.claims.get("extraData") {
            extra_data.push(data.clone());
        }
    }
    let [data] = extra_data.as_slice() else {
        return Err(LoginError::IdentityCount(extra_data.len()));
    };

    let field = |name: &'static str| {
        data.get(name)
            .and_then(Value::as_str)
            .ok_or(LoginError::MissingClaim(name))
    };
    let display_name = field("displayName")?.to_owned();
    let identity = field("identity")?;
    let uuid = Uuid::parse_str(identity).map_err(|_| LoginError::InvalidUuid(identity.to_owned()))?;
    // Offline players have no XUID.
    let xuid = data
        .get("XUID")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    Ok(Identity {
        display_name,
        xuid,
        uuid,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jwt::encode_unsigned;
    use serde_json::json;

    pub const TEST_UUID: &str = "8e0b1c2a-1d6f-4a7e-9c3b-5d2f0a1b2c3d";

    pub fn client_data_jwt(name: &str) -> String {
        encode_unsigned(&json!({
            "ThirdPartyName": name,
            "ClientRandomId": 1234,
            "SelfSignedId": "c1a7f3e0-0000-4000-8000-000000000000",
            "DeviceOS": 7,
            "GameVersion": "1.21.124",
            "SkinData": "ignored",
        }))
    }

    pub fn self_signed_envelope(name: &str) -> String {
        let certificate = encode_unsigned(&json!({
            "extraData": { "displayName": name, "identity": TEST_UUID, "XUID": "" },
        }));
        let chain = json!({ "chain": [certificate] }).to_string();
        json!({ "AuthenticationType": 2, "Certificate": chain, "Token": "" }).to_string()
    }

    pub fn login_packet(name: &str) -> Login {
        Login {
            protocol: 860,
            auth_info_json: self_signed_envelope(name),
            client_data_jwt: client_data_jwt(name),
        }
    }

    #[test]
    fn derived_uuid_is_stable() {
        let a = derive_uuid("2535412345678901");
        assert_eq!(a, derive_uuid("2535412345678901"));
        assert_ne!(a, derive_uuid("2535412345678902"));
        assert_eq!(a.get_version_num(), 3);
        assert_eq!(
            a,
            Uuid::new_v3(&Uuid::nil(), b"pocket-auth-1-xuid:2535412345678901")
        );
    }

    #[test]
    fn self_signed_login() {
        let data = parse_login(&login_packet("Alex"), false).unwrap();
        assert_eq!(data.username, "Alex");
        assert_eq!(data.uuid.to_string(), TEST_UUID);
        assert_eq!(data.xuid, "");
        assert_eq!(data.client_data.device_os, 7);
        assert_eq!(data.to_packet(), login_packet("Alex"));
    }

    #[test]
    fn legacy_chain_is_scanned() {
        let plain = encode_unsigned(&json!({ "certificateAuthority": true }));
        let identity = encode_unsigned(&json!({
            "extraData": { "displayName": "Old", "identity": TEST_UUID, "XUID": "42" },
        }));
        let envelope = json!({ "chain": [plain, identity] }).to_string();
        let identity = parse_identity(&envelope, 800, false).unwrap();
        assert_eq!(identity.display_name, "Old");
        assert_eq!(identity.xuid, "42");
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let identity = encode_unsigned(&json!({
            "extraData": { "displayName": "Old", "identity": TEST_UUID },
        }));
        let envelope = json!({ "chain": [identity.clone(), identity] }).to_string();
        assert!(matches!(
            parse_identity(&envelope, 800, false),
            Err(LoginError::IdentityCount(2))
        ));
    }

    #[test]
    fn newer_protocols_need_one_certificate() {
        let a = encode_unsigned(&json!({}));
        let chain = json!({ "chain": [a.clone(), a] }).to_string();
        let envelope = json!({ "AuthenticationType": 2, "Certificate": chain }).to_string();
        assert!(matches!(
            parse_identity(&envelope, 860, false),
            Err(LoginError::ChainLength(2))
        ));
    }

    #[test]
    fn full_authentication_requires_online_mode() {
        let token = encode_unsigned(&json!({ "xid": "2535400000000001", "xname": "Steve" }));
        let envelope = json!({ "AuthenticationType": 0, "Token": token }).to_string();
        assert!(matches!(
            parse_identity(&envelope, 860, false),
            Err(LoginError::OnlineModeDisabled)
        ));

        let identity = parse_identity(&envelope, 860, true).unwrap();
        assert_eq!(identity.display_name, "Steve");
        assert_eq!(identity.uuid, derive_uuid("2535400000000001"));
    }

    #[test]
    fn guest_login_is_rejected() {
        let envelope = json!({ "AuthenticationType": 1 }).to_string();
        assert!(matches!(
            parse_identity(&envelope, 860, true),
            Err(LoginError::GuestLogin)
        ));
    }
}
