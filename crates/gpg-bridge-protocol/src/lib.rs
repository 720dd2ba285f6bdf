//! Wire schema for the gpg-bridge WebSocket protocol.
//!
//! Every frame in either direction is a WebSocket text message carrying one
//! JSON object. Clients send an [`InboundCommand`]; the bridge answers with
//! one or more [`OutboundResult`]s on the same connection.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Port the bridge listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 5151;

/// Default listen address: loopback only.
pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT)
}

/// Status lines carried in [`OutboundResult::communication`].
pub mod communication {
    pub const INVALID_PAYLOAD: &str = "Invalid payload.";
    pub const UNKNOWN_COMMAND: &str = "Unknown command.";
    pub const KEYS_RETRIEVED: &str = "Keys retrieved.";
    pub const KEYS_FAILED: &str = "Failed to retrieve keys.";
    pub const SIGNING_STARTED: &str = "Signing process started. Please touch your Yubikey.";
    pub const SIGNING_SUCCEEDED: &str = "Message has been signed successfully.";
    pub const SIGNING_FAILED: &str = "Signing failed";
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A signing key as reported by the local agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub fingerprint: String,
    pub uid: String,
    /// Armored public key block, when it could be exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Command tags the bridge understands.
pub const KNOWN_COMMANDS: &[&str] = &["getkeys", "sign"];

/// A command sent by the browser page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum InboundCommand {
    /// List the signing keys known to the agent.
    GetKeys,
    /// Produce a detached armored signature.
    Sign {
        /// Base64-encoded payload.
        message: String,
        /// Key to sign with.
        fingerprint: String,
    },
}

/// Why an inbound frame could not be turned into an [`InboundCommand`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, no string `command` tag, or missing fields for the tag.
    #[error("invalid payload")]
    InvalidPayload,
    /// Well-formed, but the tag is not one of [`KNOWN_COMMANDS`].
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

#[derive(Deserialize)]
struct Envelope {
    command: String,
}

impl InboundCommand {
    /// Decode a text frame.
    ///
    /// The tag is checked before the fields so that an unrecognized command is
    /// reported as such rather than as a malformed payload.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|_| DecodeError::InvalidPayload)?;
        let envelope = Envelope::deserialize(&value).map_err(|_| DecodeError::InvalidPayload)?;
        if !KNOWN_COMMANDS.contains(&envelope.command.as_str()) {
            return Err(DecodeError::UnknownCommand(envelope.command));
        }
        serde_json::from_value(value).map_err(|_| DecodeError::InvalidPayload)
    }

    /// The wire tag of this command.
    pub fn tag(&self) -> &'static str {
        match self {
            InboundCommand::GetKeys => "getkeys",
            InboundCommand::Sign { .. } => "sign",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A progress update or terminal result streamed back to the page.
///
/// Optional string fields are left out of the JSON when absent or empty.
/// `gpgkeys` is present (possibly as `[]`) on every successful listing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundResult {
    pub communication: String,
    #[serde(default, skip_serializing_if = "is_blank")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpgkeys: Option<Vec<PublicKey>>,
    #[serde(default, skip_serializing_if = "is_blank")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "is_blank")]
    pub signature: Option<String>,
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

impl OutboundResult {
    /// A bare status line with no other fields.
    pub fn status(communication: impl Into<String>) -> Self {
        Self {
            communication: communication.into(),
            ..Self::default()
        }
    }

    pub fn invalid_payload() -> Self {
        Self::status(communication::INVALID_PAYLOAD)
    }

    pub fn unknown_command() -> Self {
        Self::status(communication::UNKNOWN_COMMAND)
    }

    pub fn keys_retrieved(keys: Vec<PublicKey>) -> Self {
        Self {
            gpgkeys: Some(keys),
            ..Self::status(communication::KEYS_RETRIEVED)
        }
    }

    pub fn keys_failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(communication::KEYS_FAILED)
        }
    }

    /// Interim prompt sent before the agent is asked to sign.
    pub fn signing_started() -> Self {
        Self::status(communication::SIGNING_STARTED)
    }

    pub fn signed(message: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            signature: Some(signature.into()),
            ..Self::status(communication::SIGNING_SUCCEEDED)
        }
    }

    pub fn signing_failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(communication::SIGNING_FAILED)
        }
    }

    /// True when this result ends a `sign` exchange.
    pub fn is_signing_terminal(&self) -> bool {
        self.communication == communication::SIGNING_SUCCEEDED
            || self.communication == communication::SIGNING_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_getkeys() {
        let cmd = InboundCommand::decode(r#"{"command":"getkeys"}"#).unwrap();
        assert_eq!(cmd, InboundCommand::GetKeys);
        assert_eq!(cmd.tag(), "getkeys");
    }

    #[test]
    fn decode_sign_with_fields() {
        let cmd = InboundCommand::decode(
            r#"{"command":"sign","message":"aGVsbG8=","fingerprint":"ABCD"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            InboundCommand::Sign {
                message: "aGVsbG8=".to_string(),
                fingerprint: "ABCD".to_string(),
            }
        );
    }

    #[test]
    fn decode_ignores_extra_fields() {
        let cmd =
            InboundCommand::decode(r#"{"command":"getkeys","fingerprint":"ABCD"}"#).unwrap();
        assert_eq!(cmd, InboundCommand::GetKeys);
    }

    #[test]
    fn decode_rejects_non_json() {
        assert_eq!(
            InboundCommand::decode("not-json"),
            Err(DecodeError::InvalidPayload)
        );
    }

    #[test]
    fn decode_rejects_missing_or_non_string_tag() {
        assert_eq!(
            InboundCommand::decode(r#"{"message":"x"}"#),
            Err(DecodeError::InvalidPayload)
        );
        assert_eq!(
            InboundCommand::decode(r#"{"command":7}"#),
            Err(DecodeError::InvalidPayload)
        );
        assert_eq!(
            InboundCommand::decode(r#"["getkeys"]"#),
            Err(DecodeError::InvalidPayload)
        );
    }

    #[test]
    fn decode_reports_unknown_tag() {
        assert_eq!(
            InboundCommand::decode(r#"{"command":"delete"}"#),
            Err(DecodeError::UnknownCommand("delete".to_string()))
        );
    }

    #[test]
    fn decode_errors_describe_themselves() {
        assert_eq!(DecodeError::InvalidPayload.to_string(), "invalid payload");
        let err: Box<dyn std::error::Error> = Box::new(DecodeError::UnknownCommand("delete".into()));
        assert_eq!(err.to_string(), "unknown command: delete");
    }

    #[test]
    fn decode_sign_missing_fingerprint_is_invalid() {
        assert_eq!(
            InboundCommand::decode(r#"{"command":"sign","message":"aGVsbG8="}"#),
            Err(DecodeError::InvalidPayload)
        );
    }

    #[test]
    fn outbound_status_omits_optional_fields() {
        let json = serde_json::to_string(&OutboundResult::unknown_command()).unwrap();
        assert_eq!(json, r#"{"communication":"Unknown command."}"#);
    }

    #[test]
    fn outbound_empty_error_is_omitted() {
        let json = serde_json::to_string(&OutboundResult::signing_failed("")).unwrap();
        assert_eq!(json, r#"{"communication":"Signing failed"}"#);
    }

    #[test]
    fn outbound_empty_key_list_is_kept() {
        let json = serde_json::to_string(&OutboundResult::keys_retrieved(Vec::new())).unwrap();
        assert_eq!(json, r#"{"communication":"Keys retrieved.","gpgkeys":[]}"#);
    }

    #[test]
    fn public_key_without_armor_skips_pubkey() {
        let key = PublicKey {
            fingerprint: "ABCD".to_string(),
            uid: "Alice <a@x>".to_string(),
            pubkey: None,
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("pubkey"));

        let decoded: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn signed_result_carries_message_and_signature() {
        let result = OutboundResult::signed("aGVsbG8=", "-----BEGIN PGP SIGNATURE-----\n");
        assert!(result.is_signing_terminal());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["message"], "aGVsbG8=");
        assert_eq!(value["communication"], communication::SIGNING_SUCCEEDED);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn default_listen_addr_is_loopback() {
        let addr = default_listen_addr();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), DEFAULT_PORT);
    }
}
