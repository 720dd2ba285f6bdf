//! Adapter around the external OpenPGP executable.
//!
//! Two operations are exposed: listing the keys the agent knows about and
//! producing a detached armored signature. Both shell out to the agent and
//! translate its exit status and output into [`OutboundResult`]s.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Output, Stdio};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{DecodeError, Engine};
use gpg_bridge_protocol::{OutboundResult, PublicKey};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::processor::{ResultSink, emit};

/// Which key listing the agent is asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListingFormat {
    /// The human-readable `--list-keys` output.
    #[default]
    Human,
    /// The machine-readable `--list-keys --with-colons` records.
    Colons,
}

impl ListingFormat {
    fn args(self) -> &'static [&'static str] {
        match self {
            ListingFormat::Human => &["--list-keys"],
            ListingFormat::Colons => &["--list-keys", "--with-colons"],
        }
    }

    fn parse(self, listing: &str) -> Vec<PublicKey> {
        match self {
            ListingFormat::Human => parse_key_listing(listing),
            ListingFormat::Colons => parse_colon_listing(listing),
        }
    }
}

/// Handle on the local OpenPGP executable.
#[derive(Debug, Clone)]
pub struct GpgAgent {
    program: OsString,
    leading_args: Vec<OsString>,
    listing_format: ListingFormat,
}

impl Default for GpgAgent {
    fn default() -> Self {
        Self::new("gpg")
    }
}

impl GpgAgent {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            listing_format: ListingFormat::default(),
        }
    }

    pub fn with_listing_format(mut self, format: ListingFormat) -> Self {
        self.listing_format = format;
        self
    }

    /// Point the agent at a specific GnuPG home directory.
    pub fn with_homedir(self, homedir: impl Into<PathBuf>) -> Self {
        let homedir: PathBuf = homedir.into();
        self.with_leading_args([OsString::from("--homedir"), homedir.into_os_string()])
    }

    /// Arguments placed before the operation's own arguments on every call.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null());
        command
    }

    async fn run(&self, mut command: Command) -> Result<Output, AgentError> {
        command.output().await.map_err(|source| AgentError::Spawn {
            program: self.program().to_string_lossy().into_owned(),
            source,
        })
    }

    /// List the agent's public keys.
    ///
    /// Always yields exactly one result: either the full roster or a failure
    /// carrying the agent's standard output.
    pub async fn list_keys(&self) -> OutboundResult {
        let command = self.command(self.listing_format.args());
        let output = match self.run(command).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "key listing could not start");
                return OutboundResult::keys_failed(err.to_string());
            }
        };

        if !output.status.success() {
            warn!(status = %output.status, "key listing failed");
            return OutboundResult::keys_failed(String::from_utf8_lossy(&output.stdout));
        }

        let mut keys = self
            .listing_format
            .parse(&String::from_utf8_lossy(&output.stdout));

        // One export per key, shared by every uid line of that key.
        let mut exported: HashMap<String, Option<String>> = HashMap::new();
        for key in &mut keys {
            let armored = match exported.get(&key.fingerprint) {
                Some(armored) => armored.clone(),
                None => {
                    let armored = self.export_key(&key.fingerprint).await;
                    exported.insert(key.fingerprint.clone(), armored.clone());
                    armored
                }
            };
            key.pubkey = armored;
        }

        debug!(count = keys.len(), "keys retrieved");
        OutboundResult::keys_retrieved(keys)
    }

    /// Export the minimal armored public key for exactly one fingerprint.
    ///
    /// The trailing `!` stops the agent from also selecting subkeys or other
    /// keys matching the same string. Failures yield `None`.
    pub async fn export_key(&self, fingerprint: &str) -> Option<String> {
        let selector = format!("{fingerprint}!");
        let command = self.command([
            "--export",
            "--armor",
            "--export-options",
            "export-minimal",
            selector.as_str(),
        ]);

        match self.run(command).await {
            Ok(output) if output.status.success() => {
                let armored = String::from_utf8_lossy(&output.stdout).into_owned();
                (!armored.is_empty()).then_some(armored)
            }
            Ok(output) => {
                warn!(fingerprint, status = %output.status, "key export failed");
                None
            }
            Err(err) => {
                warn!(fingerprint, error = %err, "key export could not start");
                None
            }
        }
    }

    /// Sign a base64 payload with the given key, streaming progress into
    /// `results`.
    ///
    /// Emits exactly two results: the touch prompt, then success or failure.
    /// The prompt goes out before the agent is started because the agent may
    /// block indefinitely waiting for the token.
    pub async fn sign_message(&self, message: &str, fingerprint: &str, results: &ResultSink) {
        let payload = decode_payload(message);
        let staged = stage_payload(&payload);

        emit(results, OutboundResult::signing_started()).await;

        let file = match staged {
            Ok(file) => file,
            Err(err) => {
                warn!(error = %err, "signing aborted");
                emit(results, OutboundResult::signing_failed(err.to_string())).await;
                return;
            }
        };

        let mut command = self.command([
            "--sign",
            "--detach-sign",
            "--armor",
            "--local-user",
            fingerprint,
            "--output",
            "-",
            "--no-tty",
        ]);
        command.arg(file.path());

        debug!(fingerprint, bytes = payload.len(), "starting signing process");
        let outcome = self.run(command).await;

        if let Err(err) = file.close() {
            warn!(error = %err, "failed to remove payload file");
        }

        let result = match outcome {
            Ok(output) if output.status.success() => {
                OutboundResult::signed(message, String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(fingerprint, status = %output.status, "signing failed");
                OutboundResult::signing_failed(String::from_utf8_lossy(&output.stderr))
            }
            Err(err) => {
                warn!(error = %err, "signing process could not start");
                OutboundResult::signing_failed(err.to_string())
            }
        };
        emit(results, result).await;
    }
}

/// Write the plaintext to a fresh temp file. The file is removed when the
/// returned handle is closed or dropped.
fn stage_payload(payload: &[u8]) -> Result<NamedTempFile, AgentError> {
    let mut file = tempfile::Builder::new()
        .prefix("message-")
        .tempfile()
        .map_err(AgentError::TempFile)?;
    file.write_all(payload)
        .and_then(|()| file.flush())
        .map_err(AgentError::TempFile)?;
    Ok(file)
}

/// Standard alphabet that tolerates missing padding and non-zero trailing
/// bits, as browsers and line-wrapping encoders produce them.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a standard base64 payload, keeping whatever decodes cleanly.
///
/// ASCII whitespace (line wrapping, trailing CRLF) is ignored. Only a symbol
/// outside the alphabet truncates the payload: the whole 4-character groups
/// before it are decoded and the rest is dropped.
pub fn decode_payload(message: &str) -> Vec<u8> {
    let compact: Vec<u8> = message
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    let err = match PAYLOAD_ENGINE.decode(&compact) {
        Ok(bytes) => return bytes,
        Err(err) => err,
    };

    let valid = match err {
        DecodeError::InvalidByte(offset, _) | DecodeError::InvalidLastSymbol(offset, _) => offset,
        DecodeError::InvalidLength(_) | DecodeError::InvalidPadding => compact.len(),
    };
    let prefix = &compact[..valid - valid % 4];
    let bytes = PAYLOAD_ENGINE.decode(prefix).unwrap_or_default();
    warn!(error = %err, kept = bytes.len(), "payload is not valid base64");
    bytes
}

#[derive(Debug)]
enum ListingState {
    Idle,
    AwaitingFingerprint,
    Key(String),
}

/// Parse the agent's human-readable `--list-keys` output.
///
/// A `pub ` line opens a key, the next non-blank line is its fingerprint, and
/// every following `uid ` line emits one record for that key. Keys without a
/// fingerprint or a uid never appear. The returned records carry no armor.
pub fn parse_key_listing(listing: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();
    let mut state = ListingState::Idle;

    for line in listing.lines() {
        if let ListingState::AwaitingFingerprint = state {
            let fingerprint = line.trim();
            if !fingerprint.is_empty() {
                state = ListingState::Key(fingerprint.to_string());
            }
            continue;
        }

        if line.starts_with("pub ") {
            state = ListingState::AwaitingFingerprint;
        } else if line.starts_with("uid ") {
            if let ListingState::Key(fingerprint) = &state {
                keys.push(PublicKey {
                    fingerprint: fingerprint.clone(),
                    uid: line[3..].trim().to_string(),
                    pubkey: None,
                });
            }
        }
    }

    keys
}

/// Parse `--list-keys --with-colons` records.
///
/// `pub` opens a key and the first `fpr` record after it is the primary
/// fingerprint; `fpr` records belonging to subkeys are ignored. Each `uid`
/// record emits one entry. Both values live in field 10.
pub fn parse_colon_listing(listing: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();
    let mut state = ListingState::Idle;

    for line in listing.lines() {
        let fields: Vec<&str> = line.trim_end_matches('\r').split(':').collect();
        let value = fields.get(9).copied().unwrap_or_default();

        match fields[0] {
            "pub" => state = ListingState::AwaitingFingerprint,
            "fpr" if matches!(state, ListingState::AwaitingFingerprint) && !value.is_empty() => {
                state = ListingState::Key(value.to_string());
            }
            "uid" => {
                if let ListingState::Key(fingerprint) = &state {
                    keys.push(PublicKey {
                        fingerprint: fingerprint.clone(),
                        uid: unescape_colon_field(value),
                        pubkey: None,
                    });
                }
            }
            _ => {}
        }
    }

    keys
}

/// Undo the `\xHH` escaping gpg applies to colons and control characters in
/// colon-listing fields.
fn unescape_colon_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let decoded = field
                .get(i + 2..i + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
