//! Protocol orchestrator
//!
//! Plays both parties of the exchange in one linear run:
//!
//! ```text
//! Init -> ClientKeyGenerated -> HandoffToServer -> ServerKeyGenerated
//!      -> EncodedForTransport -> HandoffToClient -> ClientImported -> UsageVerified
//! ```
//!
//! Every run ends in exactly one [`ProtocolOutcome`]. Errors never escape
//! [`Orchestrator::run_key_import`]; unexpected ones become
//! [`ProtocolOutcome::Failed`] tagged with the [`Phase`] that produced them.
//!
//! Handoffs between the parties only pass strings (JWK, Base64 DER, JWE),
//! exactly what an external transport would carry.

use crate::config::ProtocolConfig;
use crate::error::KeyImportError;
use crate::keystore::{KeystoreError, ProtectionTier, SecureKeystore, SecurityLevel};
use crate::platform::Platform;
use crate::server::KeyWrapServer;
use crate::storage::TekStorage;
use crate::types::TransportKey;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use rsa::RsaPublicKey;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Protocol states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolState {
    Init,
    ClientKeyGenerated,
    HandoffToServer,
    ServerKeyGenerated,
    EncodedForTransport,
    HandoffToClient,
    ClientImported,
    UsageVerified,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Named unit of work; failures are tagged with the phase they occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    ClientKeyGeneration,
    PublicKeyExport,
    ServerKeyGeneration,
    CekEncryption,
    TekEncryption,
    Encoding,
    Handoff,
    Import,
    UsageVerification,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which round-trip produced different plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationCheck {
    /// CBC raw-bytes message, server to client
    RawMessage,
    /// JWE compact message, server to client
    ServerToClient,
    /// JWE compact message, client to server
    ClientToServer,
    /// Encrypt and decrypt on the client only
    Local,
}

/// Details of a verified import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Protection level reported for the imported key
    pub security_level: SecurityLevel,
    /// Tier the wrapping key was generated at
    pub wrapping_key_tier: ProtectionTier,
    pub server_to_client: String,
    pub client_to_server: String,
}

#[derive(Debug)]
pub enum ProtocolOutcome {
    UsageVerified(ImportReport),
    UnsupportedPlatform { api_level: u32, required: u32 },
    ImportUnavailable,
    VerificationMismatch { check: VerificationCheck },
    Failed { phase: Phase, cause: KeyImportError },
}

impl ProtocolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProtocolOutcome::UsageVerified(_))
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolOutcome::UsageVerified(_) => "usage_verified",
            ProtocolOutcome::UnsupportedPlatform { .. } => "unsupported_platform",
            ProtocolOutcome::ImportUnavailable => "import_unavailable",
            ProtocolOutcome::VerificationMismatch { .. } => "verification_mismatch",
            ProtocolOutcome::Failed { .. } => "failed",
        }
    }
}

/// A finished run: its outcome plus the states it passed through
#[derive(Debug)]
pub struct ProtocolRun {
    pub outcome: ProtocolOutcome,
    pub transitions: Vec<ProtocolState>,
}

impl ProtocolRun {
    pub fn last_state(&self) -> ProtocolState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(ProtocolState::Init)
    }
}

/// Result of the follow-up two-way usage test
#[derive(Debug)]
pub enum UsageOutcome {
    Success {
        level: SecurityLevel,
        server_to_client: String,
        client_to_server: String,
    },
    NoSuchKey,
    Mismatch { check: VerificationCheck },
    Failed { cause: KeyImportError },
}

/// Result of a client-only usage test
#[derive(Debug)]
pub enum LocalUsageOutcome {
    Success { message: String },
    NoSuchKey,
    Mismatch,
    Failed { cause: KeyImportError },
}

/// Default message the server encrypts during verification
pub fn default_server_message() -> String {
    format!("Hello from Server! {}", Utc::now().to_rfc3339())
}

/// Default message the client encrypts during verification
pub fn default_client_message() -> String {
    format!("Hello from Client! {}", Utc::now().to_rfc3339())
}

trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, ProtocolOutcome>;
}

impl<T, E: Into<KeyImportError>> InPhase<T> for Result<T, E> {
    fn in_phase(self, phase: Phase) -> Result<T, ProtocolOutcome> {
        self.map_err(|e| {
            let cause = e.into();
            error!(%phase, error = %cause, "Protocol phase failed");
            ProtocolOutcome::Failed { phase, cause }
        })
    }
}

/// Records state transitions, one log line each
struct Trace {
    states: Vec<ProtocolState>,
}

impl Trace {
    fn new() -> Self {
        let mut trace = Trace { states: Vec::new() };
        trace.advance(ProtocolState::Init);
        trace
    }

    fn advance(&mut self, state: ProtocolState) {
        info!(phase = %state, "Protocol state transition");
        self.states.push(state);
    }
}

fn same_text(expected: &str, actual: &[u8]) -> Option<String> {
    match std::str::from_utf8(actual) {
        Ok(text) if text == expected => Some(text.to_string()),
        _ => None,
    }
}

/// Drives the key import protocol against injected collaborators
pub struct Orchestrator {
    keystore: Arc<dyn SecureKeystore>,
    platform: Arc<dyn Platform>,
    storage: Arc<dyn TekStorage>,
    server: KeyWrapServer,
    config: ProtocolConfig,
}

impl Orchestrator {
    pub fn new(
        keystore: Arc<dyn SecureKeystore>,
        platform: Arc<dyn Platform>,
        storage: Arc<dyn TekStorage>,
        config: ProtocolConfig,
    ) -> Self {
        Orchestrator {
            keystore,
            platform,
            storage,
            server: KeyWrapServer::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Arc<dyn SecureKeystore> {
        &self.keystore
    }

    /// Run the full exchange with the given server message
    pub fn run_key_import(&self, server_message: &str) -> ProtocolRun {
        info!("Key import started");
        let mut trace = Trace::new();
        let outcome = match self.execute(server_message, &mut trace) {
            Ok(report) => ProtocolOutcome::UsageVerified(report),
            Err(outcome) => outcome,
        };
        info!(outcome = outcome.kind(), "Key import finished");
        ProtocolRun {
            outcome,
            transitions: trace.states,
        }
    }

    fn execute(
        &self,
        server_message: &str,
        trace: &mut Trace,
    ) -> Result<ImportReport, ProtocolOutcome> {
        let config = &self.config;

        // Client: wrapping key generation and export
        let (public_key, tier) = self.generate_wrapping_key()?;
        let jwk = crate::jwk::export_public_key_as_jwk(&config.wrapping_key_alias, &public_key)
            .in_phase(Phase::PublicKeyExport)?;
        trace.advance(ProtocolState::ClientKeyGenerated);

        let api_level = self.platform.api_level();
        if !self
            .platform
            .supports_secure_import(config.min_secure_import_api_level)
        {
            warn!(
                api_level,
                required = config.min_secure_import_api_level,
                "Secure key import not supported on this API level"
            );
            return Err(ProtocolOutcome::UnsupportedPlatform {
                api_level,
                required: config.min_secure_import_api_level,
            });
        }

        // Handoff: JWK from client to server
        let server_jwk = jwk;
        debug!(jwk_len = server_jwk.len(), "Wrapping key handed to server");
        trace.advance(ProtocolState::HandoffToServer);

        // Server: keys and CEK transport
        let recipient = self
            .server
            .decode_wrapping_key(&server_jwk)
            .in_phase(Phase::ServerKeyGeneration)?;
        let tek = self
            .server
            .generate_tek(config.tek_size_bits)
            .in_phase(Phase::ServerKeyGeneration)?;
        let metadata = self
            .server
            .import_metadata(config.tek_size_bits, config.key_algorithm)
            .in_phase(Phase::ServerKeyGeneration)?;
        let cek = self
            .server
            .generate_cek(config.cek_size_bits)
            .in_phase(Phase::ServerKeyGeneration)?;
        trace.advance(ProtocolState::ServerKeyGenerated);

        let encrypted_cek = self
            .server
            .encrypt_cek(&cek, &recipient)
            .in_phase(Phase::CekEncryption)?;
        let wrapped = self
            .server
            .encrypt_tek(&tek, &metadata, &cek)
            .in_phase(Phase::TekEncryption)?;
        drop(cek);
        let der = self
            .server
            .encode_wrapper(&wrapped, &encrypted_cek, &metadata)
            .in_phase(Phase::Encoding)?;
        let wrapped_b64 = BASE64.encode(der);
        trace.advance(ProtocolState::EncodedForTransport);

        // Handoff: Base64 DER from server to client
        debug!(len = wrapped_b64.len(), "Wrapped key handed to client");
        let client_der = BASE64
            .decode(wrapped_b64.as_bytes())
            .map_err(crate::wrapper::WrapperError::from)
            .in_phase(Phase::Handoff)?;
        trace.advance(ProtocolState::HandoffToClient);

        // Client: import
        match self.keystore.import_wrapped_key(
            &client_der,
            &config.wrapping_key_alias,
            &config.import_key_alias,
        ) {
            Ok(()) => {}
            Err(KeystoreError::ImportUnavailable(reason)) => {
                warn!(%reason, "Key import not available on this device");
                return Err(ProtocolOutcome::ImportUnavailable);
            }
            Err(e) => return Err(e).in_phase(Phase::Import),
        }
        trace.advance(ProtocolState::ClientImported);

        // Usage verification: CBC first, then JWE both ways
        self.verify_raw_message(&tek, server_message)?;
        let server_to_client = self.verify_server_to_client(&tek, server_message)?;
        let client_to_server = self.verify_client_to_server(&tek, &default_client_message())?;

        let security_level = self
            .keystore
            .security_level(&config.import_key_alias)
            .in_phase(Phase::UsageVerification)?;

        if let Err(e) = self.storage.save(&tek) {
            warn!(error = %e, "Failed to persist transport key");
        }
        trace.advance(ProtocolState::UsageVerified);

        Ok(ImportReport {
            security_level,
            wrapping_key_tier: tier,
            server_to_client,
            client_to_server,
        })
    }

    /// Strongest tier first; only "capability unsupported" moves to the next
    fn generate_wrapping_key(&self) -> Result<(RsaPublicKey, ProtectionTier), ProtocolOutcome> {
        let config = &self.config;
        let mut last_rejection = None;

        for tier in ProtectionTier::FALLBACK_ORDER {
            match self.keystore.generate_wrapping_key(
                &config.wrapping_key_alias,
                tier,
                config.wrapping_key_bits,
            ) {
                Ok(public_key) => {
                    info!(%tier, "Wrapping key generated");
                    return Ok((public_key, tier));
                }
                Err(KeystoreError::CapabilityUnsupported(rejected)) => {
                    warn!(tier = %rejected, "Protection tier unavailable, falling back");
                    last_rejection = Some(KeystoreError::CapabilityUnsupported(rejected));
                }
                Err(e) => return Err(e).in_phase(Phase::ClientKeyGeneration),
            }
        }

        let cause = last_rejection
            .unwrap_or(KeystoreError::CapabilityUnsupported(ProtectionTier::Software));
        Err(cause).in_phase(Phase::ClientKeyGeneration)
    }

    fn verify_raw_message(&self, tek: &TransportKey, message: &str) -> Result<(), ProtocolOutcome> {
        let encrypted = self
            .server
            .encrypt_message(message.as_bytes(), tek)
            .in_phase(Phase::UsageVerification)?;
        let decrypted = self
            .keystore
            .decrypt_message(&self.config.import_key_alias, &encrypted)
            .in_phase(Phase::UsageVerification)?;
        match same_text(message, &decrypted) {
            Some(_) => Ok(()),
            None => Err(mismatch(VerificationCheck::RawMessage)),
        }
    }

    fn verify_server_to_client(
        &self,
        tek: &TransportKey,
        message: &str,
    ) -> Result<String, ProtocolOutcome> {
        let compact = self
            .server
            .encrypt_message_jwe(message.as_bytes(), tek)
            .in_phase(Phase::UsageVerification)?;
        let decrypted = self
            .keystore
            .decrypt_jwe(&self.config.import_key_alias, &compact)
            .in_phase(Phase::UsageVerification)?;
        same_text(message, &decrypted).ok_or_else(|| mismatch(VerificationCheck::ServerToClient))
    }

    fn verify_client_to_server(
        &self,
        tek: &TransportKey,
        message: &str,
    ) -> Result<String, ProtocolOutcome> {
        let compact = self
            .keystore
            .encrypt_jwe(&self.config.import_key_alias, message.as_bytes())
            .in_phase(Phase::UsageVerification)?;
        let decrypted = self
            .server
            .decrypt_message_jwe(&compact, tek)
            .in_phase(Phase::UsageVerification)?;
        same_text(message, &decrypted).ok_or_else(|| mismatch(VerificationCheck::ClientToServer))
    }

    /// Two-way JWE test against a previously imported key
    pub fn run_two_way_usage(&self, server_to_client: &str, client_to_server: &str) -> UsageOutcome {
        info!("Usage test started");
        let outcome = self.two_way_usage(server_to_client, client_to_server);
        match &outcome {
            UsageOutcome::Failed { cause } => error!(error = %cause, "Usage test failed"),
            _ => info!("Usage test finished"),
        }
        outcome
    }

    fn two_way_usage(&self, server_to_client: &str, client_to_server: &str) -> UsageOutcome {
        let tek = match self.storage.load() {
            Some(tek) => tek,
            None => return UsageOutcome::NoSuchKey,
        };

        let c2s = match self.verify_client_to_server(&tek, client_to_server) {
            Ok(text) => text,
            Err(outcome) => return usage_failure(outcome),
        };
        let s2c = match self.verify_server_to_client(&tek, server_to_client) {
            Ok(text) => text,
            Err(outcome) => return usage_failure(outcome),
        };

        match self.keystore.security_level(&self.config.import_key_alias) {
            Ok(level) => UsageOutcome::Success {
                level,
                server_to_client: s2c,
                client_to_server: c2s,
            },
            Err(e) if e.is_key_not_found() => UsageOutcome::NoSuchKey,
            Err(e) => UsageOutcome::Failed { cause: e.into() },
        }
    }

    /// Encrypt then decrypt on the client with the imported key (CBC)
    pub fn run_local_usage(&self, message: &str) -> LocalUsageOutcome {
        let alias = &self.config.import_key_alias;
        let result = self
            .keystore
            .encrypt_message(alias, message.as_bytes())
            .and_then(|encrypted| self.keystore.decrypt_message(alias, &encrypted));
        local_outcome(message, result)
    }

    /// RSA-OAEP round-trip with the wrapping key
    pub fn run_wrapping_key_usage(&self, message: &str) -> LocalUsageOutcome {
        let alias = &self.config.wrapping_key_alias;
        let result = self
            .keystore
            .encrypt_with_wrapping_key(alias, message.as_bytes())
            .and_then(|encrypted| self.keystore.decrypt_with_wrapping_key(alias, &encrypted));
        local_outcome(message, result)
    }
}

fn mismatch(check: VerificationCheck) -> ProtocolOutcome {
    warn!(?check, "Decrypted message differs from the original");
    ProtocolOutcome::VerificationMismatch { check }
}

fn usage_failure(outcome: ProtocolOutcome) -> UsageOutcome {
    match outcome {
        ProtocolOutcome::VerificationMismatch { check } => UsageOutcome::Mismatch { check },
        ProtocolOutcome::Failed { cause, .. } if cause.is_key_not_found() => UsageOutcome::NoSuchKey,
        ProtocolOutcome::Failed { cause, .. } => UsageOutcome::Failed { cause },
        other => UsageOutcome::Failed {
            cause: KeystoreError::ImportRejected(format!("unexpected outcome {}", other.kind()))
                .into(),
        },
    }
}

fn local_outcome(message: &str, result: Result<Vec<u8>, KeystoreError>) -> LocalUsageOutcome {
    match result {
        Ok(decrypted) => match same_text(message, &decrypted) {
            Some(message) => LocalUsageOutcome::Success { message },
            None => {
                warn!(check = ?VerificationCheck::Local, "Decrypted message differs from the original");
                LocalUsageOutcome::Mismatch
            }
        },
        Err(e) if e.is_key_not_found() => LocalUsageOutcome::NoSuchKey,
        Err(e) => {
            error!(error = %e, "Local usage test failed");
            LocalUsageOutcome::Failed { cause: e.into() }
        }
    }
}
