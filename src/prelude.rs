//! Keyimport Prelude
//!
//! Commonly used types and traits in one import.
//!
//! # Example
//!
//! ```rust
//! use keyimport::prelude::*;
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(SoftwareKeystore::new()),
//!     Arc::new(StaticPlatform::new(34)),
//!     Arc::new(MemoryTekStorage::new()),
//!     ProtocolConfig { wrapping_key_bits: 1024, ..ProtocolConfig::default() },
//! );
//! let run = orchestrator.run_key_import(&default_server_message());
//! assert!(run.outcome.is_success());
//! ```

// Protocol
pub use crate::orchestrator::{
    default_client_message, default_server_message, ImportReport, LocalUsageOutcome,
    Orchestrator, Phase, ProtocolOutcome, ProtocolRun, ProtocolState, UsageOutcome,
    VerificationCheck,
};
pub use crate::runner::ProtocolRunner;
pub use crate::server::KeyWrapServer;
pub use crate::{KeyImportError, ProtocolConfig};

// Collaborators
pub use crate::keystore::{
    KeystoreError, ProtectionTier, SecureKeystore, SecurityLevel, SoftwareKeystore,
};
pub use crate::platform::{Platform, StaticPlatform};
pub use crate::storage::{FileTekStorage, MemoryTekStorage, TekStorage};

// Keys and the transport trait
pub use crate::transport::KeyEncapsulation;
pub use crate::types::{ContentEncryptionKey, SymmetricKey, TransportKey};
