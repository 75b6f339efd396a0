//! Common test utilities for keyimport integration tests
//!
//! Shared fixtures plus a keystore decorator that records calls and can
//! corrupt decrypted output, for driving the orchestrator into outcomes a
//! well-behaved keystore never produces.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use keyimport::prelude::*;
use rsa::RsaPublicKey;

/// Message used by the end-to-end scenarios
pub const SERVER_MESSAGE: &str = "Hello from Server! 2024-05-01T12:00:00+00:00";

/// Smallest accepted wrapping key, keeps key generation fast
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        wrapping_key_bits: 1024,
        ..ProtocolConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub keystore: Arc<RecordingKeystore>,
    pub storage: Arc<MemoryTekStorage>,
}

pub fn harness(keystore: SoftwareKeystore, api_level: u32) -> Harness {
    let keystore = Arc::new(RecordingKeystore::new(keystore));
    let storage = Arc::new(MemoryTekStorage::new());
    let orchestrator = Orchestrator::new(
        keystore.clone(),
        Arc::new(StaticPlatform::new(api_level)),
        storage.clone(),
        test_config(),
    );
    Harness {
        orchestrator,
        keystore,
        storage,
    }
}

/// Delegates to a [`SoftwareKeystore`], counting calls
pub struct RecordingKeystore {
    inner: SoftwareKeystore,
    pub generate_calls: AtomicUsize,
    pub import_calls: AtomicUsize,
    corrupt_jwe: AtomicBool,
}

impl RecordingKeystore {
    pub fn new(inner: SoftwareKeystore) -> Self {
        RecordingKeystore {
            inner,
            generate_calls: AtomicUsize::new(0),
            import_calls: AtomicUsize::new(0),
            corrupt_jwe: AtomicBool::new(false),
        }
    }

    /// Flip the first byte of every JWE plaintext from now on
    pub fn corrupt_jwe_output(&self) {
        self.corrupt_jwe.store(true, Ordering::SeqCst);
    }

    pub fn imports(&self) -> usize {
        self.import_calls.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

impl SecureKeystore for RecordingKeystore {
    fn generate_wrapping_key(
        &self,
        alias: &str,
        tier: ProtectionTier,
        bits: usize,
    ) -> Result<RsaPublicKey, KeystoreError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_wrapping_key(alias, tier, bits)
    }

    fn import_wrapped_key(
        &self,
        wrapped_der: &[u8],
        wrapping_alias: &str,
        import_alias: &str,
    ) -> Result<(), KeystoreError> {
        self.import_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .import_wrapped_key(wrapped_der, wrapping_alias, import_alias)
    }

    fn security_level(&self, alias: &str) -> Result<SecurityLevel, KeystoreError> {
        self.inner.security_level(alias)
    }

    fn encrypt_message(&self, alias: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.inner.encrypt_message(alias, plaintext)
    }

    fn decrypt_message(&self, alias: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.inner.decrypt_message(alias, ciphertext)
    }

    fn encrypt_jwe(&self, alias: &str, plaintext: &[u8]) -> Result<String, KeystoreError> {
        self.inner.encrypt_jwe(alias, plaintext)
    }

    fn decrypt_jwe(&self, alias: &str, compact: &str) -> Result<Vec<u8>, KeystoreError> {
        let mut plaintext = self.inner.decrypt_jwe(alias, compact)?;
        if self.corrupt_jwe.load(Ordering::SeqCst) {
            if let Some(first) = plaintext.first_mut() {
                *first ^= 0x01;
            }
        }
        Ok(plaintext)
    }

    fn encrypt_with_wrapping_key(
        &self,
        alias: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.inner.encrypt_with_wrapping_key(alias, plaintext)
    }

    fn decrypt_with_wrapping_key(
        &self,
        alias: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.inner.decrypt_with_wrapping_key(alias, ciphertext)
    }

    fn contains_alias(&self, alias: &str) -> bool {
        self.inner.contains_alias(alias)
    }

    fn delete_entry(&self, alias: &str) -> Result<(), KeystoreError> {
        self.inner.delete_entry(alias)
    }
}

/// Log sink for scoped subscribers
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a debug-level subscriber writing into the returned sink
pub fn with_captured_logs<R>(f: impl FnOnce() -> R) -> (R, CapturedLogs) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs)
}
