//! Background execution of protocol runs
//!
//! A run generates keys and performs RSA operations, so it is moved off the
//! caller's thread onto a tokio blocking worker. Only the most recent run
//! delivers its result: starting a new run disposes of the previous one,
//! whose receiver then observes a closed channel.

use crate::orchestrator::{Orchestrator, ProtocolRun};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ProtocolRunner {
    orchestrator: Arc<Orchestrator>,
    generation: Arc<AtomicU64>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        ProtocolRunner {
            orchestrator,
            generation: Arc::new(AtomicU64::new(0)),
            in_flight: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start a key import run, replacing any run still in flight
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, server_message: String) -> oneshot::Receiver<ProtocolRun> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        let orchestrator = Arc::clone(&self.orchestrator);
        let current = Arc::clone(&self.generation);
        let handle = tokio::task::spawn_blocking(move || {
            let run = orchestrator.run_key_import(&server_message);
            if current.load(Ordering::SeqCst) != generation {
                debug!(generation, "Discarding result of superseded run");
                return;
            }
            // The caller may have dropped the receiver
            let _ = tx.send(run);
        });

        match self.in_flight.lock() {
            Ok(mut in_flight) => {
                if let Some(previous) = in_flight.replace(handle) {
                    // Blocking tasks already running cannot be aborted; the
                    // generation check above suppresses their result instead
                    previous.abort();
                }
            }
            Err(_) => warn!("Runner state poisoned, previous run not tracked"),
        }

        rx
    }

    /// Whether a started run has not yet finished
    pub fn is_running(&self) -> bool {
        match self.in_flight.lock() {
            Ok(in_flight) => in_flight.as_ref().is_some_and(|h| !h.is_finished()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::keystore::SoftwareKeystore;
    use crate::orchestrator::ProtocolOutcome;
    use crate::platform::StaticPlatform;
    use crate::storage::MemoryTekStorage;

    fn runner(api_level: u32) -> ProtocolRunner {
        let config = ProtocolConfig {
            wrapping_key_bits: 1024,
            ..ProtocolConfig::default()
        };
        ProtocolRunner::new(Arc::new(Orchestrator::new(
            Arc::new(SoftwareKeystore::new()),
            Arc::new(StaticPlatform::new(api_level)),
            Arc::new(MemoryTekStorage::new()),
            config,
        )))
    }

    #[tokio::test]
    async fn test_result_delivered() {
        let runner = runner(34);
        let run = runner.start("Hello from Server!".to_string()).await.unwrap();
        assert!(run.outcome.is_success(), "{:?}", run.outcome);
    }

    #[tokio::test]
    async fn test_new_run_disposes_previous() {
        let runner = runner(34);
        let first = runner.start("first".to_string());
        let second = runner.start("second".to_string());

        assert!(first.await.is_err());
        let run = second.await.unwrap();
        assert!(run.outcome.is_success());
    }

    #[tokio::test]
    async fn test_unsupported_platform_delivered() {
        let runner = runner(27);
        let run = runner.start("x".to_string()).await.unwrap();
        assert!(matches!(
            run.outcome,
            ProtocolOutcome::UnsupportedPlatform {
                api_level: 27,
                required: 28
            }
        ));
    }
}
