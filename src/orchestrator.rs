//! Study orchestrator
//!
//! Owns the study lifecycle: consumes dispatches from the watcher queue,
//! validates spool contents, applies anonymisation, runs the pipeline,
//! invokes the sender and disposes of the study (cleanup on success,
//! quarantine on failure). `dispatch_complete` is reported to the watcher
//! on every path so the single-flight gate always clears.

use crate::anonymize::Anonymizer;
use crate::config::Config;
use crate::events::{self, TransactionEvent};
use crate::net::sender::Sender;
use crate::pipeline;
use crate::spool::{Slot, Spool, StudyKey};
use crate::watcher::Watcher;
use crate::{Error, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pipeline worker count. Studies process serially by default; the
/// single-flight-per-study rule holds for any value.
const PIPELINE_WORKERS: usize = 1;

/// In-memory lifecycle state of a dispatched study.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Processing,
    Sending,
}

/// The orchestrator's running worker pool.
pub struct Orchestrator {
    workers: Vec<JoinHandle<()>>,
    states: Arc<Mutex<HashMap<StudyKey, LifecycleState>>>,
}

struct Worker {
    config: Config,
    spool: Spool,
    watcher: Arc<Watcher>,
    sender: Sender,
    anonymizer: Option<Anonymizer>,
    debug_visualisation: bool,
    states: Arc<Mutex<HashMap<StudyKey, LifecycleState>>>,
}

impl Orchestrator {
    /// Spawn the pipeline workers consuming the dispatch queue.
    pub fn start(
        config: Config,
        spool: Spool,
        watcher: Arc<Watcher>,
        sender: Sender,
        dispatch_rx: Receiver<StudyKey>,
        debug_visualisation: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Orchestrator {
        let states = Arc::new(Mutex::new(HashMap::new()));
        let rx = Arc::new(Mutex::new(dispatch_rx));
        let anonymizer = config
            .anonymization
            .enabled
            .then(|| Anonymizer::from_config(&config.anonymization));

        let mut workers = Vec::with_capacity(PIPELINE_WORKERS);
        for index in 0..PIPELINE_WORKERS {
            let worker = Worker {
                config: config.clone(),
                spool: spool.clone(),
                watcher: Arc::clone(&watcher),
                sender: sender.clone(),
                anonymizer: anonymizer.clone(),
                debug_visualisation,
                states: Arc::clone(&states),
            };
            let rx = Arc::clone(&rx);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("pipeline-{}", index))
                .spawn(move || worker_loop(worker, rx, shutdown))
                .expect("failed to spawn pipeline worker");
            workers.push(handle);
        }

        Orchestrator { workers, states }
    }

    /// Lifecycle state of a study, if it is currently dispatched.
    pub fn state_of(&self, study: &StudyKey) -> Option<LifecycleState> {
        self.states.lock().unwrap().get(study).copied()
    }

    /// Number of studies currently in flight.
    pub fn in_flight(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// Wait for the workers to drain and exit. The dispatch queue sender
    /// must already be dropped (watcher stopped); in-flight studies finish,
    /// they are never interrupted.
    pub fn shutdown(self) {
        for handle in self.workers {
            let _ = handle.join();
        }
        let leftover = self.states.lock().unwrap().len();
        if leftover > 0 {
            // Should be unreachable: workers only exit with empty state.
            error!("{} study state(s) leaked past shutdown", leftover);
        }
    }
}

fn worker_loop(worker: Worker, rx: Arc<Mutex<Receiver<StudyKey>>>, shutdown: Arc<AtomicBool>) {
    loop {
        // Hold the receiver lock only while polling, so sibling workers
        // interleave fairly.
        let received = {
            let rx = rx.lock().unwrap();
            rx.recv_timeout(Duration::from_millis(250))
        };
        match received {
            Ok(study) => {
                if shutdown.load(Ordering::SeqCst) {
                    // Not yet started: leave the study on disk for restart
                    // recovery instead of delaying shutdown.
                    info!("shutdown in progress, deferring study {}", study);
                    worker.watcher.dispatch_complete(&study);
                    continue;
                }
                worker.process(&study);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl Worker {
    /// Drive one study from dispatch to a terminal state. Never panics
    /// through; never returns without `dispatch_complete`.
    fn process(&self, study: &StudyKey) {
        events::record(&TransactionEvent::ProcessingStart {
            study: study.to_string(),
            timestamp: chrono::Utc::now(),
        });
        self.set_state(study, LifecycleState::Processing);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_pipeline(study)));
        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "pipeline worker panicked".to_string());
                Err(Error::Internal(message))
            }
        };

        match outcome {
            Ok(()) => {}
            Err(e) => self.dispose_failure(study, e),
        }

        self.clear_state(study);
        self.watcher.dispatch_complete(study);
    }

    fn run_pipeline(&self, study: &StudyKey) -> Result<()> {
        // Step 1: spool validation.
        if self.spool.slot_files(study, Slot::Dcm)?.is_empty() {
            return Err(Error::IncompleteStudy("DCM directory is empty".to_string()));
        }
        if self.spool.slot_files(study, Slot::Structure)?.is_empty() {
            return Err(Error::IncompleteStudy(
                "Structure directory is empty".to_string(),
            ));
        }

        // Step 2: anonymisation in place, before anything reads the data.
        if let Some(anonymizer) = &self.anonymizer {
            let rewritten = anonymizer.apply_to_dirs(&[
                self.spool.path_for(study, Slot::Dcm),
                self.spool.path_for(study, Slot::Structure),
            ])?;
            info!("study {} anonymised ({} files)", study, rewritten);
        }

        // Step 3: contour engine and series synthesis.
        let output = pipeline::run(
            &self.spool,
            study,
            &self.config.processing,
            self.debug_visualisation || self.config.feature_flags.enable_debug_visualisation,
        )?;
        events::record(&TransactionEvent::ProcessingSuccess {
            study: study.to_string(),
            derived_instances: output.derived_instances,
            timestamp: chrono::Utc::now(),
        });

        // Step 4: egress. The debug series is part of the all-or-nothing
        // batch.
        self.set_state(study, LifecycleState::Sending);
        let mut batch = self.spool.slot_files(study, Slot::Addition)?;
        batch.extend(self.spool.slot_files(study, Slot::DebugDicom)?);
        let peer = format!("{}:{}", self.config.dicom_destination.ip, self.config.dicom_destination.port);

        match self.sender.send_batch(&batch) {
            Ok(count) => {
                events::record(&TransactionEvent::SendingSuccess {
                    study: study.to_string(),
                    peer: peer.clone(),
                    instances: count,
                    timestamp: chrono::Utc::now(),
                });
                self.spool.cleanup(study).unwrap_or_else(|e| self.fatal_io(e));
                events::record(&TransactionEvent::StudyDeleted {
                    study: study.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                info!("study {} delivered and deleted", study);
                Ok(())
            }
            Err(e) => {
                events::record(&TransactionEvent::SendingFailed {
                    study: study.to_string(),
                    peer,
                    error_kind: e.kind().to_string(),
                    timestamp: chrono::Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Quarantine policy for a failed study.
    fn dispose_failure(&self, study: &StudyKey, error: Error) {
        match &error {
            Error::Io(_) => {
                // The spool already retried once internally; a failure
                // surfacing here means storage is unreliable.
                self.fatal_io(error);
            }
            _ => {
                warn!("study {} failed: {}", study, error);
                if !matches!(error, Error::SendFatal(_) | Error::SendTransient(_)) {
                    events::record(&TransactionEvent::ProcessingFailed {
                        study: study.to_string(),
                        error_kind: error.kind().to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                }
                let reason = format!("{}: {}", error.kind(), error);
                match self.spool.quarantine(study, &reason) {
                    Ok(()) => events::record(&TransactionEvent::StudyQuarantined {
                        study: study.to_string(),
                        reason: error.kind().to_string(),
                        timestamp: chrono::Utc::now(),
                    }),
                    Err(e) => self.fatal_io(e),
                }
            }
        }
    }

    /// An unreliable spool is unrecoverable: abort the service.
    fn fatal_io(&self, error: Error) -> ! {
        error!("spool failure, aborting service: {}", error);
        std::process::exit(2);
    }

    fn set_state(&self, study: &StudyKey, state: LifecycleState) {
        self.states.lock().unwrap().insert(study.clone(), state);
    }

    fn clear_state(&self, study: &StudyKey) {
        self.states.lock().unwrap().remove(study);
    }
}
