//! Debounced study dispatcher
//!
//! Contract: for each study, trigger processing exactly once, only after
//! reception has quiesced, with at most one attempt in flight per study.
//!
//! The listener reports file activity; a timer thread watches for studies
//! whose last activity is older than the debounce interval, checks the
//! minimum-file quorum against the spool, and pushes the study onto the
//! bounded dispatch queue. The `scheduled` flag under the state mutex is
//! the single-flight gate: it is set only when the study was handed to the
//! queue and cleared only by `dispatch_complete`.
//!
//! Monotonic time (`Instant`) throughout; wall-clock drift must not cause
//! an early dispatch.

use crate::spool::{Spool, StudyKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Re-check interval once a study is waiting on a full dispatch queue.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Timer wake-up period when no study has a pending deadline.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct StudyEntry {
    /// When the debounce (or retry) deadline elapses.
    deadline: Instant,
    /// File-activity events observed, for diagnostics only; the quorum
    /// check consults the spool, which also covers restart recovery.
    events: u64,
    /// Dispatch handed to the queue and not yet completed.
    scheduled: bool,
    /// Activity arrived while scheduled; re-evaluate after completion.
    pending_rerun: bool,
}

struct Shared {
    state: Mutex<HashMap<StudyKey, StudyEntry>>,
    condvar: Condvar,
    stop: AtomicBool,
}

/// Debounced dispatcher with a dedicated timer thread.
pub struct Watcher {
    shared: Arc<Shared>,
    spool: Spool,
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Create the watcher and start its timer thread. Dispatches are
    /// pushed onto `dispatch_tx`; the consumer must call
    /// [`Watcher::dispatch_complete`] for every received study.
    pub fn new(
        spool: Spool,
        debounce: Duration,
        min_file_count: usize,
        dispatch_tx: SyncSender<StudyKey>,
    ) -> Arc<Watcher> {
        let shared = Arc::new(Shared {
            state: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let watcher = Arc::new(Watcher {
            shared: Arc::clone(&shared),
            spool: spool.clone(),
            debounce,
            timer: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name("watcher-timer".to_string())
            .spawn(move || {
                timer_loop(shared, spool, debounce, min_file_count, dispatch_tx);
            })
            .expect("failed to spawn watcher timer thread");
        *watcher.timer.lock().unwrap() = Some(handle);

        info!(
            "watcher started: debounce {:?}, min file count {}",
            debounce, min_file_count
        );
        watcher
    }

    /// Record file activity for a study and (re)arm its debounce timer.
    pub fn file_activity(&self, study: &StudyKey) {
        let mut state = self.shared.state.lock().unwrap();
        let entry = state.entry(study.clone()).or_insert_with(|| StudyEntry {
            deadline: Instant::now() + self.debounce,
            events: 0,
            scheduled: false,
            pending_rerun: false,
        });
        entry.deadline = Instant::now() + self.debounce;
        entry.events += 1;
        if entry.scheduled {
            entry.pending_rerun = true;
        }
        drop(state);
        self.shared.condvar.notify_all();
    }

    /// Called by the orchestrator on every terminal transition. Clears the
    /// single-flight gate; if activity arrived during processing and the
    /// study key is still present in the spool (re-receive case), the
    /// debounce re-arms for another round.
    pub fn dispatch_complete(&self, study: &StudyKey) {
        let mut state = self.shared.state.lock().unwrap();
        let rerun = match state.get_mut(study) {
            Some(entry) if entry.pending_rerun && self.spool.exists(study) => {
                entry.scheduled = false;
                entry.pending_rerun = false;
                entry.deadline = Instant::now() + self.debounce;
                true
            }
            Some(_) => {
                state.remove(study);
                false
            }
            None => false,
        };
        drop(state);
        if rerun {
            debug!("study {} saw activity during processing, re-armed", study);
        }
        self.shared.condvar.notify_all();
    }

    /// Synthesise activity for every study already on disk. Called once at
    /// start-up; quarantined studies are outside the scanned tree.
    pub fn recover(&self) -> crate::Result<()> {
        let studies = self.spool.list_studies()?;
        if !studies.is_empty() {
            info!("recovering {} stud(ies) found on disk", studies.len());
        }
        for study in studies {
            self.file_activity(&study);
        }
        Ok(())
    }

    /// Number of studies currently tracked (diagnostics and tests).
    pub fn tracked(&self) -> usize {
        self.shared.state.lock().unwrap().len()
    }

    /// Stop the timer thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.timer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(
    shared: Arc<Shared>,
    spool: Spool,
    debounce: Duration,
    min_file_count: usize,
    dispatch_tx: SyncSender<StudyKey>,
) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        let due: Vec<StudyKey> = state
            .iter()
            .filter(|(_, entry)| !entry.scheduled && entry.deadline <= now)
            .map(|(study, _)| study.clone())
            .collect();

        if !due.is_empty() {
            // Quorum checks touch the disk; do them without the lock.
            drop(state);
            let mut verdicts = Vec::with_capacity(due.len());
            for study in due {
                let exists = spool.exists(&study);
                let files = if exists { spool.file_count(&study) } else { 0 };
                verdicts.push((study, exists, files));
            }
            state = shared.state.lock().unwrap();

            for (study, exists, files) in verdicts {
                let Some(entry) = state.get_mut(&study) else {
                    continue;
                };
                // Activity may have re-armed the deadline while unlocked.
                if entry.scheduled || entry.deadline > Instant::now() {
                    continue;
                }
                if !exists {
                    debug!("study {} vanished before dispatch, dropping", study);
                    state.remove(&study);
                    continue;
                }
                if files < min_file_count {
                    debug!(
                        "study {} below quorum ({}/{}), waiting",
                        study, files, min_file_count
                    );
                    entry.deadline = Instant::now() + debounce;
                    continue;
                }
                match dispatch_tx.try_send(study.clone()) {
                    Ok(()) => {
                        entry.scheduled = true;
                        entry.pending_rerun = false;
                        info!("study {} quiesced with {} files, dispatched", study, files);
                    }
                    Err(TrySendError::Full(_)) => {
                        entry.deadline = Instant::now() + RETRY_INTERVAL;
                        debug!("dispatch queue full, study {} re-armed", study);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!("dispatch queue closed, watcher timer exiting");
                        return;
                    }
                }
            }
        }

        let now = Instant::now();
        let timeout = state
            .values()
            .filter(|entry| !entry.scheduled)
            .map(|entry| entry.deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_POLL);
        let (guard, _) = shared
            .condvar
            .wait_timeout(state, timeout.min(IDLE_POLL).max(Duration::from_millis(1)))
            .unwrap();
        state = guard;
    }
}
