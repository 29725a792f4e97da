//! C-STORE listener (SCP)
//!
//! Accepts DICOM upper-layer associations on the configured endpoint and
//! writes incoming instances into the spool. One handler thread per open
//! association under a bounded count; the accept loop polls so shutdown is
//! never blocked on `accept`.
//!
//! Supported services: verification, plus storage for any SOP class the
//! peer proposes. Image-bearing instances land in `DCM/`, structure sets
//! in `Structure/`; other storage SOP classes go to `DCM/` with a log
//! line.

use crate::config::ListenerConfig;
use crate::events::{self, TransactionEvent};
use crate::net::dimse;
use crate::spool::{Slot, Spool};
use crate::watcher::Watcher;
use crate::{Error, Result};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::server::ServerAssociationOptions;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll period of the accept loop between shutdown checks.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Running listener: accept thread plus the live association count.
pub struct Listener {
    accept_thread: Option<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    /// Bind the configured endpoint and start accepting associations.
    pub fn start(
        config: ListenerConfig,
        spool: Spool,
        watcher: Arc<Watcher>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Listener> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        info!(
            "listener on {} (AE {}, max {} associations)",
            addr, config.ae_title, config.max_associations
        );

        let active = Arc::new(AtomicUsize::new(0));
        let accept_active = Arc::clone(&active);
        let accept_shutdown = Arc::clone(&shutdown);

        let accept_thread = thread::Builder::new()
            .name("dicom-accept".to_string())
            .spawn(move || {
                accept_loop(
                    listener,
                    config,
                    spool,
                    watcher,
                    accept_active,
                    accept_shutdown,
                );
            })
            .expect("failed to spawn accept thread");

        Ok(Listener {
            accept_thread: Some(accept_thread),
            active,
            shutdown,
        })
    }

    /// Stop accepting and wait up to `grace` for open associations to
    /// drain. Associations still open afterwards are abandoned; their
    /// sockets die with the process.
    pub fn shutdown(mut self, grace: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let deadline = Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("{} association(s) still open after grace period", remaining);
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    spool: Spool,
    watcher: Arc<Watcher>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("listener stopped accepting");
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.load(Ordering::SeqCst) >= config.max_associations {
                    warn!("association limit reached, refusing {}", peer);
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let spool = spool.clone();
                let watcher = Arc::clone(&watcher);
                let active_thread = Arc::clone(&active);
                let spawned = thread::Builder::new()
                    .name(format!("assoc-{}", peer))
                    .spawn(move || {
                        if let Err(e) = run_association(stream, &config, &spool, &watcher) {
                            warn!("association with {} ended with error: {}", peer, e);
                        }
                        active_thread.fetch_sub(1, Ordering::SeqCst);
                    });
                if spawned.is_err() {
                    active.fetch_sub(1, Ordering::SeqCst);
                    warn!("could not spawn association thread for {}", peer);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// One command PDU carrying an encoded command set.
fn command_pdu(presentation_context_id: u8, data: Vec<u8>) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    }
}

/// Serve one association until release, abort or error.
fn run_association(
    stream: TcpStream,
    config: &ListenerConfig,
    spool: &Spool,
    watcher: &Watcher,
) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let timeout = Duration::from_secs(config.inactivity_timeout_seconds);
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(config.ae_title.clone());
    if !config.config_negotiated_transfer_syntax {
        // Stored files are re-encoded to explicit little endian, so only
        // accept syntaxes that decode without a pixel-data transcoder.
        options = options
            .with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN);
    }

    let mut association = options
        .establish(stream)
        .map_err(|e| Error::Codec(format!("association with {} failed: {}", peer, e)))?;
    debug!("association established with {}", peer);

    // Accepted presentation contexts, id to transfer syntax.
    let contexts: Vec<(u8, String)> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
        .collect();

    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut pending: Option<dimse::CommandSet> = None;
    let mut oversize = false;

    loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                for mut data_value in data {
                    match data_value.value_type {
                        PDataValueType::Command if data_value.is_last => {
                            let command = dimse::decode_command(&data_value.data)?;
                            match command.command_field {
                                dimse::C_ECHO_RQ => {
                                    info!("C-ECHO from {}", peer);
                                    let response = dimse::encode_command(&dimse::echo_response(
                                        command.message_id,
                                    ))?;
                                    association
                                        .send(&command_pdu(
                                            data_value.presentation_context_id,
                                            response,
                                        ))
                                        .map_err(|e| {
                                            Error::Codec(format!("send to {}: {}", peer, e))
                                        })?;
                                }
                                dimse::C_STORE_RQ => {
                                    instance_buffer.clear();
                                    oversize = false;
                                    pending = Some(command);
                                }
                                other => {
                                    warn!(
                                        "unsupported DIMSE command {:#06x} from {}, aborting",
                                        other, peer
                                    );
                                    let _ = association.abort();
                                    return Ok(());
                                }
                            }
                        }
                        PDataValueType::Data => {
                            if instance_buffer.len() + data_value.data.len()
                                > config.max_instance_bytes
                            {
                                oversize = true;
                                instance_buffer.clear();
                            }
                            if !oversize {
                                instance_buffer.append(&mut data_value.data);
                            }
                            if data_value.is_last {
                                let Some(command) = pending.take() else {
                                    warn!("data set without a C-STORE command from {}", peer);
                                    let _ = association.abort();
                                    return Ok(());
                                };
                                let status = if oversize {
                                    warn!("instance from {} exceeds size cap, refused", peer);
                                    dimse::STATUS_OUT_OF_RESOURCES
                                } else {
                                    match handle_store(
                                        &contexts,
                                        data_value.presentation_context_id,
                                        &command,
                                        &instance_buffer,
                                        config,
                                        spool,
                                        watcher,
                                        &peer,
                                    ) {
                                        Ok(status) => status,
                                        Err(e @ Error::MalformedIdentifier(_)) => {
                                            warn!("{} from {}, rejecting association", e, peer);
                                            let _ = association.abort();
                                            return Ok(());
                                        }
                                        Err(e) => {
                                            warn!("store from {} failed: {}", peer, e);
                                            dimse::STATUS_PROCESSING_FAILURE
                                        }
                                    }
                                };
                                instance_buffer.clear();
                                let response = dimse::encode_command(&dimse::store_response(
                                    command.message_id,
                                    &command.affected_sop_class_uid,
                                    &command.affected_sop_instance_uid,
                                    status,
                                ))?;
                                association
                                    .send(&command_pdu(
                                        data_value.presentation_context_id,
                                        response,
                                    ))
                                    .map_err(|e| {
                                        Error::Codec(format!("send to {}: {}", peer, e))
                                    })?;
                            }
                        }
                        PDataValueType::Command => {
                            // Fragmented command sets are not produced by any
                            // known peer; refuse rather than misparse.
                            warn!("fragmented command set from {}, aborting", peer);
                            let _ = association.abort();
                            return Ok(());
                        }
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                debug!("release from {}", peer);
                let _ = association.send(&Pdu::ReleaseRP);
                return Ok(());
            }
            Ok(Pdu::AbortRQ { source }) => {
                warn!("association aborted by {} ({:?})", peer, source);
                return Ok(());
            }
            Ok(other) => {
                warn!("unexpected PDU from {}: {:?}, aborting", peer, other);
                let _ = association.abort();
                return Ok(());
            }
            Err(e) => {
                // Covers inactivity timeouts and connection loss.
                return Err(Error::Codec(format!("receive from {}: {}", peer, e)));
            }
        }
    }
}

/// Parse and persist one received instance. Returns the DIMSE status to
/// answer with; a malformed study identifier escalates to an association
/// rejection instead.
#[allow(clippy::too_many_arguments)]
fn handle_store(
    contexts: &[(u8, String)],
    presentation_context_id: u8,
    command: &dimse::CommandSet,
    data: &[u8],
    config: &ListenerConfig,
    spool: &Spool,
    watcher: &Watcher,
    peer: &str,
) -> Result<u16> {
    let negotiated_ts_uid = contexts
        .iter()
        .find(|(id, _)| *id == presentation_context_id)
        .map(|(_, ts)| ts.clone())
        .ok_or_else(|| Error::Internal("unknown presentation context".to_string()))?;
    let ts = TransferSyntaxRegistry
        .get(&negotiated_ts_uid)
        .ok_or_else(|| Error::Codec(format!("unknown transfer syntax {}", negotiated_ts_uid)))?;

    let obj = InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| Error::Codec(format!("dataset parse: {}", e)))?;

    let raw_study_uid = obj
        .element_opt(tags::STUDY_INSTANCE_UID)
        .map_err(|e| Error::Codec(e.to_string()))?
        .map(|e| e.to_str())
        .transpose()?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let study = Spool::safe_key(&raw_study_uid)?;

    let sop_class_uid = if command.affected_sop_class_uid.is_empty() {
        obj.element(tags::SOP_CLASS_UID)?.to_str()?.trim().to_string()
    } else {
        command.affected_sop_class_uid.clone()
    };
    let sop_instance_uid = if command.affected_sop_instance_uid.is_empty() {
        obj.element(tags::SOP_INSTANCE_UID)?.to_str()?.trim().to_string()
    } else {
        command.affected_sop_instance_uid.clone()
    };
    // Instance identifier becomes the file name; hold it to the same
    // sanitisation bar.
    if Spool::safe_key(&sop_instance_uid).is_err() {
        warn!("unusable SOP instance identifier from {}", peer);
        return Ok(dimse::STATUS_PROCESSING_FAILURE);
    }

    let slot = route_sop_class(&obj, &sop_class_uid);

    let first_file = !spool.exists(&study);
    if first_file {
        spool.create(&study)?;
        events::record(&TransactionEvent::ReceivingStarted {
            study: study.to_string(),
            peer: peer.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    let stored_ts = if config.config_negotiated_transfer_syntax {
        negotiated_ts_uid.as_str()
    } else {
        uids::EXPLICIT_VR_LITTLE_ENDIAN
    };
    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(stored_ts)
                .media_storage_sop_class_uid(sop_class_uid.clone())
                .media_storage_sop_instance_uid(sop_instance_uid.clone()),
        )
        .map_err(|e| Error::Codec(e.to_string()))?;

    let name = format!("{}.dcm", sop_instance_uid);
    let path = spool.store_instance(&study, slot, &name, &file_obj)?;
    debug!("stored {} from {}", path.display(), peer);

    watcher.file_activity(&study);
    Ok(dimse::STATUS_SUCCESS)
}

/// Structure sets go to `Structure/`; everything else, image-bearing or
/// not, goes to `DCM/`.
fn route_sop_class(obj: &InMemDicomObject, sop_class_uid: &str) -> Slot {
    if sop_class_uid == uids::RT_STRUCTURE_SET_STORAGE {
        return Slot::Structure;
    }
    let modality = obj
        .element_opt(tags::MODALITY)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_uppercase())
        .unwrap_or_default();
    if modality == "RTSTRUCT" {
        return Slot::Structure;
    }
    if modality != "CT" && modality != "MR" {
        info!(
            "storage SOP class {} (modality {:?}) routed to DCM",
            sop_class_uid, modality
        );
    }
    Slot::Dcm
}
