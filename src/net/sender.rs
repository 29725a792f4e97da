//! C-STORE sender (SCU)
//!
//! Transmits a derived batch to the configured destination: one
//! association per batch, instances sent sequentially, per-instance
//! statuses collected. The batch succeeds only if every instance was
//! accepted. Transient network failures retry with exponential backoff;
//! a refusal from the peer does not.

use crate::config::DestinationConfig;
use crate::net::dimse;
use crate::{Error, Result};
use dicom::dictionary_std::{tags, uids};
use dicom::object::open_file;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::client::ClientAssociationOptions;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outbound C-STORE client for one configured destination.
#[derive(Debug, Clone)]
pub struct Sender {
    config: DestinationConfig,
    calling_ae_title: String,
}

/// What one file needs from negotiation.
#[derive(Debug)]
struct OutboundInstance {
    path: PathBuf,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax_uid: String,
}

impl Sender {
    pub fn new(config: DestinationConfig, calling_ae_title: String) -> Sender {
        Sender {
            config,
            calling_ae_title,
        }
    }

    /// Send every file of the batch. Returns the instance count on
    /// success; `SendFatal` after exhausted retries or a peer refusal.
    pub fn send_batch(&self, files: &[PathBuf]) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        let instances = inspect_batch(files)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&instances) {
                Ok(count) => return Ok(count),
                Err(Error::SendTransient(message)) if attempt < self.config.max_retries.max(1) => {
                    let delay = Duration::from_secs(
                        self.config.retry_backoff_seconds << (attempt - 1).min(16),
                    );
                    warn!(
                        "send attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.config.max_retries, message, delay
                    );
                    std::thread::sleep(delay);
                }
                Err(Error::SendTransient(message)) => {
                    return Err(Error::SendFatal(format!(
                        "{} attempts exhausted: {}",
                        attempt, message
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_once(&self, instances: &[OutboundInstance]) -> Result<usize> {
        let address = format!("{}:{}", self.config.ip, self.config.port);
        let classes = proposed_contexts(instances);

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.calling_ae_title.clone())
            .called_ae_title(self.config.ae_title.clone());
        for (class, syntaxes) in &classes {
            options = options.with_presentation_context(class.clone(), syntaxes.clone());
        }

        let mut scu = options
            .establish_with(&address)
            .map_err(|e| classify_establish_error(&address, e))?;
        debug!("association established with {}", address);

        let accepted: Vec<(u8, String)> = scu
            .presentation_contexts()
            .iter()
            .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
            .collect();

        let mut refused: usize = 0;
        for (index, instance) in instances.iter().enumerate() {
            let message_id = (index + 1) as u16;
            let (context_id, object_data) =
                prepare_instance(&classes, &accepted, instance)?;
            let command = dimse::encode_command(&dimse::store_request(
                message_id,
                &instance.sop_class_uid,
                &instance.sop_instance_uid,
            ))?;

            // Command set in its own PDU, dataset through the chunking
            // writer; both can fail only at the transport level.
            if let Err(e) = scu.send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: context_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command,
                }],
            }) {
                let _ = scu.abort();
                return Err(Error::SendTransient(format!("command send: {}", e)));
            }
            let data_sent = scu.send_pdata(context_id).write_all(&object_data);
            if let Err(e) = data_sent {
                let _ = scu.abort();
                return Err(Error::SendTransient(format!("data send: {}", e)));
            }

            let status = match receive_store_status(scu.receive()) {
                Ok(status) => status,
                Err(e) => {
                    let _ = scu.abort();
                    return Err(e);
                }
            };
            match status {
                dimse::STATUS_SUCCESS => debug!("sent {}", instance.sop_instance_uid),
                // Warning class: stored with coercion; counts as delivered.
                status if (0xB000..0xC000).contains(&status) => warn!(
                    "peer stored {} with warning status {:#06x}",
                    instance.sop_instance_uid, status
                ),
                status => {
                    warn!(
                        "peer refused {} with status {:#06x}",
                        instance.sop_instance_uid, status
                    );
                    refused += 1;
                }
            }
        }

        let _ = scu.release();

        if refused == 0 {
            info!(
                "batch of {} instance(s) accepted by {}",
                instances.len(),
                address
            );
            Ok(instances.len())
        } else {
            Err(Error::SendFatal(format!(
                "{} of {} instance(s) refused by peer",
                refused,
                instances.len()
            )))
        }
    }
}

/// One proposed context per SOP class present in the batch, with the
/// observed transfer syntaxes plus little-endian fallbacks. The proposal
/// order fixes the context ids (odd, ascending).
fn proposed_contexts(instances: &[OutboundInstance]) -> Vec<(String, Vec<String>)> {
    let mut classes: Vec<(String, Vec<String>)> = Vec::new();
    for instance in instances {
        match classes
            .iter_mut()
            .find(|(class, _)| *class == instance.sop_class_uid)
        {
            Some((_, syntaxes)) => {
                if !syntaxes.contains(&instance.transfer_syntax_uid) {
                    syntaxes.push(instance.transfer_syntax_uid.clone());
                }
            }
            None => classes.push((
                instance.sop_class_uid.clone(),
                vec![instance.transfer_syntax_uid.clone()],
            )),
        }
    }
    for (_, syntaxes) in classes.iter_mut() {
        for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
            if !syntaxes.iter().any(|ts| ts == fallback) {
                syntaxes.push(fallback.to_string());
            }
        }
    }
    classes
}

/// Pick the accepted presentation context for an instance and serialise
/// its dataset in the accepted transfer syntax.
fn prepare_instance(
    classes: &[(String, Vec<String>)],
    accepted: &[(u8, String)],
    instance: &OutboundInstance,
) -> Result<(u8, Vec<u8>)> {
    let class_index = classes
        .iter()
        .position(|(class, _)| *class == instance.sop_class_uid)
        .ok_or_else(|| Error::Internal("batch class table out of sync".to_string()))?;
    let context_id = (class_index * 2 + 1) as u8;
    let accepted_ts = accepted
        .iter()
        .find(|(id, _)| *id == context_id)
        .map(|(_, ts)| ts.clone())
        .ok_or_else(|| {
            Error::SendFatal(format!(
                "peer accepted no presentation context for {}",
                instance.sop_class_uid
            ))
        })?;

    let obj = open_file(&instance.path)
        .map_err(|e| Error::Codec(format!("{}: {}", instance.path.display(), e)))?;

    let ts = TransferSyntaxRegistry.get(&accepted_ts).ok_or_else(|| {
        Error::SendFatal(format!("peer negotiated unknown syntax {}", accepted_ts))
    })?;
    let mut object_data = Vec::with_capacity(1024 * 1024);
    obj.write_dataset_with_ts(&mut object_data, ts).map_err(|e| {
        Error::SendFatal(format!(
            "cannot re-encode {} as {}: {}",
            instance.sop_instance_uid, accepted_ts, e
        ))
    })?;
    Ok((context_id, object_data))
}

/// Extract the C-STORE-RSP status from the next PDU.
fn receive_store_status<P, E>(received: std::result::Result<P, E>) -> Result<u16>
where
    P: Into<Pdu>,
    E: std::fmt::Display,
{
    let pdu: Pdu = received
        .map_err(|e| Error::SendTransient(format!("response receive: {}", e)))?
        .into();
    match pdu {
        Pdu::PData { data } => {
            let value = data
                .first()
                .ok_or_else(|| Error::SendTransient("empty response PDU".to_string()))?;
            let command = dimse::decode_command(&value.data)?;
            command
                .status
                .ok_or_else(|| Error::SendFatal("response without status".to_string()))
        }
        other => Err(Error::SendTransient(format!(
            "unexpected response PDU: {:?}",
            other
        ))),
    }
}

/// Read the attributes negotiation needs, without pixel data.
fn inspect_batch(files: &[PathBuf]) -> Result<Vec<OutboundInstance>> {
    let mut instances = Vec::with_capacity(files.len());
    for path in files {
        let obj = dicom::object::OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))?;
        let meta = obj.meta();
        instances.push(OutboundInstance {
            path: path.clone(),
            sop_class_uid: meta
                .media_storage_sop_class_uid()
                .trim_end_matches('\0')
                .to_string(),
            sop_instance_uid: meta
                .media_storage_sop_instance_uid()
                .trim_end_matches('\0')
                .to_string(),
            transfer_syntax_uid: meta.transfer_syntax().trim_end_matches('\0').to_string(),
        });
    }
    Ok(instances)
}

/// Connection-level failures retry; an explicit rejection by the peer
/// does not.
fn classify_establish_error(address: &str, error: impl std::fmt::Display) -> Error {
    let message = format!("association with {}: {}", address, error);
    let lowered = message.to_lowercase();
    if lowered.contains("reject") || lowered.contains("abort") {
        Error::SendFatal(message)
    } else {
        Error::SendTransient(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(class: &str, ts: &str) -> OutboundInstance {
        OutboundInstance {
            path: PathBuf::from("/nonexistent"),
            sop_class_uid: class.to_string(),
            sop_instance_uid: "1.2.3".to_string(),
            transfer_syntax_uid: ts.to_string(),
        }
    }

    #[test]
    fn establishment_errors_classify_by_peer_involvement() {
        assert_eq!(
            classify_establish_error("1.2.3.4:104", "connection refused").kind(),
            "send-transient"
        );
        assert_eq!(
            classify_establish_error("1.2.3.4:104", "association rejected: out of resources")
                .kind(),
            "send-fatal"
        );
        assert_eq!(
            classify_establish_error("1.2.3.4:104", "operation timed out").kind(),
            "send-transient"
        );
    }

    #[test]
    fn one_context_per_sop_class_with_fallbacks() {
        let batch = vec![
            instance(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
            instance(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
            instance(
                uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
                uids::EXPLICIT_VR_LITTLE_ENDIAN,
            ),
        ];
        let contexts = proposed_contexts(&batch);
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].0, uids::CT_IMAGE_STORAGE);
        assert!(contexts[0]
            .1
            .iter()
            .any(|ts| ts == uids::IMPLICIT_VR_LITTLE_ENDIAN));
    }

    #[test]
    fn missing_accepted_context_is_fatal() {
        let batch = vec![instance(
            uids::CT_IMAGE_STORAGE,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        )];
        let classes = proposed_contexts(&batch);
        // Peer accepted nothing.
        let err = prepare_instance(&classes, &[], &batch[0]).unwrap_err();
        assert_eq!(err.kind(), "send-fatal");
    }

    #[test]
    fn warning_statuses_are_in_the_delivered_band() {
        assert!((0xB000..0xC000).contains(&0xB006_u16));
        assert!(!(0xB000..0xC000).contains(&dimse::STATUS_OUT_OF_RESOURCES));
    }
}
