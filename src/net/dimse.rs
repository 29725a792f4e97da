//! DIMSE command sets
//!
//! Builders and a parsed view for the C-ECHO / C-STORE command objects the
//! listener and sender exchange. Command sets always travel in implicit VR
//! little endian regardless of the negotiated data transfer syntax.

use crate::{Error, Result};
use dicom::core::{dicom_value, DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// CommandDataSetType value meaning "no data set follows".
pub const NO_DATA_SET: u16 = 0x0101;
/// CommandDataSetType value meaning "a data set follows".
pub const DATA_SET_FOLLOWS: u16 = 0x0102;

pub const STATUS_SUCCESS: u16 = 0x0000;
/// Out of resources (also used for refused stores).
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
/// Error: cannot understand / processing failure.
pub const STATUS_PROCESSING_FAILURE: u16 = 0xC001;

/// Parsed fields of a received command set.
#[derive(Debug, Clone)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub has_data_set: bool,
    pub status: Option<u16>,
}

impl CommandSet {
    pub fn parse(obj: &InMemDicomObject) -> Result<CommandSet> {
        let command_field = obj.element(tags::COMMAND_FIELD)?.to_int::<u16>()?;
        let message_id = obj
            .element_opt(tags::MESSAGE_ID)?
            .map(|e| e.to_int::<u16>())
            .transpose()?
            .or(obj
                .element_opt(tags::MESSAGE_ID_BEING_RESPONDED_TO)?
                .map(|e| e.to_int::<u16>())
                .transpose()?)
            .unwrap_or(0);
        let affected_sop_class_uid = optional_str(obj, tags::AFFECTED_SOP_CLASS_UID)?;
        let affected_sop_instance_uid = optional_str(obj, tags::AFFECTED_SOP_INSTANCE_UID)?;
        let has_data_set = obj
            .element_opt(tags::COMMAND_DATA_SET_TYPE)?
            .map(|e| e.to_int::<u16>())
            .transpose()?
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false);
        let status = obj
            .element_opt(tags::STATUS)?
            .map(|e| e.to_int::<u16>())
            .transpose()?;
        Ok(CommandSet {
            command_field,
            message_id,
            affected_sop_class_uid,
            affected_sop_instance_uid,
            has_data_set,
            status,
        })
    }
}

fn optional_str(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Result<String> {
    Ok(obj
        .element_opt(tag)?
        .map(|e| e.to_str())
        .transpose()?
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .unwrap_or_default())
}

/// C-ECHO-RSP for a received echo request.
pub fn echo_response(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, dicom::dictionary_std::uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
    ])
}

/// C-STORE-RSP with the given status.
pub fn store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// C-STORE-RQ for one outbound instance.
pub fn store_request(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_FOLLOWS]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Serialise a command set in implicit VR little endian.
pub fn encode_command(obj: &InMemDicomObject) -> Result<Vec<u8>> {
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::with_capacity(256);
    obj.write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| Error::Codec(format!("command encode: {}", e)))?;
    Ok(data)
}

/// Parse a command set from implicit VR little endian bytes.
pub fn decode_command(data: &[u8]) -> Result<CommandSet> {
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
        .map_err(|e| Error::Codec(format!("command decode: {}", e)))?;
    CommandSet::parse(&obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_request_round_trips() {
        let cmd = store_request(7, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4");
        let bytes = encode_command(&cmd).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert_eq!(parsed.command_field, C_STORE_RQ);
        assert_eq!(parsed.message_id, 7);
        assert_eq!(parsed.affected_sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
        assert_eq!(parsed.affected_sop_instance_uid, "1.2.3.4");
        assert!(parsed.has_data_set);
        assert_eq!(parsed.status, None);
    }

    #[test]
    fn store_response_carries_status() {
        let cmd = store_response(7, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", STATUS_SUCCESS);
        let bytes = encode_command(&cmd).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert_eq!(parsed.command_field, C_STORE_RSP);
        assert_eq!(parsed.status, Some(STATUS_SUCCESS));
        assert!(!parsed.has_data_set);
    }

    #[test]
    fn echo_response_references_verification() {
        let cmd = echo_response(1);
        let bytes = encode_command(&cmd).unwrap();
        let parsed = decode_command(&bytes).unwrap();
        assert_eq!(parsed.command_field, C_ECHO_RSP);
        assert_eq!(
            parsed.affected_sop_class_uid,
            dicom::dictionary_std::uids::VERIFICATION
        );
    }
}
