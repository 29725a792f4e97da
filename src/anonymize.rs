//! In-place anonymisation
//!
//! Applies the configured tag-table rewrite to received files before
//! processing. Two levels: rule-based (remove/blank lists from the
//! configuration) and full anonymisation (built-in comprehensive table
//! plus date and time blanking). AccessionNumber is always stripped.
//! Every mutation is write-to-temp-then-rename; a crash never leaves a
//! half-rewritten file behind.

use crate::config::AnonymizationConfig;
use crate::{Error, Result};
use dicom::core::{DataElement, PrimitiveValue, Tag};
use dicom::object::open_file;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Keyword to tag table for every attribute the anonymiser can touch.
/// Kept explicit so a configuration typo is a startup-visible warning,
/// not a silently ignored rule.
const KNOWN_TAGS: &[(&str, Tag)] = &[
    ("AccessionNumber", Tag(0x0008, 0x0050)),
    ("InstitutionName", Tag(0x0008, 0x0080)),
    ("InstitutionAddress", Tag(0x0008, 0x0081)),
    ("ReferringPhysicianName", Tag(0x0008, 0x0090)),
    ("ReferringPhysicianAddress", Tag(0x0008, 0x0092)),
    ("ReferringPhysicianTelephoneNumbers", Tag(0x0008, 0x0094)),
    ("StationName", Tag(0x0008, 0x1010)),
    ("PhysiciansOfRecord", Tag(0x0008, 0x1048)),
    ("PerformingPhysicianName", Tag(0x0008, 0x1050)),
    ("OperatorsName", Tag(0x0008, 0x1070)),
    ("AdmittingDiagnosesDescription", Tag(0x0008, 0x1080)),
    ("PatientName", Tag(0x0010, 0x0010)),
    ("PatientID", Tag(0x0010, 0x0020)),
    ("PatientBirthDate", Tag(0x0010, 0x0030)),
    ("PatientSex", Tag(0x0010, 0x0040)),
    ("OtherPatientIDs", Tag(0x0010, 0x1000)),
    ("OtherPatientNames", Tag(0x0010, 0x1001)),
    ("PatientBirthName", Tag(0x0010, 0x1005)),
    ("PatientAge", Tag(0x0010, 0x1010)),
    ("PatientSize", Tag(0x0010, 0x1020)),
    ("PatientWeight", Tag(0x0010, 0x1030)),
    ("PatientAddress", Tag(0x0010, 0x1040)),
    ("PatientMotherBirthName", Tag(0x0010, 0x1060)),
    ("MilitaryRank", Tag(0x0010, 0x1080)),
    ("BranchOfService", Tag(0x0010, 0x1081)),
    ("PatientTelephoneNumbers", Tag(0x0010, 0x2154)),
    ("EthnicGroup", Tag(0x0010, 0x2160)),
    ("PatientComments", Tag(0x0010, 0x4000)),
    ("DeviceSerialNumber", Tag(0x0018, 0x1000)),
    ("PlateID", Tag(0x0018, 0x1004)),
    ("StudyID", Tag(0x0020, 0x0010)),
    ("RequestingPhysician", Tag(0x0032, 0x1032)),
    ("StudyDate", Tag(0x0008, 0x0020)),
    ("SeriesDate", Tag(0x0008, 0x0021)),
    ("AcquisitionDate", Tag(0x0008, 0x0022)),
    ("ContentDate", Tag(0x0008, 0x0023)),
    ("StudyTime", Tag(0x0008, 0x0030)),
    ("SeriesTime", Tag(0x0008, 0x0031)),
    ("AcquisitionTime", Tag(0x0008, 0x0032)),
    ("ContentTime", Tag(0x0008, 0x0033)),
];

/// Attributes removed by full anonymisation.
const FULL_REMOVE: &[&str] = &[
    "PatientName",
    "PatientID",
    "PatientBirthDate",
    "PatientSex",
    "PatientAge",
    "PatientWeight",
    "PatientSize",
    "PatientAddress",
    "PatientTelephoneNumbers",
    "PatientMotherBirthName",
    "OtherPatientIDs",
    "OtherPatientNames",
    "PatientBirthName",
    "MilitaryRank",
    "BranchOfService",
    "EthnicGroup",
    "PatientComments",
    "DeviceSerialNumber",
    "PlateID",
    "InstitutionName",
    "InstitutionAddress",
    "ReferringPhysicianName",
    "ReferringPhysicianAddress",
    "ReferringPhysicianTelephoneNumbers",
    "PhysiciansOfRecord",
    "OperatorsName",
    "AdmittingDiagnosesDescription",
];

/// Attributes blanked (kept, emptied) by full anonymisation.
const FULL_BLANK: &[&str] = &[
    "AccessionNumber",
    "StudyID",
    "PerformingPhysicianName",
    "RequestingPhysician",
];

/// Date and time attributes coarsened by full anonymisation: dates keep
/// only the year, times are zeroed.
const FULL_DATES: &[&str] = &["StudyDate", "SeriesDate", "AcquisitionDate", "ContentDate"];
const FULL_TIMES: &[&str] = &["StudyTime", "SeriesTime", "AcquisitionTime", "ContentTime"];

/// Resolved anonymisation plan, built once from configuration.
#[derive(Debug, Clone)]
pub struct Anonymizer {
    remove: Vec<Tag>,
    blank: Vec<Tag>,
    coarsen_dates: Vec<Tag>,
    zero_times: Vec<Tag>,
}

fn lookup(keyword: &str) -> Option<Tag> {
    KNOWN_TAGS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(keyword))
        .map(|(_, tag)| *tag)
}

impl Anonymizer {
    pub fn from_config(config: &AnonymizationConfig) -> Anonymizer {
        let mut remove = Vec::new();
        let mut blank = Vec::new();
        let mut coarsen_dates = Vec::new();
        let mut zero_times = Vec::new();

        if config.full_anonymization_enabled {
            remove.extend(FULL_REMOVE.iter().filter_map(|name| lookup(name)));
            blank.extend(FULL_BLANK.iter().filter_map(|name| lookup(name)));
            coarsen_dates.extend(FULL_DATES.iter().filter_map(|name| lookup(name)));
            zero_times.extend(FULL_TIMES.iter().filter_map(|name| lookup(name)));
        } else {
            for keyword in &config.rules.remove_tags {
                match lookup(keyword) {
                    Some(tag) => remove.push(tag),
                    None => warn!("unknown remove_tags keyword {:?}, ignored", keyword),
                }
            }
            for keyword in &config.rules.blank_tags {
                match lookup(keyword) {
                    Some(tag) => blank.push(tag),
                    None => warn!("unknown blank_tags keyword {:?}, ignored", keyword),
                }
            }
        }

        // AccessionNumber must never pass through untouched.
        let accession = lookup("AccessionNumber").expect("AccessionNumber is in the table");
        if !remove.contains(&accession) && !blank.contains(&accession) {
            remove.push(accession);
        }

        Anonymizer {
            remove,
            blank,
            coarsen_dates,
            zero_times,
        }
    }

    /// Rewrite one file in place (temp + fsync + rename).
    pub fn apply_to_file(&self, path: &Path) -> Result<()> {
        let mut obj =
            open_file(path).map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))?;

        for tag in &self.remove {
            obj.remove_element(*tag);
        }
        for tag in &self.blank {
            blank_element(&mut obj, *tag);
        }
        for tag in &self.coarsen_dates {
            coarsen_date(&mut obj, *tag)?;
        }
        for tag in &self.zero_times {
            if obj.element_opt(*tag).map_err(|e| Error::Codec(e.to_string()))?.is_some() {
                let vr = dicom::core::VR::TM;
                obj.put(DataElement::new(*tag, vr, PrimitiveValue::from("000000")));
            }
        }

        let part = path.with_extension("part");
        obj.write_to_file(&part)
            .map_err(|e| Error::Codec(format!("{}: {}", part.display(), e)))?;
        fs::File::open(&part)?.sync_all()?;
        fs::rename(&part, path)?;
        debug!("anonymised {}", path.display());
        Ok(())
    }

    /// Apply the plan to every file in the given directories.
    pub fn apply_to_dirs(&self, dirs: &[std::path::PathBuf]) -> Result<usize> {
        let mut rewritten = 0usize;
        for dir in dirs {
            if !dir.is_dir() {
                continue;
            }
            let mut files: Vec<_> = fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .collect();
            files.sort();
            for file in files {
                self.apply_to_file(&file)?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}

fn blank_element(obj: &mut dicom::object::DefaultDicomObject, tag: Tag) {
    let vr = match obj.element_opt(tag) {
        Ok(Some(element)) => element.vr(),
        _ => return,
    };
    obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
}

/// Keep the year, blank month and day.
fn coarsen_date(obj: &mut dicom::object::DefaultDicomObject, tag: Tag) -> Result<()> {
    let Some(element) = obj.element_opt(tag).map_err(|e| Error::Codec(e.to_string()))? else {
        return Ok(());
    };
    let value = element.to_str()?.trim().to_string();
    if value.len() >= 4 {
        let year = &value[..4];
        obj.put(DataElement::new(
            tag,
            dicom::core::VR::DA,
            PrimitiveValue::from(format!("{}0101", year)),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnonymizationRules;
    use dicom::core::VR;
    use dicom::object::InMemDicomObject;

    fn config(remove: &[&str], blank: &[&str], full: bool) -> AnonymizationConfig {
        AnonymizationConfig {
            enabled: true,
            full_anonymization_enabled: full,
            rules: AnonymizationRules {
                remove_tags: remove.iter().map(|s| s.to_string()).collect(),
                blank_tags: blank.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn accession_number_is_always_covered() {
        let anonymizer = Anonymizer::from_config(&config(&["PatientID"], &[], false));
        let accession = lookup("AccessionNumber").unwrap();
        assert!(anonymizer.remove.contains(&accession));

        // Explicitly blanked: not re-added to the remove list.
        let anonymizer = Anonymizer::from_config(&config(&[], &["AccessionNumber"], false));
        assert!(!anonymizer.remove.contains(&accession));
        assert!(anonymizer.blank.contains(&accession));
    }

    #[test]
    fn unknown_keywords_are_ignored() {
        let anonymizer = Anonymizer::from_config(&config(&["NoSuchKeyword"], &[], false));
        // Only the forced AccessionNumber remains.
        assert_eq!(anonymizer.remove.len(), 1);
    }

    #[test]
    fn full_anonymisation_covers_the_comprehensive_table() {
        let anonymizer = Anonymizer::from_config(&config(&[], &[], true));
        assert!(anonymizer.remove.contains(&lookup("PatientName").unwrap()));
        assert!(anonymizer.blank.contains(&lookup("StudyID").unwrap()));
        assert!(anonymizer
            .coarsen_dates
            .contains(&lookup("StudyDate").unwrap()));
    }

    #[test]
    fn roundtrip_on_disk_removes_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.dcm");

        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            Tag(0x0008, 0x0018),
            VR::UI,
            PrimitiveValue::from("1.2.3.4"),
        ));
        obj.put(DataElement::new(
            Tag(0x0008, 0x0016),
            VR::UI,
            PrimitiveValue::from(dicom::dictionary_std::uids::CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from("Doe^Jane"),
        ));
        obj.put(DataElement::new(
            Tag(0x0008, 0x0050),
            VR::SH,
            PrimitiveValue::from("ACC-1"),
        ));
        let file_obj = obj
            .with_meta(
                dicom::object::FileMetaTableBuilder::new()
                    .transfer_syntax(dicom::dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(dicom::dictionary_std::uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid("1.2.3.4"),
            )
            .unwrap();
        file_obj.write_to_file(&path).unwrap();

        let anonymizer =
            Anonymizer::from_config(&config(&["PatientName", "AccessionNumber"], &[], false));
        anonymizer.apply_to_file(&path).unwrap();

        let reread = open_file(&path).unwrap();
        assert!(reread.element_opt(Tag(0x0010, 0x0010)).unwrap().is_none());
        assert!(reread.element_opt(Tag(0x0008, 0x0050)).unwrap().is_none());
        assert!(reread.element_opt(Tag(0x0008, 0x0018)).unwrap().is_some());
    }
}
