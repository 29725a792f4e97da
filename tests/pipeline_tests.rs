//! End-to-end pipeline tests over synthetic studies written to a
//! temporary spool: ROI filtering, union merge, metadata-based slice
//! binding, frame-of-reference enforcement and derived-series identity
//! preservation.

use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{open_file, FileMetaTableBuilder, InMemDicomObject};
use netrt::config::ProcessingConfig;
use netrt::pipeline;
use netrt::spool::{Slot, Spool, StudyKey};
use std::path::Path;
use tempfile::TempDir;

const STUDY_UID: &str = "1.2.840.99.1.1";
const SERIES_UID: &str = "1.2.840.99.1.2";
const FOR_UID: &str = "1.2.840.99.1.3";
const ROWS: usize = 32;
const COLS: usize = 32;

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn put_u16(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

/// Write one 16x16 CT slice at patient z, origin (-8,-8), 1mm spacing.
fn write_slice(dir: &Path, file_name: &str, sop_uid: &str, z: f64, instance_number: i32) {
    let mut obj = InMemDicomObject::new_empty();
    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_uid);
    put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID);
    put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, SERIES_UID);
    put_str(&mut obj, tags::FRAME_OF_REFERENCE_UID, VR::UI, FOR_UID);
    put_str(&mut obj, tags::MODALITY, VR::CS, "CT");
    put_str(
        &mut obj,
        tags::INSTANCE_NUMBER,
        VR::IS,
        &instance_number.to_string(),
    );
    obj.put(DataElement::new(
        tags::IMAGE_POSITION_PATIENT,
        VR::DS,
        dicom_value!(F64, [-8.0, -8.0, z]),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_ORIENTATION_PATIENT,
        VR::DS,
        dicom_value!(F64, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_SPACING,
        VR::DS,
        dicom_value!(F64, [1.0, 1.0]),
    ));
    put_u16(&mut obj, tags::ROWS, ROWS as u16);
    put_u16(&mut obj, tags::COLUMNS, COLS as u16);
    put_u16(&mut obj, tags::BITS_ALLOCATED, 16);
    put_u16(&mut obj, tags::BITS_STORED, 16);
    put_u16(&mut obj, tags::HIGH_BIT, 15);
    put_u16(&mut obj, tags::PIXEL_REPRESENTATION, 0);
    put_u16(&mut obj, tags::SAMPLES_PER_PIXEL, 1);
    put_str(
        &mut obj,
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        "MONOCHROME2",
    );
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(gradient_pixels()),
    ));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_uid),
        )
        .unwrap();
    file_obj.write_to_file(dir.join(file_name)).unwrap();
}

/// Deterministic non-uniform pixel fill: value = row + col.
fn gradient_pixels() -> Vec<u8> {
    let mut pixels = Vec::with_capacity(ROWS * COLS * 2);
    for row in 0..ROWS {
        for col in 0..COLS {
            pixels.extend_from_slice(&((row + col) as u16).to_le_bytes());
        }
    }
    pixels
}

struct RoiSpec {
    number: i64,
    name: &'static str,
    frame_of_reference_uid: &'static str,
    /// Closed planar contours, each a flat list of patient points.
    contours: Vec<Vec<[f64; 3]>>,
}

/// Axis-aligned square contour at patient z.
fn square(x0: f64, y0: f64, x1: f64, y1: f64, z: f64) -> Vec<[f64; 3]> {
    vec![[x0, y0, z], [x1, y0, z], [x1, y1, z], [x0, y1, z]]
}

fn write_rtstruct(path: &Path, rois: &[RoiSpec]) {
    let mut obj = InMemDicomObject::new_empty();
    put_str(
        &mut obj,
        tags::SOP_CLASS_UID,
        VR::UI,
        uids::RT_STRUCTURE_SET_STORAGE,
    );
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, "1.2.840.99.2.1");
    put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID);
    put_str(&mut obj, tags::MODALITY, VR::CS, "RTSTRUCT");

    let mut roi_items = Vec::new();
    let mut contour_items = Vec::new();
    for roi in rois {
        let mut item = InMemDicomObject::new_empty();
        put_str(&mut item, tags::ROI_NUMBER, VR::IS, &roi.number.to_string());
        put_str(&mut item, tags::ROI_NAME, VR::LO, roi.name);
        put_str(
            &mut item,
            tags::REFERENCED_FRAME_OF_REFERENCE_UID,
            VR::UI,
            roi.frame_of_reference_uid,
        );
        roi_items.push(item);

        let mut contour_seq = Vec::new();
        for points in &roi.contours {
            let mut contour = InMemDicomObject::new_empty();
            put_str(&mut contour, tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR");
            put_str(
                &mut contour,
                tags::NUMBER_OF_CONTOUR_POINTS,
                VR::IS,
                &points.len().to_string(),
            );
            let flat: Vec<f64> = points.iter().flatten().copied().collect();
            contour.put(DataElement::new(
                tags::CONTOUR_DATA,
                VR::DS,
                PrimitiveValue::F64(flat.into()),
            ));
            contour_seq.push(contour);
        }
        let mut contour_item = InMemDicomObject::new_empty();
        put_str(
            &mut contour_item,
            tags::REFERENCED_ROI_NUMBER,
            VR::IS,
            &roi.number.to_string(),
        );
        contour_item.put(DataElement::new(
            tags::CONTOUR_SEQUENCE,
            VR::SQ,
            Value::from(DataSetSequence::from(contour_seq)),
        ));
        contour_items.push(contour_item);
    }

    obj.put(DataElement::new(
        tags::STRUCTURE_SET_ROI_SEQUENCE,
        VR::SQ,
        Value::from(DataSetSequence::from(roi_items)),
    ));
    obj.put(DataElement::new(
        tags::ROI_CONTOUR_SEQUENCE,
        VR::SQ,
        Value::from(DataSetSequence::from(contour_items)),
    ));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::RT_STRUCTURE_SET_STORAGE)
                .media_storage_sop_instance_uid("1.2.840.99.2.1"),
        )
        .unwrap();
    file_obj.write_to_file(path).unwrap();
}

/// Four slices at z = 0,2,4,6. File names deliberately out of spatial
/// order: ordering must come from the headers.
fn seed_study(spool: &Spool, rois: &[RoiSpec]) -> StudyKey {
    let key = Spool::safe_key(STUDY_UID).unwrap();
    spool.create(&key).unwrap();
    let dcm = spool.path_for(&key, Slot::Dcm);
    write_slice(&dcm, "slice_d.dcm", "1.2.840.99.3.1", 0.0, 1);
    write_slice(&dcm, "slice_c.dcm", "1.2.840.99.3.2", 2.0, 2);
    write_slice(&dcm, "slice_b.dcm", "1.2.840.99.3.3", 4.0, 3);
    write_slice(&dcm, "slice_a.dcm", "1.2.840.99.3.4", 6.0, 4);
    write_rtstruct(
        &spool.path_for(&key, Slot::Structure).join("rtstruct.dcm"),
        rois,
    );
    key
}

fn processing() -> ProcessingConfig {
    ProcessingConfig::default()
}

fn overlay_bit_count(path: &Path) -> usize {
    let obj = open_file(path).unwrap();
    let data = obj
        .element(Tag(0x6000, 0x3000))
        .unwrap()
        .to_bytes()
        .unwrap();
    data.iter().map(|byte| byte.count_ones() as usize).sum()
}

fn slice_z(path: &Path) -> f64 {
    let obj = open_file(path).unwrap();
    obj.element(tags::IMAGE_POSITION_PATIENT)
        .unwrap()
        .to_multi_float64()
        .unwrap()[2]
}

fn gtv() -> RoiSpec {
    RoiSpec {
        number: 1,
        name: "GTV",
        frame_of_reference_uid: FOR_UID,
        // 4x4 pixel square on the z=4 slice.
        contours: vec![square(-6.0, -6.0, -2.0, -2.0, 4.0)],
    }
}

fn skull() -> RoiSpec {
    RoiSpec {
        number: 2,
        name: "Skull",
        frame_of_reference_uid: FOR_UID,
        contours: vec![square(-7.0, -7.0, 7.0, 7.0, 2.0)],
    }
}

#[test]
fn derived_series_preserves_study_and_frame_of_reference() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[gtv(), skull()]);

    let output = pipeline::run(&spool, &key, &processing(), false).unwrap();
    assert_eq!(output.derived_instances, 4);
    assert_eq!(output.roi_names, vec!["GTV".to_string()]);
    assert_eq!(output.debug_instances, 0);

    let derived = spool.slot_files(&key, Slot::Addition).unwrap();
    assert_eq!(derived.len(), 4);

    let mut series_uids = Vec::new();
    for path in &derived {
        let obj = open_file(path).unwrap();
        assert_eq!(
            obj.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap().trim(),
            STUDY_UID
        );
        assert_eq!(
            obj.element(tags::FRAME_OF_REFERENCE_UID).unwrap().to_str().unwrap().trim(),
            FOR_UID
        );
        let series = obj
            .element(tags::SERIES_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim()
            .to_string();
        assert_ne!(series, SERIES_UID);
        series_uids.push(series);

        // Overlay plane module is complete and binary.
        assert_eq!(
            obj.element(Tag(0x6000, 0x0100)).unwrap().to_int::<u16>().unwrap(),
            1
        );
        assert_eq!(
            obj.element(Tag(0x6000, 0x0040)).unwrap().to_str().unwrap().trim(),
            "G"
        );
        assert_eq!(
            obj.element(Tag(0x6000, 0x0010)).unwrap().to_int::<u16>().unwrap(),
            ROWS as u16
        );
    }
    series_uids.dedup();
    assert_eq!(series_uids.len(), 1, "one fresh series UID for all slices");

    // Source pixel data passes through unchanged when burn-in is off.
    for path in &derived {
        let obj = open_file(path).unwrap();
        let data = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
        assert_eq!(data.as_ref(), gradient_pixels().as_slice());
    }
}

#[test]
fn contours_bind_to_slices_by_position_not_filename() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[gtv()]);

    pipeline::run(&spool, &key, &processing(), false).unwrap();

    let derived = spool.slot_files(&key, Slot::Addition).unwrap();
    for path in &derived {
        let bits = overlay_bit_count(path);
        if (slice_z(path) - 4.0).abs() < 1e-6 {
            // 4x4 pixel square.
            assert_eq!(bits, 16, "contour must land on the z=4 slice");
        } else {
            assert_eq!(bits, 0, "slice at z={} must stay empty", slice_z(path));
        }
    }
}

#[test]
fn skull_only_structure_set_is_roi_empty() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[skull()]);

    let err = pipeline::run(&spool, &key, &processing(), false).unwrap_err();
    assert_eq!(err.kind(), "roi-empty");
    // No partial derived series appears.
    assert!(spool.slot_files(&key, Slot::Addition).unwrap().is_empty());
}

#[test]
fn multiple_surviving_rois_merge_as_union() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let ptv = RoiSpec {
        number: 3,
        name: "PTV",
        frame_of_reference_uid: FOR_UID,
        // Disjoint 4x4 square on the same slice as the GTV.
        contours: vec![square(1.0, 1.0, 5.0, 5.0, 4.0)],
    };
    let key = seed_study(&spool, &[gtv(), ptv]);

    let output = pipeline::run(&spool, &key, &processing(), false).unwrap();
    assert_eq!(output.roi_names.len(), 2);

    let derived = spool.slot_files(&key, Slot::Addition).unwrap();
    let z4: Vec<_> = derived
        .iter()
        .filter(|path| (slice_z(path) - 4.0).abs() < 1e-6)
        .collect();
    assert_eq!(z4.len(), 1);
    // Union of two disjoint 16-pixel squares.
    assert_eq!(overlay_bit_count(z4[0]), 32);
}

#[test]
fn rerun_discards_output_of_an_interrupted_run() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[gtv()]);

    // A crash mid-synthesis left a stray derived instance behind.
    let addition = spool.path_for(&key, Slot::Addition);
    std::fs::create_dir_all(&addition).unwrap();
    std::fs::write(addition.join("overlay_stale.dcm"), b"half-written").unwrap();

    let output = pipeline::run(&spool, &key, &processing(), false).unwrap();
    assert_eq!(output.derived_instances, 4);

    let derived = spool.slot_files(&key, Slot::Addition).unwrap();
    assert_eq!(derived.len(), 4);
    assert!(derived
        .iter()
        .all(|path| !path.ends_with("overlay_stale.dcm")));
}

#[test]
fn mismatched_frame_of_reference_is_rejected() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let alien = RoiSpec {
        number: 1,
        name: "GTV",
        frame_of_reference_uid: "1.2.840.99.9.9",
        contours: vec![square(-6.0, -6.0, -2.0, -2.0, 4.0)],
    };
    let key = seed_study(&spool, &[alien]);

    let err = pipeline::run(&spool, &key, &processing(), false).unwrap_err();
    assert_eq!(err.kind(), "coordinate-mismatch");
}

#[test]
fn debug_capture_series_is_written_on_request() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[gtv()]);

    let output = pipeline::run(&spool, &key, &processing(), true).unwrap();
    assert_eq!(output.debug_instances, 4);

    let debug_files = spool.slot_files(&key, Slot::DebugDicom).unwrap();
    assert_eq!(debug_files.len(), 4);
    let obj = open_file(&debug_files[0]).unwrap();
    assert_eq!(
        obj.element(tags::SOP_CLASS_UID).unwrap().to_str().unwrap().trim(),
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE
    );
    assert_eq!(
        obj.element(tags::PHOTOMETRIC_INTERPRETATION)
            .unwrap()
            .to_str()
            .unwrap()
            .trim(),
        "RGB"
    );
}

#[test]
fn burn_in_disclaimer_modifies_derived_pixels_only() {
    let dir = TempDir::new().unwrap();
    let spool = Spool::new(&dir.path().join("working"), "quarantine").unwrap();
    let key = seed_study(&spool, &[gtv()]);

    let mut config = processing();
    config.add_burn_in_disclaimer = true;
    config.burn_in_text = "X".to_string();
    pipeline::run(&spool, &key, &config, false).unwrap();

    // Source pixels untouched.
    for path in spool.slot_files(&key, Slot::Dcm).unwrap() {
        let obj = open_file(&path).unwrap();
        let data = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
        assert_eq!(data.as_ref(), gradient_pixels().as_slice());
    }
    // Every derived instance carries the burned-in band.
    for path in spool.slot_files(&key, Slot::Addition).unwrap() {
        let obj = open_file(&path).unwrap();
        let data = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
        assert_ne!(data.as_ref(), gradient_pixels().as_slice());
    }
}
