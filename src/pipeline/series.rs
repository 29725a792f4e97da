//! Derived series synthesis
//!
//! For each source slice, emit a new instance carrying the source pixel
//! data unchanged plus an overlay plane populated from the merged mask.
//! Study-level identifier and frame of reference are preserved; series and
//! instance identifiers are freshly minted. Instances are written
//! temp-then-rename so the sender never observes a partial `Addition/`.

use crate::config::ProcessingConfig;
use crate::pipeline::burn_in;
use crate::pipeline::geometry::ImageSeries;
use crate::pipeline::mask::MaskVolume;
use crate::{Error, Result};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{open_file, FileMetaTableBuilder, InMemDicomObject};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const IMPLEMENTATION_VERSION: &str = concat!("NETRT_RS_", env!("CARGO_PKG_VERSION"));

/// Mint a DICOM UID in the UUID-derived `2.25.` root.
pub fn new_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

/// Result of one series synthesis pass.
#[derive(Debug)]
pub struct SynthesisedSeries {
    pub series_instance_uid: String,
    pub instance_count: usize,
}

/// Write the overlay-bearing derived series into `out_dir`.
pub fn synthesise_overlay_series(
    series: &ImageSeries,
    mask: &MaskVolume,
    processing: &ProcessingConfig,
    out_dir: &Path,
) -> Result<SynthesisedSeries> {
    fs::create_dir_all(out_dir)?;
    let series_uid = new_uid();
    let (date, time) = now_da_tm();

    for (index, slice) in series.slices.iter().enumerate() {
        let obj = open_file(&slice.path)
            .map_err(|e| Error::Codec(format!("{}: {}", slice.path.display(), e)))?;
        // Encapsulated pixel data only stays valid under its own transfer
        // syntax; everything else is written explicit little endian.
        let source_ts = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();
        let derived_ts = if source_ts == uids::IMPLICIT_VR_LITTLE_ENDIAN {
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()
        } else {
            source_ts
        };
        let mut inner = obj.into_inner();

        let sop_class_uid = inner
            .element(tags::SOP_CLASS_UID)?
            .to_str()?
            .trim()
            .to_string();
        let new_sop_uid = new_uid();

        inner.put(element_str(tags::SERIES_INSTANCE_UID, VR::UI, &series_uid));
        inner.put(element_str(tags::SOP_INSTANCE_UID, VR::UI, &new_sop_uid));
        inner.put(element_str(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            &processing.overlay_series_description,
        ));
        inner.put(element_str(
            tags::STUDY_DESCRIPTION,
            VR::LO,
            &processing.overlay_study_description,
        ));
        inner.put(element_str(
            tags::SERIES_NUMBER,
            VR::IS,
            &processing.overlay_series_number.to_string(),
        ));
        inner.put(element_str(tags::SERIES_DATE, VR::DA, &date));
        inner.put(element_str(tags::SERIES_TIME, VR::TM, &time));
        inner.put(element_str(tags::CONTENT_DATE, VR::DA, &date));
        inner.put(element_str(tags::CONTENT_TIME, VR::TM, &time));
        inner.put(element_str(tags::INSTANCE_CREATION_DATE, VR::DA, &date));
        inner.put(element_str(tags::INSTANCE_CREATION_TIME, VR::TM, &time));

        put_overlay_plane(&mut inner, mask, index);

        if processing.add_burn_in_disclaimer {
            // Best effort: sources with encapsulated pixel data keep their
            // pixels untouched.
            if !burn_in::apply(&mut inner, &processing.burn_in_text)? {
                warn!(
                    "burn-in skipped for {} (pixel data not native)",
                    slice.sop_instance_uid
                );
            }
        }

        let file_obj = inner
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(derived_ts)
                    .media_storage_sop_class_uid(sop_class_uid.clone())
                    .media_storage_sop_instance_uid(new_sop_uid.clone())
                    .implementation_version_name(IMPLEMENTATION_VERSION),
            )
            .map_err(|e| Error::Codec(e.to_string()))?;

        write_atomic(&file_obj, out_dir, &format!("overlay_{}.dcm", new_sop_uid))?;
    }

    debug!(
        "derived series {} written: {} instances",
        series_uid,
        series.slices.len()
    );
    Ok(SynthesisedSeries {
        series_instance_uid: series_uid,
        instance_count: series.slices.len(),
    })
}

/// Write the optional secondary-capture visualisation series: source
/// pixels windowed to 8-bit grey, mask blended in red. Slices whose pixel
/// data is not native 16- or 8-bit are skipped.
pub fn synthesise_debug_series(
    series: &ImageSeries,
    mask: &MaskVolume,
    processing: &ProcessingConfig,
    out_dir: &Path,
) -> Result<SynthesisedSeries> {
    fs::create_dir_all(out_dir)?;
    let series_uid = new_uid();
    let (date, time) = now_da_tm();
    let mut written = 0usize;

    for (index, slice) in series.slices.iter().enumerate() {
        let obj = open_file(&slice.path)
            .map_err(|e| Error::Codec(format!("{}: {}", slice.path.display(), e)))?;
        let mut inner = obj.into_inner();

        let Some(grey) = burn_in::normalised_grey(&inner)? else {
            warn!(
                "debug capture skipped for {} (pixel data not native)",
                slice.sop_instance_uid
            );
            continue;
        };

        let rows = slice.geometry.rows;
        let cols = slice.geometry.cols;
        let mut rgb = Vec::with_capacity(rows * cols * 3);
        let plane = mask.plane(index);
        for (pixel, value) in grey.iter().enumerate() {
            if plane.get(pixel).copied().unwrap_or(false) {
                rgb.extend_from_slice(&[255, (*value / 2), (*value / 2)]);
            } else {
                rgb.extend_from_slice(&[*value, *value, *value]);
            }
        }
        if rgb.len() % 2 != 0 {
            rgb.push(0);
        }

        let new_sop_uid = new_uid();
        inner.put(element_str(
            tags::SOP_CLASS_UID,
            VR::UI,
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
        ));
        inner.put(element_str(tags::SOP_INSTANCE_UID, VR::UI, &new_sop_uid));
        inner.put(element_str(tags::SERIES_INSTANCE_UID, VR::UI, &series_uid));
        inner.put(element_str(tags::MODALITY, VR::CS, "OT"));
        inner.put(element_str(
            tags::SERIES_DESCRIPTION,
            VR::LO,
            &format!("{} (debug)", processing.overlay_series_description),
        ));
        inner.put(element_str(
            tags::SERIES_NUMBER,
            VR::IS,
            &(processing.overlay_series_number + 1).to_string(),
        ));
        inner.put(element_str(tags::SERIES_DATE, VR::DA, &date));
        inner.put(element_str(tags::SERIES_TIME, VR::TM, &time));

        // Rewrite the pixel module for 8-bit RGB.
        inner.put(element_u16(tags::SAMPLES_PER_PIXEL, 3));
        inner.put(element_str(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "RGB"));
        inner.put(element_u16(tags::PLANAR_CONFIGURATION, 0));
        inner.put(element_u16(tags::BITS_ALLOCATED, 8));
        inner.put(element_u16(tags::BITS_STORED, 8));
        inner.put(element_u16(tags::HIGH_BIT, 7));
        inner.put(element_u16(tags::PIXEL_REPRESENTATION, 0));
        inner.remove_element(tags::RESCALE_INTERCEPT);
        inner.remove_element(tags::RESCALE_SLOPE);
        inner.remove_element(tags::WINDOW_CENTER);
        inner.remove_element(tags::WINDOW_WIDTH);
        inner.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(rgb),
        ));

        let file_obj = inner
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(new_sop_uid.clone())
                    .implementation_version_name(IMPLEMENTATION_VERSION),
            )
            .map_err(|e| Error::Codec(e.to_string()))?;

        write_atomic(&file_obj, out_dir, &format!("debug_{}.dcm", new_sop_uid))?;
        written += 1;
    }

    Ok(SynthesisedSeries {
        series_instance_uid: series_uid,
        instance_count: written,
    })
}

/// Populate overlay group 6000 from the mask plane. Any overlay the source
/// carried in that group is replaced.
fn put_overlay_plane(obj: &mut InMemDicomObject, mask: &MaskVolume, slice: usize) {
    let mut packed = mask.packed_plane(slice);
    if packed.len() % 2 != 0 {
        packed.push(0);
    }

    obj.put(DataElement::new(
        Tag(0x6000, 0x0010), // Overlay Rows
        VR::US,
        PrimitiveValue::from(mask.rows as u16),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0011), // Overlay Columns
        VR::US,
        PrimitiveValue::from(mask.cols as u16),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0015), // Number of Frames in Overlay
        VR::IS,
        PrimitiveValue::from("1"),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0022), // Overlay Description
        VR::LO,
        PrimitiveValue::from("Merged ROI overlay"),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0040), // Overlay Type: G = graphics
        VR::CS,
        PrimitiveValue::from("G"),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0050), // Overlay Origin: first pixel is (1,1)
        VR::SS,
        dicom::core::dicom_value!(I16, [1, 1]),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0100), // Overlay Bits Allocated
        VR::US,
        PrimitiveValue::from(1_u16),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x0102), // Overlay Bit Position
        VR::US,
        PrimitiveValue::from(0_u16),
    ));
    obj.put(DataElement::new(
        Tag(0x6000, 0x3000), // Overlay Data
        VR::OW,
        PrimitiveValue::from(packed),
    ));
}

fn element_str(tag: Tag, vr: VR, value: &str) -> dicom::object::mem::InMemElement {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

fn element_u16(tag: Tag, value: u16) -> dicom::object::mem::InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn now_da_tm() -> (String, String) {
    let now = chrono::Utc::now();
    (now.format("%Y%m%d").to_string(), now.format("%H%M%S").to_string())
}

/// Write a file object to `<dir>/<name>` via a `.part` sibling, fsynced
/// before the rename so the watcher and sender never see half a file.
pub fn write_atomic(
    file_obj: &dicom::object::DefaultDicomObject,
    dir: &Path,
    name: &str,
) -> Result<()> {
    let part = dir.join(format!("{}.part", name));
    let target = dir.join(name);
    file_obj
        .write_to_file(&part)
        .map_err(|e| Error::Codec(format!("{}: {}", part.display(), e)))?;
    fs::File::open(&part)?.sync_all()?;
    fs::rename(&part, &target)?;
    Ok(())
}
