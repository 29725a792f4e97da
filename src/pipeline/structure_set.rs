//! RT Structure Set parsing
//!
//! Pulls the named contour sets out of an RTSTRUCT instance:
//! `StructureSetROISequence` supplies ROI number, name and frame of
//! reference; `ROIContourSequence` supplies the contour polygons. Only
//! closed planar contours are rasterised.

use crate::{Error, Result};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// One contour polygon in patient coordinates.
#[derive(Debug, Clone)]
pub struct Contour {
    pub points: Vec<[f64; 3]>,
}

/// A named region of interest with its contours.
#[derive(Debug, Clone)]
pub struct Roi {
    pub number: i64,
    pub name: String,
    pub frame_of_reference_uid: String,
    pub contours: Vec<Contour>,
}

/// Parsed structure set.
#[derive(Debug)]
pub struct StructureSet {
    pub sop_instance_uid: String,
    pub rois: Vec<Roi>,
}

impl StructureSet {
    /// Parse an RTSTRUCT file.
    pub fn load(path: &Path) -> Result<StructureSet> {
        let obj = open_file(path).map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))?;
        let sop_instance_uid = obj
            .element(tags::SOP_INSTANCE_UID)?
            .to_str()?
            .trim()
            .to_string();

        let mut rois = roi_definitions(&obj)?;
        attach_contours(&obj, &mut rois)?;

        let mut rois: Vec<Roi> = rois.into_values().collect();
        rois.sort_by_key(|roi| roi.number);

        debug!(
            "structure set {} parsed: {} ROI(s)",
            sop_instance_uid,
            rois.len()
        );
        Ok(StructureSet {
            sop_instance_uid,
            rois,
        })
    }
}

/// Build the ROI table from `StructureSetROISequence`.
fn roi_definitions(obj: &DefaultDicomObject) -> Result<HashMap<i64, Roi>> {
    let mut rois = HashMap::new();
    let Some(sequence) = obj.element_opt(tags::STRUCTURE_SET_ROI_SEQUENCE)? else {
        return Ok(rois);
    };
    for item in sequence.items().unwrap_or_default() {
        let number = match item.element_opt(tags::ROI_NUMBER)? {
            Some(element) => element.to_int::<i64>()?,
            None => {
                warn!("structure set ROI item without ROINumber, skipping");
                continue;
            }
        };
        let name = item
            .element_opt(tags::ROI_NAME)?
            .map(|element| element.to_str())
            .transpose()?
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|| format!("ROI-{}", number));
        let frame_of_reference_uid = item
            .element_opt(tags::REFERENCED_FRAME_OF_REFERENCE_UID)?
            .map(|element| element.to_str())
            .transpose()?
            .map(|uid| uid.trim().to_string())
            .unwrap_or_default();
        rois.insert(
            number,
            Roi {
                number,
                name,
                frame_of_reference_uid,
                contours: Vec::new(),
            },
        );
    }
    Ok(rois)
}

/// Attach contour polygons from `ROIContourSequence` to their ROIs.
fn attach_contours(obj: &DefaultDicomObject, rois: &mut HashMap<i64, Roi>) -> Result<()> {
    let Some(sequence) = obj.element_opt(tags::ROI_CONTOUR_SEQUENCE)? else {
        return Ok(());
    };
    for item in sequence.items().unwrap_or_default() {
        let Some(number) = item
            .element_opt(tags::REFERENCED_ROI_NUMBER)?
            .map(|element| element.to_int::<i64>())
            .transpose()?
        else {
            warn!("ROI contour item without ReferencedROINumber, skipping");
            continue;
        };
        let Some(roi) = rois.get_mut(&number) else {
            warn!("contours reference undefined ROI {}, skipping", number);
            continue;
        };
        let Some(contour_items) = item
            .element_opt(tags::CONTOUR_SEQUENCE)?
            .and_then(|element| element.items())
        else {
            continue;
        };
        for contour_item in contour_items {
            if let Some(contour) = parse_contour(contour_item)? {
                roi.contours.push(contour);
            }
        }
    }
    Ok(())
}

fn parse_contour(item: &InMemDicomObject) -> Result<Option<Contour>> {
    let geometric_type = item
        .element_opt(tags::CONTOUR_GEOMETRIC_TYPE)?
        .map(|element| element.to_str())
        .transpose()?
        .map(|value| value.trim().to_uppercase())
        .unwrap_or_else(|| "CLOSED_PLANAR".to_string());
    if geometric_type != "CLOSED_PLANAR" {
        debug!("skipping {} contour", geometric_type);
        return Ok(None);
    }

    let Some(data) = item.element_opt(tags::CONTOUR_DATA)? else {
        return Ok(None);
    };
    let values = data.to_multi_float64()?;
    if values.len() < 9 || values.len() % 3 != 0 {
        warn!(
            "contour data with {} values is not a closed polygon, skipping",
            values.len()
        );
        return Ok(None);
    }

    let points = values
        .chunks_exact(3)
        .map(|p| [p[0], p[1], p[2]])
        .collect();
    Ok(Some(Contour { points }))
}
