//! Study processing pipeline
//!
//! Loads the image series and structure set out of the spool, filters and
//! merges the regions of interest into a binary mask volume, and emits the
//! derived overlay series (plus the optional debug capture series).

pub mod burn_in;
pub mod geometry;
pub mod mask;
pub mod raster;
pub mod series;
pub mod structure_set;

use crate::config::ProcessingConfig;
use crate::spool::{Slot, Spool, StudyKey};
use crate::{Error, Result};
use geometry::ImageSeries;
use mask::MaskVolume;
use structure_set::{Roi, StructureSet};
use tracing::{debug, info, warn};

/// What one pipeline run produced.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Names of the ROIs that contributed to the mask.
    pub roi_names: Vec<String>,
    pub derived_instances: usize,
    pub debug_instances: usize,
}

/// Run the full pipeline for one study already validated by the
/// orchestrator.
pub fn run(
    spool: &Spool,
    study: &StudyKey,
    processing: &ProcessingConfig,
    debug_visualisation: bool,
) -> Result<PipelineOutput> {
    let image_files = spool.slot_files(study, Slot::Dcm)?;
    let series = ImageSeries::load(&image_files)?;
    check_uniform_grid(&series)?;

    let structure_files = spool.slot_files(study, Slot::Structure)?;
    let structure_path = match structure_files.as_slice() {
        [] => {
            return Err(Error::IncompleteStudy(
                "no structure set instance".to_string(),
            ))
        }
        [single] => single.clone(),
        [first, rest @ ..] => {
            warn!(
                "study {} has {} structure set files, using {}",
                study,
                rest.len() + 1,
                first.display()
            );
            first.clone()
        }
    };
    let structure_set = StructureSet::load(&structure_path)?;

    let rois = select_rois(&series, &structure_set, processing)?;
    let roi_names: Vec<String> = rois.iter().map(|roi| roi.name.clone()).collect();
    info!("study {} rasterising ROIs {:?}", study, roi_names);

    let mask = rasterise(&series, &rois);
    debug!(
        "study {} mask: {} voxels across {} slices",
        study,
        mask.voxel_count(),
        mask.slices()
    );

    // Leftovers from an interrupted earlier run must not join the batch.
    spool.clear_slot(study, Slot::Addition)?;
    spool.clear_slot(study, Slot::DebugDicom)?;

    let addition = series::synthesise_overlay_series(
        &series,
        &mask,
        processing,
        &spool.path_for(study, Slot::Addition),
    )?;

    let debug_instances = if debug_visualisation {
        series::synthesise_debug_series(
            &series,
            &mask,
            processing,
            &spool.path_for(study, Slot::DebugDicom),
        )?
        .instance_count
    } else {
        0
    };

    Ok(PipelineOutput {
        roi_names,
        derived_instances: addition.instance_count,
        debug_instances,
    })
}

/// Apply the frame-of-reference invariant and the ignore-name filter.
fn select_rois(
    series: &ImageSeries,
    structure_set: &StructureSet,
    processing: &ProcessingConfig,
) -> Result<Vec<Roi>> {
    let mut matching = Vec::new();
    let mut mismatched_frame: Option<String> = None;
    for roi in &structure_set.rois {
        // An absent per-ROI frame of reference is tolerated; a differing
        // one rejects the ROI.
        if !roi.frame_of_reference_uid.is_empty()
            && roi.frame_of_reference_uid != series.frame_of_reference_uid
        {
            warn!(
                "ROI {:?} is in frame of reference {}, series has {}; rejected",
                roi.name, roi.frame_of_reference_uid, series.frame_of_reference_uid
            );
            mismatched_frame = Some(roi.frame_of_reference_uid.clone());
            continue;
        }
        matching.push(roi.clone());
    }

    if matching.is_empty() {
        if let Some(frame) = mismatched_frame {
            return Err(Error::CoordinateMismatch {
                series: series.frame_of_reference_uid.clone(),
                structure_set: frame,
            });
        }
        return Err(Error::RoiEmpty { ignored: vec![] });
    }

    let ignore: Vec<String> = processing
        .ignore_contour_names_containing
        .iter()
        .map(|keyword| keyword.to_lowercase())
        .collect();

    let mut kept = Vec::new();
    let mut ignored = Vec::new();
    for roi in matching {
        let name = roi.name.to_lowercase();
        if ignore.iter().any(|keyword| name.contains(keyword)) {
            debug!("ROI {:?} matches the ignore list, dropped", roi.name);
            ignored.push(roi.name.clone());
        } else {
            kept.push(roi);
        }
    }

    if kept.is_empty() {
        return Err(Error::RoiEmpty { ignored });
    }
    if kept.len() > 1 {
        warn!(
            "multiple non-ignored ROIs {:?}; masks will be merged",
            kept.iter().map(|roi| &roi.name).collect::<Vec<_>>()
        );
    }
    Ok(kept)
}

/// Rasterise every contour of every surviving ROI into one volume. The
/// merge is a voxelwise OR, so ROI order cannot matter.
fn rasterise(series: &ImageSeries, rois: &[Roi]) -> MaskVolume {
    let rows = series.slices[0].geometry.rows;
    let cols = series.slices[0].geometry.cols;
    let mut mask = MaskVolume::new(rows, cols, series.slices.len());
    let tolerance = series.slice_spacing() / 2.0;

    for roi in rois {
        let mut dropped = 0usize;
        for contour in &roi.contours {
            let Some(slice_index) = series.slice_index_for(contour.points[0], tolerance) else {
                dropped += 1;
                continue;
            };
            let geometry = &series.slices[slice_index].geometry;
            let polygon: Vec<(f64, f64)> = contour
                .points
                .iter()
                .map(|point| geometry.patient_to_pixel(*point))
                .collect();
            raster::fill_polygon_even_odd(mask.plane_mut(slice_index), rows, cols, &polygon);
        }
        if dropped > 0 {
            warn!(
                "ROI {:?}: {} contour(s) matched no slice within {:.3}mm and were dropped",
                roi.name, dropped, tolerance
            );
        }
    }
    mask
}

fn check_uniform_grid(series: &ImageSeries) -> Result<()> {
    let rows = series.slices[0].geometry.rows;
    let cols = series.slices[0].geometry.cols;
    for slice in &series.slices {
        if slice.geometry.rows != rows || slice.geometry.cols != cols {
            return Err(Error::Codec(format!(
                "inconsistent pixel grid: {}x{} vs {}x{} in {}",
                rows,
                cols,
                slice.geometry.rows,
                slice.geometry.cols,
                slice.path.display()
            )));
        }
    }
    Ok(())
}
