//! Image geometry: the typed view of a slice the pipeline works on
//!
//! Slices are ordered by projecting image-position-patient onto the slice
//! normal derived from image-orientation, tie-broken by instance number
//! and then SOP instance UID. Filename-based ordering is forbidden; file
//! names carry no geometric meaning.

use crate::{Error, Result};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Typed geometry of one image slice, read from its header.
#[derive(Debug, Clone)]
pub struct SliceGeometry {
    /// Image position patient: origin of the first transmitted pixel, mm.
    pub position: [f64; 3],
    /// Direction cosines along increasing column index.
    pub row_cosines: [f64; 3],
    /// Direction cosines along increasing row index.
    pub col_cosines: [f64; 3],
    /// Physical distance between rows, mm.
    pub spacing_between_rows: f64,
    /// Physical distance between columns, mm.
    pub spacing_between_cols: f64,
    pub rows: usize,
    pub cols: usize,
}

impl SliceGeometry {
    /// Outward slice normal: row direction crossed with column direction.
    pub fn normal(&self) -> [f64; 3] {
        cross(self.row_cosines, self.col_cosines)
    }

    /// Signed distance of the slice origin along the normal. The slice
    /// ordering key.
    pub fn normal_offset(&self) -> f64 {
        dot(self.position, self.normal())
    }

    /// Map a patient-space point to fractional (row, column) pixel
    /// coordinates on this slice.
    pub fn patient_to_pixel(&self, point: [f64; 3]) -> (f64, f64) {
        let v = [
            point[0] - self.position[0],
            point[1] - self.position[1],
            point[2] - self.position[2],
        ];
        let col = dot(v, self.row_cosines) / self.spacing_between_cols;
        let row = dot(v, self.col_cosines) / self.spacing_between_rows;
        (row, col)
    }

    /// Distance of a patient-space point from the slice plane.
    pub fn plane_distance(&self, point: [f64; 3]) -> f64 {
        (dot(point, self.normal()) - self.normal_offset()).abs()
    }
}

/// One slice of the loaded image series: its file, header identifiers and
/// geometry.
#[derive(Debug, Clone)]
pub struct SliceInfo {
    pub path: PathBuf,
    pub sop_instance_uid: String,
    pub instance_number: i64,
    pub geometry: SliceGeometry,
}

/// The image series the pipeline operates on, slices in spatial order.
#[derive(Debug)]
pub struct ImageSeries {
    pub study_instance_uid: String,
    pub frame_of_reference_uid: String,
    pub modality: String,
    pub slices: Vec<SliceInfo>,
}

impl ImageSeries {
    /// Load headers (not pixel data) for every file and establish the
    /// spatial slice order.
    pub fn load(files: &[PathBuf]) -> Result<ImageSeries> {
        if files.is_empty() {
            return Err(Error::IncompleteStudy("no image instances".to_string()));
        }

        let mut slices = Vec::with_capacity(files.len());
        let mut study_uid: Option<String> = None;
        let mut for_uid: Option<String> = None;
        let mut modality: Option<String> = None;

        for path in files {
            let obj = open_header(path)?;
            let slice = slice_info(path, &obj)?;

            let study = require_str(&obj, tags::STUDY_INSTANCE_UID)?;
            let frame = require_str(&obj, tags::FRAME_OF_REFERENCE_UID)?;
            match &study_uid {
                None => study_uid = Some(study),
                Some(existing) if *existing != study => {
                    return Err(Error::Codec(format!(
                        "mixed studies in image directory: {} vs {}",
                        existing, study
                    )))
                }
                Some(_) => {}
            }
            match &for_uid {
                None => for_uid = Some(frame),
                Some(existing) if *existing != frame => {
                    return Err(Error::Codec(format!(
                        "mixed frames of reference in image series: {} vs {}",
                        existing, frame
                    )))
                }
                Some(_) => {}
            }
            if modality.is_none() {
                modality = Some(require_str(&obj, tags::MODALITY)?);
            }
            slices.push(slice);
        }

        // Spatial order along the normal; instance number and SOP UID only
        // break exact ties.
        slices.sort_by(|a, b| {
            a.geometry
                .normal_offset()
                .partial_cmp(&b.geometry.normal_offset())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.instance_number.cmp(&b.instance_number))
                .then_with(|| a.sop_instance_uid.cmp(&b.sop_instance_uid))
        });

        debug!(
            "image series loaded: {} slices spanning {:.2}mm",
            slices.len(),
            slices
                .last()
                .map(|s| s.geometry.normal_offset())
                .unwrap_or(0.0)
                - slices
                    .first()
                    .map(|s| s.geometry.normal_offset())
                    .unwrap_or(0.0)
        );

        Ok(ImageSeries {
            study_instance_uid: study_uid.unwrap_or_default(),
            frame_of_reference_uid: for_uid.unwrap_or_default(),
            modality: modality.unwrap_or_default(),
            slices,
        })
    }

    /// Median gap between adjacent slices along the normal. Contours bind
    /// to a slice within half of this.
    pub fn slice_spacing(&self) -> f64 {
        if self.slices.len() < 2 {
            return 1.0;
        }
        let mut gaps: Vec<f64> = self
            .slices
            .windows(2)
            .map(|pair| (pair[1].geometry.normal_offset() - pair[0].geometry.normal_offset()).abs())
            .collect();
        gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        gaps[gaps.len() / 2].max(f64::EPSILON)
    }

    /// Index of the slice whose plane contains the point, within the
    /// given tolerance. `None` when the point falls between or outside
    /// slices.
    pub fn slice_index_for(&self, point: [f64; 3], tolerance: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, slice) in self.slices.iter().enumerate() {
            let distance = slice.geometry.plane_distance(point);
            if distance <= tolerance && best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((index, distance));
            }
        }
        best.map(|(index, _)| index)
    }
}

fn open_header(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))
}

fn slice_info(path: &Path, obj: &DefaultDicomObject) -> Result<SliceInfo> {
    let position = require_f64s::<3>(obj, tags::IMAGE_POSITION_PATIENT)?;
    let orientation = require_f64s::<6>(obj, tags::IMAGE_ORIENTATION_PATIENT)?;
    let spacing = require_f64s::<2>(obj, tags::PIXEL_SPACING)?;
    let rows = obj.element(tags::ROWS)?.to_int::<u16>()? as usize;
    let cols = obj.element(tags::COLUMNS)?.to_int::<u16>()? as usize;
    let instance_number = obj
        .element_opt(tags::INSTANCE_NUMBER)?
        .map(|e| e.to_int::<i64>())
        .transpose()?
        .unwrap_or(0);
    let sop_instance_uid = require_str(obj, tags::SOP_INSTANCE_UID)?;

    Ok(SliceInfo {
        path: path.to_path_buf(),
        sop_instance_uid,
        instance_number,
        geometry: SliceGeometry {
            position,
            row_cosines: [orientation[0], orientation[1], orientation[2]],
            col_cosines: [orientation[3], orientation[4], orientation[5]],
            spacing_between_rows: spacing[0],
            spacing_between_cols: spacing[1],
            rows,
            cols,
        },
    })
}

fn require_str(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Result<String> {
    Ok(obj.element(tag)?.to_str()?.trim().to_string())
}

fn require_f64s<const N: usize>(
    obj: &DefaultDicomObject,
    tag: dicom::core::Tag,
) -> Result<[f64; N]> {
    let values = obj.element(tag)?.to_multi_float64()?;
    if values.len() < N {
        return Err(Error::Codec(format!(
            "tag {} has {} values, expected {}",
            tag,
            values.len(),
            N
        )));
    }
    let mut out = [0.0; N];
    out.copy_from_slice(&values[..N]);
    Ok(out)
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axial_slice(z: f64) -> SliceGeometry {
        SliceGeometry {
            position: [-100.0, -100.0, z],
            row_cosines: [1.0, 0.0, 0.0],
            col_cosines: [0.0, 1.0, 0.0],
            spacing_between_rows: 2.0,
            spacing_between_cols: 2.0,
            rows: 128,
            cols: 128,
        }
    }

    #[test]
    fn axial_normal_is_z() {
        let slice = axial_slice(30.0);
        assert_eq!(slice.normal(), [0.0, 0.0, 1.0]);
        assert!((slice.normal_offset() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn patient_to_pixel_round_trips_origin_and_spacing() {
        let slice = axial_slice(0.0);
        let (row, col) = slice.patient_to_pixel([-100.0, -100.0, 0.0]);
        assert!(row.abs() < 1e-9 && col.abs() < 1e-9);

        // One column step is spacing_between_cols mm along the row cosine.
        let (row, col) = slice.patient_to_pixel([-96.0, -100.0, 0.0]);
        assert!((col - 2.0).abs() < 1e-9);
        assert!(row.abs() < 1e-9);

        let (row, col) = slice.patient_to_pixel([-100.0, -90.0, 0.0]);
        assert!((row - 5.0).abs() < 1e-9);
        assert!(col.abs() < 1e-9);
    }

    #[test]
    fn plane_distance_measures_along_normal() {
        let slice = axial_slice(10.0);
        assert!((slice.plane_distance([0.0, 0.0, 12.5]) - 2.5).abs() < 1e-9);
        assert!(slice.plane_distance([55.0, -70.0, 10.0]) < 1e-9);
    }
}
