//! Disclaimer burn-in
//!
//! Rasterises the configured disclaimer string into the pixel data of a
//! derived instance, bottom-centre, white text on a dark band. Uses an
//! embedded 5x7 glyph table; only native (unencapsulated) 8- and 16-bit
//! grayscale pixel data is touched.

use crate::Result;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

const GLYPH_WIDTH: usize = 5;
const GLYPH_HEIGHT: usize = 7;
/// Horizontal advance per character (glyph plus one blank column).
const ADVANCE: usize = GLYPH_WIDTH + 1;
/// Blank pixels around the text band.
const PADDING: usize = 2;
/// Distance of the band's bottom edge from the image bottom.
const BOTTOM_MARGIN: usize = 8;

/// Burn the text into the object's pixel data. Returns false (and leaves
/// the object untouched) when the pixel data is not native grayscale.
pub fn apply(obj: &mut InMemDicomObject, text: &str) -> Result<bool> {
    let Some(mut pixels) = native_pixels(obj)? else {
        return Ok(false);
    };

    let rows = pixels.rows;
    let cols = pixels.cols;
    let text_width = text.chars().count() * ADVANCE;
    if text_width + 2 * PADDING >= cols || GLYPH_HEIGHT + BOTTOM_MARGIN + 2 * PADDING >= rows {
        // Image too small for the band; better no disclaimer than a
        // corrupted one.
        return Ok(false);
    }

    let x0 = (cols - text_width) / 2;
    let y0 = rows - BOTTOM_MARGIN - GLYPH_HEIGHT;
    let (low, high) = pixels.value_range();

    // Background band first, then glyphs.
    for row in y0.saturating_sub(PADDING)..(y0 + GLYPH_HEIGHT + PADDING).min(rows) {
        for col in x0.saturating_sub(PADDING)..(x0 + text_width + PADDING).min(cols) {
            pixels.set(row, col, low);
        }
    }
    for (index, ch) in text.chars().enumerate() {
        let glyph = glyph(ch);
        let gx = x0 + index * ADVANCE;
        for (gr, bits) in glyph.iter().enumerate() {
            for gc in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - gc)) != 0 {
                    pixels.set(y0 + gr, gx + gc, high);
                }
            }
        }
    }

    pixels.store(obj);
    Ok(true)
}

/// Window the object's native pixel data to 8-bit grey, row-major.
/// `None` when the pixel data is not native grayscale.
pub fn normalised_grey(obj: &InMemDicomObject) -> Result<Option<Vec<u8>>> {
    let Some(pixels) = native_pixels(obj)? else {
        return Ok(None);
    };
    let (low, high) = pixels.value_range();
    let span = (high - low).max(1) as f64;
    let grey = (0..pixels.rows * pixels.cols)
        .map(|index| {
            let value = pixels.value_at(index);
            (((value - low) as f64 / span) * 255.0) as u8
        })
        .collect();
    Ok(Some(grey))
}

/// Native pixel buffer view: raw little-endian bytes plus enough of the
/// pixel module to index it.
struct NativePixels {
    rows: usize,
    cols: usize,
    bytes_per_pixel: usize,
    data: Vec<u8>,
}

impl NativePixels {
    fn value_at(&self, index: usize) -> u32 {
        let offset = index * self.bytes_per_pixel;
        match self.bytes_per_pixel {
            1 => self.data[offset] as u32,
            _ => u16::from_le_bytes([self.data[offset], self.data[offset + 1]]) as u32,
        }
    }

    fn set(&mut self, row: usize, col: usize, value: u32) {
        let offset = (row * self.cols + col) * self.bytes_per_pixel;
        match self.bytes_per_pixel {
            1 => self.data[offset] = value as u8,
            _ => self.data[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        }
    }

    /// Observed raw value range, as stored bit patterns.
    fn value_range(&self) -> (u32, u32) {
        let mut low = u32::MAX;
        let mut high = 0u32;
        for index in 0..self.rows * self.cols {
            let value = self.value_at(index);
            low = low.min(value);
            high = high.max(value);
        }
        if low > high {
            (0, 0)
        } else {
            (low, high)
        }
    }

    fn store(self, obj: &mut InMemDicomObject) {
        let vr = if self.bytes_per_pixel == 1 { VR::OB } else { VR::OW };
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            vr,
            PrimitiveValue::from(self.data),
        ));
    }
}

fn native_pixels(obj: &InMemDicomObject) -> Result<Option<NativePixels>> {
    let rows = obj.element(tags::ROWS)?.to_int::<u16>()? as usize;
    let cols = obj.element(tags::COLUMNS)?.to_int::<u16>()? as usize;
    let bits_allocated = obj.element(tags::BITS_ALLOCATED)?.to_int::<u16>()?;
    let samples = obj
        .element_opt(tags::SAMPLES_PER_PIXEL)?
        .map(|e| e.to_int::<u16>())
        .transpose()?
        .unwrap_or(1);
    if samples != 1 || (bits_allocated != 8 && bits_allocated != 16) {
        return Ok(None);
    }
    let bytes_per_pixel = (bits_allocated / 8) as usize;

    let Some(element) = obj.element_opt(tags::PIXEL_DATA)? else {
        return Ok(None);
    };
    let data = match element.to_bytes() {
        Ok(bytes) => bytes.into_owned(),
        // Encapsulated pixel data (compressed transfer syntax).
        Err(_) => return Ok(None),
    };
    if data.len() < rows * cols * bytes_per_pixel {
        return Ok(None);
    }
    Ok(Some(NativePixels {
        rows,
        cols,
        bytes_per_pixel,
        data,
    }))
}

/// 5x7 glyph rows, most significant of the low five bits is the leftmost
/// column. Unknown characters render as blanks.
fn glyph(c: char) -> [u8; GLYPH_HEIGHT] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x13, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        _ => [0x00; GLYPH_HEIGHT],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::Tag;

    fn grayscale_object(rows: u16, cols: u16, fill: u16) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::ROWS,
            VR::US,
            PrimitiveValue::from(rows),
        ));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            PrimitiveValue::from(cols),
        ));
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(16_u16),
        ));
        let mut data = Vec::with_capacity(rows as usize * cols as usize * 2);
        for _ in 0..rows as usize * cols as usize {
            data.extend_from_slice(&fill.to_le_bytes());
        }
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(data),
        ));
        obj
    }

    #[test]
    fn burn_in_changes_pixels_in_the_bottom_band_only() {
        let mut obj = grayscale_object(64, 128, 700);
        // Give the window a real range: darkest value in the top-left pixel.
        let mut data = vec![0u8, 0u8];
        for _ in 1..64 * 128 {
            data.extend_from_slice(&700_u16.to_le_bytes());
        }
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(data),
        ));

        let applied = apply(&mut obj, "TEST").unwrap();
        assert!(applied);

        let pixels = native_pixels(&obj).unwrap().unwrap();
        // Rows above the band untouched (pixel 0 is the seeded dark value).
        assert_eq!(pixels.value_at(0), 0);
        for index in 1..64 * 32 {
            assert_eq!(pixels.value_at(index), 700);
        }
        // The band contains both background (low) and glyph (high) pixels.
        let band_top = 64 - BOTTOM_MARGIN - GLYPH_HEIGHT - PADDING;
        let band = (band_top * 128..64 * 128)
            .map(|index| pixels.value_at(index))
            .collect::<Vec<_>>();
        assert!(band.contains(&0));
        assert!(band.contains(&700));
        // Nothing outside the band changed.
        for index in 64 * 32..band_top * 128 {
            assert_eq!(pixels.value_at(index), 700);
        }
    }

    #[test]
    fn burn_in_declines_tiny_images() {
        let mut obj = grayscale_object(16, 16, 100);
        let applied = apply(&mut obj, "RESEARCH IMAGE").unwrap();
        assert!(!applied);
        let pixels = native_pixels(&obj).unwrap().unwrap();
        assert!((0..16 * 16).all(|index| pixels.value_at(index) == 100));
    }

    #[test]
    fn burn_in_declines_multi_sample_pixels() {
        let mut obj = grayscale_object(64, 128, 0);
        obj.put(DataElement::new(
            tags::SAMPLES_PER_PIXEL,
            VR::US,
            PrimitiveValue::from(3_u16),
        ));
        assert!(!apply(&mut obj, "TEST").unwrap());
    }

    #[test]
    fn normalised_grey_spans_full_range() {
        let mut obj = grayscale_object(2, 2, 0);
        // Pixels 0, 100, 200, 300.
        let mut data = Vec::new();
        for value in [0_u16, 100, 200, 300] {
            data.extend_from_slice(&value.to_le_bytes());
        }
        obj.put(DataElement::new(
            Tag(0x7FE0, 0x0010),
            VR::OW,
            PrimitiveValue::from(data),
        ));
        let grey = normalised_grey(&obj).unwrap().unwrap();
        assert_eq!(grey[0], 0);
        assert_eq!(grey[3], 255);
        assert!(grey[1] < grey[2]);
    }
}
