use crate::error::PipelineError;
use crate::pipeline::crop::decode_oriented;
use crate::pipeline::types::Region;
use image::GrayImage;
use imageproc::contrast::otsu_level;

/// Finds text-line regions in an encoded image.
///
/// `confidence_threshold` is a percentage in 0..100; higher values keep
/// fewer, stronger detections.
pub trait LineDetector: Send + Sync {
    fn detect(
        &self,
        image_name: &str,
        image_bytes: &[u8],
        confidence_threshold: f64,
    ) -> Result<Vec<Region>, PipelineError>;
}

/// Horizontal projection-profile segmenter.
///
/// Rows whose dark-pixel count reaches a share of the busiest row are grouped
/// into bands, and each band becomes one rectangular line region spanning the
/// ink found in it.
#[derive(Debug, Clone)]
pub struct ProjectionLineDetector {
    pub min_line_height: u32,
    pub padding: u32,
    /// Upper bound for the binarization level picked by Otsu.
    pub max_ink_level: u8,
}

impl Default for ProjectionLineDetector {
    fn default() -> Self {
        Self {
            min_line_height: 3,
            padding: 2,
            max_ink_level: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Band {
    top: u32,
    bottom: u32,
}

impl ProjectionLineDetector {
    fn row_profile(&self, gray: &GrayImage, level: u8) -> Vec<u32> {
        gray.rows()
            .map(|row| row.filter(|p| p[0] <= level).count() as u32)
            .collect()
    }

    fn bands(&self, profile: &[u32], confidence_threshold: f64) -> Vec<Band> {
        let peak = profile.iter().copied().max().unwrap_or(0);
        if peak == 0 {
            return Vec::new();
        }
        let share = confidence_threshold.clamp(0.0, 100.0) / 100.0 * 0.5;
        let cutoff = (peak as f64 * share).max(1.0);

        let mut bands = Vec::new();
        let mut start: Option<u32> = None;
        for (y, &ink) in profile.iter().enumerate() {
            let y = y as u32;
            match (ink as f64 >= cutoff, start) {
                (true, None) => start = Some(y),
                (false, Some(top)) => {
                    bands.push(Band { top, bottom: y - 1 });
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(top) = start {
            bands.push(Band {
                top,
                bottom: profile.len() as u32 - 1,
            });
        }

        bands
            .into_iter()
            .filter(|b| b.bottom - b.top + 1 >= self.min_line_height)
            .collect()
    }

    fn band_region(&self, gray: &GrayImage, level: u8, band: Band) -> Option<Region> {
        let (width, height) = gray.dimensions();
        let mut left = u32::MAX;
        let mut right = 0;
        for y in band.top..=band.bottom {
            for x in 0..width {
                if gray.get_pixel(x, y)[0] <= level {
                    left = left.min(x);
                    right = right.max(x);
                }
            }
        }
        if left > right {
            return None;
        }

        let x0 = left.saturating_sub(self.padding);
        let y0 = band.top.saturating_sub(self.padding);
        let x1 = (right + self.padding).min(width - 1);
        let y1 = (band.bottom + self.padding).min(height - 1);
        Some(Region::rect(
            x0 as i32,
            y0 as i32,
            (x1 - x0 + 1) as i32,
            (y1 - y0 + 1) as i32,
        ))
    }

    pub fn detect_gray(&self, gray: &GrayImage, confidence_threshold: f64) -> Vec<Region> {
        if gray.width() == 0 || gray.height() == 0 {
            return Vec::new();
        }
        let level = otsu_level(gray).min(self.max_ink_level);
        let profile = self.row_profile(gray, level);

        self.bands(&profile, confidence_threshold)
            .into_iter()
            .filter_map(|band| self.band_region(gray, level, band))
            .collect()
    }
}

impl LineDetector for ProjectionLineDetector {
    fn detect(
        &self,
        image_name: &str,
        image_bytes: &[u8],
        confidence_threshold: f64,
    ) -> Result<Vec<Region>, PipelineError> {
        if !confidence_threshold.is_finite() {
            return Err(PipelineError::detection(
                image_name,
                format!("confidence threshold {confidence_threshold} is not a number"),
            ));
        }
        let gray = decode_oriented(image_name, image_bytes)?.to_luma8();
        let regions = self.detect_gray(&gray, confidence_threshold);
        tracing::debug!("Detected {} lines in {}", regions.len(), image_name);
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn page_with_lines(lines: &[(u32, u32, u32, u32)]) -> GrayImage {
        let mut img = GrayImage::from_pixel(100, 80, Luma([255]));
        for &(x0, y0, x1, y1) in lines {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    #[test]
    fn test_detects_one_region_per_text_line() {
        let img = page_with_lines(&[(10, 10, 89, 19), (5, 40, 60, 49)]);
        let regions = ProjectionLineDetector::default().detect_gray(&img, 50.0);

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0], Region::rect(8, 8, 84, 14));
        assert_eq!(regions[1], Region::rect(3, 38, 60, 14));
    }

    #[test]
    fn test_blank_page_has_no_lines() {
        let img = GrayImage::from_pixel(50, 50, Luma([255]));
        assert!(ProjectionLineDetector::default()
            .detect_gray(&img, 50.0)
            .is_empty());
    }

    #[test]
    fn test_thin_noise_is_ignored() {
        let img = page_with_lines(&[(10, 10, 89, 19), (0, 60, 99, 60)]);
        let regions = ProjectionLineDetector::default().detect_gray(&img, 50.0);
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn test_higher_confidence_drops_faint_lines() {
        // The second line holds a tenth of the ink of the first.
        let img = page_with_lines(&[(0, 10, 99, 19), (0, 40, 9, 49)]);
        let detector = ProjectionLineDetector::default();
        assert_eq!(detector.detect_gray(&img, 10.0).len(), 2);
        assert_eq!(detector.detect_gray(&img, 80.0).len(), 1);
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let err = ProjectionLineDetector::default().detect("x.png", b"garbage", 50.0);
        assert!(matches!(err, Err(PipelineError::Image { .. })));
    }

    #[test]
    fn test_non_finite_confidence_is_a_detection_error() {
        let err = ProjectionLineDetector::default().detect("x.png", b"garbage", f64::NAN);
        match err {
            Err(e @ PipelineError::Detection { .. }) => assert!(!e.is_fatal()),
            other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
        }
    }
}
