use crate::pipeline::types::{CropParams, Point, Region};
use geo::BoundingRect;
use geo_types::{LineString, Polygon};

/// Convert region points to a geo_types Polygon
pub fn to_geo_polygon(points: &[Point]) -> Polygon<f64> {
    Polygon::new(to_line_string(points), vec![])
}

fn to_line_string(points: &[Point]) -> LineString<f64> {
    let coords: Vec<(f64, f64)> = points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    LineString::from(coords)
}

/// Axis-aligned bounds in pixel space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn area(&self) -> f64 {
        self.w * self.h
    }

    /// Overlapping area of two boxes, 0 when they only touch or are apart.
    pub fn intersection_area(&self, other: &BBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        (x2 - x1) * (y2 - y1)
    }
}

pub fn bounding_box(points: &[Point]) -> Option<BBox> {
    let rect = to_line_string(points).bounding_rect()?;
    Some(BBox {
        x: rect.min().x,
        y: rect.min().y,
        w: rect.width(),
        h: rect.height(),
    })
}

/// Mean of the polygon's vertices
pub fn centroid(points: &[Point]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| {
        (sx + p.x as f64, sy + p.y as f64)
    });
    Some((sx / n, sy / n))
}

/// Rotates (x, y) about `center` by `angle_deg`.
///
/// Image space is y-down, and a positive angle turns the point visually
/// counter-clockwise. Image rotation in [`crate::pipeline::crop`] uses the
/// same convention, so a crop by `angle` moves pixels by `-angle` here.
pub fn rotate_point(p: (f64, f64), center: (f64, f64), angle_deg: f64) -> (f64, f64) {
    let rad = angle_deg.to_radians();
    let (s, c) = rad.sin_cos();
    let dx = p.0 - center.0;
    let dy = p.1 - center.1;

    (center.0 + dx * c + dy * s, center.1 - dx * s + dy * c)
}

/// Moves regions from the space of `old_crop` into the space of `new_crop`.
///
/// Each point is first taken back to the original, unrotated image (undoing
/// the old crop's shift and rotation) and then pushed through the new crop.
/// A missing `old_crop` means the regions already live in original space.
pub fn remap_regions(
    regions: &[Region],
    old_crop: Option<&CropParams>,
    new_crop: &CropParams,
) -> Vec<Region> {
    let identity = CropParams {
        x: 0,
        y: 0,
        w: 0,
        h: 0,
        angle: 0.0,
    };
    let old = old_crop.unwrap_or(&identity);
    let old_center = old.center();
    let new_center = new_crop.center();

    regions
        .iter()
        .map(|region| {
            let points = region
                .points
                .iter()
                .map(|p| {
                    let shifted = (p.x as f64 + old.x as f64, p.y as f64 + old.y as f64);
                    let original = rotate_point(shifted, old_center, old.angle);

                    let rotated = rotate_point(original, new_center, -new_crop.angle);
                    Point {
                        x: (rotated.0 - new_crop.x as f64).round() as i32,
                        y: (rotated.1 - new_crop.y as f64).round() as i32,
                    }
                })
                .collect();
            Region { points }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(x: i32, y: i32, w: i32, h: i32, angle: f64) -> CropParams {
        CropParams { x, y, w, h, angle }
    }

    fn assert_close(a: &[Region], b: &[Region], tolerance: i32) {
        assert_eq!(a.len(), b.len());
        for (ra, rb) in a.iter().zip(b) {
            assert_eq!(ra.points.len(), rb.points.len());
            for (pa, pb) in ra.points.iter().zip(&rb.points) {
                assert!(
                    (pa.x - pb.x).abs() <= tolerance && (pa.y - pb.y).abs() <= tolerance,
                    "{:?} vs {:?}",
                    pa,
                    pb
                );
            }
        }
    }

    #[test]
    fn test_rotate_point_quarter_turn_is_counter_clockwise_on_screen() {
        // (1, 0) to the right of the center ends up above it (smaller y)
        let (x, y) = rotate_point((1.0, 0.0), (0.0, 0.0), 90.0);
        assert!((x - 0.0).abs() < 1e-9);
        assert!((y + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotate_point_round_trip() {
        let centers = [(0.0, 0.0), (50.0, 25.0), (-10.0, 300.5)];
        let angles = [0.0, 3.5, -17.0, 90.0, 181.0];
        for &c in &centers {
            for &a in &angles {
                for &p in &[(12.0, 7.0), (-3.0, 99.0), (250.0, 250.0)] {
                    let there = rotate_point(p, c, a);
                    let back = rotate_point(there, c, -a);
                    assert!((back.0 - p.0).abs() <= 0.5 && (back.1 - p.1).abs() <= 0.5);
                }
            }
        }
    }

    #[test]
    fn test_remap_without_previous_crop_subtracts_origin() {
        let regions = vec![Region::new(vec![
            Point::new(20, 20),
            Point::new(70, 20),
            Point::new(70, 70),
            Point::new(20, 70),
        ])];
        let remapped = remap_regions(&regions, None, &crop(10, 10, 60, 60, 0.0));
        assert_eq!(
            remapped[0].points,
            vec![
                Point::new(10, 10),
                Point::new(60, 10),
                Point::new(60, 60),
                Point::new(10, 60),
            ]
        );
    }

    #[test]
    fn test_remap_same_crop_is_identity() {
        let regions = vec![
            Region::rect(5, 5, 30, 12),
            Region::new(vec![Point::new(0, 0), Point::new(40, 3), Point::new(17, 29)]),
        ];
        for c in [crop(10, 20, 200, 100, 0.0), crop(33, 7, 120, 80, 7.5)] {
            let remapped = remap_regions(&regions, Some(&c), &c);
            assert_close(&remapped, &regions, 0);
        }
    }

    #[test]
    fn test_remap_composition() {
        let regions = vec![Region::rect(40, 40, 80, 20)];
        let a = crop(10, 10, 300, 200, 4.0);
        let b = crop(30, 5, 250, 220, -6.0);
        let c = crop(0, 25, 280, 180, 11.0);

        let a_to_b = remap_regions(&regions, Some(&a), &b);
        let b_to_c = remap_regions(&a_to_b, Some(&b), &c);
        let a_to_c = remap_regions(&regions, Some(&a), &c);

        assert_close(&b_to_c, &a_to_c, 1);
    }

    #[test]
    fn test_remap_rotation_moves_points_with_the_image() {
        // A clockwise crop rotation of 90 degrees about (50, 50) sends the
        // point right of the center to below it.
        let regions = vec![Region::new(vec![Point::new(80, 50)])];
        let remapped = remap_regions(&regions, None, &crop(0, 0, 100, 100, 90.0));
        assert_eq!(remapped[0].points[0], Point::new(50, 80));
    }

    #[test]
    fn test_remap_empty() {
        assert!(remap_regions(&[], None, &crop(0, 0, 10, 10, 5.0)).is_empty());
    }

    #[test]
    fn test_bounding_box_and_centroid() {
        let pts = [Point::new(2, 3), Point::new(10, 3), Point::new(6, 11)];
        let bb = bounding_box(&pts).unwrap();
        assert_eq!(bb, BBox { x: 2.0, y: 3.0, w: 8.0, h: 8.0 });
        assert_eq!(centroid(&pts), Some((6.0, 17.0 / 3.0)));
        assert!(bounding_box(&[]).is_none());
    }

    #[test]
    fn test_intersection_area() {
        let a = BBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        let b = BBox { x: 5.0, y: 5.0, w: 10.0, h: 10.0 };
        let c = BBox { x: 10.0, y: 0.0, w: 5.0, h: 5.0 };
        assert_eq!(a.intersection_area(&b), 25.0);
        assert_eq!(a.intersection_area(&c), 0.0);
    }
}
