// Overlap merging for detected line regions
//
// Overlap is measured on axis-aligned bounding boxes and the union of two
// regions is their convex hull. Both are deliberate approximations: merged
// outlines are convex over-approximations of the inputs, and results depend
// on input order when more than two regions chain-overlap.

use crate::pipeline::geometry::{bounding_box, centroid, to_geo_polygon};
use crate::pipeline::types::{Point, Region};
use geo::Area;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Shoelace area. Fewer than three points have no area.
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    to_geo_polygon(points).unsigned_area()
}

/// Jaccard overlap of the two regions' bounding boxes, in percent.
pub fn overlap_ratio(a: &Region, b: &Region) -> f64 {
    let (Some(box_a), Some(box_b)) = (bounding_box(&a.points), bounding_box(&b.points)) else {
        return 0.0;
    };

    let intersection = box_a.intersection_area(&box_b);
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = box_a.area() + box_b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    (intersection / union * 100.0).clamp(0.0, 100.0)
}

/// Centroids closer than three times the mean bounding-box size.
pub fn spatially_close(a: &Region, b: &Region) -> bool {
    let (Some(ca), Some(cb)) = (centroid(&a.points), centroid(&b.points)) else {
        return false;
    };
    let (Some(box_a), Some(box_b)) = (bounding_box(&a.points), bounding_box(&b.points)) else {
        return false;
    };

    let size_a = box_a.area().sqrt();
    let size_b = box_b.area().sqrt();
    let distance = (ca.0 - cb.0).hypot(ca.1 - cb.1);

    distance < 3.0 * (size_a + size_b) / 2.0
}

fn cross(o: Point, a: Point, b: Point) -> i64 {
    (a.x as i64 - o.x as i64) * (b.y as i64 - o.y as i64)
        - (a.y as i64 - o.y as i64) * (b.x as i64 - o.x as i64)
}

fn dist_sq(a: Point, b: Point) -> i64 {
    let dx = a.x as i64 - b.x as i64;
    let dy = a.y as i64 - b.y as i64;
    dx * dx + dy * dy
}

/// Graham scan. The pivot is the lowest-y point (lowest x on ties), the rest
/// are ordered by polar angle around it with nearer points first.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut pts = points.to_vec();
    let pivot_idx = pts
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| (p.y, p.x))
        .map(|(i, _)| i)
        .unwrap_or(0);
    pts.swap(0, pivot_idx);
    let pivot = pts[0];

    pts[1..].sort_by(|a, b| match cross(pivot, *a, *b).cmp(&0) {
        Ordering::Greater => Ordering::Less,
        Ordering::Less => Ordering::Greater,
        Ordering::Equal => dist_sq(pivot, *a).cmp(&dist_sq(pivot, *b)),
    });

    let mut hull: Vec<Point> = Vec::with_capacity(pts.len());
    for p in pts {
        while hull.len() > 1 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull
}

/// Convex hull of both regions' points.
pub fn merge(a: &Region, b: &Region) -> Region {
    let mut all = Vec::with_capacity(a.points.len() + b.points.len());
    all.extend_from_slice(&a.points);
    all.extend_from_slice(&b.points);
    Region::new(convex_hull(&all))
}

/// Folds every region that overlaps a seed region (and sits near it) into
/// that seed, seeds being taken front to back.
pub fn merge_overlapping(regions: Vec<Region>, overlap_threshold_percent: f64) -> Vec<Region> {
    let mut pending: VecDeque<Region> = regions.into();
    let mut merged = Vec::with_capacity(pending.len());

    while let Some(seed) = pending.pop_front() {
        let (partners, rest): (Vec<Region>, Vec<Region>) =
            pending.into_iter().partition(|candidate| {
                overlap_ratio(&seed, candidate) >= overlap_threshold_percent
                    && spatially_close(&seed, candidate)
            });
        pending = rest.into();

        if !partners.is_empty() {
            tracing::debug!("Merging {} regions into one", partners.len() + 1);
        }
        let combined = partners.iter().fold(seed, |acc, other| merge(&acc, other));
        merged.push(combined);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_area() {
        assert_eq!(polygon_area(&Region::rect(0, 0, 10, 4).points), 40.0);
        let tri = [Point::new(0, 0), Point::new(4, 0), Point::new(0, 3)];
        assert_eq!(polygon_area(&tri), 6.0);
        assert_eq!(polygon_area(&tri[..2]), 0.0);
    }

    #[test]
    fn test_polygon_area_is_orientation_independent() {
        let mut pts = Region::rect(1, 1, 5, 5).points;
        pts.reverse();
        assert_eq!(polygon_area(&pts), 25.0);
    }

    #[test]
    fn test_overlap_ratio_values() {
        let a = Region::rect(0, 0, 10, 10);
        let b = Region::rect(5, 0, 10, 10);
        // intersection 50, union 150
        let r = overlap_ratio(&a, &b);
        assert!((r - 100.0 / 3.0).abs() < 1e-9);

        assert_eq!(overlap_ratio(&a, &a), 100.0);
        assert_eq!(overlap_ratio(&a, &Region::rect(20, 20, 5, 5)), 0.0);
        assert_eq!(overlap_ratio(&a, &Region::default()), 0.0);
    }

    #[test]
    fn test_overlap_ratio_bounds() {
        let shapes = [
            Region::rect(0, 0, 10, 10),
            Region::rect(3, 2, 40, 1),
            Region::new(vec![Point::new(0, 0), Point::new(9, 9), Point::new(0, 9)]),
            Region::new(vec![Point::new(5, 5), Point::new(5, 5), Point::new(5, 5)]),
            Region::rect(-20, -20, 25, 25),
        ];
        for a in &shapes {
            for b in &shapes {
                let r = overlap_ratio(a, b);
                assert!((0.0..=100.0).contains(&r), "{r}");
            }
        }
    }

    #[test]
    fn test_spatially_close() {
        let a = Region::rect(0, 0, 10, 10);
        assert!(spatially_close(&a, &Region::rect(20, 0, 10, 10)));
        assert!(!spatially_close(&a, &Region::rect(100, 100, 10, 10)));
    }

    #[test]
    fn test_convex_hull_drops_interior_points() {
        let pts = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(5, 5),
            Point::new(10, 10),
            Point::new(0, 10),
            Point::new(3, 7),
        ];
        let hull = convex_hull(&pts);
        assert_eq!(
            hull,
            vec![
                Point::new(0, 0),
                Point::new(10, 0),
                Point::new(10, 10),
                Point::new(0, 10),
            ]
        );
    }

    #[test]
    fn test_convex_hull_collinear_points() {
        let pts = vec![Point::new(0, 0), Point::new(5, 0), Point::new(10, 0), Point::new(5, 5)];
        let hull = convex_hull(&pts);
        assert_eq!(hull, vec![Point::new(0, 0), Point::new(10, 0), Point::new(5, 5)]);
    }

    #[test]
    fn test_merge_is_hull_of_both() {
        let merged = merge(&Region::rect(0, 0, 10, 10), &Region::rect(5, 5, 10, 10));
        assert_eq!(polygon_area(&merged.points), 200.0);
        assert_eq!(merged.points.len(), 6);
    }

    #[test]
    fn test_merge_overlapping_leaves_disjoint_regions_alone() {
        let regions = vec![
            Region::rect(0, 0, 100, 20),
            Region::rect(0, 40, 100, 20),
            Region::new(vec![Point::new(0, 80), Point::new(50, 85), Point::new(10, 95)]),
        ];
        let out = merge_overlapping(regions.clone(), 10.0);
        assert_eq!(out, regions);
    }

    #[test]
    fn test_merge_overlapping_combines_tile_duplicates() {
        let regions = vec![
            Region::rect(0, 0, 100, 20),
            Region::rect(0, 50, 100, 20),
            Region::rect(10, 2, 100, 20),
        ];
        let out = merge_overlapping(regions, 50.0);
        assert_eq!(out.len(), 2);
        let b = bounding_box(&out[0].points).unwrap();
        assert_eq!((b.x, b.y, b.w, b.h), (0.0, 0.0, 110.0, 22.0));
        assert_eq!(out[1], Region::rect(0, 50, 100, 20));
    }

    #[test]
    fn test_merge_overlapping_respects_threshold() {
        let regions = vec![Region::rect(0, 0, 10, 10), Region::rect(5, 0, 10, 10)];
        assert_eq!(merge_overlapping(regions.clone(), 50.0).len(), 2);
        assert_eq!(merge_overlapping(regions, 30.0).len(), 1);
    }
}
