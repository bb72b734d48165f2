use crate::pipeline::types::Point;

/// Drops points closer than `threshold` pixels to the previously kept point.
///
/// The first point is always kept and the last one is always restored, so the
/// outline still closes where it used to. A non-positive threshold is a no-op.
pub fn simplify(points: &[Point], threshold: f64) -> Vec<Point> {
    let (first, last) = match (points.first(), points.last()) {
        (Some(f), Some(l)) if threshold > 0.0 => (*f, *l),
        _ => return points.to_vec(),
    };

    let mut kept = vec![first];
    for p in &points[1..] {
        let prev = kept[kept.len() - 1];
        let dist = ((p.x - prev.x) as f64).hypot((p.y - prev.y) as f64);
        if dist >= threshold {
            kept.push(*p);
        }
    }

    if kept.last() != Some(&last) {
        kept.push(last);
    }
    kept
}
