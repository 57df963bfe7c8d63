//! Geometric primitives shared by the analyzers
//!
//! Everything operates on frame-normalized coordinates in [0, 1].

use serde::{Deserialize, Serialize};

/// A point in normalized frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    #[inline]
    pub fn distance(&self, other: Point) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Cross product of (p2 - p1) and (p3 - p1).
///
/// Sign tells which side of the directed line p1->p2 the point p3 lies on.
#[inline]
pub fn cross_product_sign(p1: Point, p2: Point, p3: Point) -> f64 {
    (p2.x - p1.x) * (p3.y - p1.y) - (p2.y - p1.y) * (p3.x - p1.x)
}

/// Proper intersection test for two line segments.
///
/// Uses the same-side cross-product test on both segment pairs. Endpoints
/// merely touching the other segment do not count as a crossing.
pub fn segments_intersect(a_start: Point, a_end: Point, b_start: Point, b_end: Point) -> bool {
    let d1 = cross_product_sign(b_start, b_end, a_start);
    let d2 = cross_product_sign(b_start, b_end, a_end);
    let d3 = cross_product_sign(a_start, a_end, b_start);
    let d4 = cross_product_sign(a_start, a_end, b_end);

    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// Ray-casting point-in-polygon test.
///
/// The polygon is an ordered vertex list; the closing edge from last to
/// first vertex is implied.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let pi = polygon[i];
        let pj = polygon[j];

        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Angle of a displacement vector in degrees, wrapped to [0, 360).
///
/// 0 = rightward, 90 = downward (screen coordinates, y grows down).
#[inline]
pub fn angle_degrees(dx: f64, dy: f64) -> f64 {
    let angle = dy.atan2(dx).to_degrees();
    angle.rem_euclid(360.0)
}

/// Shortest-arc difference between two angles, always in [0, 180]
#[inline]
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    diff.min(360.0 - diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_intersect_crossing() {
        // X-shaped crossing
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 0.0),
        ));
    }

    #[test]
    fn test_segments_intersect_parallel() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 0.5),
            Point::new(1.0, 0.5),
        ));
    }

    #[test]
    fn test_segments_intersect_disjoint() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(0.1, 0.1),
            Point::new(0.8, 0.8),
            Point::new(0.9, 0.9),
        ));
    }

    #[test]
    fn test_segment_crossing_horizontal_line() {
        // A person stepping from above to below a horizontal gate line
        let gate_start = Point::new(0.1, 0.6);
        let gate_end = Point::new(0.9, 0.6);
        assert!(segments_intersect(
            Point::new(0.5, 0.55),
            Point::new(0.5, 0.65),
            gate_start,
            gate_end,
        ));
        // Movement entirely above the line
        assert!(!segments_intersect(
            Point::new(0.5, 0.50),
            Point::new(0.5, 0.58),
            gate_start,
            gate_end,
        ));
    }

    #[test]
    fn test_point_in_polygon_convex() {
        let square = [
            Point::new(0.3, 0.2),
            Point::new(0.7, 0.2),
            Point::new(0.7, 0.5),
            Point::new(0.3, 0.5),
        ];
        // Centroid is inside
        assert!(point_in_polygon(Point::new(0.5, 0.35), &square));
        // Far outside any vertex bound
        assert!(!point_in_polygon(Point::new(0.95, 0.95), &square));
        assert!(!point_in_polygon(Point::new(0.1, 0.35), &square));
    }

    #[test]
    fn test_point_in_polygon_degenerate() {
        let line = [Point::new(0.0, 0.0), Point::new(1.0, 1.0)];
        assert!(!point_in_polygon(Point::new(0.5, 0.5), &line));
    }

    #[test]
    fn test_angle_degrees_quadrants() {
        assert_eq!(angle_degrees(1.0, 0.0), 0.0);
        assert_eq!(angle_degrees(0.0, 1.0), 90.0);
        assert_eq!(angle_degrees(-1.0, 0.0), 180.0);
        assert_eq!(angle_degrees(0.0, -1.0), 270.0);
    }

    #[test]
    fn test_angle_difference_shortest_arc() {
        assert_eq!(angle_difference(10.0, 350.0), 20.0);
        assert_eq!(angle_difference(350.0, 10.0), 20.0);
        assert_eq!(angle_difference(0.0, 180.0), 180.0);
        assert_eq!(angle_difference(90.0, 90.0), 0.0);
    }

    #[test]
    fn test_angle_difference_bounded() {
        let mut a = 0.0;
        while a < 360.0 {
            let mut b = 0.0;
            while b < 360.0 {
                let d = angle_difference(a, b);
                assert!((0.0..=180.0).contains(&d), "diff({a}, {b}) = {d}");
                b += 17.0;
            }
            a += 13.0;
        }
    }
}
