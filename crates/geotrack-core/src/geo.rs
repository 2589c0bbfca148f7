//! # Geo Math
//!
//! Great-circle distance and polygon containment.
//!
//! All inputs are WGS84 decimal degrees, distances are meters. The
//! spherical model is accurate to ~0.5%, which is well inside typical
//! fix accuracy.

use crate::types::Coordinate;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Two coordinates closer than this (degrees) are considered identical.
pub const IDENTICAL_EPSILON_DEG: f64 = 1e-7;

/// Great-circle distance between two coordinates (haversine formula).
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// True when both coordinates are the same point (within 1e-7 degrees).
pub fn is_identical(a: Coordinate, b: Coordinate) -> bool {
    (a.latitude - b.latitude).abs() < IDENTICAL_EPSILON_DEG
        && (a.longitude - b.longitude).abs() < IDENTICAL_EPSILON_DEG
}

/// Ray-casting point-in-polygon test.
///
/// The polygon is implicitly closed. Fewer than 3 vertices never contain
/// anything.
pub fn point_in_polygon(vertices: &[Coordinate], point: Coordinate) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;

    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];

        let crosses = (vi.longitude > point.longitude) != (vj.longitude > point.longitude);
        if crosses {
            let lat_at = (vj.latitude - vi.latitude) * (point.longitude - vi.longitude)
                / (vj.longitude - vi.longitude)
                + vi.latitude;
            if point.latitude < lat_at {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Bounding circle of a vertex set: centroid of the vertices and the
/// distance to the farthest one.
pub fn bounding_circle(vertices: &[Coordinate]) -> (Coordinate, f64) {
    if vertices.is_empty() {
        return (Coordinate::new(0.0, 0.0), 0.0);
    }

    let n = vertices.len() as f64;
    let lat = vertices.iter().map(|v| v.latitude).sum::<f64>() / n;
    let lon = vertices.iter().map(|v| v.longitude).sum::<f64>() / n;
    let center = Coordinate::new(lat, lon);

    let radius = vertices
        .iter()
        .map(|v| haversine_distance(center, *v))
        .fold(0.0_f64, f64::max);

    (center, radius)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km on the mean sphere.
        let d = haversine_distance(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero_and_symmetric() {
        let a = Coordinate::new(45.5017, -73.5673);
        let b = Coordinate::new(45.5088, -73.5540);
        assert_eq!(haversine_distance(a, a), 0.0);
        assert!((haversine_distance(a, b) - haversine_distance(b, a)).abs() < 1e-9);
    }

    #[test]
    fn test_point_in_square() {
        let square = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 1.0),
            Coordinate::new(1.0, 1.0),
            Coordinate::new(1.0, 0.0),
        ];
        assert!(point_in_polygon(&square, Coordinate::new(0.5, 0.5)));
        assert!(!point_in_polygon(&square, Coordinate::new(1.5, 0.5)));
        assert!(!point_in_polygon(&square, Coordinate::new(0.5, -0.1)));
    }

    #[test]
    fn test_degenerate_polygon_contains_nothing() {
        let line = vec![Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0)];
        assert!(!point_in_polygon(&line, Coordinate::new(0.5, 0.5)));
    }

    #[test]
    fn test_bounding_circle_covers_vertices() {
        let vertices = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 0.01),
            Coordinate::new(0.01, 0.01),
            Coordinate::new(0.01, 0.0),
        ];
        let (center, radius) = bounding_circle(&vertices);
        for v in &vertices {
            assert!(haversine_distance(center, *v) <= radius + 1e-6);
        }
    }

    #[test]
    fn test_identical() {
        let a = Coordinate::new(10.0, 20.0);
        assert!(is_identical(a, Coordinate::new(10.00000001, 20.0)));
        assert!(!is_identical(a, Coordinate::new(10.0001, 20.0)));
    }
}
