//! # Validation Module
//!
//! Input validation for geofence regions.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: THIS MODULE (pure rules)                                     │
//! │  ├── identifier non-empty, radius > 0, coordinates in range            │
//! │  └── duplicate identifiers inside one request                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Geofence Registry (engine)                                   │
//! │  └── collisions with already-registered regions                        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── PRIMARY KEY on geofences.identifier                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use geotrack_core::types::GeofenceRegion;
//! use geotrack_core::validation::validate_geofence;
//!
//! let region = GeofenceRegion::circle("home", 45.5, -73.6, 150.0);
//! assert!(validate_geofence(&region).is_ok());
//!
//! let bad = GeofenceRegion::circle("", 45.5, -73.6, 150.0);
//! assert!(validate_geofence(&bad).is_err());
//! ```

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::types::GeofenceRegion;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a geofence identifier.
pub fn validate_identifier(identifier: &str) -> ValidationResult<()> {
    if identifier.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "identifier".to_string(),
        });
    }
    Ok(())
}

/// Validates a latitude/longitude pair.
pub fn validate_coordinate(latitude: f64, longitude: f64) -> ValidationResult<()> {
    if !(-90.0..=90.0).contains(&latitude) || latitude.is_nan() {
        return Err(ValidationError::OutOfRange {
            field: "latitude".to_string(),
            min: -90.0,
            max: 90.0,
        });
    }
    if !(-180.0..=180.0).contains(&longitude) || longitude.is_nan() {
        return Err(ValidationError::OutOfRange {
            field: "longitude".to_string(),
            min: -180.0,
            max: 180.0,
        });
    }
    Ok(())
}

/// Validates a single region.
///
/// ## Rules
/// - identifier must not be empty
/// - radius must be > 0
/// - center (and every vertex) must be a valid coordinate
/// - polygons need at least 3 vertices
pub fn validate_geofence(region: &GeofenceRegion) -> ValidationResult<()> {
    validate_identifier(&region.identifier)?;

    if !(region.radius > 0.0) {
        return Err(ValidationError::MustBePositive {
            field: "radius".to_string(),
        });
    }

    validate_coordinate(region.latitude, region.longitude)?;

    if let Some(vertices) = &region.vertices {
        if vertices.len() < 3 {
            return Err(ValidationError::InvalidFormat {
                field: "vertices".to_string(),
                reason: format!("polygon needs at least 3 vertices, got {}", vertices.len()),
            });
        }
        for vertex in vertices {
            validate_coordinate(vertex.latitude, vertex.longitude)?;
        }
    }

    Ok(())
}

/// Validates a batch of regions, including duplicates inside the batch.
pub fn validate_geofences(regions: &[GeofenceRegion]) -> ValidationResult<()> {
    let mut seen = HashSet::with_capacity(regions.len());
    for region in regions {
        validate_geofence(region)?;
        if !seen.insert(region.identifier.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "identifier".to_string(),
                value: region.identifier.clone(),
            });
        }
    }
    Ok(())
}
