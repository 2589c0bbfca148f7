//! # Seed Data Generator
//!
//! Populates a database with a synthetic track and a ring of geofences
//! for development against a local sync endpoint.
//!
//! ## Usage
//! ```bash
//! # 500 locations (default), 25 geofences (default)
//! cargo run -p geotrack-db --bin seed
//!
//! # Custom amounts
//! cargo run -p geotrack-db --bin seed -- --count 5000 --geofences 40
//!
//! # Specify database path
//! cargo run -p geotrack-db --bin seed -- --db ./data/geotrack.db
//! ```
//!
//! ## Generated Data
//! - A walk north-east from downtown Montréal, one fix every 10 s,
//!   with a stop (motionchange) every 100 records
//! - Geofences on a 1 km ring around the start point, 200 m radius
//!
//! Set `RUST_LOG=debug` to see every insert.

use std::env;

use chrono::{Duration, Utc};
use geotrack_core::{Fix, GeofenceRegion, LocationEvent, LocationRecord};
use geotrack_db::{Database, DbConfig};
use tracing_subscriber::EnvFilter;

const START: (f64, f64) = (45.5017, -73.5673);

/// ~11 m per step in each axis.
const STEP_DEG: f64 = 0.0001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 500;
    let mut geofences: usize = 25;
    let mut db_path = String::from("./geotrack_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--geofences" | "-g" => {
                if i + 1 < args.len() {
                    geofences = args[i + 1].parse().unwrap_or(25);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("geotrack Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>       Number of locations (default: 500)");
                println!("  -g, --geofences <N>   Number of geofences (default: 25)");
                println!("  -d, --db <PATH>       Database file path (default: ./geotrack_dev.db)");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 geotrack Seed Data Generator");
    println!("===============================");
    println!("Database:  {}", db_path);
    println!("Locations: {}", count);
    println!("Geofences: {}", geofences);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.geofences().count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} geofences, skipping them", existing);
    } else {
        let regions = geofence_ring(geofences);
        db.geofences().insert_all(&regions).await?;
        println!("✓ Inserted {} geofences", regions.len());
    }

    let start = std::time::Instant::now();
    let origin = Utc::now() - Duration::seconds(10 * count as i64);
    let mut odometer = 0.0;

    for n in 0..count {
        let step = n as f64;
        let fix = Fix::new(
            START.0 + step * STEP_DEG,
            START.1 + step * STEP_DEG,
            5.0 + (n % 7) as f64,
            origin + Duration::seconds(10 * n as i64),
        )
        .with_speed(1.4);

        let stopped = n > 0 && n % 100 == 0;
        let event = if n == 0 || stopped {
            LocationEvent::MotionChange
        } else {
            LocationEvent::Tracking
        };
        if n > 0 {
            odometer += 15.6;
        }

        let record = LocationRecord::from_fix(&fix, event, !stopped, odometer);
        db.locations().persist(&record).await?;

        if (n + 1) % 100 == 0 {
            println!("  Generated {} locations...", n + 1);
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Generated {} locations in {:?}", count, elapsed);
    println!(
        "  Pending sync: {}",
        db.locations().count(true).await?
    );
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// `n` circular regions evenly spaced on a 1 km ring around [`START`].
fn geofence_ring(n: usize) -> Vec<GeofenceRegion> {
    (0..n)
        .map(|k| {
            let angle = (k as f64 / n.max(1) as f64) * std::f64::consts::TAU;
            let lat = START.0 + 0.009 * angle.sin();
            let lon = START.1 + 0.0128 * angle.cos();
            GeofenceRegion::circle(format!("ring-{k:02}"), lat, lon, 200.0)
        })
        .collect()
}
