//! Simulated position source
//!
//! Flies a circular patrol around a fixed centre and drains the battery a
//! little on every fix. When the battery reaches the swap threshold it is
//! replaced with a full one, so the stream never runs dry.

use fleetsync_shared::{limits, GeoPoint, LocationReport};
use std::f64::consts::TAU;

/// Metres per degree of latitude (spherical approximation)
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Patrol parameters
#[derive(Debug, Clone, Copy)]
pub struct PatrolConfig {
    pub center: GeoPoint,
    pub radius_m: f64,
    /// Fixes per lap
    pub steps_per_lap: u32,
    /// Battery percent used per fix
    pub drain_per_step: f64,
    /// Battery percent at which the pack is swapped
    pub swap_threshold: f64,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            center: GeoPoint::new(45.0703, 7.6869),
            radius_m: 500.0,
            steps_per_lap: 120,
            drain_per_step: 0.25,
            swap_threshold: 20.0,
        }
    }
}

pub struct PatrolSource {
    config: PatrolConfig,
    step: u64,
    battery: f64,
}

impl PatrolSource {
    pub fn new(config: PatrolConfig) -> Self {
        Self {
            config,
            step: 0,
            battery: limits::BATTERY_MAX,
        }
    }

    /// Position for the current step
    pub fn position(&self) -> GeoPoint {
        let steps = u64::from(self.config.steps_per_lap.max(1));
        let angle = TAU * (self.step % steps) as f64 / steps as f64;
        let center = self.config.center;

        let d_lat = self.config.radius_m * angle.cos() / METERS_PER_DEGREE;
        let lon_scale = METERS_PER_DEGREE * center.latitude.to_radians().cos().max(1e-6);
        let d_lon = self.config.radius_m * angle.sin() / lon_scale;

        GeoPoint::new(
            (center.latitude + d_lat).clamp(-limits::LATITUDE_LIMIT, limits::LATITUDE_LIMIT),
            wrap_longitude(center.longitude + d_lon),
        )
    }

    pub fn battery(&self) -> f64 {
        self.battery
    }

    /// Produce a report for the current fix and advance the simulation
    pub fn next_report(&mut self, device_id: &str) -> LocationReport {
        let report = LocationReport {
            device_id: device_id.to_string(),
            location: Some(self.position()),
            battery_level: self.battery,
        };

        self.step += 1;
        self.battery -= self.config.drain_per_step;
        if self.battery <= self.config.swap_threshold {
            self.battery = limits::BATTERY_MAX;
        }
        self.battery = self.battery.clamp(limits::BATTERY_MIN, limits::BATTERY_MAX);

        report
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if lon > limits::LONGITUDE_LIMIT {
        lon - 360.0
    } else if lon < -limits::LONGITUDE_LIMIT {
        lon + 360.0
    } else {
        lon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_are_always_valid() {
        let mut source = PatrolSource::new(PatrolConfig::default());
        for _ in 0..1_000 {
            let report = source.next_report("D1");
            let location = report.location.expect("location");
            assert!(location.is_valid());
            assert!((0.0..=100.0).contains(&report.battery_level));
            assert_eq!(report.device_id, "D1");
        }
    }

    #[test]
    fn test_stays_on_the_circle() {
        let config = PatrolConfig::default();
        let mut source = PatrolSource::new(config);
        for _ in 0..config.steps_per_lap {
            let p = source.next_report("D1").location.expect("location");
            let dy = (p.latitude - config.center.latitude) * METERS_PER_DEGREE;
            let dx = (p.longitude - config.center.longitude)
                * METERS_PER_DEGREE
                * config.center.latitude.to_radians().cos();
            let r = (dx * dx + dy * dy).sqrt();
            assert!((r - config.radius_m).abs() < 1.0, "radius {r}");
        }
    }

    #[test]
    fn test_lap_returns_to_start() {
        let config = PatrolConfig {
            steps_per_lap: 8,
            ..Default::default()
        };
        let mut source = PatrolSource::new(config);
        let start = source.position();
        for _ in 0..8 {
            source.next_report("D1");
        }
        assert_eq!(source.position(), start);
    }

    #[test]
    fn test_battery_drains_then_swaps() {
        let mut source = PatrolSource::new(PatrolConfig {
            drain_per_step: 30.0,
            swap_threshold: 20.0,
            ..Default::default()
        });

        let levels: Vec<f64> = (0..5).map(|_| source.next_report("D1").battery_level).collect();
        assert_eq!(levels, vec![100.0, 70.0, 40.0, 100.0, 70.0]);
    }

    #[test]
    fn test_longitude_wraps_near_antimeridian() {
        let mut source = PatrolSource::new(PatrolConfig {
            center: GeoPoint::new(0.0, 179.999),
            radius_m: 1_000.0,
            steps_per_lap: 4,
            ..Default::default()
        });
        for _ in 0..4 {
            assert!(source.next_report("D1").location.expect("location").is_valid());
        }
    }
}
