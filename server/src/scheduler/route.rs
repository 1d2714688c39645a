//! Route sequencing and arrival estimates

use fleetsync_shared::GeoPoint;
use thiserror::Error;

use crate::store::RouteStop;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// No leg is estimated shorter than this, however close the stops are
pub const MIN_LEG_MS: u64 = 60_000;

/// Longest single leg the planner will estimate
pub const MAX_LEG_MS: u64 = 7 * 24 * 3_600_000;

/// Slowest cruise speed accepted
pub const MIN_CRUISE_SPEED_MPS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("cruise speed {0} m/s is below {MIN_CRUISE_SPEED_MPS}")]
    BadSpeed(f64),

    #[error("leg of {leg_km:.1} km exceeds the longest estimable leg")]
    LegTooLong { leg_km: f64 },

    #[error("arrival estimate overflows the clock")]
    ClockOverflow,
}

/// Great-circle distance between two points, in kilometres
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Flight model used for estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteConfig {
    /// Ground speed between stops
    pub cruise_speed_mps: f64,
    /// Time spent at each stop before leaving for the next
    pub service_minutes: u32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            cruise_speed_mps: 15.0,
            service_minutes: 2,
        }
    }
}

/// A planned route and its totals
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRoute {
    pub stops: Vec<RouteStop>,
    pub total_distance_km: f64,
    pub estimated_duration_minutes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RoutePlanner {
    config: RouteConfig,
}

impl RoutePlanner {
    pub fn new(config: RouteConfig) -> Self {
        Self { config }
    }

    /// Sequence `destinations` in the given order, starting from `origin` at `depart_at_ms`
    ///
    /// Arrival times strictly increase along the route. Fails instead of
    /// wrapping when an estimate would not fit the millisecond clock.
    pub fn plan(
        &self,
        origin: GeoPoint,
        destinations: &[(String, GeoPoint)],
        depart_at_ms: u64,
    ) -> Result<PlannedRoute, RouteError> {
        let service_ms = u64::from(self.config.service_minutes) * 60_000;

        let mut stops = Vec::with_capacity(destinations.len());
        let mut total_distance_km = 0.0;
        let mut position = origin;
        let mut clock = depart_at_ms;

        for (index, (order_id, location)) in destinations.iter().enumerate() {
            let leg_km = haversine_km(position, *location);
            total_distance_km += leg_km;

            clock = clock
                .checked_add(self.leg_ms(leg_km)?)
                .ok_or(RouteError::ClockOverflow)?;
            stops.push(RouteStop {
                order_id: order_id.clone(),
                sequence_number: index as u32 + 1,
                estimated_arrival_ms: clock,
                location: *location,
            });

            clock = clock.checked_add(service_ms).ok_or(RouteError::ClockOverflow)?;
            position = *location;
        }

        let elapsed_ms = clock - depart_at_ms;
        let estimated_duration_minutes =
            u32::try_from(elapsed_ms.div_ceil(60_000)).map_err(|_| RouteError::ClockOverflow)?;
        Ok(PlannedRoute {
            stops,
            total_distance_km,
            estimated_duration_minutes,
        })
    }

    fn leg_ms(&self, leg_km: f64) -> Result<u64, RouteError> {
        let speed = self.config.cruise_speed_mps;
        if !speed.is_finite() || speed < MIN_CRUISE_SPEED_MPS {
            return Err(RouteError::BadSpeed(speed));
        }
        let travel_ms = (leg_km * 1000.0 / speed * 1000.0).ceil();
        if !travel_ms.is_finite() || travel_ms > MAX_LEG_MS as f64 {
            return Err(RouteError::LegTooLong { leg_km });
        }
        Ok((travel_ms as u64).max(MIN_LEG_MS))
    }
}
