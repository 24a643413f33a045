use deskrail_core::GeoPoint;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two WGS84 points, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASTANA: GeoPoint = GeoPoint {
        lat: 51.1605,
        lon: 71.4704,
    };
    const ALMATY: GeoPoint = GeoPoint {
        lat: 43.2389,
        lon: 76.8897,
    };

    #[test]
    fn zero_distance_to_self() {
        assert!(haversine_km(ASTANA, ASTANA) < 1e-9);
    }

    #[test]
    fn astana_almaty_is_about_960_km() {
        let d = haversine_km(ASTANA, ALMATY);
        assert!((930.0..1000.0).contains(&d), "got {d} km");
    }

    #[test]
    fn symmetric() {
        let ab = haversine_km(ASTANA, ALMATY);
        let ba = haversine_km(ALMATY, ASTANA);
        assert!((ab - ba).abs() < 1e-9);
    }
}
