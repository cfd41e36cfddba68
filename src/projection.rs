use rstar::AABB;
use std::f64::consts::PI;

// Constants for Web Mercator as used by Mapbox GL (512px tiles)
pub const TILE_SIZE: f64 = 512.0;
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

pub fn world_size(zoom: f64) -> f64 {
    TILE_SIZE * 2.0_f64.powf(zoom)
}

/// Normalised Mercator coordinates, both axes in `[0, 1]` with y growing south.
pub fn lng_lat_to_unit(lng: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = (lng + 180.0) / 360.0;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0;
    (x, y)
}

pub fn unit_to_lng_lat(x: f64, y: f64) -> (f64, f64) {
    let lng = x * 360.0 - 180.0;
    let n = PI - 2.0 * PI * y;
    let lat = n.sinh().atan().to_degrees();
    (lng, lat)
}

pub fn lng_lat_to_world_pixel(lng: f64, lat: f64, zoom: f64) -> (f64, f64) {
    let (x, y) = lng_lat_to_unit(lng, lat);
    let size = world_size(zoom);
    (x * size, y * size)
}

/// Screen distance in pixels between two positions at `zoom`.
pub fn pixel_distance(a: [f64; 2], b: [f64; 2], zoom: f64) -> f64 {
    let (ax, ay) = lng_lat_to_world_pixel(a[0], a[1], zoom);
    let (bx, by) = lng_lat_to_world_pixel(b[0], b[1], zoom);
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

/// Lon/lat envelope covering a square of `radius_px` around a position.
pub fn pixel_envelope(lng: f64, lat: f64, zoom: f64, radius_px: f64) -> AABB<[f64; 2]> {
    let (x, y) = lng_lat_to_unit(lng, lat);
    let r = radius_px / world_size(zoom);
    let (west, north) = unit_to_lng_lat(x - r, y - r);
    let (east, south) = unit_to_lng_lat(x + r, y + r);
    AABB::from_corners([west, south], [east, north])
}
