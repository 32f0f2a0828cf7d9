// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Web-Mercator pixel math.
//!
//! Standard slippy-map formulas with 256×256 pixel tiles. Pixel numbers are
//! absolute ("world") pixels counted from the antimeridian (x) and from the
//! northern edge of the projection (y), so y grows southward while latitude
//! grows northward.

use std::f64::consts::PI;

use crate::geometry::Envelope;

/// Edge length of one slippy-map tile in pixels.
pub const TILE_SIZE: f64 = 256.0;

fn world_pixels(zoom: i32) -> f64 {
    2f64.powi(zoom) * TILE_SIZE
}

/// World pixel column containing `lon` at `zoom`.
pub fn lon_to_pixel(lon: f64, zoom: i32) -> i32 {
    ((lon + 180.0) / 360.0 * world_pixels(zoom)).floor() as i32
}

/// Longitude of the western edge of pixel column `pixel`.
pub fn pixel_to_lon(pixel: i32, zoom: i32) -> f64 {
    f64::from(pixel) / world_pixels(zoom) * 360.0 - 180.0
}

/// World pixel row containing `lat` at `zoom`.
pub fn lat_to_pixel(lat: f64, zoom: i32) -> i32 {
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) * 2f64.powi(zoom - 1) * TILE_SIZE;
    y.floor() as i32
}

/// Latitude of the northern edge of pixel row `pixel`.
pub fn pixel_to_lat(pixel: i32, zoom: i32) -> f64 {
    let n = PI - (f64::from(pixel) / TILE_SIZE) / 2f64.powi(zoom) * 2.0 * PI;
    n.sinh().atan().to_degrees()
}

/// Lon/lat bounding box of the absolute pixel `(x, y)`.
pub fn pixel_envelope(x: i32, y: i32, zoom: i32) -> Envelope {
    Envelope {
        min_x: pixel_to_lon(x, zoom),
        max_x: pixel_to_lon(x + 1, zoom),
        // y + 1 is the southern edge
        min_y: pixel_to_lat(y + 1, zoom),
        max_y: pixel_to_lat(y, zoom),
    }
}
