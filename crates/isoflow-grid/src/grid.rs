// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rectangular sub-grids of the worldwide web-Mercator pixel grid.
//!
//! # Binary grid format
//!
//! All integers are 4-byte little-endian, whatever the host byte order,
//! because clients map the file straight into typed arrays.
//!
//! ```text
//! [zoom][west][north][width][height]
//! width × height delta-coded cell values, row-major (x varies fastest)
//! ```
//!
//! Each cell is rounded to an integer and stored as the difference from the
//! previous cell's rounded value; the first cell is stored against zero.

use std::io::{BufWriter, Read, Write};

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde_json::json;
use tracing::debug;

use crate::error::{GridError, Result};
use crate::geometry::{Geometry, Polygon};
use crate::mercator::{lat_to_pixel, lon_to_pixel, pixel_envelope};

/// Geometries smaller than this (in square degrees) cannot be rasterized.
pub const MIN_GEOMETRY_AREA: f64 = 1e-12;

/// Number of 4-byte integers in the general grid header.
pub const GRID_HEADER_INTS: usize = 5;

/// A web-Mercator sub-grid with one floating-point value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    zoom: i32,
    /// Smallest world y pixel of the grid (its northern row).
    north: i32,
    /// Smallest world x pixel of the grid (its western column).
    west: i32,
    width: i32,
    height: i32,
    /// Row-major cell values, index `y * width + x`.
    cells: Vec<f64>,
}

impl Grid {
    /// Build a grid covering a lat/lon bounding box at `zoom`.
    ///
    /// Fails with [`GridError::InvalidExtent`] when the box projects to zero
    /// or negative pixel width or height.
    pub fn new(zoom: i32, north: f64, east: f64, south: f64, west: f64) -> Result<Self> {
        let north_px = lat_to_pixel(north, zoom);
        let west_px = lon_to_pixel(west, zoom);
        let height = i64::from(lat_to_pixel(south, zoom)) - i64::from(north_px);
        let width = i64::from(lon_to_pixel(east, zoom)) - i64::from(west_px);
        if width <= 0 || height <= 0 {
            return Err(GridError::InvalidExtent { width, height });
        }
        Self::from_pixels(zoom, west_px, north_px, width as i32, height as i32)
    }

    /// Build a grid from its pixel origin and extents.
    ///
    /// Zero-sized grids are allowed here; they serialize to a bare header.
    pub fn from_pixels(zoom: i32, west: i32, north: i32, width: i32, height: i32) -> Result<Self> {
        if width < 0 || height < 0 {
            return Err(GridError::InvalidExtent {
                width: width.into(),
                height: height.into(),
            });
        }
        Ok(Self {
            zoom,
            north,
            west,
            width,
            height,
            cells: vec![0.0; width as usize * height as usize],
        })
    }

    /// Web-Mercator zoom level.
    pub fn zoom(&self) -> i32 {
        self.zoom
    }

    /// World y pixel of the northern row.
    pub fn north(&self) -> i32 {
        self.north
    }

    /// World x pixel of the western column.
    pub fn west(&self) -> i32 {
        self.west
    }

    /// Width in pixels.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> i32 {
        self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    /// Value of the cell at grid-relative `(x, y)`.
    pub fn get(&self, x: i32, y: i32) -> Option<f64> {
        self.index(x, y).map(|i| self.cells[i])
    }

    /// Overwrite the cell at grid-relative `(x, y)`. Returns false when out of bounds.
    pub fn set(&mut self, x: i32, y: i32, value: f64) -> bool {
        match self.index(x, y) {
            Some(i) => {
                self.cells[i] = value;
                true
            }
            None => false,
        }
    }

    /// Sum of all cell values.
    pub fn sum(&self) -> f64 {
        self.cells.iter().sum()
    }

    /// Spread `value` over every pixel the geometry touches, in proportion to
    /// the share of the geometry's area falling in each pixel.
    ///
    /// Pixels outside the grid receive nothing, so the total burned in equals
    /// `value × area(geometry ∩ grid) / area(geometry)`.
    pub fn rasterize(&mut self, geometry: &Geometry, value: f64) -> Result<()> {
        let area = geometry.area();
        if area < MIN_GEOMETRY_AREA {
            return Err(GridError::DegenerateGeometry { area });
        }

        let env = geometry.envelope();
        // Clamp the envelope's pixel range to the grid instead of visiting
        // off-grid pixels only to skip them.
        let min_x = lon_to_pixel(env.min_x, self.zoom).max(self.west);
        let max_x = lon_to_pixel(env.max_x, self.zoom).min(self.west + self.width - 1);
        let min_y = lat_to_pixel(env.max_y, self.zoom).max(self.north);
        let max_y = lat_to_pixel(env.min_y, self.zoom).min(self.north + self.height - 1);

        for world_y in min_y..=max_y {
            for world_x in min_x..=max_x {
                let pixel = pixel_envelope(world_x, world_y, self.zoom);
                let weight = geometry.intersection_area(&pixel) / area;
                if weight > 0.0 {
                    if let Some(i) = self.index(world_x - self.west, world_y - self.north) {
                        self.cells[i] += weight * value;
                    }
                }
            }
        }
        Ok(())
    }

    /// Add `amount` to the pixel containing the point.
    ///
    /// Returns false, leaving the grid untouched, when the point falls outside;
    /// callers count those.
    pub fn increment_point(&mut self, lat: f64, lon: f64, amount: f64) -> bool {
        let x = lon_to_pixel(lon, self.zoom) - self.west;
        let y = lat_to_pixel(lat, self.zoom) - self.north;
        match self.index(x, y) {
            Some(i) => {
                self.cells[i] += amount;
                true
            }
            None => false,
        }
    }

    /// Serialize in the general binary grid format.
    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        let mut out = BufWriter::new(writer);
        for v in [self.zoom, self.west, self.north, self.width, self.height] {
            out.write_all(&v.to_le_bytes())?;
        }
        let mut prev = 0i32;
        for &cell in &self.cells {
            let value = round_half_up(cell);
            out.write_all(&value.wrapping_sub(prev).to_le_bytes())?;
            prev = value;
        }
        out.flush()?;
        Ok(())
    }

    /// Decode a grid written by [`Grid::write`]. Cell values come back as the
    /// rounded integers that were stored.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut header = [0i32; GRID_HEADER_INTS];
        for slot in header.iter_mut() {
            *slot = read_i32(&mut reader)?;
        }
        let [zoom, west, north, width, height] = header;
        if width < 0 || height < 0 {
            return Err(GridError::InvalidHeader(format!(
                "negative extent {width}x{height}"
            )));
        }

        let mut grid = Self::from_pixels(zoom, west, north, width, height)?;
        let mut value = 0i32;
        for cell in grid.cells.iter_mut() {
            value = value.wrapping_add(read_i32(&mut reader)?);
            *cell = f64::from(value);
        }
        Ok(grid)
    }

    /// Write an 8-bit grayscale PNG, brightness normalized to the largest cell.
    pub fn write_image<W: Write>(&self, writer: W) -> Result<()> {
        let max = self.cells.iter().copied().fold(0.0_f64, f64::max);
        if max <= 0.0 {
            debug!(
                width = self.width,
                height = self.height,
                "Grid has no positive cells, writing black image"
            );
        }

        let pixels: Vec<u8> = self
            .cells
            .iter()
            .map(|&v| {
                if max > 0.0 && v > 0.0 {
                    (v * 255.0 / max) as u8
                } else {
                    0
                }
            })
            .collect();

        let mut out = BufWriter::new(writer);
        PngEncoder::new(&mut out).write_image(
            &pixels,
            self.width as u32,
            self.height as u32,
            ExtendedColorType::L8,
        )?;
        out.flush()?;
        Ok(())
    }

    /// Write a GeoJSON `FeatureCollection` with one square polygon per positive
    /// cell, carrying the cell value under `field_name`.
    pub fn write_vector_layer<W: Write>(&self, writer: W, field_name: &str) -> Result<()> {
        let mut features = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let value = self.cells[y as usize * self.width as usize + x as usize];
                if value <= 0.0 {
                    continue;
                }
                let pixel = Polygon::from_envelope(&pixel_envelope(
                    x + self.west,
                    y + self.north,
                    self.zoom,
                ));
                let ring: Vec<[f64; 2]> = pixel.exterior.iter().map(|c| [c.x, c.y]).collect();
                features.push(json!({
                    "type": "Feature",
                    "geometry": { "type": "Polygon", "coordinates": [ring] },
                    "properties": { field_name: value },
                }));
            }
        }

        let collection = json!({ "type": "FeatureCollection", "features": features });
        let mut out = BufWriter::new(writer);
        serde_json::to_writer(&mut out, &collection).map_err(std::io::Error::from)?;
        out.flush()?;
        Ok(())
    }
}

/// Round to the nearest integer, ties toward positive infinity.
fn round_half_up(v: f64) -> i32 {
    (v + 0.5).floor() as i32
}

pub(crate) fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coord, Envelope};
    use crate::mercator::{pixel_to_lat, pixel_to_lon};
    use image::ImageFormat;

    #[test]
    fn test_new_projects_bounds() {
        let grid = Grid::new(9, 52.6, 13.6, 52.4, 13.2).unwrap();
        assert_eq!(grid.west(), lon_to_pixel(13.2, 9));
        assert_eq!(grid.north(), lat_to_pixel(52.6, 9));
        assert_eq!(grid.width(), lon_to_pixel(13.6, 9) - lon_to_pixel(13.2, 9));
        assert_eq!(grid.height(), lat_to_pixel(52.4, 9) - lat_to_pixel(52.6, 9));
        assert!(grid.width() > 0 && grid.height() > 0);
    }

    #[test]
    fn test_new_rejects_inverted_extent() {
        // south above north
        let err = Grid::new(9, 52.4, 13.6, 52.6, 13.2).unwrap_err();
        assert!(matches!(err, GridError::InvalidExtent { .. }));

        // east == west
        let err = Grid::new(9, 52.6, 13.2, 52.4, 13.2).unwrap_err();
        assert!(matches!(err, GridError::InvalidExtent { width: 0, .. }));
    }

    #[test]
    fn test_increment_point_in_and_out_of_bounds() {
        let mut grid = Grid::new(10, 52.6, 13.6, 52.4, 13.2).unwrap();
        assert!(grid.increment_point(52.5, 13.4, 3.0));
        assert!(grid.increment_point(52.5, 13.4, 2.0));
        assert_eq!(grid.sum(), 5.0);

        assert!(!grid.increment_point(40.0, 13.4, 1.0));
        assert!(!grid.increment_point(52.5, 20.0, 1.0));
        assert_eq!(grid.sum(), 5.0);
    }

    #[test]
    fn test_rasterize_rejects_tiny_geometry() {
        let mut grid = Grid::from_pixels(9, 0, 0, 4, 4).unwrap();
        let tiny = Polygon::from_envelope(&Envelope {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 1e-7,
            max_y: 1e-7,
        });
        let err = grid.rasterize(&tiny.into(), 10.0).unwrap_err();
        assert!(matches!(err, GridError::DegenerateGeometry { .. }));
        assert_eq!(grid.sum(), 0.0);
    }

    #[test]
    fn test_rasterize_single_pixel_gets_everything() {
        let zoom = 9;
        let mut grid = Grid::from_pixels(zoom, 200, 150, 3, 3).unwrap();
        // A polygon strictly inside world pixel (201, 151)
        let env = pixel_envelope(201, 151, zoom);
        let dx = (env.max_x - env.min_x) / 4.0;
        let dy = (env.max_y - env.min_y) / 4.0;
        let inner = Polygon::new(vec![
            Coord::new(env.min_x + dx, env.min_y + dy),
            Coord::new(env.max_x - dx, env.min_y + dy),
            Coord::new(env.max_x - dx, env.max_y - dy),
            Coord::new(env.min_x + dx, env.max_y - dy),
        ]);
        grid.rasterize(&inner.into(), 42.0).unwrap();
        assert!((grid.get(1, 1).unwrap() - 42.0).abs() < 1e-9);
        assert!((grid.sum() - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_rasterize_conserves_value_inside_grid() {
        let zoom = 9;
        let mut grid = Grid::from_pixels(zoom, 200, 150, 4, 4).unwrap();
        let env = Envelope {
            min_x: pixel_to_lon(199, zoom) + 0.01,
            max_x: pixel_to_lon(203, zoom) - 0.03,
            min_y: pixel_to_lat(153, zoom) + 0.02,
            max_y: pixel_to_lat(149, zoom) - 0.01,
        };
        let triangle = Polygon::new(vec![
            Coord::new(env.min_x, env.min_y),
            Coord::new(env.max_x, env.min_y),
            Coord::new(env.min_x, env.max_y),
        ]);
        let geometry: Geometry = triangle.into();
        grid.rasterize(&geometry, 1000.0).unwrap();

        let grid_extent = Envelope {
            min_x: pixel_to_lon(200, zoom),
            max_x: pixel_to_lon(204, zoom),
            min_y: pixel_to_lat(154, zoom),
            max_y: pixel_to_lat(150, zoom),
        };
        let expected = 1000.0 * geometry.intersection_area(&grid_extent) / geometry.area();
        assert!(expected > 0.0 && expected < 1000.0);
        assert!(
            (grid.sum() - expected).abs() < 1e-6,
            "{} vs {expected}",
            grid.sum()
        );
    }

    #[test]
    fn test_write_header_and_delta_coding() {
        let mut grid = Grid::from_pixels(9, 100, 200, 3, 1).unwrap();
        grid.set(0, 0, 5.0);
        grid.set(1, 0, 3.4);
        grid.set(2, 0, 10.5);

        let mut bytes = Vec::new();
        grid.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), (GRID_HEADER_INTS + 3) * 4);

        let ints: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(ints, vec![9, 100, 200, 3, 1, 5, -2, 8]);
    }

    #[test]
    fn test_write_read_round_trip_including_empty_sizes() {
        for (width, height) in [(0, 0), (0, 3), (3, 0), (1, 1), (1, 4), (5, 1), (4, 3)] {
            let mut grid = Grid::from_pixels(11, 1234, 5678, width, height).unwrap();
            for y in 0..height {
                for x in 0..width {
                    grid.set(x, y, f64::from(x * 7 - y * 13) + 0.3);
                }
            }
            let mut bytes = Vec::new();
            grid.write(&mut bytes).unwrap();

            let back = Grid::read(bytes.as_slice()).unwrap();
            assert_eq!(back.zoom(), 11);
            assert_eq!((back.west(), back.north()), (1234, 5678));
            assert_eq!((back.width(), back.height()), (width, height));
            for y in 0..height {
                for x in 0..width {
                    let expected = round_half_up(grid.get(x, y).unwrap());
                    assert_eq!(back.get(x, y).unwrap(), f64::from(expected));
                }
            }
        }
    }

    #[test]
    fn test_read_truncated_input_fails() {
        let grid = Grid::from_pixels(9, 0, 0, 2, 2).unwrap();
        let mut bytes = Vec::new();
        grid.write(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Grid::read(bytes.as_slice()),
            Err(GridError::Io(_))
        ));
    }

    #[test]
    fn test_write_image_normalizes_to_max() {
        let mut grid = Grid::from_pixels(9, 0, 0, 2, 1).unwrap();
        grid.set(0, 0, 2.0);
        grid.set(1, 0, 4.0);
        let mut bytes = Vec::new();
        grid.write_image(&mut bytes).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .unwrap()
            .to_luma8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert_eq!(decoded.into_raw(), vec![127, 255]);
    }

    #[test]
    fn test_write_vector_layer_skips_empty_cells() {
        let mut grid = Grid::from_pixels(9, 10, 20, 2, 2).unwrap();
        grid.set(1, 0, 7.5);
        let mut bytes = Vec::new();
        grid.write_vector_layer(&mut bytes, "jobs").unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let features = parsed["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["jobs"], 7.5);
        let ring = features[0]["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring[0][0], pixel_to_lon(11, 9));
    }
}
