// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rasterize-then-persist scenarios for opportunity density grids.

use std::fs::File;
use std::io::BufReader;

use isoflow_grid::{Coord, Geometry, Grid, Polygon, pixel_to_lat, pixel_to_lon};
use tempfile::TempDir;

fn block(zoom: i32, x0: i32, y0: i32, x1: i32, y1: i32) -> Polygon {
    Polygon::new(vec![
        Coord::new(pixel_to_lon(x0, zoom), pixel_to_lat(y1, zoom)),
        Coord::new(pixel_to_lon(x1, zoom), pixel_to_lat(y1, zoom)),
        Coord::new(pixel_to_lon(x1, zoom), pixel_to_lat(y0, zoom)),
        Coord::new(pixel_to_lon(x0, zoom), pixel_to_lat(y0, zoom)),
    ])
}

#[test]
fn test_census_blocks_survive_a_file_round_trip() {
    let zoom = 10;
    let mut grid = Grid::from_pixels(zoom, 500, 300, 4, 4).unwrap();

    // Two pixel-aligned blocks: 2x2 pixels with 400 jobs, 1x1 with 25.
    let blocks = Geometry::MultiPolygon(vec![block(zoom, 500, 300, 502, 302)]);
    grid.rasterize(&blocks, 400.0).unwrap();
    grid.rasterize(&block(zoom, 503, 303, 504, 304).into(), 25.0)
        .unwrap();

    // Pixel rows are not equal-area in degrees, so the 2x2 block splits by
    // latitude span rather than evenly.
    assert!((grid.sum() - 425.0).abs() < 1e-6);
    assert!((grid.get(3, 3).unwrap() - 25.0).abs() < 1e-9);
    let top = grid.get(0, 0).unwrap() + grid.get(1, 0).unwrap();
    let bottom = grid.get(0, 1).unwrap() + grid.get(1, 1).unwrap();
    assert!((top + bottom - 400.0).abs() < 1e-6);
    assert!(top < bottom, "northern row spans less latitude");

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.grid");
    grid.write(File::create(&path).unwrap()).unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, (5 + 16) * 4);

    let back = Grid::read(BufReader::new(File::open(&path).unwrap())).unwrap();
    assert_eq!((back.west(), back.north()), (500, 300));
    assert_eq!(back.get(3, 3), Some(25.0));
    assert_eq!(back.get(2, 2), Some(0.0));
}

#[test]
fn test_geometry_straddling_the_grid_edge_loses_the_outside_share() {
    let zoom = 10;
    let mut grid = Grid::from_pixels(zoom, 500, 300, 2, 2).unwrap();
    // Half of this 2x1 block lies west of the grid.
    grid.rasterize(&block(zoom, 499, 300, 501, 301).into(), 100.0)
        .unwrap();
    assert!((grid.sum() - 50.0).abs() < 1e-6);
    assert!((grid.get(0, 0).unwrap() - 50.0).abs() < 1e-6);
}
