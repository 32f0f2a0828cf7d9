// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isoflow Grid
//!
//! Web-Mercator sub-grids used by regional analyses: pixel math, area-weighted
//! rasterization of polygons, and the two binary formats clients consume.
//!
//! - [`Grid`] holds one `f64` per pixel and serializes to the delta-coded
//!   general grid format.
//! - [`AccessGridHeader`] describes the fixed-offset access-grid format the
//!   result assembler writes into.

#![deny(missing_docs)]

pub mod access;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod mercator;

pub use access::{AccessGridHeader, read_access_grid};
pub use error::{GridError, Result};
pub use geometry::{Coord, Envelope, Geometry, Polygon};
pub use grid::{GRID_HEADER_INTS, Grid, MIN_GEOMETRY_AREA};
pub use mercator::{lat_to_pixel, lon_to_pixel, pixel_envelope, pixel_to_lat, pixel_to_lon};
