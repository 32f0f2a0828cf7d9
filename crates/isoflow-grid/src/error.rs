// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for isoflow-grid.

use thiserror::Error;

/// Errors raised while building, filling or decoding grids.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GridError {
    /// The projected bounding box has no area at the requested zoom.
    #[error("Invalid grid extent: width {width}, height {height}")]
    InvalidExtent {
        /// Projected width in pixels.
        width: i64,
        /// Projected height in pixels.
        height: i64,
    },

    /// The geometry is too small for its area to be used as a weight denominator.
    #[error("Geometry is too small to rasterize (area {area:e})")]
    DegenerateGeometry {
        /// Area of the rejected geometry in square degrees.
        area: f64,
    },

    /// A serialized grid header could not be decoded.
    #[error("Invalid grid header: {0}")]
    InvalidHeader(String),

    /// Image encoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using GridError.
pub type Result<T> = std::result::Result<T, GridError>;
