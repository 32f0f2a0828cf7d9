// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access-grid file format.
//!
//! One record per origin pixel, holding the accessibility values computed for
//! that origin. Unlike the general grid format, values are stored as-is
//! (no delta coding) so that independent results can be written at fixed
//! offsets in any order.
//!
//! ```text
//! "ACCESSGR"                       8 bytes ASCII
//! version zoom west north          4 × i32 LE
//! width height valuesPerPixel      3 × i32 LE
//! width × height × valuesPerPixel  i32 LE, record for task i at 36 + i × 4 × valuesPerPixel
//! ```

use std::io::{Read, Write};

use crate::error::{GridError, Result};
use crate::grid::read_i32;

/// Header of an access-grid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessGridHeader {
    /// Web-Mercator zoom level.
    pub zoom: i32,
    /// World x pixel of the western column.
    pub west: i32,
    /// World y pixel of the northern row.
    pub north: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Number of i32 values stored per pixel.
    pub values_per_pixel: i32,
}

impl AccessGridHeader {
    /// Magic tag opening every access grid.
    pub const TAG: &'static [u8; 8] = b"ACCESSGR";
    /// Format version written by this crate.
    pub const VERSION: i32 = 0;
    /// Encoded header size in bytes.
    pub const LENGTH: u64 = 36;

    /// Number of pixel records.
    pub fn pixel_count(&self) -> u64 {
        self.width.max(0) as u64 * self.height.max(0) as u64
    }

    /// Total encoded size of a file with this header.
    pub fn file_len(&self) -> u64 {
        Self::LENGTH + self.pixel_count() * self.record_len()
    }

    /// Size of one pixel record in bytes.
    pub fn record_len(&self) -> u64 {
        4 * self.values_per_pixel.max(0) as u64
    }

    /// Byte offset of the record for `task_index`.
    pub fn record_offset(&self, task_index: u64) -> u64 {
        Self::LENGTH + task_index * self.record_len()
    }

    /// Encode the header into its fixed 36-byte form.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH as usize] {
        let mut buf = [0u8; Self::LENGTH as usize];
        buf[..8].copy_from_slice(Self::TAG);
        let ints = [
            Self::VERSION,
            self.zoom,
            self.west,
            self.north,
            self.width,
            self.height,
            self.values_per_pixel,
        ];
        for (i, v) in ints.iter().enumerate() {
            let at = 8 + i * 4;
            buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    /// Write the encoded header.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Read and validate a header.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut tag = [0u8; 8];
        reader.read_exact(&mut tag)?;
        if &tag != Self::TAG {
            return Err(GridError::InvalidHeader(format!(
                "bad tag {:?}",
                String::from_utf8_lossy(&tag)
            )));
        }
        let version = read_i32(&mut reader)?;
        if version != Self::VERSION {
            return Err(GridError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        let header = Self {
            zoom: read_i32(&mut reader)?,
            west: read_i32(&mut reader)?,
            north: read_i32(&mut reader)?,
            width: read_i32(&mut reader)?,
            height: read_i32(&mut reader)?,
            values_per_pixel: read_i32(&mut reader)?,
        };
        if header.width < 0 || header.height < 0 || header.values_per_pixel < 0 {
            return Err(GridError::InvalidHeader(format!(
                "negative dimension {}x{}x{}",
                header.width, header.height, header.values_per_pixel
            )));
        }
        Ok(header)
    }
}

/// Decode a complete access grid into its header and one value vector per pixel.
pub fn read_access_grid<R: Read>(mut reader: R) -> Result<(AccessGridHeader, Vec<Vec<i32>>)> {
    let header = AccessGridHeader::read(&mut reader)?;
    let per_pixel = header.values_per_pixel as usize;
    let mut records = Vec::with_capacity(header.pixel_count() as usize);
    for _ in 0..header.pixel_count() {
        let mut record = Vec::with_capacity(per_pixel);
        for _ in 0..per_pixel {
            record.push(read_i32(&mut reader)?);
        }
        records.push(record);
    }
    Ok((header, records))
}
