//! convert — YUV 4:2:0 camera frames to upright RGB24
//!
//! The converter is built once for a fixed frame geometry and owns its RGB
//! scratch buffer, so steady-state conversion never reallocates it.

use anyhow::{Context, Result, bail, ensure};
use rayon::prelude::*;

use crate::video::{RgbFrame, YuvFrame};

/// Clockwise rotation needed to display a frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Accepts any multiple of 90, including negative angles.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 => Ok(Self::Cw180),
            270 => Ok(Self::Cw270),
            other => bail!("unsupported rotation: {other}° (must be a multiple of 90)"),
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Output dimensions after rotating a `width × height` frame.
    pub fn rotated_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::None | Self::Cw180 => (width, height),
            Self::Cw90 | Self::Cw270 => (height, width),
        }
    }
}

/// Fixed-geometry YUV → RGB converter with an owned scratch buffer.
pub struct FrameConverter {
    width: u32,
    height: u32,
    rotation: Rotation,
    scratch: Vec<u8>,
}

impl FrameConverter {
    pub fn new(width: u32, height: u32, rotation: Rotation) -> Result<Self> {
        ensure!(width > 0 && height > 0, "frame size must be non-zero");
        Ok(Self {
            width,
            height,
            rotation,
            scratch: vec![0u8; rgb_len(width, height)?],
        })
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Dimensions of the frames this converter produces.
    pub fn output_size(&self) -> (u32, u32) {
        self.rotation.rotated_size(self.width, self.height)
    }

    pub fn convert(&mut self, frame: &YuvFrame) -> Result<RgbFrame> {
        ensure!(
            frame.rotation == self.rotation,
            "frame needs {}° rotation, converter was built for {}°",
            frame.rotation.degrees(),
            self.rotation.degrees()
        );
        ensure!(
            frame.width == self.width && frame.height == self.height,
            "frame is {}x{}, converter was built for {}x{}",
            frame.width,
            frame.height,
            self.width,
            self.height
        );
        let (cw, ch) = YuvFrame::chroma_size(self.width, self.height);
        let luma_len = self.width as usize * self.height as usize;
        let chroma_len = cw as usize * ch as usize;
        ensure!(
            frame.y.len() == luma_len,
            "luma plane has {} bytes, expected {luma_len}",
            frame.y.len()
        );
        ensure!(
            frame.u.len() == chroma_len && frame.v.len() == chroma_len,
            "chroma planes do not match {cw}x{ch}"
        );

        yuv420_to_rgb(frame, &mut self.scratch);

        let (out_w, out_h) = self.output_size();
        let data = rotate_rgb(&self.scratch, self.width, self.height, self.rotation);
        Ok(RgbFrame {
            data,
            width: out_w,
            height: out_h,
            pts: frame.pts,
        })
    }
}

/// Byte length of a packed RGB24 image, computed without `u32` overflow.
pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(3))
        .with_context(|| format!("{width}x{height} RGB frame is too large"))
}

/// BT.601 limited-range YUV 4:2:0 → packed RGB24.
fn yuv420_to_rgb(frame: &YuvFrame, out: &mut [u8]) {
    let w = frame.width as usize;
    let cw = frame.width.div_ceil(2) as usize;

    out.par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(row, dst)| {
            let y_row = &frame.y[row * w..(row + 1) * w];
            let c_off = (row / 2) * cw;
            for x in 0..w {
                let c = y_row[x] as i32 - 16;
                let d = frame.u[c_off + x / 2] as i32 - 128;
                let e = frame.v[c_off + x / 2] as i32 - 128;
                let px = &mut dst[x * 3..x * 3 + 3];
                px[0] = clamp_u8((298 * c + 409 * e + 128) >> 8);
                px[1] = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8);
                px[2] = clamp_u8((298 * c + 516 * d + 128) >> 8);
            }
        });
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn rotate_rgb(src: &[u8], width: u32, height: u32, rotation: Rotation) -> Vec<u8> {
    if rotation == Rotation::None {
        return src.to_vec();
    }

    let (w, h) = (width as usize, height as usize);
    let (out_w, _) = rotation.rotated_size(width, height);
    let out_w = out_w as usize;
    let mut out = vec![0u8; src.len()];

    out.par_chunks_mut(out_w * 3)
        .enumerate()
        .for_each(|(oy, dst)| {
            for ox in 0..out_w {
                let (sx, sy) = match rotation {
                    Rotation::Cw90 => (oy, h - 1 - ox),
                    Rotation::Cw180 => (w - 1 - ox, h - 1 - oy),
                    Rotation::Cw270 => (w - 1 - oy, ox),
                    Rotation::None => (ox, oy),
                };
                let s = (sy * w + sx) * 3;
                dst[ox * 3..ox * 3 + 3].copy_from_slice(&src[s..s + 3]);
            }
        });
    out
}
