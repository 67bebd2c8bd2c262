//! video — FFmpeg camera bridge
//!
//! Opens a capture device (`/dev/video0`, `avfoundation` inputs, …) or any
//! file/URL FFmpeg understands, decodes frames, normalises them to planar
//! YUV 4:2:0 and hands them out as [`FrameHandle`]s.
//!
//! Delivery is gated by a single-slot [`FrameGate`]: while a handle is still
//! outstanding, newly decoded frames are skipped rather than queued, so the
//! consumer always sees the freshest frame once it is ready again.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, decoder, format, frame, media, software::scaling};
use tracing::{debug, info, warn};

use crate::convert::Rotation;

/// Internal analysis pixel format.
const ANALYSIS_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Bilinear is plenty for analysis-sized frames.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

// ── Frames ───────────────────────────────────────────────────────────────────

/// A decoded RGB24 frame along with its presentation timestamp (in the source
/// stream's time-base units).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    pub fn from_image(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
            pts: 0,
        }
    }

    /// Load a still image from disk (single-shot classification).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("failed to open image: {}", path.display()))?
            .into_rgb8();
        Ok(Self::from_image(img))
    }
}

/// A raw camera frame in planar YUV 4:2:0 (I420) with tightly packed planes.
///
/// `rotation` is the clockwise rotation needed to display the frame upright;
/// a [`FrameConverter`](crate::convert::FrameConverter) refuses frames whose
/// rotation differs from its own.
#[derive(Debug, Clone)]
pub struct YuvFrame {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub pts: i64,
}

impl YuvFrame {
    /// Chroma plane dimensions for 4:2:0 subsampling.
    pub fn chroma_size(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(2), height.div_ceil(2))
    }
}

// ── Single-slot gate ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SlotState {
    busy: AtomicBool,
    delivered: AtomicU64,
    skipped: AtomicU64,
}

/// Counters reported when a source stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub delivered: u64,
    pub skipped: u64,
}

/// Single-slot delivery gate shared between a source and its consumer.
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
    slot: Arc<SlotState>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot if it is free. Returns `None` (and counts a skipped frame)
    /// while a previously delivered handle has not been released.
    pub fn try_acquire(&self) -> Option<SlotLease> {
        if self
            .slot
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.slot.delivered.fetch_add(1, Ordering::Relaxed);
            Some(SlotLease {
                slot: Arc::clone(&self.slot),
            })
        } else {
            self.slot.skipped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Convenience: acquire the slot and wrap `frame` in a handle.
    pub fn offer(&self, frame: Option<YuvFrame>) -> Option<FrameHandle> {
        self.try_acquire().map(|lease| FrameHandle::new(frame, lease))
    }

    pub fn is_busy(&self) -> bool {
        self.slot.busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            delivered: self.slot.delivered.load(Ordering::Relaxed),
            skipped: self.slot.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Occupancy of the gate's slot; frees the slot when dropped.
#[derive(Debug)]
pub struct SlotLease {
    slot: Arc<SlotState>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// A delivered frame. The image may be missing (the device handed out an
/// empty buffer); the slot is released exactly once, when the handle is
/// dropped or [`FrameHandle::release`] is called.
#[derive(Debug)]
pub struct FrameHandle {
    frame: Option<YuvFrame>,
    _lease: Option<SlotLease>,
}

impl FrameHandle {
    pub fn new(frame: Option<YuvFrame>, lease: SlotLease) -> Self {
        Self {
            frame,
            _lease: Some(lease),
        }
    }

    /// A handle not tied to any source slot.
    pub fn detached(frame: Option<YuvFrame>) -> Self {
        Self {
            frame,
            _lease: None,
        }
    }

    pub fn frame(&self) -> Option<&YuvFrame> {
        self.frame.as_ref()
    }

    /// Hand the frame back to its source.
    pub fn release(self) {}
}

// ── Camera source ───────────────────────────────────────────────────────────

/// Width:height ratio for analysis frames, e.g. `16:9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const RATIO_16_9: Self = Self {
        width: 16,
        height: 9,
    };
    pub const RATIO_4_3: Self = Self {
        width: 4,
        height: 3,
    };
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((w, h)) = s.split_once(':') else {
            bail!("aspect ratio must look like 16:9, got {s:?}");
        };
        let width: u32 = w
            .trim()
            .parse()
            .with_context(|| format!("bad aspect width: {w:?}"))?;
        let height: u32 = h
            .trim()
            .parse()
            .with_context(|| format!("bad aspect height: {h:?}"))?;
        if width == 0 || height == 0 {
            bail!("aspect ratio sides must be non-zero, got {s:?}");
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

/// How to open a frame source.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    /// Device path, file path or URL.
    pub input: String,
    /// Explicit rotation in degrees; overrides stream metadata.
    pub rotation: Option<i32>,
    /// Scale frames to this width (aspect preserved) before analysis.
    pub target_width: Option<u32>,
    /// Center-crop frames to this aspect ratio (in sensor orientation, before
    /// rotation). `None` keeps the native aspect.
    pub target_aspect: Option<AspectRatio>,
}

impl SourceSpec {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            rotation: None,
            target_width: None,
            target_aspect: None,
        }
    }
}

/// Centered, even-aligned crop window inside a scaled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crop {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl Crop {
    fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// An opened FFmpeg input producing YUV 4:2:0 frames.
pub struct CameraSource {
    ictx: format::context::Input,
    stream_index: usize,
    decoder: decoder::Video,
    scaler: scaling::Context,
    crop: Crop,
    rotation: Rotation,
}

impl CameraSource {
    pub fn open(spec: &SourceSpec) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        ffmpeg::device::register_all();

        let ictx = format::input(&spec.input)
            .with_context(|| format!("could not open source: {}", spec.input))?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in source")?;
        let stream_index = stream.index();

        let rotation = match spec.rotation {
            Some(deg) => Rotation::from_degrees(deg)?,
            None => stream_rotation(&stream),
        };

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let src_width = decoder.width();
        let src_height = decoder.height();
        let (scaled_width, scaled_height) = match spec.target_width {
            Some(w) => scaled_size(src_width, src_height, w),
            None => (src_width & !1, src_height & !1),
        };
        let crop = match spec.target_aspect {
            Some(aspect) => center_crop(scaled_width, scaled_height, aspect),
            None => Crop::full(scaled_width, scaled_height),
        };
        if crop.width == 0 || crop.height == 0 {
            bail!("source frames are too small to analyse: {src_width}x{src_height}");
        }

        let scaler = scaling::Context::get(
            decoder.format(),
            src_width,
            src_height,
            ANALYSIS_FORMAT,
            scaled_width,
            scaled_height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        let aspect = spec
            .target_aspect
            .map_or_else(|| "native".to_string(), |a| a.to_string());
        info!(
            input = %spec.input,
            src_width,
            src_height,
            width = crop.width,
            height = crop.height,
            aspect = %aspect,
            rotation = rotation.degrees(),
            "opened frame source"
        );

        Ok(Self {
            ictx,
            stream_index,
            decoder,
            scaler,
            crop,
            rotation,
        })
    }

    /// Analysis frame width (after cropping, before rotation).
    pub fn width(&self) -> u32 {
        self.crop.width
    }

    pub fn height(&self) -> u32 {
        self.crop.height
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Decode until end of stream or until `cancel` is set, passing every
    /// frame the gate accepts to `deliver`. Returns the number of decoded
    /// frames.
    pub fn run<F>(self, gate: &FrameGate, cancel: &AtomicBool, mut deliver: F) -> Result<u64>
    where
        F: FnMut(FrameHandle),
    {
        let Self {
            mut ictx,
            stream_index,
            mut decoder,
            mut scaler,
            crop,
            rotation,
        } = self;

        let mut decoded = frame::Video::empty();
        let mut scaled = frame::Video::empty();
        let mut frame_count = 0u64;

        let mut handle_decoded = |decoded: &frame::Video, frame_count: &mut u64| {
            *frame_count += 1;
            let Some(lease) = gate.try_acquire() else {
                return;
            };
            // An unconvertible frame is still delivered, as a missing image.
            let yuv = match scaler.run(decoded, &mut scaled) {
                Ok(()) => Some(pack_yuv(&scaled, crop, rotation, decoded.pts())),
                Err(e) => {
                    warn!("to-YUV scaling failed: {e}");
                    None
                }
            };
            deliver(FrameHandle::new(yuv, lease));
        };

        for (stream, packet) in ictx.packets() {
            if cancel.load(Ordering::Relaxed) {
                info!(frame_count, "frame source cancelled");
                return Ok(frame_count);
            }
            if stream.index() != stream_index {
                continue;
            }
            if let Err(e) = decoder.send_packet(&packet) {
                // Live devices occasionally hand out corrupt packets.
                warn!("decoder send_packet: {e}");
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                handle_decoded(&decoded, &mut frame_count);
            }
            if frame_count > 0 && frame_count % 300 == 0 {
                debug!(frame_count, stats = ?gate.stats(), "frame source progress");
            }
        }

        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded).is_ok() {
            handle_decoded(&decoded, &mut frame_count);
        }

        info!(frame_count, "frame source reached end of stream");
        Ok(frame_count)
    }
}

/// Copy the crop window's three planes out of an FFmpeg frame, dropping
/// stride padding. Crop offsets are even, so chroma stays aligned.
fn pack_yuv(scaled: &frame::Video, crop: Crop, rotation: Rotation, pts: Option<i64>) -> YuvFrame {
    let (cw, ch) = YuvFrame::chroma_size(crop.width, crop.height);
    let chroma = Crop {
        x: crop.x / 2,
        y: crop.y / 2,
        width: cw,
        height: ch,
    };
    YuvFrame {
        y: copy_plane(scaled, 0, crop),
        u: copy_plane(scaled, 1, chroma),
        v: copy_plane(scaled, 2, chroma),
        width: crop.width,
        height: crop.height,
        rotation,
        pts: pts.unwrap_or(0),
    }
}

fn copy_plane(frame: &frame::Video, plane: usize, window: Crop) -> Vec<u8> {
    let stride = frame.stride(plane);
    let raw = frame.data(plane);
    let (x, y) = (window.x as usize, window.y as usize);
    let (width, height) = (window.width as usize, window.height as usize);
    let mut out = Vec::with_capacity(width * height);
    for row in y..y + height {
        let start = row * stride + x;
        out.extend_from_slice(&raw[start..start + width]);
    }
    out
}

/// Read the `rotate` tag phones and some webcams attach to the stream.
fn stream_rotation(stream: &format::stream::Stream<'_>) -> Rotation {
    stream
        .metadata()
        .get("rotate")
        .and_then(|r| r.trim().parse::<i32>().ok())
        .and_then(|deg| Rotation::from_degrees(deg).ok())
        .unwrap_or_default()
}

/// Scale `(w, h)` to `target_w` preserving aspect ratio, rounding both sides
/// to even numbers as 4:2:0 requires.
fn scaled_size(w: u32, h: u32, target_w: u32) -> (u32, u32) {
    if w == 0 || h == 0 {
        return (w, h);
    }
    let target_w = (target_w.max(2) / 2) * 2;
    let target_h = ((target_w as f64 * h as f64 / w as f64).round() as u32).max(2);
    (target_w, (target_h / 2) * 2)
}

/// Largest centered window of `aspect` inside `(w, h)`, with even size and
/// even offsets as 4:2:0 requires.
fn center_crop(w: u32, h: u32, aspect: AspectRatio) -> Crop {
    let (w64, h64) = (w as u64, h as u64);
    let (aw, ah) = (aspect.width as u64, aspect.height as u64);
    // Too tall for the aspect: keep full width; otherwise keep full height.
    let (crop_w, crop_h) = if w64 * ah <= h64 * aw {
        (w64, w64 * ah / aw)
    } else {
        (h64 * aw / ah, h64)
    };
    let crop_w = (crop_w as u32) & !1;
    let crop_h = (crop_h as u32) & !1;
    Crop {
        x: ((w - crop_w) / 2) & !1,
        y: ((h - crop_h) / 2) & !1,
        width: crop_w,
        height: crop_h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_skips_while_handle_outstanding() {
        let gate = FrameGate::new();
        let first = gate.offer(None).expect("slot should be free");
        assert!(gate.is_busy());
        assert!(gate.offer(None).is_none());
        assert!(gate.offer(None).is_none());

        first.release();
        assert!(!gate.is_busy());
        assert!(gate.offer(None).is_some());

        assert_eq!(
            gate.stats(),
            GateStats {
                delivered: 2,
                skipped: 2
            }
        );
    }

    #[test]
    fn dropping_a_handle_frees_the_slot() {
        let gate = FrameGate::new();
        {
            let _handle = gate.offer(None).unwrap();
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
    }

    #[test]
    fn detached_handle_carries_frame() {
        let handle = FrameHandle::detached(None);
        assert!(handle.frame().is_none());
    }

    #[test]
    fn scaled_size_keeps_aspect_and_even_dims() {
        assert_eq!(scaled_size(1920, 1080, 640), (640, 360));
        assert_eq!(scaled_size(1280, 720, 641), (640, 360));
        assert_eq!(scaled_size(0, 720, 640), (0, 720));
    }

    #[test]
    fn center_crop_matches_target_aspect() {
        // 4:3 webcam to 16:9: trim top and bottom.
        assert_eq!(
            center_crop(640, 480, AspectRatio::RATIO_16_9),
            Crop {
                x: 0,
                y: 60,
                width: 640,
                height: 360
            }
        );
        // Already 16:9: untouched.
        assert_eq!(
            center_crop(1280, 720, AspectRatio::RATIO_16_9),
            Crop::full(1280, 720)
        );
        // 16:9 to 4:3: trim the sides.
        assert_eq!(
            center_crop(1280, 720, AspectRatio::RATIO_4_3),
            Crop {
                x: 160,
                y: 0,
                width: 960,
                height: 720
            }
        );
    }

    #[test]
    fn center_crop_keeps_even_geometry() {
        // Portrait phone frame, scaled down first.
        let (w, h) = scaled_size(1080, 1920, 322);
        assert_eq!((w, h), (322, 572));
        let crop = center_crop(w, h, AspectRatio::RATIO_16_9);
        assert_eq!((crop.width, crop.height), (322, 180));
        for v in [crop.x, crop.y, crop.width, crop.height] {
            assert_eq!(v % 2, 0, "{crop:?}");
        }
        assert!(crop.y + crop.height <= h);
    }

    #[test]
    fn parses_aspect_ratios() {
        assert_eq!(
            "16:9".parse::<AspectRatio>().unwrap(),
            AspectRatio::RATIO_16_9
        );
        assert_eq!("4 : 3".parse::<AspectRatio>().unwrap().to_string(), "4:3");
        assert!("16x9".parse::<AspectRatio>().is_err());
        assert!("0:9".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn chroma_rounds_up_odd_sizes() {
        assert_eq!(YuvFrame::chroma_size(4, 2), (2, 1));
        assert_eq!(YuvFrame::chroma_size(5, 3), (3, 2));
    }
}
