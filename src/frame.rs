//! Frame isolation layer.
//!
//! - `Frame`: immutable RGB image shared by every heuristic of one analysis call.
//!   Pixels are private and never mutated; cloning only bumps reference counts.
//! - `DetectionContext`: what the upstream face/pose detectors reported.
//!
//! Heuristics read pixels through `Frame::pixel`/`Frame::luma_at` or through
//! read-only crops; there is no mutable accessor and no byte export.

use anyhow::{Context, Result};
use image::{imageops, GrayImage, Rgb, RgbImage, SubImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::AnalysisError;
use crate::imaging::PixelRect;

/// Bytes per pixel (RGB, 8-bit).
pub const CHANNELS: usize = 3;

/// Immutable 2-D RGB pixel buffer plus its luma plane.
///
/// Explicitly no `AsRef<[u8]>` and no mutable access: every heuristic sees the
/// same pixels for the lifetime of the call.
#[derive(Clone)]
pub struct Frame {
    rgb: Arc<RgbImage>,
    gray: Arc<GrayImage>,
}

impl Frame {
    fn from_buffer(rgb: RgbImage) -> Self {
        let gray = imageops::grayscale(&rgb);
        Self {
            rgb: Arc::new(rgb),
            gray: Arc::new(gray),
        }
    }

    /// Wrap a tightly packed RGB24 buffer.
    ///
    /// Zero-sized frames are representable so that callers get a typed
    /// `InvalidInput` from `Analyzer::analyze` instead of a panic here.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, AnalysisError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| AnalysisError::input("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(AnalysisError::input(format!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            )));
        }
        let rgb = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| AnalysisError::input("RGB buffer does not fit its dimensions"))?;
        Ok(Self::from_buffer(rgb))
    }

    /// Frame whose pixel at `(x, y)` is `paint(x, y)`.
    pub fn from_fn(width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 3]) -> Self {
        Self::from_buffer(RgbImage::from_fn(width, height, |x, y| Rgb(paint(x, y))))
    }

    /// Convert a decoded image into a frame.
    pub fn from_image(img: &image::DynamicImage) -> Self {
        Self::from_buffer(img.to_rgb8())
    }

    /// Decode an image file (JPEG/PNG) from local disk.
    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        Ok(Self::from_image(&img))
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whole-frame pixel bounds.
    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width(), self.height())
    }

    /// RGB value at `(x, y)`. Callers stay inside region bounds, which are
    /// clamped to the frame by the region extractor.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.rgb.get_pixel(x, y).0
    }

    #[inline]
    pub fn luma_at(&self, x: u32, y: u32) -> f32 {
        self.gray.get_pixel(x, y).0[0] as f32
    }

    /// Read-only RGB crop.
    pub fn rgb_view(&self, rect: &PixelRect) -> SubImage<&RgbImage> {
        imageops::crop_imm(&*self.rgb, rect.x0, rect.y0, rect.width(), rect.height())
    }

    /// Read-only luma crop.
    pub fn gray_view(&self, rect: &PixelRect) -> SubImage<&GrayImage> {
        imageops::crop_imm(&*self.gray, rect.x0, rect.y0, rect.width(), rect.height())
    }

    /// Non-invertible fingerprint used to correlate log lines and stored
    /// profiles with the frame that produced them.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.width().to_le_bytes());
        hasher.update(self.height().to_le_bytes());
        hasher.update(self.rgb.as_raw());
        hasher.finalize().into()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Detection context
// ----------------------------------------------------------------------------

/// Axis-aligned box in normalized (0..1) frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl NormRect {
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build from corner coordinates; inverted corners give an empty box.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x: x0,
            y: y0,
            w: (x1 - x0).max(0.0),
            h: (y1 - y0).max(0.0),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection with the unit square.
    pub fn clamped(&self) -> Self {
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = self.right().clamp(0.0, 1.0);
        let y1 = self.bottom().clamp(0.0, 1.0);
        Self::from_corners(x0, y0, x1, y1)
    }

    pub fn intersection_area(&self, other: &NormRect) -> f32 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        w * h
    }

    /// Overlap as a fraction of the smaller box.
    pub fn overlap_fraction(&self, other: &NormRect) -> f32 {
        let smaller = self.area().min(other.area());
        if smaller <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / smaller
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }
}

/// Point in normalized frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: f32,
    pub y: f32,
}

impl NormPoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Upper-body pose keypoints; each is optional because detectors drop
/// occluded joints. `left_*` is the joint on the left side of the image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseKeypoints {
    pub nose: Option<NormPoint>,
    pub left_shoulder: Option<NormPoint>,
    pub right_shoulder: Option<NormPoint>,
    pub left_elbow: Option<NormPoint>,
    pub right_elbow: Option<NormPoint>,
    pub left_wrist: Option<NormPoint>,
    pub right_wrist: Option<NormPoint>,
    pub left_hip: Option<NormPoint>,
    pub right_hip: Option<NormPoint>,
}

impl PoseKeypoints {
    fn points(&self) -> impl Iterator<Item = &NormPoint> {
        [
            &self.nose,
            &self.left_shoulder,
            &self.right_shoulder,
            &self.left_elbow,
            &self.right_elbow,
            &self.left_wrist,
            &self.right_wrist,
            &self.left_hip,
            &self.right_hip,
        ]
        .into_iter()
        .flatten()
    }
}

/// Upstream detector output for one frame.
///
/// Presence flags are authoritative: coordinates supplied alongside a `false`
/// flag are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionContext {
    pub face_detected: bool,
    pub face_box: Option<NormRect>,
    pub pose_detected: bool,
    pub pose: Option<PoseKeypoints>,
}

impl DetectionContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_face(mut self, face_box: Option<NormRect>) -> Self {
        self.face_detected = true;
        self.face_box = face_box;
        self
    }

    pub fn with_pose(mut self, pose: Option<PoseKeypoints>) -> Self {
        self.pose_detected = true;
        self.pose = pose;
        self
    }

    pub fn person_detected(&self) -> bool {
        self.face_detected || self.pose_detected
    }

    /// Face box, only when the face flag is set.
    pub fn face(&self) -> Option<&NormRect> {
        if self.face_detected {
            self.face_box.as_ref()
        } else {
            None
        }
    }

    /// Keypoints, only when the pose flag is set.
    pub fn keypoints(&self) -> Option<&PoseKeypoints> {
        if self.pose_detected {
            self.pose.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn validate(&self) -> Result<(), AnalysisError> {
        if let Some(b) = &self.face_box {
            if !b.is_finite() {
                return Err(AnalysisError::input("face box has non-finite coordinates"));
            }
            if b.w < 0.0 || b.h < 0.0 {
                return Err(AnalysisError::input("face box has negative size"));
            }
        }
        if let Some(pose) = &self.pose {
            if pose.points().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                return Err(AnalysisError::input(
                    "pose keypoints have non-finite coordinates",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(2, 2, vec![0u8; 12]).is_ok());
        let err = Frame::from_rgb(2, 2, vec![0u8; 11]).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidInput(_)));
    }

    #[test]
    fn zero_sized_frame_is_representable_but_empty() {
        let frame = Frame::from_rgb(0, 0, Vec::new()).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn pixel_reads_row_major_rgb() {
        let mut data = vec![0u8; 2 * 2 * 3];
        data[9..12].copy_from_slice(&[10, 20, 30]);
        let frame = Frame::from_rgb(2, 2, data).unwrap();
        assert_eq!(frame.pixel(1, 1), [10, 20, 30]);
        assert_eq!(frame.pixel(0, 0), [0, 0, 0]);
    }

    #[test]
    fn luma_plane_matches_gray_pixels() {
        let frame = Frame::from_rgb(2, 1, vec![200, 200, 200, 40, 40, 40]).unwrap();
        assert_eq!(frame.luma_at(0, 0), 200.0);
        assert_eq!(frame.luma_at(1, 0), 40.0);
    }

    #[test]
    fn views_are_crops_in_frame_coordinates() {
        use image::GenericImageView;
        let frame = Frame::from_fn(6, 4, |x, y| [x as u8, y as u8, 0]);
        let view = frame.rgb_view(&PixelRect::new(2, 1, 5, 3));
        assert_eq!(view.dimensions(), (3, 2));
        assert_eq!(view.get_pixel(0, 0).0, [2, 1, 0]);
        assert_eq!(frame.gray_view(&frame.bounds()).dimensions(), (6, 4));
    }

    #[test]
    fn debug_does_not_print_pixels() {
        let frame = Frame::from_rgb(1, 1, vec![1, 2, 3]).unwrap();
        let text = format!("{:?}", frame);
        assert!(text.contains("width: 1"));
        assert!(!text.contains("data"));
    }

    #[test]
    fn digest_tracks_content_and_shape() {
        let a = Frame::from_rgb(1, 2, vec![0u8; 6]).unwrap();
        let b = Frame::from_rgb(2, 1, vec![0u8; 6]).unwrap();
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn overlap_fraction_uses_smaller_box() {
        let big = NormRect::new(0.0, 0.0, 1.0, 1.0);
        let small = NormRect::new(0.25, 0.25, 0.1, 0.1);
        assert!((big.overlap_fraction(&small) - 1.0).abs() < 1e-6);
        let apart = NormRect::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(small.overlap_fraction(&apart), 0.0);
    }

    #[test]
    fn context_flags_gate_coordinates() {
        let ctx = DetectionContext {
            face_detected: false,
            face_box: Some(NormRect::new(0.1, 0.1, 0.2, 0.2)),
            ..DetectionContext::default()
        };
        assert!(ctx.face().is_none());
        assert!(!ctx.person_detected());
    }

    #[test]
    fn context_rejects_non_finite_coordinates() {
        let ctx = DetectionContext::none().with_face(Some(NormRect::new(f32::NAN, 0.0, 0.1, 0.1)));
        assert!(ctx.validate().is_err());
        let ctx = DetectionContext::none().with_pose(Some(PoseKeypoints {
            nose: Some(NormPoint::new(0.5, f32::INFINITY)),
            ..PoseKeypoints::default()
        }));
        assert!(ctx.validate().is_err());
    }
}
