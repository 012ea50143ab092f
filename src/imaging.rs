//! Pixel-level primitives used by the heuristics.
//!
//! Rectangle arithmetic plus thin measures over `image` crops: intensity
//! statistics, colour histograms, `imageproc` connected components and a
//! Sobel texture measure. They carry no policy and no thresholds.

use image::{GenericImageView, GrayImage, ImageBuffer, Luma};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::Serialize;

use crate::frame::{Frame, NormRect};

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub const fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Map a normalized box onto a `width x height` frame, clamped to bounds.
    /// Edges within `SNAP` of a pixel boundary land on that boundary.
    pub fn from_norm(rect: &NormRect, width: u32, height: u32) -> Self {
        const SNAP: f32 = 1e-3;
        let w = width as f32;
        let h = height as f32;
        let x0 = (rect.x * w + SNAP).floor().clamp(0.0, w) as u32;
        let y0 = (rect.y * h + SNAP).floor().clamp(0.0, h) as u32;
        let x1 = (rect.right() * w - SNAP).ceil().clamp(0.0, w) as u32;
        let y1 = (rect.bottom() * h - SNAP).ceil().clamp(0.0, h) as u32;
        Self::new(x0, y0, x1.max(x0), y1.max(y0))
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Fractional sub-rectangle, e.g. `sub(0.0, 0.4, 0.0, 1.0)` is the left 40%.
    pub fn sub(&self, fx0: f32, fx1: f32, fy0: f32, fy1: f32) -> Self {
        let w = self.width() as f32;
        let h = self.height() as f32;
        let x0 = self.x0 + (w * fx0.clamp(0.0, 1.0)).round() as u32;
        let x1 = self.x0 + (w * fx1.clamp(0.0, 1.0)).round() as u32;
        let y0 = self.y0 + (h * fy0.clamp(0.0, 1.0)).round() as u32;
        let y1 = self.y0 + (h * fy1.clamp(0.0, 1.0)).round() as u32;
        Self::new(x0, y0, x1.max(x0), y1.max(y0))
    }

    /// Central part of the rectangle with `fraction` trimmed from each side.
    pub fn core(&self, fraction: f32) -> Self {
        let f = fraction.clamp(0.0, 0.49);
        self.sub(f, 1.0 - f, f, 1.0 - f)
    }

    /// Grow by a fraction of the own size on every side, clipped to `bounds`.
    pub fn padded(&self, fraction: f32, bounds: &PixelRect) -> Self {
        let dx = (self.width() as f32 * fraction).round() as u32;
        let dy = (self.height() as f32 * fraction).round() as u32;
        Self::new(
            self.x0.saturating_sub(dx).max(bounds.x0),
            self.y0.saturating_sub(dy).max(bounds.y0),
            (self.x1 + dx).min(bounds.x1),
            (self.y1 + dy).min(bounds.y1),
        )
    }

    /// Grow by `px` pixels on every side, clipped to `bounds`.
    pub fn grown(&self, px: u32, bounds: &PixelRect) -> Self {
        Self::new(
            self.x0.saturating_sub(px).max(bounds.x0),
            self.y0.saturating_sub(px).max(bounds.y0),
            (self.x1 + px).min(bounds.x1),
            (self.y1 + px).min(bounds.y1),
        )
    }

    /// Smallest rectangle holding both.
    pub fn union(&self, other: &PixelRect) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    /// Normalized box on a `width x height` frame.
    pub fn to_norm(&self, width: u32, height: u32) -> NormRect {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        NormRect::from_corners(
            self.x0 as f32 / w,
            self.y0 as f32 / h,
            self.x1 as f32 / w,
            self.y1 as f32 / h,
        )
    }

    /// Whether pixel `(x, y)` lies in the ellipse inscribed in this rectangle.
    pub fn ellipse_contains(&self, x: u32, y: u32) -> bool {
        let rx = self.width() as f32 / 2.0;
        let ry = self.height() as f32 / 2.0;
        if rx <= 0.0 || ry <= 0.0 {
            return false;
        }
        let cx = self.x0 as f32 + rx;
        let cy = self.y0 as f32 + ry;
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        dx * dx + dy * dy <= 1.0
    }

    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> {
        let (x0, x1) = (self.x0, self.x1);
        (self.y0..self.y1).flat_map(move |y| (x0..x1).map(move |x| (x, y)))
    }
}

// ----------------------------------------------------------------------------
// Per-pixel measures
// ----------------------------------------------------------------------------

/// HSV saturation in 0..1.
#[inline]
pub fn saturation(p: [u8; 3]) -> f32 {
    let max = p.iter().copied().max().unwrap_or(0) as f32;
    let min = p.iter().copied().min().unwrap_or(0) as f32;
    if max <= 0.0 {
        0.0
    } else {
        (max - min) / max
    }
}

/// Euclidean distance in RGB space.
#[inline]
pub fn color_distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    (dr * dr + dg * dg + db * db).sqrt()
}

pub fn to_f32(p: [u8; 3]) -> [f32; 3] {
    [p[0] as f32, p[1] as f32, p[2] as f32]
}

// ----------------------------------------------------------------------------
// Region statistics
// ----------------------------------------------------------------------------

/// Mean and standard deviation of luma over a pixel set.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IntensityStats {
    pub count: u64,
    pub mean: f32,
    pub std_dev: f32,
}

#[derive(Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn push(&mut self, v: f64) {
        self.count += 1;
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (v - self.mean);
    }

    fn finish(self) -> IntensityStats {
        if self.count == 0 {
            return IntensityStats::default();
        }
        IntensityStats {
            count: self.count,
            mean: self.mean as f32,
            std_dev: (self.m2 / self.count as f64).sqrt() as f32,
        }
    }
}

pub fn intensity_stats(frame: &Frame, rect: &PixelRect) -> IntensityStats {
    intensity_stats_where(frame, rect, |_, _| true)
}

/// Intensity statistics restricted to pixels accepted by `keep`, which sees
/// frame coordinates.
pub fn intensity_stats_where(
    frame: &Frame,
    rect: &PixelRect,
    keep: impl Fn(u32, u32) -> bool,
) -> IntensityStats {
    let mut acc = Welford::default();
    for (x, y, p) in frame.gray_view(rect).pixels() {
        if keep(rect.x0 + x, rect.y0 + y) {
            acc.push(p.0[0] as f64);
        }
    }
    acc.finish()
}

/// Mean RGB colour, `None` for an empty rectangle.
pub fn mean_color(frame: &Frame, rect: &PixelRect) -> Option<[f32; 3]> {
    if rect.is_empty() {
        return None;
    }
    let mut sum = [0f64; 3];
    for (_, _, p) in frame.rgb_view(rect).pixels() {
        for (acc, v) in sum.iter_mut().zip(p.0) {
            *acc += v as f64;
        }
    }
    let n = rect.area() as f64;
    Some(sum.map(|v| (v / n) as f32))
}

/// One bin of a quantized colour histogram.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistogramBin {
    pub count: u64,
    sum: [f64; 3],
}

impl HistogramBin {
    /// Mean colour of the pixels that fell into this bin.
    pub fn mean(&self) -> [f32; 3] {
        if self.count == 0 {
            return [0.0; 3];
        }
        let n = self.count as f64;
        self.sum.map(|v| (v / n) as f32)
    }
}

/// Colour histogram with `levels` buckets per channel.
#[derive(Clone, Debug)]
pub struct ColorHistogram {
    pub bins: Vec<HistogramBin>,
    pub total: u64,
}

pub fn quantized_histogram(frame: &Frame, rect: &PixelRect, levels: u8) -> ColorHistogram {
    let levels = levels.max(1) as usize;
    let q = |v: u8| (v as usize * levels) / 256;
    let mut bins = vec![HistogramBin::default(); levels * levels * levels];
    let mut total = 0u64;
    for (_, _, p) in frame.rgb_view(rect).pixels() {
        let [r, g, b] = p.0;
        let bin = &mut bins[(q(r) * levels + q(g)) * levels + q(b)];
        bin.count += 1;
        for (acc, v) in bin.sum.iter_mut().zip(p.0) {
            *acc += v as f64;
        }
        total += 1;
    }
    ColorHistogram { bins, total }
}

/// A 4-connected component of a binary mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Component {
    /// Label assigned by `connected_components`, starting at 1.
    pub label: u32,
    pub area: u64,
    /// Bounds in frame coordinates.
    pub bounds: PixelRect,
}

impl Component {
    pub fn center_y(&self) -> f32 {
        (self.bounds.y0 + self.bounds.y1) as f32 / 2.0
    }
}

/// Labelled binary mask over one rectangle of a frame.
pub struct LabelledMask {
    origin: PixelRect,
    labels: ImageBuffer<Luma<u32>, Vec<u32>>,
    pub components: Vec<Component>,
}

impl LabelledMask {
    /// Label of the frame pixel `(x, y)`; 0 for background or outside the mask.
    pub fn label_at(&self, x: u32, y: u32) -> u32 {
        if !self.origin.contains(x, y) {
            return 0;
        }
        self.labels.get_pixel(x - self.origin.x0, y - self.origin.y0).0[0]
    }

    /// Largest component; ties keep the lower label.
    pub fn largest(&self) -> Option<Component> {
        self.components
            .iter()
            .copied()
            .reduce(|best, c| if c.area > best.area { c } else { best })
    }
}

/// Label the 4-connected components of the pixels in `rect` accepted by
/// `keep`, which sees frame coordinates.
pub fn label_mask(rect: &PixelRect, keep: impl Fn(u32, u32) -> bool) -> LabelledMask {
    let mask = GrayImage::from_fn(rect.width(), rect.height(), |x, y| {
        Luma([if keep(rect.x0 + x, rect.y0 + y) { 255 } else { 0 }])
    });
    let labels = if rect.is_empty() {
        ImageBuffer::new(0, 0)
    } else {
        connected_components(&mask, Connectivity::Four, Luma([0u8]))
    };

    let mut components: Vec<Component> = Vec::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0];
        if label == 0 {
            continue;
        }
        let (fx, fy) = (rect.x0 + x, rect.y0 + y);
        let idx = label as usize - 1;
        if components.len() <= idx {
            components.resize(
                idx + 1,
                Component {
                    label: 0,
                    area: 0,
                    bounds: PixelRect::new(u32::MAX, u32::MAX, 0, 0),
                },
            );
        }
        let c = &mut components[idx];
        c.label = label;
        c.area += 1;
        c.bounds = PixelRect::new(
            c.bounds.x0.min(fx),
            c.bounds.y0.min(fy),
            c.bounds.x1.max(fx + 1),
            c.bounds.y1.max(fy + 1),
        );
    }
    components.retain(|c| c.area > 0);
    LabelledMask {
        origin: *rect,
        labels,
        components,
    }
}

/// Largest 4-connected component of pixels darker than `cutoff` inside `rect`.
pub fn largest_dark_component(frame: &Frame, rect: &PixelRect, cutoff: f32) -> Option<Component> {
    label_mask(rect, |x, y| frame.luma_at(x, y) < cutoff).largest()
}

/// Mean absolute Sobel response over `rect`, scaled to luma change per pixel.
///
/// The filter runs on a crop grown by one pixel where the frame allows it, so
/// the rectangle's own edge pixels see their real neighbours.
pub fn sobel_texture(frame: &Frame, rect: &PixelRect) -> f32 {
    if rect.width() < 2 || rect.height() < 2 {
        return 0.0;
    }
    let outer = rect.grown(1, &frame.bounds());
    let patch = frame.gray_view(&outer).to_image();
    let gx = horizontal_sobel(&patch);
    let gy = vertical_sobel(&patch);
    let sum: f64 = rect
        .pixels()
        .map(|(x, y)| {
            let (px, py) = (x - outer.x0, y - outer.y0);
            (gx.get_pixel(px, py).0[0] as f64).abs() + (gy.get_pixel(px, py).0[0] as f64).abs()
        })
        .sum();
    (sum / (8.0 * rect.area() as f64)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 3]) -> Frame {
        Frame::from_fn(width, height, paint)
    }

    #[test]
    fn from_norm_clamps_to_frame() {
        let r = PixelRect::from_norm(&NormRect::new(-0.2, 0.5, 2.0, 0.8), 100, 50);
        assert_eq!(r, PixelRect::new(0, 25, 100, 50));
    }

    #[test]
    fn sub_and_core_stay_inside() {
        let r = PixelRect::new(10, 10, 110, 60);
        assert_eq!(r.sub(0.0, 0.5, 0.0, 1.0), PixelRect::new(10, 10, 60, 60));
        let core = r.core(0.25);
        assert_eq!(core, PixelRect::new(35, 23, 85, 48));
    }

    #[test]
    fn intensity_stats_of_two_tone_patch() {
        let frame = frame_with(4, 1, |x, _| if x < 2 { [0, 0, 0] } else { [200, 200, 200] });
        let stats = intensity_stats(&frame, &PixelRect::new(0, 0, 4, 1));
        assert_eq!(stats.count, 4);
        assert!((stats.mean - 100.0).abs() < 0.01);
        assert!((stats.std_dev - 100.0).abs() < 0.01);
    }

    #[test]
    fn histogram_groups_similar_colors() {
        let frame = frame_with(10, 1, |x, _| if x < 7 { [250, 5, 5] } else { [5, 5, 250] });
        let hist = quantized_histogram(&frame, &PixelRect::new(0, 0, 10, 1), 4);
        assert_eq!(hist.total, 10);
        let mut counts: Vec<u64> = hist.bins.iter().map(|b| b.count).filter(|c| *c > 0).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![3, 7]);
    }

    #[test]
    fn largest_component_picks_biggest_blob() {
        let frame = frame_with(20, 10, |x, y| {
            let small = x < 2 && y < 2;
            let big = (10..16).contains(&x) && (3..8).contains(&y);
            if small || big {
                [10, 10, 10]
            } else {
                [220, 220, 220]
            }
        });
        let comp = largest_dark_component(&frame, &PixelRect::new(0, 0, 20, 10), 100.0).unwrap();
        assert_eq!(comp.area, 30);
        assert_eq!(comp.bounds, PixelRect::new(10, 3, 16, 8));
    }

    #[test]
    fn no_dark_pixels_means_no_component() {
        let frame = frame_with(5, 5, |_, _| [255, 255, 255]);
        assert!(largest_dark_component(&frame, &PixelRect::new(0, 0, 5, 5), 100.0).is_none());
    }

    #[test]
    fn components_are_labelled_in_raster_order() {
        let frame = frame_with(12, 4, |x, _| if x < 3 || x > 8 { [0, 0, 0] } else { [255; 3] });
        let mask = label_mask(&frame.bounds(), |x, y| frame.luma_at(x, y) < 100.0);
        assert_eq!(mask.components.len(), 2);
        assert_eq!(mask.components[0].bounds, PixelRect::new(0, 0, 3, 4));
        assert_eq!(mask.label_at(1, 1), mask.components[0].label);
        assert_eq!(mask.label_at(5, 1), 0);
        // Equal areas: the first labelled component wins.
        assert_eq!(mask.largest(), Some(mask.components[0]));
    }

    #[test]
    fn component_bounds_are_in_frame_coordinates() {
        let frame = frame_with(10, 10, |x, y| {
            if (6..8).contains(&x) && (5..9).contains(&y) {
                [10, 10, 10]
            } else {
                [200, 200, 200]
            }
        });
        let comp = largest_dark_component(&frame, &PixelRect::new(4, 4, 10, 10), 100.0).unwrap();
        assert_eq!(comp.area, 8);
        assert_eq!(comp.bounds, PixelRect::new(6, 5, 8, 9));
    }

    #[test]
    fn texture_is_zero_on_flat_patch() {
        let frame = frame_with(8, 8, |_, _| [90, 90, 90]);
        assert_eq!(sobel_texture(&frame, &PixelRect::new(0, 0, 8, 8)), 0.0);
    }

    #[test]
    fn texture_of_stripes_is_their_step_per_pixel() {
        // Two-pixel stripes: every pixel's horizontal neighbours differ by 160.
        let frame = frame_with(12, 6, |x, _| if (x / 2) % 2 == 0 { [40; 3] } else { [200; 3] });
        let texture = sobel_texture(&frame, &PixelRect::new(2, 1, 10, 5));
        assert!((texture - 80.0).abs() < 1e-3, "texture {}", texture);
    }

    #[test]
    fn union_and_to_norm() {
        let a = PixelRect::new(0, 0, 10, 10);
        let b = PixelRect::new(5, 20, 15, 30);
        assert_eq!(a.union(&b), PixelRect::new(0, 0, 15, 30));
        assert_eq!(PixelRect::new(0, 0, 0, 0).union(&b), b);
        let n = b.to_norm(100, 100);
        assert!((n.x - 0.05).abs() < 1e-6 && (n.bottom() - 0.30).abs() < 1e-6);
    }

    #[test]
    fn ellipse_contains_center_not_corner() {
        let r = PixelRect::new(0, 0, 20, 10);
        assert!(r.ellipse_contains(10, 5));
        assert!(!r.ellipse_contains(0, 0));
    }
}
