//! Region extraction.
//!
//! Every heuristic reads pixels through a named `Region`; none of them crop
//! the frame on their own. Regions are landmark-anchored when the detectors
//! supplied coordinates and fall back to fixed frame fractions otherwise.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::RegionConfig;
use crate::frame::{DetectionContext, Frame, NormPoint, NormRect, PoseKeypoints};
use crate::imaging::PixelRect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionName {
    Head,
    /// Band above the expected hairline, used for hats.
    Crown,
    EyeBand,
    Torso,
    LeftArm,
    RightArm,
    LowerBody,
    BagLeft,
    BagRight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionShape {
    Rect,
    /// Ellipse inscribed in the bounding box.
    Ellipse,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Region {
    pub name: RegionName,
    pub shape: RegionShape,
    /// Normalized bounds, already clamped to the unit square.
    pub bounds: NormRect,
    /// Pixel bounds on the frame the region was extracted from.
    pub pixels: PixelRect,
}

impl Region {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        match self.shape {
            RegionShape::Rect => self.pixels.contains(x, y),
            RegionShape::Ellipse => {
                self.pixels.contains(x, y) && self.pixels.ellipse_contains(x, y)
            }
        }
    }
}

pub type RegionMap = BTreeMap<RegionName, Region>;

// Fixed layout used when no landmark is available.
const FIXED_HEAD: NormRect = NormRect::new(0.35, 0.0, 0.30, 0.25);
const FIXED_CROWN: NormRect = NormRect::new(0.35, 0.0, 0.30, 0.10);
const FIXED_EYE_BAND: NormRect = NormRect::new(0.40, 0.10, 0.20, 0.0375);
const FIXED_TORSO: NormRect = NormRect::new(0.25, 0.25, 0.50, 0.35);
const FIXED_LEFT_ARM: NormRect = NormRect::new(0.10, 0.25, 0.15, 0.35);
const FIXED_RIGHT_ARM: NormRect = NormRect::new(0.75, 0.25, 0.15, 0.35);

/// Padding around keypoint bounding boxes.
const KEYPOINT_PAD: f32 = 0.04;
/// Torso height assumed when hips are not visible.
const TORSO_WITHOUT_HIPS: f32 = 0.35;

#[derive(Default)]
struct Layout {
    head: Option<NormRect>,
    crown: Option<NormRect>,
    eye_band: Option<NormRect>,
    torso: Option<NormRect>,
    left_arm: Option<NormRect>,
    right_arm: Option<NormRect>,
    lower_body: Option<NormRect>,
}

pub struct RegionExtractor {
    config: RegionConfig,
}

impl RegionExtractor {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Derive the region map for one frame. Empty when neither face nor pose
    /// was detected.
    pub fn extract(&self, frame: &Frame, ctx: &DetectionContext) -> RegionMap {
        let mut map = RegionMap::new();
        if frame.is_empty() || !ctx.person_detected() {
            return map;
        }

        let mut layout = Layout::default();
        if ctx.face_detected {
            let (head, crown, eye_band) = match ctx.face() {
                Some(face) => face_anchored(face),
                None => (FIXED_HEAD, FIXED_CROWN, FIXED_EYE_BAND),
            };
            layout.head = Some(head);
            layout.crown = Some(crown);
            layout.eye_band = Some(eye_band);
        }
        if ctx.pose_detected {
            let kp = ctx.keypoints();
            let torso = kp.and_then(torso_from_keypoints).unwrap_or(FIXED_TORSO);
            layout.left_arm = Some(
                kp.and_then(|k| arm_from_keypoints(k.left_shoulder, k.left_elbow, k.left_wrist))
                    .unwrap_or(FIXED_LEFT_ARM),
            );
            layout.right_arm = Some(
                kp.and_then(|k| {
                    arm_from_keypoints(k.right_shoulder, k.right_elbow, k.right_wrist)
                })
                .unwrap_or(FIXED_RIGHT_ARM),
            );
            layout.lower_body = Some(NormRect::from_corners(
                torso.x,
                torso.bottom(),
                torso.right(),
                1.0,
            ));
            layout.torso = Some(torso);
            if layout.head.is_none() {
                layout.head = Some(kp.and_then(head_from_keypoints).unwrap_or(FIXED_HEAD));
            }
        }

        self.separate(&mut layout);

        let (w, h) = (frame.width(), frame.height());
        let mut put = |name, shape, rect: Option<NormRect>| {
            if let Some(rect) = rect {
                let bounds = rect.clamped();
                let pixels = PixelRect::from_norm(&bounds, w, h);
                if pixels.area() >= self.config.min_region_px.max(1) as u64 {
                    map.insert(
                        name,
                        Region {
                            name,
                            shape,
                            bounds,
                            pixels,
                        },
                    );
                }
            }
        };

        put(RegionName::Head, RegionShape::Rect, layout.head);
        put(RegionName::Crown, RegionShape::Ellipse, layout.crown);
        put(RegionName::EyeBand, RegionShape::Rect, layout.eye_band);
        put(RegionName::Torso, RegionShape::Rect, layout.torso);
        put(RegionName::LeftArm, RegionShape::Rect, layout.left_arm);
        put(RegionName::RightArm, RegionShape::Rect, layout.right_arm);
        put(RegionName::LowerBody, RegionShape::Rect, layout.lower_body);

        if let Some(torso) = layout.torso {
            let body = [Some(torso), layout.left_arm, layout.right_arm];
            let body = body.iter().flatten().map(NormRect::clamped);
            let (left, right) = body.fold((1.0f32, 0.0f32), |(l, r), b| {
                (l.min(b.x), r.max(b.right()))
            });
            let (top, bottom) = (self.config.bag_band_top, self.config.bag_band_bottom);
            put(
                RegionName::BagLeft,
                RegionShape::Rect,
                Some(NormRect::from_corners(0.0, top, left, bottom)),
            );
            put(
                RegionName::BagRight,
                RegionShape::Rect,
                Some(NormRect::from_corners(right, top, 1.0, bottom)),
            );
        }

        log::debug!(
            "extracted {} regions (face={}, pose={})",
            map.len(),
            ctx.face_detected,
            ctx.pose_detected
        );
        map
    }

    /// Keep the head family, torso and lower body at least one margin apart.
    fn separate(&self, layout: &mut Layout) {
        let margin = self.config.separation_margin;
        let Some(mut torso) = layout.torso else {
            return;
        };

        if let Some(head) = layout.head {
            // The head gives up at most its lower half, the torso at most its
            // upper half.
            let head_bottom = head.bottom().min((torso.y - margin).max(head.y + head.h / 2.0));
            let top = (head_bottom + margin)
                .max(torso.y)
                .min(torso.y + torso.h / 2.0);
            torso = with_top(&torso, top);
            let floor = torso.y - margin;
            layout.head = layout.head.map(|r| clip_bottom(&r, floor));
            layout.crown = layout.crown.map(|r| clip_bottom(&r, floor));
            layout.eye_band = layout.eye_band.map(|r| clip_bottom(&r, floor));

            let arm_top = floor.min(head.bottom()) + margin;
            layout.left_arm = layout.left_arm.map(|r| with_top(&r, r.y.max(arm_top)));
            layout.right_arm = layout.right_arm.map(|r| with_top(&r, r.y.max(arm_top)));
        }

        layout.lower_body = layout
            .lower_body
            .map(|r| with_top(&r, r.y.max(torso.bottom() + margin)));
        layout.torso = Some(torso);
    }
}

fn face_anchored(face: &NormRect) -> (NormRect, NormRect, NormRect) {
    let head = NormRect::new(
        face.x - 0.15 * face.w,
        face.y - 0.5 * face.h,
        1.3 * face.w,
        1.5 * face.h,
    );
    let crown = NormRect::from_corners(
        face.x - 0.1 * face.w,
        head.y,
        face.right() + 0.1 * face.w,
        face.y + 0.15 * face.h,
    );
    let eye_band = NormRect::new(face.x, face.y + 0.30 * face.h, face.w, 0.22 * face.h);
    (head, crown, eye_band)
}

fn head_from_keypoints(k: &PoseKeypoints) -> Option<NormRect> {
    let nose = k.nose?;
    let shoulder_y = [k.left_shoulder, k.right_shoulder]
        .iter()
        .flatten()
        .map(|p| p.y)
        .reduce(f32::min)?;
    let drop = shoulder_y - nose.y;
    if drop <= 0.0 {
        return None;
    }
    let span = match (k.left_shoulder, k.right_shoulder) {
        (Some(l), Some(r)) => (r.x - l.x).abs(),
        _ => 0.0,
    };
    let half_w = (span * 0.25).max(drop * 0.6);
    Some(NormRect::from_corners(
        nose.x - half_w,
        nose.y - drop,
        nose.x + half_w,
        nose.y + drop * 0.5,
    ))
}

fn torso_from_keypoints(k: &PoseKeypoints) -> Option<NormRect> {
    let (ls, rs) = (k.left_shoulder?, k.right_shoulder?);
    let hips: Vec<NormPoint> = [k.left_hip, k.right_hip].into_iter().flatten().collect();
    let xs = [ls.x, rs.x].into_iter().chain(hips.iter().map(|p| p.x));
    let (x0, x1) = xs.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| {
        (lo.min(x), hi.max(x))
    });
    let y0 = ls.y.min(rs.y) - KEYPOINT_PAD;
    let y1 = hips
        .iter()
        .map(|p| p.y)
        .reduce(f32::max)
        .unwrap_or(y0 + TORSO_WITHOUT_HIPS);
    if y1 <= y0 {
        return None;
    }
    Some(NormRect::from_corners(
        x0 - KEYPOINT_PAD,
        y0,
        x1 + KEYPOINT_PAD,
        y1,
    ))
}

fn arm_from_keypoints(
    shoulder: Option<NormPoint>,
    elbow: Option<NormPoint>,
    wrist: Option<NormPoint>,
) -> Option<NormRect> {
    let shoulder = shoulder?;
    if elbow.is_none() && wrist.is_none() {
        return None;
    }
    let points = [Some(shoulder), elbow, wrist];
    let points = points.iter().flatten();
    let (mut x0, mut y0, mut x1, mut y1) = (shoulder.x, shoulder.y, shoulder.x, shoulder.y);
    for p in points {
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }
    Some(NormRect::from_corners(
        x0 - KEYPOINT_PAD,
        y0 - KEYPOINT_PAD,
        x1 + KEYPOINT_PAD,
        y1 + KEYPOINT_PAD,
    ))
}

fn with_top(r: &NormRect, y0: f32) -> NormRect {
    NormRect::from_corners(r.x, y0, r.right(), r.bottom())
}

fn clip_bottom(r: &NormRect, y1: f32) -> NormRect {
    NormRect::from_corners(r.x, r.y, r.right(), r.bottom().min(y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::from_rgb(w, h, vec![128u8; (w * h * 3) as usize]).unwrap()
    }

    fn extractor() -> RegionExtractor {
        RegionExtractor::new(&RegionConfig::default())
    }

    #[test]
    fn no_person_gives_empty_map() {
        let map = extractor().extract(&frame(64, 48), &DetectionContext::none());
        assert!(map.is_empty());
    }

    #[test]
    fn face_only_yields_head_family() {
        let ctx = DetectionContext::none().with_face(Some(NormRect::new(0.4, 0.3, 0.2, 0.25)));
        let map = extractor().extract(&frame(320, 240), &ctx);
        let names: Vec<_> = map.keys().copied().collect();
        assert_eq!(
            names,
            vec![RegionName::Head, RegionName::Crown, RegionName::EyeBand]
        );
        assert_eq!(map[&RegionName::Crown].shape, RegionShape::Ellipse);
        let crown = map[&RegionName::Crown].pixels;
        assert!((121..=122).contains(&crown.x0) && (198..=199).contains(&crown.x1));
        assert!((41..=42).contains(&crown.y0) && (81..=82).contains(&crown.y1));
    }

    #[test]
    fn pose_without_keypoints_uses_fixed_fractions() {
        let ctx = DetectionContext::none().with_pose(None);
        let map = extractor().extract(&frame(640, 480), &ctx);
        let torso = &map[&RegionName::Torso];
        assert!((torso.bounds.x - 0.25).abs() < EPS);
        assert!((torso.bounds.right() - 0.75).abs() < EPS);
        assert!((torso.bounds.y - 0.25).abs() < EPS);
        assert!(map.contains_key(&RegionName::Head));
        assert!(!map.contains_key(&RegionName::Crown));
        let left = &map[&RegionName::BagLeft];
        assert!((left.bounds.right() - 0.10).abs() < EPS);
        assert!((left.bounds.y - 0.30).abs() < EPS);
        assert!((left.bounds.bottom() - 0.70).abs() < EPS);
    }

    #[test]
    fn regions_are_clamped_to_frame() {
        let ctx = DetectionContext::none()
            .with_face(Some(NormRect::new(-0.1, -0.1, 0.5, 0.3)))
            .with_pose(None);
        let f = frame(100, 80);
        for region in extractor().extract(&f, &ctx).values() {
            assert!(region.pixels.x1 <= 100 && region.pixels.y1 <= 80);
            assert!(region.bounds.x >= 0.0 && region.bounds.right() <= 1.0);
            assert!(region.bounds.y >= 0.0 && region.bounds.bottom() <= 1.0);
        }
    }

    #[test]
    fn head_torso_and_lower_body_keep_margin() {
        // Face low enough that the raw head box would run into the torso.
        let ctx = DetectionContext::none()
            .with_face(Some(NormRect::new(0.4, 0.2, 0.2, 0.2)))
            .with_pose(None);
        let map = extractor().extract(&frame(400, 400), &ctx);
        let margin = RegionConfig::default().separation_margin;
        let head = map[&RegionName::Head].bounds;
        let torso = map[&RegionName::Torso].bounds;
        let lower = map[&RegionName::LowerBody].bounds;
        assert!(head.bottom() + margin <= torso.y + EPS);
        assert!(torso.bottom() + margin <= lower.y + EPS);
        for arm in [RegionName::LeftArm, RegionName::RightArm] {
            assert!(head.bottom() + margin <= map[&arm].bounds.y + EPS);
        }
    }

    #[test]
    fn keypoints_anchor_torso_arms_and_head() {
        let pose = PoseKeypoints {
            nose: Some(NormPoint::new(0.5, 0.15)),
            left_shoulder: Some(NormPoint::new(0.38, 0.28)),
            right_shoulder: Some(NormPoint::new(0.62, 0.28)),
            left_elbow: Some(NormPoint::new(0.36, 0.42)),
            right_elbow: Some(NormPoint::new(0.64, 0.42)),
            left_wrist: Some(NormPoint::new(0.37, 0.55)),
            right_wrist: Some(NormPoint::new(0.63, 0.55)),
            left_hip: Some(NormPoint::new(0.41, 0.60)),
            right_hip: Some(NormPoint::new(0.59, 0.60)),
        };
        let ctx = DetectionContext::none().with_pose(Some(pose));
        let map = extractor().extract(&frame(640, 480), &ctx);
        let torso = map[&RegionName::Torso].bounds;
        assert!((torso.x - 0.34).abs() < EPS);
        assert!((torso.bottom() - 0.60).abs() < EPS);
        let left_arm = map[&RegionName::LeftArm].bounds;
        assert!((left_arm.x - 0.32).abs() < EPS);
        let bag = &map[&RegionName::BagLeft];
        assert!((bag.bounds.right() - 0.32).abs() < EPS);
        let head = map[&RegionName::Head].bounds;
        assert!(head.bottom() < torso.y);
    }

    #[test]
    fn ellipse_region_excludes_corners() {
        let ctx = DetectionContext::none().with_face(Some(NormRect::new(0.4, 0.3, 0.2, 0.25)));
        let map = extractor().extract(&frame(320, 240), &ctx);
        let crown = &map[&RegionName::Crown];
        assert!(!crown.contains(crown.pixels.x0, crown.pixels.y0));
        assert!(crown.contains(160, 61));
    }
}
