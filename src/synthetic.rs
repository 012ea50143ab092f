//! Deterministic synthetic scenes.
//!
//! Flat-colour shapes painted onto a background, paired with the detection
//! context an upstream detector would report for them. Used by the demo
//! binary and the integration tests; no randomness.

use crate::frame::{DetectionContext, Frame, NormRect};

pub const BACKGROUND: [u8; 3] = [215, 215, 215];
pub const SKIN: [u8; 3] = [200, 160, 130];
pub const DARK: [u8; 3] = [25, 25, 30];
pub const NAVY: [u8; 3] = [30, 45, 100];

/// Face box used by the face-anchored scenes.
pub const SCENE_FACE: NormRect = NormRect::new(0.40, 0.30, 0.20, 0.25);

#[derive(Clone, Copy, Debug)]
enum Shape {
    Rect(NormRect),
    /// Centre and radii in pixels.
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
}

impl Shape {
    fn covers(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        match *self {
            Shape::Rect(r) => {
                let (fx, fy) = (x as f32 / width as f32, y as f32 / height as f32);
                (r.x..r.right()).contains(&fx) && (r.y..r.bottom()).contains(&fy)
            }
            Shape::Ellipse { cx, cy, rx, ry } => {
                let dx = (x as f32 + 0.5 - cx) / rx;
                let dy = (y as f32 + 0.5 - cy) / ry;
                dx * dx + dy * dy <= 1.0
            }
        }
    }
}

/// Paints shapes in order; later shapes cover earlier ones.
#[derive(Clone, Debug)]
pub struct SceneBuilder {
    width: u32,
    height: u32,
    background: [u8; 3],
    layers: Vec<(Shape, [u8; 3])>,
}

impl SceneBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: BACKGROUND,
            layers: Vec::new(),
        }
    }

    pub fn background(mut self, rgb: [u8; 3]) -> Self {
        self.background = rgb;
        self
    }

    /// Axis-aligned box in normalized coordinates.
    pub fn rect(mut self, rect: NormRect, rgb: [u8; 3]) -> Self {
        self.layers.push((Shape::Rect(rect), rgb));
        self
    }

    /// Filled ellipse; centre and radii in pixels.
    pub fn ellipse(mut self, cx: f32, cy: f32, rx: f32, ry: f32, rgb: [u8; 3]) -> Self {
        self.layers.push((Shape::Ellipse { cx, cy, rx, ry }, rgb));
        self
    }

    pub fn build(&self) -> Frame {
        Frame::from_fn(self.width, self.height, |x, y| {
            self.layers
                .iter()
                .rev()
                .find(|(shape, _)| shape.covers(x, y, self.width, self.height))
                .map_or(self.background, |(_, rgb)| *rgb)
        })
    }
}

/// A named scene plus its detection context.
#[derive(Clone, Debug)]
pub struct Scene {
    pub name: &'static str,
    pub frame: Frame,
    pub context: DetectionContext,
}

/// Face only, with a dark ellipse resting above the hairline.
pub fn hat_wearer() -> Scene {
    let frame = SceneBuilder::new(320, 240)
        .rect(SCENE_FACE, SKIN)
        .ellipse(160.0, 61.5, 38.4, 19.5, DARK)
        .build();
    Scene {
        name: "hat_wearer",
        frame,
        context: DetectionContext::none().with_face(Some(SCENE_FACE)),
    }
}

fn jacket_frame() -> Frame {
    SceneBuilder::new(160, 120)
        .rect(NormRect::new(0.25, 0.25, 0.50, 0.60), NAVY)
        .rect(NormRect::new(0.10, 0.25, 0.15, 0.35), NAVY)
        .rect(NormRect::new(0.75, 0.25, 0.15, 0.35), NAVY)
        .build()
}

/// Pose without keypoints, long navy jacket with sleeves.
pub fn jacket_wearer() -> Scene {
    Scene {
        name: "jacket_wearer",
        frame: jacket_frame(),
        context: DetectionContext::none().with_pose(None),
    }
}

/// The jacket scene with both detectors firing, so every category is evaluated.
pub fn full_evidence() -> Scene {
    Scene {
        name: "full_evidence",
        frame: jacket_frame(),
        context: DetectionContext::none().with_face(None).with_pose(None),
    }
}

/// Dark blob in the left bag zone of the fixed layout.
pub fn backpack_carrier() -> Scene {
    let frame = SceneBuilder::new(640, 480)
        .background([220, 220, 220])
        .rect(
            NormRect::new(4.0 / 640.0, 150.0 / 480.0, 56.0 / 640.0, 180.0 / 480.0),
            [30, 30, 30],
        )
        .build();
    Scene {
        name: "backpack_carrier",
        frame,
        context: DetectionContext::none().with_pose(None),
    }
}

/// Nobody in front of the kiosk.
pub fn empty_kiosk() -> Scene {
    Scene {
        name: "empty_kiosk",
        frame: SceneBuilder::new(160, 120).build(),
        context: DetectionContext::none(),
    }
}

pub fn all_scenes() -> Vec<Scene> {
    vec![
        hat_wearer(),
        jacket_wearer(),
        full_evidence(),
        backpack_carrier(),
        empty_kiosk(),
    ]
}
