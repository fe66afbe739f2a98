//! Two-layer compositing.
//!
//! The composed view is a camera with two children: a full-screen video
//! background and the AR overlay. Layers are ordered by an explicit integer
//! key, not by depth. The background key is always strictly lower than the
//! overlay key, so overlay geometry is drawn after (in front of) the video
//! whatever its 3D position.

use std::sync::Arc;

use nalgebra::Matrix4;
use thiserror::Error;

use crate::frame::{FrameFormat, ImageFrame};
use crate::tracker::{CalibrationError, SharedCalibration, TargetId};

pub const BACKGROUND_ORDER: i32 = 0;
pub const OVERLAY_ORDER: i32 = 100;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("background order {background} must be below overlay order {overlay}")]
    DrawOrder { background: i32, overlay: i32 },
    #[error("overlay projection: {0}")]
    Projection(#[from] CalibrationError),
    #[error("calibration lock poisoned")]
    CalibrationPoisoned,
    #[error("target {0} already has an overlay")]
    DuplicateOverlay(TargetId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompositorSettings {
    pub background_order: i32,
    pub overlay_order: i32,
    /// Clip planes for the overlay camera, in millimetres.
    pub near: f64,
    pub far: f64,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            background_order: BACKGROUND_ORDER,
            overlay_order: OVERLAY_ORDER,
            near: 10.0,
            far: 10_000.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OverlayGeometry {
    /// Axis-aligned cube resting on the marker plane.
    Cube { size: f64 },
}

#[derive(Clone, Debug)]
pub struct CameraNode {
    pub projection: Matrix4<f64>,
    pub viewport: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct VideoBackground {
    pub order: i32,
    pub frame: Option<Arc<ImageFrame>>,
}

/// Overlay transform bound to one target.
#[derive(Clone, Debug)]
pub struct OverlayNode {
    pub target: TargetId,
    pub geometry: OverlayGeometry,
    pub transform: Matrix4<f64>,
    pub visible: bool,
    /// Frame whose pose was last applied.
    pub applied_sequence: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct OverlayLayer {
    pub order: i32,
    pub nodes: Vec<OverlayNode>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DrawItem {
    VideoBackground {
        sequence: u64,
        width: u32,
        height: u32,
    },
    Overlay {
        target: TargetId,
        geometry: OverlayGeometry,
        model_view: Matrix4<f64>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct DrawCommand {
    pub order: i32,
    pub item: DrawItem,
}

pub struct Compositor {
    calibration: SharedCalibration,
    settings: CompositorSettings,
    camera: CameraNode,
    background: VideoBackground,
    overlay: OverlayLayer,
}

impl Compositor {
    pub fn new(
        calibration: SharedCalibration,
        settings: CompositorSettings,
    ) -> Result<Self, CompositeError> {
        if settings.background_order >= settings.overlay_order {
            return Err(CompositeError::DrawOrder {
                background: settings.background_order,
                overlay: settings.overlay_order,
            });
        }
        let camera = build_camera(&calibration, &settings, None)?;
        Ok(Self {
            calibration,
            background: VideoBackground {
                order: settings.background_order,
                frame: None,
            },
            overlay: OverlayLayer {
                order: settings.overlay_order,
                nodes: Vec::new(),
            },
            camera,
            settings,
        })
    }

    /// Rebuild the camera for the negotiated video format. The calibration
    /// is rescaled when it was made at a different resolution.
    pub fn fit_to_video(&mut self, format: FrameFormat) -> Result<(), CompositeError> {
        self.camera = build_camera(&self.calibration, &self.settings, Some(format))?;
        Ok(())
    }

    pub fn add_overlay(
        &mut self,
        target: TargetId,
        geometry: OverlayGeometry,
    ) -> Result<(), CompositeError> {
        if self.overlay.nodes.iter().any(|n| n.target == target) {
            return Err(CompositeError::DuplicateOverlay(target));
        }
        self.overlay.nodes.push(OverlayNode {
            target,
            geometry,
            transform: Matrix4::identity(),
            visible: false,
            applied_sequence: None,
        });
        Ok(())
    }

    pub fn overlay_targets(&self) -> Vec<TargetId> {
        self.overlay.nodes.iter().map(|n| n.target).collect()
    }

    pub fn overlay(&self, target: TargetId) -> Option<&OverlayNode> {
        self.overlay.nodes.iter().find(|n| n.target == target)
    }

    /// Place and show the overlay of `target`.
    pub fn show_overlay(
        &mut self,
        target: TargetId,
        transform: Matrix4<f64>,
        sequence: u64,
    ) -> bool {
        match self.overlay.nodes.iter_mut().find(|n| n.target == target) {
            Some(node) => {
                node.transform = transform;
                node.visible = true;
                node.applied_sequence = Some(sequence);
                true
            }
            None => false,
        }
    }

    /// Hide the overlay of `target`. Its transform is left as it was.
    pub fn hide_overlay(&mut self, target: TargetId) -> bool {
        match self.overlay.nodes.iter_mut().find(|n| n.target == target) {
            Some(node) => {
                node.visible = false;
                true
            }
            None => false,
        }
    }

    pub fn set_background_frame(&mut self, frame: Option<Arc<ImageFrame>>) {
        self.background.frame = frame;
    }

    pub fn background_sequence(&self) -> Option<u64> {
        self.background.frame.as_ref().map(|f| f.sequence)
    }

    pub fn background_order(&self) -> i32 {
        self.background.order
    }

    pub fn overlay_order(&self) -> i32 {
        self.overlay.order
    }

    pub fn camera(&self) -> &CameraNode {
        &self.camera
    }

    pub fn visible_overlays(&self) -> usize {
        self.overlay.nodes.iter().filter(|n| n.visible).count()
    }

    /// Draw commands for the current state, in draw order.
    pub fn draw_list(&self) -> Vec<DrawCommand> {
        let mut commands = Vec::with_capacity(self.overlay.nodes.len() + 1);
        if let Some(frame) = &self.background.frame {
            commands.push(DrawCommand {
                order: self.background.order,
                item: DrawItem::VideoBackground {
                    sequence: frame.sequence,
                    width: frame.width(),
                    height: frame.height(),
                },
            });
        }
        commands.extend(self.overlay.nodes.iter().filter(|n| n.visible).map(|n| DrawCommand {
            order: self.overlay.order,
            item: DrawItem::Overlay {
                target: n.target,
                geometry: n.geometry.clone(),
                model_view: n.transform,
            },
        }));
        commands.sort_by_key(|c| c.order);
        commands
    }
}

fn build_camera(
    calibration: &SharedCalibration,
    settings: &CompositorSettings,
    format: Option<FrameFormat>,
) -> Result<CameraNode, CompositeError> {
    let calibration = calibration
        .read()
        .map_err(|_| CompositeError::CalibrationPoisoned)?;
    if !calibration.is_loaded() {
        log::warn!("compositor: calibration not loaded, using default projection");
    }
    let mut intrinsics = calibration.intrinsics().clone();
    if let Some(format) = format {
        if (format.width, format.height) != (intrinsics.width, intrinsics.height) {
            log::info!(
                "compositor: rescaling calibration {}x{} -> {}x{}",
                intrinsics.width,
                intrinsics.height,
                format.width,
                format.height
            );
            intrinsics = intrinsics.scaled_to(format.width, format.height);
        }
    }
    let scaled = crate::tracker::Calibration::from_intrinsics(intrinsics)?;
    let projection = scaled.projection_matrix(settings.near, settings.far)?;
    let viewport = (scaled.intrinsics().width, scaled.intrinsics().height);
    Ok(CameraNode {
        projection,
        viewport,
    })
}
