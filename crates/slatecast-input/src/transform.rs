//! Tablet-to-screen coordinate transform
//!
//! The receiver reports normalized coordinates over its own display; the
//! stream shown there is the server screen scaled with the configured
//! policy, so the inverse of that scaling recovers screen positions.

use slatecast_core::ScaleMode;

#[derive(Debug, Clone)]
pub struct CoordTransform {
    screen_width: u32,
    screen_height: u32,
    mode: ScaleMode,
    rotate90: bool,
    scale_x: f32,
    scale_y: f32,
    offset_x: f32,
    offset_y: f32,
}

impl CoordTransform {
    pub fn new(
        screen_width: u32,
        screen_height: u32,
        tablet_width: u32,
        tablet_height: u32,
        mode: ScaleMode,
        rotate90: bool,
    ) -> Self {
        let screen_aspect = screen_width as f32 / screen_height.max(1) as f32;
        let tablet_aspect = if rotate90 {
            tablet_height as f32 / tablet_width.max(1) as f32
        } else {
            tablet_width as f32 / tablet_height.max(1) as f32
        };

        let (scale_x, scale_y, offset_x, offset_y) = match mode {
            ScaleMode::Letterbox => {
                if tablet_aspect > screen_aspect {
                    // Tablet is wider: inactive bands on the sides
                    let sx = screen_aspect / tablet_aspect;
                    (sx, 1.0, (1.0 - sx) / 2.0, 0.0)
                } else {
                    // Tablet is taller: inactive bands top and bottom
                    let sy = tablet_aspect / screen_aspect;
                    (1.0, sy, 0.0, (1.0 - sy) / 2.0)
                }
            }
            ScaleMode::Fill => {
                if tablet_aspect > screen_aspect {
                    let sy = tablet_aspect / screen_aspect;
                    (1.0, sy, 0.0, (1.0 - sy) / 2.0)
                } else {
                    let sx = screen_aspect / tablet_aspect;
                    (sx, 1.0, (1.0 - sx) / 2.0, 0.0)
                }
            }
            ScaleMode::Stretch => (1.0, 1.0, 0.0, 0.0),
        };

        Self {
            screen_width,
            screen_height,
            mode,
            rotate90,
            scale_x,
            scale_y,
            offset_x,
            offset_y,
        }
    }

    /// Identity transform for a receiver with the screen's exact aspect
    pub fn identity(screen_width: u32, screen_height: u32) -> Self {
        Self::new(
            screen_width,
            screen_height,
            screen_width.max(1),
            screen_height.max(1),
            ScaleMode::Letterbox,
            false,
        )
    }

    pub fn mode(&self) -> ScaleMode {
        self.mode
    }

    /// Map normalized tablet coordinates (0-1) to screen pixel coordinates
    pub fn to_screen(&self, tx: f32, ty: f32) -> (i32, i32) {
        let (tx, ty) = if self.rotate90 { (ty, 1.0 - tx) } else { (tx, ty) };

        let sx = ((tx - self.offset_x) / self.scale_x).clamp(0.0, 1.0);
        let sy = ((ty - self.offset_y) / self.scale_y).clamp(0.0, 1.0);

        (
            (sx * self.screen_width as f32) as i32,
            (sy * self.screen_height as f32) as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_aspect_is_identity() {
        let t = CoordTransform::new(1920, 1080, 2560, 1440, ScaleMode::Letterbox, false);
        assert_eq!(t.to_screen(0.5, 0.5), (960, 540));
        assert_eq!(t.to_screen(0.0, 0.0), (0, 0));
        assert_eq!(t.to_screen(1.0, 1.0), (1920, 1080));
    }

    #[test]
    fn taller_tablet_letterboxes_vertically() {
        // 4:3 tablet showing a 16:9 screen gets bands top and bottom
        let t = CoordTransform::new(1920, 1080, 1600, 1200, ScaleMode::Letterbox, false);

        // Center maps to center
        assert_eq!(t.to_screen(0.5, 0.5), (960, 540));

        // A touch inside the top band clamps to the screen edge
        let (_, y) = t.to_screen(0.5, 0.01);
        assert_eq!(y, 0);

        // The top of the active area is at offset (1 - 3/4 / (16/9)) / 2
        let band = (1.0 - (4.0 / 3.0) / (16.0 / 9.0)) / 2.0;
        let (_, y) = t.to_screen(0.5, band + 0.0001);
        assert!(y <= 1);
    }

    #[test]
    fn stretch_ignores_aspect() {
        let t = CoordTransform::new(1000, 1000, 2800, 1752, ScaleMode::Stretch, false);
        assert_eq!(t.to_screen(0.25, 0.75), (250, 750));
    }

    #[test]
    fn rotate90_swaps_axes() {
        let t = CoordTransform::new(1000, 1000, 1000, 1000, ScaleMode::Stretch, true);
        let (x, y) = t.to_screen(0.0, 0.25);
        assert_eq!((x, y), (250, 1000));
    }

    #[test]
    fn output_is_clamped_to_screen() {
        let t = CoordTransform::new(1920, 1080, 2800, 1752, ScaleMode::Letterbox, false);
        let (x, y) = t.to_screen(-0.5, 1.5);
        assert!(x >= 0 && y <= 1080);
    }
}
