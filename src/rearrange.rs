//! Geometric pixel rearrangement.
//!
//! pnCCD sensors are read out as physically segmented quadrants; the raw
//! buffer concatenates them in readout order, not in image order. A
//! rearrangement maps each rectangular segment of the source buffer into the
//! logical target image with one of four right-angle rotations. The step
//! list is plain configuration discovered at setup time; applying it is a
//! generic copy loop over any `Copy` pixel type.

use crate::geometry::FrameShape;
use thiserror::Error;

/// Errors from configuring or running a rearrangement.
#[derive(Error, Debug)]
pub enum RearrangeError {
    #[error("source {src_shape} and target {target} hold different pixel counts")]
    SizeMismatch {
        src_shape: FrameShape,
        target: FrameShape,
    },
    #[error("step {index} reaches outside the {side} array")]
    StepOutOfBounds { index: usize, side: &'static str },
    #[error("buffer holds {found} pixels, expected {expected}")]
    BufferMismatch { expected: usize, found: usize },
    #[error("no rearrangement steps are configured")]
    NoSteps,
}

/// Right-angle rotation of one segment, given as the quadrant signs the
/// hardware description uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationQuadrant {
    /// (1, 1): no rotation
    None,
    /// (1, -1): 90 degrees clockwise
    Clockwise90,
    /// (-1, -1): 180 degrees
    Clockwise180,
    /// (-1, 1): 270 degrees clockwise
    Clockwise270,
}

impl RotationQuadrant {
    /// Map the (qx, qy) sign pair onto a rotation; only the four unit sign
    /// combinations are valid.
    pub fn from_signs(qx: i8, qy: i8) -> Option<Self> {
        match (qx, qy) {
            (1, 1) => Some(Self::None),
            (1, -1) => Some(Self::Clockwise90),
            (-1, -1) => Some(Self::Clockwise180),
            (-1, 1) => Some(Self::Clockwise270),
            _ => None,
        }
    }

    /// 2x2 integer rotation matrix, column major:
    /// `x' = m[0]*x + m[2]*y`, `y' = m[1]*x + m[3]*y`.
    fn matrix(&self) -> [i64; 4] {
        match self {
            Self::None => [1, 0, 0, 1],
            Self::Clockwise90 => [0, -1, 1, 0],
            Self::Clockwise180 => [-1, 0, 0, -1],
            Self::Clockwise270 => [0, 1, -1, 0],
        }
    }

    /// Translation that moves the rotated segment back to a zero origin,
    /// derived from the segment dimensions.
    fn zero_translation(&self, segment: FrameShape) -> (i64, i64) {
        let w = segment.width as i64;
        let h = segment.height as i64;
        match self {
            Self::None => (0, 0),
            Self::Clockwise90 => (0, w - 1),
            Self::Clockwise180 => (w - 1, h - 1),
            Self::Clockwise270 => (h - 1, 0),
        }
    }
}

/// One rectangular segment move: where it starts in the source, where its
/// pivot lands in the target, and how it is rotated on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RearrangementStep {
    /// Segment dimensions in source orientation
    pub segment: FrameShape,
    /// Top-left corner of the segment in the source array
    pub source_pivot: (usize, usize),
    /// Pivot position in the target array
    pub target_pivot: (usize, usize),
    /// Rotation applied to the segment
    pub rotation: RotationQuadrant,
}

impl RearrangementStep {
    pub fn new(
        segment: FrameShape,
        source_pivot: (usize, usize),
        target_pivot: (usize, usize),
        rotation: RotationQuadrant,
    ) -> Self {
        Self {
            segment,
            source_pivot,
            target_pivot,
            rotation,
        }
    }

    /// Transform one source coordinate into the target array.
    fn transform(&self, x: usize, y: usize) -> (i64, i64) {
        let matrix = self.rotation.matrix();
        let (zx, zy) = self.rotation.zero_translation(self.segment);
        let rel_x = x as i64 - self.source_pivot.0 as i64;
        let rel_y = y as i64 - self.source_pivot.1 as i64;
        (
            matrix[0] * rel_x + matrix[2] * rel_y + zx + self.target_pivot.0 as i64,
            matrix[1] * rel_x + matrix[3] * rel_y + zy + self.target_pivot.1 as i64,
        )
    }

    /// Extent of the rotated segment in the target array.
    fn target_extent(&self) -> (usize, usize) {
        match self.rotation {
            RotationQuadrant::None | RotationQuadrant::Clockwise180 => {
                (self.segment.width, self.segment.height)
            }
            RotationQuadrant::Clockwise90 | RotationQuadrant::Clockwise270 => {
                (self.segment.height, self.segment.width)
            }
        }
    }
}

/// Ordered set of rearrangement steps between two equally sized arrays.
///
/// Steps are applied in registration order; overlapping targets are not
/// checked and silently overwrite in that order.
#[derive(Debug, Clone)]
pub struct PixelRearranger {
    source: FrameShape,
    target: FrameShape,
    steps: Vec<RearrangementStep>,
}

impl PixelRearranger {
    /// Create a rearranger between the two total array geometries; they must
    /// hold the same number of pixels.
    pub fn new(source: FrameShape, target: FrameShape) -> Result<Self, RearrangeError> {
        if source.pixel_count() != target.pixel_count() || source.pixel_count() == 0 {
            return Err(RearrangeError::SizeMismatch { src_shape: source, target });
        }
        Ok(Self {
            source,
            target,
            steps: Vec::new(),
        })
    }

    /// Register one step; validates that the segment lies inside the source
    /// and its rotated image inside the target. Returns the step index.
    pub fn add_step(&mut self, step: RearrangementStep) -> Result<usize, RearrangeError> {
        let index = self.steps.len();
        let (sx, sy) = step.source_pivot;
        if sx + step.segment.width > self.source.width
            || sy + step.segment.height > self.source.height
        {
            return Err(RearrangeError::StepOutOfBounds {
                index,
                side: "source",
            });
        }
        let (tw, th) = step.target_extent();
        let (tx, ty) = step.target_pivot;
        if tx + tw > self.target.width || ty + th > self.target.height {
            return Err(RearrangeError::StepOutOfBounds {
                index,
                side: "target",
            });
        }
        self.steps.push(step);
        Ok(index)
    }

    pub fn source_shape(&self) -> FrameShape {
        self.source
    }

    pub fn target_shape(&self) -> FrameShape {
        self.target
    }

    pub fn steps(&self) -> &[RearrangementStep] {
        &self.steps
    }

    /// Apply every step in order, copying transformed pixels from `source`
    /// into `target`. Target pixels no step writes keep their prior values.
    pub fn rearrange_all<T: Copy>(
        &self,
        source: &[T],
        target: &mut [T],
    ) -> Result<(), RearrangeError> {
        if self.steps.is_empty() {
            return Err(RearrangeError::NoSteps);
        }
        if source.len() != self.source.pixel_count() {
            return Err(RearrangeError::BufferMismatch {
                expected: self.source.pixel_count(),
                found: source.len(),
            });
        }
        if target.len() != self.target.pixel_count() {
            return Err(RearrangeError::BufferMismatch {
                expected: self.target.pixel_count(),
                found: target.len(),
            });
        }

        let src_width = self.source.width;
        let tgt_width = self.target.width;
        for step in &self.steps {
            let (px, py) = step.source_pivot;
            for y in py..py + step.segment.height {
                for x in px..px + step.segment.width {
                    let (tx, ty) = step.transform(x, y);
                    // Bounds were proven at add_step time.
                    target[tx as usize + ty as usize * tgt_width] = source[x + y * src_width];
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_from_signs() {
        assert_eq!(
            RotationQuadrant::from_signs(1, 1),
            Some(RotationQuadrant::None)
        );
        assert_eq!(
            RotationQuadrant::from_signs(1, -1),
            Some(RotationQuadrant::Clockwise90)
        );
        assert_eq!(
            RotationQuadrant::from_signs(-1, -1),
            Some(RotationQuadrant::Clockwise180)
        );
        assert_eq!(
            RotationQuadrant::from_signs(-1, 1),
            Some(RotationQuadrant::Clockwise270)
        );
        assert_eq!(RotationQuadrant::from_signs(0, 1), None);
        assert_eq!(RotationQuadrant::from_signs(2, -1), None);
    }

    #[test]
    fn test_unequal_pixel_counts_are_rejected() {
        assert!(matches!(
            PixelRearranger::new(FrameShape::new(4, 4), FrameShape::new(4, 5)),
            Err(RearrangeError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_translation_without_rotation() {
        // A 2x2 segment at the source origin lands at target pivot (2, 2).
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(4, 4), FrameShape::new(4, 4)).unwrap();
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(2, 2),
                (0, 0),
                (2, 2),
                RotationQuadrant::None,
            ))
            .unwrap();

        let mut source = vec![0i16; 16];
        source[0] = 1;
        source[1] = 2;
        source[4] = 3;
        source[5] = 4;
        let mut target = vec![0i16; 16];
        rearranger.rearrange_all(&source, &mut target).unwrap();

        assert_eq!(target[2 + 2 * 4], 1);
        assert_eq!(target[3 + 2 * 4], 2);
        assert_eq!(target[2 + 3 * 4], 3);
        assert_eq!(target[3 + 3 * 4], 4);
        // Nothing else was written.
        assert_eq!(target.iter().filter(|&&v| v != 0).count(), 4);
    }

    /// Rearrange the marked 2x2 source block through one rotation.
    fn rotate_block(rotation: RotationQuadrant) -> Vec<i16> {
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(2, 2), FrameShape::new(2, 2)).unwrap();
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(2, 2),
                (0, 0),
                (0, 0),
                rotation,
            ))
            .unwrap();
        // [1 2]
        // [3 4]
        let source = vec![1i16, 2, 3, 4];
        let mut target = vec![0i16; 4];
        rearranger.rearrange_all(&source, &mut target).unwrap();
        target
    }

    #[test]
    fn test_rotations_move_pixels_clockwise() {
        assert_eq!(rotate_block(RotationQuadrant::None), vec![1, 2, 3, 4]);
        // (1,-1) sends (x, y) to (y, w-1-x): top row becomes right column
        assert_eq!(rotate_block(RotationQuadrant::Clockwise90), vec![2, 4, 1, 3]);
        assert_eq!(
            rotate_block(RotationQuadrant::Clockwise180),
            vec![4, 3, 2, 1]
        );
        assert_eq!(
            rotate_block(RotationQuadrant::Clockwise270),
            vec![3, 1, 4, 2]
        );
    }

    #[test]
    fn test_rectangular_segment_rotation_swaps_extent() {
        // A 3x1 row rotated 90 cw becomes a 1x3 column.
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(3, 1), FrameShape::new(1, 3)).unwrap();
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(3, 1),
                (0, 0),
                (0, 0),
                RotationQuadrant::Clockwise90,
            ))
            .unwrap();

        let source = vec![1i16, 2, 3];
        let mut target = vec![0i16; 3];
        rearranger.rearrange_all(&source, &mut target).unwrap();
        assert_eq!(target, vec![3, 2, 1]);
    }

    #[test]
    fn test_out_of_bounds_steps_are_rejected() {
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(4, 4), FrameShape::new(4, 4)).unwrap();

        // Segment pokes out of the source.
        assert!(matches!(
            rearranger.add_step(RearrangementStep::new(
                FrameShape::new(3, 3),
                (2, 2),
                (0, 0),
                RotationQuadrant::None,
            )),
            Err(RearrangeError::StepOutOfBounds { side: "source", .. })
        ));

        // Rotated image pokes out of the target.
        assert!(matches!(
            rearranger.add_step(RearrangementStep::new(
                FrameShape::new(2, 2),
                (0, 0),
                (3, 3),
                RotationQuadrant::None,
            )),
            Err(RearrangeError::StepOutOfBounds { side: "target", .. })
        ));
    }

    #[test]
    fn test_overlapping_steps_overwrite_in_order() {
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(2, 1), FrameShape::new(2, 1)).unwrap();
        for _ in 0..2 {
            rearranger
                .add_step(RearrangementStep::new(
                    FrameShape::new(1, 1),
                    (0, 0),
                    (0, 0),
                    RotationQuadrant::None,
                ))
                .unwrap();
        }
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(1, 1),
                (1, 0),
                (0, 0),
                RotationQuadrant::None,
            ))
            .unwrap();

        let source = vec![7i16, 9];
        let mut target = vec![0i16; 2];
        rearranger.rearrange_all(&source, &mut target).unwrap();
        // The last registered step wins the overlapped pixel.
        assert_eq!(target[0], 9);
    }

    #[test]
    fn test_buffer_length_mismatch() {
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(2, 2), FrameShape::new(2, 2)).unwrap();
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(2, 2),
                (0, 0),
                (0, 0),
                RotationQuadrant::None,
            ))
            .unwrap();
        let source = vec![0i16; 3];
        let mut target = vec![0i16; 4];
        assert!(matches!(
            rearranger.rearrange_all(&source, &mut target),
            Err(RearrangeError::BufferMismatch { .. })
        ));
    }

    #[test]
    fn test_no_steps_is_an_error() {
        let rearranger =
            PixelRearranger::new(FrameShape::new(2, 2), FrameShape::new(2, 2)).unwrap();
        let source = vec![0i16; 4];
        let mut target = vec![0i16; 4];
        assert!(matches!(
            rearranger.rearrange_all(&source, &mut target),
            Err(RearrangeError::NoSteps)
        ));
    }

    #[test]
    fn test_generic_over_pixel_type() {
        let mut rearranger =
            PixelRearranger::new(FrameShape::new(2, 1), FrameShape::new(2, 1)).unwrap();
        rearranger
            .add_step(RearrangementStep::new(
                FrameShape::new(2, 1),
                (0, 0),
                (0, 0),
                RotationQuadrant::Clockwise180,
            ))
            .unwrap();

        let source = vec![1.5f64, 2.5];
        let mut target = vec![0.0f64; 2];
        rearranger.rearrange_all(&source, &mut target).unwrap();
        assert_eq!(target, vec![2.5, 1.5]);
    }
}
