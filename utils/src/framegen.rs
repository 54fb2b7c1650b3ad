use privcam::format::EncodingLayout;
use privcam::{Format, PixelFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(PixelFormat),
    #[error("invalid stride for plane {0}")]
    InvalidStride(usize),
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("expected {expected} planes, got {got}")]
    NumPlanesMismatch { expected: usize, got: usize },
    #[error("plane {0} is too small")]
    BufferTooSmall(usize),
}

/// Geometry of one plane of the generated frames.
#[derive(Debug, Clone, Copy)]
struct PlaneGeometry {
    /// Width in bytes of the useful part of a line.
    line_len: usize,
    lines: usize,
    stride: usize,
}

/// Generates frames of a moving test pattern for a given format.
pub struct FrameGenerator {
    layout: EncodingLayout,
    planes: Vec<PlaneGeometry>,
    step: u32,
}

impl FrameGenerator {
    pub fn new(format: &Format) -> Result<Self, NewFrameGeneratorError> {
        let layout = EncodingLayout::of(format.pixelformat)
            .ok_or(NewFrameGeneratorError::UnsupportedPixelFormat(format.pixelformat))?;
        let width = format.width as usize;
        let height = format.height as usize;

        let planes = match layout {
            EncodingLayout::Packed { bytes_per_pixel } => vec![(width * bytes_per_pixel as usize, height)],
            EncodingLayout::Planar420 => vec![
                (width, height),
                (width / 2, height / 2),
                (width / 2, height / 2),
            ],
        };
        if planes.len() != format.plane_fmt.len() {
            return Err(NewFrameGeneratorError::InvalidStride(format.plane_fmt.len()));
        }

        let planes = planes
            .into_iter()
            .zip(&format.plane_fmt)
            .enumerate()
            .map(|(i, ((line_len, lines), plane))| {
                let stride = plane.bytesperline as usize;
                if stride < line_len {
                    return Err(NewFrameGeneratorError::InvalidStride(i));
                }
                Ok(PlaneGeometry {
                    line_len,
                    lines,
                    stride,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FrameGenerator {
            layout,
            planes,
            step: 0,
        })
    }

    /// Minimum size of each plane buffer passed to `next_frame`.
    pub fn plane_sizes(&self) -> Vec<usize> {
        self.planes.iter().map(|p| p.stride * p.lines).collect()
    }

    /// Writes the next frame of the pattern into `planes`.
    pub fn next_frame<S: AsMut<[u8]>>(&mut self, planes: &mut [S]) -> Result<(), GenerateFrameError> {
        if planes.len() != self.planes.len() {
            return Err(GenerateFrameError::NumPlanesMismatch {
                expected: self.planes.len(),
                got: planes.len(),
            });
        }
        for (i, (plane, size)) in planes.iter_mut().zip(self.plane_sizes()).enumerate() {
            if plane.as_mut().len() < size {
                return Err(GenerateFrameError::BufferTooSmall(i));
            }
        }

        match self.layout {
            EncodingLayout::Packed { .. } => self.gen_yuyv(planes[0].as_mut()),
            EncodingLayout::Planar420 => {
                for (i, plane) in planes.iter_mut().enumerate() {
                    self.gen_plane(i, plane.as_mut());
                }
            }
        }
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn lines<'a>(&self, plane: usize, frame: &'a mut [u8]) -> impl Iterator<Item = &'a mut [u8]> {
        let geometry = self.planes[plane];
        frame
            .chunks_exact_mut(geometry.stride)
            .take(geometry.lines)
            .map(move |l| &mut l[0..geometry.line_len])
    }

    fn gen_yuyv(&self, frame: &mut [u8]) {
        let step = self.step;
        self.lines(0, frame).enumerate().for_each(|(y, line)| {
            line.chunks_exact_mut(4).enumerate().for_each(|(x, pair)| {
                let luma = step.wrapping_add(((2 * x) ^ y) as u32) as u8;
                pair[0] = luma;
                pair[1] = step.wrapping_add(x as u32) as u8;
                pair[2] = luma.wrapping_add(1);
                pair[3] = step.wrapping_add(y as u32) as u8;
            });
        });
    }

    fn gen_plane(&self, plane: usize, frame: &mut [u8]) {
        let step = self.step;
        self.lines(plane, frame).enumerate().for_each(|(y, line)| {
            line.iter_mut().enumerate().for_each(|(x, sample)| {
                *sample = match plane {
                    0 => step.wrapping_add((x ^ y) as u32) as u8,
                    1 => step.wrapping_add(x as u32) as u8,
                    _ => step.wrapping_add(y as u32) as u8,
                };
            });
        });
    }
}
