//! Renderer module for stbplayer
//!
//! The engine draws into an opaque [`VideoSink`] supplied by the platform
//! (framebuffer, compositor surface). Pictures arrive already converted to
//! BGRA at the session's fixed output geometry; the renderer thread paces
//! them against the master clock.

use crate::decoder::Rational;
use crate::utils::error::Result;
use std::fmt;

pub mod frame;

pub use frame::{Display, RenderStats, Renderer, RendererHandle, RendererOptions};

/// Bytes per BGRA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Destination for rendered pictures
pub trait VideoSink: Send {
    /// Copy a BGRA picture into the back buffer
    ///
    /// # Arguments
    ///
    /// * `pixels` - Tightly packed BGRA rows, `width * 4` bytes each
    /// * `width` - Picture width
    /// * `height` - Picture height
    /// * `x` - Horizontal offset in the back buffer
    /// * `y` - Vertical offset in the back buffer
    fn blit(&mut self, pixels: &[u8], width: u32, height: u32, x: i32, y: i32) -> Result<()>;

    /// Flip the back buffer to the screen; called once per rendered frame
    fn present(&mut self) -> Result<()>;
}

/// Sink that accepts and discards every picture
#[derive(Debug, Default)]
pub struct NullSink {
    presented: u64,
}

impl NullSink {
    /// Create a new null sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames presented so far
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl VideoSink for NullSink {
    fn blit(&mut self, _pixels: &[u8], _width: u32, _height: u32, _x: i32, _y: i32) -> Result<()> {
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.presented += 1;
        Ok(())
    }
}

/// A decoded picture in BGRA at the output geometry
///
/// Buffers are allocated once per FrameRing slot and reused for the whole
/// session, so decoders write into `data` instead of replacing it.
#[derive(Clone, Default)]
pub struct VideoFrame {
    /// BGRA pixels, `height` rows of `width * 4` bytes
    pub data: Vec<u8>,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Presentation timestamp in `time_base` units
    pub pts: i64,

    /// Time base of `pts`
    pub time_base: Rational,
}

impl VideoFrame {
    /// Allocate a black frame of the given geometry
    pub fn new(width: u32, height: u32) -> Self {
        let mut frame = Self::default();
        frame.resize(width, height);
        frame
    }

    /// Change the geometry, reusing the allocation where possible
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.resize(Self::byte_len(width, height), 0);
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Presentation time in microseconds
    pub fn presentation_time(&self) -> i64 {
        self.time_base.to_micros(self.pts)
    }

    /// Copy pixels and timing from `other` without reallocating
    pub fn copy_from(&mut self, other: &VideoFrame) {
        if self.data.len() != other.data.len() {
            self.data.resize(other.data.len(), 0);
        }
        self.data.copy_from_slice(&other.data);
        self.width = other.width;
        self.height = other.height;
        self.pts = other.pts;
        self.time_base = other.time_base;
    }

    /// Fill the whole picture with one BGRA color
    pub fn fill(&mut self, bgra: [u8; 4]) {
        for pixel in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            pixel.copy_from_slice(&bgra);
        }
    }

    fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("time_base", &self.time_base)
            .finish()
    }
}
