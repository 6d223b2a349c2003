// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw frame values and the surface-fed frame source.

use bytes::Bytes;
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// The pixel layout of a raw frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    /// 8-bit blue, green, red, alpha.
    Bgra8888,
    /// 8-bit red, green, blue, alpha.
    Rgba8888,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Bgra8888 | Self::Rgba8888 => 4,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bgra8888 => "BGRA8888",
            Self::Rgba8888 => "RGBA8888",
        };
        write!(f, "{s}")
    }
}

/// A sub-region of the display that changed since the previous frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DamageRect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// The orientation of the display.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisplayRotation {
    /// Upright.
    #[default]
    Portrait,
    /// Rotated 90 degrees clockwise.
    LandscapeRight,
    /// Upside down.
    PortraitUpsideDown,
    /// Rotated 90 degrees counterclockwise.
    LandscapeLeft,
}

impl DisplayRotation {
    /// The rotation in degrees, clockwise from portrait.
    pub fn degrees(self) -> u32 {
        match self {
            Self::Portrait => 0,
            Self::LandscapeRight => 90,
            Self::PortraitUpsideDown => 180,
            Self::LandscapeLeft => 270,
        }
    }
}

/// One normalised frame from the target's display surface.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Time since the source started.
    pub timestamp: Duration,
    /// Monotonic frame counter.
    pub sequence: u64,
    /// The pixel layout of `payload`.
    pub format: PixelFormat,
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// Bytes per row, including padding.
    pub row_stride: u32,
    /// The display orientation when the frame was captured.
    pub rotation: DisplayRotation,
    /// The changed region, when the surface reported one.
    pub damage: Option<DamageRect>,
    /// The raw pixels.
    pub payload: Bytes,
}

struct SourceGeometry {
    width: u32,
    height: u32,
    row_stride: u32,
    rotation: DisplayRotation,
    sequence: u64,
}

/// The single producer of frames for one target display.
///
/// The surface callback pushes pixel buffers in at refresh cadence;
/// consumers subscribe to a latest-value channel, so a slow consumer
/// observes the newest frame rather than a backlog.
pub struct FrameSource {
    format: PixelFormat,
    started: Instant,
    geometry: Mutex<SourceGeometry>,
    tx: watch::Sender<Option<Frame>>,
}

impl FrameSource {
    /// Creates a source for a display of the given geometry.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            format,
            started: Instant::now(),
            geometry: Mutex::new(SourceGeometry {
                width,
                height,
                row_stride: width * format.bytes_per_pixel(),
                rotation: DisplayRotation::default(),
                sequence: 0,
            }),
            tx,
        }
    }

    /// Pushes one surface buffer, normalising it into a [`Frame`] and
    /// fanning it out to subscribers.
    pub fn push_surface(&self, payload: Bytes, damage: Option<DamageRect>) -> Frame {
        let frame = {
            let mut geometry = self.geometry.lock().expect("frame geometry lock poisoned");
            geometry.sequence += 1;
            Frame {
                timestamp: self.started.elapsed(),
                sequence: geometry.sequence,
                format: self.format,
                width: geometry.width,
                height: geometry.height,
                row_stride: geometry.row_stride,
                rotation: geometry.rotation,
                damage,
                payload,
            }
        };
        let _ = self.tx.send(Some(frame.clone()));
        frame
    }

    /// Updates the display geometry after a rotation callback. Subsequent
    /// frames inherit the new geometry.
    pub fn rotate(&self, rotation: DisplayRotation) {
        let mut geometry = self.geometry.lock().expect("frame geometry lock poisoned");
        let geometry = &mut *geometry;
        if rotation.degrees().abs_diff(geometry.rotation.degrees()) == 90
            || rotation.degrees().abs_diff(geometry.rotation.degrees()) == 270
        {
            std::mem::swap(&mut geometry.width, &mut geometry.height);
            geometry.row_stride = geometry.width * self.format.bytes_per_pixel();
        }
        geometry.rotation = rotation;
    }

    /// Subscribes to frames. The receiver always holds the latest frame.
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.tx.subscribe()
    }

    /// The most recent frame, if any has been pushed.
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// The current display dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        let geometry = self.geometry.lock().expect("frame geometry lock poisoned");
        (geometry.width, geometry.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixels(count: usize) -> Bytes {
        Bytes::from(vec![0u8; count])
    }

    #[test]
    fn frames_are_sequenced() {
        let source = FrameSource::new(4, 4, PixelFormat::Bgra8888);
        let first = source.push_surface(pixels(64), None);
        let second = source.push_surface(pixels(64), None);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(first.row_stride, 16);
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let source = FrameSource::new(400, 600, PixelFormat::Bgra8888);
        source.rotate(DisplayRotation::LandscapeRight);
        let frame = source.push_surface(pixels(400 * 600 * 4), None);
        assert_eq!((frame.width, frame.height), (600, 400));
        assert_eq!(frame.rotation, DisplayRotation::LandscapeRight);

        // Rotating to the opposite landscape keeps the swapped geometry.
        source.rotate(DisplayRotation::LandscapeLeft);
        assert_eq!(source.dimensions(), (600, 400));

        source.rotate(DisplayRotation::Portrait);
        assert_eq!(source.dimensions(), (400, 600));
    }

    #[test]
    fn subscribers_see_latest_frame() {
        let source = FrameSource::new(2, 2, PixelFormat::Rgba8888);
        let rx = source.subscribe();
        assert!(rx.borrow().is_none());
        source.push_surface(pixels(16), None);
        source.push_surface(pixels(16), None);
        let latest = rx.borrow().clone().expect("frame");
        assert_eq!(latest.sequence, 2, "watch keeps only the newest frame");
    }

    #[test]
    fn damage_rect_travels_with_frame() {
        let source = FrameSource::new(8, 8, PixelFormat::Bgra8888);
        let damage = DamageRect {
            x: 1,
            y: 2,
            width: 3,
            height: 4,
        };
        let frame = source.push_surface(pixels(256), Some(damage));
        assert_eq!(frame.damage, Some(damage));
    }
}
