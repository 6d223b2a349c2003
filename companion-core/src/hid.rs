// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HID event encoding.
//!
//! Translates touch, button and keyboard events into the length-tagged
//! binary messages the target's input endpoint expects. Senders treat the
//! produced buffer as opaque and write it verbatim.
//!
//! Touch coordinates are normalised against the screen dimensions before
//! encoding, so a message is valid for whatever resolution the target
//! reports at delivery time.

use crate::errors::CompanionError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Whether an event is a press or a release.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HidDirection {
    /// Finger or key down.
    Down = 1,
    /// Finger or key up.
    Up = 2,
}

impl HidDirection {
    fn from_wire(value: u32) -> Result<Self, CompanionError> {
        match value {
            1 => Ok(Self::Down),
            2 => Ok(Self::Up),
            other => Err(CompanionError::InvalidArgument(format!(
                "unknown HID direction {other}"
            ))),
        }
    }
}

/// A hardware button on the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HidButton {
    /// The Apple Pay button.
    ApplePay = 1,
    /// The home button.
    Home = 2,
    /// The lock button.
    Lock = 3,
    /// The side button.
    Side = 4,
    /// The Siri button.
    Siri = 5,
}

impl HidButton {
    fn from_wire(value: u32) -> Result<Self, CompanionError> {
        match value {
            1 => Ok(Self::ApplePay),
            2 => Ok(Self::Home),
            3 => Ok(Self::Lock),
            4 => Ok(Self::Side),
            5 => Ok(Self::Siri),
            other => Err(CompanionError::InvalidArgument(format!(
                "unknown HID button {other}"
            ))),
        }
    }
}

/// A HID event to synthesize on the target.
#[derive(Clone, Debug, PartialEq)]
pub enum HidEvent {
    /// A touch at pixel coordinates on the current screen.
    Touch {
        /// Press or release.
        direction: HidDirection,
        /// X in pixels.
        x: f64,
        /// Y in pixels.
        y: f64,
    },
    /// A hardware button press or release.
    Button {
        /// Press or release.
        direction: HidDirection,
        /// Which button.
        button: HidButton,
    },
    /// A key event. Keycodes are hardware-independent, per
    /// `HIToolbox/Events.h`.
    Keyboard {
        /// Press or release.
        direction: HidDirection,
        /// The hardware-independent keycode.
        keycode: u32,
    },
    /// A sequence of key events delivered as one message, e.g. typing a
    /// string as alternating down/up pairs.
    KeyboardAggregate {
        /// The events, in delivery order.
        keys: Vec<(HidDirection, u32)>,
    },
}

const FAMILY_TOUCH: u32 = 1;
const FAMILY_BUTTON: u32 = 2;
const FAMILY_KEYBOARD: u32 = 3;
const FAMILY_KEYBOARD_AGGREGATE: u32 = 4;

/// Encodes [`HidEvent`]s against a known screen geometry.
#[derive(Clone, Copy, Debug)]
pub struct IndigoEncoder {
    screen_width: f64,
    screen_height: f64,
    screen_scale: f64,
}

impl IndigoEncoder {
    /// Creates an encoder for a screen of the given pixel dimensions.
    pub fn new(screen_width: u32, screen_height: u32) -> Self {
        Self::with_scale(screen_width, screen_height, 1.0)
    }

    /// Creates an encoder for a scaled screen (e.g. `@2x`).
    pub fn with_scale(screen_width: u32, screen_height: u32, screen_scale: f64) -> Self {
        Self {
            screen_width: f64::from(screen_width),
            screen_height: f64::from(screen_height),
            screen_scale,
        }
    }

    /// Encodes an event into a length-tagged message buffer.
    pub fn encode(&self, event: &HidEvent) -> Result<Bytes, CompanionError> {
        let mut payload = BytesMut::new();
        match event {
            HidEvent::Touch { direction, x, y } => {
                if !(0.0..=self.screen_width).contains(x) || !(0.0..=self.screen_height).contains(y)
                {
                    return Err(CompanionError::InvalidArgument(format!(
                        "touch at ({x}, {y}) is outside the {}x{} screen",
                        self.screen_width, self.screen_height
                    )));
                }
                payload.put_u32_le(FAMILY_TOUCH);
                payload.put_u32_le(*direction as u32);
                // Normalised to [0, 1]; the receiver multiplies by its own
                // notion of the screen size.
                payload.put_f64_le(x * self.screen_scale / (self.screen_width * self.screen_scale));
                payload
                    .put_f64_le(y * self.screen_scale / (self.screen_height * self.screen_scale));
            }
            HidEvent::Button { direction, button } => {
                payload.put_u32_le(FAMILY_BUTTON);
                payload.put_u32_le(*direction as u32);
                payload.put_u32_le(*button as u32);
            }
            HidEvent::Keyboard { direction, keycode } => {
                payload.put_u32_le(FAMILY_KEYBOARD);
                payload.put_u32_le(*direction as u32);
                payload.put_u32_le(*keycode);
            }
            HidEvent::KeyboardAggregate { keys } => {
                payload.put_u32_le(FAMILY_KEYBOARD_AGGREGATE);
                payload.put_u32_le(keys.len() as u32);
                for (direction, keycode) in keys {
                    payload.put_u32_le(*direction as u32);
                    payload.put_u32_le(*keycode);
                }
            }
        }
        let mut message = BytesMut::with_capacity(4 + payload.len());
        message.put_u32_le(payload.len() as u32);
        message.extend_from_slice(&payload);
        Ok(message.freeze())
    }

    /// Encodes a string as an aggregate of down/up pairs using a keycode
    /// mapping supplied by the caller.
    pub fn encode_text(
        &self,
        text: &str,
        keycode_for: impl Fn(char) -> Option<u32>,
    ) -> Result<Bytes, CompanionError> {
        let mut keys = Vec::with_capacity(text.len() * 2);
        for ch in text.chars() {
            let keycode = keycode_for(ch).ok_or_else(|| {
                CompanionError::InvalidArgument(format!("no keycode mapping for {ch:?}"))
            })?;
            keys.push((HidDirection::Down, keycode));
            keys.push((HidDirection::Up, keycode));
        }
        self.encode(&HidEvent::KeyboardAggregate { keys })
    }

    /// Decodes a message back into an event. Touch coordinates come back in
    /// pixels against this encoder's geometry.
    pub fn decode(&self, message: &[u8]) -> Result<HidEvent, CompanionError> {
        let mut buf = message;
        if buf.remaining() < 4 {
            return Err(malformed("missing length tag"));
        }
        let declared = buf.get_u32_le() as usize;
        if buf.remaining() != declared {
            return Err(malformed("length tag does not match payload"));
        }
        if buf.remaining() < 4 {
            return Err(malformed("missing event family"));
        }
        match buf.get_u32_le() {
            FAMILY_TOUCH => {
                if buf.remaining() < 4 + 16 {
                    return Err(malformed("short touch payload"));
                }
                let direction = HidDirection::from_wire(buf.get_u32_le())?;
                let x = buf.get_f64_le() * self.screen_width;
                let y = buf.get_f64_le() * self.screen_height;
                Ok(HidEvent::Touch { direction, x, y })
            }
            FAMILY_BUTTON => {
                if buf.remaining() < 8 {
                    return Err(malformed("short button payload"));
                }
                let direction = HidDirection::from_wire(buf.get_u32_le())?;
                let button = HidButton::from_wire(buf.get_u32_le())?;
                Ok(HidEvent::Button { direction, button })
            }
            FAMILY_KEYBOARD => {
                if buf.remaining() < 8 {
                    return Err(malformed("short keyboard payload"));
                }
                let direction = HidDirection::from_wire(buf.get_u32_le())?;
                let keycode = buf.get_u32_le();
                Ok(HidEvent::Keyboard { direction, keycode })
            }
            FAMILY_KEYBOARD_AGGREGATE => {
                if buf.remaining() < 4 {
                    return Err(malformed("short aggregate payload"));
                }
                let count = buf.get_u32_le() as usize;
                if buf.remaining() != count * 8 {
                    return Err(malformed("aggregate count does not match payload"));
                }
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    let direction = HidDirection::from_wire(buf.get_u32_le())?;
                    keys.push((direction, buf.get_u32_le()));
                }
                Ok(HidEvent::KeyboardAggregate { keys })
            }
            other => Err(malformed(&format!("unknown event family {other}"))),
        }
    }
}

fn malformed(detail: &str) -> CompanionError {
    CompanionError::InvalidArgument(format!("malformed HID message: {detail}"))
}
