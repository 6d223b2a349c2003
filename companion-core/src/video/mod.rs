// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The video and frame pipeline: surface frames in, encoded streams and
//! MP4 files out.

mod encoder;
mod frame;
mod mp4;
mod stream;

pub use encoder::*;
pub use frame::*;
pub use mp4::*;
pub use stream::*;
