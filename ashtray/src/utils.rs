//! # Utility functions and structs
//! Vulkanの本体には存在しないがあると便利なutilityの関数たち。

mod setup;
pub use setup::*;
mod buffer;
pub use buffer::*;
mod image;
pub use image::*;
