//! Vulkanのオブジェクトに対するdestroy処理を忘れたりすることをなくすために用意したラッパーライブラリ。
//! Vulkanの各Objectを参照カウンタで管理して、参照がすべて破棄された際に
//! 自動で各種destroy処理を行う汎用の`Handle`が用意されている。
//!
//! 各オブジェクトは生成元のDeviceHandleを保持しているので、
//! 子のオブジェクトが残っている間はDeviceが破棄されることはない。
//!
//! Vulkanの標準以上の便利メソッドはutilsの中で提供する方針。
#![warn(missing_docs)]

mod handle;
pub use handle::*;
mod instance;
pub use instance::*;
mod device;
pub use device::*;
mod objects;
pub use objects::*;
mod allocator;
pub use allocator::*;

pub mod utils;
