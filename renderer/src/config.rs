use crate::{frame::FrameConfig, gpu::Extent};

const MIB: u64 = 1024 * 1024;

/// レンダラーの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    /// フレームごとのupload poolのチャンクサイズ
    pub upload_chunk_size: u64,
    /// フレームごとのscratch poolのチャンクサイズ
    pub scratch_chunk_size: u64,
    /// acceleration structureの格納先のチャンクサイズ
    pub acceleration_structure_chunk_size: u64,
    /// メッシュの頂点とインデックスのチャンクサイズ
    pub geometry_chunk_size: u64,
    /// フレームごとのdescriptor tableのスロット数
    pub descriptor_capacity: u32,
    pub max_recursion_depth: u32,
}
impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 300,
            upload_chunk_size: 4 * MIB,
            scratch_chunk_size: 4 * MIB,
            acceleration_structure_chunk_size: 4 * MIB,
            geometry_chunk_size: 16 * MIB,
            descriptor_capacity: 1024,
            max_recursion_depth: 1,
        }
    }
}
impl RendererConfig {
    pub fn extent(&self) -> Extent {
        Extent {
            width: self.width,
            height: self.height,
        }
    }

    /// フレームのリソースの設定
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            upload_chunk_size: self.upload_chunk_size,
            scratch_chunk_size: self.scratch_chunk_size,
            acceleration_structure_chunk_size: self.acceleration_structure_chunk_size,
            descriptor_capacity: self.descriptor_capacity,
        }
    }
}
