//! レンダラーの致命的なエラーの種類を定義する。
//! どのエラーもrenderの呼び出し元までそのまま伝播し、リトライはしない。

use crate::gpu::DescriptorTableKind;

/// レンダラーのエラー
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// GPUのメモリ確保に失敗した
    #[error("out of device memory while allocating {size} bytes for `{label}`")]
    OutOfDeviceMemory {
        /// 確保しようとしたリソースのラベル
        label: String,
        /// 確保しようとしたバイト数
        size: u64,
    },

    /// descriptor tableの容量を使い切った
    #[error("descriptor table {kind:?} exhausted its {capacity} slots")]
    DescriptorCapacityExceeded {
        /// 溢れたtableの種類
        kind: DescriptorTableKind,
        /// tableの容量
        capacity: u32,
    },

    /// acceleration structureのビルドを受け付けてもらえなかった
    #[error("acceleration structure build rejected: {0}")]
    AccelerationStructureBuild(String),

    /// pipelineの作成に失敗した
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// pipelineに存在しないshaderのexport名を参照した
    #[error("shader export `{0}` is not part of the pipeline")]
    UnknownExport(String),

    /// materialが参照するhit groupのstepが存在しない
    #[error("material refers to hit group {0}, which has no hit step")]
    MissingHitGroup(usize),

    /// デバイスロスト
    #[error("device lost")]
    DeviceLost,

    /// Vulkanのエラー
    #[cfg(feature = "vulkan")]
    #[error("vulkan error: {0}")]
    Vulkan(ash::vk::Result),

    /// バックエンド固有のエラー
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for RenderError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfDeviceMemory {
                label: String::from("vulkan object"),
                size: 0,
            },
            result => Self::Vulkan(result),
        }
    }
}

/// レンダラーのResult
pub type Result<T, E = RenderError> = std::result::Result<T, E>;
