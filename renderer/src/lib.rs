//! ハードウェアray tracingのためのGPUのコマンド提出とリソースの寿命管理。
//!
//! フレームごとのbuffer poolとdescriptor tableをfenceで管理しながら使い回し、
//! メッシュのBLASのキャッシュ、毎フレームのTLASとshader binding tableのビルドを行う。
//! GPUは`gpu::Device`で抽象化してあり、Vulkanの実装 (feature `vulkan`) と
//! CPUだけで動作する`gpu::headless`の実装がある。

pub mod acceleration;
pub mod buffer_pool;
pub mod command_list;
mod config;
pub mod descriptor;
mod error;
pub mod fence;
pub mod frame;
pub mod gpu;
pub mod pipeline_step;
mod renderer;
pub mod sbt;
mod scene;

pub use acceleration::{build_tlas, Blas, InstanceDesc, InstanceFlags, MeshCache, Tlas};
pub use buffer_pool::{BufferPool, BufferPoolDesc, BufferView, PoolStats};
pub use command_list::{CommandListHandle, CommandListPool};
pub use config::RendererConfig;
pub use descriptor::DescriptorHeapAccumulator;
pub use error::{RenderError, Result};
pub use fence::{Fence, FenceValue, FenceWait, FENCE_SPIN_COUNT};
pub use frame::{FrameConfig, FrameLease, FrameResourceTracker, FrameResources};
pub use pipeline_step::{ComputeStep, HitStep, MissStep, PipelineStep, RayGenerationStep};
pub use renderer::Renderer;
pub use sbt::{DispatchTable, SerializedTable, ShaderBindingTableBuilder};
pub use scene::*;
