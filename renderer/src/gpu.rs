//! レンダラーが使うGPUの機能を抽象化したtrait群。
//!
//! `Device`の関連型としてbufferやfence、command listなどのGPUオブジェクトを持ち、
//! レンダラー本体はこのtraitだけを通してGPUを操作する。
//! キューはデバイスごとに一つで、`execute`と`signal`は提出順に処理される。

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use crate::Result;

/// GPUから見たアドレス
pub type DeviceAddress = u64;

/// bufferを置くメモリの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// CPUから書き込めるメモリ
    Upload,
    /// GPU専用のメモリ
    Default,
}

bitflags::bitflags! {
    /// bufferの用途
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// shaderから読み書きするstorage buffer
        const STORAGE = 1 << 0;
        /// コピー元
        const TRANSFER_SRC = 1 << 1;
        /// コピー先
        const TRANSFER_DST = 1 << 2;
        /// acceleration structureのビルド入力 (頂点、インデックス、インスタンス)
        const ACCELERATION_STRUCTURE_INPUT = 1 << 3;
        /// acceleration structureの格納先
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 4;
        /// shader binding table
        const SHADER_BINDING_TABLE = 1 << 5;
    }
}

/// bufferの作成パラメータ
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub heap: HeapKind,
    pub usage: BufferUsage,
    pub size: u64,
}

/// デバイスの各種制約
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// shader identifierのバイト数
    pub shader_identifier_size: u64,
    /// shader binding tableのレコードとグループのアラインメント
    pub shader_table_alignment: u64,
    /// bufferのチャンクを切り上げる単位
    pub allocation_granularity: u64,
    /// scratch bufferのアラインメント
    pub scratch_alignment: u64,
    /// acceleration structureの格納先のアラインメント
    pub acceleration_structure_alignment: u64,
    /// storage bufferのオフセットのアラインメント
    pub storage_buffer_alignment: u64,
}
impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            shader_identifier_size: 32,
            shader_table_alignment: 64,
            allocation_granularity: 64 * 1024,
            scratch_alignment: 128,
            acceleration_structure_alignment: 256,
            storage_buffer_alignment: 16,
        }
    }
}

/// 2次元のサイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// descriptor tableの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorTableKind {
    /// storage bufferとacceleration structure
    ShaderResource,
    /// shaderから書き込む出力画像
    RenderTarget,
}
impl DescriptorTableKind {
    /// すべての種類
    pub const ALL: [Self; 2] = [Self::ShaderResource, Self::RenderTarget];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::ShaderResource => 0,
            Self::RenderTarget => 1,
        }
    }
}

/// acceleration structureの階層
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// サイズ問い合わせ用のビルド入力の形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureInputs {
    /// R32G32B32_SFLOATの頂点とu32のインデックスの三角形
    Triangles {
        vertex_count: u32,
        vertex_stride: u64,
        index_count: u32,
    },
    /// 64バイトのインスタンス記述子の配列
    Instances { instance_count: u32 },
}
impl AccelerationStructureInputs {
    /// 入力に対応するacceleration structureの階層
    pub fn kind(&self) -> AccelerationStructureKind {
        match self {
            Self::Triangles { .. } => AccelerationStructureKind::BottomLevel,
            Self::Instances { .. } => AccelerationStructureKind::TopLevel,
        }
    }
}

/// ビルドに必要なサイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructureSizes {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// bufferとその中のオフセット
pub struct BufferRegion<'a, D: Device> {
    pub buffer: &'a D::Buffer,
    pub offset: u64,
}
impl<D: Device> Clone for BufferRegion<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<D: Device> Copy for BufferRegion<'_, D> {}
impl<D: Device> BufferRegion<'_, D> {
    /// 領域の先頭のデバイスアドレス
    pub fn device_address(&self) -> DeviceAddress {
        self.buffer.device_address() + self.offset
    }
}

/// acceleration structureのビルド入力
pub enum GeometrySource<'a, D: Device> {
    Triangles {
        vertices: BufferRegion<'a, D>,
        vertex_count: u32,
        vertex_stride: u64,
        indices: BufferRegion<'a, D>,
        index_count: u32,
    },
    Instances {
        instances: BufferRegion<'a, D>,
        instance_count: u32,
    },
}
impl<D: Device> GeometrySource<'_, D> {
    /// サイズ問い合わせ用の入力の形を取得する
    pub fn inputs(&self) -> AccelerationStructureInputs {
        match self {
            Self::Triangles {
                vertex_count,
                vertex_stride,
                index_count,
                ..
            } => AccelerationStructureInputs::Triangles {
                vertex_count: *vertex_count,
                vertex_stride: *vertex_stride,
                index_count: *index_count,
            },
            Self::Instances { instance_count, .. } => AccelerationStructureInputs::Instances {
                instance_count: *instance_count,
            },
        }
    }
}

/// command listに記録するacceleration structureのビルド
pub struct AccelerationStructureBuild<'a, D: Device> {
    pub geometry: GeometrySource<'a, D>,
    pub destination: &'a D::AccelerationStructure,
    pub scratch: BufferRegion<'a, D>,
}

/// descriptor tableのスロットに書き込むview
pub enum DescriptorView<'a, D: Device> {
    StorageBuffer {
        buffer: &'a D::Buffer,
        offset: u64,
        size: u64,
    },
    AccelerationStructure(&'a D::AccelerationStructure),
    StorageTexture(&'a D::Texture),
}

/// shader binding tableの一つのグループの範囲
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRange {
    pub address: DeviceAddress,
    pub size: u64,
    pub stride: u64,
}

/// dispatch raysに渡すshader binding tableの範囲
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderTableRanges {
    pub ray_generation: TableRange,
    pub hit: TableRange,
    pub miss: TableRange,
}

/// コンパイル済みのSPIR-Vのshader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModuleDesc {
    pub spirv: Vec<u32>,
    pub entry_point: String,
}
impl ShaderModuleDesc {
    /// エントリポイントが`main`のshader
    pub fn new(spirv: Vec<u32>) -> Self {
        Self {
            spirv,
            entry_point: String::from("main"),
        }
    }
}

/// pipelineに含めるshaderとそのexport名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderExport {
    pub name: String,
    pub module: ShaderModuleDesc,
}

/// ray tracing pipelineの作成パラメータ
///
/// shader groupはray generation、miss、hitの順に並ぶ。
#[derive(Debug, Clone, Default)]
pub struct RayTracingPipelineDesc {
    pub ray_generation: Vec<ShaderExport>,
    pub miss: Vec<ShaderExport>,
    pub hit: Vec<ShaderExport>,
    pub push_constant_size: u32,
    pub max_recursion_depth: u32,
}
impl RayTracingPipelineDesc {
    /// すべてのshader groupをgroupの順に列挙する
    pub fn groups(&self) -> impl Iterator<Item = &ShaderExport> {
        self.ray_generation
            .iter()
            .chain(self.miss.iter())
            .chain(self.hit.iter())
    }
}

/// compute pipelineの作成パラメータ
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub label: String,
    pub module: ShaderModuleDesc,
    pub push_constant_size: u32,
}

/// GPUのbuffer
pub trait RawBuffer: Send + Sync + 'static {
    fn size(&self) -> u64;
    fn device_address(&self) -> DeviceAddress;
    /// Upload heapのbufferにCPUから書き込む
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
}

/// 単調増加するカウンタを持つfence
pub trait RawFence: Send + Sync + 'static {
    /// GPUが到達した値
    fn completed_value(&self) -> u64;
    /// カウンタが`value`に到達するまでスレッドをブロックする
    fn wait(&self, value: u64) -> Result<()>;
}

/// acceleration structure
pub trait RawAccelerationStructure: Send + Sync + 'static {
    fn device_address(&self) -> DeviceAddress;
}

/// ray tracing pipeline
pub trait RawRayTracingPipeline: Send + Sync + 'static {
    /// export名に対応するshader identifierを取得する
    fn shader_identifier(&self, export: &str) -> Option<&[u8]>;
}

/// shaderから書き込む出力画像
pub trait RawTexture: Send + Sync + 'static {
    fn extent(&self) -> Extent;
}

/// command list
///
/// `begin`から`close`までの間にコマンドを記録する。
pub trait RawCommandList<D: Device>: Send + Sync + 'static {
    fn begin(&mut self, allocator: &D::CommandAllocator) -> Result<()>;
    fn copy_buffer(&mut self, src: BufferRegion<'_, D>, dst: BufferRegion<'_, D>, size: u64);
    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, D>);
    /// それ以前のすべての書き込みを以降のコマンドから見えるようにする
    fn barrier(&mut self);
    /// 出力画像をshaderから書き込める状態にする
    fn prepare_render_target(&mut self, texture: &D::Texture);
    fn dispatch_rays(
        &mut self,
        pipeline: &D::RayTracingPipeline,
        tables: &[&D::DescriptorTable],
        push_constants: &[u8],
        ranges: &ShaderTableRanges,
        extent: Extent,
    );
    fn dispatch(
        &mut self,
        pipeline: &D::ComputePipeline,
        tables: &[&D::DescriptorTable],
        push_constants: &[u8],
        group_count: [u32; 3],
    );
    fn close(&mut self) -> Result<()>;
}

/// GPUデバイスとその唯一のキュー
pub trait Device: Sized + Send + Sync + 'static {
    type Buffer: RawBuffer;
    type Fence: RawFence;
    type CommandAllocator: Send + Sync + 'static;
    type CommandList: RawCommandList<Self>;
    type DescriptorTable: Send + Sync + 'static;
    type AccelerationStructure: RawAccelerationStructure;
    type RayTracingPipeline: RawRayTracingPipeline;
    type ComputePipeline: Send + Sync + 'static;
    type Texture: RawTexture;

    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer>;

    fn create_fence(&self) -> Result<Self::Fence>;

    fn create_command_allocator(&self) -> Result<Self::CommandAllocator>;
    /// allocatorから作ったすべてのcommand listのメモリを回収する
    fn reset_command_allocator(&self, allocator: &mut Self::CommandAllocator) -> Result<()>;
    fn create_command_list(&self, allocator: &Self::CommandAllocator) -> Result<Self::CommandList>;

    /// closeされたcommand listをキューで実行する
    fn execute(&self, list: &Self::CommandList) -> Result<()>;
    /// キューのそれまでの処理が終わったらfenceを`value`にする
    fn signal(&self, fence: &Self::Fence, value: u64) -> Result<()>;

    fn create_descriptor_table(
        &self,
        kind: DescriptorTableKind,
        capacity: u32,
    ) -> Result<Self::DescriptorTable>;
    fn write_descriptor(&self, table: &Self::DescriptorTable, index: u32, view: DescriptorView<'_, Self>);

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<AccelerationStructureSizes>;
    /// bufferの領域を格納先とするacceleration structureを作成する
    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        storage: BufferRegion<'_, Self>,
        size: u64,
    ) -> Result<Self::AccelerationStructure>;

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<Self::RayTracingPipeline>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<Self::ComputePipeline>;

    fn create_texture(&self, extent: Extent) -> Result<Self::Texture>;

    fn wait_idle(&self) -> Result<()>;
}
