//! レンダラーのpipelineを構成するstep。
//!
//! stepの並びはレンダラーの作成時に固定され、pipelineの作成 (`emit`)、
//! フレームごとのdescriptorの登録 (`prepare`)、フレームごとのレコードの追加やdispatch (`commit`)
//! をこの順に駆動する。

use crate::{
    acceleration::Blas,
    frame::FrameParts,
    gpu::{
        ComputePipelineDesc, DescriptorTableKind, Device, Extent, RawCommandList,
        RayTracingPipelineDesc, ShaderExport, ShaderModuleDesc,
    },
    sbt::ShaderBindingTableBuilder,
    scene::{Camera, Material},
    Result,
};
use glam::{Mat4, Vec4};
use std::sync::Arc;

/// ray tracing pipelineのpush constant
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RayTracingPushConstants {
    pub camera_to_world: Mat4,
    pub fov_y: f32,
    pub frame: u32,
    pub output_slot: u32,
    pub tlas_slot: u32,
    pub max_recursion_depth: u32,
    pub padding: [u32; 3],
}

/// compute stepのpush constant
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PostProcessPushConstants {
    pub output_slot: u32,
    pub width: u32,
    pub height: u32,
    pub exposure: f32,
}

/// hitのレコードのペイロード
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HitRecord {
    pub base_color: Vec4,
    pub emission: Vec4,
    pub vertex_slot: u32,
    pub index_slot: u32,
    pub padding: [u32; 2],
}

#[derive(Debug, Clone)]
pub struct RayGenerationStep {
    pub export: String,
    pub shader: ShaderModuleDesc,
}

#[derive(Debug, Clone)]
pub struct HitStep {
    pub export: String,
    pub shader: ShaderModuleDesc,
}

#[derive(Debug, Clone)]
pub struct MissStep {
    pub export: String,
    pub shader: ShaderModuleDesc,
    /// レイが何にも当たらなかったときの色
    pub background: Vec4,
}

#[derive(Debug, Clone)]
pub struct ComputeStep {
    pub label: String,
    pub shader: ShaderModuleDesc,
    pub workgroup_size: [u32; 2],
    pub exposure: f32,
}

/// pipelineのstep
#[derive(Debug, Clone)]
pub enum PipelineStep {
    RayGeneration(RayGenerationStep),
    Hit(HitStep),
    Miss(MissStep),
    Compute(ComputeStep),
}

/// フレーム中にstepが参照するインスタンスの情報
pub struct ObjectBinding<D: Device> {
    pub blas: Arc<Blas<D>>,
    pub transform: Mat4,
    pub material: Material,
    pub vertex_slot: Option<u32>,
    pub index_slot: Option<u32>,
    /// shader binding tableのhitグループ内の位置
    pub hit_group_index: Option<u32>,
}
impl<D: Device> ObjectBinding<D> {
    pub fn new(blas: Arc<Blas<D>>, transform: Mat4, material: Material) -> Self {
        Self {
            blas,
            transform,
            material,
            vertex_slot: None,
            index_slot: None,
            hit_group_index: None,
        }
    }
}

/// stepの`prepare`と`commit`に渡すフレームの状態
pub struct FrameContext<'a, D: Device> {
    pub parts: FrameParts<'a, D>,
    pub output: &'a D::Texture,
    pub compute_pipelines: &'a [D::ComputePipeline],
    pub objects: Vec<ObjectBinding<D>>,
    pub output_slot: Option<u32>,
    pub sbt: ShaderBindingTableBuilder<D>,
    pub camera: Camera,
    pub frame_number: u32,
    pub extent: Extent,
}

/// 画像全体を覆うworkgroupの数
pub fn group_count(extent: Extent, workgroup_size: [u32; 2]) -> [u32; 3] {
    [
        extent.width.div_ceil(workgroup_size[0]),
        extent.height.div_ceil(workgroup_size[1]),
        1,
    ]
}

impl PipelineStep {
    /// ray tracing pipelineの一部となるstepか
    pub fn is_ray_tracing(&self) -> bool {
        !matches!(self, Self::Compute(_))
    }

    /// pipelineの作成パラメータにshaderを追加する
    pub fn emit(
        &self,
        ray_tracing: &mut RayTracingPipelineDesc,
        compute: &mut Vec<ComputePipelineDesc>,
    ) {
        let export = |name: &str, module: &ShaderModuleDesc| ShaderExport {
            name: name.to_owned(),
            module: module.clone(),
        };
        match self {
            Self::RayGeneration(step) => ray_tracing
                .ray_generation
                .push(export(&step.export, &step.shader)),
            Self::Hit(step) => ray_tracing.hit.push(export(&step.export, &step.shader)),
            Self::Miss(step) => ray_tracing.miss.push(export(&step.export, &step.shader)),
            Self::Compute(step) => compute.push(ComputePipelineDesc {
                label: step.label.clone(),
                module: step.shader.clone(),
                push_constant_size: std::mem::size_of::<PostProcessPushConstants>() as u32,
            }),
        }
    }

    /// フレームで使うリソースをdescriptor tableに登録する
    ///
    /// `ordinal`は同じ種類のstepの中での位置。
    pub fn prepare<D: Device>(&self, ordinal: usize, ctx: &mut FrameContext<'_, D>) -> Result<()> {
        match self {
            Self::RayGeneration(_) => {
                if ctx.output_slot.is_none() {
                    let slot = ctx.parts.descriptors.add_render_target(ctx.output)?;
                    ctx.parts.command_list.prepare_render_target(ctx.output);
                    ctx.output_slot = Some(slot);
                }
            }
            Self::Hit(_) => {
                let descriptors = ctx.parts.descriptors;
                for object in ctx
                    .objects
                    .iter_mut()
                    .filter(|object| object.material.hit_group == ordinal)
                {
                    object.vertex_slot = Some(descriptors.add_storage_buffer(object.blas.vertices())?);
                    object.index_slot = Some(descriptors.add_storage_buffer(object.blas.indices())?);
                }
            }
            Self::Miss(_) | Self::Compute(_) => {}
        }
        Ok(())
    }

    /// shader binding tableへのレコードの追加か、computeのdispatchを記録する
    pub fn commit<D: Device>(&self, ordinal: usize, ctx: &mut FrameContext<'_, D>) -> Result<()> {
        match self {
            Self::RayGeneration(step) => {
                ctx.sbt.add_ray_generation(step.export.clone(), |_| vec![]);
            }
            Self::Hit(step) => {
                for object in ctx
                    .objects
                    .iter_mut()
                    .filter(|object| object.material.hit_group == ordinal)
                {
                    let record = HitRecord {
                        base_color: object.material.base_color,
                        emission: object.material.emission,
                        vertex_slot: object.vertex_slot.unwrap_or(u32::MAX),
                        index_slot: object.index_slot.unwrap_or(u32::MAX),
                        padding: [0; 2],
                    };
                    let index = ctx
                        .sbt
                        .add_hit(step.export.clone(), move |_| bytemuck::bytes_of(&record).to_vec());
                    object.hit_group_index = Some(index);
                }
            }
            Self::Miss(step) => {
                let background = step.background;
                ctx.sbt.add_miss(step.export.clone(), move |_| {
                    bytemuck::bytes_of(&background).to_vec()
                });
            }
            Self::Compute(step) => {
                let pipeline = &ctx.compute_pipelines[ordinal];
                let descriptors = ctx.parts.descriptors;
                let push_constants = PostProcessPushConstants {
                    output_slot: ctx.output_slot.unwrap_or(0),
                    width: ctx.extent.width,
                    height: ctx.extent.height,
                    exposure: step.exposure,
                };
                ctx.parts.command_list.barrier();
                ctx.parts.command_list.dispatch(
                    pipeline,
                    &[
                        descriptors.table(DescriptorTableKind::ShaderResource),
                        descriptors.table(DescriptorTableKind::RenderTarget),
                    ],
                    bytemuck::bytes_of(&push_constants),
                    group_count(ctx.extent, step.workgroup_size),
                );
            }
        }
        Ok(())
    }
}
