use super::{
    pipeline::RAY_TRACING_STAGES, resources, VulkanComputePipeline, VulkanDescriptorTable,
    VulkanDevice, VulkanRayTracingPipeline, VulkanTexture,
};
use crate::{
    gpu::{
        AccelerationStructureBuild, BufferRegion, Extent, GeometrySource, RawCommandList,
        ShaderTableRanges, TableRange,
    },
    RenderError, Result,
};
use ash::vk;

/// TRANSIENTなcommand pool
pub struct VulkanCommandAllocator {
    command_pool: ashtray::CommandPoolHandle,
}
impl VulkanCommandAllocator {
    pub(super) fn new(command_pool: ashtray::CommandPoolHandle) -> Self {
        Self { command_pool }
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.command_pool.raw()
    }

    pub fn command_pool(&self) -> &ashtray::CommandPoolHandle {
        &self.command_pool
    }
}

/// primaryのcommand buffer
pub struct VulkanCommandList {
    command_buffer: ashtray::CommandBufferHandle,
}
impl VulkanCommandList {
    pub(super) fn new(command_buffer: ashtray::CommandBufferHandle) -> Self {
        Self { command_buffer }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.command_buffer.raw()
    }

    fn device(&self) -> &ashtray::DeviceHandle {
        self.command_buffer.command_pool().device()
    }

    fn bind(
        &self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        tables: &[&VulkanDescriptorTable],
        push_constants: &[u8],
        push_constant_stages: vk::ShaderStageFlags,
    ) {
        let device = self.device();
        let descriptor_sets = tables.iter().map(|table| table.raw()).collect::<Vec<_>>();
        unsafe {
            device.cmd_bind_pipeline(self.raw(), bind_point, pipeline);
            if !descriptor_sets.is_empty() {
                device.cmd_bind_descriptor_sets(
                    self.raw(),
                    bind_point,
                    layout,
                    0,
                    &descriptor_sets,
                    &[],
                );
            }
            if !push_constants.is_empty() {
                device.cmd_push_constants(
                    self.raw(),
                    layout,
                    push_constant_stages,
                    0,
                    push_constants,
                );
            }
        }
    }
}

fn strided_region(range: &TableRange) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR::builder()
        .device_address(range.address)
        .stride(range.stride)
        .size(range.size)
        .build()
}

impl RawCommandList<VulkanDevice> for VulkanCommandList {
    fn begin(&mut self, allocator: &VulkanCommandAllocator) -> Result<()> {
        if self.command_buffer.command_pool().raw() != allocator.raw() {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "command buffer begun with a command pool it was not allocated from"
            )));
        }
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(self.raw(), &begin_info)? };
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferRegion<'_, VulkanDevice>,
        dst: BufferRegion<'_, VulkanDevice>,
        size: u64,
    ) {
        let region = vk::BufferCopy::builder()
            .src_offset(src.offset)
            .dst_offset(dst.offset)
            .size(size)
            .build();
        unsafe {
            self.device().cmd_copy_buffer(
                self.raw(),
                src.buffer.raw(),
                dst.buffer.raw(),
                std::slice::from_ref(&region),
            )
        };
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, VulkanDevice>) {
        let (geometry, primitive_count) = match &build.geometry {
            GeometrySource::Triangles {
                vertices,
                vertex_count,
                vertex_stride,
                indices,
                index_count,
            } => (
                resources::triangles_geometry(
                    vertices.device_address(),
                    *vertex_count,
                    *vertex_stride,
                    indices.device_address(),
                ),
                index_count / 3,
            ),
            GeometrySource::Instances {
                instances,
                instance_count,
            } => (
                resources::instances_geometry(instances.device_address()),
                *instance_count,
            ),
        };

        // build geometry infoを作成
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .geometries(std::slice::from_ref(&geometry))
            .ty(resources::acceleration_structure_type(
                build.geometry.inputs().kind(),
            ))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .src_acceleration_structure(vk::AccelerationStructureKHR::null())
            .dst_acceleration_structure(build.destination.raw())
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch.device_address(),
            })
            .build();
        // build range infoを作成
        let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
            .build();

        unsafe {
            self.device()
                .acceleration_structure_loader()
                .cmd_build_acceleration_structures(
                    self.raw(),
                    std::slice::from_ref(&build_geometry_info),
                    &[std::slice::from_ref(&build_range_info)],
                )
        };
    }

    fn barrier(&mut self) {
        let barrier = vk::MemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .build();
        let dependency_info =
            vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device()
                .cmd_pipeline_barrier2(self.raw(), &dependency_info)
        };
    }

    fn prepare_render_target(&mut self, texture: &VulkanTexture) {
        // 以前の中身は捨ててGENERALにする
        let image_barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .dst_stage_mask(
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
            )
            .dst_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
            .new_layout(vk::ImageLayout::GENERAL)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image(texture.image().raw())
            .build();
        let dependency_info = vk::DependencyInfo::builder()
            .image_memory_barriers(std::slice::from_ref(&image_barrier));
        unsafe {
            self.device()
                .cmd_pipeline_barrier2(self.raw(), &dependency_info)
        };
    }

    fn dispatch_rays(
        &mut self,
        pipeline: &VulkanRayTracingPipeline,
        tables: &[&VulkanDescriptorTable],
        push_constants: &[u8],
        ranges: &ShaderTableRanges,
        extent: Extent,
    ) {
        self.bind(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.raw(),
            pipeline.layout(),
            tables,
            push_constants,
            RAY_TRACING_STAGES,
        );

        // ray generationの領域はsizeとstrideが等しい必要がある
        let mut ray_generation = strided_region(&ranges.ray_generation);
        ray_generation.size = ray_generation.stride;
        let miss = strided_region(&ranges.miss);
        let hit = strided_region(&ranges.hit);
        unsafe {
            self.device().ray_tracing_pipeline_loader().cmd_trace_rays(
                self.raw(),
                &ray_generation,
                &miss,
                &hit,
                &vk::StridedDeviceAddressRegionKHR::default(),
                extent.width,
                extent.height,
                1,
            )
        };
    }

    fn dispatch(
        &mut self,
        pipeline: &VulkanComputePipeline,
        tables: &[&VulkanDescriptorTable],
        push_constants: &[u8],
        group_count: [u32; 3],
    ) {
        self.bind(
            vk::PipelineBindPoint::COMPUTE,
            pipeline.raw(),
            pipeline.layout(),
            tables,
            push_constants,
            vk::ShaderStageFlags::COMPUTE,
        );
        unsafe {
            self.device().cmd_dispatch(
                self.raw(),
                group_count[0],
                group_count[1],
                group_count[2],
            )
        };
    }

    fn close(&mut self) -> Result<()> {
        unsafe { self.device().end_command_buffer(self.raw())? };
        Ok(())
    }
}
