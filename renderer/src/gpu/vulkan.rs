//! ashtrayを使ったVulkanのDeviceの実装。
//!
//! fenceはtimeline semaphore、command allocatorはTRANSIENTなcommand poolで、
//! descriptor tableは種類ごとのdescriptor setになる。
//! キューは一つだけで、提出とdevice wait idleはMutexで排他する。

mod command;
mod pipeline;
mod resources;

pub use command::{VulkanCommandAllocator, VulkanCommandList};
pub use pipeline::{VulkanComputePipeline, VulkanRayTracingPipeline};
pub use resources::{
    VulkanAccelerationStructure, VulkanBuffer, VulkanDescriptorTable, VulkanFence, VulkanTexture,
};

use super::*;
use crate::RenderError;
use ash::vk;
use parking_lot::Mutex;

const ALLOCATION_GRANULARITY: u64 = 64 * 1024;
// VkAccelerationStructureCreateInfoKHR::offsetは256の倍数
const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// anyhowで包まれたVulkanとgpu-allocatorのエラーをRenderErrorに変換する
pub(crate) fn backend_error(err: anyhow::Error) -> RenderError {
    if let Some(result) = err.downcast_ref::<vk::Result>() {
        return RenderError::from(*result);
    }
    if let Some(gpu_allocator::AllocationError::OutOfMemory) =
        err.downcast_ref::<gpu_allocator::AllocationError>()
    {
        return RenderError::OutOfDeviceMemory {
            label: String::from("allocation"),
            size: 0,
        };
    }
    RenderError::Backend(err)
}

/// VulkanDeviceの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanConfig {
    pub application_name: String,
    /// descriptor tableの最大スロット数
    pub descriptor_capacity: u32,
}
impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            application_name: String::from("renderer"),
            descriptor_capacity: 1024,
        }
    }
}

/// ray tracingに対応したVulkanのデバイス
pub struct VulkanDevice {
    descriptor_set_layouts: [ashtray::DescriptorSetLayoutHandle; 2],
    allocator: ashtray::AllocatorHandle,
    queue_lock: Mutex<()>,
    queue: vk::Queue,
    queue_family_index: u32,
    properties: ashtray::utils::RayTracingProperties,
    config: VulkanConfig,
    device: ashtray::DeviceHandle,
}
impl VulkanDevice {
    /// ray tracingに対応したphysical deviceを選んでデバイスを作成する
    pub fn new(config: VulkanConfig) -> Result<Self> {
        let instance =
            ashtray::InstanceHandle::create(&config.application_name).map_err(backend_error)?;
        let device_extensions = ashtray::utils::get_required_device_extensions();
        let physical_device =
            ashtray::utils::select_physical_device(&instance, &device_extensions)
                .map_err(backend_error)?;
        let queue_family_index =
            ashtray::utils::find_compute_queue_family(&instance, physical_device).ok_or_else(
                || RenderError::Backend(anyhow::anyhow!("no compute queue family")),
            )?;
        let device = ashtray::utils::create_device(
            &instance,
            physical_device,
            queue_family_index,
            &device_extensions,
        )
        .map_err(backend_error)?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let allocator = device.create_allocator().map_err(backend_error)?;
        let properties = ashtray::utils::get_ray_tracing_properties(&instance, physical_device);
        let descriptor_set_layouts =
            pipeline::create_descriptor_set_layouts(&device, config.descriptor_capacity)?;

        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name =
            unsafe { std::ffi::CStr::from_ptr(device_properties.device_name.as_ptr()) };
        log::info!(
            "vulkan device: {}, queue family {queue_family_index}",
            device_name.to_string_lossy()
        );

        Ok(Self {
            descriptor_set_layouts,
            allocator,
            queue_lock: Mutex::new(()),
            queue,
            queue_family_index,
            properties,
            config,
            device,
        })
    }

    pub fn device(&self) -> &ashtray::DeviceHandle {
        &self.device
    }

    pub fn allocator(&self) -> &ashtray::AllocatorHandle {
        &self.allocator
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn config(&self) -> &VulkanConfig {
        &self.config
    }

    fn submit(&self, submit_info: vk::SubmitInfo) -> Result<()> {
        let _queue = self.queue_lock.lock();
        self.device
            .queue_submit(self.queue, std::slice::from_ref(&submit_info))
            .map_err(backend_error)
    }
}

impl Device for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Fence = VulkanFence;
    type CommandAllocator = VulkanCommandAllocator;
    type CommandList = VulkanCommandList;
    type DescriptorTable = VulkanDescriptorTable;
    type AccelerationStructure = VulkanAccelerationStructure;
    type RayTracingPipeline = VulkanRayTracingPipeline;
    type ComputePipeline = VulkanComputePipeline;
    type Texture = VulkanTexture;

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            shader_identifier_size: self.properties.shader_group_handle_size as u64,
            shader_table_alignment: self
                .properties
                .shader_group_base_alignment
                .max(self.properties.shader_group_handle_alignment)
                as u64,
            allocation_granularity: ALLOCATION_GRANULARITY,
            scratch_alignment: self
                .properties
                .min_acceleration_structure_scratch_offset_alignment
                as u64,
            acceleration_structure_alignment: ACCELERATION_STRUCTURE_ALIGNMENT,
            storage_buffer_alignment: self.properties.min_storage_buffer_offset_alignment,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<VulkanBuffer> {
        VulkanBuffer::create(&self.device, &self.allocator, desc)
    }

    fn create_fence(&self) -> Result<VulkanFence> {
        let semaphore = self
            .device
            .create_timeline_semaphore(0)
            .map_err(backend_error)?;
        Ok(VulkanFence::new(semaphore))
    }

    fn create_command_allocator(&self) -> Result<VulkanCommandAllocator> {
        let command_pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queue_family_index);
        let command_pool = self
            .device
            .create_command_pool(&command_pool_create_info)
            .map_err(backend_error)?;
        Ok(VulkanCommandAllocator::new(command_pool))
    }

    fn reset_command_allocator(&self, allocator: &mut VulkanCommandAllocator) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(allocator.raw(), vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn create_command_list(&self, allocator: &VulkanCommandAllocator) -> Result<VulkanCommandList> {
        let command_buffer = self
            .device
            .allocate_command_buffer(allocator.command_pool())
            .map_err(backend_error)?;
        Ok(VulkanCommandList::new(command_buffer))
    }

    fn execute(&self, list: &VulkanCommandList) -> Result<()> {
        let command_buffers = [list.raw()];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        self.submit(submit_info)
    }

    fn signal(&self, fence: &VulkanFence, value: u64) -> Result<()> {
        let semaphores = [fence.raw()];
        let values = [value];
        let mut timeline_semaphore_submit_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .push_next(&mut timeline_semaphore_submit_info)
            .signal_semaphores(&semaphores)
            .build();
        self.submit(submit_info)
    }

    fn create_descriptor_table(
        &self,
        kind: DescriptorTableKind,
        capacity: u32,
    ) -> Result<VulkanDescriptorTable> {
        if capacity > self.config.descriptor_capacity {
            return Err(RenderError::DescriptorCapacityExceeded {
                kind,
                capacity: self.config.descriptor_capacity,
            });
        }
        VulkanDescriptorTable::create(
            &self.device,
            &self.descriptor_set_layouts[kind.index()],
            kind,
            capacity,
        )
    }

    fn write_descriptor(
        &self,
        table: &VulkanDescriptorTable,
        index: u32,
        view: DescriptorView<'_, Self>,
    ) {
        table.write(&self.device, index, view);
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<AccelerationStructureSizes> {
        let (geometry, primitive_count) = resources::geometry_from_inputs(inputs);
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .geometries(std::slice::from_ref(&geometry))
            .ty(resources::acceleration_structure_type(inputs.kind()))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD);
        let build_size_info = self
            .device
            .get_acceleration_structure_build_sizes(&build_geometry_info, &[primitive_count]);
        Ok(AccelerationStructureSizes {
            result_size: build_size_info.acceleration_structure_size,
            scratch_size: build_size_info.build_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        storage: BufferRegion<'_, Self>,
        size: u64,
    ) -> Result<VulkanAccelerationStructure> {
        VulkanAccelerationStructure::create(&self.device, kind, storage, size)
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<VulkanRayTracingPipeline> {
        VulkanRayTracingPipeline::create(
            &self.device,
            &self.descriptor_set_layouts,
            &self.properties,
            desc,
        )
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<VulkanComputePipeline> {
        VulkanComputePipeline::create(&self.device, &self.descriptor_set_layouts, desc)
    }

    fn create_texture(&self, extent: Extent) -> Result<VulkanTexture> {
        VulkanTexture::create(&self.device, &self.allocator, extent)
    }

    fn wait_idle(&self) -> Result<()> {
        let _queue = self.queue_lock.lock();
        self.device.wait_idle().map_err(backend_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_vulkan_meaning() {
        let err = backend_error(anyhow::Error::from(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(err, RenderError::DeviceLost));
        let err = backend_error(anyhow::Error::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(matches!(err, RenderError::OutOfDeviceMemory { .. }));
        let err = backend_error(anyhow::Error::from(
            gpu_allocator::AllocationError::OutOfMemory,
        ));
        assert!(matches!(err, RenderError::OutOfDeviceMemory { .. }));
        let err = backend_error(anyhow::anyhow!("no compute queue family"));
        assert!(matches!(err, RenderError::Backend(_)));
    }
}
