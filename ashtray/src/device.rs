//! ash::Deviceとレイトレーシング拡張のloaderを保持するDeviceを定義する。
//! Vulkanの子オブジェクトの作成関数はDeviceHandleに生やしてある。

use anyhow::Result;
use ash::{
    extensions::khr::{AccelerationStructure, RayTracingPipeline},
    vk,
};
use std::ops::Deref;

/// ash::Deviceと拡張のloaderをまとめたオブジェクト
pub struct Device {
    device: ash::Device,
    acceleration_structure_loader: AccelerationStructure,
    ray_tracing_pipeline_loader: RayTracingPipeline,
    physical_device: vk::PhysicalDevice,
    instance: crate::InstanceHandle,
}
impl Device {
    /// InstanceHandleを取得する
    pub fn instance(&self) -> &crate::InstanceHandle {
        &self.instance
    }

    /// 作成元のphysical deviceを取得する
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// acceleration structure拡張のloaderを取得する
    pub fn acceleration_structure_loader(&self) -> &AccelerationStructure {
        &self.acceleration_structure_loader
    }

    /// ray tracing pipeline拡張のloaderを取得する
    pub fn ray_tracing_pipeline_loader(&self) -> &RayTracingPipeline {
        &self.ray_tracing_pipeline_loader
    }
}

/// Deviceを参照カウントで管理するためのハンドル
pub type DeviceHandle = crate::Handle<Device>;

impl crate::Handle<Device> {
    /// DeviceHandleを作成する
    pub fn create(
        instance: crate::InstanceHandle,
        physical_device: vk::PhysicalDevice,
        device_create_info: &vk::DeviceCreateInfo,
    ) -> Result<Self> {
        // create device
        let device = unsafe { instance.create_device(physical_device, device_create_info, None)? };

        // acceleration structure loader
        let acceleration_structure_loader = AccelerationStructure::new(&instance, &device);

        // ray_tracing pipeline loader
        let ray_tracing_pipeline_loader = RayTracingPipeline::new(&instance, &device);

        Ok(Self::new(Device {
            device,
            acceleration_structure_loader,
            ray_tracing_pipeline_loader,
            physical_device,
            instance,
        }))
    }

    // create系

    /// BufferHandleを作成する
    pub fn create_buffer(&self, buffer_create_info: &vk::BufferCreateInfo) -> Result<crate::BufferHandle> {
        let buffer = unsafe { self.device.create_buffer(buffer_create_info, None)? };
        Ok(crate::Buffer::new(self.clone(), buffer))
    }

    /// CommandPoolHandleを作成する
    pub fn create_command_pool(
        &self,
        command_pool_create_info: &vk::CommandPoolCreateInfo,
    ) -> Result<crate::CommandPoolHandle> {
        let command_pool = unsafe { self.device.create_command_pool(command_pool_create_info, None)? };
        Ok(crate::CommandPool::new(self.clone(), command_pool))
    }

    /// primaryのCommandBufferHandleを一つ割り当てる
    pub fn allocate_command_buffer(
        &self,
        command_pool: &crate::CommandPoolHandle,
    ) -> Result<crate::CommandBufferHandle> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool.raw())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        Ok(crate::CommandBuffer::new(
            command_pool.clone(),
            command_buffers[0],
        ))
    }

    /// timeline semaphoreのSemaphoreHandleを作成する
    pub fn create_timeline_semaphore(&self, initial_value: u64) -> Result<crate::SemaphoreHandle> {
        let mut semaphore_type_create_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_create_info =
            vk::SemaphoreCreateInfo::builder().push_next(&mut semaphore_type_create_info);
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_create_info, None)? };
        Ok(crate::Semaphore::new(self.clone(), semaphore))
    }

    /// AccelerationStructureHandleを作成する
    pub fn create_acceleration_structure(
        &self,
        acceleration_structure_create_info: &vk::AccelerationStructureCreateInfoKHR,
    ) -> Result<crate::AccelerationStructureHandle> {
        let acceleration_structure = unsafe {
            self.acceleration_structure_loader
                .create_acceleration_structure(acceleration_structure_create_info, None)?
        };
        Ok(crate::AccelerationStructure::new(
            self.clone(),
            acceleration_structure,
        ))
    }

    /// DescriptorPoolHandleを作成する
    pub fn create_descriptor_pool(
        &self,
        descriptor_pool_create_info: &vk::DescriptorPoolCreateInfo,
    ) -> Result<crate::DescriptorPoolHandle> {
        let descriptor_pool =
            unsafe { self.device.create_descriptor_pool(descriptor_pool_create_info, None)? };
        Ok(crate::DescriptorPool::new(self.clone(), descriptor_pool))
    }

    /// DescriptorSetLayoutHandleを作成する
    pub fn create_descriptor_set_layout(
        &self,
        descriptor_set_layout_create_info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> Result<crate::DescriptorSetLayoutHandle> {
        let descriptor_set_layout = unsafe {
            self.device
                .create_descriptor_set_layout(descriptor_set_layout_create_info, None)?
        };
        Ok(crate::DescriptorSetLayout::new(
            self.clone(),
            descriptor_set_layout,
        ))
    }

    /// DescriptorSetHandleを一つ割り当てる
    pub fn allocate_descriptor_set(
        &self,
        descriptor_pool: &crate::DescriptorPoolHandle,
        descriptor_set_layout: &crate::DescriptorSetLayoutHandle,
    ) -> Result<crate::DescriptorSetHandle> {
        let set_layouts = [descriptor_set_layout.raw()];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool.raw())
            .set_layouts(&set_layouts);
        let descriptor_sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        Ok(crate::DescriptorSet::new(
            descriptor_pool.clone(),
            descriptor_sets[0],
        ))
    }

    /// PipelineLayoutHandleを作成する
    pub fn create_pipeline_layout(
        &self,
        pipeline_layout_create_info: &vk::PipelineLayoutCreateInfo,
    ) -> Result<crate::PipelineLayoutHandle> {
        let pipeline_layout =
            unsafe { self.device.create_pipeline_layout(pipeline_layout_create_info, None)? };
        Ok(crate::PipelineLayout::new(self.clone(), pipeline_layout))
    }

    /// SPIR-VからShaderModuleHandleを作成する
    pub fn create_shader_module(&self, code: &[u32]) -> Result<crate::ShaderModuleHandle> {
        let shader_module_create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        let shader_module =
            unsafe { self.device.create_shader_module(&shader_module_create_info, None)? };
        Ok(crate::ShaderModule::new(self.clone(), shader_module))
    }

    /// ray tracing pipelineのPipelineHandleを作成する
    pub fn create_ray_tracing_pipeline(
        &self,
        create_info: &vk::RayTracingPipelineCreateInfoKHR,
    ) -> Result<crate::PipelineHandle> {
        let pipelines = unsafe {
            self.ray_tracing_pipeline_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )?
        };
        Ok(crate::Pipeline::new(self.clone(), pipelines[0]))
    }

    /// compute pipelineのPipelineHandleを作成する
    pub fn create_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo,
    ) -> Result<crate::PipelineHandle> {
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(create_info),
                    None,
                )
                .map_err(|(_, result)| result)?
        };
        Ok(crate::Pipeline::new(self.clone(), pipelines[0]))
    }

    /// ImageHandleを作成する
    pub fn create_image(&self, image_create_info: &vk::ImageCreateInfo) -> Result<crate::ImageHandle> {
        let image = unsafe { self.device.create_image(image_create_info, None)? };
        Ok(crate::Image::new(self.clone(), image))
    }

    /// ImageViewHandleを作成する
    pub fn create_image_view(
        &self,
        image_view_create_info: &vk::ImageViewCreateInfo,
    ) -> Result<crate::ImageViewHandle> {
        let image_view = unsafe { self.device.create_image_view(image_view_create_info, None)? };
        Ok(crate::ImageView::new(self.clone(), image_view))
    }

    /// gpu-allocatorのAllocatorHandleを作成する
    pub fn create_allocator(&self) -> Result<crate::AllocatorHandle> {
        crate::Allocator::create(self.clone())
    }

    // 他のDeviceの関数

    /// Bufferのデバイスアドレスを取得する
    pub fn get_buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// timeline semaphoreの現在の値を取得する
    pub fn get_semaphore_counter_value(&self, semaphore: &crate::SemaphoreHandle) -> Result<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore.raw())? })
    }

    /// timeline semaphoreが指定の値に到達するまでブロックする
    pub fn wait_semaphore(&self, semaphore: &crate::SemaphoreHandle, value: u64) -> Result<()> {
        let semaphores = [semaphore.raw()];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }

    /// DescriptorSetの更新をする
    pub fn update_descriptor_sets(&self, write_descriptor_sets: &[vk::WriteDescriptorSet]) {
        unsafe {
            self.device
                .update_descriptor_sets(write_descriptor_sets, &[])
        }
    }

    /// acceleration structureのビルドに必要なサイズを取得する
    pub fn get_acceleration_structure_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        unsafe {
            self.acceleration_structure_loader
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    build_info,
                    max_primitive_counts,
                )
        }
    }

    /// ray tracing pipelineのshader group handleを取得する
    pub fn get_ray_tracing_shader_group_handles(
        &self,
        pipeline: &crate::PipelineHandle,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>> {
        Ok(unsafe {
            self.ray_tracing_pipeline_loader
                .get_ray_tracing_shader_group_handles(pipeline.raw(), 0, group_count, data_size)?
        })
    }

    /// QueueにコマンドをSubmitする
    pub fn queue_submit(&self, queue: vk::Queue, submit_infos: &[vk::SubmitInfo]) -> Result<()> {
        unsafe {
            self.device
                .queue_submit(queue, submit_infos, vk::Fence::null())?
        };
        Ok(())
    }

    /// DeviceのIdleを待機する
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl crate::Destroy for Device {
    unsafe fn destroy(&mut self) {
        if let Err(err) = self.device.device_wait_idle() {
            log::error!("Failed to wait device idle before destroy: {err}");
        }
        self.device.destroy_device(None);
    }
}

// Deviceはash::DeviceにDerefする
impl Deref for Device {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}
