use anyhow::{anyhow, Result};
use ash::{
    extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline},
    vk,
};
use std::{collections::HashSet, ffi::CStr};

/// 必要なdevice拡張のリストを取得する関数
pub fn get_required_device_extensions() -> Vec<&'static CStr> {
    vec![
        RayTracingPipeline::name(),
        AccelerationStructure::name(),
        DeferredHostOperations::name(),
    ]
}

/// 適当なphysical deviceを選択する関数
///
/// ComputeをサポートするQueueFamilyがある &&
/// 必要なデバイス拡張機能に対応している &&
/// 必要なdevice featuresに対応しているような
/// physical deviceを選択する。
pub fn select_physical_device(
    instance: &crate::InstanceHandle,
    required_device_extensions: &[&CStr],
) -> Result<vk::PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    for physical_device in physical_devices {
        // QueueFamilyの確認
        let is_queue_family_supported = find_compute_queue_family(instance, physical_device).is_some();

        // デバイス拡張の確認
        let device_extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let mut required_extensions = required_device_extensions
            .iter()
            .copied()
            .collect::<HashSet<_>>();
        for device_extension in device_extensions {
            let name = unsafe { CStr::from_ptr(device_extension.extension_name.as_ptr()) };
            required_extensions.remove(name);
        }
        let is_device_extension_supported = required_extensions.is_empty();

        // featureのサポート確認
        let mut supported_feature_vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut supported_feature_vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut supported_ray_tracing_pipeline =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut supported_acceleration_structure =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut physical_device_features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut supported_feature_vulkan_12)
            .push_next(&mut supported_feature_vulkan_13)
            .push_next(&mut supported_ray_tracing_pipeline)
            .push_next(&mut supported_acceleration_structure)
            .build();
        unsafe {
            instance.get_physical_device_features2(physical_device, &mut physical_device_features2)
        };
        let is_supported_device_features = physical_device_features2.features.shader_int64
            == vk::TRUE
            && supported_feature_vulkan_12.timeline_semaphore == vk::TRUE
            && supported_feature_vulkan_12.buffer_device_address == vk::TRUE
            && supported_feature_vulkan_12.scalar_block_layout == vk::TRUE
            && supported_feature_vulkan_12.descriptor_indexing == vk::TRUE
            && supported_feature_vulkan_12.descriptor_binding_partially_bound == vk::TRUE
            && supported_feature_vulkan_12.runtime_descriptor_array == vk::TRUE
            && supported_feature_vulkan_12.shader_storage_buffer_array_non_uniform_indexing
                == vk::TRUE
            && supported_feature_vulkan_12.shader_storage_image_array_non_uniform_indexing
                == vk::TRUE
            && supported_feature_vulkan_13.synchronization2 == vk::TRUE
            && supported_ray_tracing_pipeline.ray_tracing_pipeline == vk::TRUE
            && supported_acceleration_structure.acceleration_structure == vk::TRUE;

        if is_queue_family_supported && is_device_extension_supported && is_supported_device_features
        {
            return Ok(physical_device);
        }
    }

    Err(anyhow!("No suitable physical device."))
}

/// Computeに対応したQueueFamilyのindexを取得する関数
///
/// Graphicsも兼ねるQueueFamilyがあればそちらを優先する。
pub fn find_compute_queue_family(
    instance: &crate::InstanceHandle,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let compute_families = queue_families
        .iter()
        .enumerate()
        .filter(|(_, queue_family)| queue_family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .collect::<Vec<_>>();
    compute_families
        .iter()
        .find(|(_, queue_family)| queue_family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| compute_families.first())
        .map(|(index, _)| *index as u32)
}

/// deviceを作成する関数
pub fn create_device(
    instance: &crate::InstanceHandle,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    required_device_extensions: &[&CStr],
) -> Result<crate::DeviceHandle> {
    // queue create info
    let queue_priorities = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities)
        .build()];

    // physical device features
    let physical_device_features = vk::PhysicalDeviceFeatures::builder()
        .shader_int64(true)
        .build();
    let mut physical_device_vulkan_12_features = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .scalar_block_layout(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .shader_storage_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .runtime_descriptor_array(true)
        .build();
    let mut physical_device_vulkan_13_features = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .build();
    let mut physical_device_raytracing_pipeline_features_khr =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true)
            .build();
    let mut physical_device_acceleration_structure_feature_khr =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .build();

    // enable extension names
    let enable_extension_names = required_device_extensions
        .iter()
        .map(|s| s.as_ptr())
        .collect::<Vec<_>>();

    // device create info
    let device_create_info = vk::DeviceCreateInfo::builder()
        .push_next(&mut physical_device_vulkan_12_features)
        .push_next(&mut physical_device_vulkan_13_features)
        .push_next(&mut physical_device_raytracing_pipeline_features_khr)
        .push_next(&mut physical_device_acceleration_structure_feature_khr)
        .queue_create_infos(&queue_create_infos)
        .enabled_features(&physical_device_features)
        .enabled_extension_names(&enable_extension_names);

    crate::DeviceHandle::create(instance.clone(), physical_device, &device_create_info)
}

/// レイトレーシング関連のデバイスのプロパティ
#[derive(Debug, Clone, Copy)]
pub struct RayTracingProperties {
    /// shader group handleのサイズ
    pub shader_group_handle_size: u32,
    /// shader group handleのアラインメント
    pub shader_group_handle_alignment: u32,
    /// shader binding tableの各グループの先頭のアラインメント
    pub shader_group_base_alignment: u32,
    /// scratch bufferのオフセットのアラインメント
    pub min_acceleration_structure_scratch_offset_alignment: u32,
    /// storage bufferのオフセットのアラインメント
    pub min_storage_buffer_offset_alignment: u64,
}

/// レイトレーシング関連のデバイスのプロパティを取得する関数
pub fn get_ray_tracing_properties(
    instance: &crate::InstanceHandle,
    physical_device: vk::PhysicalDevice,
) -> RayTracingProperties {
    let mut ray_tracing_pipeline_properties =
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut acceleration_structure_properties =
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut physical_device_properties2 = vk::PhysicalDeviceProperties2::builder()
        .push_next(&mut ray_tracing_pipeline_properties)
        .push_next(&mut acceleration_structure_properties)
        .build();
    unsafe {
        instance.get_physical_device_properties2(physical_device, &mut physical_device_properties2)
    };

    RayTracingProperties {
        shader_group_handle_size: ray_tracing_pipeline_properties.shader_group_handle_size,
        shader_group_handle_alignment: ray_tracing_pipeline_properties
            .shader_group_handle_alignment,
        shader_group_base_alignment: ray_tracing_pipeline_properties.shader_group_base_alignment,
        min_acceleration_structure_scratch_offset_alignment: acceleration_structure_properties
            .min_acceleration_structure_scratch_offset_alignment,
        min_storage_buffer_offset_alignment: physical_device_properties2
            .properties
            .limits
            .min_storage_buffer_offset_alignment,
    }
}
