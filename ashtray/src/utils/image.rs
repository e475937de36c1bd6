use anyhow::Result;
use ash::vk;

/// Imageの関連するオブジェクトをまとめた構造体
#[derive(Clone)]
pub struct ImageObjects {
    /// ImageHandle
    pub image: crate::ImageHandle,
    /// AllocationHandle
    pub allocation: crate::AllocationHandle,
    /// ImageViewHandle
    pub image_view: crate::ImageViewHandle,
}

/// shaderから書き込むstorage imageを作成する関数
pub fn create_storage_image(
    device: &crate::DeviceHandle,
    allocator: &crate::AllocatorHandle,
    width: u32,
    height: u32,
    format: vk::Format,
) -> Result<ImageObjects> {
    let image_create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = device.create_image(&image_create_info)?;

    // imageのメモリ確保
    let image_memory_requirement = unsafe { device.get_image_memory_requirements(image.raw()) };
    let allocation = allocator.allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
        name: "storage image",
        requirements: image_memory_requirement,
        location: gpu_allocator::MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
    })?;

    // imageとメモリのバインド
    let (memory, offset) = allocation.memory()?;
    unsafe { device.bind_image_memory(image.raw(), memory, offset)? };

    // image viewの作成
    let image_view_create_info = vk::ImageViewCreateInfo::builder()
        .image(image.raw())
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1)
                .build(),
        );
    let image_view = device.create_image_view(&image_view_create_info)?;

    Ok(ImageObjects {
        image,
        allocation,
        image_view,
    })
}
