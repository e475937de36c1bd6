use anyhow::Result;
use ash::vk;

/// Bufferの関連するオブジェクトをまとめた構造体
#[derive(Clone)]
pub struct BufferObjects {
    /// BufferHandle
    pub buffer: crate::BufferHandle,
    /// AllocationHandle
    pub allocation: crate::AllocationHandle,
    /// Bufferのデバイスアドレス
    pub device_address: u64,
}

/// Bufferを作成してメモリを割り当てる関数
///
/// `location`が`CpuToGpu`ならCPUから書き込めるhostのBuffer、
/// `GpuOnly`ならDeviceLocalのBufferになる。
pub fn create_buffer(
    device: &crate::DeviceHandle,
    allocator: &crate::AllocatorHandle,
    name: &str,
    buffer_size: u64,
    usage: vk::BufferUsageFlags,
    location: gpu_allocator::MemoryLocation,
) -> Result<BufferObjects> {
    let buffer_create_info = vk::BufferCreateInfo::builder()
        .size(buffer_size)
        .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = device.create_buffer(&buffer_create_info)?;

    // bufferのメモリ確保
    let buffer_memory_requirement = unsafe { device.get_buffer_memory_requirements(buffer.raw()) };
    let allocation = allocator.allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
        name,
        requirements: buffer_memory_requirement,
        location,
        linear: true,
        allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
    })?;

    // bufferとメモリのバインド
    let (memory, offset) = allocation.memory()?;
    unsafe { device.bind_buffer_memory(buffer.raw(), memory, offset)? };

    // device addressの取得
    let device_address = device.get_buffer_device_address(buffer.raw());

    Ok(BufferObjects {
        buffer,
        allocation,
        device_address,
    })
}
