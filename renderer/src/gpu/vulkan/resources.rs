use super::{backend_error, VulkanDevice};
use crate::{
    gpu::{
        AccelerationStructureInputs, AccelerationStructureKind, BufferDesc, BufferRegion,
        BufferUsage, DescriptorTableKind, DescriptorView, DeviceAddress, Extent, HeapKind,
        RawAccelerationStructure, RawBuffer, RawFence, RawTexture,
    },
    RenderError, Result,
};
use ash::vk;

const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

/// gpu-allocatorでメモリを割り当てたbuffer
pub struct VulkanBuffer {
    objects: ashtray::utils::BufferObjects,
    size: u64,
}
impl VulkanBuffer {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        allocator: &ashtray::AllocatorHandle,
        desc: &BufferDesc<'_>,
    ) -> Result<Self> {
        let location = match desc.heap {
            HeapKind::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
            HeapKind::Default => gpu_allocator::MemoryLocation::GpuOnly,
        };
        let objects = ashtray::utils::create_buffer(
            device,
            allocator,
            desc.label,
            desc.size,
            buffer_usage_flags(desc.usage),
            location,
        )
        .map_err(|err| match backend_error(err) {
            RenderError::OutOfDeviceMemory { .. } => RenderError::OutOfDeviceMemory {
                label: desc.label.to_owned(),
                size: desc.size,
            },
            err => err,
        })?;
        Ok(Self {
            objects,
            size: desc.size,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.objects.buffer.raw()
    }

    pub fn objects(&self) -> &ashtray::utils::BufferObjects {
        &self.objects
    }
}
impl RawBuffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> DeviceAddress {
        self.objects.device_address
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.objects
            .allocation
            .write(offset as usize, data)
            .map_err(backend_error)
    }
}

/// timeline semaphoreのfence
pub struct VulkanFence {
    semaphore: ashtray::SemaphoreHandle,
}
impl VulkanFence {
    pub(super) fn new(semaphore: ashtray::SemaphoreHandle) -> Self {
        Self { semaphore }
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore.raw()
    }
}
impl RawFence for VulkanFence {
    fn completed_value(&self) -> u64 {
        match self
            .semaphore
            .device()
            .get_semaphore_counter_value(&self.semaphore)
        {
            Ok(value) => value,
            Err(err) => {
                log::error!("failed to read timeline semaphore: {err}");
                0
            }
        }
    }

    fn wait(&self, value: u64) -> Result<()> {
        self.semaphore
            .device()
            .wait_semaphore(&self.semaphore, value)
            .map_err(backend_error)
    }
}

/// shaderから書き込むstorage image
pub struct VulkanTexture {
    objects: ashtray::utils::ImageObjects,
    extent: Extent,
}
impl VulkanTexture {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        allocator: &ashtray::AllocatorHandle,
        extent: Extent,
    ) -> Result<Self> {
        let objects = ashtray::utils::create_storage_image(
            device,
            allocator,
            extent.width,
            extent.height,
            RENDER_TARGET_FORMAT,
        )
        .map_err(backend_error)?;
        Ok(Self { objects, extent })
    }

    pub fn image(&self) -> &ashtray::ImageHandle {
        &self.objects.image
    }

    pub fn image_view(&self) -> &ashtray::ImageViewHandle {
        &self.objects.image_view
    }

    pub fn format(&self) -> vk::Format {
        RENDER_TARGET_FORMAT
    }
}
impl RawTexture for VulkanTexture {
    fn extent(&self) -> Extent {
        self.extent
    }
}

pub(super) fn acceleration_structure_type(
    kind: AccelerationStructureKind,
) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

/// 三角形のgeometryを作成する
pub(super) fn triangles_geometry(
    vertex_address: DeviceAddress,
    vertex_count: u32,
    vertex_stride: u64,
    index_address: DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(vertex_stride)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                })
                .build(),
        })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build()
}

/// インスタンスのgeometryを作成する
pub(super) fn instances_geometry(
    instance_address: DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                })
                .build(),
        })
        .build()
}

/// サイズ問い合わせ用のgeometryとprimitive数
///
/// サイズの問い合わせではアドレスは参照されないので0を入れる。
pub(super) fn geometry_from_inputs(
    inputs: &AccelerationStructureInputs,
) -> (vk::AccelerationStructureGeometryKHR, u32) {
    match *inputs {
        AccelerationStructureInputs::Triangles {
            vertex_count,
            vertex_stride,
            index_count,
        } => (
            triangles_geometry(0, vertex_count, vertex_stride, 0),
            index_count / 3,
        ),
        AccelerationStructureInputs::Instances { instance_count } => {
            (instances_geometry(0), instance_count)
        }
    }
}

/// bufferの領域に置かれたacceleration structure
pub struct VulkanAccelerationStructure {
    structure: ashtray::AccelerationStructureHandle,
    // 格納先のbufferはacceleration structureより長く生きる必要がある
    _storage: ashtray::BufferHandle,
    kind: AccelerationStructureKind,
}
impl VulkanAccelerationStructure {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        kind: AccelerationStructureKind,
        storage: BufferRegion<'_, VulkanDevice>,
        size: u64,
    ) -> Result<Self> {
        let acceleration_structure_create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(storage.buffer.raw())
            .offset(storage.offset)
            .size(size)
            .ty(acceleration_structure_type(kind));
        let structure = device
            .create_acceleration_structure(&acceleration_structure_create_info)
            .map_err(|err| RenderError::AccelerationStructureBuild(err.to_string()))?;
        Ok(Self {
            structure,
            _storage: storage.buffer.objects().buffer.clone(),
            kind,
        })
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.structure.raw()
    }

    pub fn kind(&self) -> AccelerationStructureKind {
        self.kind
    }
}
impl RawAccelerationStructure for VulkanAccelerationStructure {
    fn device_address(&self) -> DeviceAddress {
        self.structure.device_address()
    }
}

/// descriptor set一つ分のdescriptor table
///
/// ShaderResourceはbinding 0がstorage buffer、binding 1がacceleration structureの配列で、
/// どちらも同じスロット番号で参照する。RenderTargetはbinding 0がstorage imageの配列。
pub struct VulkanDescriptorTable {
    set: ashtray::DescriptorSetHandle,
    kind: DescriptorTableKind,
    capacity: u32,
}
impl VulkanDescriptorTable {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        layout: &ashtray::DescriptorSetLayoutHandle,
        kind: DescriptorTableKind,
        capacity: u32,
    ) -> Result<Self> {
        let pool_sizes = match kind {
            DescriptorTableKind::ShaderResource => vec![
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(capacity)
                    .build(),
                vk::DescriptorPoolSize::builder()
                    .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(capacity)
                    .build(),
            ],
            DescriptorTableKind::RenderTarget => vec![vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(capacity)
                .build()],
        };
        let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        let descriptor_pool = device
            .create_descriptor_pool(&descriptor_pool_create_info)
            .map_err(backend_error)?;
        let set = device
            .allocate_descriptor_set(&descriptor_pool, layout)
            .map_err(backend_error)?;
        Ok(Self {
            set,
            kind,
            capacity,
        })
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.set.raw()
    }

    pub fn kind(&self) -> DescriptorTableKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(super) fn write(
        &self,
        device: &ashtray::DeviceHandle,
        index: u32,
        view: DescriptorView<'_, VulkanDevice>,
    ) {
        match view {
            DescriptorView::StorageBuffer {
                buffer,
                offset,
                size,
            } => {
                let buffer_info = vk::DescriptorBufferInfo::builder()
                    .buffer(buffer.raw())
                    .offset(offset)
                    .range(size)
                    .build();
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set.raw())
                    .dst_binding(0)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_info))
                    .build();
                device.update_descriptor_sets(&[write]);
            }
            DescriptorView::AccelerationStructure(structure) => {
                let structures = [structure.raw()];
                let mut acceleration_structure_write =
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(&structures);
                let mut write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set.raw())
                    .dst_binding(1)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut acceleration_structure_write)
                    .build();
                // pNext側の数はbuilderから設定されない
                write.descriptor_count = 1;
                device.update_descriptor_sets(&[write]);
            }
            DescriptorView::StorageTexture(texture) => {
                let image_info = vk::DescriptorImageInfo::builder()
                    .image_view(texture.image_view().raw())
                    .image_layout(vk::ImageLayout::GENERAL)
                    .build();
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set.raw())
                    .dst_binding(0)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_info))
                    .build();
                device.update_descriptor_sets(&[write]);
            }
        }
    }
}
