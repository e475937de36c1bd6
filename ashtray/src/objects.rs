//! Deviceから作られる子オブジェクトを定義する。
//! どのオブジェクトも生成元のDeviceHandleを保持し、
//! 最後のHandleが破棄された時に対応するdestroy関数を呼ぶ。

use ash::vk;
use std::ops::Deref;

macro_rules! device_object {
    ($(#[$meta:meta])* $name:ident, $handle:ident, $raw:ty, $destroy:ident) => {
        $(#[$meta])*
        pub struct $name {
            device: crate::DeviceHandle,
            raw: $raw,
        }
        impl $name {
            pub(crate) fn new(device: crate::DeviceHandle, raw: $raw) -> crate::Handle<Self> {
                crate::Handle::new(Self { device, raw })
            }

            /// 生のVulkanのハンドルを取得する
            pub fn raw(&self) -> $raw {
                self.raw
            }

            /// 生成元のDeviceHandleを取得する
            pub fn device(&self) -> &crate::DeviceHandle {
                &self.device
            }
        }
        impl crate::Destroy for $name {
            unsafe fn destroy(&mut self) {
                self.device.$destroy(self.raw, None);
            }
        }
        impl Deref for $name {
            type Target = $raw;
            fn deref(&self) -> &Self::Target {
                &self.raw
            }
        }

        #[doc = concat!("`", stringify!($name), "`を参照カウントで管理するためのハンドル")]
        pub type $handle = crate::Handle<$name>;
    };
}

device_object!(
    /// vk::Buffer
    Buffer, BufferHandle, vk::Buffer, destroy_buffer
);
device_object!(
    /// vk::CommandPool
    CommandPool, CommandPoolHandle, vk::CommandPool, destroy_command_pool
);
device_object!(
    /// vk::Semaphore
    Semaphore, SemaphoreHandle, vk::Semaphore, destroy_semaphore
);
device_object!(
    /// vk::DescriptorPool
    DescriptorPool, DescriptorPoolHandle, vk::DescriptorPool, destroy_descriptor_pool
);
device_object!(
    /// vk::DescriptorSetLayout
    DescriptorSetLayout, DescriptorSetLayoutHandle, vk::DescriptorSetLayout, destroy_descriptor_set_layout
);
device_object!(
    /// vk::PipelineLayout
    PipelineLayout, PipelineLayoutHandle, vk::PipelineLayout, destroy_pipeline_layout
);
device_object!(
    /// vk::ShaderModule
    ShaderModule, ShaderModuleHandle, vk::ShaderModule, destroy_shader_module
);
device_object!(
    /// ray tracing pipelineかcompute pipelineのvk::Pipeline
    Pipeline, PipelineHandle, vk::Pipeline, destroy_pipeline
);
device_object!(
    /// vk::Image
    Image, ImageHandle, vk::Image, destroy_image
);
device_object!(
    /// vk::ImageView
    ImageView, ImageViewHandle, vk::ImageView, destroy_image_view
);

/// CommandPoolから割り当てたvk::CommandBuffer
pub struct CommandBuffer {
    command_pool: crate::CommandPoolHandle,
    raw: vk::CommandBuffer,
}
impl CommandBuffer {
    pub(crate) fn new(command_pool: crate::CommandPoolHandle, raw: vk::CommandBuffer) -> crate::Handle<Self> {
        crate::Handle::new(Self { command_pool, raw })
    }

    /// 生のVulkanのハンドルを取得する
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// 割り当て元のCommandPoolHandleを取得する
    pub fn command_pool(&self) -> &crate::CommandPoolHandle {
        &self.command_pool
    }
}
impl crate::Destroy for CommandBuffer {
    unsafe fn destroy(&mut self) {
        self.command_pool
            .device()
            .free_command_buffers(self.command_pool.raw(), &[self.raw]);
    }
}
impl Deref for CommandBuffer {
    type Target = vk::CommandBuffer;
    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

/// CommandBufferを参照カウントで管理するためのハンドル
pub type CommandBufferHandle = crate::Handle<CommandBuffer>;

/// DescriptorPoolから割り当てたvk::DescriptorSet
///
/// DescriptorSetはpoolと一緒に解放されるので、個別のdestroy処理は持たない。
pub struct DescriptorSet {
    descriptor_pool: crate::DescriptorPoolHandle,
    raw: vk::DescriptorSet,
}
impl DescriptorSet {
    pub(crate) fn new(
        descriptor_pool: crate::DescriptorPoolHandle,
        raw: vk::DescriptorSet,
    ) -> crate::Handle<Self> {
        crate::Handle::new(Self {
            descriptor_pool,
            raw,
        })
    }

    /// 生のVulkanのハンドルを取得する
    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }

    /// 割り当て元のDescriptorPoolHandleを取得する
    pub fn descriptor_pool(&self) -> &crate::DescriptorPoolHandle {
        &self.descriptor_pool
    }
}
impl crate::Destroy for DescriptorSet {
    unsafe fn destroy(&mut self) {}
}

/// DescriptorSetを参照カウントで管理するためのハンドル
pub type DescriptorSetHandle = crate::Handle<DescriptorSet>;

/// vk::AccelerationStructureKHRとそのデバイスアドレス
pub struct AccelerationStructure {
    device: crate::DeviceHandle,
    raw: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
}
impl AccelerationStructure {
    pub(crate) fn new(
        device: crate::DeviceHandle,
        raw: vk::AccelerationStructureKHR,
    ) -> crate::Handle<Self> {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(raw);
        let device_address = unsafe {
            device
                .acceleration_structure_loader()
                .get_acceleration_structure_device_address(&info)
        };
        crate::Handle::new(Self {
            device,
            raw,
            device_address,
        })
    }

    /// 生のVulkanのハンドルを取得する
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    /// acceleration structureのデバイスアドレスを取得する
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}
impl crate::Destroy for AccelerationStructure {
    unsafe fn destroy(&mut self) {
        self.device
            .acceleration_structure_loader()
            .destroy_acceleration_structure(self.raw, None);
    }
}
impl Deref for AccelerationStructure {
    type Target = vk::AccelerationStructureKHR;
    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

/// AccelerationStructureを参照カウントで管理するためのハンドル
pub type AccelerationStructureHandle = crate::Handle<AccelerationStructure>;
