//! gpu-allocatorのAllocatorと、そこから割り当てたAllocationを定義する。
//! AllocationはDrop時に自動でAllocatorへ返却される。

use anyhow::{anyhow, Result};
use gpu_allocator::vulkan::AllocatorCreateDesc;
use parking_lot::Mutex;

/// gpu-allocatorのAllocator
pub struct Allocator {
    // deviceより先にdropされる必要がある
    allocator: Mutex<gpu_allocator::vulkan::Allocator>,
    device: crate::DeviceHandle,
}
impl Allocator {
    pub(crate) fn create(device: crate::DeviceHandle) -> Result<crate::AllocatorHandle> {
        let instance: &ash::Instance = device.instance();
        let raw_device: &ash::Device = &device;
        let allocator = gpu_allocator::vulkan::Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: raw_device.clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;
        Ok(crate::Handle::new(Self {
            allocator: Mutex::new(allocator),
            device,
        }))
    }

    /// 生成元のDeviceHandleを取得する
    pub fn device(&self) -> &crate::DeviceHandle {
        &self.device
    }
}

/// Allocatorを参照カウントで管理するためのハンドル
pub type AllocatorHandle = crate::Handle<Allocator>;

impl crate::Handle<Allocator> {
    /// AllocationHandleを割り当てる
    pub fn allocate(
        &self,
        allocation_create_desc: &gpu_allocator::vulkan::AllocationCreateDesc,
    ) -> Result<crate::AllocationHandle> {
        let allocation = self.allocator.lock().allocate(allocation_create_desc)?;
        Ok(crate::Handle::new(Allocation {
            allocation: Mutex::new(Some(allocation)),
            allocator: self.clone(),
        }))
    }
}

impl crate::Destroy for Allocator {
    unsafe fn destroy(&mut self) {
        self.allocator.lock().report_memory_leaks(log::Level::Warn);
    }
}

/// Allocatorから割り当てたメモリ
pub struct Allocation {
    allocation: Mutex<Option<gpu_allocator::vulkan::Allocation>>,
    allocator: crate::AllocatorHandle,
}
impl Allocation {
    /// vk::DeviceMemoryとそのオフセットを取得する
    pub fn memory(&self) -> Result<(ash::vk::DeviceMemory, u64)> {
        let allocation = self.allocation.lock();
        let allocation = allocation
            .as_ref()
            .ok_or_else(|| anyhow!("Allocation already freed."))?;
        Ok((unsafe { allocation.memory() }, allocation.offset()))
    }

    /// メモリのサイズを取得する
    pub fn size(&self) -> u64 {
        self.allocation
            .lock()
            .as_ref()
            .map_or(0, |allocation| allocation.size())
    }

    /// CPUから見えるメモリの指定のオフセットにデータを書き込む
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut allocation = self.allocation.lock();
        let allocation = allocation
            .as_mut()
            .ok_or_else(|| anyhow!("Allocation already freed."))?;
        presser::copy_from_slice_to_offset(data, allocation, offset)
            .map_err(|err| anyhow!("Failed to copy to allocation: {err:?}"))?;
        Ok(())
    }
}
impl crate::Destroy for Allocation {
    unsafe fn destroy(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(err) = self.allocator.allocator.lock().free(allocation) {
                log::error!("Failed to free allocation: {err}");
            }
        }
    }
}

/// Allocationを参照カウントで管理するためのハンドル
pub type AllocationHandle = crate::Handle<Allocation>;
