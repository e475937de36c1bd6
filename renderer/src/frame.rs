//! フレームごとのリソースの束と、それをGPUの進行に合わせて使い回すFrameResourceTracker。
//!
//! フレーム数は固定せず、GPUが古いフレームを処理し終えていなければ新しい束を作る。

use crate::{
    buffer_pool::{BufferPool, BufferPoolDesc},
    descriptor::DescriptorHeapAccumulator,
    fence::{Fence, FenceValue, FenceWait},
    gpu::{BufferUsage, Device, HeapKind, RawCommandList},
    Result,
};
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// フレームのリソースのサイズ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub upload_chunk_size: u64,
    pub scratch_chunk_size: u64,
    pub acceleration_structure_chunk_size: u64,
    pub descriptor_capacity: u32,
}
impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            upload_chunk_size: 4 * 1024 * 1024,
            scratch_chunk_size: 4 * 1024 * 1024,
            acceleration_structure_chunk_size: 4 * 1024 * 1024,
            descriptor_capacity: 1024,
        }
    }
}

/// フレームの処理中に借りるリソースへの参照の組
pub struct FrameParts<'a, D: Device> {
    pub upload: &'a BufferPool<D>,
    pub scratch: &'a BufferPool<D>,
    pub acceleration_structures: &'a BufferPool<D>,
    pub descriptors: &'a DescriptorHeapAccumulator<D>,
    pub command_list: &'a mut D::CommandList,
    pub retained: &'a mut Vec<Box<dyn Any + Send + Sync>>,
}

/// 一つのフレームで使うリソースの束
pub struct FrameResources<D: Device> {
    index: usize,
    upload: BufferPool<D>,
    scratch: BufferPool<D>,
    acceleration_structures: BufferPool<D>,
    descriptors: DescriptorHeapAccumulator<D>,
    command_list: D::CommandList,
    command_allocator: D::CommandAllocator,
    retained: Vec<Box<dyn Any + Send + Sync>>,
    device: Arc<D>,
}
impl<D: Device> FrameResources<D> {
    fn new(device: Arc<D>, index: usize, config: &FrameConfig) -> Result<Self> {
        let pool = |name: &str, heap, usage, default_chunk_size| {
            BufferPool::new(
                device.clone(),
                BufferPoolDesc {
                    label: format!("frame {index} {name}"),
                    heap,
                    usage,
                    default_chunk_size,
                },
            )
        };
        let upload = pool(
            "upload",
            HeapKind::Upload,
            BufferUsage::STORAGE
                | BufferUsage::TRANSFER_SRC
                | BufferUsage::ACCELERATION_STRUCTURE_INPUT
                | BufferUsage::SHADER_BINDING_TABLE,
            config.upload_chunk_size,
        );
        let scratch = pool(
            "scratch",
            HeapKind::Default,
            BufferUsage::STORAGE,
            config.scratch_chunk_size,
        );
        let acceleration_structures = pool(
            "acceleration structures",
            HeapKind::Default,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            config.acceleration_structure_chunk_size,
        );
        let descriptors = DescriptorHeapAccumulator::new(device.clone(), config.descriptor_capacity)?;
        let command_allocator = device.create_command_allocator()?;
        let command_list = device.create_command_list(&command_allocator)?;

        Ok(Self {
            index,
            upload,
            scratch,
            acceleration_structures,
            descriptors,
            command_list,
            command_allocator,
            retained: vec![],
            device,
        })
    }

    /// 作成順の番号
    pub fn index(&self) -> usize {
        self.index
    }

    /// 全てのプールを空にしてcommand listの記録を開始する
    ///
    /// 前回の使用をGPUが処理し終えていることが前提。
    pub fn reset(&mut self) -> Result<()> {
        self.upload.reset();
        self.scratch.reset();
        self.acceleration_structures.reset();
        self.descriptors.reset();
        self.retained.clear();
        self.device
            .reset_command_allocator(&mut self.command_allocator)?;
        RawCommandList::<D>::begin(&mut self.command_list, &self.command_allocator)?;
        Ok(())
    }

    /// 各リソースへの参照を同時に借りる
    pub fn parts(&mut self) -> FrameParts<'_, D> {
        FrameParts {
            upload: &self.upload,
            scratch: &self.scratch,
            acceleration_structures: &self.acceleration_structures,
            descriptors: &self.descriptors,
            command_list: &mut self.command_list,
            retained: &mut self.retained,
        }
    }

    pub fn upload(&self) -> &BufferPool<D> {
        &self.upload
    }

    pub fn scratch(&self) -> &BufferPool<D> {
        &self.scratch
    }

    pub fn acceleration_structures(&self) -> &BufferPool<D> {
        &self.acceleration_structures
    }

    pub fn descriptors(&self) -> &DescriptorHeapAccumulator<D> {
        &self.descriptors
    }

    pub fn command_list(&mut self) -> &mut D::CommandList {
        &mut self.command_list
    }

    /// GPUがこのフレームを処理し終えるまでオブジェクトを生かしておく
    pub fn retain<T: Any + Send + Sync>(&mut self, object: T) {
        self.retained.push(Box::new(object));
    }

    fn retire_after(&self, wait: &FenceWait) {
        self.upload.retire_after(wait);
        self.scratch.retire_after(wait);
        self.acceleration_structures.retire_after(wait);
    }
}

/// フレームのリソースを貸し出し、GPUが処理し終えたものを再利用するトラッカー
pub struct FrameResourceTracker<D: Device> {
    config: FrameConfig,
    fence: Fence<D>,
    queue: Mutex<VecDeque<(FenceValue, FrameResources<D>)>>,
    frames_created: Mutex<usize>,
    device: Arc<D>,
}
impl<D: Device> FrameResourceTracker<D> {
    pub fn new(device: Arc<D>, config: FrameConfig) -> Result<Self> {
        Ok(Self {
            config,
            fence: Fence::new(device.clone())?,
            queue: Mutex::new(VecDeque::new()),
            frames_created: Mutex::new(0),
            device,
        })
    }

    /// 記録を開始した状態のフレームを借りる
    pub fn get(&self) -> Result<FrameLease<'_, D>> {
        let reusable = {
            let mut queue = self.queue.lock();
            match queue.front() {
                Some((value, _)) if *value <= self.fence.completed_value() => {
                    queue.pop_front().map(|(_, frame)| frame)
                }
                _ => None,
            }
        };

        let mut frame = match reusable {
            Some(frame) => frame,
            None => {
                let index = {
                    let mut frames_created = self.frames_created.lock();
                    *frames_created += 1;
                    *frames_created - 1
                };
                log::debug!("frame resource tracker: new frame resources #{index}");
                FrameResources::new(self.device.clone(), index, &self.config)?
            }
        };
        frame.reset()?;

        Ok(FrameLease {
            tracker: self,
            frame: Some(frame),
        })
    }

    /// これまでに作成したFrameResourcesの数
    pub fn frames_created(&self) -> usize {
        *self.frames_created.lock()
    }

    /// 再利用を待っているフレームの数
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn fence(&self) -> &Fence<D> {
        &self.fence
    }

    /// 返却されたすべてのフレームをGPUが処理し終えるまで待機する
    pub fn wait_idle(&self) -> Result<()> {
        self.fence.wait_idle()
    }

    fn release(&self, frame: FrameResources<D>) -> Result<FenceWait> {
        let mut queue = self.queue.lock();
        let wait = self.fence.signal()?;
        frame.retire_after(&wait);
        queue.push_back((wait.value(), frame));
        Ok(wait)
    }
}

/// 借りているフレーム
///
/// dropされるとtrackerのfenceをsignalしてフレームをキューに戻す。
pub struct FrameLease<'a, D: Device> {
    tracker: &'a FrameResourceTracker<D>,
    frame: Option<FrameResources<D>>,
}
impl<D: Device> FrameLease<'_, D> {
    /// command listをcloseしてキューで実行する
    pub fn submit(&mut self) -> Result<()> {
        let frame = &mut **self;
        frame.command_list.close()?;
        frame.device.execute(&frame.command_list)
    }

    /// フレームを返却して、GPUがフレームを処理し終えるのを待つFenceWaitを返す
    pub fn release(mut self) -> Result<FenceWait> {
        match self.frame.take() {
            Some(frame) => self.tracker.release(frame),
            None => unreachable!("frame lease released twice"),
        }
    }
}
impl<D: Device> Deref for FrameLease<'_, D> {
    type Target = FrameResources<D>;

    fn deref(&self) -> &Self::Target {
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease used after release"),
        }
    }
}
impl<D: Device> DerefMut for FrameLease<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease used after release"),
        }
    }
}
impl<D: Device> Drop for FrameLease<'_, D> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if let Err(err) = self.tracker.release(frame) {
                log::error!("failed to release frame resources: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn small_config() -> FrameConfig {
        FrameConfig {
            upload_chunk_size: 4096,
            scratch_chunk_size: 4096,
            acceleration_structure_chunk_size: 4096,
            descriptor_capacity: 16,
        }
    }

    #[test]
    fn completed_frame_is_reused() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device, small_config()).unwrap();
        let mut lease = tracker.get().unwrap();
        assert_eq!(lease.index(), 0);
        lease.submit().unwrap();
        lease.release().unwrap();

        let lease = tracker.get().unwrap();
        assert_eq!(lease.index(), 0);
        assert_eq!(tracker.frames_created(), 1);
    }

    #[test]
    fn frame_in_flight_is_not_handed_out_again() {
        let device = Arc::new(HeadlessDevice::deferred());
        let tracker = FrameResourceTracker::new(device.clone(), small_config()).unwrap();
        let first = tracker.get().unwrap();
        let wait = first.release().unwrap();
        assert!(!wait.is_complete());

        let second = tracker.get().unwrap();
        assert_eq!(second.index(), 1);
        drop(second);
        assert_eq!(tracker.frames_created(), 2);

        device.retire_all();
        let third = tracker.get().unwrap();
        assert_eq!(third.index(), 0);
    }

    #[test]
    fn dropping_a_lease_requeues_the_frame() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device, small_config()).unwrap();
        {
            let _lease = tracker.get().unwrap();
            assert_eq!(tracker.queued(), 0);
        }
        assert_eq!(tracker.queued(), 1);
        assert_eq!(tracker.fence().last_signaled(), 1);
    }

    #[test]
    fn reused_frame_starts_empty() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device, small_config()).unwrap();
        let mut lease = tracker.get().unwrap();
        lease.upload().allocate(16, 100, 1).unwrap();
        lease.retain(String::from("kept alive"));
        lease.submit().unwrap();
        lease.release().unwrap();

        let lease = tracker.get().unwrap();
        assert_eq!(lease.upload().stats().used, 0);
        assert_eq!(lease.upload().stats().chunk_count, 1);
    }

    #[test]
    fn wait_idle_waits_for_every_released_frame() {
        let device = Arc::new(HeadlessDevice::deferred());
        let tracker = Arc::new(FrameResourceTracker::new(device.clone(), small_config()).unwrap());
        tracker.get().unwrap().release().unwrap();
        tracker.get().unwrap().release().unwrap();

        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait_idle())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        device.retire_all();
        waiter.join().unwrap().unwrap();
    }
}
