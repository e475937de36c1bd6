//! command allocatorとcommand listの組を使い回すCommandListPool。

use crate::{
    fence::{Fence, FenceValue, FenceWait},
    gpu::{Device, RawCommandList},
    Result,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// 記録中のcommand listとそのallocator
///
/// `CommandListPool::submit`に渡すと消費される。
pub struct CommandListHandle<D: Device> {
    allocator: D::CommandAllocator,
    list: D::CommandList,
}
impl<D: Device> CommandListHandle<D> {
    pub fn allocator(&self) -> &D::CommandAllocator {
        &self.allocator
    }
}
impl<D: Device> Deref for CommandListHandle<D> {
    type Target = D::CommandList;

    fn deref(&self) -> &Self::Target {
        &self.list
    }
}
impl<D: Device> DerefMut for CommandListHandle<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.list
    }
}

struct RetiredPair<D: Device> {
    value: FenceValue,
    allocator: D::CommandAllocator,
    list: D::CommandList,
}

/// フレームの外で使うcommand listのプール
///
/// 提出したcommand listはその時のfenceの値と一緒にキューに積まれ、
/// 最も古いものの値にGPUが到達していれば次の`acquire`で再利用される。
pub struct CommandListPool<D: Device> {
    fence: Fence<D>,
    retired: Mutex<VecDeque<RetiredPair<D>>>,
    device: Arc<D>,
}
impl<D: Device> CommandListPool<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        Ok(Self {
            fence: Fence::new(device.clone())?,
            retired: Mutex::new(VecDeque::new()),
            device,
        })
    }

    /// 記録を開始したcommand listを取得する
    pub fn acquire(&self) -> Result<CommandListHandle<D>> {
        let reusable = {
            let mut retired = self.retired.lock();
            match retired.front() {
                Some(oldest) if oldest.value <= self.fence.completed_value() => retired.pop_front(),
                _ => None,
            }
        };

        let mut handle = match reusable {
            Some(RetiredPair {
                mut allocator,
                list,
                ..
            }) => {
                self.device.reset_command_allocator(&mut allocator)?;
                CommandListHandle { allocator, list }
            }
            None => {
                let allocator = self.device.create_command_allocator()?;
                let list = self.device.create_command_list(&allocator)?;
                log::debug!(
                    "command list pool: new command allocator ({} pending)",
                    self.pending()
                );
                CommandListHandle { allocator, list }
            }
        };
        RawCommandList::<D>::begin(&mut handle.list, &handle.allocator)?;
        Ok(handle)
    }

    /// command listをcloseしてキューで実行し、fenceをsignalする
    pub fn submit(&self, mut handle: CommandListHandle<D>) -> Result<FenceWait> {
        handle.list.close()?;
        // 実行とsignalの順序をキューの順序と揃える
        let mut retired = self.retired.lock();
        self.device.execute(&handle.list)?;
        let wait = self.fence.signal()?;
        retired.push_back(RetiredPair {
            value: wait.value(),
            allocator: handle.allocator,
            list: handle.list,
        });
        Ok(wait)
    }

    /// コマンドを実行せずにfenceだけをsignalする
    pub fn flush(&self) -> Result<FenceWait> {
        let _retired = self.retired.lock();
        self.fence.signal()
    }

    pub fn fence(&self) -> &Fence<D> {
        &self.fence
    }

    /// 再利用を待っている組の数
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessCommand, HeadlessDevice};

    #[test]
    fn submissions_get_strictly_increasing_values() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = CommandListPool::new(device).unwrap();
        let mut last = 0;
        for _ in 0..5 {
            let list = pool.acquire().unwrap();
            let value = pool.submit(list).unwrap().value();
            assert!(value > last);
            last = value;
        }
        assert_eq!(pool.flush().unwrap().value(), last + 1);
    }

    #[test]
    fn completed_pair_is_reused() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = CommandListPool::new(device.clone()).unwrap();
        let first = pool.acquire().unwrap();
        let first_id = first.allocator().id();
        pool.submit(first).unwrap();

        let second = pool.acquire().unwrap();
        assert_eq!(second.allocator().id(), first_id);
        assert_eq!(second.allocator().resets(), 1);
        assert_eq!(device.stats().command_allocators_created, 1);
    }

    #[test]
    fn pending_pair_is_not_reused() {
        let device = Arc::new(HeadlessDevice::deferred());
        let pool = CommandListPool::new(device.clone()).unwrap();
        let first = pool.acquire().unwrap();
        let first_id = first.allocator().id();
        pool.submit(first).unwrap();

        let second = pool.acquire().unwrap();
        assert_ne!(second.allocator().id(), first_id);
        assert_eq!(pool.pending(), 1);

        device.retire_all();
        let third = pool.acquire().unwrap();
        assert_eq!(third.allocator().id(), first_id);
        assert_eq!(pool.pending(), 0);
        drop(second);
    }

    #[test]
    fn pairs_are_reused_in_submission_order() {
        let device = Arc::new(HeadlessDevice::deferred());
        let pool = CommandListPool::new(device.clone()).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let (a_id, b_id) = (a.allocator().id(), b.allocator().id());
        pool.submit(b).unwrap();
        pool.submit(a).unwrap();
        device.retire_all();

        assert_eq!(pool.acquire().unwrap().allocator().id(), b_id);
        assert_eq!(pool.acquire().unwrap().allocator().id(), a_id);
    }

    #[test]
    fn submitted_commands_reach_the_queue() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = CommandListPool::new(device.clone()).unwrap();
        let mut list = pool.acquire().unwrap();
        list.barrier();
        let wait = pool.submit(list).unwrap();
        wait.wait().unwrap();

        let executed = device.take_executed();
        assert_eq!(executed.len(), 1);
        assert!(matches!(executed[0].as_slice(), [HeadlessCommand::Barrier]));
    }
}
