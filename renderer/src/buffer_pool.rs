//! 用途ごとのGPUのbufferのチャンクからバンプ割り当てを行うBufferPool。
//!
//! 割り当てた領域は個別に解放せず、GPUがプールを使い終わった後に`reset`でまとめて回収する。

use crate::{
    fence::FenceWait,
    gpu::{BufferDesc, BufferRegion, BufferUsage, Device, DeviceAddress, HeapKind, RawBuffer},
    RenderError, Result,
};
use parking_lot::Mutex;
use std::{fmt::Debug, sync::Arc};

/// `value`を`alignment`の倍数に切り上げる
///
/// `alignment`は2の冪でなければならない。
pub fn align(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// BufferPoolの作成パラメータ
#[derive(Debug, Clone)]
pub struct BufferPoolDesc {
    pub label: String,
    pub heap: HeapKind,
    pub usage: BufferUsage,
    /// 新しく作るチャンクの最小サイズ
    pub default_chunk_size: u64,
}

/// BufferPoolの使用状況
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub chunk_count: usize,
    pub capacity: u64,
    pub used: u64,
}

struct BufferChunk<D: Device> {
    buffer: Arc<D::Buffer>,
    capacity: u64,
    current_usage: u64,
}

/// プールから割り当てたbufferの領域
///
/// チャンクのbufferを共有で保持するだけで、プールの所有権は持たない。
pub struct BufferView<D: Device> {
    buffer: Arc<D::Buffer>,
    offset: u64,
    size: u64,
    element_count: u64,
    element_stride: u64,
}
impl<D: Device> BufferView<D> {
    /// チャンクのbuffer
    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    /// チャンク先頭からのバイトオフセット
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// アラインメントに切り上げたバイト数
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    pub fn element_stride(&self) -> u64 {
        self.element_stride
    }

    /// 要素単位のオフセット
    ///
    /// オフセットがstrideで割り切れる場合のみ意味を持つ。
    pub fn first_element(&self) -> u64 {
        if self.element_stride == 0 {
            0
        } else {
            self.offset / self.element_stride
        }
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.buffer.device_address() + self.offset
    }

    /// コマンドやdescriptorに渡す領域
    pub fn region(&self) -> BufferRegion<'_, D> {
        BufferRegion {
            buffer: &self.buffer,
            offset: self.offset,
        }
    }

    /// Upload heapの領域にバイト列を書き込む
    pub fn write(&self, data: &[u8]) -> Result<()> {
        assert!(
            data.len() as u64 <= self.size,
            "write of {} bytes into a view of {} bytes",
            data.len(),
            self.size
        );
        self.buffer.write(self.offset, data)
    }

    /// Upload heapの領域にPodの配列を書き込む
    pub fn write_pod<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write(bytemuck::cast_slice(data))
    }
}
impl<D: Device> Clone for BufferView<D> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset,
            size: self.size,
            element_count: self.element_count,
            element_stride: self.element_stride,
        }
    }
}
impl<D: Device> Debug for BufferView<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("address", &self.device_address())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("element_count", &self.element_count)
            .field("element_stride", &self.element_stride)
            .finish()
    }
}

/// 一つの用途のbufferのチャンクを束ねたバンプアロケータ
pub struct BufferPool<D: Device> {
    desc: BufferPoolDesc,
    granularity: u64,
    chunks: Mutex<Vec<BufferChunk<D>>>,
    last_use: Mutex<Option<FenceWait>>,
    device: Arc<D>,
}
impl<D: Device> BufferPool<D> {
    /// 空のプールを作成する
    pub fn new(device: Arc<D>, desc: BufferPoolDesc) -> Self {
        let granularity = device.limits().allocation_granularity;
        Self {
            desc,
            granularity,
            chunks: Mutex::new(vec![]),
            last_use: Mutex::new(None),
            device,
        }
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    /// `element_count * element_stride`バイトを`alignment`に揃えて割り当てる
    ///
    /// 作成順に見て最初に収まるチャンクを使い、どれにも収まらなければ新しいチャンクを作る。
    pub fn allocate(
        &self,
        alignment: u64,
        element_count: u64,
        element_stride: u64,
    ) -> Result<BufferView<D>> {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        let size = element_count
            .checked_mul(element_stride)
            .and_then(|bytes| bytes.checked_add(alignment - 1))
            .map(|bytes| bytes & !(alignment - 1))
            .ok_or_else(|| RenderError::OutOfDeviceMemory {
                label: self.desc.label.clone(),
                size: u64::MAX,
            })?;

        let mut chunks = self.chunks.lock();
        for chunk in chunks.iter_mut() {
            let offset = align(chunk.current_usage, alignment);
            if offset + size <= chunk.capacity {
                chunk.current_usage = offset + size;
                return Ok(BufferView {
                    buffer: chunk.buffer.clone(),
                    offset,
                    size,
                    element_count,
                    element_stride,
                });
            }
        }

        // 新しいチャンクの作成
        let capacity = align(size.max(self.desc.default_chunk_size), self.granularity);
        let buffer = Arc::new(self.device.create_buffer(&BufferDesc {
            label: &self.desc.label,
            heap: self.desc.heap,
            usage: self.desc.usage,
            size: capacity,
        })?);
        log::debug!(
            "buffer pool `{}`: new chunk #{} of {capacity} bytes",
            self.desc.label,
            chunks.len()
        );
        chunks.push(BufferChunk {
            buffer: buffer.clone(),
            capacity,
            current_usage: size,
        });
        Ok(BufferView {
            buffer,
            offset: 0,
            size,
            element_count,
            element_stride,
        })
    }

    /// 最後にこのプールを使ったGPUの処理を記録する
    pub fn retire_after(&self, wait: &FenceWait) {
        *self.last_use.lock() = Some(wait.clone());
    }

    /// 記録された最後の使用が終わるまで待機する
    pub fn wait_last_use(&self) -> Result<()> {
        let last_use = self.last_use.lock().clone();
        match last_use {
            Some(wait) => wait.wait(),
            None => Ok(()),
        }
    }

    /// すべてのチャンクの使用量を0に戻す
    ///
    /// GPUがこのプールの領域にアクセスしていないことが前提。
    /// `retire_after`で記録した処理が終わっていなければdebugビルドではpanicする。
    pub fn reset(&self) {
        debug_assert!(
            self.last_use
                .lock()
                .as_ref()
                .map_or(true, |wait| wait.is_complete()),
            "buffer pool `{}` reset while the GPU may still access it",
            self.desc.label
        );
        for chunk in self.chunks.lock().iter_mut() {
            chunk.current_usage = 0;
        }
    }

    /// 使用量0のチャンクを解放する
    pub fn shrink(&self) {
        let mut chunks = self.chunks.lock();
        let before = chunks.len();
        chunks.retain(|chunk| chunk.current_usage != 0);
        if chunks.len() != before {
            log::debug!(
                "buffer pool `{}`: released {} empty chunks",
                self.desc.label,
                before - chunks.len()
            );
        }
    }

    /// 使用状況を取得する
    pub fn stats(&self) -> PoolStats {
        let chunks = self.chunks.lock();
        PoolStats {
            chunk_count: chunks.len(),
            capacity: chunks.iter().map(|chunk| chunk.capacity).sum(),
            used: chunks.iter().map(|chunk| chunk.current_usage).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fence::Fence, gpu::headless::HeadlessDevice, RenderError};

    const KIB: u64 = 1024;

    fn pool(device: &Arc<HeadlessDevice>, default_chunk_size: u64) -> BufferPool<HeadlessDevice> {
        BufferPool::new(
            device.clone(),
            BufferPoolDesc {
                label: String::from("test"),
                heap: HeapKind::Upload,
                usage: BufferUsage::STORAGE,
                default_chunk_size,
            },
        )
    }

    fn same_chunk(a: &BufferView<HeadlessDevice>, b: &BufferView<HeadlessDevice>) -> bool {
        a.buffer().id() == b.buffer().id()
    }

    #[test]
    fn align_rounds_up_to_power_of_two() {
        assert_eq!(align(0, 256), 0);
        assert_eq!(align(1, 256), 256);
        assert_eq!(align(256, 256), 256);
        assert_eq!(align(257, 64), 320);
    }

    #[test]
    fn allocations_are_aligned_and_sized() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let a = pool.allocate(4, 3, 1).unwrap();
        let b = pool.allocate(256, 10, 12).unwrap();
        let c = pool.allocate(16, 1, 1).unwrap();

        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 4);
        assert_eq!(b.offset() % 256, 0);
        assert_eq!(b.size(), 256);
        assert_eq!(b.offset(), 256);
        assert_eq!(c.offset() % 16, 0);
        assert_eq!(c.size(), 16);
        assert_eq!(b.device_address(), b.buffer().device_address() + 256);
    }

    #[test]
    fn allocations_within_a_chunk_do_not_overlap() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let mut views = vec![];
        for i in 0..64u64 {
            let alignment = 1 << (i % 9);
            views.push(pool.allocate(alignment, i % 7 + 1, 13).unwrap());
        }
        for (i, a) in views.iter().enumerate() {
            for b in views.iter().skip(i + 1) {
                if same_chunk(a, b) {
                    let disjoint = a.offset() + a.size() <= b.offset()
                        || b.offset() + b.size() <= a.offset();
                    assert!(disjoint, "{a:?} overlaps {b:?}");
                }
            }
        }
    }

    #[test]
    fn oversize_request_creates_a_dedicated_chunk() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let small = pool.allocate(16, 60 * KIB, 1).unwrap();
        let big = pool.allocate(16, 250 * KIB, 1).unwrap();
        assert!(!same_chunk(&small, &big));
        assert_eq!(big.offset(), 0);
        assert!(big.buffer().size() >= 250 * KIB);
        assert_eq!(big.buffer().size() % (64 * KIB), 0);

        // 最初のチャンクに収まる要求は最初のチャンクに入る
        let fits = pool.allocate(16, 2 * KIB, 1).unwrap();
        assert!(same_chunk(&small, &fits));

        // どちらにも収まらない要求は三つ目のチャンクになる
        let third = pool.allocate(16, 10 * KIB, 1).unwrap();
        assert!(!same_chunk(&third, &small));
        assert!(!same_chunk(&third, &big));
        assert_eq!(pool.stats().chunk_count, 3);
    }

    #[test]
    fn reset_of_an_empty_pool_is_a_no_op() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        pool.reset();
        pool.reset();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn reset_rewinds_every_chunk() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let first = pool.allocate(16, 1024, 1).unwrap();
        pool.allocate(16, 100 * KIB, 1).unwrap();
        pool.reset();
        assert_eq!(pool.stats().used, 0);
        assert_eq!(pool.stats().chunk_count, 2);

        let again = pool.allocate(16, 1024, 1).unwrap();
        assert!(same_chunk(&first, &again));
        assert_eq!(again.offset(), 0);
    }

    #[test]
    fn shrink_releases_only_unused_chunks() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        pool.allocate(16, 1024, 1).unwrap();
        pool.allocate(16, 100 * KIB, 1).unwrap();
        pool.reset();
        let kept = pool.allocate(16, 1024, 1).unwrap();

        pool.shrink();
        assert_eq!(pool.stats().chunk_count, 1);
        let next = pool.allocate(16, 16, 1).unwrap();
        assert!(same_chunk(&kept, &next));
        assert_eq!(next.offset(), 1024);
    }

    #[test]
    fn shrink_after_reset_returns_device_memory() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let view = pool.allocate(16, 16, 1).unwrap();
        drop(view);
        pool.reset();
        pool.shrink();
        assert_eq!(pool.stats().chunk_count, 0);
        assert_eq!(device.stats().live_buffer_bytes, 0);
    }

    #[test]
    fn write_reaches_the_chunk_at_the_view_offset() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        pool.allocate(16, 3, 1).unwrap();
        let view = pool.allocate(16, 2, 4).unwrap();
        view.write_pod(&[7u32, 9u32]).unwrap();
        assert_eq!(view.buffer().read(16, 8), bytemuck::cast_slice::<u32, u8>(&[7, 9]));
    }

    #[test]
    fn out_of_memory_is_propagated() {
        let device = Arc::new(HeadlessDevice::new().with_memory_budget(64 * KIB));
        let pool = pool(&device, 64 * KIB);
        pool.allocate(16, 1024, 1).unwrap();
        let err = pool.allocate(16, 100 * KIB, 1).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory { .. }));
    }

    #[test]
    fn overflowing_request_is_out_of_memory() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 64 * KIB);
        let err = pool.allocate(16, u64::MAX / 2, 3).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory { size: u64::MAX, .. }));
        let err = pool.allocate(256, 1, u64::MAX - 8).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory { .. }));
        assert_eq!(pool.stats().chunk_count, 0);
    }

    #[test]
    fn concurrent_allocations_do_not_overlap() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = pool(&device, 4 * KIB);
        let views = std::thread::scope(|scope| {
            let workers = (0..8u64)
                .map(|worker| {
                    let pool = &pool;
                    scope.spawn(move || {
                        (0..64u64)
                            .map(|i| {
                                let alignment = 1 << ((worker + i) % 8);
                                pool.allocate(alignment, i % 5 + 1, 24).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(views.len(), 8 * 64);

        for (i, a) in views.iter().enumerate() {
            assert!(a.offset() + a.size() <= a.buffer().size());
            for b in views.iter().skip(i + 1) {
                if same_chunk(a, b) {
                    let disjoint = a.offset() + a.size() <= b.offset()
                        || b.offset() + b.size() <= a.offset();
                    assert!(disjoint, "{a:?} overlaps {b:?}");
                }
            }
        }
        let used = views.iter().map(|view| view.size()).sum::<u64>();
        assert!(pool.stats().used >= used);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_alignment_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let _ = pool(&device, 64 * KIB).allocate(24, 1, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "may still access it")]
    fn reset_before_last_use_retires_panics() {
        let device = Arc::new(HeadlessDevice::deferred());
        let fence = Fence::new(device.clone()).unwrap();
        let pool = pool(&device, 64 * KIB);
        pool.allocate(16, 16, 1).unwrap();
        pool.retire_after(&fence.signal().unwrap());
        pool.reset();
    }

    #[test]
    fn reset_after_last_use_retires() {
        let device = Arc::new(HeadlessDevice::deferred());
        let fence = Fence::new(device.clone()).unwrap();
        let pool = pool(&device, 64 * KIB);
        pool.allocate(16, 16, 1).unwrap();
        pool.retire_after(&fence.signal().unwrap());
        device.retire_all();
        pool.wait_last_use().unwrap();
        pool.reset();
        assert_eq!(pool.stats().used, 0);
    }
}
