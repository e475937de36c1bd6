//! CPUだけで動作するDeviceの実装。
//!
//! bufferはホストメモリ上に置かれ、command listに記録したコマンドは
//! `execute`の時点でbufferのコピーだけが実際に適用される。
//! それ以外のコマンドは記録として残るので、テストから内容を検査できる。
//!
//! `HeadlessDevice::deferred`で作ったデバイスでは、fenceは`retire_all`か
//! `wait_idle`が呼ばれるまで進まない。GPUの処理が遅れている状況の再現に使う。

use super::*;
use crate::RenderError;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

const ADDRESS_BASE: u64 = 0x1000_0000;
const ADDRESS_ALIGNMENT: u64 = 64 * 1024;

/// HeadlessDeviceの統計情報
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffers_created: usize,
    pub live_buffer_bytes: u64,
    pub command_allocators_created: usize,
    pub command_allocator_resets: usize,
    pub command_lists_created: usize,
    pub command_lists_executed: usize,
    pub signals: usize,
    pub descriptor_writes: usize,
    pub acceleration_structures_created: usize,
}

/// CPUで動作するDevice
pub struct HeadlessDevice {
    limits: DeviceLimits,
    deferred: bool,
    memory_budget: Option<u64>,
    live_bytes: Arc<AtomicU64>,
    next_address: AtomicU64,
    next_id: AtomicU64,
    fences: Mutex<Vec<Weak<FenceShared>>>,
    executed: Mutex<Vec<Vec<HeadlessCommand>>>,
    stats: Mutex<HeadlessStats>,
}
impl HeadlessDevice {
    /// signalした値にすぐ到達するデバイスを作成する
    pub fn new() -> Self {
        Self {
            limits: DeviceLimits::default(),
            deferred: false,
            memory_budget: None,
            live_bytes: Arc::new(AtomicU64::new(0)),
            next_address: AtomicU64::new(ADDRESS_BASE),
            next_id: AtomicU64::new(1),
            fences: Mutex::new(vec![]),
            executed: Mutex::new(vec![]),
            stats: Mutex::new(HeadlessStats::default()),
        }
    }

    /// `retire_all`が呼ばれるまでfenceが進まないデバイスを作成する
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::new()
        }
    }

    /// デバイスの制約を差し替える
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// 生きているbufferの合計がこのサイズを超えるとbufferの作成に失敗するようにする
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// signal済みのすべての値をGPUが処理し終えたことにする
    pub fn retire_all(&self) {
        let mut fences = self.fences.lock();
        fences.retain(|fence| match fence.upgrade() {
            Some(fence) => {
                fence.retire();
                true
            }
            None => false,
        });
    }

    /// 統計情報を取得する
    pub fn stats(&self) -> HeadlessStats {
        let mut stats = *self.stats.lock();
        stats.live_buffer_bytes = self.live_bytes.load(Ordering::Relaxed);
        stats
    }

    /// これまでに実行されたcommand listの中身を取り出す
    pub fn take_executed(&self) -> Vec<Vec<HeadlessCommand>> {
        std::mem::take(&mut *self.executed.lock())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

struct BufferShared {
    id: u64,
    label: String,
    heap: HeapKind,
    usage: BufferUsage,
    address: DeviceAddress,
    data: Mutex<Vec<u8>>,
    live_bytes: Arc<AtomicU64>,
}
impl Drop for BufferShared {
    fn drop(&mut self) {
        self.live_bytes
            .fetch_sub(self.data.get_mut().len() as u64, Ordering::Relaxed);
    }
}

/// ホストメモリ上のbuffer
#[derive(Clone)]
pub struct HeadlessBuffer(Arc<BufferShared>);
impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn heap(&self) -> HeapKind {
        self.0.heap
    }

    pub fn usage(&self) -> BufferUsage {
        self.0.usage
    }

    /// bufferの中身を読み出す
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.0.data.lock();
        let start = offset as usize;
        data[start..start + len].to_vec()
    }
}
impl RawBuffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.0.data.lock().len() as u64
    }

    fn device_address(&self) -> DeviceAddress {
        self.0.address
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.0.heap != HeapKind::Upload {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "buffer `{}` is not CPU visible",
                self.0.label
            )));
        }
        let mut data = self.0.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "write of {} bytes at {offset} overruns buffer `{}` of {} bytes",
                bytes.len(),
                self.0.label,
                data.len()
            )));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}
impl Debug for HeadlessBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBuffer")
            .field("id", &self.0.id)
            .field("label", &self.0.label)
            .field("address", &self.0.address)
            .finish()
    }
}

#[derive(Default)]
struct FenceState {
    completed: u64,
    pending: u64,
}

#[derive(Default)]
struct FenceShared {
    state: Mutex<FenceState>,
    condvar: Condvar,
}
impl FenceShared {
    fn signal(&self, value: u64, deferred: bool) {
        let mut state = self.state.lock();
        state.pending = state.pending.max(value);
        if !deferred {
            state.completed = state.pending;
            self.condvar.notify_all();
        }
    }

    fn retire(&self) {
        let mut state = self.state.lock();
        if state.completed < state.pending {
            state.completed = state.pending;
            self.condvar.notify_all();
        }
    }
}

/// Mutexと条件変数で作ったfence
pub struct HeadlessFence(Arc<FenceShared>);
impl RawFence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.0.state.lock().completed
    }

    fn wait(&self, value: u64) -> Result<()> {
        let mut state = self.0.state.lock();
        while state.completed < value {
            self.0.condvar.wait(&mut state);
        }
        Ok(())
    }
}

/// command allocator
pub struct HeadlessCommandAllocator {
    id: u64,
    resets: u64,
}
impl HeadlessCommandAllocator {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// これまでにresetされた回数
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// 記録されたコマンド
#[derive(Debug, Clone)]
pub enum HeadlessCommand {
    CopyBuffer {
        src: HeadlessBuffer,
        src_offset: u64,
        dst: HeadlessBuffer,
        dst_offset: u64,
        size: u64,
    },
    BuildAccelerationStructure {
        kind: AccelerationStructureKind,
        destination: DeviceAddress,
        scratch: DeviceAddress,
        primitive_count: u32,
    },
    Barrier,
    PrepareRenderTarget {
        texture: u64,
    },
    DispatchRays {
        ranges: ShaderTableRanges,
        extent: Extent,
        push_constants: Vec<u8>,
        table_count: usize,
    },
    Dispatch {
        group_count: [u32; 3],
        push_constants: Vec<u8>,
        table_count: usize,
    },
}

/// コマンドを記録するだけのcommand list
pub struct HeadlessCommandList {
    allocator_id: u64,
    recording: bool,
    commands: Vec<HeadlessCommand>,
}
impl HeadlessCommandList {
    /// 作成元のallocatorのid
    pub fn allocator_id(&self) -> u64 {
        self.allocator_id
    }

    /// 記録されたコマンド
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    fn record(&mut self, command: HeadlessCommand) {
        debug_assert!(self.recording, "command recorded outside begin/close");
        self.commands.push(command);
    }
}
impl RawCommandList<HeadlessDevice> for HeadlessCommandList {
    fn begin(&mut self, allocator: &HeadlessCommandAllocator) -> Result<()> {
        if allocator.id != self.allocator_id {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "command list of allocator {} begun with allocator {}",
                self.allocator_id,
                allocator.id
            )));
        }
        self.recording = true;
        self.commands.clear();
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: BufferRegion<'_, HeadlessDevice>,
        dst: BufferRegion<'_, HeadlessDevice>,
        size: u64,
    ) {
        self.record(HeadlessCommand::CopyBuffer {
            src: src.buffer.clone(),
            src_offset: src.offset,
            dst: dst.buffer.clone(),
            dst_offset: dst.offset,
            size,
        });
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationStructureBuild<'_, HeadlessDevice>) {
        let primitive_count = match &build.geometry {
            GeometrySource::Triangles { index_count, .. } => index_count / 3,
            GeometrySource::Instances { instance_count, .. } => *instance_count,
        };
        self.record(HeadlessCommand::BuildAccelerationStructure {
            kind: build.destination.kind,
            destination: build.destination.address,
            scratch: build.scratch.device_address(),
            primitive_count,
        });
    }

    fn barrier(&mut self) {
        self.record(HeadlessCommand::Barrier);
    }

    fn prepare_render_target(&mut self, texture: &HeadlessTexture) {
        self.record(HeadlessCommand::PrepareRenderTarget { texture: texture.id });
    }

    fn dispatch_rays(
        &mut self,
        _pipeline: &HeadlessRayTracingPipeline,
        tables: &[&HeadlessDescriptorTable],
        push_constants: &[u8],
        ranges: &ShaderTableRanges,
        extent: Extent,
    ) {
        self.record(HeadlessCommand::DispatchRays {
            ranges: *ranges,
            extent,
            push_constants: push_constants.to_vec(),
            table_count: tables.len(),
        });
    }

    fn dispatch(
        &mut self,
        _pipeline: &HeadlessComputePipeline,
        tables: &[&HeadlessDescriptorTable],
        push_constants: &[u8],
        group_count: [u32; 3],
    ) {
        self.record(HeadlessCommand::Dispatch {
            group_count,
            push_constants: push_constants.to_vec(),
            table_count: tables.len(),
        });
    }

    fn close(&mut self) -> Result<()> {
        if !self.recording {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "command list closed without begin"
            )));
        }
        self.recording = false;
        Ok(())
    }
}

/// descriptor tableのスロットに書かれた内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessDescriptor {
    StorageBuffer { address: DeviceAddress, size: u64 },
    AccelerationStructure { address: DeviceAddress },
    StorageTexture { texture: u64 },
}

/// descriptor table
pub struct HeadlessDescriptorTable {
    kind: DescriptorTableKind,
    slots: Mutex<Vec<Option<HeadlessDescriptor>>>,
}
impl HeadlessDescriptorTable {
    pub fn kind(&self) -> DescriptorTableKind {
        self.kind
    }

    /// スロットの内容を取得する
    pub fn slot(&self, index: u32) -> Option<HeadlessDescriptor> {
        self.slots.lock().get(index as usize).copied().flatten()
    }
}

/// acceleration structure
pub struct HeadlessAccelerationStructure {
    kind: AccelerationStructureKind,
    address: DeviceAddress,
    size: u64,
}
impl HeadlessAccelerationStructure {
    pub fn kind(&self) -> AccelerationStructureKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}
impl RawAccelerationStructure for HeadlessAccelerationStructure {
    fn device_address(&self) -> DeviceAddress {
        self.address
    }
}

/// export名ごとに決まったidentifierを持つray tracing pipeline
pub struct HeadlessRayTracingPipeline {
    identifiers: Vec<(String, Vec<u8>)>,
}
impl RawRayTracingPipeline for HeadlessRayTracingPipeline {
    fn shader_identifier(&self, export: &str) -> Option<&[u8]> {
        self.identifiers
            .iter()
            .find(|(name, _)| name == export)
            .map(|(_, identifier)| identifier.as_slice())
    }
}

/// compute pipeline
pub struct HeadlessComputePipeline {
    label: String,
}
impl HeadlessComputePipeline {
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// 出力画像
pub struct HeadlessTexture {
    id: u64,
    extent: Extent,
}
impl HeadlessTexture {
    pub fn id(&self) -> u64 {
        self.id
    }
}
impl RawTexture for HeadlessTexture {
    fn extent(&self) -> Extent {
        self.extent
    }
}

fn copy_between(src: &HeadlessBuffer, src_offset: u64, dst: &HeadlessBuffer, dst_offset: u64, size: u64) {
    let (src_offset, dst_offset, size) = (src_offset as usize, dst_offset as usize, size as usize);
    if Arc::ptr_eq(&src.0, &dst.0) {
        let mut data = src.0.data.lock();
        data.copy_within(src_offset..src_offset + size, dst_offset);
    } else {
        let src = src.0.data.lock();
        let mut dst = dst.0.data.lock();
        dst[dst_offset..dst_offset + size].copy_from_slice(&src[src_offset..src_offset + size]);
    }
}

impl Device for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type Fence = HeadlessFence;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type DescriptorTable = HeadlessDescriptorTable;
    type AccelerationStructure = HeadlessAccelerationStructure;
    type RayTracingPipeline = HeadlessRayTracingPipeline;
    type ComputePipeline = HeadlessComputePipeline;
    type Texture = HeadlessTexture;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<HeadlessBuffer> {
        if let Some(budget) = self.memory_budget {
            if self.live_bytes.load(Ordering::Relaxed) + desc.size > budget {
                return Err(RenderError::OutOfDeviceMemory {
                    label: desc.label.to_owned(),
                    size: desc.size,
                });
            }
        }
        self.live_bytes.fetch_add(desc.size, Ordering::Relaxed);
        let span = desc.size.max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let address = self.next_address.fetch_add(span, Ordering::Relaxed);
        self.stats.lock().buffers_created += 1;
        Ok(HeadlessBuffer(Arc::new(BufferShared {
            id: self.next_id(),
            label: desc.label.to_owned(),
            heap: desc.heap,
            usage: desc.usage,
            address,
            data: Mutex::new(vec![0; desc.size as usize]),
            live_bytes: self.live_bytes.clone(),
        })))
    }

    fn create_fence(&self) -> Result<HeadlessFence> {
        let shared = Arc::new(FenceShared::default());
        self.fences.lock().push(Arc::downgrade(&shared));
        Ok(HeadlessFence(shared))
    }

    fn create_command_allocator(&self) -> Result<HeadlessCommandAllocator> {
        self.stats.lock().command_allocators_created += 1;
        Ok(HeadlessCommandAllocator {
            id: self.next_id(),
            resets: 0,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut HeadlessCommandAllocator) -> Result<()> {
        self.stats.lock().command_allocator_resets += 1;
        allocator.resets += 1;
        Ok(())
    }

    fn create_command_list(&self, allocator: &HeadlessCommandAllocator) -> Result<HeadlessCommandList> {
        self.stats.lock().command_lists_created += 1;
        Ok(HeadlessCommandList {
            allocator_id: allocator.id,
            recording: false,
            commands: vec![],
        })
    }

    fn execute(&self, list: &HeadlessCommandList) -> Result<()> {
        if list.recording {
            return Err(RenderError::Backend(anyhow::anyhow!(
                "command list executed before close"
            )));
        }
        for command in &list.commands {
            if let HeadlessCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } = command
            {
                copy_between(src, *src_offset, dst, *dst_offset, *size);
            }
        }
        self.stats.lock().command_lists_executed += 1;
        self.executed.lock().push(list.commands.clone());
        Ok(())
    }

    fn signal(&self, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.stats.lock().signals += 1;
        fence.0.signal(value, self.deferred);
        Ok(())
    }

    fn create_descriptor_table(
        &self,
        kind: DescriptorTableKind,
        capacity: u32,
    ) -> Result<HeadlessDescriptorTable> {
        Ok(HeadlessDescriptorTable {
            kind,
            slots: Mutex::new(vec![None; capacity as usize]),
        })
    }

    fn write_descriptor(&self, table: &HeadlessDescriptorTable, index: u32, view: DescriptorView<'_, Self>) {
        let descriptor = match view {
            DescriptorView::StorageBuffer {
                buffer,
                offset,
                size,
            } => HeadlessDescriptor::StorageBuffer {
                address: buffer.device_address() + offset,
                size,
            },
            DescriptorView::AccelerationStructure(acceleration_structure) => {
                HeadlessDescriptor::AccelerationStructure {
                    address: acceleration_structure.address,
                }
            }
            DescriptorView::StorageTexture(texture) => HeadlessDescriptor::StorageTexture {
                texture: texture.id,
            },
        };
        self.stats.lock().descriptor_writes += 1;
        table.slots.lock()[index as usize] = Some(descriptor);
    }

    fn acceleration_structure_sizes(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<AccelerationStructureSizes> {
        Ok(match *inputs {
            AccelerationStructureInputs::Triangles {
                vertex_count,
                index_count,
                ..
            } => AccelerationStructureSizes {
                result_size: 256 + u64::from(index_count / 3) * 64,
                scratch_size: 128 + u64::from(vertex_count) * 16,
            },
            AccelerationStructureInputs::Instances { instance_count } => {
                AccelerationStructureSizes {
                    result_size: 256 + u64::from(instance_count) * 64,
                    scratch_size: 128 + u64::from(instance_count) * 32,
                }
            }
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        storage: BufferRegion<'_, Self>,
        size: u64,
    ) -> Result<HeadlessAccelerationStructure> {
        if !storage
            .buffer
            .usage()
            .contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE)
        {
            return Err(RenderError::AccelerationStructureBuild(format!(
                "buffer `{}` is not acceleration structure storage",
                storage.buffer.label()
            )));
        }
        if storage.offset + size > storage.buffer.size() {
            return Err(RenderError::AccelerationStructureBuild(format!(
                "{size} bytes at {} overrun buffer `{}`",
                storage.offset,
                storage.buffer.label()
            )));
        }
        self.stats.lock().acceleration_structures_created += 1;
        Ok(HeadlessAccelerationStructure {
            kind,
            address: storage.device_address(),
            size,
        })
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<HeadlessRayTracingPipeline> {
        if desc.ray_generation.is_empty() {
            return Err(RenderError::PipelineCreation(String::from(
                "ray tracing pipeline without ray generation shader",
            )));
        }
        let mut names = HashSet::new();
        let mut identifiers = vec![];
        for (group, export) in desc.groups().enumerate() {
            if !names.insert(export.name.as_str()) {
                return Err(RenderError::PipelineCreation(format!(
                    "duplicate shader export `{}`",
                    export.name
                )));
            }
            let identifier =
                vec![(group as u8).wrapping_add(1); self.limits.shader_identifier_size as usize];
            identifiers.push((export.name.clone(), identifier));
        }
        Ok(HeadlessRayTracingPipeline { identifiers })
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<HeadlessComputePipeline> {
        Ok(HeadlessComputePipeline {
            label: desc.label.clone(),
        })
    }

    fn create_texture(&self, extent: Extent) -> Result<HeadlessTexture> {
        Ok(HeadlessTexture {
            id: self.next_id(),
            extent,
        })
    }

    fn wait_idle(&self) -> Result<()> {
        self.retire_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_buffer(device: &HeadlessDevice, size: u64) -> HeadlessBuffer {
        device
            .create_buffer(&BufferDesc {
                label: "test upload",
                heap: HeapKind::Upload,
                usage: BufferUsage::TRANSFER_SRC,
                size,
            })
            .unwrap()
    }

    #[test]
    fn executed_copies_are_applied() {
        let device = HeadlessDevice::new();
        let src = upload_buffer(&device, 16);
        let dst = device
            .create_buffer(&BufferDesc {
                label: "test default",
                heap: HeapKind::Default,
                usage: BufferUsage::TRANSFER_DST,
                size: 16,
            })
            .unwrap();
        src.write(4, &[1, 2, 3, 4]).unwrap();

        let allocator = device.create_command_allocator().unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        list.begin(&allocator).unwrap();
        list.copy_buffer(
            BufferRegion { buffer: &src, offset: 4 },
            BufferRegion { buffer: &dst, offset: 8 },
            4,
        );
        list.close().unwrap();
        assert_eq!(dst.read(8, 4), vec![0, 0, 0, 0]);

        device.execute(&list).unwrap();
        assert_eq!(dst.read(8, 4), vec![1, 2, 3, 4]);
        assert_eq!(device.take_executed().len(), 1);
    }

    #[test]
    fn default_heap_is_not_writable_from_cpu() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "gpu only",
                heap: HeapKind::Default,
                usage: BufferUsage::STORAGE,
                size: 4,
            })
            .unwrap();
        assert!(buffer.write(0, &[0; 4]).is_err());
    }

    #[test]
    fn buffer_addresses_do_not_overlap() {
        let device = HeadlessDevice::new();
        let a = upload_buffer(&device, 100_000);
        let b = upload_buffer(&device, 16);
        assert!(b.device_address() >= a.device_address() + a.size());
    }

    #[test]
    fn memory_budget_is_enforced_on_live_buffers() {
        let device = HeadlessDevice::new().with_memory_budget(1024);
        let first = upload_buffer(&device, 1000);
        let err = device
            .create_buffer(&BufferDesc {
                label: "too big",
                heap: HeapKind::Upload,
                usage: BufferUsage::STORAGE,
                size: 100,
            })
            .unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory { size: 100, .. }));

        drop(first);
        assert_eq!(device.stats().live_buffer_bytes, 0);
        upload_buffer(&device, 100);
    }

    #[test]
    fn deferred_fence_advances_on_retire() {
        let device = HeadlessDevice::deferred();
        let fence = device.create_fence().unwrap();
        device.signal(&fence, 3).unwrap();
        assert_eq!(fence.completed_value(), 0);
        device.retire_all();
        assert_eq!(fence.completed_value(), 3);
    }

    #[test]
    fn pipeline_identifiers_are_distinct_per_export() {
        let device = HeadlessDevice::new();
        let export = |name: &str| ShaderExport {
            name: name.to_owned(),
            module: ShaderModuleDesc::new(vec![]),
        };
        let pipeline = device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                ray_generation: vec![export("raygen")],
                miss: vec![export("miss")],
                hit: vec![export("hit")],
                ..Default::default()
            })
            .unwrap();
        let raygen = pipeline.shader_identifier("raygen").unwrap();
        let hit = pipeline.shader_identifier("hit").unwrap();
        assert_eq!(raygen.len(), 32);
        assert_ne!(raygen, hit);
        assert!(pipeline.shader_identifier("missing").is_none());

        let duplicate = device.create_ray_tracing_pipeline(&RayTracingPipelineDesc {
            ray_generation: vec![export("raygen")],
            miss: vec![export("raygen")],
            ..Default::default()
        });
        assert!(matches!(duplicate, Err(RenderError::PipelineCreation(_))));
    }
}
