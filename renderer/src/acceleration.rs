//! メッシュごとのBLASのキャッシュと、毎フレームのTLASのビルド。

use crate::{
    buffer_pool::{BufferPool, BufferPoolDesc, BufferView},
    command_list::CommandListPool,
    fence::FenceWait,
    frame::FrameParts,
    gpu::{
        AccelerationStructureBuild, AccelerationStructureKind, BufferUsage, Device, DeviceAddress,
        GeometrySource, HeapKind, RawAccelerationStructure, RawCommandList,
    },
    scene::{Mesh, MeshId},
    RenderError, Result,
};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

const VERTEX_STRIDE: u64 = std::mem::size_of::<Vec3>() as u64;
const INDEX_STRIDE: u64 = std::mem::size_of::<u32>() as u64;

bitflags::bitflags! {
    /// インスタンスのフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FLIP_FACING = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// GPUに渡す64バイトのインスタンス記述子
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// 行優先の3x4の変換行列
    pub transform: [f32; 12],
    /// 下位24bitがcustom index、上位8bitがmask
    pub custom_index_and_mask: u32,
    /// 下位24bitがhit groupのオフセット、上位8bitがフラグ
    pub hit_group_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

/// TLASに含めるインスタンス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub hit_group_index: u32,
    pub blas_address: DeviceAddress,
    pub flags: InstanceFlags,
}
impl InstanceDesc {
    /// GPUに渡す形式に変換する
    pub fn to_record(&self) -> InstanceRecord {
        debug_assert!(
            self.custom_index < 1 << 24,
            "custom index {} does not fit in 24 bits",
            self.custom_index
        );
        debug_assert!(
            self.hit_group_index < 1 << 24,
            "hit group index {} does not fit in 24 bits",
            self.hit_group_index
        );
        let rows = self.transform.transpose().to_cols_array();
        let mut transform = [0.0; 12];
        transform.copy_from_slice(&rows[..12]);
        InstanceRecord {
            transform,
            custom_index_and_mask: (self.custom_index & 0x00ff_ffff) | (u32::from(self.mask) << 24),
            hit_group_offset_and_flags: (self.hit_group_index & 0x00ff_ffff)
                | (u32::from(self.flags.bits()) << 24),
            acceleration_structure_reference: self.blas_address,
        }
    }
}

/// メッシュのBLASと、その頂点とインデックスの永続的なbuffer
pub struct Blas<D: Device> {
    mesh_id: MeshId,
    vertices: BufferView<D>,
    indices: BufferView<D>,
    result: BufferView<D>,
    structure: D::AccelerationStructure,
}
impl<D: Device> Blas<D> {
    pub fn mesh_id(&self) -> MeshId {
        self.mesh_id
    }

    pub fn vertices(&self) -> &BufferView<D> {
        &self.vertices
    }

    pub fn indices(&self) -> &BufferView<D> {
        &self.indices
    }

    /// BLASの格納先
    pub fn result(&self) -> &BufferView<D> {
        &self.result
    }

    pub fn structure(&self) -> &D::AccelerationStructure {
        &self.structure
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.structure.device_address()
    }
}

/// メッシュのidごとにBLASを一度だけビルドして保持するキャッシュ
pub struct MeshCache<D: Device> {
    entries: Mutex<HashMap<MeshId, Arc<Blas<D>>>>,
    geometry: BufferPool<D>,
    structures: BufferPool<D>,
    preload_staging: BufferPool<D>,
    preload_scratch: BufferPool<D>,
    preload_lock: Mutex<()>,
    device: Arc<D>,
}
impl<D: Device> MeshCache<D> {
    /// 空のキャッシュを作成する
    pub fn new(
        device: Arc<D>,
        geometry_chunk_size: u64,
        acceleration_structure_chunk_size: u64,
    ) -> Self {
        let pool = |label: &str, heap, usage, default_chunk_size| {
            BufferPool::new(
                device.clone(),
                BufferPoolDesc {
                    label: label.to_owned(),
                    heap,
                    usage,
                    default_chunk_size,
                },
            )
        };
        let geometry = pool(
            "mesh geometry",
            HeapKind::Default,
            BufferUsage::STORAGE
                | BufferUsage::ACCELERATION_STRUCTURE_INPUT
                | BufferUsage::TRANSFER_DST,
            geometry_chunk_size,
        );
        let structures = pool(
            "mesh acceleration structures",
            HeapKind::Default,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            acceleration_structure_chunk_size,
        );
        let preload_staging = pool(
            "mesh preload staging",
            HeapKind::Upload,
            BufferUsage::TRANSFER_SRC,
            geometry_chunk_size,
        );
        let preload_scratch = pool(
            "mesh preload scratch",
            HeapKind::Default,
            BufferUsage::STORAGE,
            acceleration_structure_chunk_size,
        );
        Self {
            entries: Mutex::new(HashMap::new()),
            geometry,
            structures,
            preload_staging,
            preload_scratch,
            preload_lock: Mutex::new(()),
            device,
        }
    }

    /// メッシュのBLASを取得する
    ///
    /// キャッシュに無ければフレームのcommand listにアップロードとビルドを記録する。
    pub fn get(&self, mesh: &Mesh, parts: &mut FrameParts<'_, D>) -> Result<Arc<Blas<D>>> {
        if let Some(blas) = self.entries.lock().get(&mesh.id()) {
            return Ok(blas.clone());
        }
        // ビルドの間はロックを持たない
        let blas = Arc::new(self.build(mesh, parts.upload, parts.scratch, &mut *parts.command_list)?);
        let mut entries = self.entries.lock();
        Ok(entries.entry(mesh.id()).or_insert(blas).clone())
    }

    /// フレームの外でメッシュのBLASをまとめてビルドする
    ///
    /// 返したFenceWaitが完了するとビルドが終わっている。
    pub fn preload(&self, meshes: &[Arc<Mesh>], commands: &CommandListPool<D>) -> Result<FenceWait> {
        let _guard = self.preload_lock.lock();

        // 前回のpreloadの一時bufferの回収
        self.preload_staging.wait_last_use()?;
        self.preload_staging.reset();
        self.preload_scratch.reset();

        let mut list = commands.acquire()?;
        let mut built = HashMap::new();
        let recorded = meshes.iter().try_for_each(|mesh| -> Result<()> {
            if built.contains_key(&mesh.id()) || self.contains(mesh) {
                return Ok(());
            }
            let blas = self.build(mesh, &self.preload_staging, &self.preload_scratch, &mut *list)?;
            built.insert(mesh.id(), Arc::new(blas));
            Ok(())
        });

        // 途中で失敗しても記録済みのビルドは提出する
        let wait = commands.submit(list)?;
        self.preload_staging.retire_after(&wait);
        self.preload_scratch.retire_after(&wait);

        // 提出が済んだBLASだけをキャッシュに入れる
        let mut entries = self.entries.lock();
        for (id, blas) in built {
            entries.entry(id).or_insert(blas);
        }
        drop(entries);
        if let Err(err) = recorded {
            log::warn!("mesh preload failed: {err}");
            return Err(err);
        }
        Ok(wait)
    }

    /// キャッシュ済みのBLASの数
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, mesh: &Mesh) -> bool {
        self.entries.lock().contains_key(&mesh.id())
    }

    fn build(
        &self,
        mesh: &Mesh,
        staging: &BufferPool<D>,
        scratch: &BufferPool<D>,
        command_list: &mut D::CommandList,
    ) -> Result<Blas<D>> {
        let limits = self.device.limits();
        let vertex_count = mesh.vertex_count();
        let index_count = mesh.index_count();
        log::debug!(
            "building BLAS for {:?}: {vertex_count} vertices, {} triangles",
            mesh.id(),
            index_count / 3
        );

        // 頂点とインデックスのアップロード
        let vertex_staging = staging.allocate(16, u64::from(vertex_count), VERTEX_STRIDE)?;
        vertex_staging.write_pod(mesh.positions())?;
        let index_staging = staging.allocate(16, u64::from(index_count), INDEX_STRIDE)?;
        index_staging.write_pod(mesh.indices())?;

        let vertices = self.geometry.allocate(
            limits.storage_buffer_alignment,
            u64::from(vertex_count),
            VERTEX_STRIDE,
        )?;
        let indices = self.geometry.allocate(
            limits.storage_buffer_alignment,
            u64::from(index_count),
            INDEX_STRIDE,
        )?;
        command_list.copy_buffer(
            vertex_staging.region(),
            vertices.region(),
            u64::from(vertex_count) * VERTEX_STRIDE,
        );
        command_list.copy_buffer(
            index_staging.region(),
            indices.region(),
            u64::from(index_count) * INDEX_STRIDE,
        );
        command_list.barrier();

        // BLASの作成
        let geometry = GeometrySource::Triangles {
            vertices: vertices.region(),
            vertex_count,
            vertex_stride: VERTEX_STRIDE,
            indices: indices.region(),
            index_count,
        };
        let sizes = self.device.acceleration_structure_sizes(&geometry.inputs())?;
        let result = self
            .structures
            .allocate(limits.acceleration_structure_alignment, 1, sizes.result_size)?;
        let structure = self.device.create_acceleration_structure(
            AccelerationStructureKind::BottomLevel,
            result.region(),
            sizes.result_size,
        )?;
        let scratch = scratch.allocate(limits.scratch_alignment, 1, sizes.scratch_size)?;

        // BLASのビルド
        command_list.build_acceleration_structure(&AccelerationStructureBuild {
            geometry,
            destination: &structure,
            scratch: scratch.region(),
        });
        command_list.barrier();

        Ok(Blas {
            mesh_id: mesh.id(),
            vertices,
            indices,
            result,
            structure,
        })
    }
}

/// フレームごとにビルドされるTLAS
pub struct Tlas<D: Device> {
    structure: Arc<D::AccelerationStructure>,
    result: BufferView<D>,
    instances: BufferView<D>,
    instance_count: u32,
}
impl<D: Device> Tlas<D> {
    pub fn structure(&self) -> &D::AccelerationStructure {
        &self.structure
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.structure.device_address()
    }

    pub fn result(&self) -> &BufferView<D> {
        &self.result
    }

    /// インスタンス記述子の配列
    pub fn instances(&self) -> &BufferView<D> {
        &self.instances
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}
impl<D: Device> Clone for Tlas<D> {
    fn clone(&self) -> Self {
        Self {
            structure: self.structure.clone(),
            result: self.result.clone(),
            instances: self.instances.clone(),
            instance_count: self.instance_count,
        }
    }
}

/// フレームのプールを使ってTLASのビルドをcommand listに記録する
pub fn build_tlas<D: Device>(
    device: &D,
    instances: &[InstanceDesc],
    parts: &mut FrameParts<'_, D>,
) -> Result<Tlas<D>> {
    let limits = device.limits();
    let instance_count = u32::try_from(instances.len()).map_err(|_| {
        RenderError::AccelerationStructureBuild(format!(
            "{} instances exceed the TLAS instance count",
            instances.len()
        ))
    })?;

    // インスタンス記述子のアップロード
    let records = instances
        .iter()
        .map(InstanceDesc::to_record)
        .collect::<Vec<_>>();
    let record_size = std::mem::size_of::<InstanceRecord>() as u64;
    let instances_view = parts
        .upload
        .allocate(16, u64::from(instance_count.max(1)), record_size)?;
    instances_view.write_pod(&records)?;

    // BLASのビルドの完了を待つ
    parts.command_list.barrier();

    let geometry = GeometrySource::Instances {
        instances: instances_view.region(),
        instance_count,
    };
    let sizes = device.acceleration_structure_sizes(&geometry.inputs())?;
    let result = parts.acceleration_structures.allocate(
        limits.acceleration_structure_alignment,
        1,
        sizes.result_size,
    )?;
    let structure = device.create_acceleration_structure(
        AccelerationStructureKind::TopLevel,
        result.region(),
        sizes.result_size,
    )?;
    let scratch = parts
        .scratch
        .allocate(limits.scratch_alignment, 1, sizes.scratch_size)?;

    parts
        .command_list
        .build_acceleration_structure(&AccelerationStructureBuild {
            geometry,
            destination: &structure,
            scratch: scratch.region(),
        });
    parts.command_list.barrier();

    Ok(Tlas {
        structure: Arc::new(structure),
        result,
        instances: instances_view,
        instance_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{FrameConfig, FrameResourceTracker},
        gpu::headless::{HeadlessCommand, HeadlessDevice},
    };

    fn triangle() -> Arc<Mesh> {
        Arc::new(Mesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![0, 1, 2],
        ))
    }

    fn builds(commands: &[HeadlessCommand], kind: AccelerationStructureKind) -> usize {
        commands
            .iter()
            .filter(|command| {
                matches!(command, HeadlessCommand::BuildAccelerationStructure { kind: k, .. } if *k == kind)
            })
            .count()
    }

    #[test]
    fn instance_record_layout() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        let desc = InstanceDesc {
            transform: Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            custom_index: 5,
            mask: 0xff,
            hit_group_index: 2,
            blas_address: 0xdead_0000,
            flags: InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
        };
        let record = desc.to_record();
        assert_eq!(
            record.transform,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
        assert_eq!(record.custom_index_and_mask, 0xff00_0005);
        assert_eq!(record.hit_group_offset_and_flags, 0x0100_0002);
        assert_eq!(record.acceleration_structure_reference, 0xdead_0000);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit in 24 bits")]
    fn oversized_custom_index_is_rejected() {
        InstanceDesc {
            transform: Mat4::IDENTITY,
            custom_index: 1 << 24,
            mask: 0xff,
            hit_group_index: 0,
            blas_address: 0,
            flags: InstanceFlags::empty(),
        }
        .to_record();
    }

    #[test]
    fn blas_is_built_once_per_mesh() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let cache = MeshCache::new(device.clone(), 64 * 1024, 64 * 1024);
        let mesh = triangle();

        let mut lease = tracker.get().unwrap();
        let first = cache.get(&mesh, &mut lease.parts()).unwrap();
        let second = cache.get(&mesh, &mut lease.parts()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        lease.submit().unwrap();
        lease.release().unwrap();

        let mut lease = tracker.get().unwrap();
        let third = cache.get(&mesh, &mut lease.parts()).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        lease.submit().unwrap();
        lease.release().unwrap();

        let executed = device.take_executed();
        assert_eq!(builds(&executed[0], AccelerationStructureKind::BottomLevel), 1);
        assert_eq!(builds(&executed[1], AccelerationStructureKind::BottomLevel), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_frames_share_one_cached_blas() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let cache = MeshCache::new(device.clone(), 64 * 1024, 64 * 1024);
        let mesh = triangle();
        let (tracker, cache, mesh) = (&tracker, &cache, &mesh);

        let blases = std::thread::scope(|scope| {
            let workers = (0..4)
                .map(|_| {
                    scope.spawn(move || {
                        let mut lease = tracker.get().unwrap();
                        let blas = cache.get(mesh, &mut lease.parts()).unwrap();
                        lease.submit().unwrap();
                        lease.release().unwrap();
                        blas
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(blases.iter().all(|blas| Arc::ptr_eq(blas, &blases[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn geometry_reaches_the_permanent_pool() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let cache = MeshCache::new(device.clone(), 64 * 1024, 64 * 1024);
        let mesh = triangle();

        let mut lease = tracker.get().unwrap();
        let blas = cache.get(&mesh, &mut lease.parts()).unwrap();
        lease.submit().unwrap();
        lease.release().unwrap().wait().unwrap();

        let vertices = blas
            .vertices()
            .buffer()
            .read(blas.vertices().offset(), 36);
        assert_eq!(vertices, bytemuck::cast_slice::<Vec3, u8>(mesh.positions()));
        let indices = blas.indices().buffer().read(blas.indices().offset(), 12);
        assert_eq!(indices, bytemuck::cast_slice::<u32, u8>(mesh.indices()));
        assert_eq!(blas.mesh_id(), mesh.id());
    }

    #[test]
    fn preload_builds_outside_frames() {
        let device = Arc::new(HeadlessDevice::new());
        let commands = CommandListPool::new(device.clone()).unwrap();
        let cache = MeshCache::new(device.clone(), 64 * 1024, 64 * 1024);
        let meshes = vec![triangle(), triangle()];

        let wait = cache.preload(&meshes, &commands).unwrap();
        pollster::block_on(wait).unwrap();
        assert!(cache.contains(&meshes[0]));
        assert!(cache.contains(&meshes[1]));

        // ビルド済みのメッシュは再度ビルドしない
        cache.preload(&meshes, &commands).unwrap().wait().unwrap();
        let executed = device.take_executed();
        assert_eq!(builds(&executed[0], AccelerationStructureKind::BottomLevel), 2);
        assert_eq!(builds(&executed[1], AccelerationStructureKind::BottomLevel), 0);
    }

    #[test]
    fn tlas_references_each_instance() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let cache = MeshCache::new(device.clone(), 64 * 1024, 64 * 1024);
        let mesh = triangle();

        let mut lease = tracker.get().unwrap();
        let mut parts = lease.parts();
        let blas = cache.get(&mesh, &mut parts).unwrap();
        let instances = (0..3)
            .map(|i| InstanceDesc {
                transform: Mat4::from_translation(Vec3::X * i as f32),
                custom_index: i,
                mask: 0xff,
                hit_group_index: 0,
                blas_address: blas.device_address(),
                flags: InstanceFlags::empty(),
            })
            .collect::<Vec<_>>();
        let tlas = build_tlas(device.as_ref(), &instances, &mut parts).unwrap();
        assert_eq!(tlas.instance_count(), 3);

        let bytes = tlas
            .instances()
            .buffer()
            .read(tlas.instances().offset(), 3 * 64);
        let record = |i: usize| bytemuck::pod_read_unaligned::<InstanceRecord>(&bytes[i * 64..(i + 1) * 64]);
        assert_eq!(record(2).custom_index_and_mask & 0x00ff_ffff, 2);
        assert_eq!(record(1).acceleration_structure_reference, blas.device_address());
        drop(parts);

        lease.submit().unwrap();
        lease.release().unwrap();
        let executed = device.take_executed();
        assert_eq!(builds(&executed[0], AccelerationStructureKind::TopLevel), 1);
    }

    #[test]
    fn tlas_without_instances_is_still_built() {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let mut lease = tracker.get().unwrap();
        let tlas = build_tlas(device.as_ref(), &[], &mut lease.parts()).unwrap();
        assert_eq!(tlas.instance_count(), 0);
        assert_ne!(tlas.device_address(), 0);
    }
}
