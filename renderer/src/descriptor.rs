//! フレームごとのdescriptor tableにスロットを順に割り当てるDescriptorHeapAccumulator。

use crate::{
    acceleration::Tlas,
    buffer_pool::BufferView,
    gpu::{Device, DescriptorView},
    RenderError, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub use crate::gpu::DescriptorTableKind;

/// descriptor tableへのバンプアロケータ
///
/// 返すインデックスはtable先頭からの位置で、`reset`するまで変わらない。
pub struct DescriptorHeapAccumulator<D: Device> {
    tables: [D::DescriptorTable; 2],
    cursors: Mutex<[u32; 2]>,
    capacity: u32,
    device: Arc<D>,
}
impl<D: Device> DescriptorHeapAccumulator<D> {
    /// 種類ごとに`capacity`個のスロットを持つtableを作成する
    pub fn new(device: Arc<D>, capacity: u32) -> Result<Self> {
        let tables = [
            device.create_descriptor_table(DescriptorTableKind::ShaderResource, capacity)?,
            device.create_descriptor_table(DescriptorTableKind::RenderTarget, capacity)?,
        ];
        Ok(Self {
            tables,
            cursors: Mutex::new([0; 2]),
            capacity,
            device,
        })
    }

    /// storage bufferのviewを書き込む
    pub fn add_storage_buffer(&self, view: &BufferView<D>) -> Result<u32> {
        self.add(
            DescriptorTableKind::ShaderResource,
            DescriptorView::StorageBuffer {
                buffer: view.buffer(),
                offset: view.offset(),
                size: view.size(),
            },
        )
    }

    /// TLASを書き込む
    pub fn add_acceleration_structure(&self, tlas: &Tlas<D>) -> Result<u32> {
        self.add(
            DescriptorTableKind::ShaderResource,
            DescriptorView::AccelerationStructure(tlas.structure()),
        )
    }

    /// 出力画像を書き込む
    pub fn add_render_target(&self, texture: &D::Texture) -> Result<u32> {
        self.add(
            DescriptorTableKind::RenderTarget,
            DescriptorView::StorageTexture(texture),
        )
    }

    fn add(&self, kind: DescriptorTableKind, view: DescriptorView<'_, D>) -> Result<u32> {
        let mut cursors = self.cursors.lock();
        let cursor = &mut cursors[kind.index()];
        if *cursor >= self.capacity {
            return Err(RenderError::DescriptorCapacityExceeded {
                kind,
                capacity: self.capacity,
            });
        }
        let index = *cursor;
        self.device.write_descriptor(&self.tables[kind.index()], index, view);
        *cursor += 1;
        Ok(index)
    }

    /// すべてのtableの割り当てを先頭に戻す
    pub fn reset(&self) {
        *self.cursors.lock() = [0; 2];
    }

    /// 割り当て済みのスロット数
    pub fn len(&self, kind: DescriptorTableKind) -> u32 {
        self.cursors.lock()[kind.index()]
    }

    pub fn table(&self, kind: DescriptorTableKind) -> &D::DescriptorTable {
        &self.tables[kind.index()]
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
