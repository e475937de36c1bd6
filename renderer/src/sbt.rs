//! shader binding tableの組み立て。
//!
//! レコードのペイロードはTLASのビルド後に計算するので、ペイロード関数は
//! どのTLASに対しても同じ長さのバイト列を返さなければならない。

use crate::{
    acceleration::Tlas,
    buffer_pool::{align, BufferPool, BufferView},
    gpu::{Device, DeviceLimits, RawRayTracingPipeline, ShaderTableRanges, TableRange},
    RenderError, Result,
};

/// TLASからレコードのペイロードを作る関数
pub type PayloadFn<D> = Box<dyn Fn(&Tlas<D>) -> Vec<u8> + Send + Sync>;

/// shaderのexport名とペイロード関数の組
pub struct ShaderRecord<D: Device> {
    export: String,
    payload: PayloadFn<D>,
}
impl<D: Device> ShaderRecord<D> {
    pub fn export(&self) -> &str {
        &self.export
    }
}

/// serialize後のグループの配置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupLayout {
    /// table先頭からのバイトオフセット
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

/// serializeされたshader binding table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTable {
    pub bytes: Vec<u8>,
    pub ray_generation: GroupLayout,
    pub hit: GroupLayout,
    pub miss: GroupLayout,
}

/// GPUにアップロードしたshader binding table
pub struct DispatchTable<D: Device> {
    view: BufferView<D>,
    ranges: ShaderTableRanges,
}
impl<D: Device> DispatchTable<D> {
    /// tableを置いたupload bufferの領域
    pub fn view(&self) -> &BufferView<D> {
        &self.view
    }

    /// dispatch raysに渡す範囲
    pub fn ranges(&self) -> &ShaderTableRanges {
        &self.ranges
    }
}

/// ray generation、hit、missのレコードを集めてshader binding tableを作るビルダー
pub struct ShaderBindingTableBuilder<D: Device> {
    ray_generation: Vec<ShaderRecord<D>>,
    hit: Vec<ShaderRecord<D>>,
    miss: Vec<ShaderRecord<D>>,
}
impl<D: Device> Default for ShaderBindingTableBuilder<D> {
    fn default() -> Self {
        Self {
            ray_generation: vec![],
            hit: vec![],
            miss: vec![],
        }
    }
}
impl<D: Device> ShaderBindingTableBuilder<D> {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        export: impl Into<String>,
        payload: impl Fn(&Tlas<D>) -> Vec<u8> + Send + Sync + 'static,
    ) -> ShaderRecord<D> {
        ShaderRecord {
            export: export.into(),
            payload: Box::new(payload),
        }
    }

    pub fn add_ray_generation(
        &mut self,
        export: impl Into<String>,
        payload: impl Fn(&Tlas<D>) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.ray_generation.push(Self::record(export, payload));
    }

    /// hitのレコードを追加して、インスタンスが参照するグループ内の位置を返す
    pub fn add_hit(
        &mut self,
        export: impl Into<String>,
        payload: impl Fn(&Tlas<D>) -> Vec<u8> + Send + Sync + 'static,
    ) -> u32 {
        self.hit.push(Self::record(export, payload));
        (self.hit.len() - 1) as u32
    }

    pub fn add_miss(
        &mut self,
        export: impl Into<String>,
        payload: impl Fn(&Tlas<D>) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.miss.push(Self::record(export, payload));
    }

    pub fn ray_generation_count(&self) -> usize {
        self.ray_generation.len()
    }

    pub fn hit_count(&self) -> usize {
        self.hit.len()
    }

    pub fn miss_count(&self) -> usize {
        self.miss.len()
    }

    /// レコードをtableのバイト列に並べる
    ///
    /// ray generationのレコードが一つも無い場合はpanicする。
    pub fn serialize(
        &self,
        tlas: &Tlas<D>,
        pipeline: &D::RayTracingPipeline,
        limits: &DeviceLimits,
    ) -> Result<SerializedTable> {
        assert!(
            !self.ray_generation.is_empty(),
            "shader binding table needs a ray generation record"
        );
        let groups = [&self.ray_generation, &self.hit, &self.miss].map(|records| {
            records
                .iter()
                .map(|record| (record, (record.payload)(tlas)))
                .collect::<Vec<_>>()
        });

        // グループの配置の計算
        let identifier_size = limits.shader_identifier_size;
        let mut layouts = [GroupLayout::default(); 3];
        let mut offset = 0;
        for (layout, records) in layouts.iter_mut().zip(&groups) {
            let stride = match records.iter().map(|(_, payload)| payload.len()).max() {
                Some(max_payload) => align(
                    identifier_size + max_payload as u64,
                    limits.shader_table_alignment,
                ),
                None => 0,
            };
            let size = align(records.len() as u64 * stride, limits.shader_table_alignment);
            *layout = GroupLayout {
                offset,
                size,
                stride,
            };
            offset += size;
        }

        // レコードの書き込み
        let mut bytes = vec![0; offset as usize];
        for (layout, records) in layouts.iter().zip(&groups) {
            for (i, (record, payload)) in records.iter().enumerate() {
                let identifier = pipeline
                    .shader_identifier(&record.export)
                    .ok_or_else(|| RenderError::UnknownExport(record.export.clone()))?;
                let start = (layout.offset + i as u64 * layout.stride) as usize;
                let identifier_end = start + identifier_size as usize;
                bytes[start..identifier_end]
                    .copy_from_slice(&identifier[..identifier_size as usize]);
                bytes[identifier_end..identifier_end + payload.len()].copy_from_slice(payload);
            }
        }

        let [ray_generation, hit, miss] = layouts;
        Ok(SerializedTable {
            bytes,
            ray_generation,
            hit,
            miss,
        })
    }

    /// tableをupload poolにアップロードしてdispatch raysに渡す範囲を作る
    pub fn build(
        self,
        tlas: &Tlas<D>,
        pipeline: &D::RayTracingPipeline,
        upload: &BufferPool<D>,
        limits: &DeviceLimits,
    ) -> Result<DispatchTable<D>> {
        let table = self.serialize(tlas, pipeline, limits)?;
        let view = upload.allocate(
            limits.shader_table_alignment,
            1,
            table.bytes.len() as u64,
        )?;
        view.write(&table.bytes)?;

        let base = view.device_address();
        let range = |layout: GroupLayout| TableRange {
            address: base + layout.offset,
            size: layout.size,
            stride: layout.stride,
        };
        let ranges = ShaderTableRanges {
            ray_generation: range(table.ray_generation),
            hit: range(table.hit),
            miss: range(table.miss),
        };
        Ok(DispatchTable { view, ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acceleration::build_tlas,
        frame::{FrameConfig, FrameResourceTracker},
        gpu::{
            headless::{HeadlessDevice, HeadlessRayTracingPipeline},
            RayTracingPipelineDesc, ShaderExport, ShaderModuleDesc,
        },
    };
    use std::sync::Arc;

    fn export(name: &str) -> ShaderExport {
        ShaderExport {
            name: name.to_owned(),
            module: ShaderModuleDesc::new(vec![]),
        }
    }

    fn pipeline(device: &HeadlessDevice) -> HeadlessRayTracingPipeline {
        device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                ray_generation: vec![export("raygen")],
                miss: vec![export("miss")],
                hit: vec![export("hit")],
                ..Default::default()
            })
            .unwrap()
    }

    fn with_tlas(f: impl FnOnce(&Arc<HeadlessDevice>, &Tlas<HeadlessDevice>, &BufferPool<HeadlessDevice>)) {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FrameResourceTracker::new(device.clone(), FrameConfig::default()).unwrap();
        let mut lease = tracker.get().unwrap();
        let tlas = build_tlas(device.as_ref(), &[], &mut lease.parts()).unwrap();
        f(&device, &tlas, lease.upload());
    }

    #[test]
    fn layout_follows_the_largest_payload_of_each_group() {
        with_tlas(|device, tlas, _| {
            let pipeline = pipeline(device);
            let mut builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            builder.add_ray_generation("raygen", |_| vec![]);
            assert_eq!(builder.add_hit("hit", |_| vec![0xa; 4]), 0);
            assert_eq!(builder.add_hit("hit", |_| vec![0xb; 16]), 1);
            builder.add_miss("miss", |_| vec![0xc; 8]);

            let table = builder
                .serialize(tlas, &pipeline, &device.limits())
                .unwrap();
            assert_eq!(
                table.ray_generation,
                GroupLayout {
                    offset: 0,
                    size: 64,
                    stride: 64
                }
            );
            assert_eq!(
                table.hit,
                GroupLayout {
                    offset: 64,
                    size: 128,
                    stride: 64
                }
            );
            assert_eq!(
                table.miss,
                GroupLayout {
                    offset: 192,
                    size: 64,
                    stride: 64
                }
            );
            assert_eq!(table.bytes.len(), 256);

            let raygen_id = pipeline.shader_identifier("raygen").unwrap();
            let miss_id = pipeline.shader_identifier("miss").unwrap();
            let hit_id = pipeline.shader_identifier("hit").unwrap();
            let bytes = &table.bytes;

            assert_eq!(&bytes[0..32], raygen_id);
            assert!(bytes[32..64].iter().all(|&b| b == 0));

            assert_eq!(&bytes[64..96], hit_id);
            assert_eq!(&bytes[96..100], &[0xa; 4]);
            assert!(bytes[100..128].iter().all(|&b| b == 0));
            assert_eq!(&bytes[128..160], hit_id);
            assert_eq!(&bytes[160..176], &[0xb; 16]);
            assert!(bytes[176..192].iter().all(|&b| b == 0));

            assert_eq!(&bytes[192..224], miss_id);
            assert_eq!(&bytes[224..232], &[0xc; 8]);
            assert!(bytes[232..256].iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn payload_receives_the_built_tlas() {
        with_tlas(|device, tlas, _| {
            let pipeline = pipeline(device);
            let mut builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            builder.add_ray_generation("raygen", |tlas: &Tlas<HeadlessDevice>| {
                tlas.device_address().to_le_bytes().to_vec()
            });
            let table = builder
                .serialize(tlas, &pipeline, &device.limits())
                .unwrap();
            assert_eq!(&table.bytes[32..40], &tlas.device_address().to_le_bytes());
        });
    }

    #[test]
    fn empty_hit_and_miss_groups_have_zero_size() {
        with_tlas(|device, tlas, _| {
            let pipeline = pipeline(device);
            let mut builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            builder.add_ray_generation("raygen", |_| vec![1; 40]);
            let table = builder
                .serialize(tlas, &pipeline, &device.limits())
                .unwrap();
            assert_eq!(table.ray_generation.stride, 128);
            assert_eq!(table.hit.size, 0);
            assert_eq!(table.miss.size, 0);
            assert_eq!(table.hit.offset, 128);
            assert_eq!(table.miss.offset, 128);
        });
    }

    #[test]
    fn unknown_export_is_an_error() {
        with_tlas(|device, tlas, _| {
            let pipeline = pipeline(device);
            let mut builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            builder.add_ray_generation("raygen", |_| vec![]);
            builder.add_hit("nope", |_| vec![]);
            let err = builder
                .serialize(tlas, &pipeline, &device.limits())
                .unwrap_err();
            assert!(matches!(err, RenderError::UnknownExport(name) if name == "nope"));
        });
    }

    #[test]
    #[should_panic(expected = "ray generation record")]
    fn missing_ray_generation_panics() {
        with_tlas(|device, tlas, _| {
            let pipeline = pipeline(device);
            let builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            let _ = builder.serialize(tlas, &pipeline, &device.limits());
        });
    }

    #[test]
    fn built_ranges_are_offset_from_the_uploaded_table() {
        with_tlas(|device, tlas, upload| {
            let pipeline = pipeline(device);
            let mut builder = ShaderBindingTableBuilder::<HeadlessDevice>::new();
            builder.add_ray_generation("raygen", |_| vec![]);
            builder.add_hit("hit", |_| vec![7; 4]);
            builder.add_miss("miss", |_| vec![]);
            let table = builder
                .build(tlas, &pipeline, upload, &device.limits())
                .unwrap();

            let base = table.view().device_address();
            assert_eq!(base % 64, 0);
            assert_eq!(table.ranges().ray_generation.address, base);
            assert_eq!(table.ranges().hit.address, base + 64);
            assert_eq!(table.ranges().miss.address, base + 128);

            let uploaded = table.view().buffer().read(table.view().offset() + 96, 4);
            assert_eq!(uploaded, vec![7; 4]);
        });
    }
}
