use crate::{
    acceleration::{build_tlas, InstanceDesc, InstanceFlags, MeshCache},
    command_list::CommandListPool,
    config::RendererConfig,
    fence::FenceWait,
    frame::{FrameLease, FrameResourceTracker},
    gpu::{DescriptorTableKind, Device, RawCommandList, RayTracingPipelineDesc},
    pipeline_step::{FrameContext, ObjectBinding, PipelineStep, RayTracingPushConstants},
    sbt::ShaderBindingTableBuilder,
    scene::{Mesh, Presenter, Scene},
    RenderError, Result,
};
use std::sync::Arc;

/// ray tracingでシーンを描画するレンダラー
///
/// フィールドは作成と逆の順に並べてあり、dropの際は作成と逆の順に解放される。
pub struct Renderer<D: Device> {
    presenter: Box<dyn Presenter<D>>,
    output: D::Texture,
    compute_pipelines: Vec<D::ComputePipeline>,
    ray_tracing_pipeline: D::RayTracingPipeline,
    mesh_cache: MeshCache<D>,
    frames: FrameResourceTracker<D>,
    commands: CommandListPool<D>,
    steps: Vec<(PipelineStep, usize)>,
    config: RendererConfig,
    frame_number: u32,
    disposed: bool,
    device: Arc<D>,
}
impl<D: Device> Renderer<D> {
    /// pipelineのstepの並びからレンダラーを作成する
    pub fn new(
        device: Arc<D>,
        config: RendererConfig,
        steps: Vec<PipelineStep>,
        presenter: Box<dyn Presenter<D>>,
    ) -> Result<Self> {
        if !steps
            .iter()
            .any(|step| matches!(step, PipelineStep::RayGeneration(_)))
        {
            return Err(RenderError::PipelineCreation(String::from(
                "pipeline steps need a ray generation step",
            )));
        }

        // 種類ごとの番号を振る
        let mut counts = [0usize; 4];
        let steps = steps
            .into_iter()
            .map(|step| {
                let kind = match step {
                    PipelineStep::RayGeneration(_) => 0,
                    PipelineStep::Hit(_) => 1,
                    PipelineStep::Miss(_) => 2,
                    PipelineStep::Compute(_) => 3,
                };
                let ordinal = counts[kind];
                counts[kind] += 1;
                (step, ordinal)
            })
            .collect::<Vec<_>>();

        // pipelineの作成
        let mut ray_tracing_desc = RayTracingPipelineDesc {
            push_constant_size: std::mem::size_of::<RayTracingPushConstants>() as u32,
            max_recursion_depth: config.max_recursion_depth,
            ..Default::default()
        };
        let mut compute_descs = vec![];
        for (step, _) in &steps {
            step.emit(&mut ray_tracing_desc, &mut compute_descs);
        }
        let ray_tracing_pipeline = device.create_ray_tracing_pipeline(&ray_tracing_desc)?;
        let compute_pipelines = compute_descs
            .iter()
            .map(|desc| device.create_compute_pipeline(desc))
            .collect::<Result<Vec<_>>>()?;

        let commands = CommandListPool::new(device.clone())?;
        let frames = FrameResourceTracker::new(device.clone(), config.frame_config())?;
        let mesh_cache = MeshCache::new(
            device.clone(),
            config.geometry_chunk_size,
            config.acceleration_structure_chunk_size,
        );
        let output = device.create_texture(config.extent())?;

        log::info!(
            "renderer created: {}x{}, {} ray tracing groups, {} compute steps",
            config.width,
            config.height,
            ray_tracing_desc.groups().count(),
            compute_pipelines.len()
        );

        Ok(Self {
            presenter,
            output,
            compute_pipelines,
            ray_tracing_pipeline,
            mesh_cache,
            frames,
            commands,
            steps,
            config,
            frame_number: 0,
            disposed: false,
            device,
        })
    }

    /// 1フレーム分の処理を記録してGPUに提出する
    ///
    /// 返すFenceWaitはGPUがフレームを処理し終えると完了する。
    /// 記録の途中で失敗した場合も、それまでに記録したBLASのビルドは提出してからエラーを返す。
    pub fn render(&mut self, scene: &Scene) -> Result<FenceWait> {
        let mut lease = self.frames.get()?;
        log::trace!(
            "frame {} recorded on frame resources #{}",
            self.frame_number,
            lease.index()
        );

        let recorded = self.record(scene, &mut lease);
        lease.submit()?;
        let wait = lease.release()?;
        if let Err(err) = recorded {
            log::warn!("frame {} failed: {err}", self.frame_number);
            return Err(err);
        }

        self.presenter.present(&self.output, &wait)?;
        self.frame_number = self.frame_number.wrapping_add(1);
        Ok(wait)
    }

    fn record(&self, scene: &Scene, lease: &mut FrameLease<'_, D>) -> Result<()> {
        let extent = self.config.extent();
        let limits = self.device.limits();
        let mut parts = lease.parts();

        // BLASの取得
        let mut objects = Vec::with_capacity(scene.instances.len());
        for instance in &scene.instances {
            let blas = self.mesh_cache.get(&instance.mesh, &mut parts)?;
            objects.push(ObjectBinding::new(
                blas,
                instance.transform,
                instance.material,
            ));
        }

        let mut ctx = FrameContext {
            parts,
            output: &self.output,
            compute_pipelines: &self.compute_pipelines,
            objects,
            output_slot: None,
            sbt: ShaderBindingTableBuilder::new(),
            camera: scene.camera,
            frame_number: self.frame_number,
            extent,
        };
        for (step, ordinal) in &self.steps {
            step.prepare(*ordinal, &mut ctx)?;
        }
        for (step, ordinal) in self.steps.iter().filter(|(step, _)| step.is_ray_tracing()) {
            step.commit(*ordinal, &mut ctx)?;
        }

        // TLASのビルド
        let instances = ctx
            .objects
            .iter()
            .enumerate()
            .map(|(i, object)| match object.hit_group_index {
                Some(hit_group_index) => Ok(InstanceDesc {
                    transform: object.transform,
                    custom_index: i as u32,
                    mask: 0xff,
                    hit_group_index,
                    blas_address: object.blas.device_address(),
                    flags: InstanceFlags::TRIANGLE_FACING_CULL_DISABLE,
                }),
                None => Err(RenderError::MissingHitGroup(object.material.hit_group)),
            })
            .collect::<Result<Vec<_>>>()?;
        let tlas = build_tlas(self.device.as_ref(), &instances, &mut ctx.parts)?;
        // フレームが終わるまでTLASを生かしておく
        ctx.parts.retained.push(Box::new(tlas.clone()));
        let tlas_slot = ctx.parts.descriptors.add_acceleration_structure(&tlas)?;

        // shader binding tableのビルド
        let sbt = std::mem::take(&mut ctx.sbt);
        let table = sbt.build(&tlas, &self.ray_tracing_pipeline, ctx.parts.upload, &limits)?;

        // ray tracing
        let push_constants = RayTracingPushConstants {
            camera_to_world: ctx.camera.transform,
            fov_y: ctx.camera.fov_y,
            frame: ctx.frame_number,
            output_slot: ctx.output_slot.unwrap_or(0),
            tlas_slot,
            max_recursion_depth: self.config.max_recursion_depth,
            padding: [0; 3],
        };
        let descriptors = ctx.parts.descriptors;
        ctx.parts.command_list.barrier();
        ctx.parts.command_list.dispatch_rays(
            &self.ray_tracing_pipeline,
            &[
                descriptors.table(DescriptorTableKind::ShaderResource),
                descriptors.table(DescriptorTableKind::RenderTarget),
            ],
            bytemuck::bytes_of(&push_constants),
            table.ranges(),
            extent,
        );

        for (step, ordinal) in self.steps.iter().filter(|(step, _)| !step.is_ray_tracing()) {
            step.commit(*ordinal, &mut ctx)?;
        }
        Ok(())
    }

    /// 出力画像のサイズを変更する
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.wait_idle()?;
        self.config.width = width;
        self.config.height = height;
        self.output = self.device.create_texture(self.config.extent())?;
        log::info!("renderer resized to {width}x{height}");
        Ok(())
    }

    /// フレームの外でメッシュのBLASをビルドする
    pub fn preload(&self, meshes: &[Arc<Mesh>]) -> Result<FenceWait> {
        self.mesh_cache.preload(meshes, &self.commands)
    }

    /// 提出済みのすべての処理が終わるまで待機する
    pub fn wait_idle(&self) -> Result<()> {
        // デバイスを待つ前にsignalしておく
        let commands = self.commands.flush()?;
        self.device.wait_idle()?;
        commands.wait()?;
        self.frames.wait_idle()
    }

    /// 処理の完了を待ってからすべてのリソースを解放する
    pub fn dispose(mut self) -> Result<()> {
        self.wait_idle()?;
        self.disposed = true;
        log::debug!(
            "renderer disposed after {} frames on {} frame resources",
            self.frame_number,
            self.frames.frames_created()
        );
        Ok(())
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn output(&self) -> &D::Texture {
        &self.output
    }

    pub fn mesh_cache(&self) -> &MeshCache<D> {
        &self.mesh_cache
    }

    pub fn frames(&self) -> &FrameResourceTracker<D> {
        &self.frames
    }

    pub fn commands(&self) -> &CommandListPool<D> {
        &self.commands
    }

    /// これまでに描画したフレーム数
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }
}
impl<D: Device> Drop for Renderer<D> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(err) = self.wait_idle() {
            log::error!("failed to wait for the GPU before releasing the renderer: {err}");
        }
    }
}
