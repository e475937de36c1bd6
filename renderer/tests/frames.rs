use glam::{Mat4, Vec3, Vec4};
use renderer::{
    gpu::{
        headless::HeadlessDevice, BufferUsage, DescriptorTableKind, HeapKind, ShaderModuleDesc,
    },
    BufferPool, BufferPoolDesc, DiscardPresenter, FrameConfig, FrameResourceTracker, HitStep,
    Instance, Material, Mesh, MissStep, PipelineStep, RayGenerationStep, Renderer,
    RendererConfig, Scene,
};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> FrameConfig {
    FrameConfig {
        upload_chunk_size: 64 * 1024,
        scratch_chunk_size: 64 * 1024,
        acceleration_structure_chunk_size: 64 * 1024,
        descriptor_capacity: 16,
    }
}

#[test]
fn frames_in_flight_are_not_reused_until_the_gpu_catches_up() {
    init_logger();
    let device = Arc::new(HeadlessDevice::deferred());
    let tracker = FrameResourceTracker::new(device.clone(), small_config()).unwrap();

    let mut waits = vec![];
    for expected in 0..3 {
        let mut lease = tracker.get().unwrap();
        assert_eq!(lease.index(), expected);
        lease.submit().unwrap();
        waits.push(lease.release().unwrap());
    }
    assert_eq!(tracker.frames_created(), 3);
    assert_eq!(tracker.queued(), 3);
    assert!(waits.iter().all(|wait| !wait.is_complete()));

    device.retire_all();
    assert!(waits.iter().all(|wait| wait.is_complete()));

    // 最も古いフレームから順に再利用される
    for expected in 0..3 {
        let mut lease = tracker.get().unwrap();
        assert_eq!(lease.index(), expected);
        lease.submit().unwrap();
        lease.release().unwrap();
    }
    assert_eq!(tracker.frames_created(), 3);
}

#[test]
fn reused_frame_starts_with_empty_pools_and_descriptors() {
    init_logger();
    let device = Arc::new(HeadlessDevice::new());
    let tracker = FrameResourceTracker::new(device, small_config()).unwrap();

    {
        let lease = tracker.get().unwrap();
        let view = lease.upload().allocate(16, 4, 16).unwrap();
        lease.descriptors().add_storage_buffer(&view).unwrap();
        assert_eq!(lease.upload().stats().used, 64);
        // submitせずにdropしても返却される
    }

    let lease = tracker.get().unwrap();
    assert_eq!(lease.index(), 0);
    assert_eq!(lease.upload().stats().used, 0);
    assert_eq!(lease.upload().stats().chunk_count, 1);
    assert_eq!(lease.descriptors().len(DescriptorTableKind::ShaderResource), 0);
}

#[test]
fn renderer_grows_frames_while_the_gpu_lags() {
    init_logger();
    let device = Arc::new(HeadlessDevice::deferred());
    let steps = vec![
        PipelineStep::RayGeneration(RayGenerationStep {
            export: String::from("raygen"),
            shader: ShaderModuleDesc::new(vec![]),
        }),
        PipelineStep::Miss(MissStep {
            export: String::from("miss"),
            shader: ShaderModuleDesc::new(vec![]),
            background: Vec4::ZERO,
        }),
        PipelineStep::Hit(HitStep {
            export: String::from("hit"),
            shader: ShaderModuleDesc::new(vec![]),
        }),
    ];
    let mut renderer = Renderer::new(
        device.clone(),
        RendererConfig::default(),
        steps,
        Box::new(DiscardPresenter),
    )
    .unwrap();
    let scene = Scene {
        instances: vec![Instance {
            mesh: Arc::new(Mesh::new(
                vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                vec![0, 1, 2],
            )),
            transform: Mat4::IDENTITY,
            material: Material::default(),
        }],
        ..Default::default()
    };

    let waits = (0..3)
        .map(|_| renderer.render(&scene).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(renderer.frames().frames_created(), 3);
    assert!(!waits[0].is_complete());

    device.retire_all();
    pollster::block_on(waits[2].clone()).unwrap();
    renderer.render(&scene).unwrap();
    assert_eq!(renderer.frames().frames_created(), 3);

    renderer.dispose().unwrap();
}

#[test]
fn pool_memory_is_reclaimed_only_after_the_fence() {
    init_logger();
    let device = Arc::new(HeadlessDevice::deferred());
    let tracker = FrameResourceTracker::new(device.clone(), small_config()).unwrap();
    let pool = BufferPool::new(
        device.clone(),
        BufferPoolDesc {
            label: String::from("persistent upload"),
            heap: HeapKind::Upload,
            usage: BufferUsage::STORAGE,
            default_chunk_size: 64 * 1024,
        },
    );

    let first = pool.allocate(16, 1, 256).unwrap();
    let wait = tracker.fence().signal().unwrap();
    pool.retire_after(&wait);
    assert!(!wait.is_complete());

    device.retire_all();
    pool.wait_last_use().unwrap();
    pool.reset();
    let second = pool.allocate(16, 1, 256).unwrap();
    assert_eq!(first.offset(), second.offset());
    assert_eq!(first.device_address(), second.device_address());
}
