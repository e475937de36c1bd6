//! レンダラーに渡すシーンのスナップショットと、出力画像の表示先。

use crate::{fence::FenceWait, gpu::Device, Result};
use glam::{Mat4, Vec3, Vec4};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// メッシュの同一性を表すid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);
impl MeshId {
    fn next() -> Self {
        Self(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 三角形メッシュ
///
/// 作成時に一意なidが振られ、BLASはこのidごとに一度だけビルドされる。
#[derive(Debug)]
pub struct Mesh {
    id: MeshId,
    positions: Vec<Vec3>,
    indices: Vec<u32>,
}
impl Mesh {
    /// メッシュを作成する
    ///
    /// インデックスは3の倍数の個数で、すべて頂点数未満でなければならない。
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        assert!(
            !indices.is_empty() && indices.len() % 3 == 0,
            "mesh needs a non-empty list of triangles, got {} indices",
            indices.len()
        );
        assert!(
            indices.iter().all(|&index| (index as usize) < positions.len()),
            "mesh index out of range of {} vertices",
            positions.len()
        );
        Self {
            id: MeshId::next(),
            positions,
            indices,
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// 表面の材質
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    /// このインスタンスを描画するhit stepの番号
    pub hit_group: usize,
    pub base_color: Vec4,
    pub emission: Vec4,
}
impl Default for Material {
    fn default() -> Self {
        Self {
            hit_group: 0,
            base_color: Vec4::ONE,
            emission: Vec4::ZERO,
        }
    }
}

/// シーン中のメッシュの配置
#[derive(Debug, Clone)]
pub struct Instance {
    pub mesh: Arc<Mesh>,
    pub transform: Mat4,
    pub material: Material,
}

/// カメラ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// カメラからワールドへの変換
    pub transform: Mat4,
    /// 縦方向の画角 (ラジアン)
    pub fov_y: f32,
}
impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Mat4::look_at_rh(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, Vec3::Y).inverse(),
            fov_y: 60.0_f32.to_radians(),
        }
    }
}

/// 1フレーム分のシーン
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: Camera,
    pub instances: Vec<Instance>,
}

/// 出力画像の表示先
pub trait Presenter<D: Device>: Send {
    /// `ready`が完了すると`texture`への書き込みが終わっている
    fn present(&mut self, texture: &D::Texture, ready: &FenceWait) -> Result<()>;
}

/// 何も表示しないPresenter
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPresenter;
impl<D: Device> Presenter<D> for DiscardPresenter {
    fn present(&mut self, _texture: &D::Texture, _ready: &FenceWait) -> Result<()> {
        Ok(())
    }
}
