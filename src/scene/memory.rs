//! メモリ上で完結するシーン実装
//!
//! レンダラなしでエンジンを動かすためのもの（リプレイツールとテストで使用）。

use std::cell::Cell;
use std::collections::BTreeMap;

use nalgebra::{Matrix4, UnitQuaternion, Vector3};

use super::{ArSession, HitResult, IkRig, ModelNode, Skeleton, TransformKind};
use crate::projection::{compose, translation, translation_of};

#[derive(Debug, Clone)]
struct Bone {
    name: String,
    parent: Option<usize>,
    /// 親ボーンからのオフセット（モデル空間）
    offset: Vector3<f32>,
    local: Matrix4<f32>,
    kind: TransformKind,
    bind: Matrix4<f32>,
    inverse_bind: Matrix4<f32>,
}

/// 親→子の順にボーンを持つスケルトン
#[derive(Debug, Clone, Default)]
pub struct MemorySkeleton {
    bones: Vec<Bone>,
    world: Vec<Matrix4<f32>>,
}

impl MemorySkeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// ボーンを追加してインデックスを返す。親は追加済みである必要がある
    pub fn add_bone(&mut self, name: &str, parent: Option<&str>, offset: Vector3<f32>) -> Option<usize> {
        let parent = match parent {
            Some(p) => Some(self.bone_index(p)?),
            None => None,
        };
        let parent_bind = parent.map_or_else(Matrix4::identity, |p| self.bones[p].bind);
        let bind = parent_bind * translation(&offset);
        let inverse_bind = bind.try_inverse().unwrap_or_else(Matrix4::identity);
        self.bones.push(Bone {
            name: name.to_string(),
            parent,
            offset,
            local: Matrix4::identity(),
            kind: TransformKind::default(),
            bind,
            inverse_bind,
        });
        self.world.push(bind);
        Some(self.bones.len() - 1)
    }

    /// 単位スケールで身長約1.75mの人型（mixamo命名の胴体ボーン付き）
    pub fn humanoid() -> Self {
        let mut s = Self::new();
        let bones: [(&str, Option<&str>, [f32; 3]); 16] = [
            ("mixamorig:Hips", None, [0.0, 1.0, 0.0]),
            ("mixamorig:Spine2", Some("mixamorig:Hips"), [0.0, 0.3, 0.0]),
            ("Neck", Some("mixamorig:Spine2"), [0.0, 0.2, 0.0]),
            ("Top", Some("Neck"), [0.0, 0.25, 0.0]),
            ("RightShoulder", Some("mixamorig:Spine2"), [-0.2, 0.15, 0.0]),
            ("RightElbow", Some("RightShoulder"), [-0.28, 0.0, 0.0]),
            ("RightWrist", Some("RightElbow"), [-0.25, 0.0, 0.0]),
            ("LeftShoulder", Some("mixamorig:Spine2"), [0.2, 0.15, 0.0]),
            ("LeftElbow", Some("LeftShoulder"), [0.28, 0.0, 0.0]),
            ("LeftWrist", Some("LeftElbow"), [0.25, 0.0, 0.0]),
            ("RightHip", Some("mixamorig:Hips"), [-0.1, -0.05, 0.0]),
            ("RightKnee", Some("RightHip"), [0.0, -0.45, 0.0]),
            ("RightAnkle", Some("RightKnee"), [0.0, -0.42, 0.0]),
            ("LeftHip", Some("mixamorig:Hips"), [0.1, -0.05, 0.0]),
            ("LeftKnee", Some("LeftHip"), [0.0, -0.45, 0.0]),
            ("LeftAnkle", Some("LeftKnee"), [0.0, -0.42, 0.0]),
        ];
        for (name, parent, [x, y, z]) in bones {
            s.add_bone(name, parent, Vector3::new(x, y, z));
        }
        s
    }

    /// 指定ボーンを取り除いたコピー（子孫の親参照は外れる）
    pub fn without_bone(&self, name: &str) -> Self {
        let mut out = Self::new();
        for bone in &self.bones {
            if bone.name == name {
                continue;
            }
            let parent = bone
                .parent
                .map(|p| self.bones[p].name.as_str())
                .filter(|p| *p != name && out.bone_index(p).is_some());
            out.add_bone(&bone.name, parent, bone.offset);
        }
        out
    }

    /// バインド変換を上書き（単位行列で保存されたアセットの再現用）
    pub fn set_bind_transform(&mut self, index: usize, bind: Matrix4<f32>) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.bind = bind;
            bone.inverse_bind = bind.try_inverse().unwrap_or_else(Matrix4::identity);
        }
    }

    /// 親から順にモデル空間の変換を積み上げ、ノード変換を掛ける
    pub fn compute_world(&mut self, node_world: &Matrix4<f32>) {
        let mut model: Vec<Matrix4<f32>> = Vec::with_capacity(self.bones.len());
        for bone in &self.bones {
            let parent = bone.parent.map_or_else(Matrix4::identity, |p| model[p]);
            model.push(parent * translation(&bone.offset) * bone.local);
        }
        self.world = model.iter().map(|m| node_world * m).collect();
    }

    pub fn offset(&self, index: usize) -> Option<Vector3<f32>> {
        self.bones.get(index).map(|b| b.offset)
    }
}

impl Skeleton for MemorySkeleton {
    fn bone_count(&self) -> usize {
        self.bones.len()
    }

    fn bone_index(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }

    fn parent_index(&self, index: usize) -> Option<usize> {
        self.bones.get(index).and_then(|b| b.parent)
    }

    fn bone_world_transform(&self, index: usize) -> Matrix4<f32> {
        self.world.get(index).copied().unwrap_or_else(Matrix4::identity)
    }

    fn set_bone_world_transform(&mut self, index: usize, transform: Matrix4<f32>) {
        if let Some(w) = self.world.get_mut(index) {
            *w = transform;
        }
    }

    fn local_transform(&self, index: usize) -> Matrix4<f32> {
        self.bones.get(index).map_or_else(Matrix4::identity, |b| b.local)
    }

    fn transform_kind(&self, index: usize) -> TransformKind {
        self.bones.get(index).map(|b| b.kind).unwrap_or_default()
    }

    fn set_local_transform(&mut self, index: usize, transform: Matrix4<f32>, kind: TransformKind) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.local = transform;
            bone.kind = kind;
        }
    }

    fn bind_transform(&self, index: usize) -> Matrix4<f32> {
        self.bones.get(index).map_or_else(Matrix4::identity, |b| b.bind)
    }

    fn inverse_bind_transform(&self, index: usize) -> Matrix4<f32> {
        self.bones.get(index).map_or_else(Matrix4::identity, |b| b.inverse_bind)
    }

    /// `to` から親方向へ `from` まで辿り、通過したボーンのオフセットを伸縮する。
    /// 軸成分ごとの倍率は `1 + axis * (ratio - 1)` なのでゼロ軸は変化なし。
    fn scale_bone_range(&mut self, from: usize, to: usize, ratio: f32, axis: &Vector3<f32>) {
        let factor = Vector3::repeat(1.0) + axis * (ratio - 1.0);
        let mut current = Some(to);
        while let Some(index) = current {
            if index == from || index >= self.bones.len() {
                break;
            }
            let bone = &mut self.bones[index];
            bone.offset.component_mul_assign(&factor);
            current = bone.parent;
        }
    }
}

/// 最後に設定されたエフェクタ目標を保持するだけのリグ
#[derive(Debug, Clone, Default)]
pub struct MemoryRig {
    pub effectors: BTreeMap<String, usize>,
    pub targets: BTreeMap<String, Vector3<f32>>,
    pub updates: usize,
}

impl IkRig for MemoryRig {
    fn set_position_for_effector(&mut self, bone_name: &str, position: Vector3<f32>) {
        self.targets.insert(bone_name.to_string(), position);
        self.updates += 1;
    }
}

/// 親を持たないモデルノード
#[derive(Debug, Clone)]
pub struct MemoryModel {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
    skeleton: Option<MemorySkeleton>,
    pub constraints: usize,
    pub capture_enabled: bool,
    rig: Option<MemoryRig>,
}

impl MemoryModel {
    pub fn new(skeleton: Option<MemorySkeleton>) -> Self {
        let mut model = Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
            skeleton,
            constraints: 0,
            capture_enabled: false,
            rig: None,
        };
        model.compute_transforms();
        model
    }

    pub fn humanoid() -> Self {
        Self::new(Some(MemorySkeleton::humanoid()))
    }

    pub fn rig(&self) -> Option<&MemoryRig> {
        self.rig.as_ref()
    }

    pub fn memory_skeleton(&self) -> Option<&MemorySkeleton> {
        self.skeleton.as_ref()
    }

    pub fn memory_skeleton_mut(&mut self) -> Option<&mut MemorySkeleton> {
        self.skeleton.as_mut()
    }

    pub fn world_position(&self) -> Vector3<f32> {
        translation_of(&self.world_transform())
    }
}

impl ModelNode for MemoryModel {
    fn skeleton(&self) -> Option<&dyn Skeleton> {
        self.skeleton.as_ref().map(|s| s as &dyn Skeleton)
    }

    fn skeleton_mut(&mut self) -> Option<&mut dyn Skeleton> {
        self.skeleton.as_mut().map(|s| s as &mut dyn Skeleton)
    }

    fn skinner_world_transform(&self) -> Matrix4<f32> {
        self.world_transform()
    }

    fn scale(&self) -> Vector3<f32> {
        self.scale
    }

    fn set_scale(&mut self, scale: Vector3<f32>) {
        self.scale = scale;
    }

    fn set_rotation(&mut self, rotation: UnitQuaternion<f32>) {
        self.rotation = rotation;
    }

    fn set_position(&mut self, position: Vector3<f32>) {
        self.position = position;
    }

    fn world_transform(&self) -> Matrix4<f32> {
        compose(&self.position, &self.rotation, &self.scale)
    }

    fn set_world_transform(&mut self, position: Vector3<f32>, rotation: UnitQuaternion<f32>) {
        self.position = position;
        self.rotation = rotation;
        self.compute_transforms();
    }

    fn compute_transforms(&mut self) {
        let world = self.world_transform();
        if let Some(skeleton) = self.skeleton.as_mut() {
            skeleton.compute_world(&world);
        }
    }

    fn add_billboard_constraint(&mut self) {
        self.constraints += 1;
    }

    fn remove_all_constraints(&mut self) {
        self.constraints = 0;
    }

    fn set_calibration_capture(&mut self, enabled: bool) {
        self.capture_enabled = enabled;
    }

    fn attach_ik_rig(&mut self, effectors: &BTreeMap<String, usize>) {
        self.rig = Some(MemoryRig {
            effectors: effectors.clone(),
            ..MemoryRig::default()
        });
    }

    fn detach_ik_rig(&mut self) {
        self.rig = None;
    }

    fn ik_rig_mut(&mut self) -> Option<&mut dyn IkRig> {
        self.rig.as_mut().map(|r| r as &mut dyn IkRig)
    }
}

type HitFn = Box<dyn Fn(f32, f32) -> Vec<HitResult>>;

/// 固定カメラと差し替え可能なヒットテストを持つセッション
pub struct StaticArSession {
    camera: crate::projection::CameraFrame,
    hits: HitFn,
    hit_tests: Cell<usize>,
}

impl StaticArSession {
    pub fn new(camera: crate::projection::CameraFrame) -> Self {
        Self {
            camera,
            hits: Box::new(|_, _| Vec::new()),
            hit_tests: Cell::new(0),
        }
    }

    pub fn with_hits<F>(mut self, hits: F) -> Self
    where
        F: Fn(f32, f32) -> Vec<HitResult> + 'static,
    {
        self.hits = Box::new(hits);
        self
    }

    /// これまでのヒットテスト回数
    pub fn hit_test_count(&self) -> usize {
        self.hit_tests.get()
    }
}

impl ArSession for StaticArSession {
    fn camera(&self) -> crate::projection::CameraFrame {
        self.camera.clone()
    }

    fn hit_test(&self, x: f32, y: f32) -> Vec<HitResult> {
        self.hit_tests.set(self.hit_tests.get() + 1);
        (self.hits)(x, y)
    }
}
