//! 外部コンポーネントとの境界
//!
//! スケルトン・ノード・IKリグ・ARセッションはシーングラフ側が所有する。
//! エンジンはここで定義したトレイト越しにだけ触る。

pub mod memory;

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use nalgebra::{Matrix4, UnitQuaternion, Vector3};

use crate::pose::JointType;
use crate::projection::CameraFrame;
use crate::tracker::TrackedState;

/// ボーンのローカル変換の解釈
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformKind {
    /// 親の変換に連結済み
    #[default]
    Concatenated,
    /// 親ボーン空間でのローカル変換
    Local,
    /// 旧形式
    Legacy,
}

/// スキニング済みモデルのボーン格納
pub trait Skeleton {
    fn bone_count(&self) -> usize;
    fn bone_index(&self, name: &str) -> Option<usize>;
    /// ルートボーンは None
    fn parent_index(&self, index: usize) -> Option<usize>;

    /// 最後の `compute_transforms` で確定したワールド変換
    fn bone_world_transform(&self, index: usize) -> Matrix4<f32>;
    fn set_bone_world_transform(&mut self, index: usize, transform: Matrix4<f32>);

    /// アニメーション用ローカル変換
    fn local_transform(&self, index: usize) -> Matrix4<f32>;
    fn transform_kind(&self, index: usize) -> TransformKind;
    fn set_local_transform(&mut self, index: usize, transform: Matrix4<f32>, kind: TransformKind);

    fn bind_transform(&self, index: usize) -> Matrix4<f32>;
    fn inverse_bind_transform(&self, index: usize) -> Matrix4<f32>;

    /// `from` から `to` までの連続したボーン範囲を `axis` 方向に `ratio` 倍する
    fn scale_bone_range(&mut self, from: usize, to: usize, ratio: f32, axis: &Vector3<f32>);

    fn world_transform_by_name(&self, name: &str) -> Option<Matrix4<f32>> {
        self.bone_index(name).map(|i| self.bone_world_transform(i))
    }
}

/// IKソルバへの唯一の書き込み口
pub trait IkRig {
    fn set_position_for_effector(&mut self, bone_name: &str, position: Vector3<f32>);
}

/// シーングラフ上のモデルのルートノード
pub trait ModelNode {
    /// スキナーを持たなければ None
    fn skeleton(&self) -> Option<&dyn Skeleton>;
    fn skeleton_mut(&mut self) -> Option<&mut dyn Skeleton>;
    /// スキナーが載っているノードのワールド変換
    fn skinner_world_transform(&self) -> Matrix4<f32>;

    fn scale(&self) -> Vector3<f32>;
    fn set_scale(&mut self, scale: Vector3<f32>);
    fn set_rotation(&mut self, rotation: UnitQuaternion<f32>);
    fn set_position(&mut self, position: Vector3<f32>);
    fn world_transform(&self) -> Matrix4<f32>;
    /// スケールは保持したまま位置と回転をワールド空間で設定
    fn set_world_transform(&mut self, position: Vector3<f32>, rotation: UnitQuaternion<f32>);
    /// ノードとスケルトンのワールド変換を再計算
    fn compute_transforms(&mut self);

    fn add_billboard_constraint(&mut self);
    fn remove_all_constraints(&mut self);
    /// 手動キャリブレーション中のタップ・ピンチ受付面
    fn set_calibration_capture(&mut self, enabled: bool);

    fn attach_ik_rig(&mut self, effectors: &BTreeMap<String, usize>);
    fn detach_ik_rig(&mut self);
    fn ik_rig_mut(&mut self) -> Option<&mut dyn IkRig>;
}

/// ヒットテスト結果の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitResultKind {
    FeaturePoint,
    HorizontalPlane,
    VerticalPlane,
    EstimatedPlane,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitResult {
    pub world_position: Vector3<f32>,
    pub kind: HitResultKind,
    pub distance: f32,
}

/// ARセッション（カメラとヒットテスト）
pub trait ArSession {
    fn camera(&self) -> CameraFrame;
    /// 正規化スクリーン座標でのヒットテスト
    fn hit_test(&self, x: f32, y: f32) -> Vec<HitResult>;
}

/// コールバックに渡す推定関節
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointPos {
    pub world_position: Vector3<f32>,
    pub screen_x: f32,
    pub screen_y: f32,
}

/// 1フレーム分の関節更新通知
#[derive(Debug, Clone, Default)]
pub struct JointUpdate {
    /// 再構成済みの推定関節
    pub filtered: BTreeMap<JointType, JointPos>,
    /// リグに渡す位置
    pub dampened: BTreeMap<JointType, Vector3<f32>>,
    /// モデル側ボーンの現在のワールド変換
    pub model: BTreeMap<JointType, Matrix4<f32>>,
}

/// コントローラの通知先
pub trait BodyIkDelegate {
    fn on_calibration_finished(&self) {}
    fn on_body_track_state_update(&self, _state: TrackedState) {}
    fn on_joint_update(&self, _update: &JointUpdate) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinchState {
    Start,
    Move,
    End,
}

/// ミリ秒単位の時計
pub trait Clock {
    fn now_ms(&self) -> f64;
}

/// 生成時点からの経過時間を返す時計
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// 手動で進める時計
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: f64) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for std::rc::Rc<C> {
    fn now_ms(&self) -> f64 {
        (**self).now_ms()
    }
}

/// ボーン名 → インデックス
pub type EffectorMap = BTreeMap<String, usize>;

/// 関節 → ボーンインデックス
pub type JointBoneMap = HashMap<JointType, usize>;
