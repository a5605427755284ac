use nalgebra::{Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::projection::translation_of;

/// 姿勢推定器が出力する 16 関節のインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum JointType {
    Top = 0,
    Neck = 1,
    RightShoulder = 2,
    RightElbow = 3,
    RightWrist = 4,
    LeftShoulder = 5,
    LeftElbow = 6,
    LeftWrist = 7,
    RightHip = 8,
    RightKnee = 9,
    RightAnkle = 10,
    LeftHip = 11,
    LeftKnee = 12,
    LeftAnkle = 13,
    Thorax = 14,
    Pelvis = 15,
}

impl JointType {
    pub const COUNT: usize = 16;

    pub const ALL: [JointType; JointType::COUNT] = [
        Self::Top,
        Self::Neck,
        Self::RightShoulder,
        Self::RightElbow,
        Self::RightWrist,
        Self::LeftShoulder,
        Self::LeftElbow,
        Self::LeftWrist,
        Self::RightHip,
        Self::RightKnee,
        Self::RightAnkle,
        Self::LeftHip,
        Self::LeftKnee,
        Self::LeftAnkle,
        Self::Thorax,
        Self::Pelvis,
    ];

    /// 胴体の基準となる関節
    pub const ROOT: JointType = Self::Neck;

    /// 3Dモデル側で対応するボーン名
    ///
    /// Thorax / Pelvis はモデルに対応ボーンを持たない。
    pub fn bone_tag(self) -> Option<&'static str> {
        match self {
            Self::Top => Some("Top"),
            Self::Neck => Some("Neck"),
            Self::RightShoulder => Some("RightShoulder"),
            Self::RightElbow => Some("RightElbow"),
            Self::RightWrist => Some("RightWrist"),
            Self::LeftShoulder => Some("LeftShoulder"),
            Self::LeftElbow => Some("LeftElbow"),
            Self::LeftWrist => Some("LeftWrist"),
            Self::RightHip => Some("RightHip"),
            Self::RightKnee => Some("RightKnee"),
            Self::RightAnkle => Some("RightAnkle"),
            Self::LeftHip => Some("LeftHip"),
            Self::LeftKnee => Some("LeftKnee"),
            Self::LeftAnkle => Some("LeftAnkle"),
            Self::Thorax | Self::Pelvis => None,
        }
    }

    /// 設定ファイル・ログで使う名前
    pub fn name(self) -> &'static str {
        match self {
            Self::Thorax => "Thorax",
            Self::Pelvis => "Pelvis",
            other => other.bone_tag().unwrap_or_default(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|j| j.name() == name)
    }

    /// ボーン名から関節を逆引き
    pub fn from_bone_tag(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|j| j.bone_tag() == Some(name))
    }

    /// ボーンタグを持つ関節（モデルにバインドされる関節）
    pub fn tagged() -> impl Iterator<Item = JointType> {
        Self::ALL.into_iter().filter(|j| j.bone_tag().is_some())
    }
}

/// 単一キーポイント（正規化スクリーン座標）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
    /// 正規化されたX座標 (0.0〜1.0, 左端が0)
    pub x: f32,
    /// 正規化されたY座標 (0.0〜1.0, 上端が0)
    pub y: f32,
    /// 信頼度スコア (0.0〜1.0)
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// 推定器1回分の出力
///
/// 関節タイプごとに候補リストを持ち、先頭が最良の検出。
#[derive(Debug, Clone, Default)]
pub struct PoseFrame {
    pub candidates: [Vec<Keypoint>; JointType::COUNT],
}

impl PoseFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// 候補を追加（最初に追加したものが採用される）
    pub fn push(&mut self, joint: JointType, keypoint: Keypoint) -> &mut Self {
        self.candidates[joint as usize].push(keypoint);
        self
    }

    pub fn with(mut self, joint: JointType, keypoint: Keypoint) -> Self {
        self.push(joint, keypoint);
        self
    }

    /// 関節タイプごとの最良候補
    pub fn best(&self, joint: JointType) -> Option<&Keypoint> {
        self.candidates[joint as usize].first()
    }

    /// 検出された関節（タイプごとに1つ）を列挙
    pub fn detections(&self) -> impl Iterator<Item = (JointType, &Keypoint)> {
        JointType::ALL
            .into_iter()
            .filter_map(move |j| self.best(j).map(|kp| (j, kp)))
    }
}

/// 3D再構成済み（または再構成待ち）の関節
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedJoint {
    pub joint_type: JointType,
    pub confidence: f32,
    pub screen: Vector2<f32>,
    /// ワールド座標での変換。再構成に失敗したら None
    pub world_transform: Option<Matrix4<f32>>,
    pub spawn_time_ms: f64,
}

impl TrackedJoint {
    pub fn new(joint_type: JointType, keypoint: &Keypoint, spawn_time_ms: f64) -> Self {
        Self {
            joint_type,
            confidence: keypoint.confidence,
            screen: Vector2::new(keypoint.x, keypoint.y),
            world_transform: None,
            spawn_time_ms,
        }
    }

    /// 再構成済み位置を持つ関節を直接作る（再生・テスト用）
    pub fn with_transform(joint_type: JointType, transform: Matrix4<f32>, spawn_time_ms: f64) -> Self {
        Self {
            joint_type,
            confidence: 1.0,
            screen: Vector2::zeros(),
            world_transform: Some(transform),
            spawn_time_ms,
        }
    }

    pub fn has_world_transform(&self) -> bool {
        self.world_transform.is_some()
    }

    pub fn world_position(&self) -> Option<Vector3<f32>> {
        self.world_transform.as_ref().map(translation_of)
    }

    /// 最後の検出からの経過時間
    pub fn age_ms(&self, now_ms: f64) -> f64 {
        now_ms - self.spawn_time_ms
    }
}
