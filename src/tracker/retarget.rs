//! ユーザーとモデルの体格合わせ
//!
//! 胴体長の比による一様スケールと、ボーンごとの長さ比による
//! 非一様スケールの2段構え。

use std::collections::BTreeMap;

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::RetargetError;
use crate::pose::{tree, JointType};
use crate::projection::{is_identity, translation_of};
use crate::scene::Skeleton;

/// 関節 → ワールド位置
pub type JointPositions = BTreeMap<JointType, Vector3<f32>>;

pub fn mid_point(a: &Vector3<f32>, b: &Vector3<f32>) -> Vector3<f32> {
    (a - b) * 0.5 + b
}

/// 両腰の中点から首までの距離
pub fn torso_height(neck: &Vector3<f32>, left_hip: &Vector3<f32>, right_hip: &Vector3<f32>) -> f32 {
    (mid_point(left_hip, right_hip) - neck).norm()
}

/// モデルの一様スケール倍率
pub fn uniform_scale_ratio(user_torso_height: f32, model_torso_height: f32, sizing_ratio: f32) -> f32 {
    user_torso_height / model_torso_height * sizing_ratio
}

/// スケルトンの現在姿勢での胴体長
pub fn skeleton_torso_height(skeleton: &dyn Skeleton) -> Option<f32> {
    let position = |joint: JointType| {
        joint
            .bone_tag()
            .and_then(|tag| skeleton.world_transform_by_name(tag))
            .map(|m| translation_of(&m))
    };
    Some(torso_height(
        &position(JointType::Neck)?,
        &position(JointType::LeftHip)?,
        &position(JointType::RightHip)?,
    ))
}

/// ボーン名 → 長さ（推定側とモデル側）
///
/// キーは子ボーン名。キャリブレーション完了後は両テーブルのキーが一致する。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoneLengthTable {
    pub ml: BTreeMap<String, f32>,
    pub model: BTreeMap<String, f32>,
}

impl BoneLengthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ml.clear();
        self.model.clear();
    }

    pub fn insert(&mut self, bone: &str, ml_length: f32, model_length: f32) {
        self.ml.insert(bone.to_string(), ml_length);
        self.model.insert(bone.to_string(), model_length);
    }

    pub fn has_model_lengths(&self) -> bool {
        !self.model.is_empty()
    }

    /// 推定長 / モデル長
    pub fn growth_ratio(&self, bone: &str, min_model_length: f32) -> Result<f32, RetargetError> {
        let ml = self
            .ml
            .get(bone)
            .ok_or_else(|| RetargetError::MissingLength(bone.to_string()))?;
        let model = self
            .model
            .get(bone)
            .ok_or_else(|| RetargetError::MissingLength(bone.to_string()))?;
        if *model < min_model_length {
            return Err(RetargetError::DegenerateBone {
                bone: bone.to_string(),
                length: *model,
            });
        }
        Ok(ml / model)
    }
}

fn tag_of(joint: JointType) -> Result<&'static str, RetargetError> {
    joint
        .bone_tag()
        .ok_or_else(|| RetargetError::MissingJoint(joint.name().to_string()))
}

fn position_of(positions: &JointPositions, joint: JointType) -> Result<Vector3<f32>, RetargetError> {
    positions
        .get(&joint)
        .copied()
        .ok_or_else(|| RetargetError::MissingJoint(joint.name().to_string()))
}

/// 関節木を首から前順に辿り、親子間の距離を両側で記録する
///
/// どちらかの側で位置がない辺は飛ばす。
pub fn known_bone_sizes(table: &mut BoneLengthTable, ml: &JointPositions, model: &JointPositions) {
    for (parent, child) in tree::bones_preorder(JointType::ROOT) {
        let (Some(tag), Some(ml_p), Some(ml_c), Some(model_p), Some(model_c)) = (
            child.bone_tag(),
            ml.get(&parent),
            ml.get(&child),
            model.get(&parent),
            model.get(&child),
        ) else {
            continue;
        };
        table.insert(tag, (ml_c - ml_p).norm(), (model_c - model_p).norm());
    }
}

/// 推定器に対応点のない胴体ボーン（背骨・腰ルート）を含む長さ
///
/// 推定側の背骨位置は、推定の首にモデルの首→背骨ベクトルを足して求める。
/// 腰ルートも同様にモデルの背骨→腰ベクトルから求める。
pub fn inferred_bone_sizes(
    table: &mut BoneLengthTable,
    ml: &JointPositions,
    model: &JointPositions,
    model_spine: &Vector3<f32>,
    model_hips: &Vector3<f32>,
    spine_bone: &str,
) -> Result<(), RetargetError> {
    let model_neck = position_of(model, JointType::Neck)?;
    let ml_neck = position_of(ml, JointType::Neck)?;
    let ml_spine = ml_neck + (model_spine - model_neck);
    let ml_hips = ml_spine + (model_hips - model_spine);

    for joint in [JointType::RightShoulder, JointType::LeftShoulder, JointType::Neck] {
        let ml_len = (position_of(ml, joint)? - ml_spine).norm();
        let model_len = (position_of(model, joint)? - model_spine).norm();
        table.insert(tag_of(joint)?, ml_len, model_len);
    }

    table.insert(spine_bone, (ml_spine - ml_hips).norm(), (model_spine - model_hips).norm());

    for joint in [JointType::RightHip, JointType::LeftHip] {
        let ml_len = (position_of(ml, joint)? - ml_hips).norm();
        let model_len = (position_of(model, joint)? - model_hips).norm();
        table.insert(tag_of(joint)?, ml_len, model_len);
    }
    Ok(())
}

/// ボーン区間ごとの伸縮方向（ゼロ軸は伸縮しない）
///
/// 腕は X、脚と首は Y 方向に伸ばす。
pub fn bone_scale_plan<'a>(spine_bone: &'a str, hips_bone: &'a str) -> Vec<(&'a str, &'a str, Vector3<f32>)> {
    let none = Vector3::zeros();
    let x = Vector3::x();
    let y = Vector3::y();
    vec![
        (hips_bone, spine_bone, none),
        (spine_bone, "Neck", y),
        (spine_bone, "RightShoulder", none),
        (spine_bone, "LeftShoulder", none),
        ("Neck", "Top", none),
        ("RightShoulder", "RightElbow", x),
        ("RightElbow", "RightWrist", x),
        ("LeftShoulder", "LeftElbow", x),
        ("LeftElbow", "LeftWrist", x),
        ("RightHip", "RightKnee", y),
        ("RightKnee", "RightAnkle", y),
        ("LeftHip", "LeftKnee", y),
        ("LeftKnee", "LeftAnkle", y),
    ]
}

/// 計画に従ってスケルトンを伸縮する。適用できた区間数を返す
///
/// 長さが記録されていない区間や縮退したボーンは警告して飛ばす。
pub fn apply_bone_scales(
    skeleton: &mut dyn Skeleton,
    table: &BoneLengthTable,
    plan: &[(&str, &str, Vector3<f32>)],
    min_model_length: f32,
) -> usize {
    let mut applied = 0;
    for (from, to, axis) in plan {
        let ratio = match table.growth_ratio(to, min_model_length) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(bone = %to, error = %e, "skipping bone segment");
                continue;
            }
        };
        let (Some(from_index), Some(to_index)) = (skeleton.bone_index(from), skeleton.bone_index(to)) else {
            tracing::warn!(from = %from, to = %to, "bone segment not found in skeleton");
            continue;
        };
        skeleton.scale_bone_range(from_index, to_index, ratio, axis);
        applied += 1;
    }
    applied
}

/// Top ボーンのバインド変換が単位行列で保存されている場合に、
/// 親方向のローカル変換を積み直してワールド変換を復元する
///
/// 復元したら true。
pub fn restore_top_bone_transform(skeleton: &mut dyn Skeleton, skinner_world: &Matrix4<f32>) -> bool {
    let Some(top) = JointType::Top.bone_tag().and_then(|tag| skeleton.bone_index(tag)) else {
        return false;
    };
    if !is_identity(&skeleton.bind_transform(top)) {
        return false;
    }

    // ルート以外の祖先（Top 自身を含む）
    let mut chain = Vec::new();
    let mut current = Some(top);
    while let Some(index) = current {
        let parent = skeleton.parent_index(index);
        if parent.is_none() {
            break;
        }
        chain.push(index);
        current = parent;
    }

    let unrolled = chain
        .iter()
        .rev()
        .fold(Matrix4::<f32>::identity(), |acc, index| acc * skeleton.local_transform(*index));
    let model_space = skeleton.inverse_bind_transform(top) * unrolled;
    skeleton.set_bone_world_transform(top, skinner_world * model_space);
    true
}
