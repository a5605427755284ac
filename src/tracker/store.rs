//! 関節キャッシュと追跡状態の判定

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::TrackedState;
use crate::pose::{JointType, TrackedJoint};

/// 最新フレームの再構成済み関節
///
/// フレームごとに丸ごと置き換える。置き換えで消えた関節は
/// `last_seen` に残り、タイムアウトまでは復元の対象になる。
#[derive(Debug, Clone, Default)]
pub struct JointStore {
    cache: BTreeMap<JointType, TrackedJoint>,
    last_seen: BTreeMap<JointType, TrackedJoint>,
}

impl JointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// キャッシュを置き換える。再構成に失敗した関節は捨てる
    pub fn replace<I>(&mut self, joints: I)
    where
        I: IntoIterator<Item = TrackedJoint>,
    {
        self.cache = joints
            .into_iter()
            .filter(TrackedJoint::has_world_transform)
            .map(|j| (j.joint_type, j))
            .collect();
        for (joint_type, joint) in &self.cache {
            self.last_seen.insert(*joint_type, joint.clone());
        }
    }

    /// 復元した関節を追加（`last_seen` は更新しない）
    pub fn insert_recovered(&mut self, joint: TrackedJoint) {
        self.cache.insert(joint.joint_type, joint);
    }

    pub fn get(&self, joint: JointType) -> Option<&TrackedJoint> {
        self.cache.get(&joint)
    }

    pub fn contains(&self, joint: JointType) -> bool {
        self.cache.contains_key(&joint)
    }

    pub fn position(&self, joint: JointType) -> Option<Vector3<f32>> {
        self.get(joint).and_then(TrackedJoint::world_position)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedJoint> {
        self.cache.values()
    }

    pub fn joints(&self) -> &BTreeMap<JointType, TrackedJoint> {
        &self.cache
    }

    /// キャッシュと履歴を両方消す
    pub fn clear(&mut self) {
        self.cache.clear();
        self.last_seen.clear();
    }

    /// 今フレームで見失った関節のうち、タイムアウト前のもの
    ///
    /// タイムアウトを過ぎた関節は履歴からも消す。
    pub fn expired<F>(&mut self, now_ms: f64, timeout_ms: F) -> Vec<TrackedJoint>
    where
        F: Fn(JointType) -> f64,
    {
        let cache = &self.cache;
        self.last_seen
            .retain(|joint_type, joint| cache.contains_key(joint_type) || joint.age_ms(now_ms) <= timeout_ms(*joint_type));
        self.last_seen
            .iter()
            .filter(|(joint_type, _)| !cache.contains_key(joint_type))
            .map(|(_, joint)| joint.clone())
            .collect()
    }

    /// バインド済みボーンを持つ関節の数
    pub fn tagged_count(&self) -> usize {
        self.cache.keys().filter(|j| j.bone_tag().is_some()).count()
    }

    /// 現在のキャッシュから追跡状態を判定
    pub fn classify(&self, expected_count: usize) -> TrackedState {
        classify(
            self.contains(JointType::Neck),
            self.contains(JointType::LeftHip) && self.contains(JointType::RightHip),
            self.tagged_count(),
            expected_count,
        )
    }
}

/// 追跡状態の判定（前フレームの状態には依存しない）
///
/// 首と両腰が揃っていれば関節数が少なくてもスケール可能なので、
/// 全関節が揃っていない限り LimitedEffectors とする。
pub fn classify(has_neck: bool, has_both_hips: bool, tagged_count: usize, expected_count: usize) -> TrackedState {
    if !has_neck {
        TrackedState::NotAvailable
    } else if !has_both_hips {
        TrackedState::NoScalableJointsAvailable
    } else if tagged_count == expected_count {
        TrackedState::FullEffectors
    } else {
        TrackedState::LimitedEffectors
    }
}
