//! 見失った関節の復元
//!
//! 各関節のルート関節からの相対変換を毎フレーム保存しておき、
//! 関節が消えたら現在のルート変換に掛けて位置を戻す（0次ホールド）。

use std::collections::BTreeMap;

use nalgebra::Matrix4;

use super::store::JointStore;
use crate::pose::{JointType, TrackedJoint};

/// 関節 → ルートからの相対変換
#[derive(Debug, Clone)]
pub struct RootOffsetCache {
    root: JointType,
    offsets: BTreeMap<JointType, Matrix4<f32>>,
}

impl RootOffsetCache {
    pub fn new(root: JointType) -> Self {
        Self {
            root,
            offsets: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
    }

    pub fn offset(&self, joint: JointType) -> Option<&Matrix4<f32>> {
        self.offsets.get(&joint)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// 期限内の消えた関節をキャッシュ済みの相対変換から復元してストアへ戻す
    ///
    /// ルート関節が見えていなければ何もしない。戻り値は復元した関節数。
    pub fn recover(&self, store: &mut JointStore, expired: Vec<TrackedJoint>) -> usize {
        let Some(root) = store.get(self.root).and_then(|j| j.world_transform) else {
            return 0;
        };
        let mut recovered = 0;
        for mut joint in expired {
            if store.contains(joint.joint_type) {
                continue;
            }
            let Some(offset) = self.offsets.get(&joint.joint_type) else {
                continue;
            };
            joint.world_transform = Some(root * offset);
            store.insert_recovered(joint);
            recovered += 1;
        }
        recovered
    }

    /// 現在のストアから相対変換を作り直す（ルート自身は除く）
    pub fn recompute(&mut self, store: &JointStore) {
        let Some(root_inv) = store
            .get(self.root)
            .and_then(|j| j.world_transform)
            .and_then(|m| m.try_inverse())
        else {
            return;
        };
        self.offsets = store
            .iter()
            .filter(|j| j.joint_type != self.root)
            .filter_map(|j| j.world_transform.map(|m| (j.joint_type, root_inv * m)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{translation, translation_of};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn joint(t: JointType, p: Vector3<f32>, time: f64) -> TrackedJoint {
        TrackedJoint::with_transform(t, translation(&p), time)
    }

    #[test]
    fn test_recompute_excludes_root() {
        let mut store = JointStore::new();
        store.replace(vec![
            joint(JointType::Neck, Vector3::new(0.0, 1.5, -1.0), 0.0),
            joint(JointType::LeftWrist, Vector3::new(0.5, 1.2, -1.0), 0.0),
        ]);
        let mut cache = RootOffsetCache::new(JointType::Neck);
        cache.recompute(&store);
        assert_eq!(cache.len(), 1);
        assert!(cache.offset(JointType::Neck).is_none());
        let offset = cache.offset(JointType::LeftWrist).unwrap();
        assert_relative_eq!(translation_of(offset), Vector3::new(0.5, -0.3, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_recover_follows_root() {
        let mut store = JointStore::new();
        store.replace(vec![
            joint(JointType::Neck, Vector3::new(0.0, 1.5, -1.0), 0.0),
            joint(JointType::LeftWrist, Vector3::new(0.5, 1.2, -1.0), 0.0),
        ]);
        let mut cache = RootOffsetCache::new(JointType::Neck);
        cache.recompute(&store);

        // 手首が消え、首が移動した
        store.replace(vec![joint(JointType::Neck, Vector3::new(1.0, 1.5, -2.0), 30.0)]);
        let expired = store.expired(30.0, |_| 500.0);
        assert_eq!(cache.recover(&mut store, expired), 1);

        let wrist = store.position(JointType::LeftWrist).unwrap();
        assert_relative_eq!(wrist, Vector3::new(1.5, 1.2, -2.0), epsilon = 1e-6);
    }

    #[test]
    fn test_recover_without_root_does_nothing() {
        let mut store = JointStore::new();
        store.replace(vec![
            joint(JointType::Neck, Vector3::new(0.0, 1.5, -1.0), 0.0),
            joint(JointType::LeftWrist, Vector3::new(0.5, 1.2, -1.0), 0.0),
        ]);
        let mut cache = RootOffsetCache::new(JointType::Neck);
        cache.recompute(&store);

        store.replace(vec![joint(JointType::RightHip, Vector3::new(0.0, 1.0, -1.0), 30.0)]);
        let expired = store.expired(30.0, |_| 500.0);
        assert_eq!(cache.recover(&mut store, expired), 0);
        assert!(!store.contains(JointType::LeftWrist));
    }

    #[test]
    fn test_recover_skips_unknown_offset() {
        let mut store = JointStore::new();
        store.replace(vec![joint(JointType::Neck, Vector3::zeros(), 0.0)]);
        let cache = RootOffsetCache::new(JointType::Neck);
        let ghost = joint(JointType::Top, Vector3::zeros(), 0.0);
        assert_eq!(cache.recover(&mut store, vec![ghost]), 0);
    }
}
