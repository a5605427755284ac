//! 2D関節の3D再構成
//!
//! 視線と奥行き参照平面の交点を関節位置とする。参照平面は
//! カメラ前方の固定距離か、胴体領域の特徴点クラスタから決める。

use std::collections::VecDeque;

use nalgebra::{Vector2, Vector3};

use crate::config::EngineConfig;
use crate::pose::{JointType, TrackedJoint};
use crate::projection::{ray_plane_intersection, translation, CameraFrame, DepthPlane};
use crate::scene::{ArSession, HitResult, HitResultKind};

/// ウィンドウ深度テストのカーネル幅（正規化スクリーン座標）
pub const WINDOW_KERNEL: f32 = 0.01;

/// 胴体領域内のサンプル位置を決める乱数源
pub trait ScreenSampler {
    /// [0, 1) の一様乱数
    fn next_unit(&mut self) -> f32;
}

/// xorshift64 による決定的な乱数
#[derive(Debug, Clone)]
pub struct XorShiftSampler {
    state: u64,
}

impl XorShiftSampler {
    pub fn new(seed: u64) -> Self {
        // splitmix64 で種を混ぜる（小さい種だと最初の出力が0に張り付く）
        let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        // 状態0は固定点になる
        Self { state: z.max(1) }
    }
}

impl Default for XorShiftSampler {
    fn default() -> Self {
        Self::new(0x2545_F491_4F6C_DD1D)
    }
}

impl ScreenSampler for XorShiftSampler {
    fn next_unit(&mut self) -> f32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        // 上位24bitを仮数として使う
        (x >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// カメラ前方 `distance` メートルの、カメラを向いた平面
pub fn constant_distance_plane(camera: &CameraFrame, distance: f32) -> DepthPlane {
    DepthPlane::facing_camera(&camera.position, camera.position + camera.forward * distance)
}

/// ヒットテスト結果の選択
///
/// 先頭を基本とし、それより近い FeaturePoint があればそちらを採る。
pub fn select_hit(results: &[HitResult]) -> Option<&HitResult> {
    let (first, rest) = results.split_first()?;
    Some(rest.iter().fold(first, |best, r| {
        if r.kind == HitResultKind::FeaturePoint && r.distance < best.distance {
            r
        } else {
            best
        }
    }))
}

/// 1点のARヒットテスト
pub fn depth_hit_test(session: &dyn ArSession, x: f32, y: f32) -> Option<Vector3<f32>> {
    let results = session.hit_test(x, y);
    select_hit(&results).map(|r| r.world_position)
}

/// 中心と四隅の5点でヒットテストし、成功した点を平均する
pub fn window_depth_test(session: &dyn ArSession, x: f32, y: f32, kernel: f32) -> Option<Vector3<f32>> {
    let taps = [
        (x, y),
        (x + kernel, y - kernel),
        (x - kernel, y - kernel),
        (x + kernel, y + kernel),
        (x - kernel, y + kernel),
    ];
    let hits: Vec<Vector3<f32>> = taps
        .iter()
        .filter_map(|(tx, ty)| depth_hit_test(session, *tx, *ty))
        .collect();
    if hits.is_empty() {
        return None;
    }
    Some(hits.iter().sum::<Vector3<f32>>() / hits.len() as f32)
}

/// 中央値フィルタによるクラスタ中心
///
/// カメラからの距離の中央値を求め、そこから `outlier_m` を超えて
/// 離れた点を捨てて残りを平均する。
pub fn find_cluster_in_points(
    camera_position: &Vector3<f32>,
    points: &[Vector3<f32>],
    outlier_m: f32,
) -> Option<Vector3<f32>> {
    if points.is_empty() {
        return None;
    }
    let distances: Vec<f32> = points.iter().map(|p| (p - camera_position).norm()).collect();
    let mut sorted = distances.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = sorted[sorted.len() / 2];

    let inliers: Vec<&Vector3<f32>> = points
        .iter()
        .zip(&distances)
        .filter(|(_, d)| (*d - median).abs() <= outlier_m)
        .map(|(p, _)| p)
        .collect();
    // 中央値の点自身は必ず残る
    let sum: Vector3<f32> = inliers.iter().copied().sum();
    Some(sum / inliers.len() as f32)
}

/// 対角の肩と腰から胴体の矩形を決める（原点, 幅高さ）
///
/// 右肩+左腰を優先し、なければ左肩+右腰。
pub fn torso_box(joints: &[TrackedJoint]) -> Option<(Vector2<f32>, Vector2<f32>)> {
    let screen = |t: JointType| joints.iter().find(|j| j.joint_type == t).map(|j| j.screen);
    let (corner, opposite) = match (
        screen(JointType::RightShoulder),
        screen(JointType::LeftHip),
        screen(JointType::LeftShoulder),
        screen(JointType::RightHip),
    ) {
        (Some(rs), Some(lh), _, _) => (rs, lh),
        (_, _, Some(ls), Some(rh)) => (Vector2::new(rh.x, ls.y), Vector2::new(ls.x, rh.y)),
        _ => return None,
    };
    Some((corner, opposite - corner))
}

/// 胴体矩形内のランダムな点でヒットテストし、クラスタ中心を返す
///
/// ヒット数が `cluster_min_hits` 以下なら失敗。
/// `cluster_window_taps` が有効なら各サンプルを5点窓で平均する。
pub fn torso_clustered_depth(
    session: &dyn ArSession,
    joints: &[TrackedJoint],
    sampler: &mut dyn ScreenSampler,
    config: &EngineConfig,
) -> Option<Vector3<f32>> {
    let (origin, size) = torso_box(joints)?;
    let hits: Vec<Vector3<f32>> = (0..config.cluster_sample_count)
        .filter_map(|_| {
            let x = origin.x + size.x * sampler.next_unit();
            let y = origin.y + size.y * sampler.next_unit();
            if config.cluster_window_taps {
                window_depth_test(session, x, y, WINDOW_KERNEL)
            } else {
                depth_hit_test(session, x, y)
            }
        })
        .collect();
    if hits.len() <= config.cluster_min_hits {
        tracing::debug!(hits = hits.len(), "not enough feature points on torso");
        return None;
    }
    find_cluster_in_points(&session.camera().position, &hits, config.cluster_outlier_m)
}

/// 平面候補の登録結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneUpdate {
    /// 候補を現在の参照平面として採用してよい
    pub accepted: bool,
    /// 履歴が十分に一致しキャリブレーションを終えてよい
    pub converged: bool,
}

/// 平面候補の履歴（上限つき FIFO）
#[derive(Debug, Clone)]
pub struct PlaneHistory {
    positions: VecDeque<Vector3<f32>>,
    capacity: usize,
    debounce_window: usize,
    debounce_min_agree: usize,
    converge_min_agree: usize,
    agreement_m: f32,
}

impl PlaneHistory {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            positions: VecDeque::with_capacity(config.plane_history_len),
            capacity: config.plane_history_len,
            debounce_window: config.plane_debounce_window,
            debounce_min_agree: config.plane_debounce_min_agree,
            converge_min_agree: config.plane_converge_min_agree,
            agreement_m: config.plane_agreement_m,
        }
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Vector3<f32>> {
        self.positions.iter()
    }

    /// 候補を履歴に積み、採用・収束を判定する
    ///
    /// 比較はカメラからの距離で行う。履歴が `debounce_window` 未満の間は常に採用。
    pub fn push(&mut self, camera_position: &Vector3<f32>, candidate: Vector3<f32>) -> PlaneUpdate {
        let candidate_distance = (candidate - camera_position).norm();
        let agrees = |p: &Vector3<f32>| ((p - camera_position).norm() - candidate_distance).abs() < self.agreement_m;

        let accepted = if self.positions.len() >= self.debounce_window {
            let recent = self.positions.iter().skip(self.positions.len() - self.debounce_window);
            recent.filter(|p| agrees(*p)).count() >= self.debounce_min_agree
        } else {
            true
        };

        let mut converged = false;
        if self.positions.len() >= self.capacity {
            converged = self.positions.iter().filter(|p| agrees(*p)).count() >= self.converge_min_agree;
            self.positions.pop_front();
        }
        self.positions.push_back(candidate);

        PlaneUpdate { accepted, converged }
    }
}

/// 各関節の視線を平面と交差させ、ワールド変換を設定する
///
/// 交差しない関節は `world_transform` が None になる。
pub fn project_joints(camera: &CameraFrame, plane: &DepthPlane, joints: &mut [TrackedJoint]) {
    for joint in joints.iter_mut() {
        joint.world_transform = camera
            .screen_ray(joint.screen.x, joint.screen.y)
            .and_then(|ray| ray_plane_intersection(&ray, plane))
            .map(|p| translation(&p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Keypoint;
    use crate::scene::memory::StaticArSession;
    use approx::assert_relative_eq;

    fn camera() -> CameraFrame {
        CameraFrame::look_at(Vector3::zeros(), Vector3::new(0.0, 0.0, -1.0), 60.0, 640, 480)
    }

    fn at_distance(d: f32, x: f32) -> Vector3<f32> {
        // カメラからの距離がほぼ d になる点
        Vector3::new(x, 0.0, -(d * d - x * x).sqrt())
    }

    fn hit(kind: HitResultKind, distance: f32) -> HitResult {
        HitResult {
            world_position: Vector3::new(0.0, 0.0, -distance),
            kind,
            distance,
        }
    }

    fn joint(t: JointType, x: f32, y: f32) -> TrackedJoint {
        TrackedJoint::new(t, &Keypoint::new(x, y, 0.9), 0.0)
    }

    #[test]
    fn test_cluster_drops_outlier() {
        let cam = Vector3::zeros();
        let points = vec![
            at_distance(2.2, 0.1),
            at_distance(2.3, -0.1),
            at_distance(2.25, 0.0),
            at_distance(12.2, 0.2),
            at_distance(2.4, 0.05),
        ];
        let center = find_cluster_in_points(&cam, &points, 0.3).unwrap();
        let expected = (points[0] + points[1] + points[2] + points[4]) / 4.0;
        assert_relative_eq!(center, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_cluster_empty() {
        assert!(find_cluster_in_points(&Vector3::zeros(), &[], 0.3).is_none());
    }

    #[test]
    fn test_cluster_keeps_all_inliers() {
        let cam = Vector3::zeros();
        let points = vec![at_distance(1.0, 0.0), at_distance(1.1, 0.0), at_distance(1.2, 0.0)];
        let center = find_cluster_in_points(&cam, &points, 0.3).unwrap();
        assert_relative_eq!(center.z, -1.1, epsilon = 1e-5);
    }

    #[test]
    fn test_select_hit_prefers_closer_feature_point() {
        let results = vec![
            hit(HitResultKind::HorizontalPlane, 2.0),
            hit(HitResultKind::EstimatedPlane, 1.0),
            hit(HitResultKind::FeaturePoint, 1.5),
        ];
        let best = select_hit(&results).unwrap();
        assert_eq!(best.kind, HitResultKind::FeaturePoint);
        assert_eq!(best.distance, 1.5);
    }

    #[test]
    fn test_select_hit_keeps_first_without_closer_feature_point() {
        let results = vec![hit(HitResultKind::VerticalPlane, 1.0), hit(HitResultKind::FeaturePoint, 3.0)];
        assert_eq!(select_hit(&results).unwrap().kind, HitResultKind::VerticalPlane);
        assert!(select_hit(&[]).is_none());
    }

    #[test]
    fn test_window_depth_test_averages_hits() {
        let session = StaticArSession::new(camera()).with_hits(|x, _| {
            // 右半分だけヒットする
            if x >= 0.5 {
                vec![HitResult {
                    world_position: Vector3::new(x, 0.0, -2.0),
                    kind: HitResultKind::FeaturePoint,
                    distance: 2.0,
                }]
            } else {
                Vec::new()
            }
        });
        let p = window_depth_test(&session, 0.5, 0.5, WINDOW_KERNEL).unwrap();
        assert_eq!(session.hit_test_count(), 5);
        // 0.5, 0.51, 0.51 の平均
        assert_relative_eq!(p.x, (0.5 + 0.51 + 0.51) / 3.0, epsilon = 1e-5);
        assert_relative_eq!(p.z, -2.0);

        let miss = StaticArSession::new(camera());
        assert!(window_depth_test(&miss, 0.5, 0.5, WINDOW_KERNEL).is_none());
    }

    #[test]
    fn test_torso_box_diagonals() {
        let joints = vec![joint(JointType::RightShoulder, 0.4, 0.3), joint(JointType::LeftHip, 0.6, 0.6)];
        let (origin, size) = torso_box(&joints).unwrap();
        assert_relative_eq!(origin, Vector2::new(0.4, 0.3));
        assert_relative_eq!(size, Vector2::new(0.2, 0.3), epsilon = 1e-6);

        let joints = vec![joint(JointType::LeftShoulder, 0.6, 0.3), joint(JointType::RightHip, 0.4, 0.6)];
        let (origin, size) = torso_box(&joints).unwrap();
        assert_relative_eq!(origin, Vector2::new(0.4, 0.3));
        assert_relative_eq!(size, Vector2::new(0.2, 0.3), epsilon = 1e-6);

        let joints = vec![joint(JointType::LeftShoulder, 0.6, 0.3), joint(JointType::LeftHip, 0.6, 0.6)];
        assert!(torso_box(&joints).is_none());
    }

    #[test]
    fn test_torso_clustered_depth_needs_enough_hits() {
        let joints = vec![joint(JointType::RightShoulder, 0.4, 0.3), joint(JointType::LeftHip, 0.6, 0.6)];
        let config = EngineConfig::default();

        // 5ヒットでは足りない
        let count = std::cell::Cell::new(0);
        let session = StaticArSession::new(camera()).with_hits(move |_, _| {
            count.set(count.get() + 1);
            if count.get() <= 5 {
                vec![hit(HitResultKind::FeaturePoint, 2.0)]
            } else {
                Vec::new()
            }
        });
        let mut sampler = XorShiftSampler::default();
        assert!(torso_clustered_depth(&session, &joints, &mut sampler, &config).is_none());
        assert_eq!(session.hit_test_count(), 10);

        let session = StaticArSession::new(camera()).with_hits(|_, _| vec![hit(HitResultKind::FeaturePoint, 2.0)]);
        let p = torso_clustered_depth(&session, &joints, &mut sampler, &config).unwrap();
        assert_relative_eq!(p, Vector3::new(0.0, 0.0, -2.0));
    }

    #[test]
    fn test_xorshift_range_and_determinism() {
        let mut a = XorShiftSampler::new(42);
        let mut b = XorShiftSampler::new(42);
        for _ in 0..1000 {
            let v = a.next_unit();
            assert!((0.0..1.0).contains(&v));
            assert_eq!(v, b.next_unit());
        }
        let mut zero = XorShiftSampler::new(0);
        assert!(zero.next_unit() > 0.0);
    }

    #[test]
    fn test_small_seeds_first_sample_inside_unit_range() {
        for seed in [0, 1, 42] {
            let v = XorShiftSampler::new(seed).next_unit();
            assert!(v > 0.0 && v < 1.0, "seed {seed}: {v}");
        }
        // 隣り合う種でも系列が分かれる
        assert_ne!(XorShiftSampler::new(0).next_unit(), XorShiftSampler::new(1).next_unit());
    }

    #[test]
    fn test_plane_history_accepts_first_entries() {
        let config = EngineConfig::default();
        let mut history = PlaneHistory::from_config(&config);
        let cam = Vector3::zeros();
        for d in [1.0, 3.0, 5.0, 7.0, 9.0] {
            let update = history.push(&cam, Vector3::new(0.0, 0.0, -d));
            assert!(update.accepted);
            assert!(!update.converged);
        }
        // 直近5件と一致しない候補は採用されない
        let update = history.push(&cam, Vector3::new(0.0, 0.0, -20.0));
        assert!(!update.accepted);
    }

    #[test]
    fn test_plane_history_debounce_accepts_agreeing() {
        let config = EngineConfig::default();
        let mut history = PlaneHistory::from_config(&config);
        let cam = Vector3::zeros();
        for d in [2.0, 2.05, 5.0, 2.1, 6.0] {
            history.push(&cam, Vector3::new(0.0, 0.0, -d));
        }
        assert!(history.push(&cam, Vector3::new(0.0, 0.0, -2.02)).accepted);
    }

    #[test]
    fn test_plane_history_converges_and_is_bounded() {
        let config = EngineConfig::default();
        let mut history = PlaneHistory::from_config(&config);
        let cam = Vector3::zeros();
        for i in 0..10 {
            let update = history.push(&cam, Vector3::new(0.0, 0.0, -2.0 - 0.01 * i as f32));
            assert!(!update.converged);
        }
        assert_eq!(history.len(), 10);
        let update = history.push(&cam, Vector3::new(0.0, 0.0, -2.05));
        assert!(update.converged);
        assert_eq!(history.len(), 10);
    }

    #[test]
    fn test_plane_history_no_convergence_when_scattered() {
        let config = EngineConfig::default();
        let mut history = PlaneHistory::from_config(&config);
        let cam = Vector3::zeros();
        for i in 0..10 {
            history.push(&cam, Vector3::new(0.0, 0.0, -1.0 - i as f32));
        }
        assert!(!history.push(&cam, Vector3::new(0.0, 0.0, -4.0)).converged);
    }

    #[test]
    fn test_constant_plane_in_front_of_camera() {
        let cam = camera();
        let plane = constant_distance_plane(&cam, 1.0);
        assert_relative_eq!(plane.position, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-6);
        assert_relative_eq!(plane.normal, Vector3::z(), epsilon = 1e-6);
    }

    #[test]
    fn test_project_joints_onto_plane() {
        let cam = camera();
        let plane = constant_distance_plane(&cam, 1.0);
        let mut joints = vec![joint(JointType::Neck, 0.5, 0.5), joint(JointType::LeftHip, 0.6, 0.7)];
        project_joints(&cam, &plane, &mut joints);
        let neck = joints[0].world_position().unwrap();
        assert_relative_eq!(neck, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-4);
        let hip = joints[1].world_position().unwrap();
        assert_relative_eq!(hip.z, -1.0, epsilon = 1e-4);
        assert!(hip.x > 0.0 && hip.y < 0.0);
    }

    #[test]
    fn test_project_joints_drops_misses() {
        let cam = camera();
        // カメラの後ろの平面とは交差しない
        let plane = DepthPlane {
            position: Vector3::new(0.0, 0.0, 1.0),
            normal: -Vector3::z(),
        };
        let mut joints = vec![joint(JointType::Neck, 0.5, 0.5)];
        project_joints(&cam, &plane, &mut joints);
        assert!(!joints[0].has_world_transform());
    }
}
