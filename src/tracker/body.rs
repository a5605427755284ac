//! 推定関節でリグ付きモデルを動かすコントローラ
//!
//! 1フレームの流れ:
//! 3D再構成 → キャッシュ置き換え → 見失った関節の復元 → 追跡状態の判定
//! → (キャリブレーション確定) → ルート追従とIKエフェクタ更新 → 通知

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use nalgebra::{Matrix4, UnitQuaternion, Vector3};

use super::depth::{constant_distance_plane, project_joints, torso_clustered_depth, ScreenSampler, XorShiftSampler};
use super::recovery::RootOffsetCache;
use super::retarget::{self, BoneLengthTable, JointPositions};
use super::store::JointStore;
use super::TrackedState;
use crate::calibration::{CalibratedBody, CalibrationPhase, CalibrationState};
use crate::config::{DepthMode, EngineConfig};
use crate::error::BindError;
use crate::pose::{tree, JointType, PoseFrame, TrackedJoint};
use crate::projection::{rotation_of, translation, translation_of, DepthPlane};
use crate::recording::{AnimRecorder, BodyAnimData, JsonRecorder};
use crate::scene::{
    ArSession, BodyIkDelegate, Clock, EffectorMap, JointBoneMap, JointPos, JointUpdate, ModelNode, PinchState,
    SystemClock,
};

/// バインド時に確定するモデル側の情報
#[derive(Debug, Clone)]
struct ModelBinding {
    joint_bones: JointBoneMap,
    effectors: EffectorMap,
    /// 単位スケールでの胴体長
    model_torso_height: f32,
}

impl ModelBinding {
    /// 必須ボーンを全て確認してから測定する（失敗時はモデルに触らない）
    fn from_model(node: &mut dyn ModelNode) -> Result<Self, BindError> {
        let skeleton = node.skeleton().ok_or(BindError::NoSkeleton)?;
        let mut joint_bones = JointBoneMap::new();
        let mut effectors = EffectorMap::new();
        for joint in JointType::tagged() {
            let Some(tag) = joint.bone_tag() else {
                continue;
            };
            let index = skeleton
                .bone_index(tag)
                .ok_or_else(|| BindError::MissingBone(tag.to_string()))?;
            joint_bones.insert(joint, index);
            effectors.insert(tag.to_string(), index);
        }

        // 比率計算用に単位スケールで測る
        node.set_scale(Vector3::repeat(1.0));
        node.compute_transforms();
        let model_torso_height = node
            .skeleton()
            .and_then(retarget::skeleton_torso_height)
            .ok_or(BindError::NoSkeleton)?;

        Ok(Self {
            joint_bones,
            effectors,
            model_torso_height,
        })
    }

    fn bone(&self, joint: JointType) -> Option<usize> {
        self.joint_bones.get(&joint).copied()
    }
}

/// モデルを単位スケール・無回転で `position` に置き、全ボーンのローカル変換を戻す
fn reset_model_pose(node: &mut dyn ModelNode, position: Vector3<f32>) {
    node.set_scale(Vector3::repeat(1.0));
    node.set_rotation(UnitQuaternion::identity());
    node.set_position(position);
    if let Some(skeleton) = node.skeleton_mut() {
        for index in 0..skeleton.bone_count() {
            let kind = skeleton.transform_kind(index);
            skeleton.set_local_transform(index, Matrix4::identity(), kind);
        }
    }
    node.compute_transforms();
}

/// ボディIKコントローラ
///
/// モデルとデリゲートは所有しない（シーングラフ側が寿命を持つ）。
pub struct BodyIkController {
    config: EngineConfig,
    session: Rc<dyn ArSession>,
    clock: Box<dyn Clock>,
    sampler: Box<dyn ScreenSampler>,
    recorder: Box<dyn AnimRecorder>,
    delegate: Option<Weak<dyn BodyIkDelegate>>,
    model: Option<Weak<RefCell<dyn ModelNode>>>,
    binding: Option<ModelBinding>,

    calibration: CalibrationState,
    store: JointStore,
    offsets: RootOffsetCache,
    /// リグに渡す関節位置
    dampened: JointPositions,
    state: TrackedState,

    bone_lengths: BoneLengthTable,
    user_torso_height: f32,
    ml_root_to_model_root: Matrix4<f32>,
    timeouts: BTreeMap<JointType, f64>,

    recording: bool,
    /// 記録空間 → 現在のワールド空間
    playback_transform: Option<Matrix4<f32>>,
    pinch_start_scale: f32,
}

impl BodyIkController {
    pub fn new(config: EngineConfig, session: Rc<dyn ArSession>) -> Self {
        let timeouts = JointType::ALL
            .iter()
            .map(|joint| (*joint, config.joint_timeout_ms(*joint)))
            .collect();
        Self {
            calibration: CalibrationState::new(&config),
            clock: Box::new(SystemClock::new()),
            sampler: Box::new(XorShiftSampler::default()),
            recorder: Box::new(JsonRecorder::new()),
            delegate: None,
            model: None,
            binding: None,
            store: JointStore::new(),
            offsets: RootOffsetCache::new(JointType::ROOT),
            dampened: JointPositions::new(),
            state: TrackedState::NotAvailable,
            bone_lengths: BoneLengthTable::new(),
            user_torso_height: 0.0,
            ml_root_to_model_root: Matrix4::identity(),
            timeouts,
            recording: false,
            playback_transform: None,
            pinch_start_scale: 1.0,
            config,
            session,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sampler(mut self, sampler: Box<dyn ScreenSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn AnimRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn set_delegate<D: BodyIkDelegate + 'static>(&mut self, delegate: &Rc<D>) {
        let delegate: Rc<dyn BodyIkDelegate> = delegate.clone();
        self.delegate = Some(Rc::downgrade(&delegate));
    }

    fn delegate(&self) -> Option<Rc<dyn BodyIkDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn model(&self) -> Option<Rc<RefCell<dyn ModelNode>>> {
        self.model.as_ref().and_then(Weak::upgrade)
    }

    // --- 状態の参照 ---

    pub fn tracked_state(&self) -> TrackedState {
        self.state
    }

    pub fn calibration_state(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn joint_store(&self) -> &JointStore {
        &self.store
    }

    /// 直近にリグへ渡した関節位置
    pub fn dampened_joints(&self) -> &JointPositions {
        &self.dampened
    }

    pub fn bone_lengths(&self) -> &BoneLengthTable {
        &self.bone_lengths
    }

    pub fn user_torso_height(&self) -> f32 {
        self.user_torso_height
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    // --- バインド ---

    /// モデルをバインドする
    ///
    /// スケルトンがない、または必須ボーンが欠けていればエラーを返し、
    /// コントローラの状態は変えない。
    pub fn bind_model<M: ModelNode + 'static>(&mut self, model: &Rc<RefCell<M>>) -> Result<(), BindError> {
        let binding = match ModelBinding::from_model(&mut *model.borrow_mut()) {
            Ok(binding) => binding,
            Err(e) => {
                tracing::error!(error = %e, "failed to bind model");
                return Err(e);
            }
        };
        tracing::info!(
            effectors = binding.effectors.len(),
            torso_height = binding.model_torso_height,
            "model bound"
        );

        let node: Rc<RefCell<dyn ModelNode>> = model.clone();
        self.model = Some(Rc::downgrade(&node));
        self.binding = Some(binding);
        self.store.clear();
        self.offsets.clear();
        self.dampened.clear();
        self.bone_lengths.clear();
        self.playback_transform = None;
        Ok(())
    }

    // --- キャリブレーション ---

    /// キャリブレーション開始
    ///
    /// モデルを画面外の初期位置・単位スケールに戻し、全ボーンを初期姿勢にする。
    /// manual ならタップで確定するまで待つ。
    pub fn start_calibration(&mut self, manual: bool) {
        if self.calibration.is_calibrating() {
            return;
        }
        let Some(model) = self.model() else {
            tracing::warn!("cannot start calibration: no model bound");
            return;
        };
        let mut node = model.borrow_mut();
        if node.skeleton().is_none() {
            tracing::warn!("cannot start calibration: model has no skeleton");
            return;
        }

        let initial = Vector3::from(self.config.initial_model_position);
        self.calibration.begin(manual, initial);
        self.bone_lengths.clear();
        self.user_torso_height = 0.0;
        self.playback_transform = None;

        if manual {
            node.add_billboard_constraint();
            node.set_calibration_capture(true);
        }
        node.detach_ik_rig();
        reset_model_pose(&mut *node, initial);
        tracing::info!(manual, "calibration started");
    }

    /// 次の関節処理で確定するよう予約する
    pub fn finish_calibration(&mut self, manual: bool) {
        if !self.calibration.is_calibrating() {
            return;
        }
        if manual {
            if let Some(model) = self.model() {
                model.borrow_mut().set_calibration_capture(false);
            }
        }
        self.calibration.request_finalize();
        tracing::debug!(manual, "calibration finish requested");
    }

    /// キャリブレーション結果をモデルに反映して確定する
    pub fn calibrate_rig_with_results(&mut self) {
        let Some(model) = self.model() else {
            tracing::warn!("cannot finish calibration: no model bound");
            return;
        };
        let Some(effectors) = self.binding.as_ref().map(|b| b.effectors.clone()) else {
            return;
        };
        if model.borrow().skeleton().is_none() {
            tracing::warn!("cannot finish calibration: model has no skeleton");
            return;
        }
        if !self.calibration.is_calibrating() {
            return;
        }

        {
            let mut node = model.borrow_mut();
            node.remove_all_constraints();
            node.set_calibration_capture(false);
            self.calibrate_torso_scale(&mut *node);
            self.calibrate_bone_proportionality(&mut *node);
            node.attach_ik_rig(&effectors);
        }
        self.calibration.complete();
        self.calibrate_ml_to_model_root_offset();
        self.align_model_root_to_ml_root();
        let scale = model.borrow().scale().x;
        tracing::info!(torso_height = self.user_torso_height, scale, "calibration finished");

        if let Some(delegate) = self.delegate() {
            delegate.on_calibration_finished();
        }
    }

    /// 胴体長の比でモデルを一様スケールする
    ///
    /// 腰が見えていなければ平均的な胴体長を使う。
    fn calibrate_torso_scale(&mut self, node: &mut dyn ModelNode) {
        if !self.config.automatic_resizing {
            return;
        }
        let Some(model_height) = self.binding.as_ref().map(|b| b.model_torso_height) else {
            return;
        };
        let measured = match (
            self.dampened.get(&JointType::Neck),
            self.dampened.get(&JointType::LeftHip),
            self.dampened.get(&JointType::RightHip),
        ) {
            (Some(neck), Some(left), Some(right)) => Some(retarget::torso_height(neck, left, right)),
            _ => None,
        };
        self.user_torso_height = match measured {
            Some(h) => h,
            None => {
                tracing::debug!("hips not tracked, using average torso height");
                self.config.average_torso_height_m
            }
        };
        if model_height < self.config.min_bone_length_m {
            tracing::warn!(model_height, "model torso is degenerate, skipping resize");
            return;
        }

        let ratio = retarget::uniform_scale_ratio(self.user_torso_height, model_height, self.config.automatic_sizing_ratio);
        node.set_scale(Vector3::repeat(ratio));
        node.compute_transforms();
    }

    /// ボーンごとの長さ比でスケルトンを伸縮する
    ///
    /// Top ボーンの復元は設定に関わらず行う。モデル側の長さが未計測なら
    /// 現在の関節とスケルトンから計測してから適用する。
    fn calibrate_bone_proportionality(&mut self, node: &mut dyn ModelNode) {
        let skinner = node.skinner_world_transform();
        {
            let Some(skeleton) = node.skeleton_mut() else {
                return;
            };
            if retarget::restore_top_bone_transform(skeleton, &skinner) {
                tracing::debug!("restored Top bone world transform");
            }
            if !self.config.calculate_bone_proportionality {
                return;
            }

            let tree_tracked = tree::members().all(|joint| self.store.contains(joint));
            if !tree_tracked && !self.bone_lengths.has_model_lengths() {
                tracing::warn!("tracking with limited joints, skipping bone proportionality");
                return;
            }

            if !self.bone_lengths.has_model_lengths() {
                let model_positions: JointPositions = JointType::tagged()
                    .filter_map(|joint| {
                        let m = skeleton.world_transform_by_name(joint.bone_tag()?)?;
                        Some((joint, translation_of(&m)))
                    })
                    .collect();
                retarget::known_bone_sizes(&mut self.bone_lengths, &self.dampened, &model_positions);

                let spine = skeleton.world_transform_by_name(&self.config.spine_bone);
                let hips = skeleton.world_transform_by_name(&self.config.hips_bone);
                match (spine, hips) {
                    (Some(spine), Some(hips)) => {
                        if let Err(e) = retarget::inferred_bone_sizes(
                            &mut self.bone_lengths,
                            &self.dampened,
                            &model_positions,
                            &translation_of(&spine),
                            &translation_of(&hips),
                            &self.config.spine_bone,
                        ) {
                            tracing::warn!(error = %e, "could not infer torso bone sizes");
                        }
                    }
                    _ => tracing::warn!(
                        spine = %self.config.spine_bone,
                        hips = %self.config.hips_bone,
                        "torso bones not found in skeleton"
                    ),
                }
            }

            let plan = retarget::bone_scale_plan(&self.config.spine_bone, &self.config.hips_bone);
            let applied = retarget::apply_bone_scales(skeleton, &self.bone_lengths, &plan, self.config.min_bone_length_m);
            tracing::debug!(applied, "bone proportionality applied");
        }
        node.compute_transforms();
    }

    // --- 1フレームの処理 ---

    /// 姿勢推定器の1フレーム分の出力を処理する
    pub fn on_body_joints_found(&mut self, frame: &PoseFrame) {
        if self.model().is_none() {
            return;
        }
        let now = self.clock.now_ms();
        let joints = frame
            .detections()
            .map(|(joint, keypoint)| TrackedJoint::new(joint, keypoint, now))
            .collect();
        self.process_joints(joints, now);

        if self.state != TrackedState::NotAvailable && self.calibration.should_finalize() {
            self.calibrate_rig_with_results();
        }
        if !self.calibration.is_calibrating() {
            self.update_model();
        }
        self.notify_joint_update();
    }

    fn process_joints(&mut self, mut joints: Vec<TrackedJoint>, now_ms: f64) {
        self.project_joints_into_3d(&mut joints);
        self.store.replace(joints);

        let timeouts = &self.timeouts;
        let default_timeout = self.config.default_joint_timeout_ms;
        let expired = self
            .store
            .expired(now_ms, |joint| timeouts.get(&joint).copied().unwrap_or(default_timeout));
        self.restore_missing_joints(expired);

        let expected = self
            .binding
            .as_ref()
            .map_or_else(|| JointType::tagged().count(), |b| b.effectors.len());
        let state = self.store.classify(expected);
        self.set_tracked_state(state);

        self.dampened = self
            .store
            .iter()
            .filter_map(|joint| Some((joint.joint_type, joint.world_position()?)))
            .collect();
    }

    /// 参照平面を更新し、各関節をその平面へ投影する
    ///
    /// ルート関節がないフレームは投影しない（全関節が捨てられる）。
    fn project_joints_into_3d(&mut self, joints: &mut Vec<TrackedJoint>) {
        if !joints.iter().any(|j| j.joint_type == JointType::ROOT) {
            return;
        }
        let camera = self.session.camera();
        let auto_finish = self.calibration.is_calibrating() && !self.calibration.is_manual();

        match self.config.depth_mode {
            DepthMode::ConstantDistance => {
                let plane = constant_distance_plane(&camera, self.config.preset_depth_distance_m);
                self.calibration.set_plane(plane);
                if auto_finish {
                    self.calibration.request_finalize();
                }
            }
            DepthMode::TorsoClustered => {
                let Some(center) =
                    torso_clustered_depth(self.session.as_ref(), &joints[..], self.sampler.as_mut(), &self.config)
                else {
                    joints.clear();
                    return;
                };
                let update = self.calibration.candidates.push(&camera.position, center);
                if update.accepted {
                    self.calibration
                        .set_plane(DepthPlane::facing_camera(&camera.position, center));
                }
                if update.converged && auto_finish {
                    tracing::debug!("depth plane converged");
                    self.calibration.request_finalize();
                }
            }
        }

        if self.calibration.is_calibrating() || self.calibration.has_valid_plane() {
            project_joints(&camera, self.calibration.plane(), joints.as_mut_slice());
        }
    }

    /// 期限内に見失った関節をルートからの相対変換で戻し、相対変換を更新する
    pub fn restore_missing_joints(&mut self, expired: Vec<TrackedJoint>) {
        if self.calibration.is_calibrating() || !self.store.contains(JointType::ROOT) {
            return;
        }
        let recovered = self.offsets.recover(&mut self.store, expired);
        if recovered > 0 {
            tracing::debug!(recovered, "restored missing joints");
        }
        self.offsets.recompute(&self.store);
    }

    fn set_tracked_state(&mut self, state: TrackedState) {
        if state == self.state {
            return;
        }
        tracing::info!(from = ?self.state, to = ?state, "tracked state changed");
        self.state = state;
        if let Some(delegate) = self.delegate() {
            delegate.on_body_track_state_update(state);
        }
    }

    // --- ルート追従 ---

    /// 推定側の両腰中点
    fn ml_root_position(&self) -> Option<Vector3<f32>> {
        let left = self.dampened.get(&JointType::LeftHip)?;
        let right = self.dampened.get(&JointType::RightHip)?;
        Some(retarget::mid_point(left, right))
    }

    /// モデルの両腰中点からモデル原点への変換を記録する
    pub fn calibrate_ml_to_model_root_offset(&mut self) {
        let Some(model) = self.model() else {
            tracing::warn!("cannot compute root offset: no model bound");
            return;
        };
        let Some((left, right)) = self
            .binding
            .as_ref()
            .and_then(|b| Some((b.bone(JointType::LeftHip)?, b.bone(JointType::RightHip)?)))
        else {
            return;
        };

        let mut node = model.borrow_mut();
        node.compute_transforms();
        let Some(skeleton) = node.skeleton() else {
            return;
        };
        let mid = retarget::mid_point(
            &translation_of(&skeleton.bone_world_transform(left)),
            &translation_of(&skeleton.bone_world_transform(right)),
        );
        let root = translation_of(&node.world_transform());
        self.ml_root_to_model_root = translation(&-mid) * translation(&root);
    }

    /// 推定側の腰中点に記録済みオフセットを掛けてモデル原点を動かす
    ///
    /// スケールは変えない。
    pub fn align_model_root_to_ml_root(&mut self) {
        let Some(model) = self.model() else {
            return;
        };
        let Some(root) = self.ml_root_position() else {
            return;
        };
        let m = translation(&root) * self.ml_root_to_model_root;
        model
            .borrow_mut()
            .set_world_transform(translation_of(&m), rotation_of(&m));
    }

    /// ルートを合わせ、全関節をIKエフェクタ目標として渡す
    pub fn update_model(&mut self) {
        if self.state == TrackedState::NotAvailable {
            return;
        }
        let Some(model) = self.model() else {
            return;
        };
        if model.borrow_mut().ik_rig_mut().is_none() {
            return;
        }
        self.align_model_root_to_ml_root();
        self.push_effectors(&mut *model.borrow_mut());
    }

    fn push_effectors(&mut self, node: &mut dyn ModelNode) {
        let Some(rig) = node.ik_rig_mut() else {
            return;
        };
        let record = self.recording;
        if record {
            self.recorder.begin_row(self.clock.now_ms());
        }
        for (joint, position) in &self.dampened {
            if self.config.is_ignored(*joint) {
                continue;
            }
            let Some(tag) = joint.bone_tag() else {
                continue;
            };
            rig.set_position_for_effector(tag, *position);
            if record {
                self.recorder.add_joint(tag, position);
            }
        }
        if record {
            self.recorder.end_row();
        }
    }

    fn notify_joint_update(&self) {
        let Some(delegate) = self.delegate() else {
            return;
        };
        let filtered = self
            .store
            .iter()
            .filter_map(|joint| {
                let pos = JointPos {
                    world_position: joint.world_position()?,
                    screen_x: joint.screen.x,
                    screen_y: joint.screen.y,
                };
                Some((joint.joint_type, pos))
            })
            .collect();

        let mut model_joints = BTreeMap::new();
        if let (Some(model), Some(binding)) = (self.model(), self.binding.as_ref()) {
            let node = model.borrow();
            if let Some(skeleton) = node.skeleton() {
                model_joints = binding
                    .joint_bones
                    .iter()
                    .map(|(joint, index)| (*joint, skeleton.bone_world_transform(*index)))
                    .collect();
            }
        }

        let update = JointUpdate {
            filtered,
            dampened: self.dampened.clone(),
            model: model_joints,
        };
        delegate.on_joint_update(&update);
    }

    // --- 手動キャリブレーションの操作 ---

    /// タップで手動キャリブレーションを確定する
    pub fn on_calibration_tap(&mut self) {
        if self.calibration.is_calibrating() && self.calibration.is_manual() {
            self.finish_calibration(true);
        }
    }

    /// ピンチでモデルを一様に拡大縮小する（開始時のスケール基準）
    pub fn on_calibration_pinch(&mut self, factor: f32, state: PinchState) {
        if !self.calibration.is_calibrating() {
            return;
        }
        let Some(model) = self.model() else {
            return;
        };
        let mut node = model.borrow_mut();
        match state {
            PinchState::Start => self.pinch_start_scale = node.scale().x,
            PinchState::Move | PinchState::End => {
                node.set_scale(Vector3::repeat(self.pinch_start_scale * factor));
                node.compute_transforms();
            }
        }
    }

    // --- 関節ごとのタイムアウト ---

    pub fn set_staleness_threshold(&mut self, joint: JointType, ms: f64) {
        self.timeouts.insert(joint, ms);
    }

    pub fn staleness_threshold(&self, joint: JointType) -> f64 {
        self.timeouts
            .get(&joint)
            .copied()
            .unwrap_or(self.config.default_joint_timeout_ms)
    }

    // --- 記録と再生 ---

    /// 現在のモデル原点を基準に記録を始める
    pub fn start_recording(&mut self) {
        let Some(model) = self.model() else {
            tracing::warn!("cannot start recording: no model bound");
            return;
        };
        let start = model.borrow().world_transform();
        self.recorder
            .start_recording(&start, &self.bone_lengths.ml, self.clock.now_ms());
        self.recording = true;
        tracing::info!("recording started");
    }

    /// 記録を終えて JSON を返す
    pub fn stop_recording(&mut self) -> anyhow::Result<String> {
        self.recording = false;
        self.recorder.stop_recording()
    }

    /// 記録の再生準備
    ///
    /// リグがなければ記録のボーン長から作る。記録空間から現在のワールド空間への
    /// 変換を求めて保持する。
    pub fn on_body_playback_starting(&mut self, data: &BodyAnimData) {
        let Some(model) = self.model() else {
            tracing::warn!("cannot start playback: no model bound");
            return;
        };
        let Some(effectors) = self.binding.as_ref().map(|b| b.effectors.clone()) else {
            return;
        };

        let has_rig = model.borrow_mut().ik_rig_mut().is_some();
        if !has_rig {
            self.bone_lengths.ml = data.bone_lengths.clone();
            let mut node = model.borrow_mut();
            self.calibrate_bone_proportionality(&mut *node);
            node.attach_ik_rig(&effectors);
        }

        self.set_tracked_state(TrackedState::FullEffectors);
        self.calibrate_ml_to_model_root_offset();

        let root_start = model.borrow().world_transform();
        let data_start_inv = match data.start_world_matrix().try_inverse() {
            Some(m) => m,
            None => {
                tracing::warn!("recording start matrix is not invertible, using identity");
                Matrix4::identity()
            }
        };
        self.playback_transform = Some(root_start * data_start_inv);
        tracing::info!(rows = data.rows.len(), "playback starting");
    }

    /// 記録済みの関節位置を現在のワールド空間に移してリグへ渡す
    pub fn on_body_joints_playback(&mut self, joints: &BTreeMap<JointType, Vector3<f32>>) {
        let Some(transform) = self.playback_transform else {
            tracing::warn!("playback has not been started");
            return;
        };
        let Some(model) = self.model() else {
            return;
        };
        self.dampened = joints
            .iter()
            .map(|(joint, p)| (*joint, translation_of(&(transform * translation(p)))))
            .collect();
        self.align_model_root_to_ml_root();
        self.push_effectors(&mut *model.borrow_mut());
    }

    // --- キャリブレーション結果の保存と復元 ---

    /// 確定済みのキャリブレーション結果
    pub fn calibrated_body(&self) -> Option<CalibratedBody> {
        if self.calibration.phase() != CalibrationPhase::Finalized {
            return None;
        }
        let model = self.model()?;
        let model_scale = model.borrow().scale().x;
        let plane = self.calibration.plane();
        Some(CalibratedBody {
            torso_height_m: self.user_torso_height,
            model_scale,
            plane_position: [plane.position.x, plane.position.y, plane.position.z],
            plane_normal: [plane.normal.x, plane.normal.y, plane.normal.z],
            bone_lengths: self.bone_lengths.clone(),
        })
    }

    /// 保存済みの結果をバインド済みモデルに適用し、キャリブレーションなしで追跡を始める
    pub fn apply_calibrated_body(&mut self, body: &CalibratedBody) {
        let Some(model) = self.model() else {
            tracing::warn!("cannot apply calibrated body: no model bound");
            return;
        };
        let Some(effectors) = self.binding.as_ref().map(|b| b.effectors.clone()) else {
            return;
        };
        if self.calibration.is_calibrating() {
            tracing::warn!("calibration in progress, ignoring calibrated body");
            return;
        }
        if model.borrow().skeleton().is_none() {
            tracing::warn!("cannot apply calibrated body: model has no skeleton");
            return;
        }

        self.bone_lengths = body.bone_lengths.clone();
        self.user_torso_height = body.torso_height_m;
        self.calibration.restore(body.plane());
        {
            let mut node = model.borrow_mut();
            reset_model_pose(&mut *node, Vector3::from(self.config.initial_model_position));
            node.set_scale(Vector3::repeat(body.model_scale));
            node.compute_transforms();
            self.calibrate_bone_proportionality(&mut *node);
            node.attach_ik_rig(&effectors);
        }
        self.calibrate_ml_to_model_root_offset();
        tracing::info!(scale = body.model_scale, "calibrated body applied");

        if let Some(delegate) = self.delegate() {
            delegate.on_calibration_finished();
        }
    }
}
