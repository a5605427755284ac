//! 関節位置の記録と再生
//!
//! 記録形式（JSON）:
//! - `start_matrix`: 記録開始時のモデルルートのワールド変換（列優先16要素）
//! - `bone_lengths`: 推定側のボーン長
//! - `rows`: `{ timestamp_ms, joints: { ボーン名: [x, y, z] } }` の列

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::pose::JointType;

/// 記録の受け口
pub trait AnimRecorder {
    fn start_recording(&mut self, start_world: &Matrix4<f32>, bone_lengths: &BTreeMap<String, f32>, now_ms: f64);
    fn begin_row(&mut self, now_ms: f64);
    fn add_joint(&mut self, bone_name: &str, position: &Vector3<f32>);
    fn end_row(&mut self);
    /// 記録を終えてシリアライズ結果を返す
    fn stop_recording(&mut self) -> Result<String>;
    fn is_recording(&self) -> bool;
}

/// 1行分（1フレーム分）の関節位置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimRow {
    /// 記録開始からの経過時間
    pub timestamp_ms: f64,
    pub joints: BTreeMap<String, [f32; 3]>,
}

impl AnimRow {
    /// ボーン名を関節に戻す（不明な名前は捨てる）
    pub fn joint_positions(&self) -> BTreeMap<JointType, Vector3<f32>> {
        self.joints
            .iter()
            .filter_map(|(name, p)| JointType::from_bone_tag(name).map(|j| (j, Vector3::from(*p))))
            .collect()
    }
}

/// 記録済みセッション
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyAnimData {
    pub start_matrix: [f32; 16],
    #[serde(default)]
    pub bone_lengths: BTreeMap<String, f32>,
    #[serde(default)]
    pub rows: Vec<AnimRow>,
}

impl BodyAnimData {
    pub fn new(start_world: &Matrix4<f32>, bone_lengths: BTreeMap<String, f32>) -> Self {
        let mut start_matrix = [0.0; 16];
        start_matrix.copy_from_slice(start_world.as_slice());
        Self {
            start_matrix,
            bone_lengths,
            rows: Vec::new(),
        }
    }

    /// 記録開始時のモデルルートのワールド変換
    pub fn start_world_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_column_slice(&self.start_matrix)
    }

    pub fn duration_ms(&self) -> f64 {
        self.rows.last().map_or(0.0, |r| r.timestamp_ms)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize recording")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse recording")
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?).context("Failed to write recording file")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read recording file")?;
        Self::from_json(&content)
    }
}

/// メモリ上に行を溜めて JSON を返すレコーダ
#[derive(Debug, Default)]
pub struct JsonRecorder {
    data: Option<BodyAnimData>,
    start_ms: f64,
    row: Option<AnimRow>,
}

impl JsonRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnimRecorder for JsonRecorder {
    fn start_recording(&mut self, start_world: &Matrix4<f32>, bone_lengths: &BTreeMap<String, f32>, now_ms: f64) {
        self.data = Some(BodyAnimData::new(start_world, bone_lengths.clone()));
        self.start_ms = now_ms;
        self.row = None;
    }

    fn begin_row(&mut self, now_ms: f64) {
        if self.data.is_some() {
            self.row = Some(AnimRow {
                timestamp_ms: now_ms - self.start_ms,
                joints: BTreeMap::new(),
            });
        }
    }

    fn add_joint(&mut self, bone_name: &str, position: &Vector3<f32>) {
        if let Some(row) = self.row.as_mut() {
            row.joints.insert(bone_name.to_string(), [position.x, position.y, position.z]);
        }
    }

    fn end_row(&mut self) {
        if let (Some(data), Some(row)) = (self.data.as_mut(), self.row.take()) {
            data.rows.push(row);
        }
    }

    fn stop_recording(&mut self) -> Result<String> {
        self.row = None;
        let Some(data) = self.data.take() else {
            bail!("Recorder was not started");
        };
        data.to_json()
    }

    fn is_recording(&self) -> bool {
        self.data.is_some()
    }
}

/// 記録済みの行を順に取り出す
#[derive(Debug, Clone)]
pub struct BodyPlayer {
    data: BodyAnimData,
    cursor: usize,
}

impl BodyPlayer {
    pub fn new(data: BodyAnimData) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn data(&self) -> &BodyAnimData {
        &self.data
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.data.rows.len()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// 次の行
    pub fn next_row(&mut self) -> Option<BTreeMap<JointType, Vector3<f32>>> {
        let row = self.data.rows.get(self.cursor)?;
        self.cursor += 1;
        Some(row.joint_positions())
    }

    /// 経過時間 `elapsed_ms` までに到達した最新の行（途中の行は飛ばす）
    pub fn advance_to(&mut self, elapsed_ms: f64) -> Option<BTreeMap<JointType, Vector3<f32>>> {
        let mut latest = None;
        while let Some(row) = self.data.rows.get(self.cursor) {
            if row.timestamp_ms > elapsed_ms {
                break;
            }
            latest = Some(row);
            self.cursor += 1;
        }
        latest.map(AnimRow::joint_positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::translation;

    fn record_two_rows() -> String {
        let mut recorder = JsonRecorder::new();
        let start = translation(&Vector3::new(1.0, 2.0, 3.0));
        let mut lengths = BTreeMap::new();
        lengths.insert("LeftKnee".to_string(), 0.4);
        recorder.start_recording(&start, &lengths, 1000.0);
        assert!(recorder.is_recording());

        recorder.begin_row(1000.0);
        recorder.add_joint("Neck", &Vector3::new(0.0, 1.5, -1.0));
        recorder.add_joint("LeftHip", &Vector3::new(0.1, 1.0, -1.0));
        recorder.end_row();
        recorder.begin_row(1033.0);
        recorder.add_joint("Neck", &Vector3::new(0.1, 1.5, -1.0));
        recorder.end_row();
        recorder.stop_recording().unwrap()
    }

    #[test]
    fn test_json_recorder_format() {
        let json = record_two_rows();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["start_matrix"].as_array().unwrap().len(), 16);
        // 列優先なので並進は 12..15
        assert_eq!(value["start_matrix"][12], 1.0);
        assert_eq!(value["rows"][1]["timestamp_ms"], 33.0);
        assert_eq!(value["rows"][0]["joints"]["LeftHip"][1], 1.0);
    }

    #[test]
    fn test_anim_data_parses_recording() {
        let data = BodyAnimData::from_json(&record_two_rows()).unwrap();
        assert_eq!(data.start_world_matrix(), translation(&Vector3::new(1.0, 2.0, 3.0)));
        assert_eq!(data.bone_lengths["LeftKnee"], 0.4);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.duration_ms(), 33.0);
        let joints = data.rows[0].joint_positions();
        assert_eq!(joints[&JointType::LeftHip], Vector3::new(0.1, 1.0, -1.0));
    }

    #[test]
    fn test_stop_without_start_fails() {
        let mut recorder = JsonRecorder::new();
        recorder.begin_row(0.0);
        recorder.add_joint("Neck", &Vector3::zeros());
        recorder.end_row();
        assert!(recorder.stop_recording().is_err());
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_unknown_bone_names_dropped() {
        let mut row = AnimRow::default();
        row.joints.insert("Tail".to_string(), [0.0, 0.0, 0.0]);
        row.joints.insert("Top".to_string(), [0.0, 1.8, 0.0]);
        let joints = row.joint_positions();
        assert_eq!(joints.len(), 1);
        assert!(joints.contains_key(&JointType::Top));
    }

    #[test]
    fn test_player_steps_rows() {
        let data = BodyAnimData::from_json(&record_two_rows()).unwrap();
        let mut player = BodyPlayer::new(data);
        assert_eq!(player.next_row().unwrap().len(), 2);
        assert_eq!(player.next_row().unwrap().len(), 1);
        assert!(player.next_row().is_none());
        assert!(player.is_finished());
        player.rewind();
        assert!(!player.is_finished());
    }

    #[test]
    fn test_player_advance_to_skips_rows() {
        let data = BodyAnimData::from_json(&record_two_rows()).unwrap();
        let mut player = BodyPlayer::new(data);
        assert!(player.advance_to(-1.0).is_none());
        let latest = player.advance_to(100.0).unwrap();
        assert_eq!(latest[&JointType::Neck], Vector3::new(0.1, 1.5, -1.0));
        assert!(player.is_finished());
        assert!(player.advance_to(200.0).is_none());
    }

    #[test]
    fn test_save_load_recording() {
        let data = BodyAnimData::from_json(&record_two_rows()).unwrap();
        let path = std::env::temp_dir().join(format!("talava_rig_rec_{}.json", std::process::id()));
        data.save(&path).unwrap();
        let loaded = BodyAnimData::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, data);
    }
}
