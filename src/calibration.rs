use anyhow::{Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::EngineConfig;
use crate::projection::DepthPlane;
use crate::tracker::depth::PlaneHistory;
use crate::tracker::retarget::BoneLengthTable;

// --- 状態遷移 ---

/// キャリブレーションの段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Idle,
    /// サンプル収集中
    Calibrating,
    /// 次の関節処理で確定する
    AwaitingFinalization,
    Finalized,
}

/// キャリブレーションの進行状態と奥行き参照平面
#[derive(Debug, Clone)]
pub struct CalibrationState {
    calibrating: bool,
    manual: bool,
    should_finalize: bool,
    has_valid_plane: bool,
    finalized: bool,
    plane: DepthPlane,
    pub candidates: PlaneHistory,
}

impl CalibrationState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            calibrating: false,
            manual: false,
            should_finalize: false,
            has_valid_plane: false,
            finalized: false,
            plane: DepthPlane {
                position: Vector3::from(config.initial_model_position),
                normal: Vector3::zeros(),
            },
            candidates: PlaneHistory::from_config(config),
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        match (self.calibrating, self.should_finalize, self.finalized) {
            (true, true, _) => CalibrationPhase::AwaitingFinalization,
            (true, false, _) => CalibrationPhase::Calibrating,
            (false, _, true) => CalibrationPhase::Finalized,
            (false, _, false) => CalibrationPhase::Idle,
        }
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    /// タップで確定する手動キャリブレーションか
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn should_finalize(&self) -> bool {
        self.should_finalize
    }

    pub fn has_valid_plane(&self) -> bool {
        self.has_valid_plane
    }

    pub fn plane(&self) -> &DepthPlane {
        &self.plane
    }

    pub fn set_plane(&mut self, plane: DepthPlane) {
        self.plane = plane;
    }

    /// 開始。すでに実行中なら false
    pub fn begin(&mut self, manual: bool, initial_plane_position: Vector3<f32>) -> bool {
        if self.calibrating {
            return false;
        }
        self.calibrating = true;
        self.manual = manual;
        self.should_finalize = false;
        self.has_valid_plane = false;
        self.plane = DepthPlane {
            position: initial_plane_position,
            normal: Vector3::zeros(),
        };
        self.candidates.clear();
        true
    }

    /// 確定を予約する。実行中でなければ false
    pub fn request_finalize(&mut self) -> bool {
        if !self.calibrating {
            return false;
        }
        self.has_valid_plane = true;
        self.should_finalize = true;
        true
    }

    /// 確定。実行中でなければ false
    pub fn complete(&mut self) -> bool {
        if !self.calibrating {
            return false;
        }
        self.calibrating = false;
        self.should_finalize = false;
        self.finalized = true;
        true
    }

    /// 保存済みの結果から確定状態にする
    pub fn restore(&mut self, plane: DepthPlane) {
        self.calibrating = false;
        self.manual = false;
        self.should_finalize = false;
        self.has_valid_plane = true;
        self.finalized = true;
        self.plane = plane;
    }
}

// --- 保存用データ ---

/// キャリブレーション結果（再キャリブレーションなしで復元する用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedBody {
    /// ユーザーの胴体長（メートル）
    pub torso_height_m: f32,
    /// モデルに適用した一様スケール
    pub model_scale: f32,
    pub plane_position: [f32; 3],
    pub plane_normal: [f32; 3],
    pub bone_lengths: BoneLengthTable,
}

impl CalibratedBody {
    pub fn plane(&self) -> DepthPlane {
        DepthPlane {
            position: Vector3::from(self.plane_position),
            normal: Vector3::from(self.plane_normal),
        }
    }
}

// --- Save / Load ---

pub fn save_calibrated_body<P: AsRef<Path>>(path: P, body: &CalibratedBody) -> Result<()> {
    let json = serde_json::to_string_pretty(body)?;
    fs::write(path, json).context("Failed to write calibrated body file")?;
    Ok(())
}

pub fn load_calibrated_body<P: AsRef<Path>>(path: P) -> Result<CalibratedBody> {
    let content = fs::read_to_string(path).context("Failed to read calibrated body file")?;
    let body: CalibratedBody = serde_json::from_str(&content).context("Failed to parse calibrated body file")?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CalibrationState {
        CalibrationState::new(&EngineConfig::default())
    }

    #[test]
    fn test_phase_transitions() {
        let mut s = state();
        assert_eq!(s.phase(), CalibrationPhase::Idle);

        assert!(s.begin(false, Vector3::zeros()));
        assert_eq!(s.phase(), CalibrationPhase::Calibrating);
        assert!(!s.has_valid_plane());

        assert!(s.request_finalize());
        assert_eq!(s.phase(), CalibrationPhase::AwaitingFinalization);
        assert!(s.has_valid_plane());

        assert!(s.complete());
        assert_eq!(s.phase(), CalibrationPhase::Finalized);
        assert!(!s.is_calibrating());
    }

    #[test]
    fn test_begin_is_not_reentrant() {
        let mut s = state();
        assert!(s.begin(true, Vector3::zeros()));
        assert!(!s.begin(false, Vector3::zeros()));
        assert!(s.is_manual());
    }

    #[test]
    fn test_out_of_order_calls_are_noops() {
        let mut s = state();
        assert!(!s.request_finalize());
        assert!(!s.complete());
        assert_eq!(s.phase(), CalibrationPhase::Idle);
        assert!(!s.has_valid_plane());
    }

    #[test]
    fn test_begin_resets_plane() {
        let mut s = state();
        s.begin(false, Vector3::zeros());
        s.candidates.push(&Vector3::zeros(), Vector3::new(0.0, 0.0, -2.0));
        s.request_finalize();
        s.complete();

        s.begin(false, Vector3::new(-10.0, -10.0, 10.0));
        assert!(s.candidates.is_empty());
        assert!(!s.has_valid_plane());
        assert_eq!(s.plane().position, Vector3::new(-10.0, -10.0, 10.0));
        assert_eq!(s.plane().normal, Vector3::zeros());
    }

    #[test]
    fn test_save_load_calibrated_body() {
        let mut bone_lengths = BoneLengthTable::new();
        bone_lengths.insert("LeftKnee", 0.41, 0.45);
        let body = CalibratedBody {
            torso_height_m: 0.5,
            model_scale: 0.9,
            plane_position: [0.0, 1.0, -2.0],
            plane_normal: [0.0, 0.0, 1.0],
            bone_lengths,
        };
        let path = std::env::temp_dir().join(format!("talava_rig_body_{}.json", std::process::id()));
        save_calibrated_body(&path, &body).unwrap();
        let loaded = load_calibrated_body(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, body);
        assert_eq!(loaded.plane().normal, Vector3::z());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_calibrated_body("/nonexistent/body.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
