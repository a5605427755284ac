use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::pose::JointType;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// 奥行き参照平面の決め方
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DepthMode {
    /// カメラ前方の固定距離
    #[default]
    ConstantDistance,
    /// 胴体領域の特徴点クラスタ
    TorsoClustered,
}

/// エンジンの動作設定（構築時に渡し、以後変更しない）
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// 胴体長に合わせてモデルを自動スケール
    #[serde(default = "default_true")]
    pub automatic_resizing: bool,
    /// 自動スケールに掛ける全体係数
    #[serde(default = "default_one")]
    pub automatic_sizing_ratio: f32,
    #[serde(default)]
    pub depth_mode: DepthMode,
    /// ConstantDistance モードでのカメラからの距離（メートル）
    #[serde(default = "default_one")]
    pub preset_depth_distance_m: f32,
    /// ボーンごとの比率スケーリング
    #[serde(default)]
    pub calculate_bone_proportionality: bool,
    /// キャリブレーション中にモデルを退避させる位置
    #[serde(default = "default_initial_model_position")]
    pub initial_model_position: [f32; 3],
    /// 腰が見つからないときに使う胴体長
    #[serde(default = "default_average_torso_height")]
    pub average_torso_height_m: f32,

    // --- 特徴点クラスタ ---
    #[serde(default = "default_cluster_sample_count")]
    pub cluster_sample_count: usize,
    /// これを超えるヒット数が必要
    #[serde(default = "default_cluster_min_hits")]
    pub cluster_min_hits: usize,
    /// 中央値からこれ以上離れた点は外れ値
    #[serde(default = "default_cluster_outlier")]
    pub cluster_outlier_m: f32,
    /// 各サンプル点を中心と四隅の5点で測って平均する
    #[serde(default)]
    pub cluster_window_taps: bool,

    // --- 平面候補の履歴 ---
    #[serde(default = "default_plane_history_len")]
    pub plane_history_len: usize,
    #[serde(default = "default_plane_debounce_window")]
    pub plane_debounce_window: usize,
    #[serde(default = "default_plane_debounce_min_agree")]
    pub plane_debounce_min_agree: usize,
    #[serde(default = "default_plane_converge_min_agree")]
    pub plane_converge_min_agree: usize,
    #[serde(default = "default_plane_agreement")]
    pub plane_agreement_m: f32,

    /// これより短いモデル側ボーンは比率計算から外す
    #[serde(default = "default_min_bone_length")]
    pub min_bone_length_m: f32,
    /// IKリグに渡さない関節
    #[serde(default = "default_ignored_joints")]
    pub ignored_joints: Vec<JointType>,
    /// 関節名 → 見失ってから復元を続ける時間（ミリ秒）
    #[serde(default = "default_joint_timeouts")]
    pub joint_timeouts_ms: BTreeMap<String, f64>,
    /// joint_timeouts_ms にない関節のタイムアウト
    #[serde(default = "default_joint_timeout")]
    pub default_joint_timeout_ms: f64,

    /// 推定器に対応点のない胴体ボーン
    #[serde(default = "default_spine_bone")]
    pub spine_bone: String,
    #[serde(default = "default_hips_bone")]
    pub hips_bone: String,
}

fn default_true() -> bool { true }
fn default_one() -> f32 { 1.0 }
fn default_initial_model_position() -> [f32; 3] { [-10.0, -10.0, 10.0] }
fn default_average_torso_height() -> f32 { 0.45 }
fn default_cluster_sample_count() -> usize { 10 }
fn default_cluster_min_hits() -> usize { 5 }
fn default_cluster_outlier() -> f32 { 0.3 }
fn default_plane_history_len() -> usize { 10 }
fn default_plane_debounce_window() -> usize { 5 }
fn default_plane_debounce_min_agree() -> usize { 3 }
fn default_plane_converge_min_agree() -> usize { 7 }
fn default_plane_agreement() -> f32 { 0.2 }
fn default_min_bone_length() -> f32 { 1e-4 }
fn default_ignored_joints() -> Vec<JointType> { vec![JointType::Thorax, JointType::Pelvis] }
fn default_joint_timeout() -> f64 { 500.0 }
fn default_spine_bone() -> String { "mixamorig:Spine2".to_string() }
fn default_hips_bone() -> String { "mixamorig:Hips".to_string() }

fn default_joint_timeouts() -> BTreeMap<String, f64> {
    let mut timeouts = BTreeMap::new();
    timeouts.insert("Top".to_string(), 500.0);
    timeouts.insert("Neck".to_string(), 800.0);
    timeouts
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            automatic_resizing: default_true(),
            automatic_sizing_ratio: default_one(),
            depth_mode: DepthMode::default(),
            preset_depth_distance_m: default_one(),
            calculate_bone_proportionality: false,
            initial_model_position: default_initial_model_position(),
            average_torso_height_m: default_average_torso_height(),
            cluster_sample_count: default_cluster_sample_count(),
            cluster_min_hits: default_cluster_min_hits(),
            cluster_outlier_m: default_cluster_outlier(),
            cluster_window_taps: false,
            plane_history_len: default_plane_history_len(),
            plane_debounce_window: default_plane_debounce_window(),
            plane_debounce_min_agree: default_plane_debounce_min_agree(),
            plane_converge_min_agree: default_plane_converge_min_agree(),
            plane_agreement_m: default_plane_agreement(),
            min_bone_length_m: default_min_bone_length(),
            ignored_joints: default_ignored_joints(),
            joint_timeouts_ms: default_joint_timeouts(),
            default_joint_timeout_ms: default_joint_timeout(),
            spine_bone: default_spine_bone(),
            hips_bone: default_hips_bone(),
        }
    }
}

impl EngineConfig {
    /// 値の範囲チェック
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("automatic_sizing_ratio", self.automatic_sizing_ratio),
            ("preset_depth_distance_m", self.preset_depth_distance_m),
            ("average_torso_height_m", self.average_torso_height_m),
            ("cluster_outlier_m", self.cluster_outlier_m),
            ("plane_agreement_m", self.plane_agreement_m),
            ("min_bone_length_m", self.min_bone_length_m),
            ("default_joint_timeout_ms", self.default_joint_timeout_ms as f32),
        ];
        for (field, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        let bounded = [
            ("cluster_min_hits", self.cluster_min_hits, self.cluster_sample_count.saturating_sub(1)),
            ("plane_debounce_window", self.plane_debounce_window, self.plane_history_len),
            ("plane_debounce_min_agree", self.plane_debounce_min_agree, self.plane_debounce_window),
            ("plane_converge_min_agree", self.plane_converge_min_agree, self.plane_history_len),
        ];
        for (field, value, max) in bounded {
            if value > max {
                return Err(ConfigError::TooLarge { field, value, max });
            }
        }

        for (name, ms) in &self.joint_timeouts_ms {
            if JointType::from_name(name).is_none() {
                return Err(ConfigError::UnknownJoint(name.clone()));
            }
            if !(*ms > 0.0) {
                return Err(ConfigError::NotPositive {
                    field: "joint_timeouts_ms",
                    value: *ms as f32,
                });
            }
        }
        Ok(())
    }

    /// 関節ごとのタイムアウト（ミリ秒）
    pub fn joint_timeout_ms(&self, joint: JointType) -> f64 {
        self.joint_timeouts_ms
            .get(joint.name())
            .copied()
            .unwrap_or(self.default_joint_timeout_ms)
    }

    pub fn is_ignored(&self, joint: JointType) -> bool {
        self.ignored_joints.contains(&joint)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.engine.validate()?;
        Ok(config)
    }

    /// ファイルがなければデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.automatic_resizing);
        assert_eq!(config.depth_mode, DepthMode::ConstantDistance);
        assert_eq!(config.joint_timeout_ms(JointType::Neck), 800.0);
        assert_eq!(config.joint_timeout_ms(JointType::Top), 500.0);
        assert_eq!(config.joint_timeout_ms(JointType::LeftKnee), 500.0);
        assert!(config.is_ignored(JointType::Pelvis));
        assert!(!config.is_ignored(JointType::Neck));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            depth_mode = "torso_clustered"
            automatic_sizing_ratio = 1.2
            ignored_joints = ["Thorax"]
            cluster_window_taps = true

            [engine.joint_timeouts_ms]
            LeftWrist = 300.0
            "#,
        )
        .unwrap();
        let engine = config.engine;
        assert_eq!(engine.depth_mode, DepthMode::TorsoClustered);
        assert_eq!(engine.automatic_sizing_ratio, 1.2);
        assert_eq!(engine.ignored_joints, vec![JointType::Thorax]);
        assert!(engine.cluster_window_taps);
        assert_eq!(engine.joint_timeout_ms(JointType::LeftWrist), 300.0);
        // 省略された項目はデフォルト
        assert_eq!(engine.cluster_sample_count, 10);
        assert_eq!(engine.joint_timeout_ms(JointType::Neck), 500.0);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.plane_history_len, 10);
        assert!(!config.engine.cluster_window_taps);
    }

    #[test]
    fn test_validate_rejects_non_positive() {
        let config = EngineConfig {
            preset_depth_distance_m: 0.0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "preset_depth_distance_m",
                value: 0.0
            })
        );
    }

    #[test]
    fn test_validate_rejects_unreachable_hit_count() {
        let config = EngineConfig {
            cluster_min_hits: 10,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { field: "cluster_min_hits", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_joint() {
        let mut config = EngineConfig::default();
        config.joint_timeouts_ms.insert("Tail".to_string(), 100.0);
        assert_eq!(config.validate(), Err(ConfigError::UnknownJoint("Tail".to_string())));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/talava_rig.toml").unwrap();
        assert!(config.engine.automatic_resizing);
    }
}
