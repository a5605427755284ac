//! ライブラリ全体のエラー型

use thiserror::Error;

/// モデルのバインド失敗
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// スキナー（スケルトン）を持たないモデル
    #[error("model has no skinned skeleton")]
    NoSkeleton,

    /// 必須ボーンが見つからない
    #[error("model skeleton is missing required bone `{0}`")]
    MissingBone(String),
}

/// ボーン比率計算の失敗
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetargetError {
    /// どちらかのボーン長テーブルにキーがない
    #[error("no bone length recorded for `{0}`")]
    MissingLength(String),

    /// 長さの計算に必要な関節・ボーンの位置がない
    #[error("no position available for `{0}`")]
    MissingJoint(String),

    /// モデル側のボーン長がほぼゼロ（バインドポーズが縮退している）
    #[error("model bone `{bone}` is degenerate (length {length})")]
    DegenerateBone { bone: String, length: f32 },
}

/// 設定値の検証エラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`{field}` must be positive, got {value}")]
    NotPositive { field: &'static str, value: f32 },

    #[error("`{field}` must be at most {max}, got {value}")]
    TooLarge {
        field: &'static str,
        value: usize,
        max: usize,
    },

    #[error("unknown joint name `{0}`")]
    UnknownJoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = BindError::MissingBone("RightWrist".to_string());
        assert!(err.to_string().contains("RightWrist"));
    }

    #[test]
    fn test_degenerate_bone_display() {
        let err = RetargetError::DegenerateBone {
            bone: "LeftKnee".to_string(),
            length: 0.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("LeftKnee"));
        assert!(msg.contains("degenerate"));
    }
}
