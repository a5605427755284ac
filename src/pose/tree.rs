//! 推定関節の親子関係
//!
//! Neck を胴体のハブとし、肩・腰から四肢が伸びる木構造。
//! IKリグ側の階層とは別物で、ボーン長の計算にだけ使う。

use super::joint::JointType;

/// 子関節の一覧
pub fn children(joint: JointType) -> &'static [JointType] {
    use JointType::*;
    match joint {
        Neck => &[Top, RightShoulder, LeftShoulder, RightHip, LeftHip],
        RightShoulder => &[RightElbow],
        RightElbow => &[RightWrist],
        LeftShoulder => &[LeftElbow],
        LeftElbow => &[LeftWrist],
        RightHip => &[RightKnee],
        RightKnee => &[RightAnkle],
        LeftHip => &[LeftKnee],
        LeftKnee => &[LeftAnkle],
        Top | RightWrist | LeftWrist | RightAnkle | LeftAnkle | Thorax | Pelvis => &[],
    }
}

/// 木に含まれる関節（Thorax / Pelvis は含まない）
pub fn members() -> impl Iterator<Item = JointType> {
    preorder(JointType::ROOT).into_iter()
}

/// (親, 子) のボーン一覧を前順（親が先）で返す
pub fn bones_preorder(root: JointType) -> Vec<(JointType, JointType)> {
    let mut out = Vec::new();
    collect_bones(root, &mut out);
    out
}

fn collect_bones(joint: JointType, out: &mut Vec<(JointType, JointType)>) {
    for &child in children(joint) {
        out.push((joint, child));
        collect_bones(child, out);
    }
}

/// 前順走査
pub fn preorder(root: JointType) -> Vec<JointType> {
    let mut out = vec![root];
    out.extend(bones_preorder(root).into_iter().map(|(_, child)| child));
    out
}
