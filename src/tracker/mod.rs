pub mod body;
pub mod depth;
pub mod recovery;
pub mod retarget;
pub mod store;

use serde::{Deserialize, Serialize};

pub use body::BodyIkController;
pub use depth::{PlaneHistory, ScreenSampler, XorShiftSampler};
pub use recovery::RootOffsetCache;
pub use retarget::BoneLengthTable;
pub use store::JointStore;

/// 体がどこまで見えているか（順序付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum TrackedState {
    /// 首が見えない
    #[default]
    NotAvailable,
    /// 首はあるが腰が揃っていない
    NoScalableJointsAvailable,
    LimitedEffectors,
    FullEffectors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_state_order() {
        assert!(TrackedState::NotAvailable < TrackedState::NoScalableJointsAvailable);
        assert!(TrackedState::NoScalableJointsAvailable < TrackedState::LimitedEffectors);
        assert!(TrackedState::LimitedEffectors < TrackedState::FullEffectors);
    }
}
