pub mod joint;
pub mod tree;

pub use joint::{JointType, Keypoint, PoseFrame, TrackedJoint};
