pub mod staking;
pub mod transfer;

pub use staking::{RewardsClaimed, Staked, Unstaked};
pub use transfer::Transfer;
