pub mod user;
pub mod verification_challenge;

pub use user::User;
pub use verification_challenge::{ChallengeState, Purpose, VerificationChallenge};
