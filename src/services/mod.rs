pub mod auth;
pub mod challenge_manager;
pub mod clock;
pub mod code;
#[cfg(feature = "email")]
pub mod email;
pub mod notifier;

pub use challenge_manager::{
    ChallengeManager, ChallengeStatus, IssuedChallenge, ResentChallenge, normalize_identity,
};
#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use code::{CodeGenerator, CodeHasher, OsRngCodeGenerator};
#[cfg(feature = "email")]
pub use email::SmtpNotifier;
pub use notifier::{LogNotifier, Notifier, NotifierError};
