pub mod health;
pub mod otp;
pub mod password_reset;
pub mod register;

pub use health::health_check;
pub use otp::{challenge_status, issue_challenge, resend_challenge, validate_challenge};
pub use password_reset::reset_password;
pub use register::register;
