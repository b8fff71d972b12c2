//! 認証コード画面側のクライアント
//!
//! サーバーが唯一の判定者であり、ここで持つカウントダウンは表示用の写しにすぎない。

pub mod api;
pub mod countdown;
pub mod session;

pub use api::{ClientError, ErrorCode, VerificationClient};
pub use countdown::{Countdown, CountdownPhase, CountdownSnapshot, CountdownTimer};
pub use session::VerificationSession;
