use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::api::ErrorCode;
use crate::models::ChallengeState;
use crate::services::ChallengeStatus;

/// カウントダウンの表示フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownPhase {
    /// まだ発行していない
    Idle,
    Running,
    /// ローカルで0秒に到達、またはサーバーが期限切れと判定
    Expired,
    Verified,
}

/// 画面表示用のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownSnapshot {
    pub phase: CountdownPhase,
    pub remaining_secs: u64,
    pub resend_count: i32,
    pub max_resends: i32,
    pub resend_enabled: bool,
}

/// サーバーの有効期限を画面用に写したカウントダウン
///
/// 表示専用であり、コードが有効かどうかはサーバーの検証結果だけで決まる。
/// ローカルで0秒になっても検証リクエストは送信できる。
/// 再送回数はサーバーが返した値をそのまま保持し、クライアント側では数えない。
#[derive(Debug, Clone)]
pub struct Countdown {
    phase: CountdownPhase,
    remaining_secs: u64,
    deadline: Option<Instant>,
    resend_count: i32,
    max_resends: i32,
    limit_reached: bool,
}

impl Default for Countdown {
    fn default() -> Self {
        Self {
            phase: CountdownPhase::Idle,
            remaining_secs: 0,
            deadline: None,
            resend_count: 0,
            max_resends: 0,
            limit_reached: false,
        }
    }
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 発行成功
    pub fn on_issued(
        &mut self,
        ttl_seconds: i64,
        resend_count: i32,
        max_resends: i32,
        now: Instant,
    ) {
        self.mirror_quota(resend_count, max_resends);
        self.start(ttl_seconds, now);
    }

    /// 再送成功
    pub fn on_resent(
        &mut self,
        ttl_seconds: i64,
        resend_count: i32,
        max_resends: i32,
        now: Instant,
    ) {
        self.mirror_quota(resend_count, max_resends);
        self.start(ttl_seconds, now);
    }

    /// 1秒経過
    pub fn tick(&mut self) {
        if self.phase != CountdownPhase::Running {
            return;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.expire();
        }
    }

    /// 検証失敗
    ///
    /// 期限切れはサーバーの判定を即座に反映する。ローカルで0秒になった後に
    /// 不一致・形式不正が返った場合、サーバー側のコードはまだ有効なので
    /// ローカルの Expired は誤り。このとき true を返す（呼び出し側で状態を読み直す）。
    pub fn on_validate_error(&mut self, code: ErrorCode) -> bool {
        match code {
            ErrorCode::Expired => {
                self.expire();
                false
            }
            ErrorCode::Mismatch | ErrorCode::MalformedInput => {
                self.phase == CountdownPhase::Expired
            }
            _ => false,
        }
    }

    pub fn on_verified(&mut self) {
        self.phase = CountdownPhase::Verified;
        self.remaining_secs = 0;
        self.deadline = None;
    }

    /// サーバーが再送上限を返した
    pub fn on_resend_limit(&mut self) {
        self.limit_reached = true;
    }

    /// 期限時刻から残り秒数を計算し直す
    ///
    /// タイマーが止まっていた（バックグラウンドなど）場合でも、
    /// 経過した tick の数ではなく期限時刻を基準にする。
    pub fn resync_with_deadline(&mut self, now: Instant) {
        if self.phase != CountdownPhase::Running {
            return;
        }
        let Some(deadline) = self.deadline else {
            return;
        };
        self.remaining_secs = ceil_secs(deadline.saturating_duration_since(now));
        if self.remaining_secs == 0 {
            self.expire();
        }
    }

    /// サーバーの状態で上書きする
    pub fn resync(&mut self, status: &ChallengeStatus, now: Instant) {
        self.mirror_quota(status.resend_count, status.max_resends);
        if status.state == ChallengeState::LimitReached {
            self.limit_reached = true;
        }

        match status.state {
            ChallengeState::Issued | ChallengeState::LimitReached => {
                self.start(status.expires_in_seconds, now)
            }
            ChallengeState::Expired => self.expire(),
            ChallengeState::Consumed => self.on_verified(),
        }
    }

    /// 再送ボタンを有効にできるか
    pub fn can_resend(&self) -> bool {
        self.phase == CountdownPhase::Expired && !self.limit_reached
    }

    pub fn phase(&self) -> CountdownPhase {
        self.phase
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn snapshot(&self) -> CountdownSnapshot {
        CountdownSnapshot {
            phase: self.phase,
            remaining_secs: self.remaining_secs,
            resend_count: self.resend_count,
            max_resends: self.max_resends,
            resend_enabled: self.can_resend(),
        }
    }

    fn start(&mut self, ttl_seconds: i64, now: Instant) {
        let secs = u64::try_from(ttl_seconds).unwrap_or(0);
        if secs == 0 {
            self.expire();
            return;
        }
        self.phase = CountdownPhase::Running;
        self.remaining_secs = secs;
        self.deadline = Some(now + Duration::from_secs(secs));
    }

    fn expire(&mut self) {
        self.phase = CountdownPhase::Expired;
        self.remaining_secs = 0;
        self.deadline = None;
    }

    fn mirror_quota(&mut self, resend_count: i32, max_resends: i32) {
        self.resend_count = resend_count;
        self.max_resends = max_resends;
        self.limit_reached = resend_count >= max_resends;
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// 共有カウントダウンを一定間隔で tick するタスク
///
/// スナップショットは watch チャネルで配信する。
/// `cancel` を呼ぶか drop した時点でタスクは停止する。
pub struct CountdownTimer {
    countdown: Arc<Mutex<Countdown>>,
    sender: watch::Sender<CountdownSnapshot>,
    handle: JoinHandle<()>,
}

impl CountdownTimer {
    /// tokio ランタイム上で呼ぶこと
    pub fn start(countdown: Countdown, period: Duration) -> Self {
        let (sender, _) = watch::channel(countdown.snapshot());
        let countdown = Arc::new(Mutex::new(countdown));

        let handle = tokio::spawn({
            let countdown = countdown.clone();
            let sender = sender.clone();
            async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let snapshot = {
                        let mut countdown = countdown.lock().await;
                        countdown.tick();
                        countdown.snapshot()
                    };
                    sender.send_replace(snapshot);
                }
            }
        });

        Self {
            countdown,
            sender,
            handle,
        }
    }

    /// カウントダウンを更新して配信
    pub async fn update<F>(&self, f: F) -> CountdownSnapshot
    where
        F: FnOnce(&mut Countdown),
    {
        let snapshot = {
            let mut countdown = self.countdown.lock().await;
            f(&mut countdown);
            countdown.snapshot()
        };
        self.sender.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn snapshot(&self) -> CountdownSnapshot {
        self.countdown.lock().await.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CountdownSnapshot> {
        self.sender.subscribe()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
