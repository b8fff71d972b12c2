use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

use crate::config::Config;
use crate::error::AppError;
use crate::models::Purpose;
use crate::services::notifier::{Notifier, NotifierError};

/// SMTP で認証コードを送る通知
#[derive(Clone)]
pub struct SmtpNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    ttl_minutes: i64,
}

impl SmtpNotifier {
    /// 設定から作成
    ///
    /// SMTP設定が揃っていない場合は None を返す
    pub fn from_config(config: &Config) -> Result<Option<Self>, AppError> {
        let (Some(host), Some(username), Some(password), Some(from_address)) = (
            &config.smtp_host,
            &config.smtp_username,
            &config.smtp_password,
            &config.smtp_from_address,
        ) else {
            return Ok(None);
        };

        let credentials = Credentials::new(
            username.expose_secret().clone(),
            password.expose_secret().clone(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| {
                tracing::error!(error = ?e, smtp_host = %host, "SMTPトランスポートの初期化エラー");
                AppError::Internal(anyhow::anyhow!("smtp transport error"))
            })?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Some(Self {
            mailer,
            from_address: from_address.clone(),
            ttl_minutes: (config.otp_ttl_secs / 60).max(1),
        }))
    }

    fn subject(purpose: Purpose) -> &'static str {
        match purpose {
            Purpose::SignupVerification => "メールアドレスの確認",
            Purpose::PasswordReset => "パスワード再設定の認証コード",
        }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(
        &self,
        identity: &str,
        purpose: Purpose,
        code: &str,
    ) -> Result<(), NotifierError> {
        let from = self
            .from_address
            .parse()
            .map_err(|e| NotifierError(format!("invalid from address: {e}")))?;
        let to = identity
            .parse()
            .map_err(|e| NotifierError(format!("invalid recipient: {e}")))?;

        let body = format!(
            "認証コード: {}\n\nこのコードは{}分間有効です。",
            code, self.ttl_minutes
        );

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(Self::subject(purpose))
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| NotifierError(format!("message build error: {e}")))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| NotifierError(format!("smtp send error: {e}")))?;

        tracing::info!(identity = %identity, purpose = %purpose, "認証コードメール送信完了");

        Ok(())
    }
}
