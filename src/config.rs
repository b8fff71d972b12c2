use secrecy::SecretBox;
use serde::Deserialize;
use thiserror::Error;
use time::Duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] envy::Error),

    #[error("{name} {reason}")]
    Invalid {
        name: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// 未設定ならインメモリストアで起動する（開発用）
    #[serde(default)]
    pub database_url: Option<SecretBox<String>>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // OTP設定
    /// 認証コードの有効期間（秒）
    #[serde(default = "default_otp_ttl_secs")]
    pub otp_ttl_secs: i64,
    /// 1回の認証フローで許可される再送回数
    #[serde(default = "default_otp_max_resends")]
    pub otp_max_resends: i32,
    /// 認証コードの桁数
    #[serde(default = "default_otp_code_length")]
    pub otp_code_length: usize,
    /// 認証コードHMAC用キー（Base64エンコード、32バイト）
    pub otp_hash_key: SecretBox<String>,

    // SMTP設定（オプション - email機能有効時のみ使用）
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<SecretBox<String>>,
    pub smtp_password: Option<SecretBox<String>>,
    #[serde(default)]
    pub smtp_from_address: Option<String>,

    // CORS設定
    /// フロントエンドのオリジン（未設定ならCORSレイヤーを付けない）
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_OTP_TTL_SECS: i64 = 120;
const DEFAULT_OTP_MAX_RESENDS: i32 = 2;
const DEFAULT_OTP_CODE_LENGTH: usize = 6;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}

fn default_otp_ttl_secs() -> i64 {
    DEFAULT_OTP_TTL_SECS
}

fn default_otp_max_resends() -> i32 {
    DEFAULT_OTP_MAX_RESENDS
}

fn default_otp_code_length() -> usize {
    DEFAULT_OTP_CODE_LENGTH
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// OTP ポリシーの値を検査（起動時に弾く）
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.otp_ttl_secs <= 0 {
            return Err(ConfigError::Invalid {
                name: "OTP_TTL_SECS",
                reason: "must be greater than 0",
            });
        }
        if self.otp_max_resends < 0 {
            return Err(ConfigError::Invalid {
                name: "OTP_MAX_RESENDS",
                reason: "must not be negative",
            });
        }
        if self.otp_code_length == 0 {
            return Err(ConfigError::Invalid {
                name: "OTP_CODE_LENGTH",
                reason: "must be greater than 0",
            });
        }
        Ok(())
    }

    /// 設定から OTP ポリシーを構築
    pub fn otp_policy(&self) -> OtpPolicy {
        OtpPolicy {
            ttl: Duration::seconds(self.otp_ttl_secs),
            max_resends: self.otp_max_resends,
            code_length: self.otp_code_length,
        }
    }
}

/// 認証コードの発行ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_resends: i32,
    pub code_length: usize,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_OTP_TTL_SECS),
            max_resends: DEFAULT_OTP_MAX_RESENDS,
            code_length: DEFAULT_OTP_CODE_LENGTH,
        }
    }
}
