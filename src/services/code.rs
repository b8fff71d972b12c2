use hmac::{Hmac, Mac};
use rand::Rng;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::AppError;
use crate::models::Purpose;

type HmacSha256 = Hmac<Sha256>;

/// 認証コード生成器
pub trait CodeGenerator: Send + Sync {
    /// `length` 桁の数字コードを生成
    fn generate(&self, length: usize) -> String;
}

/// OS の CSPRNG を使うコード生成器
///
/// 各桁を 0..10 から一様に選ぶため、000000〜999999 が等確率で出る
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRngCodeGenerator;

impl CodeGenerator for OsRngCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

/// 認証コードの HMAC-SHA256 ハッシュ化
///
/// # Security
/// - DB にはコード平文を保存しない
/// - identity と purpose もメッセージに含め、別チャレンジへの流用を防ぐ
#[derive(Clone)]
pub struct CodeHasher {
    mac: HmacSha256,
}

impl CodeHasher {
    /// 生のキーから作成
    pub fn new(key: &[u8]) -> Result<Self, AppError> {
        let mac = HmacSha256::new_from_slice(key).map_err(|e| {
            tracing::error!(error = ?e, "HMACキーの初期化エラー");
            AppError::Internal(anyhow::anyhow!("invalid hmac key"))
        })?;
        Ok(Self { mac })
    }

    /// Base64エンコードされた32バイトキーから作成
    pub fn from_base64(key_base64: &str) -> Result<Self, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let key_bytes = STANDARD.decode(key_base64).map_err(|e| {
            tracing::error!(error = ?e, "OTPハッシュキーのBase64デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid otp hash key format"))
        })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "OTPハッシュキーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "otp hash key must be 32 bytes"
            )));
        }

        Self::new(&key_bytes)
    }

    pub fn hash(&self, identity: &str, purpose: Purpose, code: &str) -> Vec<u8> {
        self.keyed(identity, purpose, code)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    /// 定数時間比較で検証
    pub fn verify(&self, identity: &str, purpose: Purpose, code: &str, expected: &[u8]) -> bool {
        self.keyed(identity, purpose, code)
            .verify_slice(expected)
            .is_ok()
    }

    fn keyed(&self, identity: &str, purpose: Purpose, code: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(purpose.as_str().as_bytes());
        mac.update(b":");
        mac.update(identity.as_bytes());
        mac.update(b":");
        mac.update(code.as_bytes());
        mac
    }
}

/// 決められた順にコードを返す生成器（テスト用）
#[cfg(test)]
pub struct SequenceCodeGenerator {
    codes: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
impl SequenceCodeGenerator {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: std::sync::Mutex::new(codes.iter().map(|c| c.to_string()).collect()),
        }
    }
}

#[cfg(test)]
impl CodeGenerator for SequenceCodeGenerator {
    fn generate(&self, length: usize) -> String {
        self.codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "0".repeat(length))
    }
}
