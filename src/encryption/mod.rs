//! # 密钥加密模块
//!
//! 处理密钥材料落库前的加密、读取后的解密以及去重用哈希。
//! 未配置加密密钥时三个操作全部退化为恒等变换。

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ProxyError, Result};

/// AES-GCM 随机数长度
const NONCE_LEN: usize = 12;

/// 密钥加密服务
pub struct Service {
    cipher: Option<Aes256Gcm>,
    hash_key: Option<[u8; 32]>,
}

impl Service {
    /// 创建加密服务
    ///
    /// `secret` 为空时所有操作透传；否则用 SHA-256 从口令派生
    /// 一次性的 32 字节密钥，供加密和哈希使用。
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Ok(Self {
                cipher: None,
                hash_key: None,
            });
        }

        let derived = derive_key(secret);
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| ProxyError::config_with_source("加密密钥派生失败", anyhow::anyhow!(e)))?;

        Ok(Self {
            cipher: Some(cipher),
            hash_key: Some(derived),
        })
    }

    /// 是否启用了加密
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// 加密字符串
    ///
    /// 每次调用生成新的随机数，同一明文的两次加密结果不同。
    /// 输出为 base64(nonce ‖ ciphertext)。
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(cipher) = self.cipher.as_ref() else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| {
            ProxyError::internal_with_source("密钥加密失败", anyhow::anyhow!("AES-GCM: {e}"))
        })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// 解密字符串
    ///
    /// 任何形式的非法输入都返回同一个不透明错误，不暴露失败细节。
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let Some(cipher) = self.cipher.as_ref() else {
            return Ok(encrypted.to_string());
        };

        let combined = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|_| opaque_decrypt_error())?;

        if combined.len() <= NONCE_LEN {
            return Err(opaque_decrypt_error());
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| opaque_decrypt_error())?;

        String::from_utf8(plaintext).map_err(|_| opaque_decrypt_error())
    }

    /// 计算去重哈希
    ///
    /// 确定性输出，同一输入总是得到同一结果；配置了口令时
    /// 哈希加盐，避免跨部署可比对。
    #[must_use]
    pub fn hash(&self, input: &str) -> String {
        let Some(hash_key) = self.hash_key.as_ref() else {
            return input.to_string();
        };

        let mut hasher = Sha256::new();
        hasher.update(hash_key);
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// 从口令派生 32 字节密钥
fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn opaque_decrypt_error() -> ProxyError {
    ProxyError::internal("密钥解密失败")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let service = Service::new("test-key-123").unwrap();

        for plaintext in [
            "hello world",
            "",
            "!@#$%^&*()_+-=[]{}|;':\",./<>?",
            "你好世界 🌍 こんにちは",
            r#"{"name":"test","value":123}"#,
        ] {
            let encrypted = service.encrypt(plaintext).unwrap();
            assert_ne!(encrypted, plaintext);
            let decrypted = service.decrypt(&encrypted).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_repeated_encrypt_diverges() {
        let service = Service::new("test-key").unwrap();
        let a = service.encrypt("same input").unwrap();
        let b = service.encrypt("same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(service.decrypt(&a).unwrap(), "same input");
        assert_eq!(service.decrypt(&b).unwrap(), "same input");
    }

    #[test]
    fn test_passthrough_without_secret() {
        let service = Service::new("").unwrap();
        assert!(!service.is_enabled());

        assert_eq!(service.encrypt("plain").unwrap(), "plain");
        assert_eq!(service.decrypt("plain").unwrap(), "plain");
        assert_eq!(service.hash("plain"), "plain");
    }

    #[test]
    fn test_decrypt_rejects_malformed_input() {
        let service = Service::new("test-key").unwrap();

        for bad in [
            "invalid-base64!@#",
            "dGhpcyBpcyBub3QgZW5jcnlwdGVkIGRhdGE=",
            "",
            "YWJj",
        ] {
            assert!(service.decrypt(bad).is_err(), "should reject: {bad}");
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let service = Service::new("test-key").unwrap();
        let a = service.hash("sk-abc123");
        let b = service.hash("sk-abc123");
        assert_eq!(a, b);
        assert_ne!(a, service.hash("sk-abc124"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_salted_by_secret() {
        let s1 = Service::new("secret-one").unwrap();
        let s2 = Service::new("secret-two").unwrap();
        assert_ne!(s1.hash("same-key"), s2.hash("same-key"));
    }

    #[test]
    fn test_cross_service_decrypt_fails() {
        let s1 = Service::new("secret-one").unwrap();
        let s2 = Service::new("secret-two").unwrap();
        let encrypted = s1.encrypt("payload").unwrap();
        assert!(s2.decrypt(&encrypted).is_err());
    }
}
