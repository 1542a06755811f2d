//! # 上游错误解析
//!
//! 把各家上游返回的 JSON 错误体归一化为单条消息，并识别
//! 不计入密钥统计的错误和可直接放弃的客户端侧错误

use serde_json::Value;

/// 解析后消息的最大字节数
const MAX_ERROR_BODY_LENGTH: usize = 2048;

/// 不驱动密钥状态转换的错误短语，小写匹配
const UNCOUNTED_PHRASES: &[&str] = &[
    "resource has been exhausted",
    "please reduce the length of the messages",
];

/// 客户端侧可忽略错误的特征片段，命中后不再重试也不响应
const IGNORABLE_FRAGMENTS: &[&str] = &[
    "connection reset by peer",
    "broken pipe",
    "request canceled",
    "operation was canceled",
];

/// 解析上游错误响应体
///
/// 按顺序尝试以下 JSON 路径，取第一个非空白字符串：
/// 1. `.error.message`
/// 2. `.error_msg`
/// 3. `.error`（字符串形式）
/// 4. `.message`
///
/// 全部落空或解析失败时返回原始响应体，统一截断到 2048 字节。
#[must_use]
pub fn parse_upstream_error(body: &[u8]) -> String {
    let raw = String::from_utf8_lossy(body);

    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return truncate_str(&raw, MAX_ERROR_BODY_LENGTH);
    };

    let candidates = [
        value.pointer("/error/message"),
        value.get("error_msg"),
        value.get("error"),
        value.get("message"),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Some(text) = candidate.as_str() {
            if !text.trim().is_empty() {
                return truncate_str(text, MAX_ERROR_BODY_LENGTH);
            }
        }
    }

    truncate_str(&raw, MAX_ERROR_BODY_LENGTH)
}

/// 判断错误消息是否属于"不计数"类别
///
/// 不计数错误（典型如配额类提示）不驱动密钥状态转换，
/// 但仍然是重试候选。
#[must_use]
pub fn is_uncounted(message: &str) -> bool {
    let lowered = message.to_lowercase();
    UNCOUNTED_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// 判断错误消息是否属于客户端侧可忽略错误
///
/// 客户端断开或主动取消时命中，既不重试也不向客户端返回响应。
#[must_use]
pub fn is_ignorable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    IGNORABLE_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

/// 按字节数截断字符串，保证落在字符边界上
fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_openai_format() {
        let body = br#"{"error": {"message": "Invalid API key provided"}}"#;
        assert_eq!(parse_upstream_error(body), "Invalid API key provided");
    }

    #[test]
    fn test_parse_vendor_format() {
        let body = br#"{"error_msg": "Rate limit exceeded"}"#;
        assert_eq!(parse_upstream_error(body), "Rate limit exceeded");
    }

    #[test]
    fn test_parse_simple_error_format() {
        let body = br#"{"error": "Bad request format"}"#;
        assert_eq!(parse_upstream_error(body), "Bad request format");
    }

    #[test]
    fn test_parse_root_message_format() {
        let body = br#"{"message": "Service unavailable"}"#;
        assert_eq!(parse_upstream_error(body), "Service unavailable");
    }

    #[test]
    fn test_parse_invalid_json_returns_raw() {
        let body = b"invalid json content";
        assert_eq!(parse_upstream_error(body), "invalid json content");
    }

    #[test]
    fn test_parse_empty_json_returns_raw() {
        let body = b"{}";
        assert_eq!(parse_upstream_error(body), "{}");
    }

    #[test]
    fn test_parse_standard_wins_over_vendor() {
        let body = br#"{"error": {"message": "Standard format"}, "error_msg": "Vendor format"}"#;
        assert_eq!(parse_upstream_error(body), "Standard format");
    }

    #[test]
    fn test_parse_blank_message_falls_back_to_raw() {
        let body = br#"{"error": {"message": "   "}}"#;
        assert_eq!(parse_upstream_error(body), r#"{"error": {"message": "   "}}"#);
    }

    #[test]
    fn test_parse_non_string_message_falls_back_to_raw() {
        let body = br#"{"error": {"message": 123}}"#;
        assert_eq!(parse_upstream_error(body), r#"{"error": {"message": 123}}"#);
    }

    #[test]
    fn test_parse_empty_body() {
        assert_eq!(parse_upstream_error(b""), "");
    }

    #[test]
    fn test_parse_truncates_long_message() {
        let long = "a".repeat(3000);
        let body = format!(r#"{{"error": {{"message": "{long}"}}}}"#);
        let result = parse_upstream_error(body.as_bytes());
        assert_eq!(result.len(), 2048);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // 每个汉字 3 字节，截断点落在字符中间时需要回退
        let s = "好".repeat(1000);
        let result = truncate_str(&s, 2048);
        assert!(result.len() <= 2048);
        assert_eq!(result.len() % 3, 0);
    }

    #[test]
    fn test_is_uncounted_phrases() {
        assert!(is_uncounted("resource has been exhausted"));
        assert!(is_uncounted("RESOURCE HAS BEEN EXHAUSTED"));
        assert!(is_uncounted("error: resource has been exhausted occurred"));
        assert!(is_uncounted("Please Reduce The Length Of The Messages"));

        assert!(!is_uncounted("resource"));
        assert!(!is_uncounted("resource exhausted"));
        assert!(!is_uncounted("invalid api key"));
        assert!(!is_uncounted("rate limit exceeded"));
        assert!(!is_uncounted(""));
    }

    #[test]
    fn test_is_ignorable_message() {
        assert!(is_ignorable_message("write: broken pipe"));
        assert!(is_ignorable_message("Connection reset by peer"));
        assert!(!is_ignorable_message("connection refused"));
        assert!(!is_ignorable_message(""));
    }
}
