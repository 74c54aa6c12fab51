//! The portal wraps every JSON answer in a JSONP-style call:
//! `dr1004({"result":1,"msg":"..."});`. The function name varies per
//! endpoint and carries no meaning.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::core::error::CodecError;
use crate::core::types::CallbackResult;

static ENVELOPE: OnceLock<Regex> = OnceLock::new();

fn envelope() -> &'static Regex {
    ENVELOPE.get_or_init(|| Regex::new(r"(?s)^\w+\((.*)\);$").expect("static envelope regex"))
}

/// Unwrap the callback envelope and read `result` / `msg`.
pub fn decode(text: &str) -> Result<CallbackResult, CodecError> {
    let trimmed = text.trim();
    let payload = envelope()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| CodecError::MalformedResponse(preview(trimmed)))?;

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| CodecError::MalformedResponse(format!("invalid payload: {}", e)))?;

    let result = match value.get("result") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| integral(n.as_f64()?)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(Value::Bool(b)) => Some(i64::from(*b)),
        _ => None,
    }
    .ok_or_else(|| CodecError::MalformedResponse("missing integer `result` field".to_string()))?;

    let message = value
        .get("msg")
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(CallbackResult { result, message })
}

/// `1.0` counts as `1`; anything with a fractional part does not.
fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Wrap a result in an envelope named `callback`.
pub fn encode(callback: &str, result: &CallbackResult) -> String {
    let payload = serde_json::json!({ "result": result.result, "msg": result.message });
    format!("{}({});", callback, payload)
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(80).collect();
    if head.len() < text.len() {
        format!("unexpected envelope: {}…", head)
    } else {
        format!("unexpected envelope: {}", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_login_envelope() {
        let r = decode("dr1004({\"result\":1,\"msg\":\"ok\"});").unwrap();
        assert_eq!(r, CallbackResult::new(1, "ok"));
        assert!(r.is_success());
    }

    #[test]
    fn test_decode_ignores_function_name_and_whitespace() {
        let r = decode("  \n jQuery1234_5({\"result\":0,\"msg\":\"AC999 login again\"});\r\n").unwrap();
        assert_eq!(r.result, 0);
        assert_eq!(r.message, "AC999 login again");
    }

    #[test]
    fn test_decode_string_result_and_missing_msg() {
        let r = decode("dr1003({\"result\":\"1\"});").unwrap();
        assert_eq!(r, CallbackResult::new(1, ""));
    }

    #[test]
    fn test_decode_float_result() {
        let r = decode("dr1004({\"result\":1.0,\"msg\":\"ok\"});").unwrap();
        assert!(r.is_success());
        assert!(matches!(
            decode("dr1004({\"result\":1.5});"),
            Err(CodecError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            decode("not-valid"),
            Err(CodecError::MalformedResponse(_))
        ));
        assert!(decode("dr1004({\"result\":1})").is_err(), "missing semicolon");
        assert!(decode("dr1004(not json);").is_err());
        assert!(decode("dr1004({\"msg\":\"no result\"});").is_err());
    }

    #[test]
    fn test_encode_decodes_back() {
        let original = CallbackResult::new(-1, "password incorrect");
        let text = encode("dr1004", &original);
        assert!(text.starts_with("dr1004({"));
        assert_eq!(decode(&text).unwrap(), original);
    }
}
