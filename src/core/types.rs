use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Keys the gateway injects into its captive redirect, paired with the
/// login form field each one is sent back as.
pub const LOCATION_KEYS: [(&str, &str); 4] = [
    ("wlanuserip", "wlan_user_ip"),
    ("wlanusermac", "wlan_user_mac"),
    ("wlanacip", "wlan_ac_ip"),
    ("wlanacname", "wlan_ac_name"),
];

/// Identity parameters taken from the gateway's redirect query string.
///
/// Only the first value of a repeated key is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationParams(HashMap<String, String>);

impl LocationParams {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = HashMap::new();
        for (k, v) in pairs {
            map.entry(k.into()).or_insert_with(|| v.into());
        }
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Missing keys read as empty strings, matching what the login form sends.
    pub fn get_or_empty(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Login-relevant keys the redirect did not carry.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        LOCATION_KEYS
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| !self.0.contains_key(*key))
            .collect()
    }
}

/// Raw CAPTCHA bytes as served by the portal. Dropped right after solving.
#[derive(Clone, PartialEq, Eq)]
pub struct CaptchaImage {
    bytes: Vec<u8>,
}

impl CaptchaImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Sniffed container format, if the bytes look like a known image.
    pub fn format(&self) -> Option<image::ImageFormat> {
        image::guess_format(&self.bytes).ok()
    }

    /// File extension for the sniffed format (`png` when unknown).
    pub fn extension(&self) -> &'static str {
        self.format()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("png")
    }

    /// MIME type for the sniffed format (`image/png` when unknown).
    pub fn mime_type(&self) -> &'static str {
        match self.format() {
            Some(image::ImageFormat::Jpeg) => "image/jpeg",
            Some(image::ImageFormat::Gif) => "image/gif",
            Some(image::ImageFormat::Bmp) => "image/bmp",
            _ => "image/png",
        }
    }
}

impl fmt::Debug for CaptchaImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaImage")
            .field("len", &self.bytes.len())
            .field("format", &self.format())
            .finish()
    }
}

/// Number of characters in a portal CAPTCHA.
pub const CAPTCHA_LEN: usize = 4;

/// A cleaned, validated 4-character `[A-Z0-9]` CAPTCHA code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptchaCode(String);

impl CaptchaCode {
    /// Uppercase and drop everything that is not ASCII alphanumeric.
    pub fn clean(raw: &str) -> String {
        raw.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }

    /// Accepts input that cleans to exactly [`CAPTCHA_LEN`] characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = Self::clean(raw);
        (cleaned.len() == CAPTCHA_LEN).then_some(Self(cleaned))
    }

    /// Keeps the first [`CAPTCHA_LEN`] cleaned characters; shorter input is rejected.
    ///
    /// Model output is often chatty, so the prefix is what counts.
    pub fn parse_prefix(raw: &str) -> Option<Self> {
        let cleaned = Self::clean(raw);
        if cleaned.len() < CAPTCHA_LEN {
            return None;
        }
        Some(Self(cleaned[..CAPTCHA_LEN].to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaptchaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded payload of the portal's callback envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackResult {
    pub result: i64,
    #[serde(rename = "msg", alias = "message", default)]
    pub message: String,
}

impl CallbackResult {
    pub fn new(result: i64, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == 1
    }
}

/// Steps of one login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Idle,
    ResolvingLocation,
    AcquiringCaptcha,
    SolvingCaptcha,
    VerifyingCaptcha,
    Authenticating,
    Succeeded,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::ResolvingLocation => "resolving_location",
            HandshakeState::AcquiringCaptcha => "acquiring_captcha",
            HandshakeState::SolvingCaptcha => "solving_captcha",
            HandshakeState::VerifyingCaptcha => "verifying_captcha",
            HandshakeState::Authenticating => "authenticating",
            HandshakeState::Succeeded => "succeeded",
            HandshakeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_and_uppercases() {
        assert_eq!(CaptchaCode::clean("ab-1 2!"), "AB12");
        assert_eq!(
            CaptchaCode::parse("ab-1 2!").map(|c| c.to_string()),
            Some("AB12".to_string())
        );
    }

    #[test]
    fn test_short_code_is_rejected() {
        assert_eq!(CaptchaCode::clean("a1"), "A1");
        assert!(CaptchaCode::parse("a1").is_none());
        assert!(CaptchaCode::parse_prefix("a1").is_none());
    }

    #[test]
    fn test_parse_rejects_long_but_prefix_accepts() {
        assert!(CaptchaCode::parse("7k2m9").is_none());
        assert_eq!(
            CaptchaCode::parse_prefix("The code is: 7k2m").map(|c| c.to_string()),
            Some("THEC".to_string())
        );
        assert_eq!(
            CaptchaCode::parse_prefix(" 7k-2m.\n").map(|c| c.to_string()),
            Some("7K2M".to_string())
        );
    }

    #[test]
    fn test_location_params_keep_first_value() {
        let params = LocationParams::from_pairs([
            ("wlanuserip", "10.0.0.2"),
            ("wlanuserip", "10.0.0.3"),
            ("wlanacname", "ac-1"),
        ]);
        assert_eq!(params.len(), 2);
        assert_eq!(params.get_or_empty("wlanuserip"), "10.0.0.2");
        assert_eq!(params.get_or_empty("wlanusermac"), "");
    }

    #[test]
    fn test_captcha_image_sniffs_png() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let img = CaptchaImage::new(png.to_vec());
        assert_eq!(img.format(), Some(image::ImageFormat::Png));
        assert_eq!(img.extension(), "png");
        assert_eq!(img.mime_type(), "image/png");
        assert_eq!(CaptchaImage::new(vec![1, 2, 3]).extension(), "png");
    }
}
