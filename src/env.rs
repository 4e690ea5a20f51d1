//! Environment variable handling (§6).
//!
//! Recognized variables: `OCR_API_KEY`, `VLM_API_KEY` (provider
//! credentials; whitespace-only is treated as unset) and
//! `LLM_MAX_OUTPUT_TOKENS` (fails fast at startup if set but not a valid
//! integer).

use anyhow::{Context, Result};

/// Read a credential variable, treating unset or whitespace-only as `None`.
pub fn read_api_key(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => None,
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

pub fn ocr_api_key() -> Option<String> {
    read_api_key("OCR_API_KEY")
}

pub fn vlm_api_key() -> Option<String> {
    read_api_key("VLM_API_KEY")
}

/// Read `LLM_MAX_OUTPUT_TOKENS`, failing fast if present but not an integer.
/// Returns `None` if unset.
pub fn llm_max_output_tokens() -> Result<Option<i64>> {
    match std::env::var("LLM_MAX_OUTPUT_TOKENS") {
        Err(_) => Ok(None),
        Ok(v) => {
            let parsed: i64 = v
                .trim()
                .parse()
                .with_context(|| format!("LLM_MAX_OUTPUT_TOKENS is not an integer: {v:?}"))?;
            Ok(Some(parsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn whitespace_only_key_is_unset() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var("OCR_API_KEY", "   ");
        assert_eq!(ocr_api_key(), None);
        std::env::remove_var("OCR_API_KEY");
    }

    #[test]
    fn present_key_is_returned() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var("VLM_API_KEY", "sk-abc");
        assert_eq!(vlm_api_key(), Some("sk-abc".to_string()));
        std::env::remove_var("VLM_API_KEY");
    }

    #[test]
    fn non_integer_max_tokens_fails_fast() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var("LLM_MAX_OUTPUT_TOKENS", "not-a-number");
        assert!(llm_max_output_tokens().is_err());
        std::env::remove_var("LLM_MAX_OUTPUT_TOKENS");
    }

    #[test]
    fn unset_max_tokens_is_none() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::remove_var("LLM_MAX_OUTPUT_TOKENS");
        assert_eq!(llm_max_output_tokens().unwrap(), None);
    }
}
