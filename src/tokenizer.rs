use anyhow::Result;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

/// Local BPE tokenizer used when the server reports no usage and to size
/// generated prompts.
///
/// Counts are approximate for models that do not use an OpenAI vocabulary.
#[derive(Clone)]
pub struct Tokenizer {
    encoder: Arc<CoreBPE>,
}

impl Tokenizer {
    pub fn new(model: &str) -> Result<Self> {
        // cl100k for everything except the GPT-4o family
        let encoder = if model.to_ascii_lowercase().contains("gpt-4o") {
            o200k_base()?
        } else {
            cl100k_base()?
        };

        Ok(Self {
            encoder: Arc::new(encoder),
        })
    }

    /// Tokens in the raw text. Chat framing added by the server is not counted.
    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.encoder.encode_with_special_tokens(text).len()
    }

    /// The longest prefix of `text` that is at most `max_tokens` tokens.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> Result<String> {
        let tokens = self.encoder.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return Ok(text.to_string());
        }
        self.encoder.decode(tokens[..max_tokens].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counting() {
        let tokenizer = Tokenizer::new("gpt-3.5-turbo").unwrap();
        assert_eq!(tokenizer.count_tokens(""), 0);
        assert!(tokenizer.count_tokens("Hello, world!") > 0);

        let long = "benchmark ".repeat(100);
        assert!(tokenizer.count_tokens(&long) >= 100);
    }

    #[test]
    fn test_truncate() {
        let tokenizer = Tokenizer::new("llama-3.1-8b").unwrap();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);

        let short = tokenizer.truncate(&text, 10).unwrap();
        assert!(tokenizer.count_tokens(&short) <= 10);
        assert!(text.starts_with(&short));

        assert_eq!(tokenizer.truncate("tiny", 10).unwrap(), "tiny");
    }
}
