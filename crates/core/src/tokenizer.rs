use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenizers::{AddedToken, Tokenizer};

use crate::error::{EngineError, Result};

/// Serializable description of the tokenizer an executor expects.
///
/// Holds no live handles, so it can be shipped across process boundaries
/// and turned back into a tokenizer with [`BuildTokenizer::from_parameters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerParameters {
    /// Location of a `tokenizer.json`.
    #[serde(default)]
    pub path: PathBuf,
    /// Number of `<extra_id_N>` sentinel tokens appended to the vocabulary.
    #[serde(default)]
    pub extra_ids: u32,
}

impl TokenizerParameters {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra_ids: 0,
        }
    }

    pub fn with_extra_ids(mut self, extra_ids: u32) -> Self {
        self.extra_ids = extra_ids;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }
}

/// Tokenizers an executor can construct from its own parameter descriptor.
pub trait BuildTokenizer: Sized {
    fn from_parameters(params: &TokenizerParameters) -> Result<Self>;
}

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| EngineError::Tokenizer(format!("load {}: {e}", path.display())))?;
        Ok(Self { inner })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = ahash::AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self { inner: tokenizer }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::Tokenizer(format!("encode: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| EngineError::Tokenizer(format!("decode: {e}")))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.inner
            .save(path, false)
            .map_err(|e| EngineError::Tokenizer(format!("save {}: {e}", path.display())))
    }

    fn add_extra_ids(&mut self, extra_ids: u32) {
        if extra_ids == 0 {
            return;
        }
        let sentinels: Vec<AddedToken> = (0..extra_ids)
            .map(|i| AddedToken::from(format!("<extra_id_{i}>"), true))
            .collect();
        self.inner.add_special_tokens(&sentinels);
    }
}

impl BuildTokenizer for TokenizerWrapper {
    fn from_parameters(params: &TokenizerParameters) -> Result<Self> {
        if !params.is_configured() {
            return Err(EngineError::Tokenizer(
                "tokenizer parameters carry no path".into(),
            ));
        }
        let mut tokenizer = Self::from_file(&params.path)?;
        tokenizer.add_extra_ids(params.extra_ids);
        Ok(tokenizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved_tokenizer(vocab_size: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        TokenizerWrapper::for_testing(vocab_size).save(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let tok = TokenizerWrapper::for_testing(16);
        let ids = tok.encode("t3 t7 t15").unwrap();
        assert_eq!(ids, vec![3, 7, 15]);
        assert_eq!(tok.decode(&ids).unwrap(), "t3 t7 t15");
    }

    #[test]
    fn build_from_parameters_loads_file() {
        let (_dir, path) = saved_tokenizer(32);
        let tok = TokenizerWrapper::from_parameters(&TokenizerParameters::new(&path)).unwrap();
        assert_eq!(tok.vocab_size(), 32);
        assert_eq!(tok.encode("t5 t9").unwrap(), vec![5, 9]);
    }

    #[test]
    fn extra_ids_extend_vocabulary() {
        let (_dir, path) = saved_tokenizer(8);
        let params = TokenizerParameters::new(&path).with_extra_ids(3);
        let tok = TokenizerWrapper::from_parameters(&params).unwrap();
        assert_eq!(tok.vocab_size(), 11);
        assert!(tok.token_to_id("<extra_id_2>").is_some());
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = TokenizerWrapper::from_parameters(&TokenizerParameters::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Tokenizer(_)));

        let err = TokenizerWrapper::from_parameters(&TokenizerParameters::new("/nonexistent/t.json"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/t.json"));
    }

    #[test]
    fn parameters_serialize_as_plain_data() {
        let params = TokenizerParameters::new("/models/tok.json").with_extra_ids(100);
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"path":"/models/tok.json","extra_ids":100}"#);
        let back: TokenizerParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);

        let defaulted: TokenizerParameters = serde_json::from_str("{}").unwrap();
        assert!(!defaulted.is_configured());
    }
}
