//! Runner-supplied acceptance criteria for the next unit of work

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{parse_duration, parse_memory, GantryError, GantryResult, ModelName, SessionMode, SessionType};

/// A `(model, mode, adapter)` combination a runner does not want offered again this round
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionFilterModel {
    pub model_name: ModelName,
    pub mode: SessionMode,
    #[serde(default)]
    pub finetune_file: String,
}

impl fmt::Display for SessionFilterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.model_name, self.mode, self.finetune_file)
    }
}

impl FromStr for SessionFilterModel {
    type Err = GantryError;

    /// Parse `model:mode:adapter`; the adapter part may be empty
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(GantryError::Validation(format!("invalid reject pair: {}", s)));
        }
        Ok(Self {
            model_name: parts[0].parse()?,
            mode: parts[1].parse()?,
            finetune_file: parts[2].to_string(),
        })
    }
}

/// What a runner is willing to take on its next poll
///
/// Unset fields mean "any". Built per poll and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    pub mode: Option<SessionMode>,
    pub session_type: Option<SessionType>,
    pub model_name: Option<ModelName>,
    /// Bytes available on the runner; `None` is unconstrained
    pub memory: Option<u64>,
    /// Adapter directory currently loaded on the runner
    pub lora_dir: String,
    pub reject: Vec<SessionFilterModel>,
    /// Only offer sessions older than this
    pub older: Option<Duration>,
}

impl SessionFilter {
    /// A filter that accepts anything
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_type(mut self, session_type: SessionType) -> Self {
        self.session_type = Some(session_type);
        self
    }

    pub fn with_model(mut self, model_name: ModelName) -> Self {
        self.model_name = Some(model_name);
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_lora_dir(mut self, lora_dir: impl Into<String>) -> Self {
        self.lora_dir = lora_dir.into();
        self
    }

    pub fn with_reject(mut self, reject: SessionFilterModel) -> Self {
        self.reject.push(reject);
        self
    }

    pub fn with_older(mut self, older: Duration) -> Self {
        self.older = Some(older);
        self
    }

    /// Build a filter from raw `key=value` poll parameters.
    ///
    /// `reject` may repeat. Unknown keys are ignored. Any malformed value
    /// fails the whole filter before it reaches the queue.
    pub fn from_params<I, K, V>(params: I) -> GantryResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filter = SessionFilter::any();
        for (key, value) in params {
            let value = value.as_ref();
            match key.as_ref() {
                "mode" => filter.mode = SessionMode::parse_optional(value)?,
                "type" => filter.session_type = SessionType::parse_optional(value)?,
                "model_name" => filter.model_name = ModelName::parse_optional(value)?,
                "lora_dir" => filter.lora_dir = value.to_string(),
                "memory" if !value.is_empty() => {
                    let bytes = parse_memory(value)?;
                    filter.memory = (bytes > 0).then_some(bytes);
                }
                "older" if !value.is_empty() => filter.older = Some(parse_duration(value)?),
                "reject" => filter.reject.push(value.parse()?),
                _ => {}
            }
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDXL: &str = "stabilityai/stable-diffusion-xl-base-1.0";

    #[test]
    fn test_reject_triple_parse() {
        let triple: SessionFilterModel = format!("{}:inference:", SDXL).parse().unwrap();
        assert_eq!(triple.model_name, ModelName::Sdxl);
        assert_eq!(triple.mode, SessionMode::Inference);
        assert!(triple.finetune_file.is_empty());
        assert_eq!(triple.to_string(), format!("{}:inference:", SDXL));
    }

    #[test]
    fn test_reject_triple_malformed() {
        assert!("foo:inference".parse::<SessionFilterModel>().is_err());
        assert!(format!("{}:sleep:", SDXL).parse::<SessionFilterModel>().is_err());
        assert!("unknown:inference:x".parse::<SessionFilterModel>().is_err());
    }

    #[test]
    fn test_from_params() {
        let params = vec![
            ("mode", "inference".to_string()),
            ("type", "image".to_string()),
            ("model_name", SDXL.to_string()),
            ("memory", "16G".to_string()),
            ("lora_dir", "/loras/abc".to_string()),
            ("reject", format!("{}:inference:", SDXL)),
            ("reject", format!("{}:finetune:", SDXL)),
            ("older", "2s".to_string()),
        ];
        let filter = SessionFilter::from_params(params).unwrap();

        assert_eq!(filter.mode, Some(SessionMode::Inference));
        assert_eq!(filter.session_type, Some(SessionType::Image));
        assert_eq!(filter.model_name, Some(ModelName::Sdxl));
        assert_eq!(filter.memory, Some(16_000_000_000));
        assert_eq!(filter.lora_dir, "/loras/abc");
        assert_eq!(filter.reject.len(), 2);
        assert_eq!(filter.older, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_from_params_empty_values_mean_any() {
        let params = vec![("mode", ""), ("type", ""), ("model_name", ""), ("memory", "0")];
        let filter = SessionFilter::from_params(params).unwrap();
        assert_eq!(filter, SessionFilter::any());
    }

    #[test]
    fn test_from_params_rejects_bad_values() {
        assert!(SessionFilter::from_params(vec![("memory", "lots")]).is_err());
        assert!(SessionFilter::from_params(vec![("older", "soon")]).is_err());
        assert!(SessionFilter::from_params(vec![("reject", "a:b")]).is_err());
        assert!(SessionFilter::from_params(vec![("mode", "train")]).is_err());
    }
}
