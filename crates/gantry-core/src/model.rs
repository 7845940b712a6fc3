//! Model catalog
//!
//! The set of models a runner can load is closed. Each variant carries a
//! descriptor (repository name, session type, memory footprint per mode)
//! that the matcher and the instance pool consult by value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{GantryError, GantryResult, SessionMode, SessionType};

const GB: u64 = 1_000_000_000;

/// Models known to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelName {
    #[serde(rename = "stabilityai/stable-diffusion-xl-base-1.0")]
    Sdxl,
    #[serde(rename = "mistralai/Mistral-7B-Instruct-v0.1")]
    Mistral7bInstruct01,
}

/// Static description of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Canonical repository identifier
    pub name: &'static str,
    /// Kind of sessions this model serves
    pub session_type: SessionType,
    /// Bytes required to run inference
    pub inference_memory: u64,
    /// Bytes required to run a finetune
    pub finetune_memory: u64,
}

impl ModelDescriptor {
    /// Memory needed to run the model in the given mode
    pub fn memory_for(&self, mode: SessionMode) -> u64 {
        match mode {
            SessionMode::Inference => self.inference_memory,
            SessionMode::Finetune => self.finetune_memory,
        }
    }
}

const SDXL: ModelDescriptor = ModelDescriptor {
    name: "stabilityai/stable-diffusion-xl-base-1.0",
    session_type: SessionType::Image,
    inference_memory: 8 * GB,
    finetune_memory: 24 * GB,
};

const MISTRAL_7B: ModelDescriptor = ModelDescriptor {
    name: "mistralai/Mistral-7B-Instruct-v0.1",
    session_type: SessionType::Text,
    inference_memory: 12 * GB,
    finetune_memory: 24 * GB,
};

impl ModelName {
    /// Every model in the catalog
    pub const ALL: [ModelName; 2] = [ModelName::Sdxl, ModelName::Mistral7bInstruct01];

    pub fn descriptor(&self) -> &'static ModelDescriptor {
        match self {
            ModelName::Sdxl => &SDXL,
            ModelName::Mistral7bInstruct01 => &MISTRAL_7B,
        }
    }

    /// Memory needed to run this model in the given mode
    pub fn memory_requirement(&self, mode: SessionMode) -> u64 {
        self.descriptor().memory_for(mode)
    }

    /// Default model for a session type
    pub fn for_session_type(session_type: SessionType) -> ModelName {
        match session_type {
            SessionType::Image => ModelName::Sdxl,
            SessionType::Text => ModelName::Mistral7bInstruct01,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.descriptor().name
    }

    /// Parse a model name where an empty string means "any"
    pub fn parse_optional(value: &str) -> GantryResult<Option<ModelName>> {
        if value.is_empty() {
            Ok(None)
        } else {
            value.parse().map(Some)
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GantryError::Validation(format!("unknown model name: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_roundtrip_str() {
        for model in ModelName::ALL {
            assert_eq!(model.as_str().parse::<ModelName>().unwrap(), model);
        }
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = "gpt-2".parse::<ModelName>().unwrap_err();
        assert!(matches!(err, GantryError::Validation(_)));
    }

    #[test]
    fn test_parse_optional_empty_is_any() {
        assert_eq!(ModelName::parse_optional("").unwrap(), None);
        assert_eq!(
            ModelName::parse_optional("stabilityai/stable-diffusion-xl-base-1.0").unwrap(),
            Some(ModelName::Sdxl)
        );
    }

    #[test]
    fn test_memory_requirement() {
        assert_eq!(ModelName::Sdxl.memory_requirement(SessionMode::Inference), 8 * GB);
        assert!(
            ModelName::Mistral7bInstruct01.memory_requirement(SessionMode::Finetune)
                > ModelName::Mistral7bInstruct01.memory_requirement(SessionMode::Inference)
        );
    }

    #[test]
    fn test_for_session_type() {
        assert_eq!(ModelName::for_session_type(SessionType::Image), ModelName::Sdxl);
        assert_eq!(
            ModelName::for_session_type(SessionType::Text),
            ModelName::Mistral7bInstruct01
        );
        assert_eq!(
            ModelName::for_session_type(SessionType::Text).descriptor().session_type,
            SessionType::Text
        );
    }

    #[test]
    fn test_serde_uses_repository_name() {
        let json = serde_json::to_string(&ModelName::Sdxl).unwrap();
        assert_eq!(json, "\"stabilityai/stable-diffusion-xl-base-1.0\"");
    }
}
