//! Location specs accepted by `--location`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LocationSpec {
    /// The local machine: `localhost`.
    Localhost,
    /// A cloud provider, optionally scoped to a region: `aws-ec2:eu-west-1`.
    Cloud { provider: String, region: Option<String> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("invalid location: {0:?}")]
    Invalid(String),
}

impl LocationSpec {
    pub fn parse(spec: &str) -> Result<Self, LocationError> {
        let spec = spec.trim();
        if spec.is_empty() || spec.chars().any(char::is_whitespace) {
            return Err(LocationError::Invalid(spec.to_string()));
        }
        if spec == "localhost" {
            return Ok(LocationSpec::Localhost);
        }
        match spec.split_once(':') {
            Some((provider, region)) if !provider.is_empty() && !region.is_empty() => {
                Ok(LocationSpec::Cloud {
                    provider: provider.to_string(),
                    region: Some(region.to_string()),
                })
            }
            Some(_) => Err(LocationError::Invalid(spec.to_string())),
            None => Ok(LocationSpec::Cloud {
                provider: spec.to_string(),
                region: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            LocationSpec::Localhost => "localhost",
            LocationSpec::Cloud { provider, .. } => provider,
        }
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationSpec::Localhost => f.write_str("localhost"),
            LocationSpec::Cloud { provider, region: Some(region) } => {
                write!(f, "{provider}:{region}")
            }
            LocationSpec::Cloud { provider, region: None } => f.write_str(provider),
        }
    }
}
