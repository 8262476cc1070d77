//! Parsing of identifiers received from capture clients and API callers

use std::fmt;

pub const CONNECT_CODE_LENGTH: usize = 8;
pub const TASK_ID_LENGTH: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("connect code must be {CONNECT_CODE_LENGTH} characters, got {0}")]
    ConnectCodeLength(usize),
    #[error("task id must be {TASK_ID_LENGTH} characters, got {0}")]
    TaskIdLength(usize),
    #[error("snowflake is empty")]
    EmptySnowflake,
    #[error("snowflake {0:?} is not an unsigned integer")]
    MalformedSnowflake(String),
    #[error("snowflake cannot be zero")]
    ZeroSnowflake,
}

/// Short code shared out of band between a capture client and a guild
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectCode(String);

impl ConnectCode {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let length = raw.chars().count();
        if length == CONNECT_CODE_LENGTH {
            Ok(Self(raw.to_owned()))
        } else {
            Err(ValidationError::ConnectCodeLength(length))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses a guild/user ID. Any nonzero unsigned integer is accepted.
pub fn parse_snowflake(raw: &str) -> Result<u64, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptySnowflake);
    }
    let id = raw
        .parse::<u64>()
        .map_err(|_| ValidationError::MalformedSnowflake(raw.to_owned()))?;
    if id == 0 {
        return Err(ValidationError::ZeroSnowflake);
    }
    Ok(id)
}

pub fn validate_task_id(raw: &str) -> Result<&str, ValidationError> {
    let length = raw.chars().count();
    if length == TASK_ID_LENGTH {
        Ok(raw)
    } else {
        Err(ValidationError::TaskIdLength(length))
    }
}
