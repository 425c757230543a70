use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

use crate::algorithm::{Algorithm, AlgorithmError, FunctionParameters, ParameterOverrides};
use crate::pool::PoolError;
use crate::types::{ExecutionId, Portfolio};
use crate::wire::Envelope;

use super::SessionState;

pub const NEW_EXECUTION: &str = "new_execution";
pub const CONFIGURE_EXECUTION: &str = "configure_execution";
pub const RUN_EXECUTION: &str = "run_execution";
pub const CURRENT_PORTFOLIO: &str = "current_portfolio";
pub const STOP: &str = "stop";

const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");

/// Errors are sent back to the caller in the reply, only [EngineConfigure](CommandError::EngineConfigure)
/// ends the session.
#[derive(Debug, Display, Error)]
pub enum CommandError {
    #[display("execution {id} is already active")]
    ExecutionActive { id: ExecutionId },
    #[display("no active execution")]
    NoExecution,
    #[display("{task} is not valid while {state}")]
    InvalidState { task: String, state: SessionState },
    #[display("unknown task {task}")]
    UnknownTask { task: String },
    #[display("malformed {task} payload: {source}")]
    Malformed { task: String, source: serde_json::Error },
    #[display("malformed request: {source}")]
    MalformedRequest { source: serde_json::Error },
    #[display("invalid date {value}")]
    InvalidDate { value: String },
    #[display("start {start} is after end {end}")]
    InvalidRange { start: Date, end: Date },
    #[display("{_0}")]
    Algorithm(AlgorithmError),
    #[display("{_0}")]
    Pool(PoolError),
    #[display("repository error: {reason}")]
    Repository { reason: String },
    #[display("engine failed to configure: {reason}")]
    EngineConfigure { reason: String },
}

impl From<PoolError> for CommandError {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::Algorithm(e) => CommandError::Algorithm(e),
            other => CommandError::Pool(other),
        }
    }
}

pub fn parse_date(value: &str) -> Result<Date, CommandError> {
    Date::parse(value, DATE_FORMAT).map_err(|_| CommandError::InvalidDate {
        value: value.to_string(),
    })
}

/// Parses an optional date, falling back to `current` when absent.
pub fn date_or(value: Option<&str>, current: Date) -> Result<Date, CommandError> {
    match value {
        Some(value) => parse_date(value),
        None => Ok(current),
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewExecutionRequest {
    pub algorithm: Algorithm,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub benchmark: Option<String>,
}

/// Every field is optional, absent fields keep the execution's current value.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigureExecutionRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub symbols: Option<Vec<String>>,
    pub benchmark: Option<String>,
    pub parameters: ParameterOverrides,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewExecutionReply {
    pub execution_id: ExecutionId,
    pub start: String,
    pub end: String,
    pub symbols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ConfigureExecutionReply {
    pub execution_id: ExecutionId,
    pub broker_port: u16,
    pub namespace_port: u16,
    pub database_url: String,
    pub functions: Vec<FunctionParameters>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunExecutionReply {
    pub execution_id: ExecutionId,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PortfolioReply {
    pub portfolio: Option<Portfolio>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    NewExecution(NewExecutionReply),
    ConfigureExecution(ConfigureExecutionReply),
    RunExecution(RunExecutionReply),
    Portfolio(PortfolioReply),
    Stopped,
}

/// What every command gets back. `error` is set when the command failed, `result` is then null.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ControlReply {
    pub task: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn new(task: impl Into<String>, result: &Result<Reply, CommandError>) -> Self {
        let task = task.into();
        match result {
            Ok(reply) => match serde_json::to_value(reply) {
                Ok(result) => Self {
                    task,
                    result,
                    error: None,
                },
                Err(e) => Self::failed(task, e),
            },
            Err(e) => Self::failed(task, e),
        }
    }

    fn failed(task: String, reason: impl ToString) -> Self {
        Self {
            task,
            result: Value::Null,
            error: Some(reason.to_string()),
        }
    }

    pub fn parse<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        T::deserialize(&self.result)
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    NewExecution(NewExecutionRequest),
    ConfigureExecution(ConfigureExecutionRequest),
    RunExecution,
    CurrentPortfolio,
    Stop,
    Unknown(String),
}

impl Command {
    pub fn parse(envelope: &Envelope) -> Result<Self, CommandError> {
        let malformed = |source| CommandError::Malformed {
            task: envelope.task.clone(),
            source,
        };
        let command = match envelope.task.as_str() {
            NEW_EXECUTION => Command::NewExecution(envelope.parse().map_err(malformed)?),
            CONFIGURE_EXECUTION if envelope.payload.is_null() => {
                Command::ConfigureExecution(ConfigureExecutionRequest::default())
            }
            CONFIGURE_EXECUTION => Command::ConfigureExecution(envelope.parse().map_err(malformed)?),
            RUN_EXECUTION => Command::RunExecution,
            CURRENT_PORTFOLIO => Command::CurrentPortfolio,
            STOP => Command::Stop,
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }
}
