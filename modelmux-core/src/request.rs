use either::Either;
use serde::{Deserialize, Serialize};

use crate::error::ServeError;

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Wire-side tag selecting how `constraints` is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintType {
    None,
    Types,
    Choice,
    Regex,
}

/// Body of `POST /forward`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub name_of_model: String,
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub constraints: Option<Either<Vec<String>, String>>,
    #[serde(default)]
    pub constraint_type: Option<ConstraintType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub random_seed: Option<i64>,
}

/// Output constraint handed to the generation capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    None,
    Typed(PrimitiveType),
    Choice(Vec<String>),
    Regex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Int,
    Float,
}

impl PrimitiveType {
    fn parse(name: &str) -> Result<Self, ServeError> {
        match name {
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            other => Err(ServeError::InvalidRequest(format!(
                "type '{other}' is not supported"
            ))),
        }
    }
}

impl Constraint {
    /// Decodes the `constraint_type`/`constraints` field pair. Decoding
    /// happens before dispatch so a malformed pair never reaches a worker.
    pub fn from_wire(
        constraint_type: Option<ConstraintType>,
        constraints: Option<&Either<Vec<String>, String>>,
    ) -> Result<Self, ServeError> {
        match constraint_type {
            None => match constraints {
                None => Ok(Constraint::None),
                Some(Either::Left(values)) if values.is_empty() => Ok(Constraint::None),
                Some(_) => Err(ServeError::InvalidRequest(
                    "constraints were provided without a constraint_type".to_string(),
                )),
            },
            Some(ConstraintType::None) => Ok(Constraint::None),
            Some(ConstraintType::Types) => {
                let Some(Either::Left(names)) = constraints else {
                    return Err(ServeError::InvalidRequest(
                        "'types' constraint requires a list of type names".to_string(),
                    ));
                };
                if names.len() != 1 {
                    return Err(ServeError::InvalidRequest(
                        "for 'types' constraint, provide exactly one type".to_string(),
                    ));
                }
                PrimitiveType::parse(&names[0]).map(Constraint::Typed)
            }
            Some(ConstraintType::Choice) => {
                let Some(Either::Left(options)) = constraints else {
                    return Err(ServeError::InvalidRequest(
                        "'choice' constraint requires a list of options".to_string(),
                    ));
                };
                if options.is_empty() {
                    return Err(ServeError::InvalidRequest(
                        "'choice' constraint requires at least one option".to_string(),
                    ));
                }
                Ok(Constraint::Choice(options.clone()))
            }
            Some(ConstraintType::Regex) => {
                let Some(Either::Right(pattern)) = constraints else {
                    return Err(ServeError::InvalidRequest(
                        "'regex' constraint requires a pattern string".to_string(),
                    ));
                };
                Ok(Constraint::Regex(pattern.clone()))
            }
        }
    }
}

/// Payload a worker executes: the already-validated parts of a request.
/// Cloneable so a job whose queue was retired mid-enqueue can be resubmitted.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub history: Vec<ChatTurn>,
    pub constraint: Constraint,
    pub random_seed: Option<i64>,
    pub response_format: Option<serde_json::Value>,
}

impl GenerationJob {
    pub fn from_request(request: &ForwardRequest) -> Result<Self, ServeError> {
        let constraint =
            Constraint::from_wire(request.constraint_type, request.constraints.as_ref())?;
        Ok(Self {
            history: request.history.clone(),
            constraint,
            random_seed: request.random_seed,
            response_format: request.response_format.clone(),
        })
    }
}
