use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier assigned to a task by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message body that could not be understood
#[derive(Debug, Error)]
pub enum TaskDecodeError {
    #[error("body is not a JSON string array: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} elements, got {actual}")]
    Arity { expected: &'static str, actual: usize },

    #[error("empty {0}")]
    EmptyField(&'static str),
}

/// One connectivity query: is `target_url` reachable from `start_url`?
///
/// On the work queue this is `[start, target]`, or `[id, start, target]` when
/// the producer wants the result correlated back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub id: Option<TaskId>,
    pub start_url: String,
    pub target_url: String,
}

impl CrawlTask {
    pub fn new(start_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: None,
            start_url: start_url.into().trim().to_string(),
            target_url: target_url.into().trim().to_string(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn to_wire(&self) -> String {
        let fields: Vec<&str> = match &self.id {
            Some(id) => vec![id.as_str(), self.start_url.as_str(), self.target_url.as_str()],
            None => vec![self.start_url.as_str(), self.target_url.as_str()],
        };
        // a Vec<&str> always serializes
        serde_json::to_string(&fields).unwrap_or_default()
    }

    pub fn from_wire(body: &str) -> Result<Self, TaskDecodeError> {
        let fields: Vec<String> = serde_json::from_str(body)?;
        let (id, start, target) = match fields.as_slice() {
            [start, target] => (None, start, target),
            [id, start, target] => (Some(TaskId::from(id.trim())), start, target),
            _ => {
                return Err(TaskDecodeError::Arity {
                    expected: "2 or 3",
                    actual: fields.len(),
                })
            }
        };

        let task = Self {
            id,
            start_url: start.trim().to_string(),
            target_url: target.trim().to_string(),
        };
        if task.start_url.is_empty() {
            return Err(TaskDecodeError::EmptyField("start URL"));
        }
        if task.target_url.is_empty() {
            return Err(TaskDecodeError::EmptyField("target URL"));
        }
        if matches!(&task.id, Some(id) if id.as_str().is_empty()) {
            return Err(TaskDecodeError::EmptyField("task id"));
        }
        Ok(task)
    }
}

/// The answer to a task: `[start, target, hop1, hop2, ..., target]`.
///
/// The first two entries echo the request; the remainder is the discovered
/// path, depth-ordered, excluding the start page itself. An empty remainder
/// means no path was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct ResultPath {
    pub start_url: String,
    pub target_url: String,
    pub hops: Vec<String>,
}

impl ResultPath {
    pub fn found(start_url: impl Into<String>, target_url: impl Into<String>, hops: Vec<String>) -> Self {
        Self {
            start_url: start_url.into(),
            target_url: target_url.into(),
            hops,
        }
    }

    pub fn not_found(start_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self::found(start_url, target_url, Vec::new())
    }

    pub fn is_found(&self) -> bool {
        !self.hops.is_empty()
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_wire(body: &str) -> Result<Self, TaskDecodeError> {
        Ok(serde_json::from_str(body)?)
    }
}

impl From<ResultPath> for Vec<String> {
    fn from(path: ResultPath) -> Self {
        let mut out = Vec::with_capacity(path.hops.len() + 2);
        out.push(path.start_url);
        out.push(path.target_url);
        out.extend(path.hops);
        out
    }
}

impl TryFrom<Vec<String>> for ResultPath {
    type Error = TaskDecodeError;

    fn try_from(mut value: Vec<String>) -> Result<Self, Self::Error> {
        if value.len() < 2 {
            return Err(TaskDecodeError::Arity {
                expected: "at least 2",
                actual: value.len(),
            });
        }
        let hops = value.split_off(2);
        let mut head = value.into_iter();
        let start_url = head.next().unwrap_or_default();
        let target_url = head.next().unwrap_or_default();
        Ok(Self {
            start_url,
            target_url,
            hops,
        })
    }
}

impl fmt::Display for ResultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_found() {
            return write!(f, "no path from {} to {}", self.start_url, self.target_url);
        }
        write!(f, "{}", self.start_url)?;
        for hop in &self.hops {
            write!(f, " -> {}", hop)?;
        }
        Ok(())
    }
}
