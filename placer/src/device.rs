// device.rs — Structured device specifications
//
// Parses device strings such as `/job:worker/replica:0/task:1/device:GPU:0`,
// legacy `/cpu:0`, or slash-less `cpu:0` into a `DeviceSpec` whose fields may
// each be unspecified. Two specs are compatible when every field named by
// both carries the same value; compatible specs merge field-wise.
//
// Preconditions: none.
// Postconditions: device types are upper-cased; `*` parses as "unspecified".
// Failure modes: malformed strings produce `DeviceParseError`.
// Side effects: none.

use std::fmt;
use std::str::FromStr;

use logos::Logos;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Device spec ─────────────────────────────────────────────────────────────

/// A possibly-partial device name. Unset fields match any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceSpec {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    pub index: Option<u32>,
}

/// Why a device string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceParseError {
    #[error("invalid device '{text}': unexpected character at offset {offset}")]
    Lex { text: String, offset: usize },
    #[error("invalid device '{text}': {reason}")]
    Malformed { text: String, reason: String },
}

impl DeviceSpec {
    /// Parse a device string. The empty string is the fully unspecified spec.
    pub fn parse(text: &str) -> Result<Self, DeviceParseError> {
        let tokens = lex_device(text)?;
        parse_components(text, &tokens)
    }

    /// `/device:CPU:<index>`.
    pub fn cpu(index: u32) -> Self {
        DeviceSpec {
            device_type: Some("CPU".to_string()),
            index: Some(index),
            ..Default::default()
        }
    }

    /// `/device:GPU:<index>`.
    pub fn gpu(index: u32) -> Self {
        DeviceSpec {
            device_type: Some("GPU".to_string()),
            index: Some(index),
            ..Default::default()
        }
    }

    /// Builder: set the job/replica/task prefix.
    pub fn on_task(mut self, job: &str, replica: u32, task: u32) -> Self {
        self.job = Some(job.to_string());
        self.replica = Some(replica);
        self.task = Some(task);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.job.is_none()
            && self.replica.is_none()
            && self.task.is_none()
            && self.device_type.is_none()
            && self.index.is_none()
    }

    /// A spec is concrete once it names a device type.
    pub fn is_concrete(&self) -> bool {
        self.device_type.is_some()
    }

    pub fn is_type(&self, device_type: &str) -> bool {
        self.device_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(device_type))
    }

    /// True when no field is named by both specs with different values.
    pub fn is_compatible(&self, other: &DeviceSpec) -> bool {
        self.conflicting_field(other).is_none()
    }

    /// The first field on which the two specs disagree, if any.
    pub fn conflicting_field(&self, other: &DeviceSpec) -> Option<&'static str> {
        fn clash<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x != y)
        }
        if clash(&self.job, &other.job) {
            Some("job")
        } else if clash(&self.replica, &other.replica) {
            Some("replica")
        } else if clash(&self.task, &other.task) {
            Some("task")
        } else if clash(&self.device_type, &other.device_type) {
            Some("device type")
        } else if clash(&self.index, &other.index) {
            Some("device index")
        } else {
            None
        }
    }

    /// Field-wise union of two compatible specs; `None` when they conflict.
    pub fn merge(&self, other: &DeviceSpec) -> Option<DeviceSpec> {
        if !self.is_compatible(other) {
            return None;
        }
        Some(self.fill_from(other))
    }

    /// Take every field left unset here from `default`. Never overrides.
    pub fn fill_from(&self, default: &DeviceSpec) -> DeviceSpec {
        DeviceSpec {
            job: self.job.clone().or_else(|| default.job.clone()),
            replica: self.replica.or(default.replica),
            task: self.task.or(default.task),
            device_type: self
                .device_type
                .clone()
                .or_else(|| default.device_type.clone()),
            index: self.index.or(default.index),
        }
    }

    /// `inner` scoped inside `self`: fields named by `inner` win. Used for
    /// nested device scopes.
    pub fn overridden_by(&self, inner: &DeviceSpec) -> DeviceSpec {
        inner.fill_from(self)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{job}")?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{replica}")?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{task}")?;
        }
        match (&self.device_type, self.index) {
            (Some(t), Some(i)) => write!(f, "/device:{t}:{i}")?,
            (Some(t), None) => write!(f, "/device:{t}:*")?,
            (None, Some(i)) => write!(f, "/device:*:{i}")?,
            (None, None) => {}
        }
        Ok(())
    }
}

impl FromStr for DeviceSpec {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceSpec::parse(s)
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = DeviceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DeviceSpec::parse(&value)
    }
}

impl From<DeviceSpec> for String {
    fn from(spec: DeviceSpec) -> Self {
        spec.to_string()
    }
}

// ── Lexing ──────────────────────────────────────────────────────────────────

#[derive(Logos, Debug, Clone, PartialEq)]
enum DeviceToken {
    #[token("/")]
    Slash,
    #[token(":")]
    Colon,
    #[token("*")]
    Star,
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u32>().ok())]
    Int(u32),
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn lex_device(text: &str) -> Result<Vec<DeviceToken>, DeviceParseError> {
    let trimmed = text.trim();
    let offset = text.len() - text.trim_start().len();
    let mut tokens = Vec::new();
    for (result, range) in DeviceToken::lexer(trimmed).spanned() {
        match result {
            Ok(tok) => tokens.push(tok),
            Err(()) => {
                return Err(DeviceParseError::Lex {
                    text: text.to_string(),
                    offset: offset + range.start,
                })
            }
        }
    }
    Ok(tokens)
}

// ── Parsing ─────────────────────────────────────────────────────────────────

fn parse_components(text: &str, tokens: &[DeviceToken]) -> Result<DeviceSpec, DeviceParseError> {
    let malformed = |reason: String| DeviceParseError::Malformed {
        text: text.to_string(),
        reason,
    };

    let mut spec = DeviceSpec::default();
    let body = match tokens.first() {
        Some(DeviceToken::Slash) => &tokens[1..],
        _ => tokens,
    };
    if body.is_empty() {
        return Ok(spec);
    }

    let mut device_seen = false;
    for component in body.split(|t| *t == DeviceToken::Slash) {
        match component {
            [] => return Err(malformed("empty component".to_string())),
            [DeviceToken::Ident(key), DeviceToken::Colon, value] if key == "job" => {
                let job = match value {
                    DeviceToken::Ident(name) => name.clone(),
                    DeviceToken::Int(n) => n.to_string(),
                    _ => return Err(malformed("job name expected".to_string())),
                };
                set_once(&mut spec.job, job, "job").map_err(malformed)?;
            }
            [DeviceToken::Ident(key), DeviceToken::Colon, DeviceToken::Int(n)]
                if key == "replica" =>
            {
                set_once(&mut spec.replica, *n, "replica").map_err(malformed)?;
            }
            [DeviceToken::Ident(key), DeviceToken::Colon, DeviceToken::Int(n)] if key == "task" => {
                set_once(&mut spec.task, *n, "task").map_err(malformed)?;
            }
            [DeviceToken::Ident(key), DeviceToken::Colon, rest @ ..] if key == "device" => {
                if device_seen {
                    return Err(malformed("device given more than once".to_string()));
                }
                device_seen = true;
                let (device_type, index) = parse_type_and_index(rest).map_err(malformed)?;
                spec.device_type = device_type;
                spec.index = index;
            }
            // Legacy `TYPE:N` component.
            [DeviceToken::Ident(_), DeviceToken::Colon, DeviceToken::Int(_) | DeviceToken::Star] => {
                if device_seen {
                    return Err(malformed("device given more than once".to_string()));
                }
                device_seen = true;
                let (device_type, index) =
                    parse_type_and_index(component).map_err(malformed)?;
                spec.device_type = device_type;
                spec.index = index;
            }
            _ => {
                return Err(malformed(
                    "expected job:, replica:, task:, device: or TYPE:N".to_string(),
                ))
            }
        }
    }
    Ok(spec)
}

/// `TYPE`, `TYPE:N`, `TYPE:*`, `*:N`: the part after `device:`.
fn parse_type_and_index(tokens: &[DeviceToken]) -> Result<(Option<String>, Option<u32>), String> {
    let device_type = match tokens.first() {
        Some(DeviceToken::Ident(t)) => Some(t.to_ascii_uppercase()),
        Some(DeviceToken::Star) => None,
        _ => return Err("device type expected".to_string()),
    };
    let index = match &tokens[1..] {
        [] => None,
        [DeviceToken::Colon, DeviceToken::Int(n)] => Some(*n),
        [DeviceToken::Colon, DeviceToken::Star] => None,
        _ => return Err("device index expected after ':'".to_string()),
    };
    Ok((device_type, index))
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &str) -> Result<(), String> {
    if slot.is_some() {
        return Err(format!("{field} given more than once"));
    }
    *slot = Some(value);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
