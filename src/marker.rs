//! Line-oriented marker protocol over child output.
//!
//! The parser is stateless and total: every line yields either one marker
//! event or none. A line is a marker only when, after leading whitespace is
//! trimmed, it starts with one of the marker prefixes and the remainder
//! after the colon is non-empty.
//!
//! ```text
//! STEP_START:<name>[ '[' key=value (',' key=value)* ']' ]
//! STEP_COMPLETE:<name>
//! STEP_ERROR:<description>
//! ARTIFACT:<path>:<description>
//! META:<key>:<value>
//! ```

use serde_json::Value;

/// Options recognized on a STEP_START marker.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    pub stop_on_error: bool,
    /// Unrecognized `key=value` options, retained in the step's metadata.
    pub extra: serde_json::Map<String, Value>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    StepStart { name: String, options: StepOptions },
    StepComplete { name: String },
    StepError { description: String },
    Artifact { path: String, description: String },
    Meta { key: String, value: String },
}

impl MarkerEvent {
    /// Role string recorded on the raw log entry for a marker line.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StepStart { .. } => "step_start",
            Self::StepComplete { .. } => "step_complete",
            Self::StepError { .. } => "step_error",
            Self::Artifact { .. } => "artifact",
            Self::Meta { .. } => "meta",
        }
    }
}

/// Parse one line of child output. Returns `None` for ordinary output.
pub fn parse_line(line: &str) -> Option<MarkerEvent> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("STEP_START:") {
        return parse_step_start(rest.trim());
    }
    if let Some(rest) = line.strip_prefix("STEP_COMPLETE:") {
        let name = rest.trim();
        if name.is_empty() {
            return None;
        }
        return Some(MarkerEvent::StepComplete {
            name: name.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("STEP_ERROR:") {
        let description = rest.trim();
        if description.is_empty() {
            return None;
        }
        return Some(MarkerEvent::StepError {
            description: description.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("ARTIFACT:") {
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        // Split on the first ':' after the path; later colons belong to
        // the description.
        let (path, description) = match rest.split_once(':') {
            Some((p, d)) => (p.trim(), d.trim()),
            None => (rest, ""),
        };
        if path.is_empty() {
            return None;
        }
        return Some(MarkerEvent::Artifact {
            path: path.to_string(),
            description: description.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("META:") {
        let rest = rest.trim();
        let (key, value) = rest.split_once(':')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        return Some(MarkerEvent::Meta {
            key: key.to_string(),
            value: value.trim().to_string(),
        });
    }

    None
}

fn parse_step_start(rest: &str) -> Option<MarkerEvent> {
    if rest.is_empty() {
        return None;
    }

    let (name, options) = match (rest.rfind('['), rest.ends_with(']')) {
        (Some(open), true) => {
            let name = rest[..open].trim();
            let body = &rest[open + 1..rest.len() - 1];
            (name, parse_options(body))
        }
        _ => (rest, StepOptions::default()),
    };

    if name.is_empty() {
        return None;
    }

    Some(MarkerEvent::StepStart {
        name: name.to_string(),
        options,
    })
}

fn parse_options(body: &str) -> StepOptions {
    let mut options = StepOptions::default();
    for pair in body.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }
        if key == "stop_on_error" {
            options.stop_on_error = value.eq_ignore_ascii_case("true");
        } else {
            options.extra.insert(key.to_string(), coerce(value));
        }
    }
    options
}

/// Coerce an option value to bool/integer/float where it parses as one.
fn coerce(value: &str) -> Value {
    if value.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(value.to_string())
}
