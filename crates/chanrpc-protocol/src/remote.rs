use std::fmt;

use serde_json::json;

/// Error payload reserved for "no handler for this method".
pub const METHOD_NOT_REGISTERED: &str = "$$METHOD_NOT_REGISTERED";

/// An application error as carried by an `Error` wire message.
///
/// Errors that have a message round-trip with their name and optional stack.
/// Anything else a handler rejected with is kept as the raw JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Thrown(serde_json::Value),
}

impl RemoteError {
    /// A plain `Error` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        RemoteError::Error {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace (no-op for thrown values).
    pub fn with_stack(mut self, trace: impl Into<String>) -> Self {
        if let RemoteError::Error { stack, .. } = &mut self {
            *stack = Some(trace.into());
        }
        self
    }

    /// The "method not registered" sentinel.
    pub fn method_not_registered() -> Self {
        RemoteError::Thrown(serde_json::Value::String(METHOD_NOT_REGISTERED.to_string()))
    }

    pub fn is_method_not_registered(&self) -> bool {
        matches!(self, RemoteError::Thrown(serde_json::Value::String(s)) if s == METHOD_NOT_REGISTERED)
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            RemoteError::Error { message, .. } => message.clone(),
            RemoteError::Thrown(serde_json::Value::String(s)) => s.clone(),
            RemoteError::Thrown(other) => other.to_string(),
        }
    }

    /// Stable string form sent on the wire.
    pub fn stringify(&self) -> String {
        let json = match self {
            RemoteError::Error {
                name,
                message,
                stack,
            } => json!({
                "$isError": true,
                "name": name,
                "message": message,
                "stack": stack,
            }),
            RemoteError::Thrown(value) => value.clone(),
        };
        json.to_string()
    }

    /// Inverse of [`RemoteError::stringify`]. Content that is not JSON is
    /// taken as a thrown string.
    pub fn parse(content: &str) -> Self {
        let json: serde_json::Value = match serde_json::from_str(content) {
            Ok(json) => json,
            Err(_) => return RemoteError::Thrown(serde_json::Value::String(content.to_string())),
        };
        let is_error = json
            .get("$isError")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !is_error {
            return RemoteError::Thrown(json);
        }
        let field = |key: &str| json.get(key).and_then(serde_json::Value::as_str).map(str::to_string);
        RemoteError::Error {
            name: field("name").unwrap_or_else(|| "Error".to_string()),
            message: field("message").unwrap_or_default(),
            stack: field("stack"),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Error { name, message, .. } if name == "Error" => f.write_str(message),
            RemoteError::Error { name, message, .. } => write!(f, "{name}: {message}"),
            RemoteError::Thrown(_) => f.write_str(&self.message()),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        RemoteError::new(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        RemoteError::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_round_trip_with_stack() {
        let err = RemoteError::new("boom").with_stack("at handler (main.rs:1)");
        let parsed = RemoteError::parse(&err.stringify());
        assert_eq!(parsed, err);
        assert_eq!(parsed.to_string(), "boom");
    }

    #[test]
    fn thrown_values_round_trip() {
        let thrown = RemoteError::Thrown(json!("plain string"));
        assert_eq!(RemoteError::parse(&thrown.stringify()), thrown);

        let object = RemoteError::Thrown(json!({ "code": 7 }));
        assert_eq!(RemoteError::parse(&object.stringify()), object);
    }

    #[test]
    fn non_json_content_is_a_thrown_string() {
        let parsed = RemoteError::parse("not json {");
        assert_eq!(parsed.message(), "not json {");
    }

    #[test]
    fn sentinel_is_recognized() {
        let sentinel = RemoteError::parse(&RemoteError::method_not_registered().stringify());
        assert!(sentinel.is_method_not_registered());
        assert!(!RemoteError::new(METHOD_NOT_REGISTERED).is_method_not_registered());
    }

    #[test]
    fn named_errors_display_their_name() {
        let err = RemoteError::Error {
            name: "TypeError".into(),
            message: "bad".into(),
            stack: None,
        };
        assert_eq!(err.to_string(), "TypeError: bad");
    }
}
