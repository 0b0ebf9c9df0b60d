use refuse::{ContainsNoRefs, NoMapping};

/// The payload of an error value: a message, usually prefixed with the
/// source location that raised it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Exception {
    message: String,
}

impl Exception {
    /// Returns a new exception with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message of this exception.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ContainsNoRefs for Exception {}

impl NoMapping for Exception {}
