//! Secret types.

use std::fmt;

/// A resolved secret.
///
/// `Debug` never prints the value; secrets stay out of logs and run state.
#[derive(Clone)]
pub struct SecretValue {
    pub value: String,
    pub masked: bool,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            masked: true,
        }
    }

    pub fn unmasked(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            masked: false,
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"***")
            .field("masked", &self.masked)
            .finish()
    }
}
