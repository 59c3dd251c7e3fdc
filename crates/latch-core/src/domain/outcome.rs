//! Outcome: the three terminal reports a handler can make.

use std::time::Duration;

use super::Variables;

/// A named, expected fault the process definition can branch on.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessError {
    pub code: String,
    pub message: String,
    pub variables: Variables,
}

impl BusinessError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            variables: Variables::new(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

/// A technical failure consuming one retry.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub message: String,
    pub details: Option<String>,

    /// New remaining-retry count; `0` raises an incident engine-side.
    pub retries: u32,

    /// Delay before the engine makes the task fetchable again.
    pub retry_timeout: Duration,
}

impl Failure {
    pub fn new(message: impl Into<String>, retries: u32, retry_timeout: Duration) -> Self {
        Self {
            message: message.into(),
            details: None,
            retries,
            retry_timeout,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// No retries left: the engine marks the task permanently failed.
    pub fn is_terminal(&self) -> bool {
        self.retries == 0
    }
}

/// Exactly one of these closes a lease from the client's side.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete { variables: Variables },
    BusinessError(BusinessError),
    Failure(Failure),
}

impl Outcome {
    pub fn complete(variables: Variables) -> Self {
        Outcome::Complete { variables }
    }

    /// Short label used in log events.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Complete { .. } => "complete",
            Outcome::BusinessError(_) => "business_error",
            Outcome::Failure(_) => "failure",
        }
    }
}

impl From<BusinessError> for Outcome {
    fn from(value: BusinessError) -> Self {
        Outcome::BusinessError(value)
    }
}

impl From<Failure> for Outcome {
    fn from(value: Failure) -> Self {
        Outcome::Failure(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_the_report_kind() {
        assert_eq!(Outcome::complete(Variables::new()).label(), "complete");
        assert_eq!(
            Outcome::from(BusinessError::new("reject", "FRAUD")).label(),
            "business_error"
        );
        let failure = Failure::new("boom", 0, Duration::from_secs(5));
        assert!(failure.is_terminal());
        assert_eq!(Outcome::from(failure).label(), "failure");
    }
}
