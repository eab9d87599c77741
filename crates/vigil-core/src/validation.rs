//! Validation for supervisor configuration.

use serde::{Deserialize, Serialize};

use crate::config::VigilConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for VigilConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.agent.interpreter.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "agent.interpreter.empty",
                message: "agent interpreter must not be empty".to_string(),
            });
        }

        if self.agent.run_script.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "agent.run_script.empty",
                message: "run_script must not be empty".to_string(),
            });
        }

        if self.supervisor.rolling_buffer_bytes == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "supervisor.rolling_buffer.zero",
                message: "rolling_buffer_bytes must be greater than zero".to_string(),
            });
        }

        if self.merge.timeout_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "merge.timeout.zero",
                message: "merge timeout cannot be 0".to_string(),
            });
        }

        if self.merge.success_markers.iter().all(|m| m.trim().is_empty()) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "merge.success_markers.empty",
                message: "no merge success markers; timed out merges will always be reported as failed"
                    .to_string(),
            });
        }

        if self.session.capture_interval_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "session.capture_interval.zero",
                message: "capture_interval_ms must be greater than zero".to_string(),
            });
        }

        if self.session.capture_max_attempts == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "session.capture_attempts.zero",
                message: "capture_max_attempts is 0; agent session ids will never be captured"
                    .to_string(),
            });
        }

        for key in self.env.keys() {
            if key.trim().is_empty() || key.contains('=') {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "env.key.invalid",
                    message: format!("invalid environment variable name '{key}'"),
                });
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::{Validate, ValidationLevel};
    use crate::config::VigilConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(VigilConfig::default().validate().is_empty());
    }

    #[test]
    fn zero_timeout_and_buffer_are_errors() {
        let mut config = VigilConfig::default();
        config.merge.timeout_secs = 0;
        config.supervisor.rolling_buffer_bytes = 0;

        let issues = config.validate();
        let codes = issues.iter().map(|issue| issue.code).collect::<Vec<_>>();
        assert!(codes.contains(&"merge.timeout.zero"));
        assert!(codes.contains(&"supervisor.rolling_buffer.zero"));
        assert!(issues
            .iter()
            .all(|issue| issue.level == ValidationLevel::Error));
    }

    #[test]
    fn empty_markers_warn() {
        let mut config = VigilConfig::default();
        config.merge.success_markers.clear();

        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "merge.success_markers.empty");
        assert_eq!(issues[0].level, ValidationLevel::Warning);
    }

    #[test]
    fn invalid_env_key_is_reported() {
        let mut config = VigilConfig::default();
        config.env.insert("A=B".to_string(), "x".to_string());

        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.code == "env.key.invalid"));
    }
}
