use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::browser::{BrowserResult, HarvestPage};
use crate::config::{timeout_keys, TimeoutTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    AlreadyAuthenticated,
    JustAuthenticated,
    Failed,
}

impl LoginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStatus::AlreadyAuthenticated => "already_authenticated",
            LoginStatus::JustAuthenticated => "just_authenticated",
            LoginStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLoginStatus(pub String);

impl fmt::Display for UnknownLoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown login status `{}`", self.0)
    }
}

impl std::error::Error for UnknownLoginStatus {}

impl FromStr for LoginStatus {
    type Err = UnknownLoginStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "already_authenticated" | "already_logged_in" => Ok(LoginStatus::AlreadyAuthenticated),
            "just_authenticated" | "logged_in" => Ok(LoginStatus::JustAuthenticated),
            "failed" | "login_failed" | "error" => Ok(LoginStatus::Failed),
            _ => Err(UnknownLoginStatus(raw.to_string())),
        }
    }
}

/// Raw value returned by the login script.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginReport {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub status: LoginStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_code: Option<String>,
}

impl LoginOutcome {
    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: LoginStatus::Failed,
            message: message.into(),
            diagnostic_code: Some(code.to_string()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status != LoginStatus::Failed
    }

    /// Classifies a script result. Never fails: anything unexpected becomes a
    /// `Failed` outcome carrying a diagnostic code.
    pub fn from_script_value(value: Value) -> Self {
        let report: LoginReport = match serde_json::from_value(value) {
            Ok(report) => report,
            Err(err) => {
                return LoginOutcome::failed(
                    "malformed_report",
                    format!("login script returned an unexpected value: {err}"),
                )
            }
        };
        let message = report.message.unwrap_or_default();
        let raw_status = match report.status {
            Some(status) => status,
            None if report.success => {
                return LoginOutcome::failed("unknown_status", "login script reported no status")
            }
            None => "failed".to_string(),
        };
        match raw_status.parse::<LoginStatus>() {
            Ok(LoginStatus::Failed) => LoginOutcome::failed(&raw_status, message),
            Ok(_) if !report.success => LoginOutcome::failed("login_failed", message),
            Ok(status) => LoginOutcome {
                status,
                message,
                diagnostic_code: None,
            },
            Err(err) => LoginOutcome::failed("unknown_status", err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginTransition {
    Proceed { settle: Duration, reinject: bool },
    Abort,
}

#[derive(Debug, Clone)]
pub struct LoginStateMachine {
    script: String,
    script_timeout: Duration,
    settle: Duration,
    redirect_settle: Duration,
}

impl LoginStateMachine {
    pub fn new(script: impl Into<String>, timeouts: &TimeoutTable) -> Self {
        Self {
            script: script.into(),
            script_timeout: timeouts.duration(timeout_keys::LOGIN_SCRIPT),
            settle: timeouts.duration(timeout_keys::SETTLE),
            redirect_settle: timeouts.duration(timeout_keys::LOGIN_REDIRECT),
        }
    }

    /// Runs the login script once. Transport errors and script exceptions are
    /// returned as errors; every value the script resolves to is classified.
    pub async fn run<P>(&self, page: &P) -> BrowserResult<LoginOutcome>
    where
        P: HarvestPage + ?Sized,
    {
        info!(timeout_ms = self.script_timeout.as_millis() as u64, "running login script");
        let value = page.evaluate(&self.script, self.script_timeout).await?;
        let outcome = LoginOutcome::from_script_value(value);
        match outcome.status {
            LoginStatus::Failed => warn!(
                code = outcome.diagnostic_code.as_deref().unwrap_or("-"),
                message = %outcome.message,
                "login failed"
            ),
            status => info!(status = %status, message = %outcome.message, "login finished"),
        }
        Ok(outcome)
    }

    pub fn transition(&self, outcome: &LoginOutcome) -> LoginTransition {
        match outcome.status {
            LoginStatus::AlreadyAuthenticated => LoginTransition::Proceed {
                settle: self.settle,
                reinject: false,
            },
            LoginStatus::JustAuthenticated => LoginTransition::Proceed {
                settle: self.redirect_settle,
                reinject: true,
            },
            LoginStatus::Failed => LoginTransition::Abort,
        }
    }
}
