use serde::{Deserialize, Serialize};

/// The outcome taxonomy of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Normal,
    RuntimeError,
    SignalTerminate,
    SignalStop,
    UserTimeLimitExceeded,
    WallTimeLimitExceeded,
    SystemTimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    Unknown,
}

/// The report emitted as a single line of JSON on stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,

    pub exit_code: i32,

    /// Name of the terminating or stopping signal, without the SIG prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    pub wall_time_ms: u64,
    pub cpu_user_time_ms: u64,
    pub cpu_kernel_time_ms: u64,
    pub memory_usage_kib: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::WallTimeLimitExceeded).unwrap();
        assert_eq!(json, "\"WALL_TIME_LIMIT_EXCEEDED\"");

        let json = serde_json::to_string(&ExecutionStatus::RuntimeError).unwrap();
        assert_eq!(json, "\"RUNTIME_ERROR\"");
    }

    #[test]
    fn test_report_omits_absent_signal() {
        let report = ExecutionReport {
            status: ExecutionStatus::Normal,
            exit_code: 0,
            signal: None,
            wall_time_ms: 12,
            cpu_user_time_ms: 3,
            cpu_kernel_time_ms: 1,
            memory_usage_kib: 256,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("signal"));
        assert!(json.contains("\"status\":\"NORMAL\""));
    }

    #[test]
    fn test_report_includes_signal_name() {
        let report = ExecutionReport {
            status: ExecutionStatus::SignalTerminate,
            exit_code: 137,
            signal: Some("KILL".to_string()),
            wall_time_ms: 0,
            cpu_user_time_ms: 0,
            cpu_kernel_time_ms: 0,
            memory_usage_kib: 0,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"signal\":\"KILL\""));
        assert!(json.contains("\"exit_code\":137"));
    }
}
