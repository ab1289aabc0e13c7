pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_global_settings, load_settings};
pub use paths::{default_global_config_path, GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR};
pub use settings::{
    LoggingConfig, MainTenantConfig, PollConfig, Settings, WorkerConfig,
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_WORKER_TIMEOUT_SECONDS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::LogLevel;
    use std::path::PathBuf;

    fn parse(raw: &str) -> Settings {
        serde_yaml::from_str(raw).expect("parse settings")
    }

    #[test]
    fn minimal_settings_fill_defaults() {
        let settings = parse(
            r#"
state_root: /tmp/clawkeeper
main_tenant:
  id: main
  chat: "120363@g.us"
"#,
        );
        settings.validate().expect("valid");

        assert_eq!(settings.state_root, PathBuf::from("/tmp/clawkeeper"));
        assert_eq!(settings.assistant_name, "Andy");
        assert_eq!(settings.trigger_prefix(), "@Andy");
        assert_eq!(settings.main_tenant.name, "Main");
        assert_eq!(settings.worker.timeout_seconds, DEFAULT_WORKER_TIMEOUT_SECONDS);
        assert_eq!(settings.worker.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(settings.scheduler.poll_interval_ms, 60_000);
        assert_eq!(settings.ipc.poll_interval_ms, 1_000);
        assert_eq!(settings.logging.level, LogLevel::Info);
    }

    #[test]
    fn validation_rejects_traversal_in_main_tenant_id() {
        let settings = parse(
            r#"
state_root: /tmp/clawkeeper
main_tenant:
  id: ../etc
  chat: "c1"
"#,
        );
        let err = settings.validate().expect_err("invalid tenant id");
        assert!(err.to_string().contains("tenant id"), "{err}");
    }

    #[test]
    fn validation_rejects_zero_limits_and_bad_timezone() {
        let mut settings = parse(
            r#"
state_root: /tmp/clawkeeper
timezone: Europe/Berlin
main_tenant:
  id: main
  chat: "c1"
worker:
  binary: agent
  timeout_seconds: 0
"#,
        );
        let err = settings.validate().expect_err("zero timeout");
        assert!(err.to_string().contains("timeout_seconds"));

        settings.worker.timeout_seconds = 5;
        settings.worker.max_output_bytes = 0;
        assert!(settings.validate().is_err());

        settings.worker.max_output_bytes = 1024;
        settings.timezone = "Mars/Olympus_Mons".to_string();
        let err = settings.validate().expect_err("bad timezone");
        assert!(err.to_string().contains("IANA"));
    }

    #[test]
    fn validation_requires_absolute_state_root() {
        let settings = parse(
            r#"
state_root: relative/state
main_tenant:
  id: main
  chat: "c1"
"#,
        );
        assert!(settings.validate().is_err());
    }
}
