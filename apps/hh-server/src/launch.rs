use std::collections::BTreeMap;
use std::path::PathBuf;

use hh_core::{AppManifest, AppRecord, Config, LaunchSpec};

/// Builds launch specs. Only the capabilities a manifest asks for reach the command line.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    pub interpreter: String,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub broker_url: String,
}

impl LaunchContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interpreter: config.launch.interpreter.clone(),
            data_dir: config.data_dir.clone(),
            logs_dir: config.logs_dir.clone(),
            broker_url: config.broker.url.clone(),
        }
    }

    pub fn log_file(&self, app_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{app_id}.log"))
    }

    pub fn app_data_dir(&self, app_id: &str) -> PathBuf {
        self.data_dir.join(app_id)
    }

    /// `<interpreter> <main_file> --port P [--broker-url U] [--data-dir D] [--logs-dir L]`
    pub fn service_spec(
        &self,
        record: &AppRecord,
        manifest: &AppManifest,
        port: u16,
    ) -> LaunchSpec {
        let mut args = vec![
            manifest.main_file.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        let caps = &manifest.capabilities;
        if caps.needs_broker {
            args.push("--broker-url".into());
            args.push(self.broker_url.clone());
        }
        if caps.needs_data_dir {
            args.push("--data-dir".into());
            args.push(self.app_data_dir(&record.app_id).display().to_string());
        }
        if caps.needs_logs_dir {
            args.push("--logs-dir".into());
            args.push(self.logs_dir.display().to_string());
        }
        LaunchSpec {
            app_id: record.app_id.clone(),
            program: self.interpreter.clone(),
            args,
            workdir: record.path.clone(),
            log_file: Some(self.log_file(&record.app_id)),
            env: BTreeMap::new(),
        }
    }

    /// `<interpreter> -m streamlit run <main_file> --server.port P --server.headless true`
    pub fn interactive_spec(
        &self,
        record: &AppRecord,
        manifest: &AppManifest,
        port: u16,
    ) -> LaunchSpec {
        let args = [
            "-m",
            "streamlit",
            "run",
            manifest.main_file.as_str(),
            "--server.port",
            &port.to_string(),
            "--server.headless",
            "true",
            "--browser.gatherUsageStats",
            "false",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        LaunchSpec {
            app_id: record.app_id.clone(),
            program: self.interpreter.clone(),
            args,
            workdir: record.path.clone(),
            log_file: Some(self.log_file(&record.app_id)),
            env: BTreeMap::new(),
        }
    }

    /// Creates the directories a launch spec refers to.
    pub async fn prepare_dirs(&self, manifest: &AppManifest, app_id: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.logs_dir).await?;
        if manifest.capabilities.needs_data_dir {
            tokio::fs::create_dir_all(self.app_data_dir(app_id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manifest_json, service_record_with};
    use serde_json::json;

    fn context() -> LaunchContext {
        LaunchContext {
            interpreter: "python3".into(),
            data_dir: PathBuf::from("/data"),
            logs_dir: PathBuf::from("/logs"),
            broker_url: "redis://localhost:6379/0".into(),
        }
    }

    #[test]
    fn minimal_service_gets_only_its_port() {
        let record = service_record_with("plain", manifest_json("service", json!({})));
        let manifest = record.manifest.clone().unwrap();
        let spec = context().service_spec(&record, &manifest, 8105);
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["main.py", "--port", "8105"]);
        assert_eq!(spec.log_file, Some(PathBuf::from("/logs/plain.log")));
    }

    #[test]
    fn requested_capabilities_add_arguments() {
        let record = service_record_with(
            "full",
            manifest_json(
                "service",
                json!({"redis_required": true, "data_dir": true, "logs_dir": true}),
            ),
        );
        let manifest = record.manifest.clone().unwrap();
        let spec = context().service_spec(&record, &manifest, 8100);
        assert_eq!(
            spec.args,
            vec![
                "main.py",
                "--port",
                "8100",
                "--broker-url",
                "redis://localhost:6379/0",
                "--data-dir",
                "/data/full",
                "--logs-dir",
                "/logs",
            ]
        );
    }

    #[test]
    fn interactive_apps_run_headless_on_the_slot_port() {
        let record = service_record_with("dash", manifest_json("interactive", json!({})));
        let manifest = record.manifest.clone().unwrap();
        let spec = context().interactive_spec(&record, &manifest, 8501);
        assert_eq!(&spec.args[..4], &["-m", "streamlit", "run", "main.py"]);
        assert!(spec.args.windows(2).any(|w| w == ["--server.port", "8501"]));
        assert!(spec.args.windows(2).any(|w| w == ["--server.headless", "true"]));
    }
}
