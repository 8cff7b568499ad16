//! Salt CLI bus implementation.
//!
//! Shells out to `salt` / `salt-run` with `--out=json --static` and parses
//! the JSON documents they print. Asynchronous launches use `cmd.run_all`
//! through `salt --async`; outcomes are collected with
//! `salt-run jobs.lookup_jid` and liveness with `salt-run jobs.active`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::TargetType;
use crate::error::DispatchError;

use super::{BusJobRef, BusOutcome, BusPoll, RemoteBus, SyncInvocation};

#[derive(Debug, Clone)]
pub struct SaltCliBus {
    salt_bin: String,
    runner_bin: String,
    poll_interval: Duration,
}

impl Default for SaltCliBus {
    fn default() -> Self {
        Self {
            salt_bin: "salt".to_string(),
            runner_bin: "salt-run".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl SaltCliBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn target_flag(target_type: TargetType) -> Option<&'static str> {
        match target_type {
            TargetType::Glob => None,
            TargetType::Pcre => Some("--pcre"),
            TargetType::List => Some("--list"),
            TargetType::Grain => Some("--grain"),
            TargetType::GrainPcre => Some("--grain-pcre"),
            TargetType::Pillar => Some("--pillar"),
            TargetType::PillarPcre => Some("--pillar-pcre"),
            TargetType::Nodegroup => Some("--nodegroup"),
            TargetType::Range => Some("--range"),
            TargetType::Compound => Some("--compound"),
            TargetType::Ipcidr => Some("--ipcidr"),
        }
    }

    async fn run_json(
        &self,
        bin: &str,
        args: &[String],
    ) -> Result<serde_json::Value, DispatchError> {
        debug!(bin, ?args, "bus command");
        let output = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::Submit(format!(
                "{bin} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| DispatchError::Poll(format!("unparseable {bin} output: {e}")))
    }

    fn outcome_from_value(value: &serde_json::Value) -> BusOutcome {
        // cmd.run_all returns {pid, retcode, stdout, stderr}; a minion-side
        // failure can surface as a bare string instead.
        match value {
            serde_json::Value::Object(map) => BusOutcome {
                retcode: map
                    .get("retcode")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(255) as i32,
                stdout: map
                    .get("stdout")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                stderr: map
                    .get("stderr")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            other => BusOutcome {
                retcode: 255,
                stdout: String::new(),
                stderr: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl RemoteBus for SaltCliBus {
    async fn resolve_targets(
        &self,
        expr: &str,
        target_type: TargetType,
    ) -> Result<Vec<String>, DispatchError> {
        let mut args = vec!["--out=json".to_string(), "--static".to_string()];
        if let Some(flag) = Self::target_flag(target_type) {
            args.push(flag.to_string());
        }
        args.push(expr.to_string());
        args.push("test.ping".to_string());

        let doc = self
            .run_json(&self.salt_bin, &args)
            .await
            .map_err(|e| DispatchError::TargetResolution(e.to_string()))?;
        let map = doc
            .as_object()
            .ok_or_else(|| DispatchError::TargetResolution("expected a JSON object".into()))?;
        Ok(map.keys().cloned().collect())
    }

    async fn submit_detached(
        &self,
        targets: &[String],
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<BusJobRef, DispatchError> {
        let env_json = serde_json::to_string(env)
            .map_err(|e| DispatchError::Submit(format!("env serialisation: {e}")))?;
        let args = vec![
            "--out=json".to_string(),
            "--static".to_string(),
            "--async".to_string(),
            "--list".to_string(),
            targets.join(","),
            "cmd.run_all".to_string(),
            command.to_string(),
            format!("env={env_json}"),
        ];

        let doc = self.run_json(&self.salt_bin, &args).await?;
        let jid = doc
            .get("jid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DispatchError::Submit("bus returned no job id".into()))?
            .to_string();
        let minions = doc
            .get("minions")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| targets.to_vec());
        Ok(BusJobRef { jid, minions })
    }

    async fn poll(&self, job: &BusJobRef) -> Result<BusPoll, DispatchError> {
        let lookup = vec![
            "--out=json".to_string(),
            "jobs.lookup_jid".to_string(),
            job.jid.clone(),
        ];
        let doc = self
            .run_json(&self.runner_bin, &lookup)
            .await
            .map_err(|e| DispatchError::Poll(e.to_string()))?;

        let mut outcomes = HashMap::new();
        if let Some(map) = doc.as_object() {
            for (machine, value) in map {
                outcomes.insert(machine.clone(), Self::outcome_from_value(value));
            }
        }

        let active = vec!["--out=json".to_string(), "jobs.active".to_string()];
        let active_doc = self
            .run_json(&self.runner_bin, &active)
            .await
            .map_err(|e| DispatchError::Poll(e.to_string()))?;
        let finished = !active_doc
            .as_object()
            .map(|m| m.contains_key(&job.jid))
            .unwrap_or(false);

        Ok(BusPoll { outcomes, finished })
    }

    async fn run_sync(
        &self,
        targets: &[String],
        invocation: &SyncInvocation,
    ) -> Result<HashMap<String, BusOutcome>, DispatchError> {
        let mut args = vec![
            "--out=json".to_string(),
            "--static".to_string(),
            format!("--timeout={}", invocation.timeout),
            "--list".to_string(),
            targets.join(","),
            "cmd.run_all".to_string(),
            invocation.command.clone(),
        ];
        if let Some(cwd) = &invocation.cwd {
            args.push(format!("cwd={cwd}"));
        }
        if let Some(user) = &invocation.user {
            args.push(format!("runas={user}"));
        }

        let doc = self.run_json(&self.salt_bin, &args).await?;
        let map = doc
            .as_object()
            .ok_or_else(|| DispatchError::Poll("expected a JSON object".into()))?;
        Ok(map
            .iter()
            .map(|(machine, value)| (machine.clone(), Self::outcome_from_value(value)))
            .collect())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_non_glob_type_has_a_flag() {
        for tt in [
            TargetType::Pcre,
            TargetType::List,
            TargetType::Grain,
            TargetType::GrainPcre,
            TargetType::Pillar,
            TargetType::PillarPcre,
            TargetType::Nodegroup,
            TargetType::Range,
            TargetType::Compound,
            TargetType::Ipcidr,
        ] {
            assert!(SaltCliBus::target_flag(tt).is_some(), "{tt:?}");
        }
        assert!(SaltCliBus::target_flag(TargetType::Glob).is_none());
    }

    #[test]
    fn outcome_parses_cmd_run_all_shape() {
        let value = serde_json::json!({
            "pid": 4242,
            "retcode": 127,
            "stdout": "",
            "stderr": "sh: /usr/local/bin/saltpeter: No such file or directory"
        });
        let outcome = SaltCliBus::outcome_from_value(&value);
        assert_eq!(outcome.retcode, 127);
        assert!(outcome.stderr.contains("No such file or directory"));
    }

    #[test]
    fn bare_string_outcome_maps_to_255() {
        let value = serde_json::json!("Minion did not return. [No response]");
        let outcome = SaltCliBus::outcome_from_value(&value);
        assert_eq!(outcome.retcode, 255);
        assert!(outcome.stderr.contains("did not return"));
    }
}
