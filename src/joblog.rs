//! Per-job result logs.
//!
//! Each job gets an append-only `{logdir}/{job_name}.log`. One record is
//! written per instance, carrying every target's exit code and aggregated
//! output, in the layout operators already grep for.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use crate::state::TargetResult;

#[derive(Debug, Clone)]
pub struct JobLog {
    dir: PathBuf,
}

impl JobLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// One aggregated record for a finished instance.
    pub fn write_instance(
        &self,
        job_name: &str,
        instance: &str,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        results: &HashMap<String, TargetResult>,
    ) -> Result<()> {
        let mut record = format!("###### Starting {instance} at {started} ################\n");
        for (machine, result) in results {
            let code = result.retcode.unwrap_or(-1);
            let endtime = result
                .endtime
                .map(|t| t.to_string())
                .unwrap_or_default();
            record.push_str(&format!(
                "########## {machine} from {instance} ################\n\
                 **** Exit Code {code} ******\n\
                 {}\n\
                 ####### END {machine} from {instance} at {endtime} #########\n",
                result.output
            ));
        }
        record.push_str(&format!(
            "###### Finished {instance} at {finished} ################\n"
        ));
        self.append(job_name, &record)
    }

    /// Marker for a dispatch whose target resolution came back empty.
    pub fn write_no_targets(&self, job_name: &str, instance: &str) -> Result<()> {
        self.append(
            job_name,
            &format!("!!!!!! No targets matched for {instance} !!!!!!\n"),
        )
    }

    fn append(&self, job_name: &str, record: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating log directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("{job_name}.log"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(record.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_record_contains_every_target() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path());

        let mut results = HashMap::new();
        results.insert(
            "m1".to_string(),
            TargetResult {
                retcode: Some(0),
                endtime: Some(Utc::now()),
                output: "hi\n".to_string(),
                ..TargetResult::default()
            },
        );
        results.insert(
            "m2".to_string(),
            TargetResult {
                retcode: Some(253),
                endtime: Some(Utc::now()),
                output: "[SALTPETER ERROR: no heartbeat for 16 seconds]".to_string(),
                ..TargetResult::default()
            },
        );

        log.write_instance("echo", "echo_1700000000", Utc::now(), Utc::now(), &results)
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("echo.log")).unwrap();
        assert!(text.contains("###### Starting echo_1700000000"));
        assert!(text.contains("**** Exit Code 0 ******"));
        assert!(text.contains("**** Exit Code 253 ******"));
        assert!(text.contains("no heartbeat"));
        assert!(text.contains("###### Finished echo_1700000000"));
    }

    #[test]
    fn records_append_rather_than_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path());
        log.write_no_targets("j", "j_1").unwrap();
        log.write_no_targets("j", "j_2").unwrap();
        let text = std::fs::read_to_string(dir.path().join("j.log")).unwrap();
        assert!(text.contains("j_1"));
        assert!(text.contains("j_2"));
    }
}
