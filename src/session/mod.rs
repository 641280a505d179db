//! Session layout and trial persistence.
//!
//! A session is one subject's run of one protocol. Its data lives at
//! `<data_root>/<subject>/<YYYY-MM-DD>/<NNN>/raw_task_data_00`, where
//! `NNN` is a zero-padded ordinal scanned from what is already on disk.
//! Trial records are appended to a JSON-lines file as each trial
//! completes; nothing is ever rewritten, so a power cut costs at most the
//! trial in flight. The full settings snapshot is written twice: once at
//! session creation (so a crashed session is still interpretable) and once
//! at the end with the completion status filled in.
//!
//! Operator control uses filesystem markers in the session directory:
//! touching `.pause` holds the session between trials until the file is
//! removed, touching `.stop` ends it cleanly at the next trial boundary.
//! A zero-byte `.new_trial` marker is re-touched after every persisted
//! trial for external watchers.

pub mod collaborators;
pub mod runner;

use crate::config::RigConfig;
use crate::device::transport::RawTrialData;
use crate::error::RigResult;
use crate::protocol::{Outcome, TrialParams};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const RAW_DATA_DIR: &str = "raw_task_data_00";
const TRIAL_DATA_FILE: &str = "task_data.jsonl";
const SETTINGS_FILE: &str = "task_settings.json";
const STOP_MARKER: &str = ".stop";
const PAUSE_MARKER: &str = ".pause";
const NEW_TRIAL_MARKER: &str = ".new_trial";

/// Identity of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub subject: String,
    pub started_at: DateTime<Utc>,
    /// Ordinal of this session within the subject's day, from 1. Zero
    /// until the session directory has been created.
    #[serde(default)]
    pub session_number: u32,
}

impl SessionInfo {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            started_at: Utc::now(),
            session_number: 0,
        }
    }
}

/// Resolved on-disk layout of one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    session_dir: PathBuf,
    raw_data_dir: PathBuf,
    ordinal: u32,
}

impl SessionPaths {
    /// Create the next session directory for `subject` under `data_root`
    /// and its raw-data subdirectory.
    pub fn create(data_root: &Path, subject: &str, date: NaiveDate) -> RigResult<Self> {
        let date_dir = data_root.join(subject).join(date.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&date_dir)?;
        let ordinal = Self::next_ordinal(&date_dir)?;
        let session_dir = date_dir.join(format!("{ordinal:03}"));
        let raw_data_dir = session_dir.join(RAW_DATA_DIR);
        fs::create_dir_all(&raw_data_dir)?;
        info!(path = %session_dir.display(), "session directory created");
        Ok(Self {
            session_dir,
            raw_data_dir,
            ordinal,
        })
    }

    /// Ordinal of this session within the subject's day, from 1.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Smallest ordinal not yet taken under the date directory. Gaps left
    /// by deleted sessions are not reused below the maximum.
    fn next_ordinal(date_dir: &Path) -> RigResult<u32> {
        let mut next = 1;
        for entry in fs::read_dir(date_dir)? {
            let entry = entry?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                next = next.max(n + 1);
            }
        }
        Ok(next)
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn raw_data_dir(&self) -> &Path {
        &self.raw_data_dir
    }

    pub fn trial_data_file(&self) -> PathBuf {
        self.raw_data_dir.join(TRIAL_DATA_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.raw_data_dir.join(SETTINGS_FILE)
    }

    pub fn stop_marker(&self) -> PathBuf {
        self.session_dir.join(STOP_MARKER)
    }

    pub fn pause_marker(&self) -> PathBuf {
        self.session_dir.join(PAUSE_MARKER)
    }

    pub fn new_trial_marker(&self) -> PathBuf {
        self.session_dir.join(NEW_TRIAL_MARKER)
    }

    /// Whether a stop has been requested. Observing the request consumes
    /// the marker so the next session starts clean.
    pub fn take_stop_request(&self) -> bool {
        let marker = self.stop_marker();
        if marker.exists() {
            let _ = fs::remove_file(&marker);
            true
        } else {
            false
        }
    }

    /// The pause marker is left in place; the operator removes it to
    /// resume.
    pub fn pause_requested(&self) -> bool {
        self.pause_marker().exists()
    }
}

/// Everything persisted about one completed trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_index: usize,
    pub started_at: DateTime<Utc>,
    pub params: TrialParams,
    pub outcome: Outcome,
    /// Reward actually delivered this trial, in microliters.
    pub reward_ul: f64,
    /// Valve-open seconds the calibration curve derived for the trial's
    /// reward amount.
    pub valve_open_secs: f64,
    /// Wheel positions sampled each display tick during the trial, in
    /// degrees.
    #[serde(default)]
    pub position_samples: Vec<f64>,
    pub raw: RawTrialData,
}

/// Append-only JSON-lines writer for trial records.
pub struct TrialStore {
    file: File,
    marker: PathBuf,
}

impl TrialStore {
    pub fn open(paths: &SessionPaths) -> RigResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.trial_data_file())?;
        Ok(Self {
            file,
            marker: paths.new_trial_marker(),
        })
    }

    /// Persist one record: a single line, flushed before the notify
    /// marker is touched.
    pub fn append(&mut self, record: &TrialRecord) -> RigResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        File::create(&self.marker)?;
        Ok(())
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Complete,
    Stopped,
    Failed,
}

/// Running totals written into the final settings snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionTotals {
    pub trials_completed: usize,
    pub trials_correct: usize,
    pub reward_ul: f64,
}

impl SessionTotals {
    pub fn from_records(records: &[TrialRecord]) -> Self {
        Self {
            trials_completed: records.len(),
            trials_correct: records
                .iter()
                .filter(|r| r.outcome == Outcome::Correct)
                .count(),
            reward_ul: records.iter().map(|r| r.reward_ul).sum(),
        }
    }
}

/// The settings snapshot written alongside the trial data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub info: SessionInfo,
    pub status: SessionStatus,
    pub totals: SessionTotals,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RigConfig,
}

impl SessionSettings {
    pub fn new(info: SessionInfo, config: RigConfig) -> Self {
        Self {
            info,
            status: SessionStatus::Running,
            totals: SessionTotals::default(),
            ended_at: None,
            config,
        }
    }

    pub fn write(&self, paths: &SessionPaths) -> RigResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(paths.settings_file(), json)?;
        Ok(())
    }

    /// Record the terminal status and rewrite the snapshot.
    pub fn finalize(
        &mut self,
        paths: &SessionPaths,
        status: SessionStatus,
        totals: SessionTotals,
    ) -> RigResult<()> {
        self.status = status;
        self.totals = totals;
        self.ended_at = Some(Utc::now());
        self.write(paths)
    }
}

/// Read all trial records back from a session's data file.
pub fn read_trial_records(paths: &SessionPaths) -> RigResult<Vec<TrialRecord>> {
    let text = fs::read_to_string(paths.trial_data_file())?;
    let mut records = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
