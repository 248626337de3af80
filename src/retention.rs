//! Size- and age-based segment eviction.
//!
//! Retention works on whole segment pairs, oldest first, and always
//! preserves the most recent pair. The writer schedules an evaluation
//! after every rollover; a dedicated runner thread executes them so the
//! write path never blocks on directory scans and deletions.

use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::directory;
use crate::store::segment;
use crate::tools;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionSpec {
    /// Keep at most this many bytes of segment data.
    MaxBytes(u64),
    /// Drop segments whose newest chunk is older than this many
    /// milliseconds.
    MaxAge(u64),
}

/// Outcome handed to the scheduler's callback.
#[derive(Clone, Debug)]
pub struct EvalResult {
    /// Remaining chunk-id range, `None` when no chunk survived.
    pub range: Option<(u64, u64)>,
    pub first_timestamp: Option<i64>,
    pub segments_left: u32,
}

fn apply_max_bytes(dir: &Path, limit: u64) -> Result<()> {
    let ids = directory::sorted_first_chunk_ids(dir)?;
    let mut cumulative = 0u64;
    let mut cut = None;
    for (pos, first_chunk_id) in ids.iter().enumerate().rev() {
        let path = directory::segment_path(dir, *first_chunk_id);
        let size = match path.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        cumulative += size;
        if cumulative > limit {
            cut = Some(pos);
            break;
        }
    }
    // the segment that tipped the budget stays; everything older goes
    if let Some(cut) = cut {
        for first_chunk_id in &ids[..cut] {
            info!("retention: size limit drops segment {:020}", first_chunk_id);
            directory::delete_pair(dir, *first_chunk_id)?;
        }
    }
    Ok(())
}

fn apply_max_age(dir: &Path, max_age_ms: u64) -> Result<()> {
    let threshold = tools::now_millis() - max_age_ms as i64;
    let ids = directory::sorted_first_chunk_ids(dir)?;
    if ids.len() < 2 {
        return Ok(());
    }
    // the newest pair is never dropped
    for first_chunk_id in &ids[..ids.len() - 1] {
        let index_path = directory::index_path(dir, *first_chunk_id);
        let index = match tools::open_read(&index_path) {
            Ok(file) => file,
            Err(_) => continue,
        };
        let newest = match segment::last_index_record(&index)? {
            Some(record) => record.timestamp,
            None => continue,
        };
        if newest >= threshold {
            break;
        }
        info!("retention: age limit drops segment {:020}", first_chunk_id);
        directory::delete_pair(dir, *first_chunk_id)?;
    }
    Ok(())
}

/// Apply the retention specs in order, then summarize what is left.
pub fn evaluate(dir: &Path, specs: &[RetentionSpec]) -> Result<EvalResult> {
    for spec in specs {
        match spec {
            RetentionSpec::MaxBytes(limit) => apply_max_bytes(dir, *limit)?,
            RetentionSpec::MaxAge(max_age_ms) => apply_max_age(dir, *max_age_ms)?,
        }
    }

    let ids = directory::sorted_first_chunk_ids(dir)?;
    let mut first = None;
    let mut first_timestamp = None;
    for first_chunk_id in &ids {
        let index_path = directory::index_path(dir, *first_chunk_id);
        let index = match tools::open_read(&index_path) {
            Ok(file) => file,
            Err(_) => continue,
        };
        if let Some(record) = segment::first_index_record(&index)? {
            first = Some(record.chunk_id);
            first_timestamp = Some(record.timestamp);
            break;
        }
    }
    let mut last = None;
    for first_chunk_id in ids.iter().rev() {
        let index_path = directory::index_path(dir, *first_chunk_id);
        let index = match tools::open_read(&index_path) {
            Ok(file) => file,
            Err(_) => continue,
        };
        if let Some(record) = segment::last_index_record(&index)? {
            last = Some(record.chunk_id);
            break;
        }
    }

    Ok(EvalResult {
        range: first.and_then(|f| last.map(|l| (f, l))),
        first_timestamp,
        segments_left: ids.len() as u32,
    })
}

pub type EvalCallback = Box<dyn FnOnce(EvalResult) + Send>;

struct Job {
    name: String,
    dir: PathBuf,
    specs: Vec<RetentionSpec>,
    callback: EvalCallback,
}

/// Background evaluation thread. Dropping the runner (and with it the
/// sender) lets the thread drain its queue and exit.
pub struct Runner {
    tx: Sender<Job>,
}

impl Runner {
    pub fn spawn() -> Self {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new()
            .name("osilog-retention".into())
            .spawn(move || {
                for job in rx.iter() {
                    debug!("retention eval for log '{}'", job.name);
                    match evaluate(&job.dir, &job.specs) {
                        Ok(result) => (job.callback)(result),
                        Err(err) => warn!("retention eval for '{}' failed: {}", job.name, err),
                    }
                }
            })
            .expect("spawning retention thread");
        Self { tx }
    }

    pub fn eval(&self, name: &str, dir: &Path, specs: &[RetentionSpec], callback: EvalCallback) {
        let job = Job {
            name: name.to_string(),
            dir: dir.to_owned(),
            specs: specs.to_vec(),
            callback,
        };
        if self.tx.send(job).is_err() {
            warn!("retention runner is gone, dropping eval for '{}'", name);
        }
    }
}
