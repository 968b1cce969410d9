use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::events::InboundEvent;
use crate::warden_io;

static SUBMIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory of pending inbound events, one JSON object per `*.json` file.
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
    processed: PathBuf,
}

impl Inbox {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: warden_io::inbox_dir(state_dir),
            processed: warden_io::processed_dir(state_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Takes every pending event in file-name order. Each file is moved to `processed/` as it
    /// is taken; unreadable files are moved there with a `.rejected` suffix.
    pub fn take(&self) -> Result<Vec<InboundEvent>> {
        warden_io::ensure_dir(&self.dir)?;
        warden_io::ensure_dir(&self.processed)?;

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list inbox {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut events = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = warden_io::read_to_string(&path).and_then(|raw| {
                serde_json::from_str::<InboundEvent>(&raw)
                    .with_context(|| format!("invalid event in {}", path.display()))
            });
            match parsed {
                Ok(event) => {
                    self.archive(&path, None)?;
                    debug!(file = %path.display(), kind = event.label(), "inbound event taken");
                    events.push(event);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %format!("{err:#}"), "rejecting inbox file");
                    self.archive(&path, Some("rejected"))?;
                }
            }
        }
        Ok(events)
    }

    fn archive(&self, path: &Path, suffix: Option<&str>) -> Result<()> {
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let mut target = self.processed.join(name);
        if let Some(suffix) = suffix {
            target.set_extension(format!("json.{suffix}"));
        }
        fs::rename(path, &target).with_context(|| {
            format!("failed to move {} to {}", path.display(), target.display())
        })
    }

    /// Writes one event into the inbox. Returns the file it landed in.
    pub fn submit(&self, event: &InboundEvent) -> Result<PathBuf> {
        let name = format!(
            "{}-{:06}-{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            SUBMIT_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000_000,
            event.label(),
            uuid::Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);
        warden_io::write_json_atomic(&path, event)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::claim::model::ClaimId;
    use crate::events::ManualReleaseEvent;

    fn release_event(reason: &str) -> InboundEvent {
        InboundEvent::ManualRelease(ManualReleaseEvent {
            claim_id: ClaimId::new(),
            reason: reason.to_string(),
        })
    }

    #[test]
    fn submitted_events_are_taken_once_in_order() {
        let dir = tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        let first = release_event("first");
        let second = release_event("second");

        inbox.submit(&first).unwrap();
        inbox.submit(&second).unwrap();

        assert_eq!(inbox.take().unwrap(), vec![first, second]);
        assert!(inbox.take().unwrap().is_empty());
        let archived = fs::read_dir(warden_io::processed_dir(dir.path()))
            .unwrap()
            .count();
        assert_eq!(archived, 2);
    }

    #[test]
    fn unreadable_files_are_set_aside() {
        let dir = tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        warden_io::write_string(&inbox.dir().join("broken.json"), "{not json").unwrap();
        warden_io::write_string(&inbox.dir().join("notes.txt"), "ignored").unwrap();

        assert!(inbox.take().unwrap().is_empty());

        let rejected = warden_io::processed_dir(dir.path()).join("broken.json.rejected");
        assert!(rejected.exists());
        assert!(inbox.dir().join("notes.txt").exists());
    }
}
