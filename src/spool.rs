//! Spool: per-study directory layout on disk
//!
//! The spool exclusively owns all on-disk study state. Every other
//! component goes through this interface; nothing else renames or deletes
//! inside the working directory.
//!
//! Layout per study: `<working>/UID_<key>/{DCM,Structure,Addition,DebugDicom}`.
//! Failed studies move to `<working>/<quarantine_subdir>/UID_<key>_<ts>`
//! with a sibling reason file.

use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Sanitised study identifier, usable as a directory name.
///
/// Only `Spool::safe_key` constructs these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StudyKey(String);

impl StudyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four fixed subdirectories of a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Received image instances (CT or MR).
    Dcm,
    /// Received RT structure set instance(s).
    Structure,
    /// Derived series with overlay planes.
    Addition,
    /// Optional secondary-capture visualisation series.
    DebugDicom,
}

impl Slot {
    pub fn dir_name(self) -> &'static str {
        match self {
            Slot::Dcm => "DCM",
            Slot::Structure => "Structure",
            Slot::Addition => "Addition",
            Slot::DebugDicom => "DebugDicom",
        }
    }
}

/// Upper bound on sanitised key length. DICOM UIDs cap at 64 bytes; leave
/// headroom for non-conformant peers without risking filesystem limits.
const MAX_KEY_LEN: usize = 128;

const STUDY_DIR_PREFIX: &str = "UID_";

/// Filesystem owner for all study state.
#[derive(Debug, Clone)]
pub struct Spool {
    working: PathBuf,
    quarantine: PathBuf,
}

impl Spool {
    /// Create the spool, ensuring the working and quarantine directories
    /// exist.
    pub fn new(working: &Path, quarantine_subdir: &str) -> Result<Spool> {
        let quarantine = working.join(quarantine_subdir);
        fs::create_dir_all(working)?;
        fs::create_dir_all(&quarantine)?;
        info!(
            "spool initialised: working {}, quarantine {}",
            working.display(),
            quarantine.display()
        );
        Ok(Spool {
            working: working.to_path_buf(),
            quarantine,
        })
    }

    /// Sanitise a raw study identifier into a spool key.
    ///
    /// Rejects anything that could escape the working directory: path
    /// separators, parent-directory sequences, NUL, leading dot, control
    /// characters, empty or oversized input. Rejection refuses the
    /// incoming association; nothing has been stored yet.
    pub fn safe_key(raw: &str) -> Result<StudyKey> {
        let malformed = || Error::MalformedIdentifier(raw.to_string());

        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(malformed());
        }
        if raw.starts_with('.') {
            return Err(malformed());
        }
        if raw
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            return Err(malformed());
        }
        // Windows-style traversal without separators is already excluded by
        // the leading-dot rule; ".." embedded between separators cannot
        // occur once separators are rejected.
        Ok(StudyKey(raw.to_string()))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working
    }

    /// Root directory of one study.
    pub fn study_dir(&self, study: &StudyKey) -> PathBuf {
        self.working.join(format!("{}{}", STUDY_DIR_PREFIX, study))
    }

    /// Path of one slot inside a study.
    pub fn path_for(&self, study: &StudyKey, slot: Slot) -> PathBuf {
        self.study_dir(study).join(slot.dir_name())
    }

    /// Create the study directory with its receiving slots.
    pub fn create(&self, study: &StudyKey) -> Result<()> {
        retry_io(|| {
            fs::create_dir_all(self.path_for(study, Slot::Dcm))?;
            fs::create_dir_all(self.path_for(study, Slot::Structure))?;
            Ok(())
        })
    }

    /// True if the study directory currently exists in the working tree.
    pub fn exists(&self, study: &StudyKey) -> bool {
        self.study_dir(study).is_dir()
    }

    /// Count regular files across the receiving slots. Used by the watcher
    /// for the minimum-file quorum.
    pub fn file_count(&self, study: &StudyKey) -> usize {
        [Slot::Dcm, Slot::Structure]
            .iter()
            .map(|slot| count_files(&self.path_for(study, *slot)))
            .sum()
    }

    /// Files of one slot in lexicographic order.
    pub fn slot_files(&self, study: &StudyKey, slot: Slot) -> Result<Vec<PathBuf>> {
        let dir = self.path_for(study, slot);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Remove every file of a derived slot. Used before re-deriving a
    /// study so output from an interrupted earlier run cannot leak into
    /// the egress batch.
    pub fn clear_slot(&self, study: &StudyKey, slot: Slot) -> Result<()> {
        let dir = self.path_for(study, slot);
        if !dir.is_dir() {
            return Ok(());
        }
        retry_io(|| {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(&path)?;
                }
            }
            Ok(())
        })
    }

    /// Persist one received instance into a slot, write-to-temp-then-rename
    /// so the watcher never observes a half-written file.
    pub fn store_instance(
        &self,
        study: &StudyKey,
        slot: Slot,
        name: &str,
        file_obj: &dicom::object::DefaultDicomObject,
    ) -> Result<PathBuf> {
        let dir = self.path_for(study, slot);
        fs::create_dir_all(&dir)?;
        let part = dir.join(format!("{}.part", name));
        let target = dir.join(name);
        file_obj
            .write_to_file(&part)
            .map_err(|e| Error::Codec(format!("{}: {}", part.display(), e)))?;
        fs::File::open(&part)?.sync_all()?;
        fs::rename(&part, &target)?;
        Ok(target)
    }

    /// Move a failed study under the quarantine subtree and record why.
    ///
    /// The destination name always carries a timestamp suffix so a
    /// re-received study with the same key gets a fresh, independent
    /// lifecycle. Either the whole directory moves or nothing does; a
    /// partial cross-filesystem copy is reported as a fatal configuration
    /// error because the spool layout cannot be trusted afterwards.
    pub fn quarantine(&self, study: &StudyKey, reason: &str) -> Result<()> {
        let source = self.study_dir(study);
        if !source.exists() {
            warn!("quarantine requested for missing study {}", study);
            return Ok(());
        }

        let stamp = chrono::Utc::now().timestamp();
        let mut dest_name = format!("{}{}_{}", STUDY_DIR_PREFIX, study, stamp);
        let mut counter = 0u32;
        while self.quarantine.join(&dest_name).exists() {
            counter += 1;
            dest_name = format!("{}{}_{}_{}", STUDY_DIR_PREFIX, study, stamp, counter);
        }
        let dest = self.quarantine.join(&dest_name);

        retry_io(|| move_dir_atomic(&source, &dest))?;

        let reason_path = self.quarantine.join(format!("{}.reason.txt", dest_name));
        retry_io(|| {
            let mut file = fs::File::create(&reason_path)?;
            writeln!(file, "{}", reason)?;
            file.sync_all()?;
            Ok(())
        })?;

        warn!("study {} quarantined as {}: {}", study, dest_name, reason);
        Ok(())
    }

    /// Remove a study directory recursively. Idempotent: a study already
    /// gone (second cleanup after restart, concurrent disappearance) is a
    /// no-op.
    pub fn cleanup(&self, study: &StudyKey) -> Result<()> {
        let dir = self.study_dir(study);
        match retry_io(|| match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }) {
            Ok(()) => {
                info!("study {} cleaned up", study);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enumerate study keys currently present in the working directory.
    /// The quarantine subtree is not scanned.
    pub fn list_studies(&self) -> Result<Vec<StudyKey>> {
        let mut studies = Vec::new();
        for entry in fs::read_dir(&self.working)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || path == self.quarantine {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(raw) = name.strip_prefix(STUDY_DIR_PREFIX) else {
                continue;
            };
            match Spool::safe_key(raw) {
                Ok(key) => studies.push(key),
                Err(_) => warn!("ignoring unparseable study directory {:?}", name),
            }
        }
        studies.sort();
        Ok(studies)
    }
}

/// Run a spool mutation, retrying once on I/O failure. A second failure
/// means the spool is unreliable and the caller escalates to a fatal
/// abort.
fn retry_io<F>(mut op: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    match op() {
        Ok(()) => Ok(()),
        Err(Error::Io(first)) => {
            warn!("spool I/O failed, retrying once: {}", first);
            op()
        }
        Err(e) => Err(e),
    }
}

/// Atomic directory move with a copy-then-delete fallback for
/// cross-filesystem destinations.
fn move_dir_atomic(source: &Path, dest: &Path) -> Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        // EXDEV: quarantine lives on another filesystem.
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            copy_tree_fsync(source, dest).map_err(|copy_err| {
                Error::Config(format!(
                    "quarantine move crossed filesystems and the copy fallback failed \
                     ({}); partial state may exist at {}",
                    copy_err,
                    dest.display()
                ))
            })?;
            fs::remove_dir_all(source)?;
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

const fn libc_exdev() -> i32 {
    18
}

fn copy_tree_fsync(source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree_fsync(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            fs::File::open(&target)?.sync_all()?;
        }
    }
    Ok(())
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_file())
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_key_accepts_conformant_uids() {
        assert!(Spool::safe_key("1.2.840.113619.2.55.3").is_ok());
        assert!(Spool::safe_key("2.25.329800735698586629295641978511506172918").is_ok());
    }

    #[test]
    fn safe_key_rejects_traversal_and_separators() {
        for raw in [
            "../evil",
            "..\\evil",
            "a/b",
            "a\\b",
            ".hidden",
            "",
            "nul\0byte",
            "tab\tchar",
        ] {
            let err = Spool::safe_key(raw).unwrap_err();
            assert_eq!(err.kind(), "malformed-identifier", "input {:?}", raw);
        }
    }

    #[test]
    fn safe_key_rejects_oversized_input() {
        let raw = "1".repeat(MAX_KEY_LEN + 1);
        assert!(Spool::safe_key(&raw).is_err());
    }

    #[test]
    fn slot_names_are_fixed() {
        assert_eq!(Slot::Dcm.dir_name(), "DCM");
        assert_eq!(Slot::Structure.dir_name(), "Structure");
        assert_eq!(Slot::Addition.dir_name(), "Addition");
        assert_eq!(Slot::DebugDicom.dir_name(), "DebugDicom");
    }
}
