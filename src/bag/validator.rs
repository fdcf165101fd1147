//! Package validation.
//!
//! Takes a tarred package in staging (or an already-extracted tree),
//! checks its structure, required tags and checksum manifests, and
//! computes the receipt digest sent back to a replication origin.
//! Errors accumulate; the package is valid iff none were recorded.
//! Long phases invoke an optional keep-alive hook so the owning queue
//! message stays visible.

use super::digest::{sha256_file, tagmanifest_receipt};
use super::tags::{
    missing_labels, parse_manifest, parse_tag_file, BAGIT_REQUIRED, BAG_INFO_REQUIRED,
    DPN_INFO_REQUIRED,
};
use crate::error::{CourierError, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::warn;
use uuid::Uuid;

const TAG_MANIFEST: &str = "tagmanifest-sha256.txt";
const PAYLOAD_MANIFEST: &str = "manifest-sha256.txt";
const DPN_INFO: &str = "dpn-tags/dpn-info.txt";

pub type TouchFn = Box<dyn Fn() + Send + Sync>;

/// Everything the pipeline needs to know after a validation run.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Nonce-signed tagmanifest digest; present when the tagmanifest was
    /// readable.
    pub receipt: Option<String>,
}

impl ValidationOutcome {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors joined for the envelope's error-message field.
    pub fn error_message(&self) -> String {
        self.errors.join("; ")
    }
}

pub struct Validator {
    uuid: Uuid,
    tar_path: Option<PathBuf>,
    bag_path: Option<PathBuf>,
    nonce: Option<String>,
    touch: Option<TouchFn>,
    /// Delete the extracted tree after validation, keeping the tar for
    /// the storer. Workers set this; tests leave it off to inspect the
    /// tree.
    cleanup_extracted: bool,
}

impl Validator {
    /// Fails fast when the package name is not a version-4 UUID matching
    /// the filename stem.
    pub fn new(
        tar_path: Option<PathBuf>,
        bag_path: Option<PathBuf>,
        nonce: Option<String>,
    ) -> Result<Self> {
        let name = match (&tar_path, &bag_path) {
            (Some(tar), _) => tar
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".tar"))
                .ok_or_else(|| {
                    CourierError::Validation(format!(
                        "{} is not a .tar file",
                        tar.display()
                    ))
                })?
                .to_string(),
            (None, Some(dir)) => dir
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    CourierError::Validation(format!("{} has no usable name", dir.display()))
                })?
                .to_string(),
            (None, None) => {
                return Err(CourierError::Validation(
                    "validator needs a tar path or a bag path".into(),
                ))
            }
        };
        let uuid = Uuid::parse_str(&name).map_err(|_| {
            CourierError::Validation(format!("package name {:?} is not a UUID", name))
        })?;
        if uuid.get_version_num() != 4 {
            return Err(CourierError::Validation(format!(
                "package name {} is not a version-4 UUID",
                uuid
            )));
        }
        Ok(Self {
            uuid,
            tar_path,
            bag_path,
            nonce,
            touch: None,
            cleanup_extracted: false,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn with_touch(mut self, touch: TouchFn) -> Self {
        self.touch = Some(touch);
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup_extracted = cleanup;
        self
    }

    fn touch(&self) {
        if let Some(ref touch) = self.touch {
            touch();
        }
    }

    /// Runs the full validation. Consumes the validator; all findings
    /// land on the returned outcome.
    pub fn run(mut self) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        let extracted = if self.bag_path.is_none() {
            match self.extract(&mut outcome) {
                Ok(path) => {
                    self.bag_path = Some(path);
                    true
                }
                Err(e) => {
                    outcome.errors.push(e.to_string());
                    return outcome;
                }
            }
        } else {
            false
        };
        // Extraction of a multi-GB tar can outlast the queue visibility
        // window.
        self.touch();

        let bag = self.bag_path.clone().unwrap_or_default();
        let tag_manifest = bag.join(TAG_MANIFEST);
        let payload_manifest = bag.join(PAYLOAD_MANIFEST);
        if !tag_manifest.is_file() || !payload_manifest.is_file() {
            if !tag_manifest.is_file() {
                outcome
                    .errors
                    .push(format!("required file {} is missing", TAG_MANIFEST));
            }
            if !payload_manifest.is_file() {
                outcome
                    .errors
                    .push(format!("required file {} is missing", PAYLOAD_MANIFEST));
            }
            self.finish(extracted);
            return outcome;
        }

        self.check_structure(&bag, &mut outcome);
        self.check_tags(&bag, &mut outcome);
        self.check_manifests(&bag, &mut outcome);
        self.touch();

        match tagmanifest_receipt(&tag_manifest, self.nonce.as_deref()) {
            Ok(receipt) => outcome.receipt = Some(receipt),
            Err(e) => outcome
                .errors
                .push(format!("cannot compute tagmanifest digest: {}", e)),
        }

        self.finish(extracted);
        outcome
    }

    /// Extracts the tar next to itself; the destination directory is the
    /// tar filename without `.tar`.
    fn extract(&self, outcome: &mut ValidationOutcome) -> Result<PathBuf> {
        let tar_path = self
            .tar_path
            .as_ref()
            .ok_or_else(|| CourierError::Validation("no tar file to extract".into()))?;
        let parent = tar_path
            .parent()
            .ok_or_else(|| {
                CourierError::Validation(format!("{} has no parent", tar_path.display()))
            })?
            .to_path_buf();

        let mut archive = Archive::new(File::open(tar_path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.to_path_buf();
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(CourierError::Validation(format!(
                    "tar entry {} escapes the staging directory",
                    rel.display()
                )));
            }
            let dest = parent.join(&rel);
            match entry.header().entry_type() {
                EntryType::Directory => fs::create_dir_all(&dest)?,
                EntryType::Regular => {
                    if let Some(dir) = dest.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    let mut out = File::create(&dest)?;
                    io::copy(&mut entry, &mut out)?;
                }
                other => {
                    outcome.warnings.push(format!(
                        "ignoring tar entry {} of type {:?}",
                        rel.display(),
                        other
                    ));
                }
            }
        }

        let bag = parent.join(self.uuid.to_string());
        if !bag.is_dir() {
            return Err(CourierError::Validation(format!(
                "extraction did not produce directory {}",
                bag.display()
            )));
        }
        Ok(bag)
    }

    fn check_structure(&self, bag: &Path, outcome: &mut ValidationOutcome) {
        if !bag.join("bagit.txt").is_file() {
            outcome.errors.push("bagit.txt is missing".into());
        }
        if !bag.join(DPN_INFO).is_file() {
            outcome.errors.push(format!("{} is missing", DPN_INFO));
        }
        let data = bag.join("data");
        if !data.is_dir() {
            outcome.errors.push("payload directory data/ is missing".into());
        } else if count_files(&data) == 0 {
            outcome
                .errors
                .push("payload directory data/ contains no files".into());
        }
    }

    fn check_tags(&self, bag: &Path, outcome: &mut ValidationOutcome) {
        let checks: [(&str, &[&str]); 3] = [
            ("bagit.txt", BAGIT_REQUIRED),
            ("bag-info.txt", BAG_INFO_REQUIRED),
            (DPN_INFO, DPN_INFO_REQUIRED),
        ];
        for (file, required) in checks {
            let path = bag.join(file);
            if !path.is_file() {
                outcome.errors.push(format!("tag file {} is missing", file));
                continue;
            }
            match parse_tag_file(&path) {
                Ok(tags) => {
                    for label in missing_labels(&tags, required) {
                        outcome
                            .errors
                            .push(format!("{} is missing required tag {}", file, label));
                    }
                }
                Err(e) => outcome.errors.push(e.to_string()),
            }
        }
    }

    /// Recomputes every digest listed in each manifest present.
    fn check_manifests(&self, bag: &Path, outcome: &mut ValidationOutcome) {
        for manifest in [PAYLOAD_MANIFEST, TAG_MANIFEST] {
            let path = bag.join(manifest);
            if !path.is_file() {
                continue;
            }
            let entries = match parse_manifest(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    outcome.errors.push(e.to_string());
                    continue;
                }
            };
            for entry in entries {
                let file = bag.join(&entry.path);
                if !file.is_file() {
                    outcome.errors.push(format!(
                        "{} lists {} but the file is missing",
                        manifest, entry.path
                    ));
                    continue;
                }
                match sha256_file(&file) {
                    Ok(actual) if actual == entry.digest => {}
                    Ok(actual) => outcome.errors.push(format!(
                        "checksum mismatch for {}: manifest says {}, file has {}",
                        entry.path, entry.digest, actual
                    )),
                    Err(e) => outcome
                        .errors
                        .push(format!("cannot digest {}: {}", entry.path, e)),
                }
            }
        }
    }

    fn finish(&self, extracted: bool) {
        if self.cleanup_extracted && extracted {
            if let Some(ref bag) = self.bag_path {
                if let Err(e) = fs::remove_dir_all(bag) {
                    warn!("cannot remove extracted tree {}: {}", bag.display(), e);
                }
            }
        }
    }
}

fn count_files(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_files(&path);
        } else if path.is_file() {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a well-formed bag under `parent` and returns its path.
    pub(crate) fn build_bag(parent: &Path, uuid: Uuid) -> PathBuf {
        let bag = parent.join(uuid.to_string());
        fs::create_dir_all(bag.join("data")).unwrap();
        fs::create_dir_all(bag.join("dpn-tags")).unwrap();

        fs::write(
            bag.join("bagit.txt"),
            "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n",
        )
        .unwrap();
        fs::write(
            bag.join("bag-info.txt"),
            "Source-Organization: Example University\n\
             Organization-Address: 160 Main St\n\
             Contact-Name: Jo Contact\n\
             Contact-Phone: 555-1234\n\
             Contact-Email: jo@example.edu\n\
             Bagging-Date: 2018-03-01\n\
             Bag-Size: 686\n\
             Bag-Group-Identifier:\n\
             Bag-Count: 1 of 1\n",
        )
        .unwrap();
        fs::write(
            bag.join(DPN_INFO),
            format!(
                "DPN-Object-ID: {uuid}\n\
                 Local-ID: example.edu/my-bag\n\
                 Ingest-Node-Name: example\n\
                 Ingest-Node-Address: 160 Main St\n\
                 Ingest-Node-Contact-Name: Jo Contact\n\
                 Ingest-Node-Contact-Email: jo@example.edu\n\
                 Version-Number: 1\n\
                 First-Version-Object-ID: {uuid}\n\
                 Rights-Object-ID:\n\
                 Bag-Type: data\n"
            ),
        )
        .unwrap();

        fs::write(bag.join("data/file-one.txt"), "payload one\n").unwrap();
        fs::write(bag.join("data/file-two.txt"), "payload two, longer\n").unwrap();

        let mut manifest = String::new();
        for file in ["data/file-one.txt", "data/file-two.txt"] {
            let digest = sha256_file(&bag.join(file)).unwrap();
            manifest.push_str(&format!("{}  {}\n", digest, file));
        }
        fs::write(bag.join(PAYLOAD_MANIFEST), manifest).unwrap();

        let mut tag_manifest = String::new();
        for file in ["bagit.txt", "bag-info.txt", DPN_INFO, PAYLOAD_MANIFEST] {
            let digest = sha256_file(&bag.join(file)).unwrap();
            tag_manifest.push_str(&format!("{}  {}\n", digest, file));
        }
        fs::write(bag.join(TAG_MANIFEST), tag_manifest).unwrap();
        bag
    }

    /// Tars up a built bag as `<uuid>.tar` next to it.
    pub(crate) fn tar_bag(parent: &Path, uuid: Uuid) -> PathBuf {
        let bag = parent.join(uuid.to_string());
        let tar_path = parent.join(format!("{}.tar", uuid));
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        builder
            .append_dir_all(uuid.to_string(), &bag)
            .unwrap();
        builder.finish().unwrap();
        tar_path
    }

    #[test]
    fn test_valid_bag_passes() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        let outcome = Validator::new(None, Some(bag), None).unwrap().run();
        assert!(outcome.valid(), "errors: {:?}", outcome.errors);
        assert!(outcome.warnings.is_empty());
        assert!(outcome.receipt.is_some());
    }

    #[test]
    fn test_non_uuid_name_fails_fast() {
        let err = Validator::new(Some(PathBuf::from("/tmp/my-bag.tar")), None, None);
        assert!(matches!(err, Err(CourierError::Validation(_))));
        // v1-style UUID is rejected too
        let err = Validator::new(
            Some(PathBuf::from(
                "/tmp/6ba7b810-9dad-11d1-80b4-00c04fd430c8.tar",
            )),
            None,
            None,
        );
        assert!(matches!(err, Err(CourierError::Validation(_))));
    }

    #[test]
    fn test_missing_manifests_abort() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        fs::remove_file(bag.join(TAG_MANIFEST)).unwrap();
        let outcome = Validator::new(None, Some(bag), None).unwrap().run();
        assert!(!outcome.valid());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains(TAG_MANIFEST));
        // Aborted before computing a receipt.
        assert!(outcome.receipt.is_none());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        fs::write(bag.join("data/file-one.txt"), "tampered\n").unwrap();
        let outcome = Validator::new(None, Some(bag), None).unwrap().run();
        assert!(!outcome.valid());
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("checksum mismatch for data/file-one.txt")));
    }

    #[test]
    fn test_missing_payload_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        fs::remove_file(bag.join("data/file-two.txt")).unwrap();
        let outcome = Validator::new(None, Some(bag), None).unwrap().run();
        assert!(!outcome.valid());
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("data/file-two.txt") && e.contains("missing")));
    }

    #[test]
    fn test_missing_required_tag_detected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        fs::write(
            bag.join("bagit.txt"),
            "BagIt-Version: 0.97\n",
        )
        .unwrap();
        // Keep the tagmanifest honest so only the tag error fires.
        let digest = sha256_file(&bag.join("bagit.txt")).unwrap();
        let tag_manifest = fs::read_to_string(bag.join(TAG_MANIFEST)).unwrap();
        let rewritten: String = tag_manifest
            .lines()
            .map(|line| {
                if line.ends_with(" bagit.txt") {
                    format!("{}  bagit.txt\n", digest)
                } else {
                    format!("{}\n", line)
                }
            })
            .collect();
        fs::write(bag.join(TAG_MANIFEST), rewritten).unwrap();

        let outcome = Validator::new(None, Some(bag), None).unwrap().run();
        assert!(!outcome.valid());
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("Tag-File-Character-Encoding")));
    }

    #[test]
    fn test_tar_extraction_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let bag = build_bag(dir.path(), uuid);
        let tar_path = tar_bag(dir.path(), uuid);
        fs::remove_dir_all(&bag).unwrap();

        let touched = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&touched);
        let outcome = Validator::new(Some(tar_path.clone()), None, Some("McNunce".into()))
            .unwrap()
            .with_touch(Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }))
            .with_cleanup(true)
            .run();
        assert!(outcome.valid(), "errors: {:?}", outcome.errors);
        assert!(touched.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        // Extracted tree removed, tar retained for the storer.
        assert!(!bag.exists());
        assert!(tar_path.is_file());
        let receipt = outcome.receipt.unwrap();
        assert!(receipt.starts_with(&hex::encode("McNunce")));
    }

    #[test]
    fn test_symlink_entry_warns_but_passes() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        build_bag(dir.path(), uuid);
        let tar_path = dir.path().join(format!("{}.tar", uuid));
        {
            let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
            builder
                .append_dir_all(uuid.to_string(), dir.path().join(uuid.to_string()))
                .unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(
                    &mut header,
                    format!("{}/stray-link", uuid),
                    "data/file-one.txt",
                )
                .unwrap();
            builder.finish().unwrap();
        }
        fs::remove_dir_all(dir.path().join(uuid.to_string())).unwrap();

        let outcome = Validator::new(Some(tar_path), None, None).unwrap().run();
        assert!(outcome.valid(), "errors: {:?}", outcome.errors);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("stray-link"));
    }

    #[test]
    fn test_escaping_tar_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let tar_path = dir.path().join(format!("{}.tar", uuid));
        {
            let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
            let mut header = tar::Header::new_gnu();
            let name = b"../escape.txt";
            header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
            header.set_entry_type(EntryType::Regular);
            header.set_size(4);
            header.set_cksum();
            let data: &[u8] = b"oops";
            builder.append(&header, data).unwrap();
            builder.finish().unwrap();
        }
        let outcome = Validator::new(Some(tar_path), None, None).unwrap().run();
        assert!(!outcome.valid());
        assert!(outcome.errors[0].contains("escapes"));
    }
}
