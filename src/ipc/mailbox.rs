use super::{io_err, parse_err, IpcError};
use crate::shared::fs_atomic::{atomic_write_file, is_hidden_name, HIDDEN_PREFIX};
use crate::shared::ids::random_base36;
use crate::shared::time::now_millis;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const CLAIMED_SUFFIX: &str = ".claimed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    Messages,
    Tasks,
}

impl MailboxKind {
    pub const ALL: [MailboxKind; 2] = [MailboxKind::Messages, MailboxKind::Tasks];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Tasks => "tasks",
        }
    }
}

/// Writer side of the mailbox: one uniquely named, atomically renamed file
/// per request. Two writers never pick the same name, and a reader never
/// sees a partial file.
pub fn write_mailbox_entry<T: Serialize>(dir: &Path, request: &T) -> Result<PathBuf, IpcError> {
    let body = serde_json::to_vec(request).map_err(|source| parse_err(dir, source))?;
    fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;
    let name = format!(
        "{}-{}.json",
        now_millis(),
        random_base36(8).map_err(IpcError::Naming)?
    );
    let path = dir.join(name);
    atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))?;
    Ok(path)
}

/// Visible `.json` entries of one mailbox directory, oldest name first.
/// A missing directory is an empty mailbox.
pub fn list_entries(dir: &Path) -> Result<Vec<PathBuf>, IpcError> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir, err)),
    };

    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry.map_err(|source| io_err(dir, source))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_hidden_name(name) || !name.ends_with(".json") || !path.is_file() {
            continue;
        }
        entries.push(path);
    }
    entries.sort();
    Ok(entries)
}

/// An entry this consumer owns exclusively after renaming it to a hidden
/// `.claimed` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEntry {
    pub original: PathBuf,
    pub claimed: PathBuf,
}

impl ClaimedEntry {
    pub fn file_name(&self) -> String {
        self.original
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        let raw = fs::read(&self.claimed).map_err(|source| io_err(&self.claimed, source))?;
        serde_json::from_slice(&raw).map_err(|source| parse_err(&self.original, source))
    }

    /// Removes the claimed file. Once gone, the same name can never be
    /// applied again.
    pub fn complete(self) -> Result<(), IpcError> {
        match fs::remove_file(&self.claimed) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.claimed, err)),
        }
    }

    pub fn quarantine(self, errors_dir: &Path, tenant: &str) -> Result<PathBuf, IpcError> {
        let target = errors_dir.join(quarantine_filename(tenant, &self.original));
        move_into(&self.claimed, errors_dir, &target)?;
        Ok(target)
    }
}

/// Takes exclusive ownership of `path`. Returns `None` when another
/// consumer got there first.
pub fn claim_entry(path: &Path) -> Result<Option<ClaimedEntry>, IpcError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let claimed = path.with_file_name(format!("{HIDDEN_PREFIX}{name}{CLAIMED_SUFFIX}"));
    match fs::rename(path, &claimed) {
        Ok(()) => Ok(Some(ClaimedEntry {
            original: path.to_path_buf(),
            claimed,
        })),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Moves entries that were claimed but never finished (the host died while
/// applying them) into `errors_dir`. They are not re-applied: a request may
/// already have taken effect, and applying it twice is worse than dropping
/// it.
pub fn recover_stale_claims(ipc_root: &Path, errors_dir: &Path) -> Result<Vec<PathBuf>, IpcError> {
    let reader = match fs::read_dir(ipc_root) {
        Ok(reader) => reader,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(ipc_root, err)),
    };

    let mut tenant_dirs = Vec::new();
    for entry in reader {
        let entry = entry.map_err(|source| io_err(ipc_root, source))?;
        let path = entry.path();
        if path.is_dir() && path != errors_dir {
            tenant_dirs.push(path);
        }
    }
    tenant_dirs.sort();

    let mut recovered = Vec::new();
    for tenant_dir in tenant_dirs {
        let tenant = tenant_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for kind in MailboxKind::ALL {
            let dir = tenant_dir.join(kind.dir_name());
            let Ok(reader) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in reader {
                let entry = entry.map_err(|source| io_err(&dir, source))?;
                let claimed = entry.path();
                let Some(name) = claimed.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(original) = name
                    .strip_prefix(HIDDEN_PREFIX)
                    .and_then(|rest| rest.strip_suffix(CLAIMED_SUFFIX))
                else {
                    continue;
                };
                let target =
                    errors_dir.join(quarantine_filename(&tenant, &dir.join(original)));
                move_into(&claimed, errors_dir, &target)?;
                recovered.push(target);
            }
        }
    }
    Ok(recovered)
}

fn move_into(from: &Path, errors_dir: &Path, target: &Path) -> Result<(), IpcError> {
    fs::create_dir_all(errors_dir).map_err(|source| io_err(errors_dir, source))?;
    fs::rename(from, target).map_err(|source| io_err(from, source))
}

/// `{tenant}-{hash}-{name}`; the hash of the full source path keeps entries
/// from `messages/` and `tasks/` with the same name apart.
pub(crate) fn quarantine_filename(tenant: &str, original: &Path) -> String {
    let name = original
        .file_name()
        .and_then(|v| v.to_str())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("entry.json");
    let mut hasher = Sha256::new();
    hasher.update(original.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..4]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{tenant}-{hash}-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::OutgoingRequest;
    use tempfile::tempdir;

    fn request(body: &str) -> OutgoingRequest {
        OutgoingRequest {
            target_chat: "c1".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn concurrent_writers_never_collide_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let mailbox = dir.path().join("messages");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mailbox = mailbox.clone();
                std::thread::spawn(move || {
                    write_mailbox_entry(&mailbox, &request(&format!("m{i}"))).expect("write")
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let entries = list_entries(&mailbox).expect("list");
        assert_eq!(entries.len(), 8);
        let all = fs::read_dir(&mailbox).expect("read").count();
        assert_eq!(all, 8, "no temp files may remain");
    }

    #[test]
    fn claim_is_exclusive_and_hides_entry_from_listing() {
        let dir = tempdir().expect("tempdir");
        let path = write_mailbox_entry(dir.path(), &request("hi")).expect("write");

        let claimed = claim_entry(&path).expect("claim").expect("owned");
        assert!(claim_entry(&path).expect("second claim").is_none());
        assert!(list_entries(dir.path()).expect("list").is_empty());

        let parsed: OutgoingRequest = claimed.read_json().expect("read");
        assert_eq!(parsed.body, "hi");
        claimed.complete().expect("complete");
        assert_eq!(fs::read_dir(dir.path()).expect("read").count(), 0);
    }

    #[test]
    fn listing_ignores_hidden_and_non_json_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join(".partial.json.tmp-1"), "{").expect("tmp");
        fs::write(dir.path().join("notes.txt"), "x").expect("txt");
        fs::write(dir.path().join("1-a.json"), "{}").expect("json");

        let entries = list_entries(dir.path()).expect("list");
        assert_eq!(entries, vec![dir.path().join("1-a.json")]);
        assert!(list_entries(&dir.path().join("missing")).expect("missing").is_empty());
    }

    #[test]
    fn stale_claims_are_quarantined_not_replayed() {
        let dir = tempdir().expect("tempdir");
        let ipc = dir.path().join("ipc");
        let errors = ipc.join("errors");
        let tasks = ipc.join("family/tasks");
        fs::create_dir_all(&tasks).expect("mkdir");
        fs::write(tasks.join(".100-abc.json.claimed"), r#"{"op":"refresh_groups"}"#)
            .expect("claimed");
        fs::write(tasks.join("200-def.json"), r#"{"op":"refresh_groups"}"#).expect("pending");

        let recovered = recover_stale_claims(&ipc, &errors).expect("recover");
        assert_eq!(recovered.len(), 1);
        let name = recovered[0]
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name");
        assert!(name.starts_with("family-") && name.ends_with("-100-abc.json"));
        assert_eq!(list_entries(&tasks).expect("list"), vec![tasks.join("200-def.json")]);
    }
}
