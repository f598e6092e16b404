// Account directory over the auth file folder

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// Read-only view of the accounts the relay may rotate through.
pub trait AccountDirectory: Send + Sync {
    /// Usable account indices in ascending order.
    fn list_usable_indices(&self) -> Vec<usize>;

    /// Display name for an account, for logs and the status endpoint.
    fn name_of(&self, index: usize) -> String;

    /// Path of the credential file backing an account, if any.
    fn auth_file(&self, _index: usize) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub index: usize,
    pub name: String,
}

pub fn describe_accounts(directory: &dyn AccountDirectory) -> Vec<AccountInfo> {
    directory
        .list_usable_indices()
        .into_iter()
        .map(|index| AccountInfo {
            index,
            name: directory.name_of(index),
        })
        .collect()
}

/// Accounts stored as `auth-<n>.json` files in one directory.
///
/// The directory is rescanned on every call so files added or disabled while
/// the relay is running are picked up by the next rotation.
#[derive(Debug, Clone)]
pub struct FileAccountDirectory {
    dir: PathBuf,
}

impl FileAccountDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("auth-{}.json", index))
    }

    fn read_auth(&self, index: usize) -> Option<Value> {
        let content = std::fs::read_to_string(self.path_for(index)).ok()?;
        match serde_json::from_str::<Value>(&content) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!("Skipping unreadable auth file auth-{}.json: {}", index, e);
                None
            }
        }
    }
}

fn index_from_filename(name: &str) -> Option<usize> {
    name.strip_prefix("auth-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn is_enabled(json: &Value) -> bool {
    json.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true)
}

impl AccountDirectory for FileAccountDirectory {
    fn list_usable_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read auth dir {:?}: {}", self.dir, e);
                return indices;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(index_from_filename)
            else {
                continue;
            };
            if self.read_auth(index).map(|json| is_enabled(&json)).unwrap_or(false) {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        indices.dedup();
        indices
    }

    fn name_of(&self, index: usize) -> String {
        self.read_auth(index)
            .and_then(|json| {
                json.get("accountName")
                    .or_else(|| json.get("email"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| format!("Account {}", index))
    }

    fn auth_file(&self, index: usize) -> Option<PathBuf> {
        let path = self.path_for(index);
        path.exists().then_some(path)
    }
}

/// Fixed account list, for deployments without an auth folder.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountDirectory {
    accounts: Vec<AccountInfo>,
}

impl StaticAccountDirectory {
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Self {
        let accounts = indices
            .into_iter()
            .map(|index| AccountInfo {
                index,
                name: format!("Account {}", index),
            })
            .collect();
        Self { accounts }
    }
}

impl AccountDirectory for StaticAccountDirectory {
    fn list_usable_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.accounts.iter().map(|a| a.index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    fn name_of(&self, index: usize) -> String {
        self.accounts
            .iter()
            .find(|a| a.index == index)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| format!("Account {}", index))
    }
}
