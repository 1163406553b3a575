use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{CredentialId, PublicKey};
use crate::{Error, Result};

/// Durable election state: issued and spent keys, voters and the tally.
///
/// Open sessions and failure counters are not persisted and do not survive
/// a restart. Keys and credentials are held in separate collections,
/// so a snapshot never links a registration key to the credential it bought.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSnapshot {
    /// Hex SHA-256 identity digest -> issued registration key.
    pub issued_keys: BTreeMap<String, String>,
    /// Registration keys already spent.
    pub consumed_keys: BTreeSet<String>,
    /// Hex credential id -> registered voter.
    pub voters: BTreeMap<String, StoredVoter>,
    /// Per-option counts in ballot order. May be shorter than the ballot.
    pub tally: Vec<u64>,
}

/// A registered credential as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVoter {
    pub public_key: PublicKey,
    pub has_voted: bool,
}

impl ElectionSnapshot {
    fn apply_issued_key(&mut self, identity_digest: &[u8; 32], key: &str) {
        self.issued_keys
            .insert(hex::encode(identity_digest), key.to_string());
    }

    fn apply_registration(&mut self, key: &str, public_key: &PublicKey) {
        self.consumed_keys.insert(key.to_string());
        self.voters.insert(
            credential_key(&public_key.credential_id()),
            StoredVoter {
                public_key: public_key.clone(),
                has_voted: false,
            },
        );
    }

    fn apply_vote(&mut self, credential: &CredentialId, option: u32) -> Result<()> {
        let index = (option as usize)
            .checked_sub(1)
            .ok_or_else(|| Error::Storage(format!("vote for option {option}")))?;
        let voter = self
            .voters
            .get_mut(&credential_key(credential))
            .ok_or_else(|| Error::Storage("vote for an unknown credential".to_string()))?;
        if voter.has_voted {
            return Err(Error::Storage("credential already voted".to_string()));
        }

        voter.has_voted = true;
        if self.tally.len() <= index {
            self.tally.resize(index + 1, 0);
        }
        self.tally[index] += 1;
        Ok(())
    }
}

/// Hex form of a credential id, as used for snapshot keys.
fn credential_key(credential: &CredentialId) -> String {
    hex::encode(credential.as_bytes())
}

/// Persistence behind the election's durable transitions.
///
/// Each `put_*` call is one atomic transition, made while the election holds
/// the locks that guard it in memory. The in-memory state changes only after
/// the store accepts the transition, so a failed write leaves both untouched.
/// Implementations are called with those locks held and should return promptly.
pub trait ElectionStore: Send + Sync + 'static {
    /// Returns everything persisted so far.
    fn load(&self) -> Result<ElectionSnapshot>;

    /// Records a newly issued registration key.
    fn put_issued_key(&self, identity_digest: &[u8; 32], key: &str) -> Result<()>;

    /// Records a spent key and the credential registered with it.
    fn put_registration(&self, key: &str, public_key: &PublicKey) -> Result<()>;

    /// Marks a credential as voted and counts its 1-based `option`.
    fn put_vote(&self, credential: &CredentialId, option: u32) -> Result<()>;
}

/// Store that keeps its snapshot in process memory.
///
/// The default for [`Election::new`](super::Election::new). State survives
/// for as long as the store does, which lets several elections share one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<ElectionSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ElectionStore for MemoryStore {
    fn load(&self) -> Result<ElectionSnapshot> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn put_issued_key(&self, identity_digest: &[u8; 32], key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.apply_issued_key(identity_digest, key);
        Ok(())
    }

    fn put_registration(&self, key: &str, public_key: &PublicKey) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.apply_registration(key, public_key);
        Ok(())
    }

    fn put_vote(&self, credential: &CredentialId, option: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.apply_vote(credential, option)
    }
}

/// Store that rewrites a JSON snapshot file on every transition.
///
/// Writes go to a temporary file in the same directory that is then renamed
/// over the snapshot, so a crash leaves either the old or the new state.
/// Every write is a full rewrite; suited to small and medium electorates.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<ElectionSnapshot>,
}

impl JsonFileStore {
    /// Opens the snapshot at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Storage(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Starting a new state file");
                ElectionSnapshot::default()
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ElectionSnapshot) -> Result<()>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = state.clone();
        apply(&mut next)?;

        let json = serde_json::to_vec_pretty(&next)
            .map_err(|e| Error::Storage(format!("cannot encode state: {e}")))?;
        write_private(&self.path, &json, true)
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", self.path.display())))?;

        *state = next;
        debug!("Persisted election state");
        Ok(())
    }
}

impl ElectionStore for JsonFileStore {
    fn load(&self) -> Result<ElectionSnapshot> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn put_issued_key(&self, identity_digest: &[u8; 32], key: &str) -> Result<()> {
        self.update(|state| {
            state.apply_issued_key(identity_digest, key);
            Ok(())
        })
    }

    fn put_registration(&self, key: &str, public_key: &PublicKey) -> Result<()> {
        self.update(|state| {
            state.apply_registration(key, public_key);
            Ok(())
        })
    }

    fn put_vote(&self, credential: &CredentialId, option: u32) -> Result<()> {
        self.update(|state| state.apply_vote(credential, option))
    }
}

/// Atomically writes `contents` to `path`, readable by the owner only.
///
/// With `replace` unset an existing file is left alone and the call fails
/// with [`io::ErrorKind::AlreadyExists`].
pub(crate) fn write_private(path: &Path, contents: &[u8], replace: bool) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.as_file().sync_all()?;

    if replace {
        file.persist(path)?;
    } else {
        file.persist_noclobber(path)?;
    }
    Ok(())
}
