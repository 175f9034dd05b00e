//! Encrypted variable store on disk.
//!
//! ## Layout
//!
//! ```text
//! <dir>/                     0755
//! ├── manifest.json          {"current_key_version": N}
//! └── <name>.json            0600  {name, key_version, ciphertext, nonce, updated_at}
//! ```
//!
//! Entries are AES-256-GCM sealed under `SHA-256(passphrase)` with a random
//! 12-byte nonce; `ciphertext` and `nonce` are standard base64. One mutex is
//! held across every manifest and entry write, so the directory must not be
//! modified from outside the store while it is open.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Manifest file name inside the store directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    current_key_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SealedEntry {
    name: String,
    key_version: u32,
    ciphertext: String,
    nonce: String,
    updated_at: DateTime<Utc>,
}

/// A decrypted variable set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedVariable {
    /// Entry name.
    pub name: String,
    /// Plaintext variables.
    pub data: Map<String, Value>,
    /// Key version the entry is sealed under.
    pub key_version: u32,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Listing row; never carries plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVariableSummary {
    /// Entry name.
    pub name: String,
    /// Key version.
    pub key_version: u32,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Validate an entry name: `[A-Za-z0-9_.-]+`, no leading dot, not the
/// manifest's stem.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    if name.starts_with('.') {
        return Err(Error::validation("name may not start with '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(Error::validation("name may only contain letters, digits, '_', '.', and '-'"));
    }
    if format!("{name}.json") == MANIFEST_FILE {
        return Err(Error::validation("name is reserved"));
    }
    Ok(name.to_string())
}

fn derive_key(passphrase: &str) -> Result<[u8; 32]> {
    if passphrase.is_empty() {
        return Err(Error::validation("passphrase is required"));
    }
    Ok(Sha256::digest(passphrase.as_bytes()).into())
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<(String, String)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;
    Ok((BASE64.encode(ciphertext), BASE64.encode(nonce_bytes)))
}

fn open_sealed(key: &[u8; 32], entry: &SealedEntry) -> Result<Map<String, Value>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
    let nonce = BASE64
        .decode(&entry.nonce)
        .map_err(|e| Error::Crypto(format!("invalid nonce encoding: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(Error::Crypto("invalid nonce length".to_string()));
    }
    let ciphertext = BASE64
        .decode(&entry.ciphertext)
        .map_err(|e| Error::Crypto(format!("invalid ciphertext encoding: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| Error::Crypto(format!("failed to decrypt \"{}\"", entry.name)))?;
    decode_stored(&format!("payload of \"{}\"", entry.name), &plaintext)
}

fn write_restricted(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    // A stale temp file keeps its old mode.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Decode a file the store wrote itself. Bad content is on-disk corruption,
/// not caller input.
fn decode_stored<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, format!("corrupt {what}: {e}")))
    })
}

struct VaultState {
    key: [u8; 32],
    version: u32,
}

impl std::fmt::Debug for VaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultState")
            .field("key", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}

/// Passphrase-keyed variable store rooted at one directory.
#[derive(Debug)]
pub struct EncryptedVariableStore {
    dir: PathBuf,
    state: Mutex<VaultState>,
    clock: Arc<dyn Clock>,
}

impl EncryptedVariableStore {
    /// Open (creating if needed) the store at `dir`.
    pub fn open(dir: impl Into<PathBuf>, passphrase: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        let key = derive_key(passphrase)?;
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let version = if manifest_path.exists() {
            let manifest: Manifest = decode_stored("manifest", &fs::read(&manifest_path)?)?;
            manifest.current_key_version
        } else {
            let manifest = Manifest { current_key_version: 1 };
            write_restricted(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;
            1
        };
        tracing::info!(dir = %dir.display(), key_version = version, "encrypted variable store opened");
        Ok(Self {
            dir,
            state: Mutex::new(VaultState { key, version }),
            clock,
        })
    }

    /// Directory backing the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current key version.
    pub fn key_version(&self) -> u32 {
        self.state.lock().version
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_entry(&self, name: &str) -> Result<Option<SealedEntry>> {
        let path = self.entry_path(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(decode_stored(&format!("entry \"{name}\""), &fs::read(path)?)?))
    }

    fn write_entry(&self, state: &VaultState, name: &str, data: &Map<String, Value>) -> Result<SealedEntry> {
        let (ciphertext, nonce) = seal(&state.key, &serde_json::to_vec(data)?)?;
        let entry = SealedEntry {
            name: name.to_string(),
            key_version: state.version,
            ciphertext,
            nonce,
            updated_at: self.clock.now(),
        };
        write_restricted(&self.entry_path(name), &serde_json::to_vec_pretty(&entry)?)?;
        Ok(entry)
    }

    fn entry_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let path = item?.path();
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if file_name == MANIFEST_FILE || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Encrypt and store `data` under `name`, replacing any previous value.
    pub fn put(&self, name: &str, data: Value) -> Result<EncryptedVariableSummary> {
        let name = validate_name(name)?;
        let Value::Object(data) = data else {
            return Err(Error::validation("encrypted variables payload must be a mapping"));
        };
        let state = self.state.lock();
        let entry = self.write_entry(&state, &name, &data)?;
        tracing::info!(name = %name, key_version = entry.key_version, "encrypted variables written");
        Ok(EncryptedVariableSummary {
            name,
            key_version: entry.key_version,
            updated_at: entry.updated_at,
        })
    }

    /// Decrypt the entry named `name`.
    pub fn get(&self, name: &str) -> Result<EncryptedVariable> {
        let name = validate_name(name)?;
        let state = self.state.lock();
        let entry = self
            .read_entry(&name)?
            .ok_or_else(|| Error::not_found(format!("encrypted variables \"{name}\" not found")))?;
        if entry.key_version != state.version {
            return Err(Error::Crypto(format!(
                "entry key version {} does not match current key version {}",
                entry.key_version, state.version
            )));
        }
        let data = open_sealed(&state.key, &entry)?;
        Ok(EncryptedVariable {
            name: entry.name,
            data,
            key_version: entry.key_version,
            updated_at: entry.updated_at,
        })
    }

    /// Every entry, by name.
    pub fn list(&self) -> Result<Vec<EncryptedVariableSummary>> {
        let _state = self.state.lock();
        let mut items = Vec::new();
        for name in self.entry_names()? {
            if let Some(entry) = self.read_entry(&name)? {
                items.push(EncryptedVariableSummary {
                    name: entry.name,
                    key_version: entry.key_version,
                    updated_at: entry.updated_at,
                });
            }
        }
        Ok(items)
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let name = validate_name(name)?;
        let _state = self.state.lock();
        let path = self.entry_path(&name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        tracing::info!(name = %name, "encrypted variables deleted");
        Ok(true)
    }

    /// Re-encrypt every entry under `new_passphrase` and bump the key
    /// version. Returns the new version.
    ///
    /// Every entry is decrypted before anything is written, so a wrong
    /// current key fails the rotation without touching the directory.
    pub fn rotate_key(&self, new_passphrase: &str) -> Result<u32> {
        let new_key = derive_key(new_passphrase)?;
        let mut state = self.state.lock();

        let mut plaintexts = Vec::new();
        for name in self.entry_names()? {
            if let Some(entry) = self.read_entry(&name)? {
                plaintexts.push((name, open_sealed(&state.key, &entry)?));
            }
        }

        let next = VaultState {
            key: new_key,
            version: state.version + 1,
        };
        for (name, data) in &plaintexts {
            self.write_entry(&next, name, data)?;
        }
        let manifest = Manifest { current_key_version: next.version };
        write_restricted(&self.dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
        *state = next;

        tracing::info!(key_version = state.version, entries = plaintexts.len(), "encryption key rotated");
        Ok(state.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap()))
    }

    #[test]
    fn test_put_get_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedVariableStore::open(dir.path().join("vars"), "hunter2", clock()).unwrap();
        store.put("db", json!({"password": "s3cret", "port": 5432})).unwrap();

        let got = store.get("db").unwrap();
        assert_eq!(got.data["password"], "s3cret");
        assert_eq!(got.key_version, 1);

        let raw = fs::read_to_string(store.dir().join("db.json")).unwrap();
        assert!(!raw.contains("s3cret"));
        let sealed: SealedEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(BASE64.decode(sealed.nonce).unwrap().len(), NONCE_LEN);

        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(store.dir().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest, json!({"current_key_version": 1}));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("vars");
        let store = EncryptedVariableStore::open(&root, "pw", clock()).unwrap();
        store.put("app", json!({"a": 1})).unwrap();
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&root), 0o755);
        assert_eq!(mode(&root.join("app.json")), 0o600);
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("prod.db-creds_v2").is_ok());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("manifest").is_err());
        assert!(validate_name(" ").is_err());
    }

    #[test]
    fn test_list_delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedVariableStore::open(dir.path(), "pw", clock()).unwrap();
        store.put("b", json!({})).unwrap();
        store.put("a", json!({"x": 1})).unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap_err().kind(), ErrorKind::NotFound);
        assert!(store.put("c", json!([1])).is_err());
    }

    #[test]
    fn test_rotate_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedVariableStore::open(dir.path(), "old", clock()).unwrap();
        store.put("db", json!({"password": "p"})).unwrap();

        assert_eq!(store.rotate_key("new").unwrap(), 2);
        assert_eq!(store.get("db").unwrap().key_version, 2);
        assert_eq!(store.get("db").unwrap().data["password"], "p");

        let reopened = EncryptedVariableStore::open(dir.path(), "new", clock()).unwrap();
        assert_eq!(reopened.key_version(), 2);
        assert_eq!(reopened.get("db").unwrap().data["password"], "p");

        let wrong = EncryptedVariableStore::open(dir.path(), "old", clock()).unwrap();
        assert!(matches!(wrong.get("db").unwrap_err(), Error::Crypto(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_temp_file_is_tightened_and_replaced() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedVariableStore::open(dir.path(), "pw", clock()).unwrap();
        let stale = dir.path().join("app.tmp");
        fs::write(&stale, "leftover").unwrap();
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o644)).unwrap();

        store.put("app", json!({"a": 1})).unwrap();

        assert!(!stale.exists());
        let mode = fs::metadata(dir.path().join("app.json")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(store.get("app").unwrap().data["a"], 1);
    }

    #[test]
    fn test_corrupt_files_are_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedVariableStore::open(dir.path(), "pw", clock()).unwrap();
        store.put("db", json!({"x": 1})).unwrap();

        fs::write(dir.path().join("db.json"), "{not json").unwrap();
        let err = store.get("db").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("corrupt entry \"db\""));
        assert_eq!(store.list().unwrap_err().kind(), ErrorKind::Io);

        fs::write(dir.path().join(MANIFEST_FILE), "[]").unwrap();
        let err = EncryptedVariableStore::open(dir.path(), "pw", clock()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_undecodable_payload_is_io_error() {
        let key = derive_key("pw").unwrap();
        let (ciphertext, nonce) = seal(&key, b"not json").unwrap();
        let entry = SealedEntry {
            name: "db".to_string(),
            key_version: 1,
            ciphertext,
            nonce,
            updated_at: Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap(),
        };
        let err = open_sealed(&key, &entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = EncryptedVariableStore::open(dir.path(), "", clock()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
