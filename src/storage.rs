//! Key-value slot storage.
//!
//! Every persisted value is an opaque string in a named slot. Writes to a
//! single slot are atomic: a reader sees the old value or the new one,
//! never a torn write.

use async_trait::async_trait;
use getrandom::fill;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Names of the slots the vault owns.
pub mod slots {
    pub const SALT: &str = "salt";
    pub const KDF: &str = "kdf";
    pub const VERIFY_TOKEN: &str = "verify-token";
    pub const READINGS: &str = "readings-blob";
    pub const MEDICATIONS: &str = "medications-blob";
    pub const ROTATION_JOURNAL: &str = "rotation-journal";
}

/// A persistence backend holding named string slots.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Returns `None` when the slot was never written or was removed.
    async fn get(&self, slot: &str) -> io::Result<Option<String>>;

    /// Overwrites the slot atomically.
    async fn put(&self, slot: &str, value: &str) -> io::Result<()>;

    /// Removes the slot. Removing a missing slot is not an error.
    async fn remove(&self, slot: &str) -> io::Result<()>;
}

/// In-memory slots, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.slots
            .lock()
            .map_err(|_| io::Error::other("slot map poisoned"))
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn get(&self, slot: &str) -> io::Result<Option<String>> {
        Ok(self.lock()?.get(slot).cloned())
    }

    async fn put(&self, slot: &str, value: &str) -> io::Result<()> {
        self.lock()?.insert(slot.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, slot: &str) -> io::Result<()> {
        self.lock()?.remove(slot);
        Ok(())
    }
}

/// Slots stored as one file each inside a directory.
///
/// File I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileSlotStore {
    dir: PathBuf,
}

impl FileSlotStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Returns the directory holding the slot files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> io::Result<PathBuf> {
        if slot.is_empty() || slot.contains(['/', '\\']) || slot.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid slot name '{slot}'"),
            ));
        }
        Ok(self.dir.join(slot))
    }
}

#[async_trait]
impl SlotStore for FileSlotStore {
    async fn get(&self, slot: &str) -> io::Result<Option<String>> {
        let path = self.slot_path(slot)?;
        blocking(move || match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn put(&self, slot: &str, value: &str) -> io::Result<()> {
        let path = self.slot_path(slot)?;
        let value = value.to_string();
        blocking(move || write_atomic(&path, value.as_bytes())).await
    }

    async fn remove(&self, slot: &str) -> io::Result<()> {
        let path = self.slot_path(slot)?;
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

/// Writes `data` to `path` so that a crash leaves either the old or the new
/// content in place:
/// 1. write to a temporary file with a random name in the same directory
/// 2. fsync the temporary file
/// 3. replace the target with the temporary file
/// 4. fsync the parent directory so the rename is persisted
///
/// Creates parent directories if they don't exist.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = random_tmp_path(path)?;

    // fails if the name is taken
    let mut tmp_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;

    tmp_file.write_all(data)?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    if let Err(e) = atomic_replace(path, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    #[cfg(not(target_os = "windows"))]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }

    Ok(())
}

/// `<slot>.tmp.<16 hex chars>` next to the target.
fn random_tmp_path(path: &Path) -> io::Result<PathBuf> {
    let mut buf = [0u8; 8];
    fill(&mut buf).map_err(|_| io::Error::other("OS random generator unavailable"))?;

    let rand_string = buf.iter().map(|b| format!("{:02x}", b)).collect::<String>();

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "slot path has no file name"))?
        .to_string_lossy();

    Ok(path.with_file_name(format!("{file_name}.tmp.{rand_string}")))
}

/// Uses `ReplaceFileW` with `REPLACEFILE_WRITE_THROUGH` when the target
/// exists; a first write is a plain rename.
#[cfg(target_os = "windows")]
fn atomic_replace(target: &Path, tmp_path: &Path) -> io::Result<()> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

    if !target.exists() {
        return fs::rename(tmp_path, target);
    }

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    let target_w = to_wide(target.as_os_str());
    let tmp_w = to_wide(tmp_path.as_os_str());

    // SAFETY:
    // - Strings are valid UTF-16 and null-terminated
    // - Pointers remain valid during the call
    // - Windows does not retain the pointers after return
    let result = unsafe {
        ReplaceFileW(
            target_w.as_ptr(),
            tmp_w.as_ptr(),
            std::ptr::null(),
            REPLACEFILE_WRITE_THROUGH,
            std::ptr::null(),
            std::ptr::null(),
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// `rename()` is atomic when both paths are on the same filesystem.
#[cfg(not(target_os = "windows"))]
fn atomic_replace(target: &Path, tmp_path: &Path) -> io::Result<()> {
    fs::rename(tmp_path, target)
}
