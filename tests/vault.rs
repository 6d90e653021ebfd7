use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cuffvault::{
    Collection, FileSlotStore, KdfParams, LoadPolicy, Medication, MemorySlotStore, Reading,
    SlotStore, Vault, VaultError, VaultOptions, parse_backup, serialize_backup, slots,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use zeroize::Zeroizing;

fn options() -> VaultOptions {
    VaultOptions {
        kdf: KdfParams::new(64, 1, 1).unwrap(),
        load_policy: LoadPolicy::Strict,
    }
}

fn pw(s: &str) -> Zeroizing<String> {
    Zeroizing::new(s.to_string())
}

fn r1() -> Reading {
    Reading {
        id: "r1".to_string(),
        systolic: 120,
        diastolic: 80,
        pulse: 70,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        notes: String::new(),
    }
}

fn reading(id: &str, day: u32) -> Reading {
    Reading {
        id: id.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, day, 8, 0, 0).unwrap(),
        ..r1()
    }
}

/// Memory store whose writes start failing after a budget runs out.
struct FlakyStore {
    inner: MemorySlotStore,
    writes_left: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemorySlotStore::new(),
            writes_left: AtomicUsize::new(usize::MAX),
        }
    }

    fn fail_after(&self, writes: usize) {
        self.writes_left.store(writes, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.writes_left.store(usize::MAX, Ordering::SeqCst);
    }

    fn spend_write(&self) -> io::Result<()> {
        self.writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| io::Error::other("injected write failure"))
    }
}

#[async_trait]
impl SlotStore for FlakyStore {
    async fn get(&self, slot: &str) -> io::Result<Option<String>> {
        self.inner.get(slot).await
    }

    async fn put(&self, slot: &str, value: &str) -> io::Result<()> {
        self.spend_write()?;
        self.inner.put(slot, value).await
    }

    async fn remove(&self, slot: &str) -> io::Result<()> {
        self.spend_write()?;
        self.inner.remove(slot).await
    }
}

#[tokio::test]
async fn setup_add_lock_unlock_scenario() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();

    session
        .update(|readings: &mut Collection<Reading>| readings.insert(r1()))
        .await
        .unwrap();
    session.lock().await;
    assert!(session.is_locked().await);
    assert!(matches!(
        session.load::<Reading>().await,
        Err(VaultError::Uninitialized)
    ));

    let session = vault.unlock(pw("abcd")).await.unwrap();
    let readings = session.load::<Reading>().await.unwrap();
    assert_eq!(readings.records(), &[r1()]);

    assert!(matches!(
        vault.unlock(pw("wrong")).await,
        Err(VaultError::Authentication)
    ));
}

#[tokio::test]
async fn failed_unlock_leaves_open_session_working() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();

    assert!(vault.unlock(pw("nope")).await.is_err());

    assert_eq!(session.load::<Reading>().await.unwrap().len(), 1);
    session
        .save(&Collection::<Reading>::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn rotation_scenario() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();
    let mut meds = Collection::new();
    meds.insert(Medication::new("Lisinopril", "10mg", "daily").unwrap());
    session.save(&meds).await.unwrap();

    session
        .change_password(pw("abcd"), pw("efgh"))
        .await
        .unwrap();

    // the rotating session keeps working under the new key
    assert_eq!(session.load::<Reading>().await.unwrap().records(), &[r1()]);

    assert!(matches!(
        vault.unlock(pw("abcd")).await,
        Err(VaultError::Authentication)
    ));
    let fresh = vault.unlock(pw("efgh")).await.unwrap();
    assert_eq!(fresh.load::<Reading>().await.unwrap().records(), &[r1()]);
    assert_eq!(fresh.load::<Medication>().await.unwrap(), meds);
    assert_eq!(vault.store().get(slots::ROTATION_JOURNAL).await.unwrap(), None);
}

#[tokio::test]
async fn rotation_with_wrong_old_password_changes_nothing() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();
    let salt_before = vault.store().get(slots::SALT).await.unwrap();
    let blob_before = vault.store().get(slots::READINGS).await.unwrap();

    assert!(matches!(
        session.change_password(pw("zzzz"), pw("efgh")).await,
        Err(VaultError::Authentication)
    ));

    assert_eq!(vault.store().get(slots::SALT).await.unwrap(), salt_before);
    assert_eq!(vault.store().get(slots::READINGS).await.unwrap(), blob_before);
    vault.unlock(pw("abcd")).await.unwrap();
}

#[tokio::test]
async fn rotation_rejects_short_new_password() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    assert!(matches!(
        session.change_password(pw("abcd"), pw("ab")).await,
        Err(VaultError::WeakPassword)
    ));
    vault.unlock(pw("abcd")).await.unwrap();
}

#[tokio::test]
async fn rotation_aborts_on_undecryptable_collection() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();

    // a medications blob sealed under some other key
    let other = Vault::new(MemorySlotStore::new(), options());
    let other_session = other.setup(pw("other")).await.unwrap();
    other_session
        .save(&Collection::from_records(vec![Medication::new("X", "1mg", "daily").unwrap()]))
        .await
        .unwrap();
    let foreign = other.store().get(slots::MEDICATIONS).await.unwrap().unwrap();
    vault.store().put(slots::MEDICATIONS, &foreign).await.unwrap();

    assert!(matches!(
        session.change_password(pw("abcd"), pw("efgh")).await,
        Err(VaultError::Decryption)
    ));
    assert_eq!(vault.store().get(slots::ROTATION_JOURNAL).await.unwrap(), None);
    vault.unlock(pw("abcd")).await.unwrap();
}

#[tokio::test]
async fn interrupted_commit_is_never_mixed() {
    // journal write, five slot writes, journal removal
    for budget in 0..8 {
        let vault = Vault::new(FlakyStore::new(), options());
        let session = vault.setup(pw("abcd")).await.unwrap();
        let readings = Collection::from_records(vec![r1(), reading("r2", 2)]);
        session.save(&readings).await.unwrap();
        let mut meds = Collection::new();
        meds.insert(Medication::new("Lisinopril", "10mg", "daily").unwrap());
        session.save(&meds).await.unwrap();

        vault.store().fail_after(budget);
        let outcome = session.change_password(pw("abcd"), pw("efgh")).await;
        vault.store().heal();

        match &outcome {
            Ok(()) => assert!(!session.is_locked().await),
            Err(VaultError::RotationIncomplete) => assert!(session.is_locked().await),
            Err(VaultError::Storage(_)) => assert!(!session.is_locked().await),
            Err(other) => panic!("budget {budget}: unexpected error {other}"),
        }

        let old = vault.unlock(pw("abcd")).await;
        let new = vault.unlock(pw("efgh")).await;
        let unlocked = match (old, new) {
            (Ok(s), Err(VaultError::Authentication)) => {
                assert!(matches!(outcome, Err(VaultError::Storage(_))), "budget {budget}");
                s
            }
            (Err(VaultError::Authentication), Ok(s)) => {
                assert!(!matches!(outcome, Err(VaultError::Storage(_))), "budget {budget}");
                s
            }
            (old, new) => panic!(
                "budget {budget}: old ok={} new ok={}",
                old.is_ok(),
                new.is_ok()
            ),
        };

        assert_eq!(unlocked.load::<Reading>().await.unwrap(), readings);
        assert_eq!(unlocked.load::<Medication>().await.unwrap(), meds);
        assert_eq!(vault.store().get(slots::ROTATION_JOURNAL).await.unwrap(), None);
    }
}

/// Vault whose first session committed a password change that only partly
/// reached the slots; the second session was opened before it.
async fn half_rotated() -> (
    Vault<FlakyStore>,
    cuffvault::Session<FlakyStore>,
    cuffvault::Session<FlakyStore>,
) {
    let vault = Vault::new(FlakyStore::new(), options());
    let first = vault.setup(pw("abcd")).await.unwrap();
    first
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();
    let second = vault.unlock(pw("abcd")).await.unwrap();

    // journal and one slot land, the second slot write fails
    vault.store().fail_after(2);
    assert!(matches!(
        first.change_password(pw("abcd"), pw("efgh")).await,
        Err(VaultError::RotationIncomplete)
    ));
    vault.store().heal();
    (vault, first, second)
}

#[tokio::test]
async fn older_session_cannot_write_into_half_applied_change() {
    let (vault, _first, second) = half_rotated().await;

    assert!(matches!(
        second
            .save(&Collection::from_records(vec![r1(), reading("r2", 2)]))
            .await,
        Err(VaultError::RotationIncomplete)
    ));
    assert!(matches!(
        second
            .update(|readings: &mut Collection<Reading>| readings.insert(reading("r3", 3)))
            .await,
        Err(VaultError::RotationIncomplete)
    ));
    assert!(matches!(
        second.load::<Reading>().await,
        Err(VaultError::RotationIncomplete)
    ));

    let fresh = vault.unlock(pw("efgh")).await.unwrap();
    assert_eq!(fresh.load::<Reading>().await.unwrap().records(), &[r1()]);
}

#[tokio::test]
async fn second_change_cannot_override_committed_one() {
    let (vault, _first, second) = half_rotated().await;

    assert!(matches!(
        second.change_password(pw("abcd"), pw("ijkl")).await,
        Err(VaultError::Authentication)
    ));
    assert_eq!(vault.store().get(slots::ROTATION_JOURNAL).await.unwrap(), None);

    assert!(matches!(
        vault.unlock(pw("ijkl")).await,
        Err(VaultError::Authentication)
    ));
    let fresh = vault.unlock(pw("efgh")).await.unwrap();
    assert_eq!(fresh.load::<Reading>().await.unwrap().records(), &[r1()]);
}

#[tokio::test]
async fn change_after_committed_one_starts_from_new_password() {
    let (vault, _first, second) = half_rotated().await;

    second
        .change_password(pw("efgh"), pw("ijkl"))
        .await
        .unwrap();

    assert!(vault.unlock(pw("efgh")).await.is_err());
    let fresh = vault.unlock(pw("ijkl")).await.unwrap();
    assert_eq!(fresh.load::<Reading>().await.unwrap().records(), &[r1()]);
}

#[tokio::test]
async fn dropped_rotation_future_still_completes() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();

    let _ = tokio::time::timeout(
        Duration::ZERO,
        session.change_password(pw("abcd"), pw("efgh")),
    )
    .await;

    let mut unlocked = None;
    for _ in 0..200 {
        if let Ok(s) = vault.unlock(pw("efgh")).await {
            unlocked = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let unlocked = unlocked.expect("rotation did not complete");
    assert_eq!(unlocked.load::<Reading>().await.unwrap().records(), &[r1()]);
    assert!(vault.unlock(pw("abcd")).await.is_err());
}

#[tokio::test]
async fn stale_session_cannot_write() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let first = vault.setup(pw("abcd")).await.unwrap();
    let second = vault.unlock(pw("abcd")).await.unwrap();
    second
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();

    first
        .change_password(pw("abcd"), pw("efgh"))
        .await
        .unwrap();

    assert!(matches!(
        second.save(&Collection::from_records(vec![r1()])).await,
        Err(VaultError::StaleSession)
    ));
    assert!(matches!(
        second.load::<Reading>().await,
        Err(VaultError::Decryption)
    ));
}

#[tokio::test]
async fn encrypted_backup_is_bound_to_its_epoch() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![r1()]))
        .await
        .unwrap();

    let backup = session.export_encrypted::<Reading>().await.unwrap();
    let text = serialize_backup(&backup).unwrap();
    let backup = parse_backup(&text).unwrap();
    assert!(backup.encrypted);
    assert_eq!(
        session.import::<Reading>(&backup).await.unwrap().records(),
        &[r1()]
    );

    session
        .change_password(pw("abcd"), pw("efgh"))
        .await
        .unwrap();
    let fresh = vault.unlock(pw("efgh")).await.unwrap();
    assert!(matches!(
        fresh.import::<Reading>(&backup).await,
        Err(VaultError::SaltMismatch)
    ));
}

#[tokio::test]
async fn plain_backup_import_is_idempotent() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = vault.setup(pw("abcd")).await.unwrap();
    session
        .save(&Collection::from_records(vec![reading("a", 3)]))
        .await
        .unwrap();

    let source = Vault::new(MemorySlotStore::new(), options());
    let source_session = source.setup(pw("wxyz")).await.unwrap();
    source_session
        .save(&Collection::from_records(vec![reading("b", 5), reading("a", 3)]))
        .await
        .unwrap();
    let backup = parse_backup(
        &serialize_backup(&source_session.export_plain::<Reading>().await.unwrap()).unwrap(),
    )
    .unwrap();

    assert_eq!(session.import_and_merge::<Reading>(&backup).await.unwrap(), 1);
    let once = session.load::<Reading>().await.unwrap();

    assert_eq!(session.import_and_merge::<Reading>(&backup).await.unwrap(), 0);
    let twice = session.load::<Reading>().await.unwrap();

    assert_eq!(once, twice);
    let ids: Vec<_> = twice.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["b", "a"]);
}

#[tokio::test]
async fn concurrent_updates_are_not_lost() {
    let vault = Vault::new(MemorySlotStore::new(), options());
    let session = Arc::new(vault.setup(pw("abcd")).await.unwrap());

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let id = format!("w{worker}-{i}");
                session
                    .update(move |readings: &mut Collection<Reading>| {
                        readings.insert(Reading { id, ..r1() })
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(session.load::<Reading>().await.unwrap().len(), 40);
}

#[tokio::test]
async fn lenient_policy_starts_empty_on_corrupt_blob() {
    let mut opts = options();
    opts.load_policy = LoadPolicy::Lenient;
    let vault = Vault::new(MemorySlotStore::new(), opts);
    let session = vault.setup(pw("abcd")).await.unwrap();
    vault
        .store()
        .put(slots::READINGS, r#"{"nonce":"AAAAAAAAAAAAAAAA","ciphertext":"AAAA"}"#)
        .await
        .unwrap();

    assert!(session.load::<Reading>().await.unwrap().is_empty());
}

#[tokio::test]
async fn file_backed_vault_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let vault = Vault::new(FileSlotStore::new(dir.path().to_path_buf()), options());
        let session = vault.setup(pw("abcd")).await.unwrap();
        session
            .save(&Collection::from_records(vec![r1()]))
            .await
            .unwrap();
    }

    let vault = Vault::new(FileSlotStore::new(dir.path().to_path_buf()), options());
    assert!(vault.is_set_up().await.unwrap());
    let session = vault.unlock(pw("abcd")).await.unwrap();
    assert_eq!(session.load::<Reading>().await.unwrap().records(), &[r1()]);

    let salt = std::fs::read_to_string(dir.path().join(slots::SALT)).unwrap();
    assert_eq!(salt.len(), 24);
    assert!(std::fs::read_to_string(dir.path().join(slots::READINGS))
        .unwrap()
        .contains("\"nonce\""));
}
