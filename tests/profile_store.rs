use anyhow::Result;
use tempfile::tempdir;

use kiosk_vision::profile::{Category, FieldStatus};
use kiosk_vision::storage::{
    shared_memory_uri, InMemoryProfileStore, ProfileStore, SqliteProfileStore,
};
use kiosk_vision::synthetic::{empty_kiosk, hat_wearer};
use kiosk_vision::{present, Analyzer, AnalyzerConfig, CustomerProfile};

fn profiles() -> Result<(CustomerProfile, CustomerProfile)> {
    let analyzer = Analyzer::new(AnalyzerConfig::default())?;
    let empty = empty_kiosk();
    let hat = hat_wearer();
    Ok((
        present(analyzer.analyze(&empty.frame, &empty.context)?),
        present(analyzer.analyze(&hat.frame, &hat.context)?),
    ))
}

fn exercise_store(store: &mut dyn ProfileStore) -> Result<()> {
    let (first, second) = profiles()?;
    assert!(store.latest_profile("kiosk-1:s1")?.is_none());

    let a = store.record_profile("kiosk-1:s1", &first)?;
    let b = store.record_profile("kiosk-1:s1", &second)?;
    store.record_profile("kiosk-2:s9", &first)?;
    assert!(b.id > a.id);
    assert_eq!(a.digest.len(), 64);

    let latest = store.latest_profile("kiosk-1:s1")?.expect("latest profile");
    assert_eq!(latest.id, b.id);
    assert_eq!(latest.profile, second);

    let history = store.profiles_for_session("kiosk-1:s1", 10)?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, b.id);
    assert_eq!(history[1].profile, first);
    assert_eq!(store.profiles_for_session("kiosk-1:s1", 1)?.len(), 1);

    assert!(store.record_profile("bad session", &first).is_err());
    assert!(store.latest_profile("").is_err());
    Ok(())
}

#[test]
fn sqlite_store_records_newest_first() -> Result<()> {
    let mut store = SqliteProfileStore::open(&shared_memory_uri())?;
    exercise_store(&mut store)
}

#[test]
fn in_memory_store_matches_sqlite_semantics() -> Result<()> {
    let mut store = InMemoryProfileStore::new();
    exercise_store(&mut store)?;
    assert_eq!(store.len(), 3);
    Ok(())
}

#[test]
fn sqlite_profiles_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("profiles.db");
    let db_path = db_path.to_string_lossy().to_string();
    let (_, hat) = profiles()?;

    {
        let mut store = SqliteProfileStore::open(&db_path)?;
        store.record_profile("kiosk-3:s1", &hat)?;
    }

    let mut store = SqliteProfileStore::open(&db_path)?;
    let stored = store.latest_profile("kiosk-3:s1")?.expect("stored profile");
    assert_eq!(stored.profile.label(Category::HeadAccessory), "hat");
    assert_eq!(
        stored.profile.field(Category::BagAccessory).status,
        FieldStatus::NoEvidence
    );
    Ok(())
}

#[test]
fn tampered_payload_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("profiles.db");
    let db_path = db_path.to_string_lossy().to_string();
    let (first, _) = profiles()?;

    let mut store = SqliteProfileStore::open(&db_path)?;
    store.record_profile("kiosk-4:s1", &first)?;

    let conn = rusqlite::Connection::open(&db_path)?;
    conn.execute(
        "UPDATE profiles SET payload_json = replace(payload_json, 'none', 'hat')",
        [],
    )?;

    assert!(store.latest_profile("kiosk-4:s1").is_err());
    Ok(())
}
