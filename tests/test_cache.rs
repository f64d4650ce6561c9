//! Cache layer: exclusive locking, upsert/lookup, mark-and-sweep

use decafdb::{Cache, CacheEntry, Error};
use tempfile::TempDir;

fn entry(seed: u8) -> CacheEntry {
    CacheEntry::new(
        1_700_000_000 + seed as u64,
        1_690_000_000 + seed as u64,
        512 * seed as u64,
        [seed; 16],
    )
}

#[test]
fn test_second_opener_gets_busy() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hashes.db");

    let cache = Cache::open(&path)?;
    assert!(matches!(Cache::open(&path), Err(Error::Busy)));

    // Closing releases the lock for the next opener.
    cache.close()?;
    let cache = Cache::open(&path)?;
    cache.close()?;
    Ok(())
}

#[test]
fn test_upsert_lookup_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hashes.db");
    let cache = Cache::open(&path)?;

    {
        let mut txn = cache.begin_write()?;
        cache.upsert(&mut txn, b"/photos/a.jpg", &entry(1))?;
        cache.upsert(&mut txn, b"/photos/b.jpg", &entry(2))?;
        txn.commit()?;
    }
    {
        let txn = cache.begin_read()?;
        let found = cache.lookup(&txn, b"/photos/a.jpg")?.expect("entry");
        assert_eq!(found.mtime(), entry(1).mtime());
        assert_eq!(found.hash(), [1u8; 16]);
        assert!(cache.lookup(&txn, b"/photos/missing.jpg")?.is_none());
    }

    // Upsert replaces in place.
    {
        let mut txn = cache.begin_write()?;
        cache.upsert(&mut txn, b"/photos/a.jpg", &entry(9))?;
        txn.commit()?;
    }
    {
        let txn = cache.begin_read()?;
        let found = cache.lookup(&txn, b"/photos/a.jpg")?.expect("entry");
        assert_eq!(found.size(), entry(9).size());
        assert_eq!(found.hash(), [9u8; 16]);
    }

    // Records survive close and reopen.
    cache.close()?;
    let cache = Cache::open(&path)?;
    let txn = cache.begin_read()?;
    let found = cache.lookup(&txn, b"/photos/b.jpg")?.expect("entry");
    assert_eq!(found.ctime(), entry(2).ctime());
    Ok(())
}

#[test]
fn test_abort_write_leaves_cache_unchanged() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cache = Cache::open(dir.path().join("hashes.db"))?;

    {
        let mut txn = cache.begin_write()?;
        cache.upsert(&mut txn, b"/stable", &entry(5))?;
        txn.commit()?;
    }
    {
        let mut txn = cache.begin_write()?;
        cache.upsert(&mut txn, b"/stable", &entry(6))?;
        cache.upsert(&mut txn, b"/new", &entry(7))?;
        txn.abort();
    }

    let txn = cache.begin_read()?;
    assert_eq!(cache.lookup(&txn, b"/stable")?.expect("entry").hash(), [5u8; 16]);
    assert!(cache.lookup(&txn, b"/new")?.is_none());
    Ok(())
}

#[test]
fn test_mark_and_sweep() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cache = Cache::open(dir.path().join("hashes.db"))?;

    {
        let mut txn = cache.begin_write()?;
        for i in 0..20u8 {
            cache.upsert(&mut txn, format!("/files/{i:02}").as_bytes(), &entry(i))?;
        }
        txn.commit()?;
    }

    // A scan only saw the even-numbered files; marking twice is harmless.
    for i in (0..20u8).step_by(2) {
        cache.mark_visited(format!("/files/{i:02}").as_bytes());
        cache.mark_visited(format!("/files/{i:02}").as_bytes());
    }

    assert_eq!(cache.sweep()?, 10);

    let txn = cache.begin_read()?;
    for i in 0..20u8 {
        let present = cache.lookup(&txn, format!("/files/{i:02}").as_bytes())?.is_some();
        assert_eq!(present, i % 2 == 0, "file {i:02}");
    }
    drop(txn);

    // The visited set was cleared: a sweep with no marks removes the rest.
    assert_eq!(cache.sweep()?, 10);
    let txn = cache.begin_read()?;
    assert!(cache.lookup(&txn, b"/files/00")?.is_none());
    Ok(())
}

#[test]
fn test_sweep_on_empty_cache() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let cache = Cache::open(dir.path().join("hashes.db"))?;
    assert_eq!(cache.sweep()?, 0);
    cache.mark_visited(b"/never/stored");
    assert_eq!(cache.sweep()?, 0);
    Ok(())
}
