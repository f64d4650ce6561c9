//! Free-DB bookkeeping and page reclamation under reader snapshots

use decafdb::{EnvBuilder, EnvFlags, Environment, Pgno, TxnId};
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> Environment {
    EnvBuilder::new()
        .map_size(64 * 1024 * 1024)
        .flags(EnvFlags::CREATE)
        .open(dir.path().join("cache.db"))
        .expect("open env")
}

#[test]
fn test_free_db_records_retired_pages() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    // First commit builds the tree from nothing: no page is retired, so the
    // free DB stays empty.
    {
        let mut txn = env.write_txn()?;
        for i in 0..200 {
            txn.put(format!("key{i:03}").as_bytes(), &[0u8; 64])?;
        }
        txn.commit()?;
    }
    let first = env.info()?.txnid;
    {
        let txn = env.read_txn()?;
        assert_eq!(txn.retired_pages(first)?, None);
    }

    // The next commit rewrites existing pages; every CoW retires one.
    {
        let mut txn = env.write_txn()?;
        txn.del(b"key000")?;
        txn.commit()?;
    }
    let second = env.info()?.txnid;

    let txn = env.read_txn()?;
    let retired = txn.retired_pages(second)?.expect("free-DB entry for the commit");
    assert!(!retired.is_empty());
    let last = txn.last_pgno();
    for pgno in &retired {
        assert!(pgno.0 >= 2, "meta pages must never be retired");
        assert!(*pgno <= last);
    }
    let mut sorted = retired.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, retired, "entry must be sorted and duplicate-free");

    // Queries for txnids that freed nothing come back empty.
    assert_eq!(txn.retired_pages(TxnId(second.0 + 100))?, None);
    assert_eq!(txn.retired_pages(TxnId(1))?, None);
    Ok(())
}

#[test]
fn test_reclamation_waits_for_readers() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    // Populate 500 keys.
    {
        let mut txn = env.write_txn()?;
        for i in 0..500 {
            txn.put(format!("key_{i:03}").as_bytes(), &[7u8; 64])?;
        }
        txn.commit()?;
    }

    // Delete the upper half; the CoW copies retire a batch of pages.
    {
        let mut txn = env.write_txn()?;
        for i in 250..500 {
            txn.del(format!("key_{i:03}").as_bytes())?;
        }
        txn.commit()?;
    }
    let delete_txn = env.info()?.txnid;
    {
        let txn = env.read_txn()?;
        assert!(txn.retired_pages(delete_txn)?.is_some());
    }

    // A reader pins the post-delete snapshot: nothing may be reused.
    let pinned = env.read_txn()?;
    assert_eq!(pinned.id(), delete_txn);

    let before = env.info()?.last_pgno;
    {
        let mut txn = env.write_txn()?;
        for i in 600..900 {
            txn.put(format!("key_{i:03}").as_bytes(), &[8u8; 64])?;
        }
        txn.commit()?;
    }
    let after_pinned = env.info()?.last_pgno;
    assert!(
        after_pinned > before,
        "allocation extended the file while a reader pinned the snapshot"
    );

    // The pinned snapshot still sees exactly its tree.
    assert_eq!(pinned.get(b"key_000")?, Some(&[7u8; 64][..]));
    assert_eq!(pinned.get(b"key_300")?, None);
    assert_eq!(pinned.get(b"key_600")?, None);
    pinned.abort();

    // With no readers left, the retired pages satisfy the next writer and
    // the file does not grow.
    let before = env.info()?.last_pgno;
    {
        let mut txn = env.write_txn()?;
        for i in 900..999 {
            txn.put(format!("key_{i:03}").as_bytes(), &[9u8; 64])?;
        }
        txn.commit()?;
    }
    let after = env.info()?.last_pgno;
    assert_eq!(after, before, "writer should have reused retired pages");
    Ok(())
}

#[test]
fn test_consumed_entries_leave_the_free_db() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    {
        let mut txn = env.write_txn()?;
        for i in 0..300 {
            txn.put(format!("key{i:03}").as_bytes(), &[1u8; 64])?;
        }
        txn.commit()?;
    }
    {
        let mut txn = env.write_txn()?;
        for i in 0..300 {
            txn.del(format!("key{i:03}").as_bytes())?;
        }
        txn.commit()?;
    }
    let freeing_txn = env.info()?.txnid;
    let pool: Vec<Pgno> = {
        let txn = env.read_txn()?;
        txn.retired_pages(freeing_txn)?.expect("retired pages recorded")
    };
    assert!(!pool.is_empty());

    // Enough churn to drain the pool.
    for round in 0..6 {
        let mut txn = env.write_txn()?;
        for i in 0..120 {
            txn.put(format!("fill{round}{i:03}").as_bytes(), &[2u8; 64])?;
        }
        txn.commit()?;
    }

    let txn = env.read_txn()?;
    match txn.retired_pages(freeing_txn)? {
        // Fully consumed: the entry is gone.
        None => {}
        // Partially consumed: whatever remains must be a subset.
        Some(rest) => {
            assert!(rest.len() < pool.len());
            for pgno in rest {
                assert!(pool.contains(&pgno));
            }
        }
    }
    Ok(())
}

#[test]
fn test_no_double_allocation_of_pinned_pages() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    {
        let mut txn = env.write_txn()?;
        for i in 0..200 {
            txn.put(format!("a{i:03}").as_bytes(), &[3u8; 80])?;
        }
        txn.commit()?;
    }
    let reader = env.read_txn()?;

    // Writers churn while the reader is pinned; if any page the reader can
    // see were recycled, the scan below would observe corrupt entries.
    for round in 0..5u8 {
        let mut txn = env.write_txn()?;
        for i in 0..200 {
            let key = format!("a{i:03}");
            txn.del(key.as_bytes())?;
            txn.put(key.as_bytes(), &[10 + round; 80])?;
        }
        txn.commit()?;
    }

    let mut cursor = reader.cursor();
    let mut count = 0;
    let mut item = cursor.first()?;
    while let Some((key, value)) = item {
        assert!(key.starts_with(b"a"));
        assert_eq!(value, &[3u8; 80][..]);
        count += 1;
        item = cursor.next()?;
    }
    assert_eq!(count, 200);
    Ok(())
}
