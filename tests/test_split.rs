//! Page splits, multi-level trees, and ordering under bulk insertion

use decafdb::{EnvBuilder, EnvFlags, Environment};
use rand::seq::SliceRandom;
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> Environment {
    EnvBuilder::new()
        .map_size(64 * 1024 * 1024)
        .flags(EnvFlags::CREATE)
        .open(dir.path().join("cache.db"))
        .expect("open env")
}

#[test]
fn test_bulk_insert_splits_and_iterates() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);
    let value = [0x5Au8; 80];

    {
        let mut txn = env.write_txn()?;
        for i in 0..100 {
            txn.put(format!("key_{i:03}").as_bytes(), &value)?;
        }
        txn.commit()?;
    }

    let txn = env.read_txn()?;
    let stat = txn.stat()?;
    assert!(stat.depth >= 2, "expected a branch root, got depth {}", stat.depth);
    assert!(stat.branch_pages >= 1);
    assert!(stat.leaf_pages >= 2);
    assert_eq!(stat.entries, 100);

    // FIRST + NEXT visits every key exactly once, ascending.
    let mut cursor = txn.cursor();
    let mut forward = Vec::new();
    let mut item = cursor.first()?;
    while let Some((key, val)) = item {
        assert_eq!(val, &value[..]);
        forward.push(key.to_vec());
        item = cursor.next()?;
    }
    let expected: Vec<Vec<u8>> =
        (0..100).map(|i| format!("key_{i:03}").into_bytes()).collect();
    assert_eq!(forward, expected);

    // LAST + PREV visits the same keys in reverse.
    let mut cursor = txn.cursor();
    let mut backward = Vec::new();
    let mut item = cursor.last()?;
    while let Some((key, _)) = item {
        backward.push(key.to_vec());
        item = cursor.prev()?;
    }
    backward.reverse();
    assert_eq!(backward, expected);
    Ok(())
}

#[test]
fn test_insertion_order_is_irrelevant() -> Result<(), Box<dyn std::error::Error>> {
    let mut keys: Vec<Vec<u8>> =
        (0..200).map(|i| format!("entry/{i:04}").into_bytes()).collect();
    let sorted = keys.clone();

    let mut rng = rand::thread_rng();
    for round in 0..3 {
        keys.shuffle(&mut rng);

        let dir = TempDir::new()?;
        let env = open_env(&dir);
        let mut txn = env.write_txn()?;
        for key in &keys {
            txn.put(key, &[round as u8; 48])?;
        }
        txn.commit()?;

        let txn = env.read_txn()?;
        let mut cursor = txn.cursor();
        let mut seen = Vec::new();
        let mut item = cursor.first()?;
        while let Some((key, _)) = item {
            seen.push(key.to_vec());
            item = cursor.next()?;
        }
        assert_eq!(seen, sorted, "round {round} produced wrong order");
    }
    Ok(())
}

#[test]
fn test_values_survive_splits() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    // Values large enough that a handful of keys overflows a page.
    let mut txn = env.write_txn()?;
    for i in 0..64 {
        let value = vec![i as u8; 900];
        txn.put(format!("blob{i:02}").as_bytes(), &value)?;
    }
    txn.commit()?;

    let txn = env.read_txn()?;
    assert!(txn.stat()?.depth >= 2);
    for i in 0..64 {
        let value = txn.get(format!("blob{i:02}").as_bytes())?.expect("value present");
        assert_eq!(value.len(), 900);
        assert!(value.iter().all(|&b| b == i as u8));
    }
    Ok(())
}

#[test]
fn test_multilevel_tree_with_larger_keyset() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let env = open_env(&dir);

    // Spread the load over several commits the way a real scan would.
    for chunk in 0..10 {
        let mut txn = env.write_txn()?;
        for i in 0..200 {
            let n = chunk * 200 + i;
            txn.put(format!("path/{n:05}").as_bytes(), &[0u8; 40])?;
        }
        txn.commit()?;
    }

    let txn = env.read_txn()?;
    let stat = txn.stat()?;
    assert_eq!(stat.entries, 2000);
    assert!(stat.depth >= 2);

    // Spot checks at page boundaries found by a full scan.
    let mut cursor = txn.cursor();
    let mut count = 0usize;
    let mut prev: Option<Vec<u8>> = None;
    let mut item = cursor.first()?;
    while let Some((key, _)) = item {
        if let Some(p) = &prev {
            assert!(p.as_slice() < key, "keys out of order");
        }
        prev = Some(key.to_vec());
        count += 1;
        item = cursor.next()?;
    }
    assert_eq!(count, 2000);
    Ok(())
}
