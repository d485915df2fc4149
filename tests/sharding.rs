mod common;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use shardpack::{codec, hasher, Backend, Bucket, Item, MemoryBackend, Options};

/// The split algorithm itself: an overflowing leaf must end up as a small
/// internal record whose children carry every item, each child keyed by the
/// parent key plus one shard label of the item's digest.
#[test]
fn test_split_redistributes_items_into_children() -> Result<()> {
    let backend = Arc::new(MemoryBackend::with_max_value_size(4 * 1024));
    let ctx = common::ctx();
    let packer = common::open_packer(
        &backend,
        Options::new().base_bucket_bits(8).shard_bucket_bits(4),
    )?;

    // Items that all route into one base bucket, big enough in aggregate to
    // overflow the 4 KiB cap several times over.
    let (prefix, ids) = common::ids_sharing_base_prefix(2, 24);
    for id in &ids {
        packer.put_item(&ctx, &Item::new(id.as_str(), common::opaque_payload(id, 512)))?;
    }

    let parent = codec::decode(&common::stored_bucket_bytes(&backend, &prefix)?.unwrap())?;
    assert!(parent.is_internal(), "overflowing parent must become internal");
    assert!(parent.items.is_empty(), "internal buckets never hold items");
    assert!(parent.children.keys().all(|label| label.len() == 1));

    // Every item must be in exactly the child owning its next digest label,
    // and the union of the children must be the full original set.
    let mut recovered = Vec::new();
    for key in common::stored_bucket_keys(&backend)? {
        if key == prefix || !key.starts_with(&prefix) {
            continue;
        }
        let child = codec::decode(&common::stored_bucket_bytes(&backend, &key)?.unwrap())?;
        for id in child.items.keys() {
            assert!(
                hasher::digest(id).starts_with(&key),
                "item {id} landed in child {key} that does not own its digest"
            );
            recovered.push(id.clone());
        }
    }
    recovered.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(recovered, expected);

    // And the packer still serves every item.
    for id in &ids {
        assert_eq!(
            packer.get_item(&ctx, id)?.unwrap().payload,
            common::opaque_payload(id, 512)
        );
    }
    Ok(())
}

#[test]
fn test_sharding_at_scale_survives_reopen() -> Result<()> {
    const MAX_ENTRY: usize = 128 * 1024;
    const PAYLOAD: usize = 20 * 1024;
    const COUNT: usize = 5000;

    let backend = Arc::new(MemoryBackend::with_max_value_size(MAX_ENTRY));
    let ctx = common::ctx();

    {
        let packer = common::open_packer(&backend, Options::new())?;
        for i in 0..COUNT {
            let id = format!("{i:05}");
            packer.put_item(&ctx, &Item::new(id.as_str(), common::opaque_payload(&id, PAYLOAD)))?;
        }
    }

    // Every persisted entry respects the size cap (the backend enforces it,
    // this is the belt to its suspenders), leaves are non-empty, and no leaf
    // shadows another.
    let keys = common::stored_bucket_keys(&backend)?;
    let mut leaf_keys = Vec::new();
    for key in &keys {
        let bytes = common::stored_bucket_bytes(&backend, key)?.unwrap();
        assert!(bytes.len() <= MAX_ENTRY, "bucket {key} exceeds the entry cap");
        let bucket = codec::decode(&bytes)?;
        if !bucket.is_internal() {
            assert!(!bucket.items.is_empty(), "leaf {key} should hold items");
            leaf_keys.push(key.clone());
        }
    }
    common::assert_prefix_free(&leaf_keys);

    // A reopened packer re-routes every id to its item.
    let packer = common::open_packer(&backend, Options::new())?;
    for i in 0..COUNT {
        let id = format!("{i:05}");
        let item = packer.get_item(&ctx, &id)?.unwrap_or_else(|| panic!("{id} lost"));
        assert_eq!(item.payload, common::opaque_payload(&id, PAYLOAD));
    }
    Ok(())
}

/// Two packers fed the same items in opposite orders must converge on the
/// same bucket keys, the same item→bucket mapping, and byte-identical
/// stored records.
#[test]
fn test_split_layout_is_insertion_order_independent() -> Result<()> {
    const MAX_ENTRY: usize = 16 * 1024;
    let ids: Vec<String> = (0..1024).map(|i| format!("entity-{i:04}")).collect();

    let run = |ordered: Vec<&String>| -> Result<(Arc<MemoryBackend>, BTreeMap<String, String>)> {
        let backend = Arc::new(MemoryBackend::with_max_value_size(MAX_ENTRY));
        let ctx = common::ctx();
        let packer = common::open_packer(&backend, Options::new())?;
        for id in ordered {
            packer.put_item(&ctx, &Item::new(id.as_str(), common::opaque_payload(id, 2048)))?;
        }
        let mapping = ids
            .iter()
            .map(|id| (id.clone(), packer.bucket_key_for(id)))
            .collect();
        Ok((backend, mapping))
    };

    let (forward_backend, forward_mapping) = run(ids.iter().collect())?;
    let (reverse_backend, reverse_mapping) = run(ids.iter().rev().collect())?;

    assert_eq!(forward_mapping, reverse_mapping);

    let forward_keys = common::stored_bucket_keys(&forward_backend)?;
    let reverse_keys = common::stored_bucket_keys(&reverse_backend)?;
    assert_eq!(forward_keys, reverse_keys);
    for key in &forward_keys {
        assert_eq!(
            common::stored_bucket_bytes(&forward_backend, key)?,
            common::stored_bucket_bytes(&reverse_backend, key)?,
            "stored record for bucket {key} differs between insertion orders"
        );
    }
    Ok(())
}

/// Shard labels written under an older shard width keep resolving after the
/// width is retuned; the new width only shapes future splits.
#[test]
fn test_old_shard_widths_survive_retuning() -> Result<()> {
    let backend = Arc::new(MemoryBackend::with_max_value_size(4 * 1024));
    let ctx = common::ctx();
    let (_, ids) = common::ids_sharing_base_prefix(2, 24);

    {
        let packer = common::open_packer(&backend, Options::new().shard_bucket_bits(4))?;
        for id in &ids {
            packer.put_item(&ctx, &Item::new(id.as_str(), common::opaque_payload(id, 512)))?;
        }
    }

    let packer = common::open_packer(&backend, Options::new().shard_bucket_bits(8))?;
    assert_eq!(packer.shard_bucket_bits(), 8);
    for id in &ids {
        assert_eq!(
            packer.get_item(&ctx, id)?.unwrap().payload,
            common::opaque_payload(id, 512)
        );
    }
    Ok(())
}

/// Crash window: shard children were written but the parent record still
/// holds its pre-split leaf form. On the next open the children win and the
/// parent is rewritten as internal.
#[test]
fn test_interrupted_split_reconciles_on_open() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = common::ctx();
    let (prefix, ids) = common::ids_sharing_base_prefix(2, 8);

    // Pre-split leaf parent, still holding every item.
    let mut parent = Bucket::new(prefix.as_str());
    for id in &ids {
        parent.upsert(&Item::new(id.as_str(), id.as_bytes().to_vec()))?;
    }
    backend.put(
        &format!("{}v2/{prefix}", common::BUCKET_PREFIX),
        &codec::encode(&parent)?,
    )?;

    // The children a split would have produced, already durable.
    let mut children: BTreeMap<String, Bucket> = BTreeMap::new();
    for id in &ids {
        let label = hasher::digest(id)[2..3].to_string();
        children
            .entry(label.clone())
            .or_insert_with(|| Bucket::new(format!("{prefix}{label}")))
            .upsert(&Item::new(id.as_str(), id.as_bytes().to_vec()))?;
    }
    for child in children.values() {
        backend.put(
            &format!("{}v2/{}", common::BUCKET_PREFIX, child.key),
            &codec::encode(child)?,
        )?;
    }

    let packer = common::open_packer(&backend, Options::new())?;

    // The parent must have been rewritten as internal, and every item must
    // resolve through its child.
    let reconciled = codec::decode(&common::stored_bucket_bytes(&backend, &prefix)?.unwrap())?;
    assert!(reconciled.is_internal());
    assert!(reconciled.items.is_empty());
    for id in &ids {
        assert_eq!(
            packer.get_item(&ctx, id)?.unwrap().payload,
            id.as_bytes().to_vec()
        );
    }
    Ok(())
}

/// Harsher crash window: the children exist but the parent record was never
/// written at all. Open synthesizes an internal parent so a fresh leaf can
/// never shadow the children.
#[test]
fn test_missing_parent_record_is_synthesized_on_open() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let ctx = common::ctx();
    let (prefix, ids) = common::ids_sharing_base_prefix(2, 8);

    let mut children: BTreeMap<String, Bucket> = BTreeMap::new();
    for id in &ids {
        let label = hasher::digest(id)[2..3].to_string();
        children
            .entry(label.clone())
            .or_insert_with(|| Bucket::new(format!("{prefix}{label}")))
            .upsert(&Item::new(id.as_str(), id.as_bytes().to_vec()))?;
    }
    for child in children.values() {
        backend.put(
            &format!("{}v2/{}", common::BUCKET_PREFIX, child.key),
            &codec::encode(child)?,
        )?;
    }

    let packer = common::open_packer(&backend, Options::new())?;
    let synthesized = codec::decode(&common::stored_bucket_bytes(&backend, &prefix)?.unwrap())?;
    assert!(synthesized.is_internal());
    for id in &ids {
        assert_eq!(
            packer.get_item(&ctx, id)?.unwrap().payload,
            id.as_bytes().to_vec()
        );
    }

    // New writes route through the synthesized parent into fresh leaves
    // instead of shadowing the old children.
    packer.put_item(&ctx, &Item::new("brand-new", b"xyz".to_vec()))?;
    assert!(packer.get_item(&ctx, "brand-new")?.is_some());
    for id in &ids {
        assert!(packer.get_item(&ctx, id)?.is_some());
    }
    Ok(())
}

/// 64 writers hammer overlapping ids with puts and deletes; a per-id lock
/// held across each packer call gives a total order per id, and the final
/// stored state must match the last operation in that order.
#[test]
fn test_concurrent_writers_converge() -> Result<()> {
    const THREADS: usize = 64;
    const OPS_PER_THREAD: usize = 157;
    const ID_COUNT: usize = 512;
    const MAX_ENTRY: usize = 8 * 1024;

    let backend = Arc::new(MemoryBackend::with_max_value_size(MAX_ENTRY));
    let packer = common::open_packer(
        &backend,
        Options::new().base_bucket_bits(4).shard_bucket_bits(4),
    )?;

    let ids: Vec<String> = (0..ID_COUNT).map(|i| format!("acct-{i:04}")).collect();
    let expected: Vec<Mutex<Option<Vec<u8>>>> =
        (0..ID_COUNT).map(|_| Mutex::new(None)).collect();

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let packer = &packer;
            let ids = &ids;
            let expected = &expected;
            scope.spawn(move || {
                let ctx = common::ctx();
                // Cheap xorshift so runs are deterministic per thread.
                let mut state = 0x9e3779b97f4a7c15u64 ^ (thread as u64 + 1);
                let mut next = move || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };
                for op in 0..OPS_PER_THREAD {
                    let idx = (next() as usize) % ID_COUNT;
                    let id = &ids[idx];
                    // Holding the slot lock across the packer call makes the
                    // observed order the real order.
                    let mut slot = expected[idx].lock().unwrap();
                    if next() % 3 == 0 {
                        packer.delete_item(&ctx, id).unwrap();
                        *slot = None;
                    } else {
                        let payload =
                            common::opaque_payload(&format!("{id}-{thread}-{op}"), 2048);
                        packer
                            .put_item(&ctx, &Item::new(id.as_str(), payload.clone()))
                            .unwrap();
                        *slot = Some(payload);
                    }
                }
            });
        }
    });

    let ctx = common::ctx();
    for (idx, id) in ids.iter().enumerate() {
        let want = expected[idx].lock().unwrap();
        let got = packer.get_item(&ctx, id)?;
        match (&*want, got) {
            (None, None) => {}
            (Some(want), Some(item)) => assert_eq!(item.payload, *want, "payload mismatch for {id}"),
            (want, got) => panic!(
                "final state mismatch for {id}: expected presence {}, observed {}",
                want.is_some(),
                got.is_some()
            ),
        }
    }

    // The run must also have respected the size cap on every surviving
    // record.
    for key in common::stored_bucket_keys(&backend)? {
        let bytes = common::stored_bucket_bytes(&backend, &key)?.unwrap();
        assert!(bytes.len() <= MAX_ENTRY);
    }
    Ok(())
}
