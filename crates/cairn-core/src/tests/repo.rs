use cairn_types::error::CairnError;
use cairn_types::resource::ResourceType;

use crate::repo::Repository;
use crate::testutil::{create_repo, pseudo_random, test_env};

#[test]
fn session_dedups_before_flush() {
    let env = test_env();
    let mut repo = create_repo(&env, "mem://session-dedup", None);

    let payload = pseudo_random(500, 1);
    let mut session = repo.session();
    let a = session.put_blob(ResourceType::Chunk, &payload).unwrap();
    let b = session.put_blob(ResourceType::Chunk, &payload).unwrap();
    assert_eq!(a, b);
    session.commit().unwrap().unwrap();

    let packfiles = repo.list_packfiles().unwrap();
    assert_eq!(packfiles.len(), 1);
    assert_eq!(repo.get_packfile_index(packfiles[0]).unwrap().len(), 1);
}

#[test]
fn packfile_flushes_at_threshold() {
    let env = test_env();
    // 16 KiB packfile threshold from the test options; 5 KiB blobs force
    // multiple packfiles in one session.
    let mut repo = create_repo(&env, "mem://threshold", None);

    let mut session = repo.session();
    for seed in 0..8u64 {
        let payload = pseudo_random(5 * 1024, seed + 1);
        session.put_blob(ResourceType::Chunk, &payload).unwrap();
    }
    session.commit().unwrap().unwrap();

    assert!(repo.list_packfiles().unwrap().len() >= 2);
}

#[test]
fn blobs_remain_addressable_across_packfiles() {
    let env = test_env();
    let mut repo = create_repo(&env, "mem://addressable", None);

    let payloads: Vec<Vec<u8>> = (0..8u64).map(|s| pseudo_random(5 * 1024, s + 1)).collect();
    let mut macs = Vec::new();
    {
        let mut session = repo.session();
        for payload in &payloads {
            macs.push(session.put_blob(ResourceType::Chunk, payload).unwrap());
        }
        session.commit().unwrap().unwrap();
    }

    for (mac, payload) in macs.iter().zip(&payloads) {
        assert_eq!(&repo.get_blob(ResourceType::Chunk, *mac).unwrap(), payload);
    }
}

#[test]
fn empty_session_commit_is_none() {
    let env = test_env();
    let mut repo = create_repo(&env, "mem://empty-session", None);
    let session = repo.session();
    assert!(session.commit().unwrap().is_none());
    assert!(repo.list_states().unwrap().is_empty());
}

#[test]
fn encode_decode_through_every_pipeline_combination() {
    use crate::config::{CompressionAlgorithm, CompressionConfig, EncryptionAlgorithm};
    use crate::repo::CreateOptions;
    use crate::testutil::small_create_options;

    let env = test_env();
    let combinations: Vec<(Option<CompressionAlgorithm>, Option<EncryptionAlgorithm>)> = vec![
        (None, None),
        (Some(CompressionAlgorithm::Lz4), None),
        (Some(CompressionAlgorithm::Gzip), None),
        (None, Some(EncryptionAlgorithm::Aes256GcmSiv)),
        (
            Some(CompressionAlgorithm::Lz4),
            Some(EncryptionAlgorithm::Chacha20Poly1305),
        ),
        (
            Some(CompressionAlgorithm::Gzip),
            Some(EncryptionAlgorithm::Aes256GcmSiv),
        ),
    ];

    for (i, (compression, encryption)) in combinations.into_iter().enumerate() {
        let location = format!("mem://pipeline-{i}");
        let base = small_create_options(encryption.map(|_| "pass"));
        let options = CreateOptions {
            compression: compression.map(|algorithm| CompressionConfig { algorithm }),
            encryption_algorithm: encryption.unwrap_or_default(),
            ..base
        };
        let mut repo = Repository::create(&env.ctx, &env.registry, &location, options).unwrap();

        let payload = pseudo_random(20 * 1024, 42);
        let mac = {
            let mut session = repo.session();
            let mac = session.put_blob(ResourceType::Chunk, &payload).unwrap();
            session.commit().unwrap().unwrap();
            mac
        };
        assert_eq!(
            repo.get_blob(ResourceType::Chunk, mac).unwrap(),
            payload,
            "combination {i} failed"
        );
    }
}

#[test]
fn tampered_config_frame_fails_open() {
    let env = test_env();
    let store_dir = tempfile::tempdir().unwrap();
    let location = store_dir.path().join("repo");
    let location = location.to_str().unwrap();

    create_repo(&env, location, None).close().unwrap();

    let config_path = std::path::Path::new(location).join("CONFIG");
    let mut bytes = std::fs::read(&config_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01; // flip a MAC byte
    std::fs::write(&config_path, &bytes).unwrap();

    let result = Repository::open(&env.ctx, &env.registry, location, None);
    assert!(matches!(result, Err(CairnError::CorruptFrame(_))));
}

#[test]
fn snapshot_listing_follows_tombstones() {
    let env = test_env();
    let mut repo = create_repo(&env, "mem://tombstones", None);

    let doc = pseudo_random(300, 3);
    let snapshot_mac = {
        let mut session = repo.session();
        let mac = session.put_blob(ResourceType::Snapshot, &doc).unwrap();
        session.record_snapshot(mac);
        session.commit().unwrap().unwrap();
        mac
    };
    assert_eq!(repo.list_snapshots(), vec![snapshot_mac]);

    repo.delete_snapshot(snapshot_mac).unwrap();
    assert!(repo.list_snapshots().is_empty());
    // The tombstone removes the reference, not the blob.
    assert!(repo.blob_exists(ResourceType::Snapshot, snapshot_mac));
}
