//! On-disk format and store behavior tests: XPAK archives, versioned
//! intermediate directories, archive-cache flush semantics.

use asset_compilers::{
    as_blob,
    store::{
        ArchiveCache, ArchiveCacheSet, IntermediatesStore, MemoryStore, ProgressiveStore,
        ProgressiveStoreOptions, VersionDesc,
    },
    vfs::{
        memory::MemoryFileSystem,
        os::OsFileSystem,
        xpak::{XPakFileSystem, XPakWriter},
        FileSystem, OpenMode, ShareMode,
    },
    Artifact, ArtifactDataForm, ArtifactRequest, AssetServices, AssetState, DependentFileState,
    VERSION_ANY,
};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, fs, sync::Arc};

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn xpak_format_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    // three payloads; the middle one is large and repetitive enough that
    // compression must beat raw storage
    let a_contents = b"twelve bytes".to_vec();
    let c_contents = b"repetitive-block-".repeat(148)[..2500].to_vec();
    let d_contents: Vec<u8> = (0u8..100).collect();

    let source_dir = dir.path().join("source");
    fs::create_dir_all(source_dir.join("b")).unwrap();
    fs::write(source_dir.join("a.txt"), &a_contents).unwrap();
    fs::write(source_dir.join("b/c.txt"), &c_contents).unwrap();
    fs::write(source_dir.join("d.bin"), &d_contents).unwrap();

    let archive_path = dir.path().join("pack.xpak");
    let mut writer = XPakWriter::new();
    writer.add_directory(&source_dir).unwrap();
    writer.write_to_path(&archive_path).unwrap();

    // header-level assertions against the raw bytes
    let bytes = fs::read(&archive_path).unwrap();
    assert_eq!(&bytes[0..4], &[0x58, 0x50, 0x41, 0x4B]);
    assert_eq!(read_u32(&bytes, 4), 0, "format version");
    let file_count = read_u32(&bytes, 8) as usize;
    assert_eq!(file_count, 3);

    let entries_offset = read_u64(&bytes, 12) as usize;
    let hash_table_offset = read_u64(&bytes, 20) as usize;
    let hashes: Vec<u64> =
        (0..file_count).map(|i| read_u64(&bytes, hash_table_offset + i * 8)).collect();
    let mut sorted = hashes.clone();
    sorted.sort();
    assert_eq!(hashes, sorted, "hash table must be sorted ascending");

    // exactly one entry (the 2500-byte text) stores compressed
    let mut compressed_entries = 0;
    for idx in 0..file_count {
        let base = entries_offset + idx * 40;
        let compressed_size = read_u64(&bytes, base + 8);
        let decompressed_size = read_u64(&bytes, base + 16);
        if compressed_size < decompressed_size {
            compressed_entries += 1;
            assert_eq!(decompressed_size, 2500);
        } else {
            assert_eq!(compressed_size, decompressed_size);
        }
    }
    assert_eq!(compressed_entries, 1);

    // reading back through the filesystem interface reproduces every file
    let archive = XPakFileSystem::open(&archive_path).unwrap();
    for (name, contents) in
        [("a.txt", &a_contents), ("b/c.txt", &c_contents), ("d.bin", &d_contents)]
    {
        let marker = archive.translate(name).marker().unwrap_or_else(|| {
            panic!("hash table lookup failed for {name}");
        });
        let mut file = archive.open(&marker, OpenMode::Read, ShareMode::Read).unwrap();
        let read_back = asset_compilers::vfs::read_entire_file(file.as_mut()).unwrap();
        assert_eq!(&read_back, contents, "contents mismatch for {name}");
    }
}

#[test]
fn progressive_store_segregates_versions() {
    let dir = tempfile::tempdir().unwrap();
    let services = AssetServices::with_pool_size(1);
    let options = |version: &str| ProgressiveStoreOptions {
        base_dir: dir.path().to_path_buf(),
        version_string: version.to_string(),
        config_string: "r64".to_string(),
        universal: false,
    };

    // first run creates directory 0 for v1
    {
        let store = ProgressiveStore::new(services.depval().clone(), options("v1"));
        assert_eq!(store.resolved_directory().unwrap(), dir.path().join(".int-r64/0"));
    }
    assert_eq!(
        fs::read_to_string(dir.path().join(".int-r64/0/.store")).unwrap().trim(),
        "VersionString=v1"
    );

    // a different version claims the next free index
    {
        let store = ProgressiveStore::new(services.depval().clone(), options("v2"));
        assert_eq!(store.resolved_directory().unwrap(), dir.path().join(".int-r64/1"));
    }
    assert_eq!(
        fs::read_to_string(dir.path().join(".int-r64/1/.store")).unwrap().trim(),
        "VersionString=v2"
    );

    // restarting with v1 reuses directory 0 and leaves 1 untouched
    {
        let store = ProgressiveStore::new(services.depval().clone(), options("v1"));
        assert_eq!(store.resolved_directory().unwrap(), dir.path().join(".int-r64/0"));
    }
    assert_eq!(
        fs::read_to_string(dir.path().join(".int-r64/1/.store")).unwrap().trim(),
        "VersionString=v2"
    );
}

#[test]
fn universal_store_skips_versioning() {
    let dir = tempfile::tempdir().unwrap();
    let services = AssetServices::with_pool_size(1);
    let store = ProgressiveStore::new(
        services.depval().clone(),
        ProgressiveStoreOptions {
            base_dir: dir.path().to_path_buf(),
            version_string: "ignored".to_string(),
            config_string: "r64".to_string(),
            universal: true,
        },
    );
    assert_eq!(store.resolved_directory().unwrap(), dir.path().join(".int/u"));
}

fn entry_artifacts(payload: &str) -> Vec<Artifact> {
    vec![Artifact::new(0x0100, 1, "bytecode", as_blob(payload))]
}

#[test]
fn archive_commit_flush_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let services = AssetServices::with_pool_size(1);
    let filesystem: Arc<dyn FileSystem> = Arc::new(OsFileSystem::new(dir.path().to_path_buf()));

    let cache = ArchiveCache::new(
        Some(filesystem.clone()),
        "cache.pak",
        VersionDesc::new("v1", "build-date"),
        services.depval().clone(),
        false,
    );
    cache.commit(42, "the-entry", entry_artifacts("identical"), AssetState::Ready, Vec::new(), None);
    cache.flush_to_disk();
    let data_after_first = fs::read(dir.path().join("cache.pak")).unwrap();
    let dir_after_first = fs::read(dir.path().join("cache.pak.dir")).unwrap();

    // committing identical contents and flushing again changes nothing
    cache.commit(42, "the-entry", entry_artifacts("identical"), AssetState::Ready, Vec::new(), None);
    cache.flush_to_disk();
    assert_eq!(fs::read(dir.path().join("cache.pak")).unwrap(), data_after_first);
    assert_eq!(fs::read(dir.path().join("cache.pak.dir")).unwrap(), dir_after_first);
}

#[test]
fn memory_store_round_trips_without_a_filesystem() {
    let services = AssetServices::with_pool_size(1);
    let store = MemoryStore::new(services.depval().clone());
    let group = store
        .register_compile_products_group("mem-test", &VersionDesc::new("1", ""), true)
        .unwrap();

    let artifacts =
        vec![Artifact::new(0x0100, 2, "payload", as_blob("resident-in-memory"))];
    store
        .store_compile_products("some/asset", group, &artifacts, AssetState::Ready, &[])
        .unwrap();

    let collection = store.retrieve_compile_products("some/asset", group).unwrap().unwrap();
    assert_eq!(collection.asset_state(), AssetState::Ready);
    let resolved = collection
        .resolve_requests(&[ArtifactRequest {
            name: "payload",
            chunk_type_code: 0x0100,
            expected_version: 2,
            data_form: ArtifactDataForm::SharedBlob,
        }])
        .unwrap();
    assert_eq!(resolved[0].shared_blob.as_deref(), Some(b"resident-in-memory".as_slice()));

    assert!(store.retrieve_compile_products("never/stored", group).unwrap().is_none());
}

#[test]
fn stale_dependencies_hide_archive_entries() {
    let services = AssetServices::with_pool_size(1);
    let mut files = BTreeMap::new();
    files.insert("x.txt".to_string(), as_blob("contents"));
    let memory = Arc::new(MemoryFileSystem::new(files));
    services.mounting_tree().mount("src", memory);

    let depval = services.depval().clone();
    let set = ArchiveCacheSet::new(None, "", VersionDesc::new("v1", ""), depval.clone(), true);
    let cache = set.get_archive("bundle").unwrap();

    let recorded = depval.get_dependent_file_state("src/x.txt");
    cache.commit(
        1,
        "asset",
        entry_artifacts("payload"),
        AssetState::Ready,
        vec![DependentFileState::new("src/x.txt", recorded.snapshot)],
        None,
    );
    assert!(cache.try_open_from_cache(1).unwrap().is_some());

    // once the recorded snapshot is superseded the entry reads as absent
    services.mounting_tree().fake_change("src/x.txt");
    assert!(cache.try_open_from_cache(1).unwrap().is_none());
}

#[test]
fn loose_products_survive_a_store_restart() {
    let dir = tempfile::tempdir().unwrap();
    let services = AssetServices::with_pool_size(1);
    let options = ProgressiveStoreOptions {
        base_dir: dir.path().to_path_buf(),
        version_string: "v1".to_string(),
        config_string: "r64".to_string(),
        universal: false,
    };

    let artifacts = vec![
        Artifact::new(0x0100, 1, "bytecode", as_blob("compiled")),
        Artifact::new(0x0200, 1, "reflection", as_blob("layout")),
        Artifact::new(asset_compilers::CHUNK_TYPE_LOG, 0, "", as_blob("warnings here")),
    ];

    {
        let store = ProgressiveStore::new(services.depval().clone(), options.clone());
        let group = store
            .register_compile_products_group("shaders", &VersionDesc::new("1.0.0", ""), false)
            .unwrap();
        store
            .store_compile_products("basic.hlsl-100", group, &artifacts, AssetState::Ready, &[])
            .unwrap();
    }

    // a fresh store over the same directory finds the products, including
    // the log sidecar, with chunk contents intact
    let store = ProgressiveStore::new(services.depval().clone(), options);
    let group = store
        .register_compile_products_group("shaders", &VersionDesc::new("1.0.0", ""), false)
        .unwrap();
    let collection = store.retrieve_compile_products("basic.hlsl-100", group).unwrap().unwrap();
    let resolved = collection
        .resolve_requests(&[
            ArtifactRequest {
                name: "bytecode",
                chunk_type_code: 0x0100,
                expected_version: 1,
                data_form: ArtifactDataForm::SharedBlob,
            },
            ArtifactRequest {
                name: "reflection",
                chunk_type_code: 0x0200,
                expected_version: VERSION_ANY,
                data_form: ArtifactDataForm::Raw,
            },
            ArtifactRequest {
                name: "log",
                chunk_type_code: asset_compilers::CHUNK_TYPE_LOG,
                expected_version: VERSION_ANY,
                data_form: ArtifactDataForm::SharedBlob,
            },
        ])
        .unwrap();
    assert_eq!(resolved[0].shared_blob.as_deref(), Some(b"compiled".as_slice()));
    assert_eq!(resolved[1].buffer.as_ref().unwrap().as_slice(), b"layout");
    assert_eq!(resolved[2].shared_blob.as_deref(), Some(b"warnings here".as_slice()));

    // snapshot equality on disk: the two main chunks landed in one chunk
    // file, the log in its own sidecar
    let group_dir = dir.path().join(".int-r64/0/shaders-1.0.0");
    assert!(group_dir.join("basic.hlsl-100.chunk").exists());
    assert!(group_dir.join("basic.hlsl-100.log").exists());
    assert!(group_dir.join("basic.hlsl-100").exists(), "manifest missing");
}

#[test]
fn archived_store_reads_shipped_products_but_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let services = AssetServices::with_pool_size(1);
    let artifacts = vec![Artifact::new(0x0100, 1, "bytecode", as_blob("shipped"))];

    // produce a store directory the way a build machine would
    let resolved = {
        let store = ProgressiveStore::new(
            services.depval().clone(),
            ProgressiveStoreOptions {
                base_dir: dir.path().to_path_buf(),
                version_string: "v1".to_string(),
                config_string: "r64".to_string(),
                universal: false,
            },
        );
        let group = store
            .register_compile_products_group("shaders", &VersionDesc::new("1.0.0", ""), false)
            .unwrap();
        store
            .store_compile_products("shipped.hlsl-100", group, &artifacts, AssetState::Ready, &[])
            .unwrap();
        store.resolved_directory().unwrap()
    };

    // mount the same directory read-only, as a shipped intermediates set
    let filesystem: Arc<dyn FileSystem> = Arc::new(OsFileSystem::new(resolved));
    let archived =
        asset_compilers::ArchivedStore::new(services.depval().clone(), filesystem, "");
    let group = archived
        .register_compile_products_group("shaders", &VersionDesc::new("1.0.0", ""), false)
        .unwrap();

    let collection =
        archived.retrieve_compile_products("shipped.hlsl-100", group).unwrap().unwrap();
    let resolved_requests = collection
        .resolve_requests(&[ArtifactRequest {
            name: "bytecode",
            chunk_type_code: 0x0100,
            expected_version: 1,
            data_form: ArtifactDataForm::SharedBlob,
        }])
        .unwrap();
    assert_eq!(resolved_requests[0].shared_blob.as_deref(), Some(b"shipped".as_slice()));

    assert!(!archived.allow_store());
    assert!(archived
        .store_compile_products("new.hlsl-100", group, &artifacts, AssetState::Ready, &[])
        .is_err());
}
