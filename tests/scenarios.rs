//! End-to-end scenarios for the archive engine
//!
//! Each test drives the public API the way a mount consumer or the CLI
//! would, from an origin directory on disk all the way to bytes read back
//! out of a reverse mount.

use beak::vfs::FuseOps;
use beak::{
    CacheFs, ChunkingPolicy, ForwardFs, Packer, ReverseFs, SegmentKind, SegmentName, Storage,
    TreePath,
};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn forward(origin: &std::path::Path, policy: ChunkingPolicy) -> ForwardFs {
    ForwardFs::new(Packer::new(policy).pack(origin).unwrap())
}

fn set_mtime(path: &std::path::Path, secs: u64, nanos: u32) {
    let file = fs::File::options().append(true).open(path).unwrap();
    let t = SystemTime::UNIX_EPOCH + Duration::new(secs, nanos);
    file.set_times(fs::FileTimes::new().set_modified(t)).unwrap();
}

#[test]
fn empty_directory_yields_exactly_one_index_segment() {
    let origin = TempDir::new().unwrap();
    let view = forward(origin.path(), ChunkingPolicy::default());

    let names = view.readdir(&TreePath::root()).unwrap();
    assert_eq!(names.len(), 1);
    let name = SegmentName::parse(&names[0]).unwrap();
    assert_eq!(name.kind, SegmentKind::Index);
    assert_eq!(name.size, 0);
    assert_eq!(name.part, 0);
}

#[test]
fn single_small_file_packs_into_2048_bytes() {
    let origin = TempDir::new().unwrap();
    fs::write(origin.path().join("hello.txt"), "hi").unwrap();
    set_mtime(&origin.path().join("hello.txt"), 1000, 500_000_000);

    let view = forward(origin.path(), ChunkingPolicy::default());
    let names = view.readdir(&TreePath::root()).unwrap();
    let tar_name = names.iter().find(|n| n.ends_with(".tar")).unwrap();

    let parsed = SegmentName::parse(tar_name).unwrap();
    // Header block, one padded payload block, two zero blocks.
    assert_eq!(parsed.size, 2048);
    assert_eq!(parsed.time.secs, 1000);
    assert_eq!(parsed.time.nanos, 500_000_000);

    let stat = view.getattr(&TreePath::root().join(tar_name)).unwrap();
    assert_eq!(stat.size, 2048);
    assert_eq!(stat.mode, 0o444);
}

#[test]
fn large_file_splits_and_reassembles_bit_for_bit() {
    let target = 1024u64;
    let size = 3 * target + 7;
    let content: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

    let origin = TempDir::new().unwrap();
    fs::write(origin.path().join("big"), &content).unwrap();
    let view = forward(origin.path(), ChunkingPolicy::with_target_size(target));

    let mut part_names: Vec<SegmentName> = view
        .readdir(&TreePath::root())
        .unwrap()
        .iter()
        .filter(|n| n.ends_with(".tar"))
        .map(|n| SegmentName::parse(n).unwrap())
        .collect();
    part_names.sort_by_key(|n| n.part);
    assert_eq!(
        part_names.iter().map(|n| n.part).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    // Reassemble the logical content from the tar payload of each part.
    let mut reassembled = Vec::new();
    for (i, name) in part_names.iter().enumerate() {
        let bytes = view
            .read(&TreePath::root().join(&name.to_string()), 0, 1 << 20)
            .unwrap();
        let parsed = beak::tar::parse_header(&bytes).unwrap().unwrap();
        let logical = if i == part_names.len() - 1 { 7 } else { target };
        let start = parsed.header_len as usize;
        reassembled.extend_from_slice(&bytes[start..start + logical as usize]);
    }
    assert_eq!(reassembled, content);
}

#[test]
fn long_path_gets_gnu_long_name_prologue() {
    let origin = TempDir::new().unwrap();
    let long_name = "n".repeat(150);
    fs::write(origin.path().join(&long_name), "payload").unwrap();

    let view = forward(origin.path(), ChunkingPolicy::default());
    let names = view.readdir(&TreePath::root()).unwrap();
    let tar_name = names.iter().find(|n| n.ends_with(".tar")).unwrap();
    let bytes = view
        .read(&TreePath::root().join(tar_name), 0, 1 << 20)
        .unwrap();

    // First block: GNU long-name pseudo header.
    assert_eq!(bytes[156], b'L');
    assert_eq!(&bytes[..13], b"././@LongLink");
    // Second block: the raw name.
    assert_eq!(&bytes[512..512 + 150], long_name.as_bytes());
    // Third block: the real header, typeflag and size intact.
    assert_eq!(bytes[1024 + 156], b'0');

    let parsed = beak::tar::parse_header(&bytes).unwrap().unwrap();
    assert_eq!(parsed.path, long_name);
    assert_eq!(parsed.stat.size, 7);
}

#[test]
fn reverse_mount_selects_among_three_snapshots() {
    let origin = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();

    for (secs, content) in [(1_000_000u64, "t1"), (2_000_000, "t2"), (3_000_000, "t3")] {
        fs::write(origin.path().join("state"), content).unwrap();
        set_mtime(&origin.path().join("state"), secs, 0);
        forward(origin.path(), ChunkingPolicy::default())
            .store_to(store.path())
            .unwrap();
    }

    let mount = |selector: &str| -> (TempDir, ReverseFs) {
        let cache = TempDir::new().unwrap();
        let view = ReverseFs::mount(
            CacheFs::new(
                Storage::local(store.path().to_string_lossy()),
                cache.path().to_path_buf(),
            )
            .unwrap(),
            Some(selector),
        )
        .unwrap();
        (cache, view)
    };

    let (_c, newest) = mount("@0");
    assert_eq!(
        newest.read(&TreePath::lookup("/state"), 0, 16).unwrap(),
        b"t3"
    );
    let (_c, oldest) = mount("@2");
    assert_eq!(
        oldest.read(&TreePath::lookup("/state"), 0, 16).unwrap(),
        b"t1"
    );
    let (_c, nowhere) = mount("@9");
    assert!(nowhere
        .getattr(&TreePath::root())
        .unwrap_err()
        .is_not_found());
}

#[test]
fn concurrent_readers_share_one_fetch() {
    use rand::RngCore;
    let origin = TempDir::new().unwrap();
    let mut blob = vec![0u8; 32 * 1024];
    rand::thread_rng().fill_bytes(&mut blob);
    fs::write(origin.path().join("blob"), &blob).unwrap();
    let store = TempDir::new().unwrap();
    forward(origin.path(), ChunkingPolicy::default())
        .store_to(store.path())
        .unwrap();

    let segment_name = fs::read_dir(store.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .find(|n| n.ends_with(".tar"))
        .unwrap();

    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(
        CacheFs::new(
            Storage::local(store.path().to_string_lossy()),
            cache_dir.path().to_path_buf(),
        )
        .unwrap(),
    );

    let path = TreePath::root().join(&segment_name);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let path = path.clone();
        handles.push(std::thread::spawn(move || cache.read(&path, 0, 64 * 1024)));
    }
    let results: Vec<Vec<u8>> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(cache.fetch_invocations(), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}
