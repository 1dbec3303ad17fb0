//! Integration tests for the archive engine
//!
//! End-to-end flows across the forward and reverse directions: pack,
//! materialize, synchronize, mount back, and read history.

#[cfg(test)]
mod integration_tests {
    use crate::vfs::FuseOps;
    use crate::*;
    use std::fs;
    use tempfile::TempDir;

    fn store_origin(origin: &std::path::Path, dest: &std::path::Path) {
        let tree = Packer::new(ChunkingPolicy::default()).pack(origin).unwrap();
        ForwardFs::new(tree).store_to(dest).unwrap();
    }

    #[test]
    fn test_pack_store_remount_read() {
        let origin = TempDir::new().unwrap();
        fs::write(origin.path().join("notes.md"), "# notes\nsome text\n").unwrap();
        fs::create_dir_all(origin.path().join("src/deep")).unwrap();
        fs::write(origin.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(origin.path().join("src/deep/mod.rs"), "pub mod x;").unwrap();

        let store = TempDir::new().unwrap();
        store_origin(origin.path(), store.path());

        let cache = TempDir::new().unwrap();
        let view = ReverseFs::mount(
            CacheFs::new(
                Storage::local(store.path().to_string_lossy()),
                cache.path().to_path_buf(),
            )
            .unwrap(),
            Some("@0"),
        )
        .unwrap();

        assert_eq!(
            view.read(&TreePath::lookup("/notes.md"), 0, 1 << 16).unwrap(),
            fs::read(origin.path().join("notes.md")).unwrap()
        );
        assert_eq!(
            view.read(&TreePath::lookup("/src/deep/mod.rs"), 0, 64).unwrap(),
            b"pub mod x;"
        );
    }

    #[test]
    fn test_unchanged_tree_pushes_nothing_twice() {
        let origin = TempDir::new().unwrap();
        fs::write(origin.path().join("stable.txt"), "does not change").unwrap();
        let local = TempDir::new().unwrap();
        store_origin(origin.path(), local.path());

        let remote = TempDir::new().unwrap();
        let storage = Storage::local(remote.path().to_string_lossy());

        let first = storage::sync(local.path(), &storage, &mut |_| {}).unwrap();
        assert!(first.pushed > 0);
        assert_eq!(first.skipped, 0);

        // Re-pack the identical origin: identical names, nothing to move.
        let local2 = TempDir::new().unwrap();
        store_origin(origin.path(), local2.path());
        let second = storage::sync(local2.path(), &storage, &mut |_| {}).unwrap();
        assert_eq!(second.pushed, 0);
        assert_eq!(second.skipped, first.pushed);
    }

    #[test]
    fn test_half_written_segment_is_repushed() {
        let origin = TempDir::new().unwrap();
        fs::write(origin.path().join("f"), "full content here").unwrap();
        let local = TempDir::new().unwrap();
        store_origin(origin.path(), local.path());

        let remote = TempDir::new().unwrap();
        let storage = Storage::local(remote.path().to_string_lossy());
        storage::sync(local.path(), &storage, &mut |_| {}).unwrap();

        // Truncate one payload on the remote, as an interrupted transfer
        // would leave it.
        let victim = fs::read_dir(remote.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "tar"))
            .unwrap();
        let bytes = fs::read(&victim).unwrap();
        fs::write(&victim, &bytes[..bytes.len() / 2]).unwrap();

        let listing = storage::list(&storage).unwrap();
        assert_eq!(listing.bad.len(), 1);

        let again = storage::sync(local.path(), &storage, &mut |_| {}).unwrap();
        assert_eq!(again.pushed, 1);
        assert_eq!(fs::read(&victim).unwrap(), bytes);
    }

    #[test]
    fn test_forward_mount_matches_materialized_bytes() {
        let origin = TempDir::new().unwrap();
        fs::write(origin.path().join("a"), vec![b'a'; 1500]).unwrap();
        fs::write(origin.path().join("b"), "tiny").unwrap();

        let tree = Packer::new(ChunkingPolicy::default())
            .pack(origin.path())
            .unwrap();
        let view = ForwardFs::new(tree);
        let dest = TempDir::new().unwrap();
        view.store_to(dest.path()).unwrap();

        for name in view.readdir(&TreePath::root()).unwrap() {
            let virt = view
                .read(&TreePath::root().join(&name), 0, 1 << 20)
                .unwrap();
            let disk = fs::read(dest.path().join(&name)).unwrap();
            assert_eq!(virt, disk, "{name} differs between mount and disk");
        }
    }

    #[test]
    fn test_history_accumulates_points_in_time() {
        let origin = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();

        for (secs, content) in [(1_000_000, "one"), (2_000_000, "two")] {
            fs::write(origin.path().join("f"), content).unwrap();
            let file = fs::File::options()
                .append(true)
                .open(origin.path().join("f"))
                .unwrap();
            let t = std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(secs);
            file.set_times(fs::FileTimes::new().set_modified(t)).unwrap();
            store_origin(origin.path(), store.path());
        }

        let cache = TempDir::new().unwrap();
        let view = ReverseFs::mount(
            CacheFs::new(
                Storage::local(store.path().to_string_lossy()),
                cache.path().to_path_buf(),
            )
            .unwrap(),
            None,
        )
        .unwrap();
        let points = view.points_in_time();
        assert_eq!(points.len(), 2);
        assert!(points[0].ts > points[1].ts);
        assert!(points[0].direntry.starts_with("@0 "));
        assert!(points[1].direntry.starts_with("@1 "));
        assert!(points[0].ago.ends_with(" ago"));
    }
}
