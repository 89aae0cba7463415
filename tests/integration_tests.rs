//! Integration tests for end-to-end filesystem behavior.

use std::sync::Arc;
use tempfile::TempDir;
use veilfs::{Filesystem, MountOptions, OpContext, OpenFlags, RepoConfig};

const PASSWORD: &str = "integration test password";

fn create_fs(dir: &TempDir) -> Filesystem {
    Filesystem::create(dir.path(), PASSWORD, RepoConfig::default())
        .expect("Failed to create repository")
}

fn mount_fs(dir: &TempDir) -> Filesystem {
    Filesystem::mount(dir.path(), PASSWORD, MountOptions::default())
        .expect("Failed to mount repository")
}

fn ctx() -> OpContext {
    OpContext::default()
}

#[test]
fn test_write_then_read_across_remount() {
    let dir = TempDir::new().unwrap();

    {
        let fs = create_fs(&dir);
        fs.mkdir("/a", 0o755, &ctx()).unwrap();
        fs.mkdir("/a/b", 0o755, &ctx()).unwrap();

        let file = fs.create_file("/a/b/f.txt", 0o644, &ctx()).unwrap();
        fs.write(&file, 0, b"hello world").unwrap();
        fs.flush(&file).unwrap();
    }

    let fs = mount_fs(&dir);
    let file = fs.open("/a/b/f.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 11];

    assert_eq!(fs.read(&file, 0, &mut buf).unwrap(), 11);
    assert_eq!(&buf, b"hello world");
}

#[test]
fn test_create_twice_returns_eexist() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    fs.create_file("/x", 0o644, &ctx()).unwrap();
    let err = fs.create_file("/x", 0o644, &ctx()).unwrap_err();

    assert_eq!(err.errno(), libc::EEXIST);
}

#[test]
fn test_remove_nonempty_directory_refused() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    fs.mkdir("/d", 0o755, &ctx()).unwrap();
    fs.create_file("/d/f", 0o644, &ctx()).unwrap();

    assert_eq!(fs.rmdir("/d").unwrap_err().errno(), libc::ENOTEMPTY);
}

#[test]
fn test_readonly_mount_returns_erofs() {
    let dir = TempDir::new().unwrap();
    {
        let fs = create_fs(&dir);
        let file = fs.create_file("/f", 0o644, &ctx()).unwrap();
        fs.write(&file, 0, b"data").unwrap();
    }

    let fs = Filesystem::mount(dir.path(), PASSWORD, MountOptions { readonly: true }).unwrap();

    let err = fs.open("/f", OpenFlags::read_write()).unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    assert_eq!(fs.mkdir("/d", 0o755, &ctx()).unwrap_err().errno(), libc::EROFS);
}

#[test]
fn test_symlink_roundtrip_or_enosys() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    fs.create_file("/s", 0o644, &ctx()).unwrap();
    match fs.symlink("target", "/s2", &ctx()) {
        Ok(()) => assert_eq!(fs.readlink("/s2").unwrap(), "target"),
        Err(e) => assert_eq!(e.errno(), libc::ENOSYS),
    }
}

#[test]
fn test_mkdir_rmdir_restores_parent_listing() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    fs.create_file("/keep", 0o644, &ctx()).unwrap();
    let before: Vec<String> = fs
        .readdir(&fs.opendir("/").unwrap())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();

    fs.mkdir("/p", 0o755, &ctx()).unwrap();
    fs.rmdir("/p").unwrap();

    let after: Vec<String> = fs
        .readdir(&fs.opendir("/").unwrap())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();

    assert_eq!(before, after);
}

#[test]
fn test_chmod_persists_across_remount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = create_fs(&dir);
        fs.create_file("/f", 0o644, &ctx()).unwrap();
        fs.chmod("/f", 0o600).unwrap();
    }

    let fs = mount_fs(&dir);
    assert_eq!(fs.getattr("/f").unwrap().mode & 0o777, 0o600);
}

#[test]
fn test_straddling_writes_equal_contiguous_write() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);
    let block = fs.block_size() as usize;

    let payload: Vec<u8> = (0..block * 3 + 17).map(|i| (i % 241) as u8).collect();

    // Written in one piece.
    let whole = fs.create_file("/whole", 0o644, &ctx()).unwrap();
    fs.write(&whole, 0, &payload).unwrap();

    // Written in awkward pieces straddling block boundaries.
    let pieces = fs.create_file("/pieces", 0o644, &ctx()).unwrap();
    let mut off = 0usize;
    for chunk in payload.chunks(block / 2 + 3) {
        fs.write(&pieces, off as u64, chunk).unwrap();
        off += chunk.len();
    }

    let mut a = vec![0u8; payload.len()];
    let mut b = vec![0u8; payload.len()];
    fs.read(&whole, 0, &mut a).unwrap();
    fs.read(&pieces, 0, &mut b).unwrap();

    assert_eq!(a, payload);
    assert_eq!(a, b);
}

#[test]
fn test_zero_length_ops_are_noops() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    let file = fs.create_file("/f", 0o644, &ctx()).unwrap();
    assert_eq!(fs.write(&file, 0, b"").unwrap(), 0);

    let mut empty = [0u8; 0];
    assert_eq!(fs.read(&file, 0, &mut empty).unwrap(), 0);
    assert_eq!(fs.getattr("/f").unwrap().size, 0);
}

#[test]
fn test_deep_nesting() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    let mut path = String::new();
    for i in 0..260 {
        path.push_str(&format!("/d{}", i));
        fs.mkdir(&path, 0o755, &ctx()).unwrap();
    }

    path.push_str("/leaf");
    let file = fs.create_file(&path, 0o644, &ctx()).unwrap();
    fs.write(&file, 0, b"deep").unwrap();
    drop(file);

    let file = fs.open(&path, OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 4];
    fs.read(&file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"deep");
}

#[test]
fn test_large_file_survives_remount() {
    let dir = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..100_000).map(|i| (i % 253) as u8).collect();

    {
        let fs = create_fs(&dir);
        let file = fs.create_file("/big", 0o644, &ctx()).unwrap();
        fs.write(&file, 0, &payload).unwrap();
        fs.flush(&file).unwrap();
    }

    let fs = mount_fs(&dir);
    assert_eq!(fs.getattr("/big").unwrap().size, payload.len() as u64);

    let file = fs.open("/big", OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(fs.read(&file, 0, &mut buf).unwrap(), payload.len());
    assert_eq!(buf, payload);
}

#[test]
fn test_truncate_then_extend_zero_fills() {
    let dir = TempDir::new().unwrap();
    let fs = create_fs(&dir);

    let file = fs.create_file("/f", 0o644, &ctx()).unwrap();
    fs.write(&file, 0, &vec![0xAA; 10_000]).unwrap();
    drop(file);

    fs.truncate("/f", 100).unwrap();
    assert_eq!(fs.getattr("/f").unwrap().size, 100);

    fs.truncate("/f", 9000).unwrap();
    let file = fs.open("/f", OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; 9000];
    fs.read(&file, 0, &mut buf).unwrap();

    assert!(buf[..100].iter().all(|&b| b == 0xAA));
    assert!(buf[100..].iter().all(|&b| b == 0));
}

#[test]
fn test_rename_persists_across_remount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = create_fs(&dir);
        fs.mkdir("/a", 0o755, &ctx()).unwrap();
        let file = fs.create_file("/a/old", 0o644, &ctx()).unwrap();
        fs.write(&file, 0, b"moved").unwrap();
        drop(file);
        fs.rename("/a/old", "/new").unwrap();
    }

    let fs = mount_fs(&dir);
    assert_eq!(fs.getattr("/a/old").unwrap_err().errno(), libc::ENOENT);

    let file = fs.open("/new", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 5];
    fs.read(&file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"moved");
}

#[test]
fn test_unicode_names_survive_remount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = create_fs(&dir);
        fs.mkdir("/ドキュメント", 0o755, &ctx()).unwrap();
        fs.create_file("/ドキュメント/résumé.txt", 0o644, &ctx())
            .unwrap();
    }

    let fs = mount_fs(&dir);
    let names: Vec<String> = fs
        .readdir(&fs.opendir("/ドキュメント").unwrap())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();

    assert!(names.contains(&"résumé.txt".to_string()));
}

#[test]
fn test_concurrent_traffic_on_shared_tree() {
    let dir = TempDir::new().unwrap();
    let fs = Arc::new(create_fs(&dir));
    fs.mkdir("/shared", 0o755, &ctx()).unwrap();

    std::thread::scope(|scope| {
        for i in 0..6 {
            let fs = Arc::clone(&fs);
            scope.spawn(move || {
                let path = format!("/shared/worker{}", i);
                let file = fs.create_file(&path, 0o644, &ctx()).unwrap();
                for round in 0..10u64 {
                    fs.write(&file, round * 64, &[i as u8; 64]).unwrap();
                }
                fs.flush(&file).unwrap();
            });
        }
        // Concurrent readers over the same directory.
        for _ in 0..2 {
            let fs = Arc::clone(&fs);
            scope.spawn(move || {
                for _ in 0..20 {
                    let dir = fs.opendir("/shared").unwrap();
                    let _ = fs.readdir(&dir).unwrap();
                }
            });
        }
    });

    let entries = fs.readdir(&fs.opendir("/shared").unwrap()).unwrap();
    assert_eq!(entries.len(), 6 + 2);
    for i in 0..6 {
        let stat = fs.getattr(&format!("/shared/worker{}", i)).unwrap();
        assert_eq!(stat.size, 640);
    }
}

#[test]
fn test_wrong_password_cannot_mount() {
    let dir = TempDir::new().unwrap();
    {
        let fs = create_fs(&dir);
        fs.create_file("/secret", 0o644, &ctx()).unwrap();
    }

    assert!(Filesystem::mount(dir.path(), "not the password", MountOptions::default()).is_err());
}

#[test]
fn test_host_files_are_opaque() {
    let dir = TempDir::new().unwrap();
    let needle = b"extremely greppable plaintext marker";

    {
        let fs = create_fs(&dir);
        fs.mkdir("/plain-dir-name", 0o755, &ctx()).unwrap();
        let file = fs
            .create_file("/plain-dir-name/plain-file-name", 0o644, &ctx())
            .unwrap();
        fs.write(&file, 0, needle).unwrap();
        fs.flush(&file).unwrap();
    }

    // Neither file contents nor names appear anywhere in the host tree.
    for entry in walkdir::WalkDir::new(dir.path()) {
        let entry = entry.unwrap();
        if entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        assert!(!name.contains("plain-dir-name"));
        assert!(!name.contains("plain-file-name"));

        let bytes = std::fs::read(entry.path()).unwrap();
        assert!(
            !bytes
                .windows(needle.len())
                .any(|w| w == needle),
            "plaintext leaked into {}",
            entry.path().display()
        );
    }
}
