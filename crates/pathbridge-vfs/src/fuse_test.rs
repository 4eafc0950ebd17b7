// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::{OsStr, OsString};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::time::{Duration, UNIX_EPOCH};

use fuser::FileType;
use pathbridge::{DirMapper, MountConfig, OsError, RuleSet, Tracer};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::{Filesystem, ROOT_INODE, SetAttr};

const HOST_JSON: &[u8] = br#"{"cwd":"C:\\Users\\dev\\project\\src","home":"C:\\Users\\dev"}"#;
const CONTAINER_JSON: &[u8] = br#"{"cwd":"/workspace\\src","home":"/home/dev"}"#;

#[fixture]
fn source() -> TempDir {
    tempfile::Builder::new()
        .prefix("pathbridge-vfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

fn filesystem(source: &TempDir) -> Filesystem {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let config = MountConfig::new(source.path())
        .unwrap()
        .with_rules(RuleSet::parse(r"C:\Users\dev\project=/workspace;C:\Users\dev=/home/dev").unwrap())
        .with_dir_mapper(DirMapper::parse("Users=home").unwrap());
    Filesystem::new(config, Tracer::new(subscriber))
}

fn name(name: &str) -> &OsStr {
    OsStr::new(name)
}

#[rstest]
fn test_size_matches_read_length(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::write(source.path().join("settings.json"), HOST_JSON).unwrap();

    let attr = fs.lookup(ROOT_INODE, name("settings.json")).unwrap();
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.size, CONTAINER_JSON.len() as u64);

    let fh = fs.open(attr.ino, libc::O_RDONLY).unwrap();
    let data = fs.read(fh, 0, 4096).unwrap();
    assert_eq!(data, CONTAINER_JSON);
    assert_eq!(fs.getattr(attr.ino, None).unwrap().size, data.len() as u64);
    assert_eq!(fs.getattr(attr.ino, Some(fh)).unwrap().size, data.len() as u64);
    assert!(fs.read(fh, data.len() as i64, 10).unwrap().is_empty());
    fs.release(fh).unwrap();
    assert_eq!(fs.open_handles(), 0);
}

#[rstest]
fn test_ineligible_file_is_untouched(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::write(source.path().join("notes.txt"), HOST_JSON).unwrap();

    let attr = fs.lookup(ROOT_INODE, name("notes.txt")).unwrap();
    assert_eq!(attr.size, HOST_JSON.len() as u64);
    let fh = fs.open(attr.ino, libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(fh, 0, 4096).unwrap(), HOST_JSON);
    fs.release(fh).unwrap();
}

#[rstest]
fn test_create_write_release(source: TempDir) {
    let fs = filesystem(&source);
    let (attr, fh) = fs.create(ROOT_INODE, name("new.json"), 0o644).unwrap();
    assert_eq!(attr.size, 0);

    let content = b"{\"cwd\":\"/workspace/src\"}";
    assert_eq!(fs.write(fh, 0, content).unwrap(), content.len() as u32);
    assert_eq!(
        fs.getattr(attr.ino, Some(fh)).unwrap().size,
        content.len() as u64
    );
    fs.release(fh).unwrap();

    assert_eq!(
        std::fs::read(source.path().join("new.json")).unwrap(),
        br#"{"cwd":"C:\\Users\\dev\\project/src"}"#
    );
    assert_eq!(
        fs.getattr(attr.ino, None).unwrap().size,
        content.len() as u64
    );
    let fh = fs.open(attr.ino, libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(fh, 0, 4096).unwrap(), content);
    fs.release(fh).unwrap();
}

#[rstest]
fn test_truncating_open_persists_empty_file(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("state.json");
    std::fs::write(&real, HOST_JSON).unwrap();

    let ino = fs.lookup(ROOT_INODE, name("state.json")).unwrap().ino;
    let fh = fs.open(ino, libc::O_WRONLY | libc::O_TRUNC).unwrap();
    fs.release(fh).unwrap();
    assert!(std::fs::read(&real).unwrap().is_empty());
}

#[rstest]
fn test_readdir_maps_names(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::create_dir(source.path().join("Users")).unwrap();
    std::fs::write(source.path().join("Users/a.json"), b"{}").unwrap();
    // only reachable as its host spelling, which is mapped away
    std::fs::create_dir(source.path().join("home")).unwrap();
    std::fs::write(source.path().join("notes.txt"), b"").unwrap();

    let fh = fs.opendir(ROOT_INODE).unwrap();
    let mut names: Vec<OsString> = fs
        .readdir(fh, 0)
        .unwrap()
        .into_iter()
        .map(|(_, entry)| entry.name)
        .collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "home", "notes.txt"]);
    fs.releasedir(fh).unwrap();

    let home = fs.lookup(ROOT_INODE, name("home")).unwrap();
    assert_eq!(home.kind, FileType::Directory);
    let file = fs.lookup(home.ino, name("a.json")).unwrap();
    assert_eq!(file.kind, FileType::RegularFile);

    let err = fs.lookup(ROOT_INODE, name("Users")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_readdir_offsets_resume(source: TempDir) {
    let fs = filesystem(&source);
    for i in 0..5 {
        std::fs::write(source.path().join(format!("file{i}.txt")), b"").unwrap();
    }

    let fh = fs.opendir(ROOT_INODE).unwrap();
    let all = fs.readdir(fh, 0).unwrap();
    assert_eq!(all.len(), 7);
    assert_eq!(all[0].1.name, ".");
    assert_eq!(all[0].1.ino, ROOT_INODE);
    assert_eq!(all[1].1.name, "..");

    let (resume, _) = all[2].clone();
    assert_eq!(fs.readdir(fh, resume).unwrap(), all[3..].to_vec());
    let (end, _) = all[6].clone();
    assert!(fs.readdir(fh, end).unwrap().is_empty());
    fs.releasedir(fh).unwrap();
}

#[rstest]
fn test_rename_moves_inodes(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::create_dir(source.path().join("dir")).unwrap();
    std::fs::write(source.path().join("dir/a.json"), HOST_JSON).unwrap();

    let dir = fs.lookup(ROOT_INODE, name("dir")).unwrap();
    let file = fs.lookup(dir.ino, name("a.json")).unwrap();

    // renaming onto the container spelling lands on the host spelling
    fs.rename(ROOT_INODE, name("dir"), ROOT_INODE, name("home"), 0)
        .unwrap();
    assert!(source.path().join("Users/a.json").exists());
    assert!(!source.path().join("dir").exists());

    assert_eq!(fs.lookup(ROOT_INODE, name("home")).unwrap().ino, dir.ino);
    assert_eq!(fs.lookup(dir.ino, name("a.json")).unwrap().ino, file.ino);
    assert_eq!(
        fs.getattr(file.ino, None).unwrap().size,
        CONTAINER_JSON.len() as u64
    );

    // onto itself changes nothing
    fs.rename(ROOT_INODE, name("home"), ROOT_INODE, name("home"), 0)
        .unwrap();
    assert_eq!(fs.lookup(ROOT_INODE, name("home")).unwrap().ino, dir.ino);
    assert_eq!(fs.lookup(dir.ino, name("a.json")).unwrap().ino, file.ino);

    let err = fs
        .rename(ROOT_INODE, name("home"), ROOT_INODE, name("x"), 1)
        .unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EINVAL));
}

#[rstest]
fn test_concurrent_reads(source: TempDir) {
    let fs = Arc::new(filesystem(&source));
    let mut host = String::new();
    let mut expected = String::new();
    for i in 0..200 {
        host.push_str(&format!(r#"{{"p":"C:\\Users\\dev\\project\\{i}"}}"#));
        host.push('\n');
        expected.push_str(&format!(r#"{{"p":"/workspace\\{i}"}}"#));
        expected.push('\n');
    }
    std::fs::write(source.path().join("log.jsonl"), &host).unwrap();
    let ino = fs.lookup(ROOT_INODE, name("log.jsonl")).unwrap().ino;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                let fh = fs.open(ino, libc::O_RDONLY).unwrap();
                let mut out = Vec::new();
                loop {
                    let chunk = fs.read(fh, out.len() as i64, 37).unwrap();
                    if chunk.is_empty() {
                        break;
                    }
                    out.extend(chunk);
                }
                fs.release(fh).unwrap();
                out
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().unwrap(), expected.as_bytes());
    }
}

#[rstest]
fn test_held_file_does_not_block_other_files(source: TempDir) {
    let fs = Arc::new(filesystem(&source));
    std::fs::write(source.path().join("a.json"), HOST_JSON).unwrap();
    std::fs::write(source.path().join("b.json"), HOST_JSON).unwrap();
    let a = fs.lookup(ROOT_INODE, name("a.json")).unwrap().ino;
    let b = fs.lookup(ROOT_INODE, name("b.json")).unwrap().ino;
    let fh_a = fs.open(a, libc::O_RDONLY).unwrap();
    let fh_b = fs.open(b, libc::O_RDONLY).unwrap();

    let held = fs.file(fh_a).unwrap();
    let guard = super::lock(&held);

    let read_in_thread = |fh: u64| {
        let fs = Arc::clone(&fs);
        let (send, recv) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = send.send(fs.read(fh, 0, 4096).unwrap());
        });
        recv
    };
    let waiting = read_in_thread(fh_a);
    let other = read_in_thread(fh_b);
    assert_eq!(
        other.recv_timeout(Duration::from_secs(10)).unwrap(),
        CONTAINER_JSON
    );
    assert_eq!(
        waiting.recv_timeout(Duration::from_millis(100)),
        Err(mpsc::RecvTimeoutError::Timeout),
        "reads of a held file must wait for it"
    );

    drop(guard);
    assert_eq!(
        waiting.recv_timeout(Duration::from_secs(10)).unwrap(),
        CONTAINER_JSON
    );
    drop(held);
    fs.release(fh_a).unwrap();
    fs.release(fh_b).unwrap();
}

#[rstest]
fn test_flush_then_rename_keeps_content(source: TempDir) {
    let fs = filesystem(&source);
    let tmp = source.path().join("settings.json.tmp.json");
    let target = source.path().join("settings.json");
    let expected: &[u8] = br#"{"cwd":"C:\\Users\\dev\\project"}"#;

    let (_, fh) = fs
        .create(ROOT_INODE, name("settings.json.tmp.json"), 0o644)
        .unwrap();
    fs.write(fh, 0, b"{\"cwd\":\"/workspace\"}").unwrap();
    fs.flush(fh).unwrap();
    assert_eq!(std::fs::read(&tmp).unwrap(), expected);

    fs.rename(
        ROOT_INODE,
        name("settings.json.tmp.json"),
        ROOT_INODE,
        name("settings.json"),
        0,
    )
    .unwrap();
    fs.release(fh).unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), expected);
    assert!(!tmp.exists(), "the renamed file must not be recreated");
}

#[rstest]
fn test_rename_before_release_follows_handle(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::create_dir(source.path().join("dir")).unwrap();
    std::fs::write(source.path().join("dir/state.json"), HOST_JSON).unwrap();
    std::fs::write(source.path().join("other.json"), b"{}").unwrap();

    let dir = fs.lookup(ROOT_INODE, name("dir")).unwrap().ino;
    let ino = fs.lookup(dir, name("state.json")).unwrap().ino;
    let other = fs.lookup(ROOT_INODE, name("other.json")).unwrap().ino;
    let fh = fs.open(ino, libc::O_RDWR | libc::O_TRUNC).unwrap();
    fs.write(fh, 0, b"[\"/home/dev\"]").unwrap();
    // a handle on the file that gets replaced by the rename
    let replaced = fs.open(other, libc::O_RDWR).unwrap();
    fs.write(replaced, 0, b"[]").unwrap();

    // moving the parent directory moves the open file with it
    fs.rename(ROOT_INODE, name("dir"), ROOT_INODE, name("moved"), 0)
        .unwrap();
    fs.rename(dir, name("state.json"), ROOT_INODE, name("other.json"), 0)
        .unwrap();
    fs.release(fh).unwrap();
    fs.release(replaced).unwrap();

    assert_eq!(
        std::fs::read(source.path().join("other.json")).unwrap(),
        br#"["C:\\Users\\dev"]"#
    );
    assert!(!source.path().join("moved/state.json").exists());
    assert!(!source.path().join("dir").exists());
}

#[rstest]
fn test_unlink_while_open(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("state.json");
    std::fs::write(&real, HOST_JSON).unwrap();
    let ino = fs.lookup(ROOT_INODE, name("state.json")).unwrap().ino;

    let fh = fs.open(ino, libc::O_RDWR).unwrap();
    fs.unlink(ROOT_INODE, name("state.json")).unwrap();
    fs.write(fh, 0, b"[]").unwrap();
    assert_eq!(fs.read(fh, 0, 2).unwrap(), b"[]");
    fs.flush(fh).unwrap();
    fs.release(fh).unwrap();
    assert!(!real.exists(), "an unlinked file must stay removed");
}

#[rstest]
fn test_removal_drops_inodes(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::write(source.path().join("a.json"), b"{}").unwrap();
    std::fs::create_dir(source.path().join("sub")).unwrap();
    std::fs::write(source.path().join("sub/b.txt"), b"").unwrap();

    let a = fs.lookup(ROOT_INODE, name("a.json")).unwrap().ino;
    let sub = fs.lookup(ROOT_INODE, name("sub")).unwrap().ino;
    let b = fs.lookup(sub, name("b.txt")).unwrap().ino;

    fs.unlink(ROOT_INODE, name("a.json")).unwrap();
    let err = fs.getattr(a, None).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
    std::fs::write(source.path().join("a.json"), b"{}").unwrap();
    assert_ne!(fs.lookup(ROOT_INODE, name("a.json")).unwrap().ino, a);

    // removed behind the mount's back, then the directory through it
    std::fs::remove_file(source.path().join("sub/b.txt")).unwrap();
    fs.rmdir(ROOT_INODE, name("sub")).unwrap();
    for ino in [sub, b] {
        let err = fs.getattr(ino, None).unwrap_err();
        assert_eq!(err.os_error(), Some(libc::ENOENT));
    }
}

#[rstest]
fn test_release_with_failed_write_back(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("state.json");
    std::fs::write(&real, HOST_JSON).unwrap();
    let ino = fs.lookup(ROOT_INODE, name("state.json")).unwrap().ino;
    let fh = fs.open(ino, libc::O_RDWR).unwrap();
    fs.write(fh, 0, b"[]").unwrap();

    // replaced by a directory behind the mount's back
    std::fs::remove_file(&real).unwrap();
    std::fs::create_dir(&real).unwrap();
    std::fs::write(real.join("keep.txt"), b"kept").unwrap();

    let err = fs.release(fh).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::EISDIR));
    assert_eq!(fs.open_handles(), 0);
    assert_eq!(std::fs::read(real.join("keep.txt")).unwrap(), b"kept");
    let leftovers: Vec<_> = std::fs::read_dir(source.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![OsString::from("state.json")]);
}

#[rstest]
fn test_release_all_writes_back(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("state.json");
    std::fs::write(&real, HOST_JSON).unwrap();

    let ino = fs.lookup(ROOT_INODE, name("state.json")).unwrap().ino;
    let fh = fs.open(ino, libc::O_RDWR | libc::O_TRUNC).unwrap();
    fs.write(fh, 0, b"[\"/home/dev\"]").unwrap();
    fs.opendir(ROOT_INODE).unwrap();

    assert_eq!(fs.release_all(), 2);
    assert_eq!(fs.open_handles(), 0);
    assert_eq!(std::fs::read(&real).unwrap(), br#"["C:\\Users\\dev"]"#);
}

#[rstest]
fn test_setattr_size(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("state.json");
    std::fs::write(&real, HOST_JSON).unwrap();
    let ino = fs.lookup(ROOT_INODE, name("state.json")).unwrap().ino;

    let truncate = |size| SetAttr {
        size: Some(size),
        ..Default::default()
    };

    // through an open handle, only the buffer changes until release
    let fh = fs.open(ino, libc::O_RDWR).unwrap();
    let attr = fs.setattr(ino, Some(fh), truncate(3)).unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(std::fs::read(&real).unwrap(), HOST_JSON);
    fs.release(fh).unwrap();
    assert_eq!(std::fs::read(&real).unwrap(), b"{\"c");

    let attr = fs.setattr(ino, None, truncate(0)).unwrap();
    assert_eq!(attr.size, 0);
    assert!(std::fs::read(&real).unwrap().is_empty());
}

#[rstest]
fn test_setattr_mode_and_times(source: TempDir) {
    let fs = filesystem(&source);
    let real = source.path().join("notes.txt");
    std::fs::write(&real, b"text").unwrap();
    let ino = fs.lookup(ROOT_INODE, name("notes.txt")).unwrap().ino;

    let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
    let changes = SetAttr {
        mode: Some(0o600),
        mtime: Some(mtime),
        ..Default::default()
    };
    let attr = fs.setattr(ino, None, changes).unwrap();
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.mtime, mtime);
    let mode = std::fs::metadata(&real).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[rstest]
fn test_directory_operations(source: TempDir) {
    let fs = filesystem(&source);

    let sub = fs.mkdir(ROOT_INODE, name("sub"), 0o755).unwrap();
    assert_eq!(sub.kind, FileType::Directory);
    assert!(source.path().join("sub").is_dir());

    let link = fs
        .symlink(ROOT_INODE, name("link"), Path::new(r"C:\Users\dev"))
        .unwrap();
    assert_eq!(link.kind, FileType::Symlink);
    assert_eq!(fs.readlink(link.ino).unwrap(), br"C:\Users\dev");

    std::fs::write(source.path().join("a.txt"), b"a").unwrap();
    let a = fs.lookup(ROOT_INODE, name("a.txt")).unwrap();
    let b = fs.link(a.ino, sub.ino, name("b.txt")).unwrap();
    assert_eq!(b.nlink, 2);
    assert!(source.path().join("sub/b.txt").exists());

    fs.unlink(sub.ino, name("b.txt")).unwrap();
    assert!(!source.path().join("sub/b.txt").exists());
    fs.rmdir(ROOT_INODE, name("sub")).unwrap();
    assert!(!source.path().join("sub").exists());

    let err = fs.rmdir(ROOT_INODE, name("sub")).unwrap_err();
    assert_eq!(err.os_error(), Some(libc::ENOENT));
}

#[rstest]
fn test_passthrough_queries(source: TempDir) {
    let fs = filesystem(&source);
    fs.access(ROOT_INODE, libc::F_OK).unwrap();
    assert!(fs.statfs().unwrap().blocks() > 0);
    assert_eq!(
        fs.getattr(ROOT_INODE, None).unwrap().kind,
        FileType::Directory
    );
}

#[rstest]
fn test_error_codes(source: TempDir) {
    let fs = filesystem(&source);
    std::fs::write(source.path().join("a.json"), b"{}").unwrap();
    let file = fs.lookup(ROOT_INODE, name("a.json")).unwrap();
    let fh = fs.open(file.ino, libc::O_RDONLY).unwrap();

    let errno = |err: super::Error| err.os_error();
    assert_eq!(errno(fs.getattr(9999, None).unwrap_err()), Some(libc::ENOENT));
    assert_eq!(errno(fs.read(9999, 0, 1).unwrap_err()), Some(libc::EBADF));
    assert_eq!(errno(fs.release(9999).unwrap_err()), Some(libc::EBADF));
    assert_eq!(
        errno(fs.open(ROOT_INODE, libc::O_RDONLY).unwrap_err()),
        Some(libc::EISDIR)
    );
    assert_eq!(errno(fs.opendir(file.ino).unwrap_err()), Some(libc::ENOTDIR));
    assert_eq!(errno(fs.readdir(fh, 0).unwrap_err()), Some(libc::ENOTDIR));
    assert_eq!(
        errno(fs.lookup(ROOT_INODE, name("missing.json")).unwrap_err()),
        Some(libc::ENOENT)
    );
    assert_eq!(
        errno(fs.create(ROOT_INODE, name("a.json"), 0o644).unwrap_err()),
        Some(libc::EEXIST)
    );
    fs.release(fh).unwrap();
}
