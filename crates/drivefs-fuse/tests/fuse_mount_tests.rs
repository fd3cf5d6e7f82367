//! Kernel-level tests through a real FUSE mount.
//!
//! Run: `cargo nextest run -p drivefs-fuse --features fuse-tests fuse_mount_tests`

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;

#[allow(unused_imports)]
use common::*;
use drivefs_core::Drive;
use std::fs;
use std::io::ErrorKind;

#[test]
fn test_mounted_root_lists_network_dir() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    assert_eq!(mount.list("").unwrap(), vec!["Network".to_string()]);
    assert!(fs::metadata(mount.path("Network")).unwrap().is_dir());
    assert!(mount.list("Network").unwrap().is_empty());
}

#[test]
fn test_write_read_through_kernel() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    fs::write(mount.path("hello.txt"), b"hello world").unwrap();
    assert_eq!(fs::read(mount.path("hello.txt")).unwrap(), b"hello world");
    let stored = mount
        .runtime
        .block_on(mount.root.read_file("/hello.txt"))
        .unwrap();
    assert_eq!(stored.as_ref(), b"hello world");
}

#[test]
fn test_mkdir_rename_remove() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    fs::create_dir(mount.path("dir")).unwrap();
    fs::write(mount.path("dir/a.txt"), b"a").unwrap();
    fs::rename(mount.path("dir"), mount.path("moved")).unwrap();
    assert_eq!(fs::read(mount.path("moved/a.txt")).unwrap(), b"a");
    fs::remove_file(mount.path("moved/a.txt")).unwrap();
    fs::remove_dir(mount.path("moved")).unwrap();
    assert_eq!(mount.list("").unwrap(), vec!["Network".to_string()]);
}

#[test]
fn test_by_key_read_through_kernel() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    let drive = mount.drive_with(&[("/a.txt", b"by key")]);
    let hex = drive.key().to_hex();
    assert_eq!(
        fs::read(mount.path(&format!("Network/{hex}/a.txt"))).unwrap(),
        b"by key"
    );
    assert_eq!(mount.list("Network").unwrap(), vec![hex]);
}

#[test]
fn test_invalid_key_through_kernel() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::new());

    let short = "ab".repeat(17);
    let err = fs::read(mount.path(&format!("Network/{short}/x"))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
