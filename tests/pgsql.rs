//! Database integration tests.
//!
//! These need a scratch PostgreSQL database and wipe it between cases, so
//! they are ignored by default. Point `PGFUSE_TEST_CONNINFO` at a disposable
//! database and run them serially:
//!
//! ```text
//! createdb pgfuse_test
//! PGFUSE_TEST_CONNINFO="dbname=pgfuse_test" cargo test -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use postgres::{Client, NoTls};

use pgfuse::config::PgFuseConfig;
use pgfuse::fs::PgFuse;
use pgfuse::pool::ConnPool;
use pgfuse::schema;
use pgfuse::timestamp::PgTimestamp;

const BLOCK_SIZE: usize = 512;
const UID: u32 = 1000;
const GID: u32 = 1000;

fn conninfo() -> String {
    std::env::var("PGFUSE_TEST_CONNINFO")
        .unwrap_or_else(|_| "host=localhost dbname=pgfuse_test user=postgres".to_string())
}

fn raw_client() -> Client {
    Client::connect(&conninfo(), NoTls).expect("connecting to the test database")
}

fn test_config(read_only: bool) -> PgFuseConfig {
    PgFuseConfig {
        conninfo: conninfo(),
        mountpoint: "/unused".to_string(),
        read_only,
        verbose: false,
        single_threaded: false,
        block_size: BLOCK_SIZE,
        block_size_explicit: false,
        pool_size: 2,
        fuse_options: Vec::new(),
    }
}

/// Fresh dispatcher over a schema holding nothing but the root directory.
fn test_fs() -> PgFuse {
    let mut client = raw_client();
    schema::check_integer_datetimes(&mut client).expect("server must use integer datetimes");
    schema::ensure_schema(&mut client, UID, GID).expect("initializing the schema");
    client
        .execute("DELETE FROM dir WHERE id <> 1", &[])
        .expect("clearing the tree");

    let cfg = test_config(false);
    let pool = Arc::new(ConnPool::connect(&cfg.conninfo, cfg.pool_size).expect("pool"));
    PgFuse::new(cfg, pool)
}

fn read_only_fs() -> PgFuse {
    let cfg = test_config(true);
    let pool = Arc::new(ConnPool::connect(&cfg.conninfo, cfg.pool_size).expect("pool"));
    PgFuse::new(cfg, pool)
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn create_write_read() {
    let fs = test_fs();

    let (id, _) = fs.create("/a", 0o644, UID, GID).unwrap();
    assert_eq!(fs.write(id, 0, &[0x41; 1000]).unwrap(), 1000);

    let (_, m) = fs.getattr("/a").unwrap();
    assert_eq!(m.size, 1000);

    assert_eq!(fs.read(id, 0, 1000).unwrap(), vec![0x41; 1000]);
    assert_eq!(fs.read(id, 999, 1000).unwrap(), vec![0x41]);
    assert!(fs.read(id, 1000, 1000).unwrap().is_empty());
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn sparse_write_reads_zeroes_and_stores_one_block() {
    let fs = test_fs();

    let (id, _) = fs.create("/s", 0o644, UID, GID).unwrap();
    assert_eq!(fs.write(id, 2048, &[0xff; 4]).unwrap(), 4);

    let (_, m) = fs.getattr("/s").unwrap();
    assert_eq!(m.size, 2052);

    let data = fs.read(id, 0, 2052).unwrap();
    assert_eq!(data.len(), 2052);
    assert!(data[..2048].iter().all(|&b| b == 0));
    assert_eq!(&data[2048..], &[0xff; 4]);

    // exactly one block row exists, fully padded
    let rows = raw_client()
        .query(
            "SELECT block_no, octet_length(data) FROM data WHERE dir_id = $1::bigint \
             ORDER BY block_no",
            &[&id],
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, i64>(0), 4);
    assert_eq!(rows[0].get::<_, i32>(1) as usize, BLOCK_SIZE);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn truncate_shrink_then_grow() {
    let fs = test_fs();

    let (id, _) = fs.create("/t", 0o644, UID, GID).unwrap();
    assert_eq!(fs.write(id, 0, &[0x11; 1500]).unwrap(), 1500);

    fs.truncate("/t", 600).unwrap();
    assert_eq!(fs.getattr("/t").unwrap().1.size, 600);
    assert_eq!(fs.read(id, 0, 2000).unwrap(), vec![0x11; 600]);

    fs.truncate("/t", 2000).unwrap();
    assert_eq!(fs.getattr("/t").unwrap().1.size, 2000);
    let data = fs.read(id, 0, 2000).unwrap();
    assert_eq!(data.len(), 2000);
    assert_eq!(&data[..600], &[0x11; 600][..]);
    assert!(data[600..].iter().all(|&b| b == 0));
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn truncate_to_zero_drops_every_block() {
    let fs = test_fs();

    let (id, _) = fs.create("/z", 0o644, UID, GID).unwrap();
    fs.write(id, 0, &[0x22; 1500]).unwrap();
    fs.truncate("/z", 0).unwrap();

    assert_eq!(fs.getattr("/z").unwrap().1.size, 0);
    assert!(fs.read(id, 0, 100).unwrap().is_empty());

    let rows = raw_client()
        .query("SELECT block_no FROM data WHERE dir_id = $1::bigint", &[&id])
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn no_blocks_survive_past_the_logical_size() {
    let fs = test_fs();

    let (id, _) = fs.create("/inv", 0o644, UID, GID).unwrap();
    fs.write(id, 0, &[0x33; 2000]).unwrap();
    fs.truncate("/inv", 700).unwrap();

    let (_, m) = fs.getattr("/inv").unwrap();
    let last_block = (m.size as usize).div_ceil(BLOCK_SIZE) as i64 - 1;
    let rows = raw_client()
        .query(
            "SELECT block_no, octet_length(data) FROM data WHERE dir_id = $1::bigint",
            &[&id],
        )
        .unwrap();
    for row in &rows {
        assert!(row.get::<_, i64>(0) <= last_block);
        assert_eq!(row.get::<_, i32>(1) as usize, BLOCK_SIZE);
    }
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn directory_lifecycle() {
    let fs = test_fs();

    fs.mkdir("/d", 0o755, UID, GID).unwrap();
    fs.create("/d/f", 0o644, UID, GID).unwrap();

    assert_eq!(fs.rmdir("/d").unwrap_err(), libc::ENOTEMPTY);
    // the refused rmdir left the tree alone
    assert!(fs.getattr("/d/f").is_ok());

    fs.unlink("/d/f").unwrap();
    fs.rmdir("/d").unwrap();
    assert_eq!(fs.getattr("/d").unwrap_err(), libc::ENOENT);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn rename_across_directories() {
    let fs = test_fs();

    fs.mkdir("/a", 0o755, UID, GID).unwrap();
    fs.mkdir("/b", 0o755, UID, GID).unwrap();
    let (id, _) = fs.create("/a/x", 0o644, UID, GID).unwrap();
    fs.write(id, 0, &[1, 2, 3]).unwrap();

    fs.rename("/a/x", "/b/y").unwrap();

    assert_eq!(fs.read(id, 0, 3).unwrap(), vec![1, 2, 3]);
    let (new_id, _) = fs.getattr("/b/y").unwrap();
    assert_eq!(new_id, id);
    assert_eq!(fs.getattr("/a/x").unwrap_err(), libc::ENOENT);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn symlink_round_trip() {
    let fs = test_fs();

    let (_, m) = fs.symlink("/target", "/link", UID, GID).unwrap();
    assert_eq!(m.mode & libc::S_IFMT as u32, libc::S_IFLNK as u32);

    assert_eq!(fs.readlink("/link").unwrap(), b"/target".to_vec());

    let (_, m) = fs.getattr("/link").unwrap();
    assert_eq!(m.size, "/target".len() as i64);

    // readlink of anything else is refused
    fs.create("/file", 0o644, UID, GID).unwrap();
    assert_eq!(fs.readlink("/file").unwrap_err(), libc::EINVAL);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn utimens_round_trip_to_the_microsecond() {
    let fs = test_fs();

    fs.create("/stamped", 0o644, UID, GID).unwrap();
    let atime = PgTimestamp::from_raw(123_456_789);
    let mtime = PgTimestamp::from_raw(987_654_321);
    fs.utimens("/stamped", Some(atime), Some(mtime)).unwrap();

    let (_, m) = fs.getattr("/stamped").unwrap();
    assert_eq!(m.atime, atime);
    assert_eq!(m.mtime, mtime);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn resolution_errors() {
    let fs = test_fs();

    assert_eq!(fs.getattr("/missing").unwrap_err(), libc::ENOENT);

    fs.create("/plain", 0o644, UID, GID).unwrap();
    // a file used as an intermediate directory
    assert_eq!(fs.getattr("/plain/below").unwrap_err(), libc::ENOTDIR);

    // creating the same name twice
    assert_eq!(
        fs.create("/plain", 0o644, UID, GID).unwrap_err(),
        libc::EEXIST
    );
    fs.mkdir("/dir", 0o755, UID, GID).unwrap();
    assert_eq!(
        fs.create("/dir", 0o644, UID, GID).unwrap_err(),
        libc::EISDIR
    );
    assert_eq!(fs.unlink("/dir").unwrap_err(), libc::EPERM);
    assert_eq!(fs.open("/dir", libc::O_RDONLY).unwrap_err(), libc::EISDIR);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn readdir_lists_children() {
    let fs = test_fs();

    fs.mkdir("/d1", 0o755, UID, GID).unwrap();
    fs.mkdir("/d2", 0o755, UID, GID).unwrap();
    fs.create("/f1", 0o644, UID, GID).unwrap();

    let mut names: Vec<String> = fs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["d1", "d2", "f1"]);

    assert!(fs.readdir("/d1").unwrap().is_empty());
    assert_eq!(fs.readdir("/f1").unwrap_err(), libc::ENOTDIR);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn read_only_mount_refuses_writes() {
    // initialize with a writable dispatcher first
    let fs = test_fs();
    fs.create("/kept", 0o644, UID, GID).unwrap();

    let ro = read_only_fs();
    assert_eq!(ro.create("/new", 0o644, UID, GID).unwrap_err(), libc::EROFS);
    assert_eq!(ro.mkdir("/newdir", 0o755, UID, GID).unwrap_err(), libc::EROFS);
    assert_eq!(ro.unlink("/kept").unwrap_err(), libc::EROFS);
    assert_eq!(ro.truncate("/kept", 0).unwrap_err(), libc::EROFS);
    assert_eq!(
        ro.open("/kept", libc::O_WRONLY).unwrap_err(),
        libc::EROFS
    );

    // reading is still fine
    assert!(ro.getattr("/kept").is_ok());
    let (id, _) = ro.open("/kept", libc::O_RDONLY).unwrap();
    assert!(ro.read(id, 0, 10).unwrap().is_empty());
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn stale_handles_report_ebadf() {
    let fs = test_fs();

    let (id, _) = fs.create("/gone", 0o644, UID, GID).unwrap();
    fs.unlink("/gone").unwrap();

    assert_eq!(fs.read(id, 0, 10).unwrap_err(), libc::EBADF);
    assert_eq!(fs.write(id, 0, &[1]).unwrap_err(), libc::EBADF);
    assert_eq!(fs.ftruncate(id, 0).unwrap_err(), libc::EBADF);
}

#[test]
#[ignore = "needs a PostgreSQL test database"]
fn block_size_negotiation() {
    let fs = test_fs();
    let (id, _) = fs.create("/sized", 0o644, UID, GID).unwrap();
    fs.write(id, 0, &[9; 10]).unwrap();

    let mut client = raw_client();
    // the stored size wins over a defaulted one
    assert_eq!(
        schema::negotiate_block_size(&mut client, 4096, false).unwrap(),
        BLOCK_SIZE
    );
    // an explicit mismatch is a mount error
    assert!(schema::negotiate_block_size(&mut client, 4096, true).is_err());
    // an explicit match is fine
    assert_eq!(
        schema::negotiate_block_size(&mut client, BLOCK_SIZE, true).unwrap(),
        BLOCK_SIZE
    );
}
