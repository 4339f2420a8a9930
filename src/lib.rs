//! PgFuse exposes a PostgreSQL database as a mountable filesystem.
//!
//! File and directory metadata live in an inode-style `dir` table, file
//! contents are sharded into fixed-size blocks stored as `bytea` rows in a
//! `data` table, and a FUSE driver translates kernel VFS requests into
//! transactional SQL. Every operation runs in its own transaction on a
//! connection borrowed from a small pool, so a write that has returned to the
//! kernel is already durable in the database and nothing is cached in the
//! daemon.
//!
//! Paths resolve by walking `(parent_id, name)` pairs, file handles are
//! simply the 64-bit inode ids, and absent block rows inside a file's extent
//! read back as zeroes, which gives sparse files for free. Blocks are padded
//! to exactly the configured block size so partial writes can be expressed
//! as `substring`/concatenation updates on the server.
//!
//! Performance expectations should be modest: each 4k kernel write turns
//! into at least one UPDATE, and large files pay one round trip per block.
//! The upside is that the whole filesystem state lives in one place, can be
//! queried with plain SQL and inherits the database's backup, replication
//! and transactional guarantees.

pub mod blocks;
pub mod config;
pub mod driver;
pub mod fs;
pub mod meta;
pub mod pool;
pub mod schema;
pub mod timestamp;
