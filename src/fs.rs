//! The VFS dispatcher: one handler per filesystem operation.
//!
//! Every handler follows the same skeleton. Borrow a connection from the
//! pool, open a transaction, refuse writes on a read-only mount, resolve the
//! path(s), check preconditions, do the metadata and block work, commit. An
//! early return drops the transaction, which rolls it back, and drops the
//! pooled connection, which releases it — failure cleanup is the destructor
//! path, not code in every handler.
//!
//! Handlers are keyed by path. File handles returned from `open` and
//! `create` are the inode ids themselves; `read`, `write` and `ftruncate`
//! accept them directly and skip path resolution. There is no other
//! per-handle state.

use std::sync::Arc;

use libc::{
    EBADF, EEXIST, EFBIG, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, EPERM, EROFS, O_ACCMODE,
    O_RDONLY, c_int,
};
use log::{error, info};
use postgres::Transaction;

use crate::blocks;
use crate::config::{MAX_FILENAME_LENGTH, PgFuseConfig};
use crate::meta::{self, DirEntry, PgMeta};
use crate::pool::{ConnPool, PooledConn};
use crate::timestamp::PgTimestamp;

/// Constant `statfs` answer. The backing store is shared and of unknown
/// size, so totals are simply "very large".
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub struct PgFuse {
    cfg: PgFuseConfig,
    pool: Arc<ConnPool>,
}

fn begin<'a>(conn: &'a mut PooledConn<'_>) -> Result<Transaction<'a>, c_int> {
    conn.transaction().map_err(|e| {
        error!("begin of transaction failed: {e}");
        EIO
    })
}

fn commit(txn: Transaction<'_>) -> Result<(), c_int> {
    txn.commit().map_err(|e| {
        error!("commit of transaction failed: {e}");
        EIO
    })
}

/// Handle-keyed operations report a vanished inode as a stale handle.
fn stale_handle(err: c_int) -> c_int {
    if err == ENOENT { EBADF } else { err }
}

impl PgFuse {
    pub fn new(cfg: PgFuseConfig, pool: Arc<ConnPool>) -> PgFuse {
        PgFuse { cfg, pool }
    }

    pub fn config(&self) -> &PgFuseConfig {
        &self.cfg
    }

    pub fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    pub fn getattr(&self, path: &str) -> Result<(i64, PgMeta), c_int> {
        info!("getattr '{path}'");
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let id = meta::path_to_id(&mut txn, path)?;
        let m = meta::read_meta(&mut txn, id)?;
        commit(txn)?;
        Ok((id, m))
    }

    /// Always grants; stored permissions are not enforced.
    pub fn access(&self, path: &str) -> Result<(), c_int> {
        info!("access '{path}'");
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<(i64, PgMeta), c_int> {
        info!("mkdir '{path}' in mode {mode:o}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let (parent_path, name) = meta::split_parent(path);
        if name.is_empty() {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let parent_id = meta::path_to_id(&mut txn, parent_path)?;
        if !meta::read_meta(&mut txn, parent_id)?.is_dir() {
            return Err(ENOTDIR);
        }
        if meta::lookup_child(&mut txn, parent_id, name)?.is_some() {
            return Err(EEXIST);
        }
        let now = PgTimestamp::now();
        let m = PgMeta {
            size: 0,
            mode: mode | libc::S_IFDIR as u32,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
            parent_id,
        };
        let id = meta::create_entry(&mut txn, parent_id, name, &m)?;
        commit(txn)?;
        Ok((id, m))
    }

    pub fn rmdir(&self, path: &str) -> Result<(), c_int> {
        info!("rmdir '{path}'");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let id = meta::path_to_id(&mut txn, path)?;
        if !meta::read_meta(&mut txn, id)?.is_dir() {
            return Err(ENOTDIR);
        }
        meta::delete_dir(&mut txn, id)?;
        commit(txn)
    }

    pub fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<(i64, PgMeta), c_int> {
        info!("create '{path}' in mode {mode:o}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let (parent_path, name) = meta::split_parent(path);
        if name.is_empty() {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let parent_id = meta::path_to_id(&mut txn, parent_path)?;
        if !meta::read_meta(&mut txn, parent_id)?.is_dir() {
            return Err(ENOTDIR);
        }
        if let Some((_, child_mode)) = meta::lookup_child(&mut txn, parent_id, name)? {
            return Err(if child_mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                EISDIR
            } else {
                EEXIST
            });
        }
        // the kernel usually sends bare permission bits here
        let mode = if mode & libc::S_IFMT as u32 == 0 {
            mode | libc::S_IFREG as u32
        } else {
            mode
        };
        let now = PgTimestamp::now();
        let m = PgMeta {
            size: 0,
            mode,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
            parent_id,
        };
        let id = meta::create_entry(&mut txn, parent_id, name, &m)?;
        commit(txn)?;
        Ok((id, m))
    }

    pub fn unlink(&self, path: &str) -> Result<(), c_int> {
        info!("unlink '{path}'");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let id = meta::path_to_id(&mut txn, path)?;
        if meta::read_meta(&mut txn, id)?.is_dir() {
            return Err(EPERM);
        }
        meta::delete_file(&mut txn, id)?;
        commit(txn)
    }

    /// Resolve a path for I/O; the returned id doubles as the file handle.
    pub fn open(&self, path: &str, flags: i32) -> Result<(i64, PgMeta), c_int> {
        info!("open '{path}' with flags {flags:#o}");
        if self.cfg.read_only && flags & O_ACCMODE != O_RDONLY {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, m) = meta::read_meta_from_path(&mut txn, path)?;
        if m.is_dir() {
            return Err(EISDIR);
        }
        commit(txn)?;
        Ok((id, m))
    }

    pub fn read(&self, id: i64, offset: i64, len: usize) -> Result<Vec<u8>, c_int> {
        info!("read inode {id}, offset {offset}, length {len}");
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let data = blocks::read_buf(&mut txn, self.cfg.block_size, id, offset, len)
            .map_err(stale_handle)?;
        commit(txn)?;
        Ok(data)
    }

    pub fn write(&self, id: i64, offset: i64, data: &[u8]) -> Result<usize, c_int> {
        info!("write inode {id}, offset {offset}, length {}", data.len());
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let end = offset.checked_add(data.len() as i64).ok_or(EFBIG)?;
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let mut m = meta::read_meta(&mut txn, id).map_err(stale_handle)?;
        let written = blocks::write_buf(&mut txn, self.cfg.block_size, id, data, offset)?;
        m.size = m.size.max(end);
        meta::write_meta(&mut txn, id, &m)?;
        commit(txn)?;
        Ok(written)
    }

    pub fn truncate(&self, path: &str, new_size: i64) -> Result<(), c_int> {
        info!("truncate '{path}' to size {new_size}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        if new_size < 0 {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let id = meta::path_to_id(&mut txn, path)?;
        blocks::truncate(&mut txn, self.cfg.block_size, id, new_size)?;
        commit(txn)
    }

    pub fn ftruncate(&self, id: i64, new_size: i64) -> Result<(), c_int> {
        info!("ftruncate inode {id} to size {new_size}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        if new_size < 0 {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        blocks::truncate(&mut txn, self.cfg.block_size, id, new_size).map_err(stale_handle)?;
        commit(txn)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), c_int> {
        info!("chmod '{path}' to mode {mode:o}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, mut m) = meta::read_meta_from_path(&mut txn, path)?;
        // keep the type bits, take the permission bits
        m.mode = (m.mode & libc::S_IFMT as u32) | (mode & !(libc::S_IFMT as u32));
        meta::write_meta(&mut txn, id, &m)?;
        commit(txn)
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), c_int> {
        info!("chown '{path}' to {uid:?}:{gid:?}");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, mut m) = meta::read_meta_from_path(&mut txn, path)?;
        if let Some(uid) = uid {
            m.uid = uid;
        }
        if let Some(gid) = gid {
            m.gid = gid;
        }
        meta::write_meta(&mut txn, id, &m)?;
        commit(txn)
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<PgTimestamp>,
        mtime: Option<PgTimestamp>,
    ) -> Result<(), c_int> {
        info!("utimens '{path}'");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, mut m) = meta::read_meta_from_path(&mut txn, path)?;
        if let Some(atime) = atime {
            m.atime = atime;
        }
        if let Some(mtime) = mtime {
            m.mtime = mtime;
        }
        meta::write_meta(&mut txn, id, &m)?;
        commit(txn)
    }

    /// Create a symlink at `link_path`; the target string is stored as the
    /// link's content and its length as the size.
    pub fn symlink(
        &self,
        target: &str,
        link_path: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(i64, PgMeta), c_int> {
        info!("symlink '{link_path}' pointing to '{target}'");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let (parent_path, name) = meta::split_parent(link_path);
        if name.is_empty() {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let parent_id = meta::path_to_id(&mut txn, parent_path)?;
        if !meta::read_meta(&mut txn, parent_id)?.is_dir() {
            return Err(ENOTDIR);
        }
        if meta::lookup_child(&mut txn, parent_id, name)?.is_some() {
            return Err(EEXIST);
        }
        let now = PgTimestamp::now();
        let m = PgMeta {
            size: target.len() as i64,
            mode: libc::S_IFLNK as u32 | 0o777,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
            parent_id,
        };
        let id = meta::create_entry(&mut txn, parent_id, name, &m)?;
        let written = blocks::write_buf(&mut txn, self.cfg.block_size, id, target.as_bytes(), 0)?;
        if written != target.len() {
            error!("storing symlink target of '{link_path}' wrote {written} of {} bytes", target.len());
            return Err(EIO);
        }
        commit(txn)?;
        Ok((id, m))
    }

    pub fn readlink(&self, path: &str) -> Result<Vec<u8>, c_int> {
        info!("readlink '{path}'");
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, m) = meta::read_meta_from_path(&mut txn, path)?;
        if !m.is_symlink() {
            return Err(EINVAL);
        }
        let target = blocks::read_buf(&mut txn, self.cfg.block_size, id, 0, m.size as usize)?;
        if target.len() != m.size as usize {
            error!(
                "symlink '{path}' stores {} bytes but its size says {}",
                target.len(),
                m.size
            );
            return Err(EIO);
        }
        commit(txn)?;
        Ok(target)
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, c_int> {
        info!("readdir '{path}'");
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let (id, m) = meta::read_meta_from_path(&mut txn, path)?;
        if !m.is_dir() {
            return Err(ENOTDIR);
        }
        let entries = meta::list_dir(&mut txn, id)?;
        commit(txn)?;
        Ok(entries)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), c_int> {
        info!("rename '{from}' to '{to}'");
        if self.cfg.read_only {
            return Err(EROFS);
        }
        let (from_parent_path, _) = meta::split_parent(from);
        let (to_parent_path, to_name) = meta::split_parent(to);
        if to_name.is_empty() {
            return Err(EINVAL);
        }
        let mut conn = self.pool.acquire()?;
        let mut txn = begin(&mut conn)?;
        let from_id = meta::path_to_id(&mut txn, from)?;
        let from_parent_id = meta::path_to_id(&mut txn, from_parent_path)?;
        let to_parent_id = meta::path_to_id(&mut txn, to_parent_path)?;
        meta::rename(&mut txn, from_id, from_parent_id, to_parent_id, to_name)?;
        commit(txn)
    }

    /// Free-space figures are fiction, only the block size and the name
    /// limit mean anything. A read-only mount reports no free space at all.
    pub fn statfs(&self) -> StatFs {
        info!("statfs");
        let bs = self.cfg.block_size as u64;
        let blocks = i64::MAX as u64 / bs;
        let (bfree, ffree) = if self.cfg.read_only {
            (0, 0)
        } else {
            (blocks, i64::MAX as u64)
        };
        StatFs {
            blocks,
            bfree,
            bavail: bfree,
            files: i64::MAX as u64,
            ffree,
            bsize: self.cfg.block_size as u32,
            namelen: MAX_FILENAME_LENGTH as u32,
            frsize: self.cfg.block_size as u32,
        }
    }
}
