//! The FUSE side of the house.
//!
//! The kernel talks in inode numbers, the dispatcher talks in paths. Since a
//! `dir.id` is never reused (BIGSERIAL), the FUSE inode number simply is the
//! database id, and a bidirectional inode↔path table remembers which path a
//! given inode was last looked up under. `lookup` fills the table, `unlink`,
//! `rmdir` and `rename` maintain it, and everything else consults it.
//!
//! `flush`, `fsync`, `release` and friends are bookkeeping no-ops: each
//! modifying handler commits its own transaction, so by the time the kernel
//! asks, the data is already durable.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bimap::BiMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{EFBIG, EINVAL, ENOENT, c_int};
use log::info;

use crate::fs::PgFuse;
use crate::meta::PgMeta;
use crate::timestamp::PgTimestamp;

const TTL: Duration = Duration::from_secs(1);

/// The root directory is seeded with id 1 on schema initialization, which
/// conveniently matches FUSE_ROOT_ID.
pub const ROOT_INO: u64 = 1;

fn file_kind(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn meta_to_attr(id: i64, m: &PgMeta, block_size: usize) -> FileAttr {
    let size = m.size.max(0) as u64;
    FileAttr {
        ino: id as u64,
        size,
        blocks: size.div_ceil(block_size as u64),
        atime: SystemTime::from(m.atime),
        mtime: SystemTime::from(m.mtime),
        ctime: SystemTime::from(m.ctime),
        crtime: SystemTime::from(m.ctime),
        kind: file_kind(m.mode),
        perm: (m.mode & 0o7777) as u16,
        nlink: if m.is_dir() { 2 } else { 1 },
        uid: m.uid,
        gid: m.gid,
        rdev: 0,
        flags: 0,
        blksize: block_size as u32,
    }
}

fn to_timestamp(t: TimeOrNow) -> PgTimestamp {
    match t {
        TimeOrNow::SpecificTime(t) => PgTimestamp::from(t),
        TimeOrNow::Now => PgTimestamp::now(),
    }
}

/// Which inode id was last seen under which path.
struct InodeDb {
    paths: BiMap<u64, PathBuf>,
}

impl InodeDb {
    fn new() -> InodeDb {
        let mut paths = BiMap::new();
        paths.insert(ROOT_INO, PathBuf::from("/"));
        InodeDb { paths }
    }

    fn path(&self, ino: u64) -> Option<&PathBuf> {
        self.paths.get_by_left(&ino)
    }

    fn ino_of(&self, path: &Path) -> Option<u64> {
        self.paths.get_by_right(path).copied()
    }

    fn record(&mut self, ino: u64, path: PathBuf) {
        self.paths.insert(ino, path);
    }

    fn forget_path(&mut self, path: &Path) {
        self.paths.remove_by_right(path);
    }

    fn forget_ino(&mut self, ino: u64) {
        if ino != ROOT_INO {
            self.paths.remove_by_left(&ino);
        }
    }

    /// Remap an entry and every recorded descendant after a rename.
    fn rename(&mut self, from: &Path, to: &Path) {
        let moved: Vec<(u64, PathBuf)> = self
            .paths
            .iter()
            .filter(|(_, p)| p.starts_with(from))
            .map(|(ino, p)| {
                let new_path = if p.as_path() == from {
                    to.to_path_buf()
                } else {
                    match p.strip_prefix(from) {
                        Ok(rel) => to.join(rel),
                        Err(_) => p.clone(),
                    }
                };
                (*ino, new_path)
            })
            .collect();
        for (ino, path) in moved {
            self.paths.insert(ino, path);
        }
    }
}

pub struct Driver {
    fs: PgFuse,
    inodes: InodeDb,
}

impl Driver {
    pub fn new(fs: PgFuse) -> Driver {
        Driver {
            fs,
            inodes: InodeDb::new(),
        }
    }

    fn attr(&self, id: i64, m: &PgMeta) -> FileAttr {
        meta_to_attr(id, m, self.fs.block_size())
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .path(ino)
            .and_then(|p| p.to_str())
            .map(str::to_string)
            .ok_or(ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<(PathBuf, String), c_int> {
        let parent_path = self.inodes.path(parent).ok_or(ENOENT)?;
        let name = name.to_str().ok_or(EINVAL)?;
        let path = parent_path.join(name);
        let as_string = path.to_str().ok_or(EINVAL)?.to_string();
        Ok((path, as_string))
    }

    /// The file handle set by `open`/`create` is the inode id; fall back to
    /// the inode number when the kernel did not pass one along.
    fn handle(ino: u64, fh: u64) -> i64 {
        if fh != 0 { fh as i64 } else { ino as i64 }
    }
}

impl Filesystem for Driver {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("mounting file system on '{}'", self.fs.config().mountpoint);
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounting file system on '{}'", self.fs.config().mountpoint);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (path, path_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.getattr(&path_str) {
            Ok((id, m)) => {
                self.inodes.record(id as u64, path);
                reply.entry(&TTL, &self.attr(id, &m), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.getattr(&path) {
            Ok((id, m)) if id as u64 == ino => reply.attr(&TTL, &self.attr(id, &m)),
            Ok(_) => {
                // the path meanwhile names a different inode
                self.inodes.forget_ino(ino);
                reply.error(ENOENT);
            }
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut res: Result<(), c_int> = Ok(());
        if let Some(mode) = mode {
            res = self.fs.chmod(&path, mode);
        }
        if res.is_ok() && (uid.is_some() || gid.is_some()) {
            res = self.fs.chown(&path, uid, gid);
        }
        if res.is_ok() {
            if let Some(size) = size {
                res = i64::try_from(size).map_err(|_| EFBIG).and_then(|sz| match fh {
                    Some(fh) if fh != 0 => self.fs.ftruncate(fh as i64, sz),
                    _ => self.fs.truncate(&path, sz),
                });
            }
        }
        if res.is_ok() && (atime.is_some() || mtime.is_some()) {
            res = self
                .fs
                .utimens(&path, atime.map(to_timestamp), mtime.map(to_timestamp));
        }

        match res.and_then(|()| self.fs.getattr(&path)) {
            Ok((id, m)) => reply.attr(&TTL, &self.attr(id, &m)),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (path, path_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.mkdir(&path_str, mode, req.uid(), req.gid()) {
            Ok((id, m)) => {
                self.inodes.record(id as u64, path);
                reply.entry(&TTL, &self.attr(id, &m), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, path_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.unlink(&path_str) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, path_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.rmdir(&path_str) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (path, path_str) = match self.child_path(parent, link_name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let target = match target.to_str() {
            Some(t) => t,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.fs.symlink(target, &path_str, req.uid(), req.gid()) {
            Ok((id, m)) => {
                self.inodes.record(id as u64, path);
                reply.entry(&TTL, &self.attr(id, &m), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from_path, from_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let (to_path, to_str) = match self.child_path(newparent, newname) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.rename(&from_str, &to_str) {
            Ok(()) => {
                self.inodes.rename(&from_path, &to_path);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.open(&path, flags) {
            Ok((id, _)) => reply.opened(id as u64, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(Driver::handle(ino, fh), offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(Driver::handle(ino, fh), offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // every write already committed its own transaction
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let children = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let parent_ino = Path::new(&path)
            .parent()
            .and_then(|p| self.inodes.ino_of(p))
            .unwrap_or(ROOT_INO);

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        entries.extend(
            children
                .into_iter()
                .map(|c| (c.id as u64, file_kind(c.mode), c.name)),
        );

        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            // i + 1 is the offset of the next entry
            if reply.add(entry.0, (i + 1) as i64, entry.1, &entry.2) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.fs.statfs();
        reply.statfs(
            s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
        );
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.path_of(ino).and_then(|path| self.fs.access(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (path, path_str) = match self.child_path(parent, name) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.fs.create(&path_str, mode, req.uid(), req.gid()) {
            Ok((id, m)) => {
                self.inodes.record(id as u64, path);
                reply.created(&TTL, &self.attr(id, &m), 0, id as u64, 0);
            }
            Err(e) => reply.error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(mode: u32, size: i64) -> PgMeta {
        PgMeta {
            size,
            mode,
            uid: 1000,
            gid: 1000,
            ctime: PgTimestamp::from_raw(0),
            mtime: PgTimestamp::from_raw(0),
            atime: PgTimestamp::from_raw(0),
            parent_id: 1,
        }
    }

    #[test]
    fn kind_follows_type_bits() {
        assert_eq!(file_kind(libc::S_IFDIR as u32 | 0o755), FileType::Directory);
        assert_eq!(file_kind(libc::S_IFLNK as u32 | 0o777), FileType::Symlink);
        assert_eq!(file_kind(libc::S_IFREG as u32 | 0o644), FileType::RegularFile);
    }

    #[test]
    fn attr_counts_partial_blocks() {
        let attr = meta_to_attr(7, &sample_meta(libc::S_IFREG as u32 | 0o644, 1000), 512);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 1000);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn inode_db_starts_at_the_root() {
        let db = InodeDb::new();
        assert_eq!(db.path(ROOT_INO), Some(&PathBuf::from("/")));
    }

    #[test]
    fn inode_db_records_and_forgets() {
        let mut db = InodeDb::new();
        db.record(5, PathBuf::from("/a"));
        assert_eq!(db.ino_of(Path::new("/a")), Some(5));
        db.forget_path(Path::new("/a"));
        assert_eq!(db.path(5), None);
        // the root is never forgotten
        db.forget_ino(ROOT_INO);
        assert_eq!(db.ino_of(Path::new("/")), Some(ROOT_INO));
    }

    #[test]
    fn inode_db_rename_moves_descendants() {
        let mut db = InodeDb::new();
        db.record(2, PathBuf::from("/a"));
        db.record(3, PathBuf::from("/a/x"));
        db.record(4, PathBuf::from("/ab"));
        db.rename(Path::new("/a"), Path::new("/b"));
        assert_eq!(db.path(2), Some(&PathBuf::from("/b")));
        assert_eq!(db.path(3), Some(&PathBuf::from("/b/x")));
        // a sibling with a common name prefix stays put
        assert_eq!(db.path(4), Some(&PathBuf::from("/ab")));
    }

    #[test]
    fn handle_prefers_the_file_handle() {
        assert_eq!(Driver::handle(3, 9), 9);
        assert_eq!(Driver::handle(3, 0), 3);
    }
}
