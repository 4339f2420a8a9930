//! Path resolution and metadata operations on the `dir` table.

use libc::{EIO, ENAMETOOLONG, ENOENT, ENOTDIR, ENOTEMPTY, c_int};
use log::error;
use postgres::GenericClient;

use crate::config::MAX_FILENAME_LENGTH;
use crate::timestamp::PgTimestamp;

/// Name of the root row; its `parent_id` is 0 and no other row has one.
pub const ROOT_NAME: &str = "/";

/// Everything stored about a file, directory or symlink except its name.
#[derive(Debug, Clone, Copy)]
pub struct PgMeta {
    /// Content length in bytes; the target length for symlinks, ignored for
    /// directories.
    pub size: i64,
    /// Full POSIX mode, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: PgTimestamp,
    pub mtime: PgTimestamp,
    pub atime: PgTimestamp,
    pub parent_id: i64,
}

impl PgMeta {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }
}

/// One `readdir` entry.
#[derive(Debug)]
pub struct DirEntry {
    pub id: i64,
    pub name: String,
    pub mode: u32,
}

/// Split an absolute path into parent path and leaf name.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => (ROOT_NAME, &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (ROOT_NAME, path),
    }
}

/// Walk an absolute path component by component and return the id of the
/// terminal row.
///
/// The walk starts at `parent_id = 0` with the root's own name, so `/`
/// resolves to the root id without a special case. Components before the last
/// one must be directories.
pub fn path_to_id(client: &mut impl GenericClient, path: &str) -> Result<i64, c_int> {
    let components: Vec<&str> = std::iter::once(ROOT_NAME)
        .chain(path.split('/').filter(|c| !c.is_empty()))
        .collect();

    let mut parent_id: i64 = 0;
    let mut id: i64 = 0;
    for (pos, name) in components.iter().copied().enumerate() {
        let rows = client
            .query(
                "SELECT id, mode FROM dir WHERE name = $1::varchar AND parent_id = $2::bigint",
                &[&name, &parent_id],
            )
            .map_err(|e| {
                error!("path lookup for '{path}' failed in part '{name}': {e}");
                EIO
            })?;
        if rows.is_empty() {
            return Err(ENOENT);
        }
        if rows.len() > 1 {
            error!("expecting exactly one inode for '{path}' in part '{name}', data inconsistent");
            return Err(EIO);
        }
        id = rows[0].get("id");
        let mode = rows[0].get::<_, i32>("mode") as u32;
        if pos + 1 < components.len() && mode & libc::S_IFMT as u32 != libc::S_IFDIR as u32 {
            return Err(ENOTDIR);
        }
        parent_id = id;
    }
    Ok(id)
}

pub fn read_meta(client: &mut impl GenericClient, id: i64) -> Result<PgMeta, c_int> {
    let rows = client
        .query(
            "SELECT size, mode, uid, gid, ctime, mtime, atime, parent_id \
             FROM dir WHERE id = $1::bigint",
            &[&id],
        )
        .map_err(|e| {
            error!("reading metadata of inode {id} failed: {e}");
            EIO
        })?;
    if rows.is_empty() {
        return Err(ENOENT);
    }
    if rows.len() > 1 {
        error!("expecting exactly one inode with id {id}, data inconsistent");
        return Err(EIO);
    }
    let row = &rows[0];
    Ok(PgMeta {
        size: row.get("size"),
        mode: row.get::<_, i32>("mode") as u32,
        uid: row.get::<_, i32>("uid") as u32,
        gid: row.get::<_, i32>("gid") as u32,
        ctime: row.get("ctime"),
        mtime: row.get("mtime"),
        atime: row.get("atime"),
        parent_id: row.get("parent_id"),
    })
}

pub fn read_meta_from_path(client: &mut impl GenericClient, path: &str) -> Result<(i64, PgMeta), c_int> {
    let id = path_to_id(client, path)?;
    Ok((id, read_meta(client, id)?))
}

pub fn write_meta(client: &mut impl GenericClient, id: i64, meta: &PgMeta) -> Result<(), c_int> {
    client
        .execute(
            "UPDATE dir SET size=$2::bigint, mode=$3::integer, uid=$4::integer, gid=$5::integer, \
             ctime=$6::timestamp, mtime=$7::timestamp, atime=$8::timestamp WHERE id=$1::bigint",
            &[
                &id,
                &meta.size,
                &(meta.mode as i32),
                &(meta.uid as i32),
                &(meta.gid as i32),
                &meta.ctime,
                &meta.mtime,
                &meta.atime,
            ],
        )
        .map_err(|e| {
            error!("writing metadata of inode {id} failed: {e}");
            EIO
        })?;
    Ok(())
}

/// Insert a new row under `parent_id` and return its id. The caller supplies
/// complete metadata, type bits included, and is expected to have checked for
/// an existing `(parent_id, name)` within the same transaction.
pub fn create_entry(
    client: &mut impl GenericClient,
    parent_id: i64,
    name: &str,
    meta: &PgMeta,
) -> Result<i64, c_int> {
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(ENAMETOOLONG);
    }
    let row = client
        .query_one(
            "INSERT INTO dir( parent_id, name, size, mode, uid, gid, ctime, mtime, atime ) \
             VALUES ($1::bigint, $2::varchar, $3::bigint, $4::integer, $5::integer, \
             $6::integer, $7::timestamp, $8::timestamp, $9::timestamp ) RETURNING id",
            &[
                &parent_id,
                &name,
                &meta.size,
                &(meta.mode as i32),
                &(meta.uid as i32),
                &(meta.gid as i32),
                &meta.ctime,
                &meta.mtime,
                &meta.atime,
            ],
        )
        .map_err(|e| {
            error!("creating entry '{name}' under inode {parent_id} failed: {e}");
            EIO
        })?;
    Ok(row.get(0))
}

/// Look a single child up by name. `Ok(None)` means no such entry.
pub fn lookup_child(
    client: &mut impl GenericClient,
    parent_id: i64,
    name: &str,
) -> Result<Option<(i64, u32)>, c_int> {
    let rows = client
        .query(
            "SELECT id, mode FROM dir WHERE name = $1::varchar AND parent_id = $2::bigint",
            &[&name, &parent_id],
        )
        .map_err(|e| {
            error!("child lookup of '{name}' under inode {parent_id} failed: {e}");
            EIO
        })?;
    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some((rows[0].get("id"), rows[0].get::<_, i32>("mode") as u32))),
        _ => {
            error!("duplicate entry '{name}' under inode {parent_id}, data inconsistent");
            Err(EIO)
        }
    }
}

pub fn count_children(client: &mut impl GenericClient, id: i64) -> Result<i64, c_int> {
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM dir WHERE parent_id=$1::bigint",
            &[&id],
        )
        .map_err(|e| {
            error!("counting children of inode {id} failed: {e}");
            EIO
        })?;
    Ok(row.get(0))
}

/// Delete a file or symlink row; its `data` rows cascade.
pub fn delete_file(client: &mut impl GenericClient, id: i64) -> Result<(), c_int> {
    client
        .execute("DELETE FROM dir WHERE id=$1::bigint", &[&id])
        .map_err(|e| {
            error!("deleting inode {id} failed: {e}");
            EIO
        })?;
    Ok(())
}

/// Delete a directory row, refusing while it still has children.
pub fn delete_dir(client: &mut impl GenericClient, id: i64) -> Result<(), c_int> {
    if count_children(client, id)? > 0 {
        return Err(ENOTEMPTY);
    }
    delete_file(client, id)
}

/// Move `from_id` below `to_parent_id` under a new name, in one statement.
pub fn rename(
    client: &mut impl GenericClient,
    from_id: i64,
    from_parent_id: i64,
    to_parent_id: i64,
    new_name: &str,
) -> Result<(), c_int> {
    if new_name.len() > MAX_FILENAME_LENGTH {
        return Err(ENAMETOOLONG);
    }
    let from_parent = read_meta(client, from_parent_id)?;
    if !from_parent.is_dir() {
        error!(
            "expecting parent inode {from_parent_id} of renamed inode {from_id} to be a \
             directory, but mode is {:o}",
            from_parent.mode
        );
        return Err(ENOTDIR);
    }
    let to_parent = read_meta(client, to_parent_id)?;
    if !to_parent.is_dir() {
        error!(
            "expecting target parent inode {to_parent_id} to be a directory, but mode is {:o}",
            to_parent.mode
        );
        return Err(ENOTDIR);
    }
    let affected = client
        .execute(
            "UPDATE dir SET parent_id=$1::bigint, name=$2::varchar WHERE id=$3::bigint",
            &[&to_parent_id, &new_name, &from_id],
        )
        .map_err(|e| {
            error!("renaming inode {from_id} to '{new_name}' failed: {e}");
            EIO
        })?;
    if affected != 1 {
        error!("renaming inode {from_id} touched {affected} rows instead of one");
        return Err(EIO);
    }
    Ok(())
}

/// Children of a directory. The root's own row can never be its own child,
/// but a row named `/` is skipped defensively should one ever appear below
/// the root id.
pub fn list_dir(client: &mut impl GenericClient, parent_id: i64) -> Result<Vec<DirEntry>, c_int> {
    let rows = client
        .query(
            "SELECT id, name, mode FROM dir WHERE parent_id = $1::bigint",
            &[&parent_id],
        )
        .map_err(|e| {
            error!("listing children of inode {parent_id} failed: {e}");
            EIO
        })?;
    Ok(rows
        .iter()
        .filter(|row| row.get::<_, &str>("name") != ROOT_NAME)
        .map(|row| DirEntry {
            id: row.get("id"),
            name: row.get("name"),
            mode: row.get::<_, i32>("mode") as u32,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_of_top_level_entry() {
        assert_eq!(split_parent("/a"), ("/", "a"));
    }

    #[test]
    fn split_parent_of_nested_entry() {
        assert_eq!(split_parent("/a/b/c"), ("/a/b", "c"));
    }

    #[test]
    fn split_parent_of_root() {
        assert_eq!(split_parent("/"), ("/", ""));
    }

    #[test]
    fn mode_type_checks() {
        let mut m = PgMeta {
            size: 0,
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: 0,
            gid: 0,
            ctime: PgTimestamp::from_raw(0),
            mtime: PgTimestamp::from_raw(0),
            atime: PgTimestamp::from_raw(0),
            parent_id: 0,
        };
        assert!(m.is_dir());
        assert!(!m.is_symlink());
        m.mode = libc::S_IFLNK as u32 | 0o777;
        assert!(m.is_symlink());
        m.mode = libc::S_IFREG as u32 | 0o644;
        assert!(!m.is_dir());
        assert!(!m.is_symlink());
    }
}
