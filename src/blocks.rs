//! Block-sharded file content I/O on the `data` table.
//!
//! A byte-granular `(offset, length)` request is sliced into block-aligned
//! pieces: a first block touched from `from_offset` for `from_len` bytes, a
//! run of whole blocks, and a last block touched for `to_len` bytes. Reads
//! fetch the whole range in one query and substitute zeroes for absent rows
//! (sparse holes). Writes update each block in place with server-side
//! `substring` concatenation, allocating a zeroed block on first touch.

use libc::{EIO, c_int};
use log::{debug, error};
use postgres::GenericClient;

use crate::meta;

/// Block slice of a byte range, see `block_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from_block: i64,
    pub from_offset: usize,
    pub from_len: usize,
    pub to_block: i64,
    pub to_len: usize,
}

/// Compute which blocks a byte range touches and how far into the boundary
/// blocks it reaches. A range ending exactly on a block boundary counts the
/// full final block instead of a zero-length tail; an empty range at offset
/// zero yields `to_block = -1`.
pub fn block_range(block_size: usize, offset: i64, len: usize) -> BlockRange {
    let bs = block_size as i64;
    let from_block = offset / bs;
    let from_offset = (offset % bs) as usize;

    let nof_blocks = (from_offset + len) / block_size;
    let from_len = if nof_blocks == 0 {
        len
    } else {
        block_size - from_offset
    };

    let mut to_block = from_block + nof_blocks as i64;
    let mut to_len = (from_offset + len) % block_size;
    if to_len == 0 {
        to_block -= 1;
        to_len = block_size;
    }

    BlockRange {
        from_block,
        from_offset,
        from_len,
        to_block,
        to_len,
    }
}

/// Read up to `len` bytes at `offset`, clamped to the current file size.
/// Reads past end of file return an empty buffer, never an error.
pub fn read_buf(
    client: &mut impl GenericClient,
    block_size: usize,
    id: i64,
    offset: i64,
    len: usize,
) -> Result<Vec<u8>, c_int> {
    let m = meta::read_meta(client, id)?;
    if m.size == 0 || offset >= m.size {
        return Ok(Vec::new());
    }

    let mut size = len;
    if offset + size as i64 > m.size {
        size = (m.size - offset) as usize;
    }
    if size == 0 {
        return Ok(Vec::new());
    }

    let range = block_range(block_size, offset, size);
    let rows = client
        .query(
            "SELECT block_no, data FROM data WHERE dir_id=$1::bigint \
             AND block_no>=$2::bigint AND block_no<=$3::bigint ORDER BY block_no ASC",
            &[&id, &range.from_block, &range.to_block],
        )
        .map_err(|e| {
            error!("reading blocks {}..={} of inode {id} failed: {e}", range.from_block, range.to_block);
            EIO
        })?;

    // one zero block per call, shared by every hole in the range
    let zero_block = vec![0u8; block_size];

    let mut out = Vec::with_capacity(size);
    let mut idx = 0;
    for block_no in range.from_block..=range.to_block {
        let data: &[u8] = if idx < rows.len() {
            let db_block_no: i64 = rows[idx].get(0);
            if block_no < db_block_no {
                &zero_block
            } else {
                let payload: &[u8] = rows[idx].get(1);
                idx += 1;
                payload
            }
        } else {
            &zero_block
        };

        if data.len() != block_size {
            error!(
                "block {block_no} of inode {id} is {} bytes instead of {block_size}, \
                 data inconsistent",
                data.len()
            );
            return Err(EIO);
        }

        if block_no == range.from_block {
            out.extend_from_slice(&data[range.from_offset..range.from_offset + range.from_len]);
        } else if block_no == range.to_block {
            out.extend_from_slice(&data[..range.to_len]);
        } else {
            out.extend_from_slice(data);
        }

        debug!("inode {id}, reading block {block_no}, copied {}", out.len());
    }

    if out.len() != size {
        error!(
            "read of inode {id} copied {} bytes but expected {size}",
            out.len()
        );
        return Err(EIO);
    }

    Ok(out)
}

/// The UPDATE for one sub-block write. Four shapes depending on where the
/// write lands inside the block; anything else is a caller bug.
fn update_sql(block_size: usize, offset: usize, len: usize) -> Option<String> {
    if offset == 0 && len == block_size {
        // whole block, old data does not matter
        Some(
            "UPDATE data SET data = $3::bytea \
             WHERE dir_id=$1::bigint AND block_no=$2::bigint"
                .to_string(),
        )
    } else if offset == 0 && len < block_size {
        // keep old data on the right
        Some(format!(
            "UPDATE data SET data = $3::bytea || substring( data from {} for {} ) \
             WHERE dir_id=$1::bigint AND block_no=$2::bigint",
            len + 1,
            block_size - len
        ))
    } else if offset > 0 && offset + len == block_size {
        // keep old data on the left
        Some(format!(
            "UPDATE data SET data = substring( data from 1 for {offset} ) || $3::bytea \
             WHERE dir_id=$1::bigint AND block_no=$2::bigint"
        ))
    } else if offset > 0 && offset + len < block_size {
        // write in the middle, keep old data on both sides
        Some(format!(
            "UPDATE data SET data = substring( data from 1 for {offset} ) || $3::bytea || \
             substring( data from {} for {} ) \
             WHERE dir_id=$1::bigint AND block_no=$2::bigint",
            offset + len + 1,
            block_size - (offset + len)
        ))
    } else {
        None
    }
}

/// Write `payload` into one block at `offset`. If the block row does not
/// exist yet it is allocated zero-filled and the update retried once.
fn write_block(
    client: &mut impl GenericClient,
    block_size: usize,
    id: i64,
    block_no: i64,
    offset: usize,
    payload: &[u8],
) -> Result<usize, c_int> {
    if offset + payload.len() > block_size {
        error!(
            "got a too big block write for inode {id}, block {block_no}: \
             {offset} + {} > {block_size}",
            payload.len()
        );
        return Err(EIO);
    }

    let sql = match update_sql(block_size, offset, payload.len()) {
        Some(sql) => sql,
        None => {
            error!(
                "unhandled write case for inode {id} in block {block_no}: \
                 offset {offset}, len {}, block size {block_size}",
                payload.len()
            );
            return Err(EIO);
        }
    };

    debug!(
        "inode {id}, block {block_no}, offset {offset}, len {} => {sql}",
        payload.len()
    );

    let mut allocated = false;
    loop {
        let affected = client
            .execute(sql.as_str(), &[&id, &block_no, &payload])
            .map_err(|e| {
                error!("updating block {block_no} of inode {id} failed: {e}");
                EIO
            })?;

        match affected {
            1 => return Ok(payload.len()),
            0 if !allocated => {
                // the block does not exist yet, allocate it zero-filled
                let zeros = vec![0u8; block_size];
                let inserted = client
                    .execute(
                        "INSERT INTO data( dir_id, block_no, data ) \
                         VALUES ( $1::bigint, $2::bigint, $3::bytea )",
                        &[&id, &block_no, &zeros],
                    )
                    .map_err(|e| {
                        error!("allocating block {block_no} of inode {id} failed: {e}");
                        EIO
                    })?;
                if inserted != 1 {
                    error!(
                        "unable to allocate block {block_no} of inode {id}, data inconsistent"
                    );
                    return Err(EIO);
                }
                allocated = true;
            }
            n => {
                error!(
                    "updating block {block_no} of inode {id} touched {n} rows, \
                     data inconsistent"
                );
                return Err(EIO);
            }
        }
    }
}

/// Write `buf` at `offset`, returning the number of bytes written. The file
/// size in `dir` is not touched here; the caller owns that update.
pub fn write_buf(
    client: &mut impl GenericClient,
    block_size: usize,
    id: i64,
    buf: &[u8],
    offset: i64,
) -> Result<usize, c_int> {
    if buf.is_empty() {
        return Ok(0);
    }

    let range = block_range(block_size, offset, buf.len());
    let mut pos = 0;
    for block_no in range.from_block..=range.to_block {
        let (sub_offset, sub_len) = if block_no == range.from_block {
            (range.from_offset, range.from_len)
        } else if block_no == range.to_block {
            (0, range.to_len)
        } else {
            (0, block_size)
        };
        let written = write_block(client, block_size, id, block_no, sub_offset, &buf[pos..pos + sub_len])?;
        if written != sub_len {
            error!(
                "partial write in inode {id} in block {block_no} \
                 ({written} instead of {sub_len} octets)"
            );
            return Err(EIO);
        }
        pos += sub_len;
    }

    Ok(pos)
}

/// Truncate the file to `new_size`: drop every block past the new last one,
/// zero the cut tail of the last block and store the new size.
pub fn truncate(
    client: &mut impl GenericClient,
    block_size: usize,
    id: i64,
    new_size: i64,
) -> Result<(), c_int> {
    let mut m = meta::read_meta(client, id)?;

    let range = block_range(block_size, 0, new_size as usize);

    client
        .execute(
            "DELETE FROM data WHERE dir_id=$1::bigint AND block_no>$2::bigint",
            &[&id, &range.to_block],
        )
        .map_err(|e| {
            error!("truncating inode {id} to size {new_size} failed: {e}");
            EIO
        })?;

    // Pad the cut tail of the now-last block with zeroes so every stored
    // block keeps its full length. No row is fine: the tail was a sparse
    // hole (or new_size is 0 and to_block is -1), which already reads back
    // as zeroes.
    if range.to_block >= 0 && range.to_len < block_size {
        let zeros = vec![0u8; block_size - range.to_len];
        let sql = format!(
            "UPDATE data SET data = substring( data from 1 for {} ) || $3::bytea \
             WHERE dir_id=$1::bigint AND block_no=$2::bigint",
            range.to_len
        );
        let affected = client
            .execute(sql.as_str(), &[&id, &range.to_block, &zeros])
            .map_err(|e| {
                error!("padding block {} of inode {id} after truncate failed: {e}", range.to_block);
                EIO
            })?;
        if affected > 1 {
            error!(
                "padding block {} of inode {id} touched {affected} rows, data inconsistent",
                range.to_block
            );
            return Err(EIO);
        }
    }

    m.size = new_size;
    meta::write_meta(client, id, &m)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 512;

    #[test]
    fn range_within_one_block() {
        let r = block_range(BS, 10, 20);
        assert_eq!(
            r,
            BlockRange {
                from_block: 0,
                from_offset: 10,
                from_len: 20,
                to_block: 0,
                to_len: 30,
            }
        );
    }

    #[test]
    fn range_spanning_two_blocks() {
        let r = block_range(BS, 0, 1000);
        assert_eq!(
            r,
            BlockRange {
                from_block: 0,
                from_offset: 0,
                from_len: 512,
                to_block: 1,
                to_len: 488,
            }
        );
    }

    #[test]
    fn range_ending_on_block_boundary() {
        let r = block_range(BS, 0, 512);
        assert_eq!(
            r,
            BlockRange {
                from_block: 0,
                from_offset: 0,
                from_len: 512,
                to_block: 0,
                to_len: 512,
            }
        );

        let r = block_range(BS, 512, 1024);
        assert_eq!(
            r,
            BlockRange {
                from_block: 1,
                from_offset: 0,
                from_len: 512,
                to_block: 2,
                to_len: 512,
            }
        );
    }

    #[test]
    fn range_with_unaligned_ends() {
        let r = block_range(BS, 100, 1000);
        assert_eq!(
            r,
            BlockRange {
                from_block: 0,
                from_offset: 100,
                from_len: 412,
                to_block: 2,
                to_len: 76,
            }
        );
    }

    #[test]
    fn range_of_sparse_write_past_eof() {
        // four bytes at offset 2048 land in block 4 alone
        let r = block_range(BS, 2048, 4);
        assert_eq!(
            r,
            BlockRange {
                from_block: 4,
                from_offset: 0,
                from_len: 4,
                to_block: 4,
                to_len: 4,
            }
        );
    }

    #[test]
    fn range_of_truncate_to_600() {
        let r = block_range(BS, 0, 600);
        assert_eq!(r.to_block, 1);
        assert_eq!(r.to_len, 88);
    }

    #[test]
    fn empty_range_has_no_last_block() {
        let r = block_range(BS, 0, 0);
        assert_eq!(r.to_block, -1);
        assert_eq!(r.to_len, BS);
    }

    #[test]
    fn update_sql_full_block() {
        let sql = update_sql(BS, 0, BS).unwrap();
        assert!(sql.starts_with("UPDATE data SET data = $3::bytea WHERE"));
    }

    #[test]
    fn update_sql_keeps_right_part() {
        let sql = update_sql(BS, 0, 100).unwrap();
        assert!(sql.contains("$3::bytea || substring( data from 101 for 412 )"));
    }

    #[test]
    fn update_sql_keeps_left_part() {
        let sql = update_sql(BS, 100, 412).unwrap();
        assert!(sql.contains("substring( data from 1 for 100 ) || $3::bytea"));
        assert!(!sql.contains("|| substring( data from 513"));
    }

    #[test]
    fn update_sql_keeps_both_sides() {
        let sql = update_sql(BS, 100, 100).unwrap();
        assert!(sql.contains(
            "substring( data from 1 for 100 ) || $3::bytea || substring( data from 201 for 312 )"
        ));
    }

    #[test]
    fn update_sql_rejects_overflowing_writes() {
        assert!(update_sql(BS, 100, 500).is_none());
    }
}
