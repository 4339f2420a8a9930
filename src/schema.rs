//! Storage schema and mount-time checks.

use std::error::Error;

use log::info;
use postgres::Client;

use crate::timestamp::PgTimestamp;

const CREATE_TABLES: &str = "
CREATE TABLE dir (
  id         BIGSERIAL PRIMARY KEY,
  parent_id  BIGINT NOT NULL,
  name       VARCHAR NOT NULL,
  size       BIGINT NOT NULL DEFAULT 0,
  mode       INTEGER NOT NULL,
  uid        INTEGER NOT NULL,
  gid        INTEGER NOT NULL,
  ctime      TIMESTAMP NOT NULL,
  mtime      TIMESTAMP NOT NULL,
  atime      TIMESTAMP NOT NULL,
  UNIQUE (parent_id, name)
);
CREATE TABLE data (
  dir_id     BIGINT NOT NULL REFERENCES dir(id) ON DELETE CASCADE,
  block_no   BIGINT NOT NULL,
  data       BYTEA NOT NULL,
  PRIMARY KEY (dir_id, block_no)
);
";

/// Binary transport of timestamps assumes the int64 microsecond
/// representation. Servers compiled with float timestamps would silently
/// deliver garbage, so refuse them outright.
pub fn check_integer_datetimes(client: &mut Client) -> Result<(), Box<dyn Error>> {
    let row = client.query_one("SHOW integer_datetimes", &[])?;
    let value: String = row.get(0);
    if value != "on" {
        return Err(format!(
            "server uses floating point timestamps (integer_datetimes = '{value}'), \
             they have no portable binary representation"
        )
        .into());
    }
    Ok(())
}

pub fn schema_exists(client: &mut Client) -> Result<bool, Box<dyn Error>> {
    let row = client.query_one("SELECT to_regclass('dir')::text", &[])?;
    let name: Option<String> = row.get(0);
    Ok(name.is_some())
}

/// Create both tables and seed the root directory. BIGSERIAL hands the root
/// row id 1 on a fresh schema.
pub fn initialize(client: &mut Client, uid: u32, gid: u32) -> Result<(), Box<dyn Error>> {
    let mut txn = client.transaction()?;
    txn.batch_execute(CREATE_TABLES)?;
    let now = PgTimestamp::now();
    let mode = (libc::S_IFDIR as u32 | 0o755) as i32;
    txn.execute(
        "INSERT INTO dir( parent_id, name, size, mode, uid, gid, ctime, mtime, atime ) \
         VALUES (0, '/', 0, $1::integer, $2::integer, $3::integer, \
         $4::timestamp, $4::timestamp, $4::timestamp)",
        &[&mode, &(uid as i32), &(gid as i32), &now],
    )?;
    txn.commit()?;
    info!("created filesystem schema and root directory");
    Ok(())
}

pub fn ensure_schema(client: &mut Client, uid: u32, gid: u32) -> Result<(), Box<dyn Error>> {
    if !schema_exists(client)? {
        initialize(client, uid, gid)?;
    }
    Ok(())
}

/// The block size is a property of the database, not of the mount: once any
/// block exists its length is authoritative. An empty `data` table accepts
/// whatever was configured.
pub fn negotiate_block_size(
    client: &mut Client,
    configured: usize,
    explicit: bool,
) -> Result<usize, Box<dyn Error>> {
    let rows = client.query("SELECT DISTINCT octet_length(data) FROM data", &[])?;
    match rows.len() {
        0 => Ok(configured),
        1 => {
            let stored = rows[0].get::<_, i32>(0) as usize;
            if explicit && stored != configured {
                return Err(format!(
                    "database stores blocks of {stored} bytes but {configured} were requested"
                )
                .into());
            }
            Ok(stored)
        }
        _ => Err("data table contains blocks of differing sizes, refusing to mount".into()),
    }
}
