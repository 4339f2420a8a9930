//! Timestamps in the PostgreSQL binary wire representation.
//!
//! The server transports a `TIMESTAMP` as a signed 64-bit count of
//! microseconds since 2000-01-01 00:00:00 UTC, big-endian on the wire.
//! `PgTimestamp` keeps that raw count and converts at the edges, so a value
//! read from the database and written back is bit-identical. This only works
//! when the server was built with integer datetimes, which is checked once
//! at mount time (see `schema::check_integer_datetimes`).

use std::error::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};

/// January 1, 2000, 00:00:00 UTC in Unix epoch seconds.
pub const POSTGRES_EPOCH: i64 = 946_684_800;

const USEC_PER_SEC: i64 = 1_000_000;

/// Microseconds since the PostgreSQL epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PgTimestamp(i64);

impl PgTimestamp {
    pub fn now() -> PgTimestamp {
        PgTimestamp::from(SystemTime::now())
    }

    pub const fn from_raw(usec: i64) -> PgTimestamp {
        PgTimestamp(usec)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Build from Unix seconds and a nanosecond remainder, truncating the
    /// nanoseconds to microsecond precision.
    pub const fn from_unix(secs: i64, nanos: u32) -> PgTimestamp {
        PgTimestamp((secs - POSTGRES_EPOCH) * USEC_PER_SEC + (nanos / 1000) as i64)
    }

    pub const fn unix_micros(self) -> i64 {
        self.0 + POSTGRES_EPOCH * USEC_PER_SEC
    }
}

impl From<SystemTime> for PgTimestamp {
    fn from(t: SystemTime) -> PgTimestamp {
        let unix_micros = match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            Err(e) => -(e.duration().as_micros() as i64),
        };
        PgTimestamp(unix_micros - POSTGRES_EPOCH * USEC_PER_SEC)
    }
}

impl From<PgTimestamp> for SystemTime {
    fn from(t: PgTimestamp) -> SystemTime {
        let unix_micros = t.unix_micros();
        if unix_micros >= 0 {
            UNIX_EPOCH + Duration::from_micros(unix_micros as u64)
        } else {
            UNIX_EPOCH - Duration::from_micros(unix_micros.unsigned_abs())
        }
    }
}

impl ToSql for PgTimestamp {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        out.put_i64(self.0);
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::TIMESTAMP
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for PgTimestamp {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<PgTimestamp, Box<dyn Error + Sync + Send>> {
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| "timestamp field is not 8 bytes wide")?;
        Ok(PgTimestamp(i64::from_be_bytes(bytes)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::TIMESTAMP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_epoch_is_zero() {
        assert_eq!(PgTimestamp::from_unix(POSTGRES_EPOCH, 0).raw(), 0);
    }

    #[test]
    fn one_day_into_the_epoch() {
        let t = PgTimestamp::from_unix(POSTGRES_EPOCH + 86_400, 0);
        assert_eq!(t.raw(), 86_400 * USEC_PER_SEC);
    }

    #[test]
    fn nanoseconds_truncate_to_micros() {
        let t = PgTimestamp::from_unix(POSTGRES_EPOCH, 1_999);
        assert_eq!(t.raw(), 1);
    }

    #[test]
    fn system_time_round_trip() {
        let t = UNIX_EPOCH + Duration::new(1_600_000_000, 123_456_000);
        let pg = PgTimestamp::from(t);
        assert_eq!(SystemTime::from(pg), t);
    }

    #[test]
    fn pre_unix_epoch_times_are_negative() {
        let t = UNIX_EPOCH - Duration::from_secs(10);
        let pg = PgTimestamp::from(t);
        assert_eq!(pg.unix_micros(), -10 * USEC_PER_SEC);
        assert_eq!(SystemTime::from(pg), t);
    }

    #[test]
    fn wire_format_is_big_endian() {
        let raw: &[u8] = &0x0102_0304_0506_0708_i64.to_be_bytes();
        let t = PgTimestamp::from_sql(&Type::TIMESTAMP, raw).unwrap();
        assert_eq!(t.raw(), 0x0102_0304_0506_0708);

        let mut out = BytesMut::new();
        t.to_sql(&Type::TIMESTAMP, &mut out).unwrap();
        assert_eq!(&out[..], raw);
    }
}
