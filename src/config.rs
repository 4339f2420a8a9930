//! Mount configuration.
//!
//! The command line carries two positionals, the PostgreSQL connection string
//! and the mountpoint, plus a handful of flags and `-o` mount options. A TOML
//! file can supply defaults for anything the command line leaves out
//! (`-o config=FILE`):
//!
//! ```toml
//! [pgfuse]
//!
//! conninfo = "host=localhost dbname=fs user=fs"
//! mountpoint = "/mnt/pg"
//! block_size = 512
//! pool_size = 16
//! read_only = false
//! ```
//!
//! Command-line values always win over file values. Options pgfuse does not
//! recognize are handed through to the FUSE mount untouched.

use std::fs;

use toml::Value;

/// Split size for file content in the `data` table. Fixed per database once
/// the first block has been written.
pub const STANDARD_BLOCK_SIZE: usize = 512;

/// Connections opened eagerly at mount time.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Maximum length of a single path component, a rather arbitrary choice.
pub const MAX_FILENAME_LENGTH: usize = 4096;

/// Immutable after startup; shared by every handler.
#[derive(Debug, Clone)]
pub struct PgFuseConfig {
    pub conninfo: String,
    pub mountpoint: String,
    pub read_only: bool,
    pub verbose: bool,
    pub single_threaded: bool,
    pub block_size: usize,
    /// Whether the block size was requested explicitly (command line or
    /// config file) rather than defaulted; an explicit size that disagrees
    /// with the database is a mount error.
    pub block_size_explicit: bool,
    pub pool_size: usize,
    /// Unrecognized `-o` options, forwarded to the FUSE mount.
    pub fuse_options: Vec<String>,
}

#[derive(Debug)]
pub enum Invocation {
    Mount(PgFuseConfig),
    Help,
    Version,
}

pub fn usage(progname: &str) -> String {
    format!(
        "Usage: {progname} [options] <PostgreSQL connection string> <mountpoint>\n\
         \n\
         PostgreSQL connection string (key=value separated with whitespace):\n\
         \n\
             host                   optional (omit for Unix domain sockets), e.g. 'localhost'\n\
             port                   default is 5432\n\
             dbname                 database to connect to\n\
             user                   database user to connect with\n\
             password               for password credentials (or rather use ~/.pgpass)\n\
             ...\n\
             for more options see the libpq connection string documentation\n\
         \n\
         Example: \"dbname=test user=test password=xx\"\n\
         \n\
         Options:\n\
             -o opt[,opt...]        mount options (see below)\n\
             -s                     single-threaded mode, use one database connection\n\
             -v   --verbose         log every filesystem operation\n\
             -h   --help            print this help\n\
             -V   --version         print version\n\
         \n\
         PgFuse mount options:\n\
             ro                     mount read-only, do not change data in the database\n\
             blocksize=N            size of content blocks (default {STANDARD_BLOCK_SIZE},\n\
                                    must match an already initialized database)\n\
             pool=N                 number of database connections (default {DEFAULT_POOL_SIZE})\n\
             config=FILE            read defaults from a TOML file\n\
         \n\
         Anything else given to -o is passed to the FUSE mount unchanged."
    )
}

#[derive(Debug, Default)]
struct Builder {
    conninfo: Option<String>,
    mountpoint: Option<String>,
    read_only: bool,
    verbose: bool,
    single_threaded: bool,
    block_size: Option<usize>,
    pool_size: Option<usize>,
    config_file: Option<String>,
    fuse_options: Vec<String>,
}

impl Builder {
    fn positional(&mut self, arg: String) -> Result<(), String> {
        if self.conninfo.is_none() {
            self.conninfo = Some(arg);
        } else if self.mountpoint.is_none() {
            self.mountpoint = Some(arg);
        } else {
            return Err(
                "only two arguments allowed: PostgreSQL connection data and mountpoint"
                    .to_string(),
            );
        }
        Ok(())
    }

    fn mount_options(&mut self, opts: &str) -> Result<(), String> {
        for opt in opts.split(',').filter(|o| !o.is_empty()) {
            if opt == "ro" {
                self.read_only = true;
            } else if let Some(value) = opt.strip_prefix("blocksize=") {
                self.block_size = Some(positive(value, "blocksize")?);
            } else if let Some(value) = opt.strip_prefix("pool=") {
                self.pool_size = Some(positive(value, "pool")?);
            } else if let Some(value) = opt.strip_prefix("config=") {
                self.config_file = Some(value.to_string());
            } else {
                self.fuse_options.push(opt.to_string());
            }
        }
        Ok(())
    }

    /// Fill anything still unset from the `[pgfuse]` section of a TOML file.
    fn merge_file(&mut self, text: &str) -> Result<(), String> {
        let value: Value = toml::from_str(text).map_err(|e| format!("invalid config file: {e}"))?;
        let Some(section) = value.get("pgfuse") else {
            return Ok(());
        };
        if self.conninfo.is_none() {
            if let Some(v) = section.get("conninfo").and_then(Value::as_str) {
                self.conninfo = Some(v.to_string());
            }
        }
        if self.mountpoint.is_none() {
            if let Some(v) = section.get("mountpoint").and_then(Value::as_str) {
                self.mountpoint = Some(v.to_string());
            }
        }
        if self.block_size.is_none() {
            if let Some(v) = section.get("block_size").and_then(Value::as_integer) {
                self.block_size = Some(positive(&v.to_string(), "block_size")?);
            }
        }
        if self.pool_size.is_none() {
            if let Some(v) = section.get("pool_size").and_then(Value::as_integer) {
                self.pool_size = Some(positive(&v.to_string(), "pool_size")?);
            }
        }
        if let Some(v) = section.get("read_only").and_then(Value::as_bool) {
            self.read_only = self.read_only || v;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<PgFuseConfig, String> {
        if let Some(path) = self.config_file.take() {
            let text = fs::read_to_string(&path)
                .map_err(|e| format!("unable to read config file '{path}': {e}"))?;
            self.merge_file(&text)?;
        }
        let conninfo = self.conninfo.ok_or("missing PostgreSQL connection data")?;
        let mountpoint = self.mountpoint.ok_or("missing mountpoint")?;
        Ok(PgFuseConfig {
            conninfo,
            mountpoint,
            read_only: self.read_only,
            verbose: self.verbose,
            single_threaded: self.single_threaded,
            block_size: self.block_size.unwrap_or(STANDARD_BLOCK_SIZE),
            block_size_explicit: self.block_size.is_some(),
            pool_size: if self.single_threaded {
                1
            } else {
                self.pool_size.unwrap_or(DEFAULT_POOL_SIZE)
            },
            fuse_options: self.fuse_options,
        })
    }
}

fn positive(value: &str, what: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!(
            "option {what} wants a positive integer, got '{value}'"
        )),
    }
}

/// Parse everything after the program name.
pub fn parse_args<I>(args: I) -> Result<Invocation, String>
where
    I: IntoIterator<Item = String>,
{
    let mut b = Builder::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-V" | "--version" => return Ok(Invocation::Version),
            "-v" | "--verbose" => b.verbose = true,
            "-s" => b.single_threaded = true,
            "-o" => {
                let opts = it.next().ok_or("option -o requires an argument")?;
                b.mount_options(&opts)?;
            }
            _ if arg.starts_with("-o") => b.mount_options(&arg[2..])?,
            _ if arg.starts_with('-') => return Err(format!("unknown option '{arg}'")),
            _ => b.positional(arg)?,
        }
    }
    Ok(Invocation::Mount(b.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mount(list: &[&str]) -> PgFuseConfig {
        match parse_args(args(list)) {
            Ok(Invocation::Mount(cfg)) => cfg,
            other => panic!("expected a mount invocation, got {other:?}"),
        }
    }

    #[test]
    fn two_positionals() {
        let cfg = mount(&["dbname=test", "/mnt/pg"]);
        assert_eq!(cfg.conninfo, "dbname=test");
        assert_eq!(cfg.mountpoint, "/mnt/pg");
        assert!(!cfg.read_only);
        assert_eq!(cfg.block_size, STANDARD_BLOCK_SIZE);
        assert!(!cfg.block_size_explicit);
        assert_eq!(cfg.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn three_positionals_is_an_error() {
        assert!(parse_args(args(&["a", "b", "c"])).is_err());
    }

    #[test]
    fn missing_mountpoint_is_an_error() {
        assert!(parse_args(args(&["dbname=test"])).is_err());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(parse_args(args(&["-h"])), Ok(Invocation::Help)));
        assert!(matches!(
            parse_args(args(&["--version", "x", "y"])),
            Ok(Invocation::Version)
        ));
    }

    #[test]
    fn mount_option_list() {
        let cfg = mount(&["-o", "ro,blocksize=4096,allow_other", "db", "/mnt"]);
        assert!(cfg.read_only);
        assert_eq!(cfg.block_size, 4096);
        assert!(cfg.block_size_explicit);
        assert_eq!(cfg.fuse_options, vec!["allow_other".to_string()]);
    }

    #[test]
    fn glued_mount_options() {
        let cfg = mount(&["-oro", "db", "/mnt"]);
        assert!(cfg.read_only);
    }

    #[test]
    fn single_threaded_collapses_the_pool() {
        let cfg = mount(&["-s", "-o", "pool=8", "db", "/mnt"]);
        assert!(cfg.single_threaded);
        assert_eq!(cfg.pool_size, 1);
    }

    #[test]
    fn bad_blocksize_is_an_error() {
        assert!(parse_args(args(&["-o", "blocksize=0", "db", "/mnt"])).is_err());
        assert!(parse_args(args(&["-o", "blocksize=many", "db", "/mnt"])).is_err());
    }

    #[test]
    fn file_values_fill_the_gaps() {
        let mut b = Builder {
            conninfo: Some("dbname=cli".to_string()),
            ..Builder::default()
        };
        b.merge_file(
            "[pgfuse]\nconninfo = \"dbname=file\"\nmountpoint = \"/mnt/file\"\n\
             block_size = 1024\nread_only = true\n",
        )
        .unwrap();
        let cfg = b.finish().unwrap();
        assert_eq!(cfg.conninfo, "dbname=cli");
        assert_eq!(cfg.mountpoint, "/mnt/file");
        assert_eq!(cfg.block_size, 1024);
        assert!(cfg.read_only);
    }

    #[test]
    fn file_without_pgfuse_section_is_ignored() {
        let mut b = Builder::default();
        b.merge_file("[other]\nkey = 1\n").unwrap();
        assert!(b.conninfo.is_none());
    }
}
