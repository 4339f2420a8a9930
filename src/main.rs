use std::process;
use std::sync::Arc;

use fuser::MountOption;
use log::LevelFilter;
use postgres::{Client, NoTls};

use pgfuse::config::{self, Invocation, PgFuseConfig};
use pgfuse::driver::Driver;
use pgfuse::fs::PgFuse;
use pgfuse::pool::ConnPool;
use pgfuse::schema;

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        eprintln!("{}: {}: {}", record.target(), record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Everything that must hold before any VFS traffic is accepted: the server
/// is reachable, transports integer timestamps, has the schema, and agrees
/// on the block size.
fn pre_mount_checks(cfg: &PgFuseConfig) -> Result<usize, String> {
    let mut client = Client::connect(&cfg.conninfo, NoTls)
        .map_err(|e| format!("connection to database failed: {e}"))?;

    schema::check_integer_datetimes(&mut client).map_err(|e| e.to_string())?;

    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    schema::ensure_schema(&mut client, uid, gid)
        .map_err(|e| format!("schema initialization failed: {e}"))?;

    schema::negotiate_block_size(&mut client, cfg.block_size, cfg.block_size_explicit)
        .map_err(|e| e.to_string())
}

fn main() {
    let mut args = std::env::args();
    let progname = args.next().unwrap_or_else(|| "pgfuse".to_string());

    let cfg = match config::parse_args(args) {
        Ok(Invocation::Help) => {
            println!("{}", config::usage(&progname));
            return;
        }
        Ok(Invocation::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Ok(Invocation::Mount(cfg)) => cfg,
        Err(msg) => {
            eprintln!("{progname}: {msg}");
            eprintln!("see '{progname} --help' for usage");
            process::exit(1);
        }
    };

    log::set_logger(&LOGGER).expect("no other logger installed");
    log::set_max_level(if cfg.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });

    let block_size = match pre_mount_checks(&cfg) {
        Ok(bs) => bs,
        Err(msg) => {
            eprintln!("{progname}: {msg}");
            process::exit(1);
        }
    };
    let cfg = PgFuseConfig { block_size, ..cfg };

    let pool = match ConnPool::connect(&cfg.conninfo, cfg.pool_size) {
        Ok(pool) => Arc::new(pool),
        Err(msg) => {
            eprintln!("{progname}: {msg}");
            process::exit(1);
        }
    };

    let mountpoint = cfg.mountpoint.clone();
    let mut options = vec![MountOption::FSName("pgfuse".to_string())];
    options.push(if cfg.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    for opt in &cfg.fuse_options {
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    let driver = Driver::new(PgFuse::new(cfg, pool));
    if let Err(e) = fuser::mount2(driver, &mountpoint, &options) {
        eprintln!("{progname}: mount failed: {e}");
        process::exit(1);
    }
}
