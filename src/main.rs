use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::fs::OpenOptions;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn, Level};
use z_backup::backup::config::{discover_by_property, BackupConfig};
use z_backup::backup::naming::Naming;
use z_backup::backup::pidfile::Pidfile;
use z_backup::backup::planner::{BackupSpec, Planner};
use z_backup::backup::result_error::error::Error;
use z_backup::backup::result_error::result::Result;
use z_backup::backup::result_error::WithMsg;
use z_backup::backup::retention::RetentionPolicy;
use z_backup::backup::scheduler::Scheduler;
use z_backup::backup::zfs::runner::{RemoteAuth, Runner, ZfsRunner};

static LOG_TO_STDERR: &str = "stderr";

/// Incremental ZFS snapshot replication to a local or remote pool
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long, default_value = "/etc/zbackup/zbackup.yml", conflicts_with = "property")]
    config: PathBuf,

    /// Back up every filesystem having this user property set to "true"
    #[arg(short = 'u', long)]
    property: Option<String>,

    /// Destination host[:port] in property mode
    #[arg(long, requires = "property")]
    host: Option<String>,

    /// Destination ssh user in property mode
    #[arg(long, default_value = "root", requires = "property")]
    user: String,

    /// Private key for the destination in property mode
    #[arg(long, default_value = "/root/.ssh/id_rsa", requires = "property")]
    key: PathBuf,

    /// Maximum parallel backups in property mode
    #[arg(long, default_value = "5", requires = "property")]
    threads: NonZeroUsize,

    /// Destination pool in property mode
    #[arg(long, default_value = "zroot", requires = "property")]
    remote: String,

    /// Retention in property mode: "lastone", a duration like "24h", or "" to keep everything
    #[arg(long, default_value = "24h", requires = "property")]
    expire: String,

    /// Back up to a local pool in property mode
    #[arg(long, requires = "property")]
    local: bool,

    /// Check the configuration, print the planned backups and exit
    #[arg(short, long)]
    test: bool,

    /// Print the planned backups without running them
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Refuse to run while this file exists
    #[arg(short, long, default_value = "/var/run/zbackup.pid")]
    pidfile: PathBuf,

    /// info or debug
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// "stderr" or a file to append to
    #[arg(long, default_value = LOG_TO_STDERR)]
    log_file: String,
}

impl Args {
    fn destination(&self) -> Runner {
        if self.local {
            return Runner::Local;
        }
        let Some(host) = self.host.as_deref() else {
            Args::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "--host is required with --property unless --local is set",
                )
                .exit()
        };
        let Some((host, port)) = RemoteAuth::split_host(host) else {
            Args::command()
                .error(ErrorKind::InvalidValue, format!("invalid --host {host:?}"))
                .exit()
        };
        Runner::Remote(
            RemoteAuth::builder()
                .host(host)
                .port(port)
                .user(self.user.as_str())
                .key(self.key.as_path())
                .build(),
        )
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.as_str() {
        "debug" => Level::DEBUG,
        _ => Level::INFO,
    };
    let builder = tracing_subscriber::fmt().with_max_level(level);
    if args.log_file == LOG_TO_STDERR {
        builder.with_writer(io::stderr).init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log_file)
            .map_err(Error::from)
            .with_msg(format!("Cannot open log file {:?}", args.log_file))?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    if !matches!(args.log_level.as_str(), "info" | "debug") {
        warn!("unknown log level {:?}, using info", args.log_level);
    }
    Ok(())
}

fn load_specs(args: &Args, source: &ZfsRunner) -> Result<(Vec<BackupSpec>, NonZeroUsize)> {
    match &args.property {
        Some(property) => {
            let expire = RetentionPolicy::parse_optional(&args.expire)
                .with_msg(format!("Invalid --expire {:?}", args.expire))?;
            let specs =
                discover_by_property(source, property, &args.remote, expire, args.destination())?;
            Ok((specs, args.threads))
        }
        None => {
            let config = BackupConfig::load(&args.config)?;
            let max_parallel = config.max_parallel();
            Ok((config.specs(), max_parallel))
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let naming = Arc::new(Naming::for_local_host()?);
    let (specs, max_parallel) = load_specs(&args, &ZfsRunner::local())?;
    let planner = Planner::with_zfs_runner(naming.clone());

    if args.test {
        info!("configuration is valid, {} backup section(s)", specs.len());
        Scheduler::dry_run(&planner.plan(&specs), io::stdout().lock())?;
        return Ok(0);
    }

    let _pidfile = Pidfile::create(&args.pidfile)?;
    let tasks = planner.plan(&specs);
    if tasks.is_empty() {
        warn!("no backup tasks");
        return Ok(0);
    }
    if args.dry_run {
        Scheduler::dry_run(&tasks, io::stdout().lock())?;
        return Ok(0);
    }

    let report = Scheduler::new(naming, max_parallel).run(tasks)?;
    Ok(report.exit_code())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("{e}");
        exit(1);
    }

    match run(args) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
