//! # z_backup
//!
//! Incremental ZFS snapshot replication to a local or remote pool.
//!
//! ## Features
//!
//! - **Incremental Transfers**: full send on the first run, deltas afterwards
//! - **Crash Recovery**: an interrupted cycle is detected and repaired on the next run
//! - **Local or Remote**: destination pools on this machine or over ssh
//! - **Retention Management**: keep the last snapshot or everything younger than a duration
//! - **Parallel Processing**: bounded number of datasets replicated at once
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use z_backup::backup::config::BackupConfig;
//! use z_backup::backup::naming::Naming;
//! use z_backup::backup::planner::Planner;
//! use z_backup::backup::scheduler::Scheduler;
//!
//! let config = BackupConfig::load("/etc/zbackup/zbackup.yml")?;
//! let naming = Arc::new(Naming::for_local_host()?);
//!
//! let tasks = Planner::with_zfs_runner(naming.clone()).plan(&config.specs());
//! let report = Scheduler::new(naming, config.max_parallel()).run(tasks)?;
//! std::process::exit(report.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
