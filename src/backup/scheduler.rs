use crate::backup::naming::Naming;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::task::{BackupTask, TaskReport};
use chrono::Local;
use getset::Getters;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct TaskOutcome {
    id: usize,
    source: Arc<str>,
    destination: Arc<str>,
    result: Result<TaskReport>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of every task of a run, in task order.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct RunReport {
    outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// 0 when every task succeeded, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else {
            1
        }
    }
}

/// Runs tasks on a bounded pool. One task failing never stops the others.
#[derive(Debug)]
pub struct Scheduler {
    naming: Arc<Naming>,
    max_parallel: NonZeroUsize,
}

impl Scheduler {
    pub fn new(naming: Arc<Naming>, max_parallel: NonZeroUsize) -> Self {
        Self {
            naming,
            max_parallel,
        }
    }

    pub fn run(&self, tasks: Vec<BackupTask>) -> Result<RunReport> {
        info!(
            "running {} backup task(s), at most {} at a time",
            tasks.len(),
            self.max_parallel
        );
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.max_parallel.get())
            .thread_name(|i| format!("zbackup-{i}"))
            .build()?;
        let outcomes = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| self.run_task(task))
                .collect::<Vec<_>>()
        });

        let report = RunReport { outcomes };
        info!(
            "backup finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    fn run_task(&self, task: BackupTask) -> TaskOutcome {
        info!("[{}] backup {} -> {}", task.id(), task.source(), task.destination());
        let result = task.execute(&self.naming, Local::now());
        if let Err(e) = &result {
            error!("{}", task_error(task.id(), e));
        }
        TaskOutcome {
            id: task.id(),
            source: task.source().clone(),
            destination: task.destination().clone(),
            result,
        }
    }

    /// Prints what a run would do without touching any pool.
    pub fn dry_run<W: Write>(tasks: &[BackupTask], mut out: W) -> Result<()> {
        for task in tasks {
            writeln!(out, "[{}] {} -> {}", task.id(), task.source(), task.destination())?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Task errors name their task already, anything else gets the id prepended.
fn task_error(id: usize, error: &Error) -> String {
    let message = error.to_string();
    if message.starts_with(&format!("[{id}]")) {
        message
    } else {
        format!("[{id}] {message}")
    }
}
