use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::Read;
use std::process::{Child, ExitStatus, Output};
use std::thread::JoinHandle;

/// Completes one end of a snapshot transfer.
///
/// Both ends of a pipe are backed by a process that has to be reaped before
/// we know whether the bytes that went through it were actually accepted.
pub trait Finish {
    fn finish(self: Box<Self>) -> Result<()>;
}

fn check_status<S: Into<String>>(command: S, status: ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: command.into(),
            code: status.code(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        })
    }
}

/// Maps a non-zero exit status into [`Error::CommandFailed`].
pub fn check_output<S: Into<String>>(command: S, output: Output) -> Result<Output> {
    check_status(command, output.status, &output.stderr)?;
    Ok(output)
}

/// Collects a child's stderr on its own thread while its stdin or stdout is
/// being streamed, so a chatty process never stalls on a full pipe.
pub struct StderrDrain {
    reader: Option<JoinHandle<Vec<u8>>>,
}

impl StderrDrain {
    pub fn spawn(child: &mut Child) -> Self {
        let reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf) {
                    tracing::debug!("Reading child stderr failed: {e}");
                }
                buf
            })
        });
        Self { reader }
    }

    fn collect(self) -> Vec<u8> {
        self.reader
            .map(|reader| reader.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Waits for a streaming child whose stdin/stdout were already dropped.
pub fn wait_child<S: Into<String>>(command: S, mut child: Child, stderr: StderrDrain) -> Result<()> {
    let status = child.wait()?;
    check_status(command, status, &stderr.collect())
}
