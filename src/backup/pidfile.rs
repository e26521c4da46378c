use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Keeps two runs from overlapping. The file holds our pid and is removed
/// when the value is dropped.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut file = match File::create_new(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::PidfileExists(path));
            }
            Err(e) => {
                return Err(Error::from(e).with_msg(format!("Cannot create pidfile {:?}", path)));
            }
        };

        let pidfile = Self { path };
        write!(file, "{}", std::process::id())
            .map_err(Error::from)
            .with_msg(format!("Cannot write pidfile {:?}", pidfile.path))?;
        debug!("Created pidfile {:?}", pidfile.path);
        Ok(pidfile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("Cannot remove pidfile {:?}: {}", self.path, e);
        }
    }
}
