pub mod config;
pub mod finish;
pub mod naming;
pub mod pidfile;
pub mod planner;
pub mod protocol;
pub mod result_error;
pub mod retention;
pub mod scheduler;
pub mod task;
pub mod validate;
pub mod zfs;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
