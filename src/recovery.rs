//! Post-mortem log retention for killed instances.

use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Where an instance's log file lives, derived from our own log path by
/// replacing every `<project><index>` token with the instance name.
pub fn instance_logfile(own_logfile: &Path, project_name: &str, instance_name: &str) -> PathBuf {
    let own = own_logfile.to_string_lossy();
    if project_name.is_empty() {
        return PathBuf::from(own.as_ref());
    }
    let pattern = format!("{}[0-9]+", regex::escape(project_name));
    match Regex::new(&pattern) {
        Ok(re) => PathBuf::from(re.replace_all(&own, regex::NoExpand(instance_name)).as_ref()),
        Err(e) => {
            error!(error = %e, "invalid project name pattern");
            PathBuf::from(own.as_ref())
        }
    }
}

/// Destination of the retained copy: `<own log without .log>-<instance>.log`,
/// next to our own log so we don't need write access to the other instance.
pub fn retained_copy_path(own_logfile: &Path, instance_name: &str) -> PathBuf {
    let own = own_logfile.to_string_lossy();
    let stem = own.strip_suffix(".log").unwrap_or(&own);
    PathBuf::from(format!("{stem}-{instance_name}.log"))
}

/// Copy the log of a killed instance for later inspection.
///
/// Runs after the kill; failures are logged and otherwise ignored.
pub fn copy_logfile(own_logfile: &Path, project_name: &str, instance_name: &str) -> Option<PathBuf> {
    let source = instance_logfile(own_logfile, project_name, instance_name);
    let dest = retained_copy_path(own_logfile, instance_name);
    match std::fs::copy(&source, &dest) {
        Ok(bytes) => {
            info!(
                source = %source.display(),
                dest = %dest.display(),
                bytes,
                "copied logfile of killed instance"
            );
            Some(dest)
        }
        Err(e) => {
            error!(
                error = %e,
                source = %source.display(),
                dest = %dest.display(),
                "failed to copy logfile of killed instance"
            );
            None
        }
    }
}
