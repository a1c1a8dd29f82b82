//! Instance naming and ring rotation.
//!
//! Every instance lives in a directory whose name contains the project name,
//! followed by either a fleet index (`Bot1`, `Bot2`, ...) or the monitoring
//! suffix (`Bot_monitor`). Instance `k` checks instance `k + 1`, wrapping at
//! the fleet size; a monitor instance always checks the primary `<project>1`.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static NUMERIC_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+$").unwrap());

/// How the next instance to check is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Numbered fleet of `instance_count` siblings checking each other in a ring.
    Fleet { instance_count: u32 },
    /// A monitoring instance that watches the single primary.
    Monitor { suffix: String },
}

impl Rotation {
    pub fn role(&self) -> Role {
        match self {
            Rotation::Fleet { .. } => Role::Primary,
            Rotation::Monitor { .. } => Role::Monitor,
        }
    }
}

/// Role of an instance within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Monitor,
}

/// Identity of the instance this watchdog runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub name: String,
    pub role: Role,
    /// The directory named `name`, i.e. the instance's deployment root.
    pub dir: PathBuf,
}

/// Find our own instance by scanning `app_dir` from the innermost directory
/// outward for the first segment containing `project_name`.
pub fn own_instance(app_dir: &Path, project_name: &str, role: Role) -> Option<InstanceIdentity> {
    if project_name.is_empty() {
        return None;
    }
    let dir = app_dir.ancestors().find(|dir| {
        dir.file_name()
            .map(|n| n.to_string_lossy().contains(project_name))
            .unwrap_or(false)
    })?;
    Some(InstanceIdentity {
        name: dir.file_name()?.to_string_lossy().into_owned(),
        role,
        dir: dir.to_path_buf(),
    })
}

/// Name of our own instance, or an empty string if `app_dir` has no segment
/// containing `project_name`.
pub fn own_instance_name(app_dir: &Path, project_name: &str) -> String {
    own_instance(app_dir, project_name, Role::Primary)
        .map(|identity| identity.name)
        .unwrap_or_default()
}

/// Name of the instance `own_name` is responsible for checking.
///
/// Returns an empty string when there is nothing to monitor: an empty own
/// name, or a fleet member without a numeric suffix.
pub fn next_instance_name(own_name: &str, rotation: &Rotation) -> String {
    if own_name.is_empty() {
        return String::new();
    }
    match rotation {
        Rotation::Monitor { suffix } => match own_name.strip_suffix(suffix.as_str()) {
            Some(base) if !suffix.is_empty() => format!("{base}1"),
            _ => own_name.to_string(),
        },
        Rotation::Fleet { instance_count } => {
            let Some(m) = NUMERIC_SUFFIX.find(own_name) else {
                return String::new();
            };
            // An index too large to parse is past the end of any fleet.
            let current: u64 = m.as_str().parse().unwrap_or(u64::MAX);
            let mut next = current.saturating_add(1);
            if next > u64::from(*instance_count) {
                next = 1;
            }
            format!("{}{next}", &own_name[..m.start()])
        }
    }
}

/// Deployment directory of a sibling instance: next to our own instance directory.
pub fn instance_dir(own: &InstanceIdentity, name: &str) -> PathBuf {
    match own.dir.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
