//! Switching the monitor to the daemon's administrative account.
use nix::unistd::{Gid, Group, Uid, User, getgid, getuid, setgid, setuid};
use std::io;
use tracing::debug;

/// Target credentials resolved from configured user and group names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPlan {
    /// Target user ID, if a user was requested.
    pub uid: Option<Uid>,
    /// Target group ID, from the group or the user's primary group.
    pub gid: Option<Gid>,
}

impl AccountPlan {
    /// Resolves `user` and `group` through the system account databases.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> io::Result<Self> {
        let mut plan = AccountPlan {
            uid: None,
            gid: None,
        };

        if let Some(user_name) = user {
            let user = User::from_name(user_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("user '{user_name}' not found")))?;
            plan.uid = Some(user.uid);
            plan.gid = Some(user.gid);
        }

        if let Some(group_name) = group {
            let group = Group::from_name(group_name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("group '{group_name}' not found")))?;
            plan.gid = Some(group.gid);
        }

        Ok(plan)
    }

    /// Returns `true` if the plan would change the current credentials.
    pub fn changes_credentials(&self) -> bool {
        self.uid.is_some_and(|uid| uid != getuid()) || self.gid.is_some_and(|gid| gid != getgid())
    }

    /// Applies the plan to the current process. Group first, then user.
    ///
    /// Fails with `PermissionDenied` when a change is needed but the process
    /// is not running as root.
    pub fn apply(&self) -> io::Result<()> {
        if !self.changes_credentials() {
            return Ok(());
        }

        if !getuid().is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "switching user/group requires root privileges",
            ));
        }

        if let Some(gid) = self.gid {
            #[cfg(target_os = "linux")]
            nix::unistd::setgroups(&[gid]).map_err(io::Error::from)?;
            setgid(gid).map_err(io::Error::from)?;
            debug!("Switched group to {gid}");
        }

        if let Some(uid) = self.uid {
            setuid(uid).map_err(io::Error::from)?;
            debug!("Switched user to {uid}");
        }

        Ok(())
    }
}
