//! Credentials of the running process.

use crate::ticket::Credentials;

/// Uid of the cluster administrator.
pub const CLUSTER_ADMIN_UID: u32 = 0;

/// Ids captured once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCredentials {
    /// Real uid.
    pub uid: u32,
    /// Effective uid.
    pub euid: u32,
    /// Real gid.
    pub gid: u32,
    /// Effective gid.
    pub egid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
    /// Login name, or the uid when unknown.
    pub user_name: String,
}

impl ProcessCredentials {
    /// Reads the ids of the current process.
    pub fn current() -> Self {
        // SAFETY: these calls take no arguments, cannot fail and touch no memory
        // we own.
        let (uid, euid, gid, egid) =
            unsafe { (libc::getuid(), libc::geteuid(), libc::getgid(), libc::getegid()) };
        let user_name = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
        Self {
            uid,
            euid,
            gid,
            egid,
            groups: supplementary_groups(),
            user_name,
        }
    }

    /// Full process credentials: uid, effective gid first, then the other groups.
    pub fn user_credentials(&self) -> Credentials {
        let mut gids = Vec::with_capacity(self.groups.len() + 1);
        gids.push(self.egid);
        gids.extend(self.groups.iter().copied().filter(|&g| g != self.egid));
        Credentials {
            uid: self.uid,
            gids,
            user_name: self.user_name.clone(),
        }
    }
}

/// Credentials of the cluster administrator with `admin_gid`.
pub fn root_credentials(admin_gid: u32) -> Credentials {
    Credentials {
        uid: CLUSTER_ADMIN_UID,
        gids: vec![admin_gid],
        user_name: "root".to_string(),
    }
}

fn supplementary_groups() -> Vec<u32> {
    // SAFETY: a zero-sized query only returns the group count.
    let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if n <= 0 {
        return Vec::new();
    }
    let mut groups = vec![0 as libc::gid_t; n as usize];
    // SAFETY: `groups` has room for `n` entries and the kernel writes at most that.
    let got = unsafe { libc::getgroups(n, groups.as_mut_ptr()) };
    groups.truncate(got.max(0) as usize);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_credentials_put_egid_first_once() {
        let pc = ProcessCredentials {
            uid: 1000,
            euid: 1000,
            gid: 1000,
            egid: 50,
            groups: vec![10, 50, 20],
            user_name: "alice".into(),
        };
        let c = pc.user_credentials();
        assert_eq!(c.uid, 1000);
        assert_eq!(c.gids, vec![50, 10, 20]);
        assert_eq!(c.user_name, "alice");
    }

    #[test]
    fn test_current_matches_libc() {
        let pc = ProcessCredentials::current();
        assert_eq!(pc.uid, unsafe { libc::getuid() });
        assert_eq!(pc.user_credentials().gids[0], pc.egid);
    }

    #[test]
    fn test_root_credentials() {
        let c = root_credentials(42);
        assert_eq!(c.uid, CLUSTER_ADMIN_UID);
        assert_eq!(c.gids, vec![42]);
    }
}
