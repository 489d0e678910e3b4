//! Linux namespace management for container isolation.
//!
//! Decides which isolation facets the host can grant, maps them onto
//! `clone(2)` flags, and provides the per-namespace setup the container's
//! init process performs before exec.

pub mod mount;
pub mod network;
pub mod user;
pub mod uts;

use std::path::Path;

use nix::sched::CloneFlags;
use strata_common::error::{Result, StrataError};
use strata_common::types::{Facet, FacetPolicy, IsolationFacets};

/// Returns the `clone(2)` flags creating every facet in `facets`.
#[must_use]
pub fn clone_flags(facets: &IsolationFacets) -> CloneFlags {
    facets
        .iter()
        .map(|facet| match facet {
            Facet::Pid => CloneFlags::CLONE_NEWPID,
            Facet::Network => CloneFlags::CLONE_NEWNET,
            Facet::Mount => CloneFlags::CLONE_NEWNS,
            Facet::Hostname => CloneFlags::CLONE_NEWUTS,
            Facet::Ipc => CloneFlags::CLONE_NEWIPC,
            Facet::User => CloneFlags::CLONE_NEWUSER,
        })
        .fold(CloneFlags::empty(), |acc, flag| acc | flag)
}

/// What the host can offer in terms of namespace isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSupport {
    /// Namespace types compiled into the running kernel.
    pub kernel: IsolationFacets,
    /// Whether the runtime runs with an effective UID of 0.
    pub privileged: bool,
    /// Whether the runtime may create user namespaces.
    pub user_namespaces: bool,
}

impl HostSupport {
    /// Facets of `requested` this host can grant.
    ///
    /// Without root, namespaces other than the user namespace can only be
    /// created from inside a new user namespace, so an unprivileged runtime
    /// that cannot grant the user facet grants nothing.
    #[must_use]
    pub fn grantable(&self, requested: &IsolationFacets) -> IsolationFacets {
        let mut granted = requested.intersection(&self.kernel);
        if !self.user_namespaces {
            granted.set(Facet::User, false);
        }
        if !self.privileged && !granted.user {
            return IsolationFacets::none();
        }
        granted
    }
}

/// Inspects the running host's namespace support.
///
/// Reads `/proc/self/ns`, the effective UID and the user-namespace sysctls.
#[must_use]
pub fn probe_available() -> HostSupport {
    let ns_dir = Path::new("/proc/self/ns");
    let mut kernel = IsolationFacets::none();
    for facet in Facet::ALL {
        kernel.set(facet, ns_dir.join(facet.proc_ns_name()).exists());
    }

    let privileged = nix::unistd::geteuid().is_root();
    let max_user_ns = read_sysctl("/proc/sys/user/max_user_namespaces").unwrap_or(1);
    // Debian and Ubuntu kernels gate unprivileged user namespaces behind this knob.
    let unprivileged_clone = read_sysctl("/proc/sys/kernel/unprivileged_userns_clone").unwrap_or(1);
    let user_namespaces =
        kernel.user && max_user_ns > 0 && (privileged || unprivileged_clone != 0);

    let support = HostSupport {
        kernel,
        privileged,
        user_namespaces,
    };
    tracing::debug!(?support, "probed host namespace support");
    support
}

/// Decides the granted facet set for a container.
///
/// # Errors
///
/// Under [`FacetPolicy::Strict`], returns [`StrataError::Privilege`] naming
/// every requested facet the host cannot grant.
pub fn negotiate(
    requested: &IsolationFacets,
    available: &HostSupport,
    policy: FacetPolicy,
) -> Result<IsolationFacets> {
    let granted = available.grantable(requested);
    let missing = requested.missing_from(&granted);
    if missing.is_empty() {
        return Ok(granted);
    }
    let names: Vec<_> = missing.iter().map(|f| f.proc_ns_name()).collect();
    match policy {
        FacetPolicy::Strict => Err(StrataError::Privilege {
            message: format!(
                "cannot grant isolation facets [{}] (privileged: {}, user namespaces: {})",
                names.join(", "),
                available.privileged,
                available.user_namespaces
            ),
        }),
        FacetPolicy::BestEffort => {
            tracing::warn!(missing = %names.join(","), %granted, "continuing with reduced isolation");
            Ok(granted)
        }
    }
}

fn read_sysctl(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(privileged: bool, user_namespaces: bool) -> HostSupport {
        HostSupport {
            kernel: IsolationFacets::all(),
            privileged,
            user_namespaces,
        }
    }

    fn requested(facets: &[Facet]) -> IsolationFacets {
        let mut set = IsolationFacets::none();
        for f in facets {
            set.set(*f, true);
        }
        set
    }

    #[test]
    fn clone_flags_cover_each_facet() {
        let flags = clone_flags(&requested(&[Facet::Pid, Facet::Mount, Facet::Hostname]));
        assert_eq!(
            flags,
            CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS
        );
        assert_eq!(clone_flags(&IsolationFacets::none()), CloneFlags::empty());
    }

    #[test]
    fn root_gets_everything_the_kernel_has() {
        let req = IsolationFacets::all();
        assert_eq!(host(true, true).grantable(&req), req);
    }

    #[test]
    fn unprivileged_without_user_facet_gets_nothing() {
        let req = requested(&[Facet::Pid, Facet::Mount]);
        assert!(host(false, true).grantable(&req).is_empty());
    }

    #[test]
    fn unprivileged_with_user_facet_gets_all() {
        let req = IsolationFacets::all();
        assert_eq!(host(false, true).grantable(&req), req);
    }

    #[test]
    fn disabled_user_namespaces_drop_user_facet() {
        let req = requested(&[Facet::User, Facet::Pid]);
        let granted = host(true, false).grantable(&req);
        assert!(!granted.user);
        assert!(granted.pid);
    }

    #[test]
    fn strict_policy_names_missing_facets() {
        let req = requested(&[Facet::User, Facet::Network]);
        let err = negotiate(&req, &host(true, false), FacetPolicy::Strict).unwrap_err();
        assert!(matches!(err, StrataError::Privilege { .. }));
        assert!(err.to_string().contains("[user]"), "{err}");
    }

    #[test]
    fn best_effort_reports_reduced_set() {
        let req = requested(&[Facet::User, Facet::Network]);
        let granted = negotiate(&req, &host(true, false), FacetPolicy::BestEffort).unwrap();
        assert_eq!(granted, requested(&[Facet::Network]));
    }

    #[test]
    fn kernel_without_ipc_namespaces() {
        let mut support = host(true, true);
        support.kernel.set(Facet::Ipc, false);
        let err = negotiate(&requested(&[Facet::Ipc]), &support, FacetPolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("[ipc]"));
    }

    #[test]
    fn probe_sees_current_process_namespaces() {
        let support = probe_available();
        assert!(support.kernel.mount);
    }
}
