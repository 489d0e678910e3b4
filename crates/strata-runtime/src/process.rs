//! Process spawning inside isolated namespaces.
//!
//! The container's init process is created with `clone(2)`, carrying the
//! granted namespace flags, and then runs a fixed sequence of setup steps
//! before `execve(2)`:
//!
//! 1. wait for the runtime (identity maps written, resource group attached)
//! 2. redirect stdio
//! 3. set the hostname
//! 4. bring up loopback
//! 5. mount `/proc` inside the merged view (mount and PID namespaces only)
//! 6. rebase the root onto the merged view
//! 7. switch to the mapped identity (user namespace only)
//! 8. exec the entrypoint
//!
//! Between clone and exec the child is a copy of a multi-threaded process,
//! so it must not lock, allocate or log. Everything it needs is prepared
//! beforehand in an [`ExecPlan`] and a [`ChildContext`], and failures are
//! reported to the runtime as a step code plus `errno`.

use std::convert::Infallible;
use std::ffi::{CString, c_char};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{Gid, Pid, Uid};
use parking_lot::Mutex;
use strata_common::constants::DEFAULT_PATH;
use strata_common::error::{Result, StrataError};
use strata_common::spec::ContainerSpec;
use strata_common::types::{IsolationFacets, SetupStep, Stdio};
use strata_core::filesystem::{mount as fs_mount, pivot_root};
use strata_core::namespace::{self, mount as ns_mount, network, uts};

use crate::sync::{self, ChildEnd, ParentEnd};

/// Stack size for the cloned init process before it execs.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Exit status of an init process whose setup failed.
const SETUP_FAILED_EXIT: isize = 127;

/// Serializes spawns so no other container's init inherits this spawn's
/// pipe ends, which would delay the end-of-file that signals a successful exec.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Everything `execve` needs, converted up front.
struct ExecPlan {
    candidates: Vec<CString>,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl ExecPlan {
    fn new(command: &[String], env: &[(String, String)]) -> Result<Self> {
        let Some(program) = command.first() else {
            return Err(StrataError::Validation {
                message: "entrypoint command is empty".into(),
            });
        };

        let mut vars: Vec<(String, String)> = env.to_vec();
        if !vars.iter().any(|(k, _)| k == "PATH") {
            vars.push(("PATH".into(), DEFAULT_PATH.into()));
        }
        let search_path = vars
            .iter()
            .find(|(k, _)| k == "PATH")
            .map_or(DEFAULT_PATH, |(_, v)| v.as_str());

        let candidates: Vec<String> = if program.contains('/') {
            vec![program.clone()]
        } else {
            search_path
                .split(':')
                .filter(|dir| !dir.is_empty())
                .map(|dir| format!("{}/{program}", dir.trim_end_matches('/')))
                .collect()
        };

        let candidates = candidates.into_iter().map(cstring).collect::<Result<Vec<_>>>()?;
        let argv = command.iter().cloned().map(cstring).collect::<Result<Vec<_>>>()?;
        let envp = vars
            .iter()
            .map(|(k, v)| cstring(format!("{k}={v}")))
            .collect::<Result<Vec<_>>>()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            candidates,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    /// Replaces the process image; returns only on failure.
    ///
    /// `EACCES` from any candidate wins over `ENOENT` from the others, so a
    /// present but non-executable entrypoint is not reported as missing.
    fn exec(&self) -> Errno {
        let mut result = Errno::ENOENT;
        for candidate in &self.candidates {
            // SAFETY: every pointer refers to a NUL-terminated string owned by
            // `self`, and both arrays end with a null pointer.
            unsafe {
                let _ = libc::execve(
                    candidate.as_ptr(),
                    self.argv_ptrs.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
            }
            let errno = Errno::last();
            match errno {
                Errno::ENOENT | Errno::ENOTDIR => {}
                Errno::EACCES => result = Errno::EACCES,
                other => return other,
            }
        }
        result
    }
}

fn cstring(s: String) -> Result<CString> {
    CString::new(s).map_err(|e| StrataError::Validation {
        message: format!("string contains a NUL byte: {e}"),
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Standard streams for [`Stdio::Log`], opened before clone.
struct LogStdio {
    devnull: File,
    log: File,
}

/// What the init process needs between clone and exec.
struct ChildContext<'a> {
    plan: &'a ExecPlan,
    sync: &'a ChildEnd,
    parent_fds: [RawFd; 2],
    granted: IsolationFacets,
    identity: Option<(Uid, Gid)>,
    hostname: Option<&'a str>,
    root: &'a Path,
    proc_dir: Option<&'a Path>,
    stdio: Option<&'a LogStdio>,
}

/// Entry point of the cloned init process.
fn child_main(ctx: &ChildContext<'_>) -> isize {
    for fd in ctx.parent_fds {
        // SAFETY: these are this process's copies of the runtime's pipe ends.
        let _ = unsafe { libc::close(fd) };
    }
    match run_setup(ctx) {
        Ok(never) => match never {},
        Err((step, errno)) => {
            ctx.sync.report(step, errno);
            SETUP_FAILED_EXIT
        }
    }
}

/// Tags an `errno` with the step that produced it.
fn at(step: SetupStep) -> impl Fn(Errno) -> (SetupStep, Errno) {
    move |errno| (step, errno)
}

fn run_setup(ctx: &ChildContext<'_>) -> std::result::Result<Infallible, (SetupStep, Errno)> {
    ctx.sync.wait_for_go().map_err(at(SetupStep::AwaitRuntime))?;

    if let Some(stdio) = ctx.stdio {
        let targets = [
            (stdio.devnull.as_raw_fd(), libc::STDIN_FILENO),
            (stdio.log.as_raw_fd(), libc::STDOUT_FILENO),
            (stdio.log.as_raw_fd(), libc::STDERR_FILENO),
        ];
        for (src, dst) in targets {
            // SAFETY: both descriptors are open in this process.
            if unsafe { libc::dup2(src, dst) } < 0 {
                return Err((SetupStep::Stdio, Errno::last()));
            }
        }
    }

    if ctx.granted.hostname {
        if let Some(name) = ctx.hostname {
            uts::set_hostname(name).map_err(at(SetupStep::Hostname))?;
        }
    }

    if ctx.granted.network {
        network::bring_up_loopback().map_err(at(SetupStep::Loopback))?;
    }

    if ctx.granted.mount {
        ns_mount::make_mounts_private().map_err(at(SetupStep::RootRebase))?;
    }
    if let Some(proc_dir) = ctx.proc_dir {
        fs_mount::mount_proc(proc_dir).map_err(at(SetupStep::ProcMount))?;
    }
    pivot_root::rebase_root(ctx.root, ctx.granted.mount).map_err(at(SetupStep::RootRebase))?;

    // Last, since a non-zero container uid loses the capabilities the mounts need.
    if let Some((uid, gid)) = ctx.identity {
        nix::unistd::setresgid(gid, gid, gid).map_err(at(SetupStep::Identity))?;
        nix::unistd::setresuid(uid, uid, uid).map_err(at(SetupStep::Identity))?;
    }

    Err((SetupStep::Exec, ctx.plan.exec()))
}

/// A cloned init process waiting for the runtime's go signal.
///
/// Dropping it without calling [`PendingProcess::release`] kills and reaps
/// the child.
#[derive(Debug)]
pub(crate) struct PendingProcess {
    pid: Pid,
    sync: ParentEnd,
    program: String,
    done: bool,
}

impl PendingProcess {
    /// Host PID of the init process.
    pub(crate) fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Lets the child run its setup and waits until it has exec'd.
    ///
    /// On failure the child has already exited and is reaped here.
    pub(crate) fn release(mut self) -> Result<Pid> {
        self.sync.release()?;
        let outcome = self.sync.await_exec()?;
        let Some(failure) = outcome else {
            self.done = true;
            return Ok(self.pid);
        };

        // The child exits right after reporting.
        let _ = waitpid(self.pid, None);
        self.done = true;
        if failure.step == SetupStep::Exec && failure.errno == libc::ENOENT {
            return Err(StrataError::EntrypointNotFound {
                command: self.program.clone(),
            });
        }
        Err(StrataError::Spawn {
            step: failure.step,
            errno: failure.errno,
        })
    }
}

impl Drop for PendingProcess {
    fn drop(&mut self) {
        if !self.done {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            tracing::debug!(pid = self.pid.as_raw(), "abandoned container init reaped");
        }
    }
}

/// Inputs for [`spawn`].
pub(crate) struct SpawnRequest<'a> {
    pub spec: &'a ContainerSpec,
    pub granted: IsolationFacets,
    pub root: &'a Path,
    pub log_path: &'a Path,
}

/// Clones the container's init process into the granted namespaces.
///
/// The child blocks before any setup step until [`PendingProcess::release`].
pub(crate) fn spawn(request: &SpawnRequest<'_>) -> Result<PendingProcess> {
    let spec = request.spec;
    let plan = ExecPlan::new(&spec.command, &spec.env)?;
    let stdio = match spec.stdio {
        Stdio::Inherit => None,
        Stdio::Log => Some(LogStdio {
            devnull: File::open("/dev/null").map_err(|e| StrataError::io("/dev/null", e))?,
            log: OpenOptions::new()
                .create(true)
                .append(true)
                .open(request.log_path)
                .map_err(|e| StrataError::io(request.log_path, e))?,
        }),
    };
    let identity = spec
        .user_mapping
        .filter(|_| request.granted.user)
        .map(|m| (Uid::from_raw(m.uid.container_id), Gid::from_raw(m.gid.container_id)));
    let flags = namespace::clone_flags(&request.granted);
    let proc_dir = request.root.join("proc");
    let mut stack = vec![0_u8; CHILD_STACK_SIZE];

    let guard = SPAWN_LOCK.lock();
    let (parent, child) = sync::channel()?;
    let ctx = ChildContext {
        plan: &plan,
        sync: &child,
        parent_fds: parent.raw_fds(),
        granted: request.granted,
        identity,
        hostname: spec.hostname.as_deref(),
        root: request.root,
        proc_dir: (request.granted.mount && request.granted.pid).then_some(proc_dir.as_path()),
        stdio: stdio.as_ref(),
    };

    // SAFETY: the child gets a copy-on-write copy of this address space and
    // only runs `child_main`, which avoids locks and allocation until exec.
    let cloned = unsafe {
        nix::sched::clone(
            Box::new(|| child_main(&ctx)),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    };
    drop(child);
    drop(guard);

    let pid = cloned.map_err(|e| match e {
        Errno::EPERM | Errno::EACCES => StrataError::Privilege {
            message: format!("cannot create namespaces [{}]: {e}", request.granted),
        },
        other => StrataError::Spawn {
            step: SetupStep::Namespaces,
            errno: other as i32,
        },
    })?;
    tracing::debug!(pid = pid.as_raw(), granted = %request.granted, "container init cloned");

    Ok(PendingProcess {
        pid,
        sync: parent,
        program: spec.command.first().cloned().unwrap_or_default(),
        done: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::types::{FacetPolicy, IdMapping, Layer, ResourceLimits, UserMapping};
    use strata_core::namespace::user;

    fn plan(command: &[&str], env: &[(&str, &str)]) -> ExecPlan {
        let command: Vec<String> = command.iter().map(ToString::to_string).collect();
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ExecPlan::new(&command, &env).unwrap()
    }

    fn strings(v: &[CString]) -> Vec<&str> {
        v.iter().map(|s| s.to_str().unwrap()).collect()
    }

    #[test]
    fn absolute_program_is_the_only_candidate() {
        let p = plan(&["/bin/sh", "-c", "true"], &[]);
        assert_eq!(strings(&p.candidates), vec!["/bin/sh"]);
        assert_eq!(strings(&p._argv), vec!["/bin/sh", "-c", "true"]);
    }

    #[test]
    fn bare_program_is_searched_on_path() {
        let p = plan(&["app"], &[("PATH", "/opt/bin:/usr/bin/")]);
        assert_eq!(strings(&p.candidates), vec!["/opt/bin/app", "/usr/bin/app"]);
    }

    #[test]
    fn default_path_is_added_when_missing() {
        let p = plan(&["sh"], &[("HOME", "/root")]);
        let env = strings(&p._envp);
        assert!(env.contains(&"HOME=/root"));
        assert!(env.iter().any(|e| e.starts_with("PATH=/usr/local/sbin")));
        assert!(strings(&p.candidates).contains(&"/bin/sh"));
    }

    #[test]
    fn pointer_arrays_are_null_terminated() {
        let p = plan(&["/bin/echo", "hi"], &[]);
        assert_eq!(p.argv_ptrs.len(), 3);
        assert!(p.argv_ptrs[2].is_null());
        assert!(p.envp_ptrs.last().unwrap().is_null());
    }

    #[test]
    fn exec_of_missing_program_reports_enoent() {
        let p = plan(&["/definitely/not/here"], &[]);
        assert_eq!(p.exec(), Errno::ENOENT);
    }

    #[test]
    fn non_executable_program_reports_eacces() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let p = plan(&[script.to_str().unwrap()], &[]);
        assert_eq!(p.exec(), Errno::EACCES);
    }

    /// Runs every setup step in a scratch root up to exec of a missing
    /// entrypoint. Reaching `EntrypointNotFound` means every earlier step
    /// succeeded.
    fn run_setup_steps(granted: IsolationFacets) -> Result<Pid> {
        let dir = tempfile::tempdir().unwrap();
        let identity = IdMapping {
            container_id: 0,
            host_id: 0,
            size: 1,
        };
        let spec = ContainerSpec {
            layers: vec![Layer::new("base", dir.path())],
            command: vec!["/no/such/entrypoint".into()],
            env: Vec::new(),
            hostname: None,
            limits: ResourceLimits::default(),
            isolation: granted,
            facet_policy: FacetPolicy::Strict,
            user_mapping: granted.user.then_some(UserMapping {
                uid: identity,
                gid: identity,
            }),
            stdio: Stdio::Inherit,
        };
        let log_path = dir.path().join("container.log");
        let pending = spawn(&SpawnRequest {
            spec: &spec,
            granted,
            root: dir.path(),
            log_path: &log_path,
        })?;
        if let Some(mapping) = &spec.user_mapping {
            user::write_id_maps(pending.pid(), mapping)?;
        }
        pending.release()
    }

    #[test]
    #[ignore = "requires root"]
    fn proc_is_mounted_with_and_without_user_namespace() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let pid_and_mount = IsolationFacets {
            pid: true,
            mount: true,
            ..IsolationFacets::none()
        };
        let with_user = IsolationFacets {
            user: true,
            ..pid_and_mount
        };
        for granted in [pid_and_mount, with_user] {
            let err = run_setup_steps(granted).unwrap_err();
            assert!(
                matches!(err, StrataError::EntrypointNotFound { .. }),
                "[{granted}]: {err}"
            );
        }
    }
}
