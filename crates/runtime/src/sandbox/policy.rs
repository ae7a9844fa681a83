//! Syscall allow-list policies and their seccomp-bpf compilation
//!
//! A [`SyscallPolicy`] is a pure description: an ordered list of syscall names
//! and a kill-process default. [`Confinement`] turns it into something that can
//! be attached to a command: a compiled filter (when the host supports it) plus
//! the resource limits, both installed from a `pre_exec` hook so they are in
//! force before the interpreter's first instruction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio::process::Command;

use super::syscalls::{self, Lookup};
use super::Capabilities;
use crate::config::ResourceLimits;
use crate::types::{PolicyError, SandboxStrength};

/// Which built-in allow-list to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Bare interpreter startup and simple I/O only
    Minimal,
    /// Enough for CPython to start and run pure computation with local file I/O
    #[default]
    Interpreter,
    /// No syscall filter; resource limits still apply
    Disabled,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Minimal => write!(f, "minimal"),
            PolicyMode::Interpreter => write!(f, "interpreter"),
            PolicyMode::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(PolicyMode::Minimal),
            "interpreter" => Ok(PolicyMode::Interpreter),
            "disabled" | "off" | "none" => Ok(PolicyMode::Disabled),
            other => Err(format!(
                "unknown policy mode '{}' (expected minimal, interpreter or disabled)",
                other
            )),
        }
    }
}

/// Action taken for any syscall not on the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Terminate the whole process with `SIGSYS`
    KillProcess,
}

/// Process startup, simple I/O, and exec of the interpreter itself.
pub const MINIMAL_SYSCALLS: &[&str] = &[
    "read",
    "write",
    "open",
    "openat",
    "close",
    "stat",
    "fstat",
    "newfstatat",
    "statx",
    "lseek",
    "mmap",
    "munmap",
    "brk",
    "access",
    "faccessat",
    "faccessat2",
    "exit",
    "exit_group",
    "execve",
];

/// Added on top of [`MINIMAL_SYSCALLS`] for [`PolicyMode::Interpreter`].
///
/// Nothing here opens a socket, signals or attaches to another process,
/// mounts, or changes credentials.
pub const INTERPRETER_SYSCALLS: &[&str] = &[
    // signals
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigpending",
    "rt_sigsuspend",
    "sigaltstack",
    "restart_syscall",
    // memory
    "mprotect",
    "mremap",
    "madvise",
    "membarrier",
    // file descriptors
    "ioctl",
    "fcntl",
    "flock",
    "dup",
    "dup2",
    "dup3",
    "pipe",
    "pipe2",
    "pread64",
    "pwrite64",
    "readv",
    "writev",
    "preadv",
    "pwritev",
    "sendfile",
    "copy_file_range",
    "fadvise64",
    "close_range",
    "openat2",
    "lstat",
    "statfs",
    "fstatfs",
    "getdents",
    "getdents64",
    "readlink",
    "readlinkat",
    // local filesystem changes inside the work directory
    "getcwd",
    "chdir",
    "fchdir",
    "umask",
    "fchmod",
    "utimensat",
    "truncate",
    "ftruncate",
    "fsync",
    "fdatasync",
    "mkdir",
    "mkdirat",
    "rmdir",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "renameat2",
    // process and identity queries
    "getpid",
    "getppid",
    "gettid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "getgroups",
    "getresuid",
    "getresgid",
    "getpgrp",
    "getpgid",
    "getsid",
    "getpriority",
    "getrlimit",
    "prlimit64",
    "getrusage",
    "times",
    "uname",
    "sysinfo",
    "prctl",
    "arch_prctl",
    // threads
    "clone",
    "clone3",
    "futex",
    "set_tid_address",
    "set_robust_list",
    "get_robust_list",
    "rseq",
    "sched_yield",
    "sched_getaffinity",
    "wait4",
    "waitid",
    // time and randomness
    "clock_gettime",
    "clock_getres",
    "clock_nanosleep",
    "nanosleep",
    "gettimeofday",
    "time",
    "getrandom",
    // readiness
    "poll",
    "ppoll",
    "select",
    "pselect6",
    "epoll_create",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "epoll_pwait2",
    "eventfd",
    "eventfd2",
];

/// Signal syscalls [`PolicyMode::Interpreter`] allows only when the target
/// (first argument) is the guest's own pid.
pub const SELF_SIGNAL_SYSCALLS: &[&str] = &["kill", "tgkill"];

/// Signal delivered to a process that violates its filter
#[cfg(unix)]
pub const VIOLATION_SIGNAL: i32 = libc::SIGSYS;

/// An immutable allow-list of syscall names with a default-deny action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallPolicy {
    mode: PolicyMode,
    allowed: Vec<String>,
    self_signal: Vec<String>,
    default_action: DefaultAction,
}

/// Build the built-in policy for `mode`.
pub fn build_policy(mode: PolicyMode) -> SyscallPolicy {
    let allowed: Vec<String> = match mode {
        PolicyMode::Minimal => MINIMAL_SYSCALLS.iter().map(|s| s.to_string()).collect(),
        PolicyMode::Interpreter => MINIMAL_SYSCALLS
            .iter()
            .chain(INTERPRETER_SYSCALLS)
            .map(|s| s.to_string())
            .collect(),
        PolicyMode::Disabled => Vec::new(),
    };
    let self_signal = match mode {
        PolicyMode::Interpreter => SELF_SIGNAL_SYSCALLS.iter().map(|s| s.to_string()).collect(),
        PolicyMode::Minimal | PolicyMode::Disabled => Vec::new(),
    };

    SyscallPolicy {
        mode,
        allowed,
        self_signal,
        default_action: DefaultAction::KillProcess,
    }
}

impl SyscallPolicy {
    /// Append configured syscall names, keeping order and dropping duplicates.
    ///
    /// Has no effect on a disabled policy beyond validating the names. The
    /// signal syscalls in [`SELF_SIGNAL_SYSCALLS`] are only ever added with
    /// their self-only target check.
    pub fn with_extra_syscalls(mut self, extra: &[String]) -> Result<Self, PolicyError> {
        for name in extra {
            if !syscalls::is_known(name) {
                return Err(PolicyError::UnknownSyscall(name.clone()));
            }
            if self.mode == PolicyMode::Disabled {
                continue;
            }
            let list = if SELF_SIGNAL_SYSCALLS.contains(&name.as_str()) {
                &mut self.self_signal
            } else {
                &mut self.allowed
            };
            if !list.contains(name) {
                list.push(name.clone());
            }
        }
        Ok(self)
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Syscalls allowed only when aimed at the guest itself
    pub fn self_signal(&self) -> &[String] {
        &self.self_signal
    }

    pub fn default_action(&self) -> DefaultAction {
        self.default_action
    }

    /// Whether this policy asks for a kernel filter at all.
    pub fn is_enforcing(&self) -> bool {
        self.mode != PolicyMode::Disabled
    }

    /// Compile the allow-list into a BPF program for the running architecture.
    pub fn compile(&self) -> Result<SeccompProgram, PolicyError> {
        let (arch, audit_arch) = native_audit_arch().ok_or_else(|| {
            PolicyError::Unsupported(format!(
                "no syscall table for architecture {}",
                std::env::consts::ARCH
            ))
        })?;

        let self_signal = resolve(&self.self_signal, arch)?;
        let numbers = resolve(&self.allowed, arch)?;

        if numbers.is_empty() {
            return Err(PolicyError::EmptyAllowList);
        }

        let (filter, pid_slots) = bpf::allow_list(audit_arch, &numbers, &self_signal);
        if filter.len() > bpf::MAX_INSNS {
            return Err(PolicyError::FilterTooLarge(filter.len()));
        }

        Ok(SeccompProgram {
            arch,
            allowed: numbers.len(),
            filter,
            pid_slots,
        })
    }
}

/// Syscall numbers for `names` on the running architecture, deduplicated.
fn resolve(names: &[String], arch: &str) -> Result<Vec<u32>, PolicyError> {
    let mut numbers = Vec::with_capacity(names.len());
    for name in names {
        match syscalls::lookup(name) {
            Lookup::Number(nr) => {
                if !numbers.contains(&nr) {
                    numbers.push(nr);
                }
            }
            Lookup::OtherArch => {
                tracing::trace!("Syscall '{}' does not exist on {}, skipping", name, arch);
            }
            Lookup::Unknown => return Err(PolicyError::UnknownSyscall(name.clone())),
        }
    }
    Ok(numbers)
}

fn native_audit_arch() -> Option<(&'static str, u32)> {
    let (arch, _) = syscalls::native_table()?;
    match arch {
        "x86_64" => Some((arch, bpf::AUDIT_ARCH_X86_64)),
        "aarch64" => Some((arch, bpf::AUDIT_ARCH_AARCH64)),
        _ => None,
    }
}

/// A compiled seccomp filter
#[derive(Debug, Clone)]
pub struct SeccompProgram {
    arch: &'static str,
    allowed: usize,
    filter: Vec<bpf::SockFilter>,
    /// Instructions whose constant is the guest pid, filled in after fork
    pid_slots: Vec<usize>,
}

impl SeccompProgram {
    pub fn arch(&self) -> &'static str {
        self.arch
    }

    /// Number of distinct syscall numbers the filter lets through
    pub fn allowed_count(&self) -> usize {
        self.allowed
    }

    /// Number of syscalls checked against the guest's own pid
    pub fn self_signal_count(&self) -> usize {
        self.pid_slots.len()
    }

    /// Number of BPF instructions
    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }
}

/// Everything attached to a guest process before it executes
///
/// Prepared once per engine and applied to every guest command.
#[derive(Debug, Clone)]
pub struct Confinement {
    program: Option<SeccompProgram>,
    limits: ResourceLimits,
}

impl Confinement {
    /// Compile `policy` if the host can enforce it.
    ///
    /// A policy that cannot be compiled is an error. A host without seccomp is
    /// not: the confinement is created without a filter and reports
    /// [`SandboxStrength::None`].
    pub fn prepare(
        policy: &SyscallPolicy,
        capabilities: &Capabilities,
        limits: &ResourceLimits,
    ) -> Result<Self, PolicyError> {
        let program = if policy.is_enforcing() && capabilities.seccomp {
            let program = policy.compile()?;
            tracing::debug!(
                "Compiled {} policy: {} syscalls, {} instructions ({})",
                policy.mode(),
                program.allowed_count(),
                program.len(),
                program.arch()
            );
            Some(program)
        } else {
            None
        };

        Ok(Self {
            program,
            limits: limits.clone(),
        })
    }

    /// Isolation level every guest under this confinement gets
    pub fn strength(&self) -> SandboxStrength {
        if self.program.is_some() {
            SandboxStrength::Full
        } else {
            SandboxStrength::None
        }
    }

    pub fn program(&self) -> Option<&SeccompProgram> {
        self.program.as_ref()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Install the `pre_exec` hook on `command`.
    ///
    /// Inside the forked child, before `execve`: a new session (so the guest
    /// has no controlling terminal), resource limits, then
    /// `PR_SET_NO_NEW_PRIVS` and the filter with the child's pid patched in.
    /// Everything the hook needs is computed here in the parent. A failure in
    /// the hook surfaces from `spawn` and is recognised by [`hook_failure`].
    #[cfg(unix)]
    pub fn apply(&self, command: &mut Command) -> Result<SandboxStrength, PolicyError> {
        let rlimits = rlimit_plan(&self.limits)?;
        let mut program = self
            .program
            .as_ref()
            .map(|p| (p.filter.clone(), p.pid_slots.clone()));

        // SAFETY: pre_exec runs between fork() and exec() in the child process.
        // The closure only calls setsid, getpid, setrlimit and prctl, all
        // async-signal-safe, and does not allocate.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(hook_error(HookStep::Session, io::Error::last_os_error()));
                }
                for (resource, value) in &rlimits {
                    rlimit::setrlimit(*resource, *value, *value)
                        .map_err(|e| hook_error(HookStep::Limits, e))?;
                }
                if let Some((filter, pid_slots)) = &mut program {
                    let pid = libc::getpid() as u32;
                    for slot in pid_slots.iter() {
                        filter[*slot].k = pid;
                    }
                    bpf::install(filter.as_slice())
                        .map_err(|e| hook_error(HookStep::Filter, e))?;
                }
                Ok(())
            });
        }

        Ok(self.strength())
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _command: &mut Command) -> Result<SandboxStrength, PolicyError> {
        Ok(SandboxStrength::None)
    }
}

/// Part of the pre-exec hook that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStep {
    Session = 1,
    Limits = 2,
    Filter = 3,
}

impl fmt::Display for HookStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStep::Session => write!(f, "start a new session"),
            HookStep::Limits => write!(f, "apply resource limits"),
            HookStep::Filter => write!(f, "install the syscall filter"),
        }
    }
}

// The child reports a pre_exec error to the parent as a bare errno, so the
// step is packed into the high bits of that integer.
const HOOK_ERROR_FLAG: i32 = 0x4000_0000;
const HOOK_STEP_SHIFT: u32 = 24;
const HOOK_ERRNO_MASK: i32 = 0x00FF_FFFF;

#[cfg(unix)]
fn hook_error(step: HookStep, err: io::Error) -> io::Error {
    let errno = err.raw_os_error().unwrap_or(libc::EINVAL) & HOOK_ERRNO_MASK;
    io::Error::from_raw_os_error(HOOK_ERROR_FLAG | ((step as i32) << HOOK_STEP_SHIFT) | errno)
}

/// If `err` came from a failed confinement hook, the step and the errno.
pub fn hook_failure(err: &io::Error) -> Option<PolicyError> {
    let raw = err.raw_os_error()?;
    if raw & HOOK_ERROR_FLAG == 0 {
        return None;
    }
    let step = match (raw >> HOOK_STEP_SHIFT) & 0x3F {
        1 => HookStep::Session,
        2 => HookStep::Limits,
        3 => HookStep::Filter,
        _ => return None,
    };
    Some(PolicyError::Confine {
        step: step.to_string(),
        reason: io::Error::from_raw_os_error(raw & HOOK_ERRNO_MASK).to_string(),
    })
}

/// Resolve configured limits to `(resource, value)` pairs, clamped to the
/// current hard limit so an unprivileged engine never tries to raise one.
#[cfg(unix)]
fn rlimit_plan(limits: &ResourceLimits) -> Result<Vec<(rlimit::Resource, u64)>, PolicyError> {
    use rlimit::Resource;

    const MB: u64 = 1024 * 1024;
    let wanted = [
        (
            Resource::AS,
            limits.max_memory_mb.map(|mb| mb.saturating_mul(MB)),
        ),
        (Resource::CPU, limits.max_cpu_seconds),
        (
            Resource::FSIZE,
            limits.max_file_size_mb.map(|mb| mb.saturating_mul(MB)),
        ),
        (Resource::NOFILE, limits.max_open_files),
    ];

    let mut plan = Vec::with_capacity(wanted.len());
    for (resource, value) in wanted {
        let Some(value) = value else {
            continue;
        };
        let (_, hard) = rlimit::getrlimit(resource).map_err(|e| {
            PolicyError::Unsupported(format!("cannot query {:?}: {}", resource, e))
        })?;
        plan.push((resource, value.min(hard)));
    }
    Ok(plan)
}

mod bpf {
    //! Classic BPF encoding for a seccomp allow-list

    /// Kernel limit on filter length (`BPF_MAXINSNS`)
    pub const MAX_INSNS: usize = 4096;

    pub const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;
    pub const AUDIT_ARCH_AARCH64: u32 = 0xC000_00B7;

    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

    // offsets into struct seccomp_data; ARG0_LO is the low word on
    // little-endian targets, which covers every table in `syscalls`
    const NR_OFFSET: u32 = 0;
    const ARCH_OFFSET: u32 = 4;
    const ARG0_LO_OFFSET: u32 = 16;

    /// `struct sock_filter`
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SockFilter {
        pub code: u16,
        pub jt: u8,
        pub jf: u8,
        pub k: u32,
    }

    /// `struct sock_fprog`
    #[repr(C)]
    struct SockFprog {
        len: u16,
        filter: *const SockFilter,
    }

    const fn stmt(code: u16, k: u32) -> SockFilter {
        SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
        SockFilter { code, jt, jf, k }
    }

    /// Load arch, kill on mismatch, load nr. Each `self_only` syscall then
    /// gets a block that allows it only when its first argument equals a pid
    /// constant (zero here; the caller patches the returned slots). Last comes
    /// one compare-and-allow pair per allowed syscall, falling through to kill.
    pub fn allow_list(
        audit_arch: u32,
        numbers: &[u32],
        self_only: &[u32],
    ) -> (Vec<SockFilter>, Vec<usize>) {
        let mut filter = Vec::with_capacity(5 + self_only.len() * 5 + numbers.len() * 2);
        let mut pid_slots = Vec::with_capacity(self_only.len());

        filter.push(stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET));
        filter.push(jump(BPF_JMP | BPF_JEQ | BPF_K, audit_arch, 1, 0));
        filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        filter.push(stmt(BPF_LD | BPF_W | BPF_ABS, NR_OFFSET));

        for nr in self_only {
            // a miss skips the four instructions below with nr still loaded
            filter.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr, 0, 4));
            filter.push(stmt(BPF_LD | BPF_W | BPF_ABS, ARG0_LO_OFFSET));
            pid_slots.push(filter.len());
            filter.push(jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1));
            filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
            filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        }

        for nr in numbers {
            filter.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr, 0, 1));
            filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        }

        filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        (filter, pid_slots)
    }

    #[cfg(target_os = "linux")]
    const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

    /// Set no-new-privs and load `filter` into the calling thread.
    #[cfg(target_os = "linux")]
    pub fn install(filter: &[SockFilter]) -> std::io::Result<()> {
        let prog = SockFprog {
            len: filter.len() as u16,
            filter: filter.as_ptr(),
        };

        // SAFETY: plain prctl calls; `prog` and the slice it points to outlive them.
        unsafe {
            let zero: libc::c_ulong = 0;
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, zero, zero, zero) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const SockFprog as libc::c_ulong,
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn install(_filter: &[SockFilter]) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}
