//! Process isolation for guest code
//!
//! - [`provisioner`] builds a disposable virtual environment per request
//! - [`environment`] owns that tree and tears it down
//! - [`policy`] turns a syscall allow-list into a seccomp filter plus rlimits
//! - [`supervisor`] runs the interpreter under that confinement with a deadline
//! - [`output`] captures each stream up to a byte cap

pub mod environment;
pub mod output;
pub mod policy;
pub mod provisioner;
pub mod supervisor;
pub mod syscalls;

pub use environment::Environment;
pub use output::OutputCapture;
pub use policy::{build_policy, Confinement, PolicyMode, SyscallPolicy};
pub use provisioner::Provisioner;
pub use supervisor::{guest_command, Supervisor};

pub use crate::types::SandboxStrength;

/// What the host can enforce, detected once at engine start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Kernel seccomp-bpf filtering is usable and the architecture has a syscall table
    pub seccomp: bool,
    pub arch: &'static str,
    pub os: &'static str,
}

impl Capabilities {
    /// Probe the running host.
    pub fn detect() -> Self {
        let arch = std::env::consts::ARCH;
        let os = std::env::consts::OS;
        let seccomp = syscalls::native_table().is_some() && kernel_supports_seccomp();

        tracing::debug!("Detected capabilities: os={}, arch={}, seccomp={}", os, arch, seccomp);

        Self { seccomp, arch, os }
    }

    /// Strength a guest would get under `mode` on this host.
    pub fn strength_for(&self, mode: PolicyMode) -> SandboxStrength {
        if self.seccomp && mode != PolicyMode::Disabled {
            SandboxStrength::Full
        } else {
            SandboxStrength::None
        }
    }
}

#[cfg(target_os = "linux")]
fn kernel_supports_seccomp() -> bool {
    // PR_GET_SECCOMP fails with EINVAL when the kernel lacks CONFIG_SECCOMP.
    // SAFETY: query-only prctl with no pointer arguments.
    let mode = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    mode >= 0
}

#[cfg(not(target_os = "linux"))]
fn kernel_supports_seccomp() -> bool {
    false
}
