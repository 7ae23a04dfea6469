//! Process hardening applied once at startup, before the tracing subscriber
//! or any subsystem is built: disable core dumps and best-effort pin process
//! memory so master key material and decrypted credentials can't be swapped
//! to disk.
//!
//! Both steps are best-effort — a container without `CAP_SYS_RESOURCE` or an
//! unprivileged user will fail `lock_memory`, and the daemon should still
//! start. Failures are logged by the caller, not here.

#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    #[allow(unsafe_code)]
    let result = unsafe {
        let rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &rlim)
    };
    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "setrlimit(RLIMIT_CORE, 0) failed with errno {}",
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "mlockall(MCL_CURRENT | MCL_FUTURE) failed with errno {}",
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}
