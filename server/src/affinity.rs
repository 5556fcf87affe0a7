//! CPU affinity utilities for pinning worker threads.

/// Pin the current thread to a specific CPU.
///
/// Linux only; a no-op elsewhere.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu_id: usize) -> std::io::Result<()> {
    use std::mem;

    // SAFETY: cpu_set_t is plain data; sched_setaffinity only reads the
    // set we hand it.
    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);

        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu_id: usize) -> std::io::Result<()> {
    Ok(())
}
