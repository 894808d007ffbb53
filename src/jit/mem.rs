//! Executable memory lifecycle: map a page-rounded read+write region,
//! copy the generated code in, trap-fill the tail, then flip the whole
//! mapping to read+execute. No page is ever writable and executable at
//! the same time.

use crate::vm::{VmError, VmResult};

pub(crate) struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub(crate) fn from_code(code: &[u8], trap: &[u8]) -> VmResult<Self> {
        let len = round_to_pages(code.len())?;
        let ptr = alloc_rw(len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        fill_trap(ptr, code.len(), len, trap);
        if let Err(err) = protect_rx(ptr, len) {
            release(ptr, len);
            return Err(err);
        }
        flush_icache(ptr, len);
        Ok(Self { ptr, len })
    }

    pub(crate) fn entry(&self) -> *const u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        release(self.ptr, self.len);
    }
}

/// Fills `[used, len)` with the repeating trap pattern so control flow
/// escaping the generated code faults deterministically. Emission is
/// pattern-aligned on every backend, so the cycle starts on an
/// instruction boundary.
fn fill_trap(ptr: *mut u8, used: usize, len: usize, trap: &[u8]) {
    let tail = unsafe { std::slice::from_raw_parts_mut(ptr.add(used), len - used) };
    for (byte, fill) in tail.iter_mut().zip(trap.iter().cycle()) {
        *byte = *fill;
    }
}

fn round_to_pages(size: usize) -> VmResult<usize> {
    let page = page_size()?;
    Ok(((size.max(1) - 1) | (page - 1)) + 1)
}

#[cfg(unix)]
fn page_size() -> VmResult<usize> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(VmError::AllocFailed(format!(
            "sysconf(_SC_PAGESIZE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(page as usize)
}

#[cfg(unix)]
fn alloc_rw(len: usize) -> VmResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(VmError::AllocFailed(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn protect_rx(ptr: *mut u8, len: usize) -> VmResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(VmError::ProtectFailed(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn release(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        libc::munmap(ptr as *mut _, len);
    }
}

#[cfg(windows)]
fn page_size() -> VmResult<usize> {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    Ok(info.dwPageSize as usize)
}

#[cfg(windows)]
fn alloc_rw(len: usize) -> VmResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(VmError::AllocFailed(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(windows)]
fn protect_rx(ptr: *mut u8, len: usize) -> VmResult<()> {
    use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, VirtualProtect};

    let mut previous = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut previous) };
    if ok == 0 {
        return Err(VmError::ProtectFailed(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(windows)]
fn release(ptr: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return;
    }
    unsafe {
        VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
fn page_size() -> VmResult<usize> {
    Err(VmError::AllocFailed(
        "executable memory is not supported on this platform".to_string(),
    ))
}

#[cfg(not(any(unix, windows)))]
fn alloc_rw(_len: usize) -> VmResult<*mut u8> {
    Err(VmError::AllocFailed(
        "executable memory is not supported on this platform".to_string(),
    ))
}

#[cfg(not(any(unix, windows)))]
fn protect_rx(_ptr: *mut u8, _len: usize) -> VmResult<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn release(_ptr: *mut u8, _len: usize) {}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "linux")))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(all(target_arch = "arm", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_pages() {
        let page = page_size().expect("host should report a page size");
        assert_eq!(round_to_pages(1).unwrap(), page);
        assert_eq!(round_to_pages(page).unwrap(), page);
        assert_eq!(round_to_pages(page + 1).unwrap(), 2 * page);
    }

    #[test]
    fn tail_is_trap_filled() {
        let code = [0x01u8, 0x02, 0x03];
        let memory = ExecutableMemory::from_code(&code, &[0xCC]).expect("mapping should succeed");
        let bytes = unsafe { std::slice::from_raw_parts(memory.entry(), memory.len()) };
        assert_eq!(&bytes[..3], &code);
        assert!(bytes[3..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn multi_byte_pattern_repeats_across_the_tail() {
        let code = [0u8; 4];
        let trap = [0xF0u8, 0x00, 0xF0, 0xE7];
        let memory = ExecutableMemory::from_code(&code, &trap).expect("mapping should succeed");
        let bytes = unsafe { std::slice::from_raw_parts(memory.entry(), memory.len()) };
        for chunk in bytes[4..].chunks(4) {
            assert_eq!(chunk, &trap[..chunk.len()]);
        }
    }
}
