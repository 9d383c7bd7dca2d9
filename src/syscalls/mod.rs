//! System-call gateway.
//!
//! The trap handler hands us the user stack pointer; the number and the
//! argument words are read off it in 32-bit words through the byte
//! probes below. Every user address is validated by translating it
//! through the current page directory (faulting lazy pages in on the
//! way); an invalid access terminates the process with status -1.
//! Buffer transfers pin the underlying frames so the clock cannot evict
//! them mid-copy. File operations serialize on the global file-system
//! lock; fd 0 and 1 bypass the file layer entirely.

use crate::fs;
use crate::memory::{self, PGSIZE};
use crate::process::{self, FD_MAX};
use crate::scheduler;
use crate::vm::{frame, page};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use x86_64::VirtAddr;

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_FIBONACCI: u32 = 13;
pub const SYS_MAX_OF_FOUR_INT: u32 = 14;

/// An invalid user access; the gateway turns it into `exit(-1)`.
#[derive(Debug)]
pub struct Fault;

pub type UserResult<T> = Result<T, Fault>;

/// Entry from the trap handler: `esp` is the faulting thread's user
/// stack pointer. Returns the value for the user's return register;
/// does not return at all for `halt`/`exit`/invalid accesses.
pub fn dispatch(esp: VirtAddr) -> i32 {
    match dispatch_checked(esp) {
        Ok(value) => value,
        Err(Fault) => process::exit(-1),
    }
}

fn arg(esp: VirtAddr, index: u64) -> UserResult<u32> {
    read_user_word(esp + 4u64 + 4u64 * index)
}

fn dispatch_checked(esp: VirtAddr) -> UserResult<i32> {
    let number = read_user_word(esp)?;
    match number {
        SYS_HALT => halt(),
        SYS_EXIT => {
            let status = arg(esp, 0)? as i32;
            sys_exit(status)
        }
        SYS_EXEC => {
            let cmdline = read_user_cstr(VirtAddr::new(arg(esp, 0)? as u64))?;
            Ok(process::execute(&cmdline))
        }
        SYS_WAIT => Ok(process::wait(arg(esp, 0)? as i32)),
        SYS_CREATE => {
            let name = read_user_cstr(VirtAddr::new(arg(esp, 0)? as u64))?;
            let size = arg(esp, 1)? as usize;
            Ok(sys_create(&name, size) as i32)
        }
        SYS_REMOVE => {
            let name = read_user_cstr(VirtAddr::new(arg(esp, 0)? as u64))?;
            Ok(sys_remove(&name) as i32)
        }
        SYS_OPEN => {
            let name = read_user_cstr(VirtAddr::new(arg(esp, 0)? as u64))?;
            Ok(sys_open(&name))
        }
        SYS_FILESIZE => Ok(sys_filesize(arg(esp, 0)? as usize)),
        SYS_READ => {
            let fd = arg(esp, 0)? as usize;
            let buffer = VirtAddr::new(arg(esp, 1)? as u64);
            let size = arg(esp, 2)? as usize;
            sys_read(fd, buffer, size)
        }
        SYS_WRITE => {
            let fd = arg(esp, 0)? as usize;
            let buffer = VirtAddr::new(arg(esp, 1)? as u64);
            let size = arg(esp, 2)? as usize;
            sys_write(fd, buffer, size)
        }
        SYS_SEEK => Ok(sys_seek(arg(esp, 0)? as usize, arg(esp, 1)? as usize)),
        SYS_TELL => Ok(sys_tell(arg(esp, 0)? as usize)),
        SYS_CLOSE => Ok(sys_close(arg(esp, 0)? as usize)),
        SYS_FIBONACCI => Ok(fibonacci(arg(esp, 0)? as i32)),
        SYS_MAX_OF_FOUR_INT => Ok(max_of_four_int(
            arg(esp, 0)? as i32,
            arg(esp, 1)? as i32,
            arg(esp, 2)? as i32,
            arg(esp, 3)? as i32,
        )),
        _ => Err(Fault),
    }
}

// ── User-memory probes ───────────────────────────────────────

/// Read one byte of user memory, faulting the page in if it is merely
/// lazy.
pub(crate) fn get_user(va: VirtAddr) -> UserResult<u8> {
    if !memory::is_user_vaddr(va) {
        return Err(Fault);
    }
    let upage = memory::pg_round_down(va);
    let cur = scheduler::current();
    for _ in 0..2 {
        let kpage = {
            let mut user = cur.user.lock();
            let user = user.as_mut().ok_or(Fault)?;
            match user.pagedir.get_page(upage) {
                Some(kpage) => {
                    user.pagedir.set_accessed(upage, true);
                    Some(kpage)
                }
                None => None,
            }
        };
        if let Some(kpage) = kpage {
            return Ok(unsafe { memory::page_bytes(kpage) }[memory::pg_ofs(va)]);
        }
        if !page::load_page(upage) {
            return Err(Fault);
        }
    }
    Err(Fault)
}

/// Write one byte of user memory; the page must be mapped writable (or
/// lazily mappable as writable).
pub(crate) fn put_user(va: VirtAddr, byte: u8) -> UserResult<()> {
    if !memory::is_user_vaddr(va) {
        return Err(Fault);
    }
    let upage = memory::pg_round_down(va);
    let cur = scheduler::current();
    for _ in 0..2 {
        let kpage = {
            let mut user = cur.user.lock();
            let user = user.as_mut().ok_or(Fault)?;
            match user.pagedir.get_page(upage) {
                Some(kpage) => {
                    if !user.pagedir.is_writable(upage) {
                        return Err(Fault);
                    }
                    user.pagedir.set_accessed(upage, true);
                    user.pagedir.set_dirty(upage, true);
                    Some(kpage)
                }
                None => None,
            }
        };
        if let Some(kpage) = kpage {
            (unsafe { memory::page_bytes(kpage) })[memory::pg_ofs(va)] = byte;
            return Ok(());
        }
        if !page::load_page(upage) {
            return Err(Fault);
        }
    }
    Err(Fault)
}

/// One 32-bit argument word, byte by byte: the user stack need not be
/// aligned to be readable.
fn read_user_word(va: VirtAddr) -> UserResult<u32> {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = get_user(va + i as u64)?;
    }
    Ok(u32::from_le_bytes(bytes))
}

/// A NUL-terminated user string, capped at one page.
fn read_user_cstr(va: VirtAddr) -> UserResult<String> {
    let mut bytes = Vec::new();
    for i in 0..PGSIZE as u64 {
        let b = get_user(va + i)?;
        if b == 0 {
            return String::from_utf8(bytes).map_err(|_| Fault);
        }
        bytes.push(b);
    }
    Err(Fault)
}

/// Fault in and pin every frame under `va..va+len`, so a transfer in
/// flight cannot lose its pages to the clock.
fn pin_range(va: VirtAddr, len: usize) -> UserResult<Vec<VirtAddr>> {
    let mut kpages = Vec::new();
    if len == 0 {
        return Ok(kpages);
    }
    let cur = scheduler::current();
    let first = memory::pg_round_down(va);
    let last = memory::pg_round_down(va + (len - 1) as u64);
    let mut upage = first;
    loop {
        // Touch the page so it is resident, then pin its frame.
        get_user(upage.max(va))?;
        let kpage = {
            let user = cur.user.lock();
            user.as_ref().and_then(|u| u.pagedir.get_page(upage))
        };
        match kpage {
            Some(kpage) => {
                frame::pin(kpage);
                kpages.push(kpage);
            }
            None => {
                unpin_all(&kpages);
                return Err(Fault);
            }
        }
        if upage == last {
            break;
        }
        upage += PGSIZE as u64;
    }
    Ok(kpages)
}

fn unpin_all(kpages: &[VirtAddr]) {
    for &kpage in kpages {
        frame::unpin(kpage);
    }
}

/// Copy `len` bytes out of user memory.
fn copy_in(va: VirtAddr, len: usize) -> UserResult<Vec<u8>> {
    let pinned = pin_range(va, len)?;
    let mut out = Vec::with_capacity(len);
    let mut result = Ok(());
    for i in 0..len as u64 {
        match get_user(va + i) {
            Ok(b) => out.push(b),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    unpin_all(&pinned);
    result.map(|_| out)
}

/// Copy `data` into user memory.
fn copy_out(va: VirtAddr, data: &[u8]) -> UserResult<()> {
    let pinned = pin_range(va, data.len())?;
    let mut result = Ok(());
    for (i, &b) in data.iter().enumerate() {
        if let Err(e) = put_user(va + i as u64, b) {
            result = Err(e);
            break;
        }
    }
    unpin_all(&pinned);
    result
}

// ── The syscalls themselves (kernel-side entry points) ───────

fn halt() -> ! {
    crate::log_info!("halt requested");
    #[cfg(target_os = "none")]
    {
        crate::interrupts::disable();
        loop {
            x86_64::instructions::hlt();
        }
    }
    #[cfg(not(target_os = "none"))]
    std::process::exit(0)
}

pub fn sys_exit(status: i32) -> ! {
    process::exit(status)
}

pub fn sys_create(name: &str, initial_size: usize) -> bool {
    fs::fs_lock().acquire();
    let result = fs::create(name, initial_size);
    fs::fs_lock().release();
    result.is_ok()
}

pub fn sys_remove(name: &str) -> bool {
    fs::fs_lock().acquire();
    let result = fs::remove(name);
    fs::fs_lock().release();
    result.is_ok()
}

pub fn sys_open(name: &str) -> i32 {
    fs::fs_lock().acquire();
    let file = fs::open(name);
    fs::fs_lock().release();
    let file = match file {
        Ok(f) => f,
        Err(_) => return -1,
    };
    let cur = scheduler::current();
    let mut user = cur.user.lock();
    let user = match user.as_mut() {
        Some(u) => u,
        None => return -1,
    };
    match user.files.iter().skip(2).position(|f| f.is_none()) {
        Some(free) => {
            let fd = free + 2;
            user.files[fd] = Some(file);
            fd as i32
        }
        None => -1,
    }
}

/// Run `f` on the open file behind `fd`, if any.
fn with_fd<T>(fd: usize, f: impl FnOnce(&mut fs::File) -> T) -> Option<T> {
    if !(2..FD_MAX).contains(&fd) {
        return None;
    }
    let cur = scheduler::current();
    let mut user = cur.user.lock();
    user.as_mut()?.files[fd].as_mut().map(f)
}

pub fn sys_filesize(fd: usize) -> i32 {
    fs::fs_lock().acquire();
    let len = with_fd(fd, |f| f.len() as i32);
    fs::fs_lock().release();
    len.unwrap_or(-1)
}

pub fn sys_read(fd: usize, buffer: VirtAddr, size: usize) -> UserResult<i32> {
    if fd == 0 {
        // Console input belongs to the external keyboard layer.
        return Ok(0);
    }
    if fd == 1 {
        return Ok(-1);
    }
    fs::fs_lock().acquire();
    let data = with_fd(fd, |file| {
        let mut buf = vec![0u8; size];
        let n = file.read(&mut buf);
        buf.truncate(n);
        buf
    });
    fs::fs_lock().release();
    match data {
        Some(buf) => {
            // The copy runs outside the file-system lock; the pages it
            // faults in must not wait on a file read behind us.
            copy_out(buffer, &buf)?;
            Ok(buf.len() as i32)
        }
        None => Ok(-1),
    }
}

pub fn sys_write(fd: usize, buffer: VirtAddr, size: usize) -> UserResult<i32> {
    let data = copy_in(buffer, size)?;
    if fd == 1 {
        if let Ok(s) = core::str::from_utf8(&data) {
            crate::print!("{}", s);
        }
        return Ok(size as i32);
    }
    if fd == 0 {
        return Ok(-1);
    }
    fs::fs_lock().acquire();
    let written = with_fd(fd, |f| f.write(&data));
    fs::fs_lock().release();
    Ok(written.map(|n| n as i32).unwrap_or(-1))
}

pub fn sys_seek(fd: usize, pos: usize) -> i32 {
    fs::fs_lock().acquire();
    let done = with_fd(fd, |f| f.seek(pos));
    fs::fs_lock().release();
    if done.is_some() {
        0
    } else {
        -1
    }
}

pub fn sys_tell(fd: usize) -> i32 {
    fs::fs_lock().acquire();
    let pos = with_fd(fd, |f| f.tell() as i32);
    fs::fs_lock().release();
    pos.unwrap_or(-1)
}

pub fn sys_close(fd: usize) -> i32 {
    if !(2..FD_MAX).contains(&fd) {
        return -1;
    }
    let cur = scheduler::current();
    let mut user = cur.user.lock();
    match user.as_mut() {
        Some(u) => match u.files[fd].take() {
            Some(_) => 0,
            None => -1,
        },
        None => -1,
    }
}

/// Demo syscall: the n-th Fibonacci number.
pub fn fibonacci(n: i32) -> i32 {
    if n <= 0 {
        return 0;
    }
    let (mut a, mut b) = (0i32, 1i32);
    for _ in 1..n {
        let next = a.wrapping_add(b);
        a = b;
        b = next;
    }
    b
}

/// Demo syscall: the largest of four integers.
pub fn max_of_four_int(a: i32, b: i32, c: i32, d: i32) -> i32 {
    a.max(b).max(c).max(d)
}
