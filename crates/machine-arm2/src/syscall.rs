//! The software-interrupt trap layer.
//!
//! Dispatches on the 24-bit SWI immediate with arguments in R0-R2 and the
//! result in R0. Syscalls mutate registers and memory under the same
//! rules as guest code (bad pointers fault) and never touch the CPSR
//! flags. Each VM owns its stdin queue, file table and heap, so
//! concurrent sessions do not interfere.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use cpu_arm2::{Cpu, Fault, Memory};

use crate::machine::VmError;

/// Host side of guest I/O.
///
/// Output bytes reach the host stream before the syscall returns; the
/// debug channel carries DEBUG_PRINT and the dump syscalls.
pub trait HostIo: Send {
    fn write_output(&mut self, bytes: &[u8]);
    fn write_debug(&mut self, text: &str);
}

/// Collects output in memory; the default for tests and sessions.
#[derive(Debug, Default)]
pub struct BufferIo {
    pub output: Vec<u8>,
    pub debug: Vec<String>,
}

impl HostIo for BufferIo {
    fn write_output(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }
    fn write_debug(&mut self, text: &str) {
        self.debug.push(text.to_string());
    }
}

/// A [`BufferIo`] behind `Arc<Mutex<..>>` so the creator can read the
/// output back while the VM owns the `HostIo` box.
#[derive(Clone, Default)]
pub struct SharedIo(pub std::sync::Arc<std::sync::Mutex<BufferIo>>);

impl SharedIo {
    /// Take the buffered output bytes.
    #[must_use]
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().expect("io lock").output)
    }

    /// Take the buffered debug lines.
    #[must_use]
    pub fn take_debug(&self) -> Vec<String> {
        std::mem::take(&mut self.0.lock().expect("io lock").debug)
    }
}

impl HostIo for SharedIo {
    fn write_output(&mut self, bytes: &[u8]) {
        self.0.lock().expect("io lock").output.extend_from_slice(bytes);
    }
    fn write_debug(&mut self, text: &str) {
        self.0.lock().expect("io lock").debug.push(text.to_string());
    }
}

/// Writes guest output to the process stdout and debug text to stderr.
pub struct StdIo;

impl HostIo for StdIo {
    fn write_output(&mut self, bytes: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }
    fn write_debug(&mut self, text: &str) {
        eprintln!("{text}");
    }
}

/// What a dispatched syscall asks the machine to do next.
#[derive(Debug)]
pub(crate) enum SysOutcome {
    Continue,
    Exit(u32),
    /// SWI 0xF1: pause under the debugger.
    Pause,
    Error(VmError),
}

/// Guest-visible error codes for the error-query syscalls.
mod errno {
    pub const NONE: u32 = 0;
    pub const INVALID: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
    pub const TOO_MANY_FILES: u32 = 3;
    pub const IO: u32 = 4;
    pub const PATH_ESCAPE: u32 = 5;
    pub const TOO_LARGE: u32 = 6;
}

const MAX_FDS: usize = 1024;
/// Guest fds 0-2 are the standard streams; files start here.
const FIRST_FILE_FD: u32 = 3;
/// Cap for guest-supplied string reads (pathological 0-terminators).
const MAX_GUEST_STRING: u32 = 1 << 20;
/// DUMP_MEMORY length cap.
const MAX_DUMP: u32 = 1024;

/// A simple first-fit heap: a bump pointer plus a free list.
#[derive(Debug, Default)]
struct Heap {
    base: u32,
    size: u32,
    next: u32,
    /// Live allocations: (addr, size).
    blocks: Vec<(u32, u32)>,
    /// Freed holes available for reuse.
    holes: Vec<(u32, u32)>,
}

impl Heap {
    fn reset(&mut self, base: u32, size: u32) {
        self.base = base;
        self.size = size;
        self.next = base;
        self.blocks.clear();
        self.holes.clear();
    }

    fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 || self.size == 0 {
            return None;
        }
        let size = (size + 7) & !7;
        // First fit from the free list.
        if let Some(idx) = self.holes.iter().position(|&(_, hole)| hole >= size) {
            let (addr, hole) = self.holes.swap_remove(idx);
            if hole > size {
                self.holes.push((addr + size, hole - size));
            }
            self.blocks.push((addr, size));
            return Some(addr);
        }
        let end = self.base.checked_add(self.size)?;
        if self.next.checked_add(size)? > end {
            return None;
        }
        let addr = self.next;
        self.next += size;
        self.blocks.push((addr, size));
        Some(addr)
    }

    fn free(&mut self, addr: u32) -> bool {
        let Some(idx) = self.blocks.iter().position(|&(a, _)| a == addr) else {
            return false;
        };
        let (addr, size) = self.blocks.swap_remove(idx);
        self.holes.push((addr, size));
        true
    }

    fn size_of(&self, addr: u32) -> Option<u32> {
        self.blocks.iter().find(|&&(a, _)| a == addr).map(|&(_, s)| s)
    }
}

struct OpenFile {
    file: File,
}

/// The syscall layer state.
pub(crate) struct SyscallLayer {
    files: Vec<Option<OpenFile>>,
    heap: Heap,
    pub(crate) stdin: VecDeque<u8>,
    pub(crate) io: Box<dyn HostIo>,
    fs_root: Option<PathBuf>,
    max_file_size: u64,
    last_error: u32,
    args: Vec<String>,
    env: Vec<String>,
    /// Materialized argv/envp in guest memory, built on first request.
    args_ptr: Option<(u32, u32)>,
    env_ptr: Option<u32>,
}

impl SyscallLayer {
    pub(crate) fn new(
        io: Box<dyn HostIo>,
        fs_root: Option<PathBuf>,
        max_file_size: u64,
        args: Vec<String>,
        env: Vec<String>,
    ) -> Self {
        Self {
            files: Vec::new(),
            heap: Heap::default(),
            stdin: VecDeque::new(),
            io,
            fs_root,
            max_file_size,
            last_error: errno::NONE,
            args,
            env,
            args_ptr: None,
            env_ptr: None,
        }
    }

    /// Reset guest-visible state for a machine reset. Host wiring (io,
    /// sandbox root, argument list) survives.
    pub(crate) fn reset(&mut self, heap_base: u32, heap_size: u32) {
        self.files.clear();
        self.heap.reset(heap_base, heap_size);
        self.stdin.clear();
        self.last_error = errno::NONE;
        self.args_ptr = None;
        self.env_ptr = None;
    }

    fn fail(&mut self, cpu: &mut Cpu, code: u32) -> SysOutcome {
        self.last_error = code;
        cpu.regs.write(0, u32::MAX);
        SysOutcome::Continue
    }

    /// Read a 0-terminated guest string through the normal memory rules.
    fn read_cstr(&self, mem: &mut Memory, mut addr: u32) -> Result<Vec<u8>, Fault> {
        let mut bytes = Vec::new();
        loop {
            let b = mem.read_byte(addr)?;
            if b == 0 {
                return Ok(bytes);
            }
            bytes.push(b as u8);
            if bytes.len() as u32 >= MAX_GUEST_STRING {
                return Ok(bytes);
            }
            addr = addr.wrapping_add(1);
        }
    }

    /// Resolve a guest path inside the sandbox root. Lexical `..` escapes
    /// and absolute prefixes are rejected before touching the filesystem.
    fn sandbox_path(&self, guest: &[u8]) -> Result<PathBuf, u32> {
        let root = self.fs_root.as_ref().ok_or(errno::PATH_ESCAPE)?;
        let text = std::str::from_utf8(guest).map_err(|_| errno::INVALID)?;
        let mut clean = PathBuf::new();
        for component in Path::new(text.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => return Err(errno::PATH_ESCAPE),
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(errno::INVALID);
        }
        let full = root.join(clean);
        // A resolvable path must still live under the root (symlinks).
        if let Ok(canon) = full.canonicalize() {
            let canon_root = root.canonicalize().map_err(|_| errno::IO)?;
            if !canon.starts_with(&canon_root) {
                return Err(errno::PATH_ESCAPE);
            }
        }
        Ok(full)
    }

    fn alloc_fd(&mut self, file: File) -> Option<u32> {
        if let Some(idx) = self.files.iter().position(Option::is_none) {
            self.files[idx] = Some(OpenFile { file });
            return Some(idx as u32 + FIRST_FILE_FD);
        }
        if self.files.len() >= MAX_FDS {
            return None;
        }
        self.files.push(Some(OpenFile { file }));
        Some(self.files.len() as u32 - 1 + FIRST_FILE_FD)
    }

    fn file_mut(&mut self, fd: u32) -> Option<&mut File> {
        let idx = fd.checked_sub(FIRST_FILE_FD)? as usize;
        self.files.get_mut(idx)?.as_mut().map(|f| &mut f.file)
    }

    /// Materialize argv (strings + pointer array) into the guest heap.
    fn build_arguments(&mut self, mem: &mut Memory) -> Result<(u32, u32), u32> {
        if let Some(ready) = self.args_ptr {
            return Ok(ready);
        }
        let args = self.args.clone();
        let table = self.write_pointer_table(mem, &args)?;
        let ready = (args.len() as u32, table);
        self.args_ptr = Some(ready);
        Ok(ready)
    }

    fn build_environment(&mut self, mem: &mut Memory) -> Result<u32, u32> {
        if let Some(ready) = self.env_ptr {
            return Ok(ready);
        }
        let env = self.env.clone();
        let table = self.write_pointer_table(mem, &env)?;
        self.env_ptr = Some(table);
        Ok(table)
    }

    /// Write `strings` plus a 0-terminated pointer array; returns the
    /// array's address. Uses the loader store: the heap blocks involved
    /// are bookkeeping, not guest-observable traffic.
    fn write_pointer_table(&mut self, mem: &mut Memory, strings: &[String]) -> Result<u32, u32> {
        let mut pointers = Vec::with_capacity(strings.len() + 1);
        for s in strings {
            let bytes = s.as_bytes();
            let addr = self
                .heap
                .allocate(bytes.len() as u32 + 1)
                .ok_or(errno::TOO_LARGE)?;
            let mut with_nul = bytes.to_vec();
            with_nul.push(0);
            mem.load_bytes(addr, &with_nul).map_err(|_| errno::IO)?;
            pointers.push(addr);
        }
        pointers.push(0);
        let table = self
            .heap
            .allocate(pointers.len() as u32 * 4)
            .ok_or(errno::TOO_LARGE)?;
        let bytes: Vec<u8> = pointers.iter().flat_map(|p| p.to_le_bytes()).collect();
        mem.load_bytes(table, &bytes).map_err(|_| errno::IO)?;
        Ok(table)
    }

    fn format_int(value: u32, base: u32) -> Option<String> {
        Some(match base {
            2 => format!("{value:b}"),
            8 => format!("{value:o}"),
            10 => format!("{}", value as i32),
            16 => format!("{value:X}"),
            _ => return None,
        })
    }

    /// Dispatch one SWI. The CPSR is never touched here: flag
    /// preservation across syscalls is structural.
    pub(crate) fn dispatch(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut Memory,
        imm: u32,
        cancelled: bool,
    ) -> SysOutcome {
        let r0 = cpu.regs.read(0);
        let r1 = cpu.regs.read(1);
        let r2 = cpu.regs.read(2);
        match imm {
            // EXIT.
            0x00 => return SysOutcome::Exit(r0),
            // WRITE_CHAR.
            0x01 => self.io.write_output(&[r0 as u8]),
            // WRITE_STRING.
            0x02 => match self.read_cstr(mem, r0) {
                Ok(bytes) => self.io.write_output(&bytes),
                Err(f) => return SysOutcome::Error(VmError::Fault(f)),
            },
            // WRITE_INT.
            0x03 => match Self::format_int(r0, r1) {
                Some(text) => self.io.write_output(text.as_bytes()),
                None => return self.fail(cpu, errno::INVALID),
            },
            // READ_CHAR.
            0x04 => {
                let value = if cancelled {
                    u32::MAX
                } else {
                    self.stdin.pop_front().map_or(u32::MAX, u32::from)
                };
                cpu.regs.write(0, value);
            }
            // READ_STRING.
            0x05 => {
                let mut written = 0u32;
                if r1 > 0 && !cancelled {
                    while written + 1 < r1 {
                        let Some(b) = self.stdin.pop_front() else { break };
                        if let Err(f) = mem.write_byte(r0.wrapping_add(written), u32::from(b)) {
                            return SysOutcome::Error(VmError::Fault(f));
                        }
                        written += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                    if let Err(f) = mem.write_byte(r0.wrapping_add(written), 0) {
                        return SysOutcome::Error(VmError::Fault(f));
                    }
                }
                cpu.regs.write(0, written);
            }
            // READ_INT.
            0x06 => {
                let mut line = Vec::new();
                while let Some(b) = self.stdin.pop_front() {
                    if b == b'\n' {
                        break;
                    }
                    line.push(b);
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16).unwrap_or(0)
                } else {
                    text.parse::<i64>().unwrap_or(0)
                };
                cpu.regs.write(0, value as u32);
            }
            // WRITE_NEWLINE.
            0x07 => self.io.write_output(b"\n"),

            // File operations.
            0x10..=0x16 => return self.dispatch_file(cpu, mem, imm, r0, r1, r2),

            // ALLOCATE.
            0x20 => {
                let addr = self.heap.allocate(r0).unwrap_or(0);
                if addr == 0 {
                    self.last_error = errno::TOO_LARGE;
                }
                cpu.regs.write(0, addr);
            }
            // FREE.
            0x21 => {
                if self.heap.free(r0) {
                    cpu.regs.write(0, 0);
                } else {
                    return self.fail(cpu, errno::INVALID);
                }
            }
            // REALLOCATE.
            0x22 => {
                let old = r0;
                let new_size = r1;
                let Some(old_size) = self.heap.size_of(old) else {
                    return self.fail(cpu, errno::INVALID);
                };
                let Some(new_addr) = self.heap.allocate(new_size) else {
                    self.last_error = errno::TOO_LARGE;
                    cpu.regs.write(0, 0);
                    return SysOutcome::Continue;
                };
                let count = old_size.min(new_size);
                for i in 0..count {
                    match mem.read_byte(old.wrapping_add(i)) {
                        Ok(b) => {
                            if let Err(f) = mem.write_byte(new_addr.wrapping_add(i), b) {
                                return SysOutcome::Error(VmError::Fault(f));
                            }
                        }
                        Err(f) => return SysOutcome::Error(VmError::Fault(f)),
                    }
                }
                self.heap.free(old);
                cpu.regs.write(0, new_addr);
            }

            // GET_TIME: milliseconds since the epoch, low word.
            0x30 => {
                let ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_or(0, |d| d.as_millis());
                cpu.regs.write(0, ms as u32);
            }
            // GET_RANDOM.
            0x31 => cpu.regs.write(0, rand::random::<u32>()),
            // GET_ARGUMENTS.
            0x32 => match self.build_arguments(mem) {
                Ok((argc, argv)) => {
                    cpu.regs.write(0, argc);
                    cpu.regs.write(1, argv);
                }
                Err(code) => return self.fail(cpu, code),
            },
            // GET_ENVIRONMENT.
            0x33 => match self.build_environment(mem) {
                Ok(envp) => cpu.regs.write(0, envp),
                Err(code) => return self.fail(cpu, code),
            },

            // GET_ERROR / SET_ERROR / CLEAR_ERROR.
            0x40 => cpu.regs.write(0, self.last_error),
            0x41 => self.last_error = r0,
            0x42 => self.last_error = errno::NONE,

            // DEBUG_PRINT.
            0xF0 => match self.read_cstr(mem, r0) {
                Ok(bytes) => self.io.write_debug(&String::from_utf8_lossy(&bytes)),
                Err(f) => return SysOutcome::Error(VmError::Fault(f)),
            },
            // BREAKPOINT.
            0xF1 => return SysOutcome::Pause,
            // DUMP_REGISTERS.
            0xF2 => {
                let mut text = String::new();
                for (i, chunk) in cpu.regs.r.chunks(4).enumerate() {
                    for (j, v) in chunk.iter().enumerate() {
                        text.push_str(&format!("R{:<2} = 0x{v:08X}  ", i * 4 + j));
                    }
                    text.push('\n');
                }
                text.push_str(&format!(
                    "N={} Z={} C={} V={}  cycles={}",
                    u8::from(cpu.cpsr.n),
                    u8::from(cpu.cpsr.z),
                    u8::from(cpu.cpsr.c),
                    u8::from(cpu.cpsr.v),
                    cpu.cycles
                ));
                self.io.write_debug(&text);
            }
            // DUMP_MEMORY.
            0xF3 => {
                let len = r1.min(MAX_DUMP);
                let mut text = String::new();
                for row in 0..len.div_ceil(16) {
                    let base = r0.wrapping_add(row * 16);
                    text.push_str(&format!("0x{base:08X}:"));
                    for col in 0..16u32 {
                        if row * 16 + col >= len {
                            break;
                        }
                        match mem.read_byte(base.wrapping_add(col)) {
                            Ok(b) => text.push_str(&format!(" {b:02X}")),
                            Err(f) => return SysOutcome::Error(VmError::Fault(f)),
                        }
                    }
                    text.push('\n');
                }
                self.io.write_debug(text.trim_end_matches('\n'));
            }
            // ASSERT.
            0xF4 => {
                if r0 == 0 {
                    let message = match self.read_cstr(mem, r1) {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Err(_) => "assertion failed".to_string(),
                    };
                    return SysOutcome::Error(VmError::Assertion { message });
                }
            }

            other => return SysOutcome::Error(VmError::UnknownSyscall { code: other }),
        }
        SysOutcome::Continue
    }

    fn dispatch_file(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut Memory,
        imm: u32,
        r0: u32,
        r1: u32,
        r2: u32,
    ) -> SysOutcome {
        match imm {
            // OPEN(filename, mode).
            0x10 => {
                let name = match self.read_cstr(mem, r0) {
                    Ok(b) => b,
                    Err(f) => return SysOutcome::Error(VmError::Fault(f)),
                };
                let path = match self.sandbox_path(&name) {
                    Ok(p) => p,
                    Err(code) => return self.fail(cpu, code),
                };
                let result = match r1 {
                    0 => OpenOptions::new().read(true).open(&path),
                    1 => OpenOptions::new().write(true).create(true).truncate(true).open(&path),
                    2 => OpenOptions::new().append(true).create(true).open(&path),
                    _ => return self.fail(cpu, errno::INVALID),
                };
                match result {
                    Ok(file) => match self.alloc_fd(file) {
                        Some(fd) => cpu.regs.write(0, fd),
                        None => return self.fail(cpu, errno::TOO_MANY_FILES),
                    },
                    Err(_) => return self.fail(cpu, errno::NOT_FOUND),
                }
            }
            // CLOSE(fd).
            0x11 => {
                let Some(idx) = r0.checked_sub(FIRST_FILE_FD).map(|i| i as usize) else {
                    return self.fail(cpu, errno::INVALID);
                };
                match self.files.get_mut(idx).and_then(Option::take) {
                    Some(_) => cpu.regs.write(0, 0),
                    None => return self.fail(cpu, errno::INVALID),
                }
            }
            // READ(fd, buf, len).
            0x12 => {
                if r0 == 0 {
                    // Standard input: consume the stdin queue.
                    let mut count = 0u32;
                    while count < r2 {
                        let Some(b) = self.stdin.pop_front() else { break };
                        if let Err(f) = mem.write_byte(r1.wrapping_add(count), u32::from(b)) {
                            return SysOutcome::Error(VmError::Fault(f));
                        }
                        count += 1;
                    }
                    cpu.regs.write(0, count);
                    return SysOutcome::Continue;
                }
                let Some(file) = self.file_mut(r0) else {
                    return self.fail(cpu, errno::INVALID);
                };
                let mut buf = vec![0u8; r2 as usize];
                match file.read(&mut buf) {
                    Ok(n) => {
                        for (i, b) in buf[..n].iter().enumerate() {
                            if let Err(f) =
                                mem.write_byte(r1.wrapping_add(i as u32), u32::from(*b))
                            {
                                return SysOutcome::Error(VmError::Fault(f));
                            }
                        }
                        cpu.regs.write(0, n as u32);
                    }
                    Err(_) => return self.fail(cpu, errno::IO),
                }
            }
            // WRITE(fd, buf, len).
            0x13 => {
                let mut bytes = Vec::with_capacity(r2 as usize);
                for i in 0..r2 {
                    match mem.read_byte(r1.wrapping_add(i)) {
                        Ok(b) => bytes.push(b as u8),
                        Err(f) => return SysOutcome::Error(VmError::Fault(f)),
                    }
                }
                match r0 {
                    1 => {
                        self.io.write_output(&bytes);
                        cpu.regs.write(0, r2);
                    }
                    2 => {
                        self.io.write_debug(&String::from_utf8_lossy(&bytes));
                        cpu.regs.write(0, r2);
                    }
                    fd => {
                        let cap = self.max_file_size;
                        let Some(file) = self.file_mut(fd) else {
                            return self.fail(cpu, errno::INVALID);
                        };
                        let at = file.stream_position().unwrap_or(0);
                        if at + u64::from(r2) > cap {
                            return self.fail(cpu, errno::TOO_LARGE);
                        }
                        match file.write_all(&bytes) {
                            Ok(()) => cpu.regs.write(0, r2),
                            Err(_) => return self.fail(cpu, errno::IO),
                        }
                    }
                }
            }
            // SEEK(fd, offset, whence).
            0x14 => {
                let Some(file) = self.file_mut(r0) else {
                    return self.fail(cpu, errno::INVALID);
                };
                let target = match r2 {
                    0 => SeekFrom::Start(u64::from(r1)),
                    1 => SeekFrom::Current(i64::from(r1 as i32)),
                    2 => SeekFrom::End(i64::from(r1 as i32)),
                    _ => return self.fail(cpu, errno::INVALID),
                };
                match file.seek(target) {
                    Ok(position) => cpu.regs.write(0, position as u32),
                    Err(_) => return self.fail(cpu, errno::IO),
                }
            }
            // TELL(fd).
            0x15 => {
                let Some(file) = self.file_mut(r0) else {
                    return self.fail(cpu, errno::INVALID);
                };
                match file.stream_position() {
                    Ok(position) => cpu.regs.write(0, position as u32),
                    Err(_) => return self.fail(cpu, errno::IO),
                }
            }
            // FILE_SIZE(fd).
            0x16 => {
                let Some(file) = self.file_mut(r0) else {
                    return self.fail(cpu, errno::INVALID);
                };
                match file.metadata() {
                    Ok(meta) => cpu.regs.write(0, meta.len() as u32),
                    Err(_) => return self.fail(cpu, errno::IO),
                }
            }
            _ => unreachable!("file range checked by caller"),
        }
        SysOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocates_frees_and_reuses() {
        let mut heap = Heap::default();
        heap.reset(0x2_0000, 0x1000);
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(32).unwrap();
        assert_ne!(a, b);
        assert!(heap.free(a));
        assert!(!heap.free(a), "double free is rejected");
        // The freed hole is reused for a fitting allocation.
        let c = heap.allocate(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.size_of(b), Some(32));
    }

    #[test]
    fn heap_exhaustion_returns_none() {
        let mut heap = Heap::default();
        heap.reset(0x2_0000, 64);
        assert!(heap.allocate(48).is_some());
        assert!(heap.allocate(48).is_none());
        assert!(heap.allocate(0).is_none());
    }

    #[test]
    fn sandbox_rejects_escapes() {
        let layer = SyscallLayer::new(
            Box::new(BufferIo::default()),
            Some(PathBuf::from("/sandbox/root")),
            1024,
            Vec::new(),
            Vec::new(),
        );
        assert!(layer.sandbox_path(b"ok.txt").is_ok());
        assert!(layer.sandbox_path(b"sub/dir/ok.txt").is_ok());
        // Absolute paths are re-rooted, not trusted.
        assert_eq!(
            layer.sandbox_path(b"/etc/passwd").unwrap(),
            PathBuf::from("/sandbox/root/etc/passwd")
        );
        assert_eq!(layer.sandbox_path(b"../escape"), Err(errno::PATH_ESCAPE));
        assert_eq!(layer.sandbox_path(b"a/../../escape"), Err(errno::PATH_ESCAPE));
        assert_eq!(layer.sandbox_path(b""), Err(errno::INVALID));
    }

    #[test]
    fn sandbox_disabled_without_root() {
        let layer = SyscallLayer::new(
            Box::new(BufferIo::default()),
            None,
            1024,
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(layer.sandbox_path(b"any.txt"), Err(errno::PATH_ESCAPE));
    }

    #[test]
    fn format_int_bases() {
        assert_eq!(SyscallLayer::format_int(255, 16).as_deref(), Some("FF"));
        assert_eq!(SyscallLayer::format_int(255, 2).as_deref(), Some("11111111"));
        assert_eq!(SyscallLayer::format_int(255, 8).as_deref(), Some("377"));
        assert_eq!(
            SyscallLayer::format_int(u32::MAX, 10).as_deref(),
            Some("-1"),
            "base 10 prints signed"
        );
        assert_eq!(SyscallLayer::format_int(1, 7), None);
    }
}
