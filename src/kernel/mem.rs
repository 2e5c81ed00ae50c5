//! Word-at-a-time tracee memory access.
//!
//! Reads a NUL-terminated string word by word via `PTRACE_PEEKDATA`, and
//! writes the mirror-image `PTRACE_POKEDATA` loop using `byteorder` to
//! pack/unpack words. Only the generic "read until we find the
//! terminator" / "write this many bytes" primitives live here — anything
//! path-specific (allocating scratch space in the tracee's heap) belongs
//! to the out-of-scope syscall-argument decoder and is not reproduced here.

use std::mem::size_of;

use byteorder::{ByteOrder, NativeEndian};
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::errors::{Result, TracerError};

const WORD_SIZE: usize = size_of::<usize>();

/// Reads a single machine word from `addr` in `pid`'s address space.
fn peek_word(pid: Pid, addr: usize) -> Result<[u8; WORD_SIZE]> {
    let word = ptrace::read(pid, addr as ptrace::AddressType)
        .map_err(|e| TracerError::system("ptrace peekdata", e))?;
    let mut buf = [0u8; WORD_SIZE];
    NativeEndian::write_uint(&mut buf, word as u64 & u64::MAX, WORD_SIZE);
    Ok(buf)
}

/// Writes a single machine word to `addr` in `pid`'s address space.
fn poke_word(pid: Pid, addr: usize, word: [u8; WORD_SIZE]) -> Result<()> {
    let value = NativeEndian::read_uint(&word, WORD_SIZE) as i64;
    unsafe {
        ptrace::write(
            pid,
            addr as ptrace::AddressType,
            value as *mut std::ffi::c_void,
        )
    }
    .map_err(|e| TracerError::system("ptrace pokedata", e))
}

/// Reads a NUL-terminated byte string starting at `addr`, one word at a
/// time, stopping at (and excluding) the first NUL byte. Bounded by
/// `max_len` to guard against a corrupt/adversarial tracee never supplying
/// a terminator.
pub fn read_cstring(pid: Pid, addr: usize, max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = addr;
    while out.len() < max_len {
        let word = peek_word(pid, cursor)?;
        for byte in word {
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
            if out.len() >= max_len {
                break;
            }
        }
        cursor += WORD_SIZE;
    }
    Ok(out)
}

/// Reads a NUL-terminated array of pointers (as `execve`'s `argv`/`envp` are
/// laid out), resolving each pointer to its string, stopping at the first
/// NULL pointer.
pub fn read_cstring_array(
    pid: Pid,
    addr: usize,
    max_entries: usize,
    max_entry_len: usize,
) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut cursor = addr;
    while out.len() < max_entries {
        let word = peek_word(pid, cursor)?;
        let ptr = NativeEndian::read_uint(&word, WORD_SIZE) as usize;
        if ptr == 0 {
            break;
        }
        out.push(read_cstring(pid, ptr, max_entry_len)?);
        cursor += WORD_SIZE;
    }
    Ok(out)
}

/// Writes `data` into the tracee's memory at `addr`, padding the final
/// partial word with the byte already present there so we never clobber
/// memory past the end of `data`.
pub fn write_words(pid: Pid, addr: usize, data: &[u8]) -> Result<()> {
    let mut cursor = addr;
    let mut chunks = data.chunks(WORD_SIZE);
    for chunk in &mut chunks {
        let mut word = peek_word(pid, cursor)?;
        word[..chunk.len()].copy_from_slice(chunk);
        poke_word(pid, cursor, word)?;
        cursor += WORD_SIZE;
    }
    Ok(())
}
