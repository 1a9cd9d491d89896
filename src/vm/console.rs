//! Host terminal handling for the guest serial console.
//!
//! The guest console is wired straight to this process's stdin/stdout, so the
//! host terminal must stop cooking input while a VM is attached. [`RawMode`]
//! switches the terminal and puts the previous attributes back when dropped.

use std::io::{self, IsTerminal};
use std::os::fd::AsFd;

use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use tracing::{debug, warn};

/// Raw-mode guard for standard input.
#[derive(Debug)]
pub struct RawMode {
    saved: Option<Termios>,
}

impl RawMode {
    /// Put stdin in raw mode. When stdin is not a terminal nothing is changed
    /// and the guard restores nothing.
    pub fn enable() -> io::Result<Self> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a terminal, leaving attributes alone");
            return Ok(Self { saved: None });
        }

        let saved = termios::tcgetattr(stdin.as_fd())
            .map_err(|e| io::Error::new(io::Error::from(e).kind(), format!("get terminal attributes: {e}")))?;

        let mut raw = saved.clone();
        make_raw(&mut raw);

        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
            .map_err(|e| io::Error::new(io::Error::from(e).kind(), format!("set terminal attributes: {e}")))?;
        debug!("put stdin in raw mode");
        Ok(Self { saved: Some(saved) })
    }

    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Put the saved attributes back now. Safe to call more than once.
    pub fn restore(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        match termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &saved) {
            Ok(()) => debug!("restored terminal attributes"),
            Err(e) => warn!(error = %e, "could not restore terminal attributes"),
        }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        self.restore();
    }
}

/// See `man termios`.
///
/// VMIN=1/VTIME=0: `read()` returns as soon as one byte is available and never
/// times out.
fn make_raw(t: &mut Termios) {
    t.input_flags.remove(InputFlags::ICRNL);
    t.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_without_terminal_is_a_no_op() {
        let mut guard = RawMode { saved: None };
        assert!(!guard.is_active());
        guard.restore();
        guard.restore();
    }

    #[test]
    fn make_raw_turns_off_line_editing_only() {
        use nix::libc;

        // SAFETY: termios is a plain C struct; all-zero is a valid value.
        let mut cooked: libc::termios = unsafe { std::mem::zeroed() };
        cooked.c_iflag = libc::ICRNL | libc::IXON;
        cooked.c_lflag = libc::ICANON | libc::ECHO | libc::ISIG;
        cooked.c_cc[libc::VMIN] = 0;
        cooked.c_cc[libc::VTIME] = 5;

        let mut t = Termios::from(cooked);
        make_raw(&mut t);

        assert!(!t.input_flags.contains(InputFlags::ICRNL));
        assert!(!t.local_flags.contains(LocalFlags::ICANON));
        assert!(!t.local_flags.contains(LocalFlags::ECHO));
        assert_eq!(t.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(t.control_chars[SpecialCharacterIndices::VTIME as usize], 0);

        // Everything else is left as it was.
        assert!(t.input_flags.contains(InputFlags::IXON));
        assert!(t.local_flags.contains(LocalFlags::ISIG));
    }
}
