//! Convenience wrappers around POSIX termios, used by the serial backend.

use super::{Error, Result};
use nix::sys::termios::Termios;
use std::os::unix::io::RawFd;

pub fn get_termios(fd: RawFd) -> Result<Termios> {
    nix::sys::termios::tcgetattr(fd).map_err(Error::from)
}

pub fn set_termios(fd: RawFd, termios: &Termios) -> Result<()> {
    nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, termios).map_err(Error::from)
}
