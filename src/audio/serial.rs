// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use anyhow::{bail, Context, Result};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Opens and configures the modem's PCM serial endpoint.
///
/// 115200 8N1 with hardware flow control, raw I/O, `VMIN=1`/`VTIME=0`. The
/// descriptor is non-blocking and close-on-exec; the caller polls it.
pub fn open(device: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(device)
        .with_context(|| format!("unable to open {}", device.display()))?;

    if unsafe { libc::isatty(file.as_raw_fd()) } == 0 {
        bail!("{} does not look like a serial port", device.display());
    }

    let mut attrs = termios::tcgetattr(&file)
        .with_context(|| format!("failed to get terminal attributes for {}", device.display()))?;

    attrs.control_flags = ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CRTSCTS;
    attrs.input_flags = InputFlags::empty();
    attrs.output_flags = OutputFlags::empty();
    attrs.local_flags = LocalFlags::empty();

    // deliver data as soon as a single byte is there
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::cfsetispeed(&mut attrs, BaudRate::B115200)?;
    termios::cfsetospeed(&mut attrs, BaudRate::B115200)?;

    termios::tcsetattr(&file, SetArg::TCSAFLUSH, &attrs)
        .with_context(|| format!("failed to set terminal attributes for {}", device.display()))?;

    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::test_support::Pty;

    #[test]
    fn configures_a_pty_slave() {
        let pty = Pty::open();

        let serial = open(&pty.slave_path).unwrap();

        let attrs = termios::tcgetattr(&serial).unwrap();
        assert!(attrs.control_flags.contains(ControlFlags::CS8));
        assert!(attrs.control_flags.contains(ControlFlags::CREAD));
        assert!(attrs.local_flags.is_empty());
        assert_eq!(
            attrs.control_chars[SpecialCharacterIndices::VMIN as usize],
            1
        );
    }

    #[test]
    fn refuses_a_plain_file() {
        let path = std::env::temp_dir().join(format!("airvoice-not-a-tty-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        assert!(open(&path).is_err());

        let _ = std::fs::remove_file(&path);
    }
}
