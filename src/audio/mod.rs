// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Per-call audio actor.
//!
//! Owns the RTP session and the modem's PCM serial port and shuttles PCMU
//! between them. The modem's flow-controlled serial dictates the uplink
//! pacing; no timer is involved.

pub mod rtp;
pub mod serial;

use crate::messages::{AudioCommand, AudioEvent};
use crate::pipe::{self, Pipe};
use crate::util::Flow;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rtp::RtpSession;
use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddrV4;
use std::os::fd::AsFd;
use std::thread::JoinHandle;

/// Bytes of PCM shuttled per serial tick; one 20 ms PCMU frame.
const SERIAL_CHUNK: usize = 160;
const SERIAL_READ_ATTEMPTS: usize = 10;

/// Starts an audio actor thread.
///
/// The creator keeps the returned pipe endpoint; the actor immediately
/// reports [`AudioEvent::Ready`] and then waits for [`AudioCommand::Init`].
pub fn spawn() -> Result<(Pipe<AudioCommand, AudioEvent>, JoinHandle<()>)> {
    let (actor_end, owner_end) = pipe::pair::<AudioEvent, AudioCommand>()
        .context("failed to create audio actor pipe")?;

    let thread = std::thread::Builder::new()
        .name("audio".into())
        .spawn(move || {
            AudioActor {
                pipe: actor_end,
                link: None,
            }
            .run()
        })
        .context("failed to spawn audio actor thread")?;

    Ok((owner_end, thread))
}

struct AudioLink {
    session: RtpSession,
    serial: File,
}

struct AudioActor {
    pipe: Pipe<AudioEvent, AudioCommand>,
    link: Option<AudioLink>,
}

impl AudioActor {
    fn run(mut self) {
        if let Err(e) = self.pipe.send(AudioEvent::Ready) {
            log::error!("audio actor failed to report readiness, {e:?}");
            return;
        }

        if let Err(e) = self.run_loop() {
            log::error!("audio actor terminating, {e:?}");
        }

        // teardown in reverse setup order
        if let Some(link) = self.link.take() {
            drop(link.session);
            drop(link.serial);
        }

        log::info!("audio actor exiting");
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let (control, serial, rtp) = self.poll_sources()?;

            if control {
                if let Flow::Exit = self.control_message()? {
                    return Ok(());
                }
            }

            if serial {
                self.serial_tick()?;
            }

            if rtp {
                self.rtp_tick()?;
            }
        }
    }

    /// One blocking wait over {control pipe, serial, RTP socket}.
    fn poll_sources(&self) -> Result<(bool, bool, bool)> {
        let mut fds = Vec::with_capacity(3);
        fds.push(PollFd::new(self.pipe.as_fd(), PollFlags::POLLIN));

        if let Some(link) = &self.link {
            fds.push(PollFd::new(link.serial.as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(link.session.socket().as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, false, false)),
            Err(e) => return Err(e).context("poll failed"),
        }

        let wants_read = |fd: &PollFd| {
            fd.revents()
                .map(|revents| {
                    revents.intersects(
                        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                    )
                })
                .unwrap_or(false)
        };

        Ok((
            wants_read(&fds[0]),
            fds.get(1).map(wants_read).unwrap_or(false),
            fds.get(2).map(wants_read).unwrap_or(false),
        ))
    }

    fn control_message(&mut self) -> Result<Flow> {
        let cmd = self
            .pipe
            .recv()
            .context("control pipe to the SIP actor failed")?;

        match cmd {
            AudioCommand::Init(connection) => {
                self.init(*connection)?;
                Ok(Flow::Continue)
            }
            AudioCommand::Exit => Ok(Flow::Exit),
        }
    }

    fn init(&mut self, connection: crate::sip::sdp::RtpConnection) -> Result<()> {
        log::info!(
            "bringing up audio towards {}:{}",
            connection.remote_addr,
            connection.remote_port
        );

        let session = RtpSession::connect(SocketAddrV4::new(
            connection.remote_addr,
            connection.remote_port,
        ))?;
        let serial = serial::open(&connection.serial_device)?;
        let local_port = session.local_port()?;

        self.link = Some(AudioLink { session, serial });

        self.pipe
            .send(AudioEvent::RtpOk(local_port))
            .context("failed to report RTP readiness")?;

        Ok(())
    }

    /// Uplink: bounded-retry read of one chunk, sent as one RTP packet.
    fn serial_tick(&mut self) -> Result<()> {
        let Some(link) = &mut self.link else {
            return Ok(());
        };

        let mut buf = [0u8; SERIAL_CHUNK];
        let mut filled = 0;
        let mut attempts = 0;

        while filled < SERIAL_CHUNK && attempts < SERIAL_READ_ATTEMPTS {
            attempts += 1;

            match link.serial.read(&mut buf[filled..]) {
                Ok(0) => bail!("serial device closed"),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("error reading from serial device"),
            }
        }

        if filled > 0 {
            link.session.send_with_timestamp(&buf[..filled])?;
        }

        Ok(())
    }

    /// Downlink: received PCMU payloads go straight to the serial port.
    ///
    /// A write that would block drops the payload; stalling the reactor on a
    /// flow-controlled port is worse than losing a 20 ms frame.
    fn rtp_tick(&mut self) -> Result<()> {
        let Some(link) = &mut self.link else {
            return Ok(());
        };

        let mut buf = [0u8; rtp::MAX_PACKET];

        while let Some(payload) = link.session.recv_payload(&mut buf)? {
            match link.serial.write(payload) {
                Ok(n) if n < payload.len() => {
                    log::debug!("short serial write, dropped {} bytes", payload.len() - n);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    log::debug!("serial not ready, dropped {} byte payload", payload.len());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("error writing to serial device"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
    use std::fs::File;
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::path::PathBuf;

    /// A PTY pair standing in for the modem's serial device.
    pub struct Pty {
        pub master: File,
        pub slave_path: PathBuf,
    }

    impl Pty {
        pub fn open() -> Self {
            let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
            grantpt(&master).unwrap();
            unlockpt(&master).unwrap();

            let slave_path = PathBuf::from(ptsname_r(&master).unwrap());
            let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

            Pty { master, slave_path }
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::Pty;
    use super::*;
    use crate::sip::sdp::{CallDirection, RtpConnection};
    use rtp_rs::{RtpPacketBuilder, RtpReader, Seq};
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;

    fn read_from_master(master: &mut File, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, PollTimeout::from(5000u16)).unwrap();
            assert!(ready > 0, "timed out waiting for downlink audio");

            filled += master.read(&mut out[filled..]).unwrap();
        }

        out
    }

    #[test]
    fn shuttles_pcm_between_serial_and_rtp() {
        let pty = Pty::open();
        let mut master = pty.master;

        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let (mut pipe, thread) = spawn().unwrap();
        assert_eq!(pipe.recv().unwrap(), AudioEvent::Ready);

        let connection = RtpConnection {
            remote_addr: Ipv4Addr::LOCALHOST,
            remote_port: peer.local_addr().unwrap().port(),
            serial_device: pty.slave_path.clone(),
            direction: CallDirection::Incoming,
        };
        pipe.send(AudioCommand::Init(Box::new(connection))).unwrap();

        let AudioEvent::RtpOk(local_port) = pipe.recv().unwrap() else {
            panic!("expected RTP readiness");
        };

        // uplink: PCM written to the "modem" comes out as one RTP packet
        let pcm = [0x55u8; 160];
        master.write_all(&pcm).unwrap();

        let mut packet = [0u8; rtp::MAX_PACKET];
        let len = peer.recv(&mut packet).unwrap();
        let parsed = RtpReader::new(&packet[..len]).unwrap();
        assert_eq!(parsed.payload_type(), rtp::PAYLOAD_TYPE_PCMU);
        assert_eq!(parsed.timestamp(), 0);
        assert_eq!(parsed.payload(), &pcm[..]);

        master.write_all(&pcm).unwrap();
        let len = peer.recv(&mut packet).unwrap();
        let parsed = RtpReader::new(&packet[..len]).unwrap();
        assert_eq!(parsed.timestamp(), 160);

        // downlink: an RTP packet from the PBX lands on the serial port
        let mut downlink = [0u8; rtp::MAX_PACKET];
        let len = RtpPacketBuilder::new()
            .payload_type(rtp::PAYLOAD_TYPE_PCMU)
            .sequence(Seq::from(7u16))
            .timestamp(1234)
            .payload(&[0x2au8; 160])
            .build_into(&mut downlink)
            .unwrap();
        peer.send_to(&downlink[..len], (Ipv4Addr::LOCALHOST, local_port))
            .unwrap();

        assert_eq!(read_from_master(&mut master, 160), vec![0x2a; 160]);

        pipe.send(AudioCommand::Exit).unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn exits_when_the_sip_actor_drops_the_pipe() {
        let (pipe, thread) = spawn().unwrap();
        drop(pipe);

        thread.join().unwrap();
    }
}
