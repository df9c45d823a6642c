// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use anyhow::{anyhow, Context, Result};
use rtp_rs::{RtpPacketBuilder, RtpReader, Seq};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

/// PCMU/8000, static RTP payload type 0.
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

pub const MAX_PACKET: usize = 1500;

/// Connected-mode RTP session towards the PBX media endpoint.
///
/// The timestamp is a per-session counter starting at zero and advanced by
/// the bytes sent; with 8 kHz PCMU one byte is one clock tick, so the serial
/// stream itself paces the session.
pub struct RtpSession {
    socket: UdpSocket,
    ssrc: u32,
    sequence: Seq,
    timestamp: u32,
    packet: Box<[u8; MAX_PACKET]>,
}

impl RtpSession {
    pub fn connect(remote: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .context("failed to bind local RTP socket")?;
        socket
            .connect(remote)
            .with_context(|| format!("failed to connect RTP socket to {remote}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to make RTP socket non-blocking")?;

        Ok(Self {
            socket,
            ssrc: rand::random(),
            sequence: Seq::from(rand::random::<u16>()),
            timestamp: 0,
            packet: Box::new([0; MAX_PACKET]),
        })
    }

    /// The OS-assigned local port, advertised in the SDP answer.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self
            .socket
            .local_addr()
            .context("failed to read local RTP address")?
            .port())
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Sends one packet and advances the session timestamp by its length.
    pub fn send_with_timestamp(&mut self, payload: &[u8]) -> Result<()> {
        let len = RtpPacketBuilder::new()
            .payload_type(PAYLOAD_TYPE_PCMU)
            .ssrc(self.ssrc)
            .sequence(self.sequence)
            .timestamp(self.timestamp)
            .payload(payload)
            .build_into(&mut self.packet[..])
            .map_err(|e| anyhow!("failed to build RTP packet: {e:?}"))?;

        self.socket
            .send(&self.packet[..len])
            .context("failed to send RTP packet")?;

        self.sequence = self.sequence.next();
        self.timestamp = self.timestamp.wrapping_add(payload.len() as u32);

        Ok(())
    }

    /// Receives one packet if available, yielding its PCMU payload.
    ///
    /// Malformed packets and foreign payload types are dropped.
    pub fn recv_payload<'a>(
        &self,
        buf: &'a mut [u8; MAX_PACKET],
    ) -> io::Result<Option<&'a [u8]>> {
        let len = match self.socket.recv(buf) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        };

        match RtpReader::new(&buf[..len]) {
            Ok(packet) if packet.payload_type() == PAYLOAD_TYPE_PCMU => Ok(Some(packet.payload())),
            Ok(packet) => {
                log::debug!("ignoring RTP packet with payload type {}", packet.payload_type());
                Ok(None)
            }
            Err(e) => {
                log::debug!("ignoring malformed RTP packet: {e:?}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timestamps_advance_by_bytes_sent() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let mut session =
            RtpSession::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, peer_port)).unwrap();

        session.send_with_timestamp(&[0u8; 160]).unwrap();
        session.send_with_timestamp(&[0u8; 120]).unwrap();
        session.send_with_timestamp(&[0u8; 160]).unwrap();

        let mut buf = [0u8; MAX_PACKET];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let len = peer.recv(&mut buf).unwrap();
            let packet = RtpReader::new(&buf[..len]).unwrap();
            assert_eq!(packet.payload_type(), PAYLOAD_TYPE_PCMU);
            seen.push((packet.timestamp(), packet.payload().len()));
        }

        let base = seen[0].0;
        assert_eq!(seen[0], (base, 160));
        assert_eq!(seen[1], (base.wrapping_add(160), 120));
        assert_eq!(seen[2], (base.wrapping_add(280), 160));
        assert_eq!(base, 0);
    }
}
