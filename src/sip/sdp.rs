// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use bytesstr::BytesStr;
use sdp_types::attributes::direction::Direction;
use sdp_types::attributes::ice;
use sdp_types::attributes::rtpmap::RtpMap;
use sdp_types::connection::Connection;
use sdp_types::media::{MediaDescription, MediaType, TransportProtocol};
use sdp_types::msg::{MediaScope, Message};
use sdp_types::origin::Origin;
use sdp_types::time::Time;
use sdp_types::TaggedAddress;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// PCMU/8000, static RTP payload type 0. The only codec the modem speaks.
pub const PCMU_PAYLOAD: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Remote RTP endpoint negotiated from an SDP offer, plus the serial device
/// that carries the cellular leg's PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpConnection {
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub serial_device: PathBuf,
    pub direction: CallDirection,
}

#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("SDP offer is not valid UTF-8")]
    Encoding,
    #[error("SDP offer does not parse")]
    Parse,
    #[error("no audio media offering PCMU/8000")]
    NoPcmuAudio,
    #[error("no usable IN IP4 connection address")]
    Connection,
    #[error("unusable RTP port {0}")]
    Port(u16),
}

/// Validates a remote SDP offer and extracts the PCMU RTP target.
///
/// The accepted media section must list payload 0 with an explicit
/// `a=rtpmap:0 PCMU/8000`, carry (or inherit) an `IN IP4` literal connection
/// address, and use a nonzero even RTP port.
pub fn parse_offer(offer: bytes::Bytes, serial_device: &Path) -> Result<RtpConnection, OfferError> {
    let offer = BytesStr::from_utf8_bytes(offer).map_err(|_| OfferError::Encoding)?;
    let msg =
        sdp_types::msg::parse::<sdp_types::msg::Builder>(&offer).map_err(|_| OfferError::Parse)?;

    let scope = msg
        .media_scopes
        .iter()
        .find(|scope| {
            scope.desc.media_type == MediaType::Audio
                && scope.desc.fmts.contains(&PCMU_PAYLOAD)
                && scope.rtpmaps.iter().any(|rtpmap| {
                    rtpmap.payload == PCMU_PAYLOAD
                        && rtpmap.encoding.eq_ignore_ascii_case("PCMU")
                        && rtpmap.clock_rate == 8000
                })
        })
        .ok_or(OfferError::NoPcmuAudio)?;

    let connection = scope
        .connection
        .as_ref()
        .or(msg.connection.as_ref())
        .ok_or(OfferError::Connection)?;

    let remote_addr = match &connection.address {
        TaggedAddress::IP4(addr) => *addr,
        _ => return Err(OfferError::Connection),
    };

    let remote_port = scope.desc.port;
    if remote_port == 0 || remote_port % 2 != 0 || remote_port > 65534 {
        return Err(OfferError::Port(remote_port));
    }

    Ok(RtpConnection {
        remote_addr,
        remote_port,
        serial_device: serial_device.to_path_buf(),
        direction: CallDirection::Incoming,
    })
}

/// Builds the early-media SDP answer advertising our local PCMU port.
pub fn build_answer(local_ip: Ipv4Addr, rtp_port: u16) -> String {
    let session_id: u32 = rand::random();
    let session_version: u32 = rand::random();

    let answer = Message {
        name: BytesStr::from_static("DongleCall"),
        origin: Origin {
            username: BytesStr::from_static("airvoice"),
            session_id: session_id.to_string().into(),
            session_version: session_version.to_string().into(),
            address: IpAddr::V4(local_ip).into(),
        },
        time: Time { start: 0, stop: 0 },
        direction: Direction::SendRecv,
        connection: Some(Connection {
            address: IpAddr::V4(local_ip).into(),
            ttl: None,
            num: None,
        }),
        bandwidth: vec![],
        ice_options: ice::Options::default(),
        ice_lite: false,
        ice_ufrag: None,
        ice_pwd: None,
        attributes: vec![],
        media_scopes: vec![MediaScope {
            desc: MediaDescription {
                media_type: MediaType::Audio,
                port: rtp_port,
                ports_num: None,
                proto: TransportProtocol::RtpAvp,
                fmts: vec![PCMU_PAYLOAD],
            },
            direction: Direction::SendRecv,
            connection: None,
            bandwidth: vec![],
            rtcp_attr: None,
            rtpmaps: vec![RtpMap {
                payload: PCMU_PAYLOAD,
                encoding: "PCMU".into(),
                clock_rate: 8000,
                params: None,
            }],
            fmtps: vec![],
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: vec![],
            ice_end_of_candidates: false,
            attributes: vec![],
        }],
    };

    answer.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    const SERIAL: &str = "/dev/ttyUSB1";

    fn offer(body: &str) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(body.as_bytes())
    }

    const VALID_OFFER: &str = "v=0\r\n\
        o=pbx 1778 1777 IN IP4 192.0.2.9\r\n\
        s=call\r\n\
        c=IN IP4 192.0.2.9\r\n\
        t=0 0\r\n\
        m=audio 20000 RTP/AVP 0 8\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n";

    #[test]
    fn accepts_pcmu_offer() {
        let connection = parse_offer(offer(VALID_OFFER), Path::new(SERIAL)).unwrap();

        assert_eq!(connection.remote_addr, Ipv4Addr::new(192, 0, 2, 9));
        assert_eq!(connection.remote_port, 20000);
        assert_eq!(connection.serial_device, PathBuf::from(SERIAL));
        assert_eq!(connection.direction, CallDirection::Incoming);
    }

    #[test]
    fn accepts_media_level_connection() {
        let body = "v=0\r\n\
            o=pbx 1 2 IN IP4 198.51.100.7\r\n\
            s=call\r\n\
            t=0 0\r\n\
            m=audio 40202 RTP/AVP 0\r\n\
            c=IN IP4 198.51.100.7\r\n\
            a=rtpmap:0 PCMU/8000\r\n";

        let connection = parse_offer(offer(body), Path::new(SERIAL)).unwrap();
        assert_eq!(connection.remote_addr, Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(connection.remote_port, 40202);
    }

    #[test]
    fn rejects_offer_without_pcmu() {
        let body = "v=0\r\n\
            o=pbx 1 2 IN IP4 192.0.2.9\r\n\
            s=call\r\n\
            c=IN IP4 192.0.2.9\r\n\
            t=0 0\r\n\
            m=audio 20000 RTP/AVP 8\r\n\
            a=rtpmap:8 PCMA/8000\r\n";

        assert!(matches!(
            parse_offer(offer(body), Path::new(SERIAL)),
            Err(OfferError::NoPcmuAudio)
        ));
    }

    #[test]
    fn rejects_odd_and_zero_ports() {
        for port in ["20001", "0"] {
            let body = format!(
                "v=0\r\n\
                o=pbx 1 2 IN IP4 192.0.2.9\r\n\
                s=call\r\n\
                c=IN IP4 192.0.2.9\r\n\
                t=0 0\r\n\
                m=audio {port} RTP/AVP 0\r\n\
                a=rtpmap:0 PCMU/8000\r\n"
            );

            assert!(matches!(
                parse_offer(offer(&body), Path::new(SERIAL)),
                Err(OfferError::Port(_))
            ));
        }
    }

    #[test]
    fn rejects_missing_connection() {
        let body = "v=0\r\n\
            o=pbx 1 2 IN IP4 192.0.2.9\r\n\
            s=call\r\n\
            t=0 0\r\n\
            m=audio 20000 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n";

        assert!(matches!(
            parse_offer(offer(body), Path::new(SERIAL)),
            Err(OfferError::Connection)
        ));
    }

    #[test]
    fn answer_carries_the_negotiated_port() {
        let answer = build_answer(Ipv4Addr::new(192, 0, 2, 10), 40002);

        assert!(answer.contains("o=airvoice "));
        assert!(answer.contains("s=DongleCall"));
        assert!(answer.contains("c=IN IP4 192.0.2.10"));
        assert!(answer.contains("m=audio 40002 RTP/AVP 0"));
        assert!(answer.contains("a=rtpmap:0 PCMU/8000"));
    }

    #[test]
    fn answer_reemits_identically_after_a_parse_round_trip() {
        let answer = build_answer(Ipv4Addr::new(192, 0, 2, 10), 40002);

        let parsed =
            sdp_types::msg::parse::<sdp_types::msg::Builder>(&BytesStr::from(answer.as_str()))
                .unwrap();

        assert_eq!(parsed.to_string(), answer);
    }
}
