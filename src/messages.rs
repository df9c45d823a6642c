// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Control messages exchanged over the actor pipes.
//!
//! Tag values are the wire ABI between the actors; each pipe has its own tag
//! namespace.

use crate::pipe::{payload_from, take_payload, Frame, PipeError, Wire};
use crate::settings::ModemConfig;
use crate::sip::sdp::RtpConnection;

const SIP_CMD_EXIT: u32 = 0;
const SIP_CMD_REGISTER: u32 = 1;
const SIP_CMD_CALL_IN_PROGRESS: u32 = 2;
const SIP_CMD_CALL_TERMINATED: u32 = 3;

const SIP_EVENT_READY: u32 = 10;
const SIP_EVENT_INCOMING_CALL: u32 = 11;
const SIP_EVENT_CALL_ENDED: u32 = 12;

const CMD_AUDIO_INIT: u32 = 0;
const CMD_AUDIO_EXIT: u32 = 1;

const AUDIO_EVENT_READY: u32 = 0;
const AUDIO_EVENT_RTP_OK: u32 = 1;

/// Main thread → SIP actor.
#[derive(Debug, PartialEq)]
pub enum SipCommand {
    Exit,
    Register(Box<ModemConfig>),
    /// The cellular leg was placed successfully; payload is its bus path.
    CallInProgress(String),
    /// A tracked cellular call reached its terminated state.
    CallTerminated(String),
}

unsafe impl Wire for SipCommand {
    fn encode(self) -> Frame {
        match self {
            SipCommand::Exit => Frame::new(SIP_CMD_EXIT, 0),
            SipCommand::Register(config) => {
                Frame::new(SIP_CMD_REGISTER, payload_from(config))
            }
            SipCommand::CallInProgress(path) => {
                Frame::new(SIP_CMD_CALL_IN_PROGRESS, payload_from(Box::new(path)))
            }
            SipCommand::CallTerminated(path) => {
                Frame::new(SIP_CMD_CALL_TERMINATED, payload_from(Box::new(path)))
            }
        }
    }

    fn decode(frame: Frame) -> Result<Self, PipeError> {
        match frame.tag {
            SIP_CMD_EXIT => Ok(SipCommand::Exit),
            SIP_CMD_REGISTER => Ok(SipCommand::Register(take_payload(frame)?)),
            SIP_CMD_CALL_IN_PROGRESS => {
                Ok(SipCommand::CallInProgress(*take_payload(frame)?))
            }
            SIP_CMD_CALL_TERMINATED => {
                Ok(SipCommand::CallTerminated(*take_payload(frame)?))
            }
            tag => Err(PipeError::UnknownTag(tag)),
        }
    }
}

/// SIP actor → main thread.
#[derive(Debug, PartialEq)]
pub enum SipEvent {
    Ready,
    /// An accepted INVITE wants a cellular call to this (normalized) number.
    IncomingCall(String),
    /// The SIP leg ended while this cellular call was still up.
    CallEnded(String),
}

unsafe impl Wire for SipEvent {
    fn encode(self) -> Frame {
        match self {
            SipEvent::Ready => Frame::new(SIP_EVENT_READY, 0),
            SipEvent::IncomingCall(number) => {
                Frame::new(SIP_EVENT_INCOMING_CALL, payload_from(Box::new(number)))
            }
            SipEvent::CallEnded(path) => {
                Frame::new(SIP_EVENT_CALL_ENDED, payload_from(Box::new(path)))
            }
        }
    }

    fn decode(frame: Frame) -> Result<Self, PipeError> {
        match frame.tag {
            SIP_EVENT_READY => Ok(SipEvent::Ready),
            SIP_EVENT_INCOMING_CALL => Ok(SipEvent::IncomingCall(*take_payload(frame)?)),
            SIP_EVENT_CALL_ENDED => Ok(SipEvent::CallEnded(*take_payload(frame)?)),
            tag => Err(PipeError::UnknownTag(tag)),
        }
    }
}

/// SIP actor → audio actor.
#[derive(Debug, PartialEq)]
pub enum AudioCommand {
    Init(Box<RtpConnection>),
    Exit,
}

unsafe impl Wire for AudioCommand {
    fn encode(self) -> Frame {
        match self {
            AudioCommand::Init(connection) => {
                Frame::new(CMD_AUDIO_INIT, payload_from(connection))
            }
            AudioCommand::Exit => Frame::new(CMD_AUDIO_EXIT, 0),
        }
    }

    fn decode(frame: Frame) -> Result<Self, PipeError> {
        match frame.tag {
            CMD_AUDIO_INIT => Ok(AudioCommand::Init(take_payload(frame)?)),
            CMD_AUDIO_EXIT => Ok(AudioCommand::Exit),
            tag => Err(PipeError::UnknownTag(tag)),
        }
    }
}

/// Audio actor → SIP actor.
#[derive(Debug, PartialEq)]
pub enum AudioEvent {
    Ready,
    /// RTP and serial are up; payload is the OS-assigned local RTP port.
    RtpOk(u16),
}

unsafe impl Wire for AudioEvent {
    fn encode(self) -> Frame {
        match self {
            AudioEvent::Ready => Frame::new(AUDIO_EVENT_READY, 0),
            AudioEvent::RtpOk(port) => {
                Frame::new(AUDIO_EVENT_RTP_OK, payload_from(Box::new(port)))
            }
        }
    }

    fn decode(frame: Frame) -> Result<Self, PipeError> {
        match frame.tag {
            AUDIO_EVENT_READY => Ok(AudioEvent::Ready),
            AUDIO_EVENT_RTP_OK => Ok(AudioEvent::RtpOk(*take_payload(frame)?)),
            tag => Err(PipeError::UnknownTag(tag)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipe::pair;
    use crate::sip::sdp::CallDirection;
    use std::net::Ipv4Addr;

    #[test]
    fn tag_values_are_the_documented_abi() {
        assert_eq!(SipCommand::Exit.encode().tag, 0);
        assert_eq!(
            SipCommand::CallInProgress("/org/freedesktop/ModemManager1/Call/0".into())
                .encode()
                .tag,
            2
        );
        assert_eq!(SipEvent::Ready.encode().tag, 10);
        assert_eq!(SipEvent::IncomingCall("15550123".into()).encode().tag, 11);
        assert_eq!(AudioCommand::Exit.encode().tag, 1);
        assert_eq!(AudioEvent::Ready.encode().tag, 0);
        assert_eq!(AudioEvent::RtpOk(20000).encode().tag, 1);
    }

    #[test]
    fn empty_and_loaded_records_round_trip() {
        let (mut sip_end, mut main_end) = pair::<SipEvent, SipCommand>().unwrap();

        main_end.send(SipCommand::Exit).unwrap();
        main_end
            .send(SipCommand::CallInProgress("/mm/Call/3".into()))
            .unwrap();

        assert_eq!(sip_end.recv().unwrap(), SipCommand::Exit);
        assert_eq!(
            sip_end.recv().unwrap(),
            SipCommand::CallInProgress("/mm/Call/3".into())
        );

        sip_end.send(SipEvent::IncomingCall("15550123".into())).unwrap();
        assert_eq!(
            main_end.recv().unwrap(),
            SipEvent::IncomingCall("15550123".into())
        );
    }

    #[test]
    fn audio_messages_round_trip() {
        let (mut audio_end, mut sip_end) = pair::<AudioEvent, AudioCommand>().unwrap();

        let connection = RtpConnection {
            remote_addr: Ipv4Addr::new(192, 0, 2, 9),
            remote_port: 20000,
            serial_device: "/dev/ttyUSB2".into(),
            direction: CallDirection::Incoming,
        };

        sip_end
            .send(AudioCommand::Init(Box::new(connection.clone())))
            .unwrap();
        assert_eq!(
            audio_end.recv().unwrap(),
            AudioCommand::Init(Box::new(connection))
        );

        audio_end.send(AudioEvent::RtpOk(40002)).unwrap();
        assert_eq!(sip_end.recv().unwrap(), AudioEvent::RtpOk(40002));
    }
}
