// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Control-message transport between two actors.
//!
//! A pipe is one half of a `socketpair(2)`; a control message travels as a
//! fixed-size record `{tag, payload}` where the payload is either null or a
//! heap pointer whose ownership moves with the record. Keeping the transport
//! a real stream socket means every actor can wait on it with the same
//! primitive it uses for its network and serial descriptors.

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

/// On-wire size of one control-message record.
pub const FRAME_LEN: usize = 12;

/// The fixed-size record exchanged over a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: u64,
}

impl Frame {
    pub fn new(tag: u32, payload: u64) -> Self {
        Self { tag, payload }
    }

    pub fn to_bytes(self) -> [u8; FRAME_LEN] {
        let mut bytes = [0; FRAME_LEN];
        bytes[..4].copy_from_slice(&self.tag.to_le_bytes());
        bytes[4..].copy_from_slice(&self.payload.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        let mut tag = [0; 4];
        let mut payload = [0; 8];
        tag.copy_from_slice(&bytes[..4]);
        payload.copy_from_slice(&bytes[4..]);

        Self {
            tag: u32::from_le_bytes(tag),
            payload: u64::from_le_bytes(payload),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("peer endpoint is gone: {0}")]
    PeerGone(#[from] io::Error),
    #[error("unknown control message tag {0}")]
    UnknownTag(u32),
    #[error("control message tag {0} is missing its payload")]
    NullPayload(u32),
}

/// Conversion between a typed control message and its on-wire [`Frame`].
///
/// # Safety
///
/// `decode` reconstitutes owned payloads from the raw pointer carried in the
/// frame. Implementations must only ever face frames produced by `encode` of
/// the same type; [`pair`] enforces this by typing the two endpoints.
pub unsafe trait Wire: Send + Sized {
    fn encode(self) -> Frame;
    fn decode(frame: Frame) -> Result<Self, PipeError>;
}

/// Moves a boxed payload into the pointer slot of a frame.
pub fn payload_from<T: Send>(boxed: Box<T>) -> u64 {
    Box::into_raw(boxed) as usize as u64
}

/// Reclaims a boxed payload from the pointer slot of a frame.
pub fn take_payload<T: Send>(frame: Frame) -> Result<Box<T>, PipeError> {
    if frame.payload == 0 {
        return Err(PipeError::NullPayload(frame.tag));
    }

    // SAFETY: the typed endpoints created by `pair` guarantee this frame was
    // encoded by the peer's `Wire` impl for the same message type, from a
    // pointer produced by `payload_from::<T>`.
    Ok(unsafe { Box::from_raw(frame.payload as usize as *mut T) })
}

/// One endpoint of a control-message pipe; sends `S`, receives `R`.
pub struct Pipe<S, R> {
    sock: UnixStream,
    _types: PhantomData<fn(S) -> R>,
}

/// Creates a connected pair of pipe endpoints.
///
/// The first endpoint (0) is handed to the spawned actor, the second (1)
/// stays with the creator.
pub fn pair<A: Wire, B: Wire>() -> io::Result<(Pipe<A, B>, Pipe<B, A>)> {
    let (sock0, sock1) = UnixStream::pair()?;

    Ok((
        Pipe {
            sock: sock0,
            _types: PhantomData,
        },
        Pipe {
            sock: sock1,
            _types: PhantomData,
        },
    ))
}

impl<S: Wire, R: Wire> Pipe<S, R> {
    /// Writes one record, retrying transient interruptions.
    ///
    /// A failure means the peer is gone; the message payload is reclaimed and
    /// dropped before the error is returned.
    pub fn send(&mut self, msg: S) -> Result<(), PipeError> {
        let frame = msg.encode();
        let bytes = frame.to_bytes();
        let mut written = 0;

        while written < FRAME_LEN {
            match self.sock.write(&bytes[written..]) {
                Ok(0) => {
                    reclaim::<S>(frame);
                    return Err(closed().into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    reclaim::<S>(frame);
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Reads one record, resuming short reads until it is whole.
    pub fn recv(&mut self) -> Result<R, PipeError> {
        let mut bytes = [0; FRAME_LEN];
        let mut filled = 0;

        while filled < FRAME_LEN {
            match self.sock.read(&mut bytes[filled..]) {
                Ok(0) => return Err(closed().into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        R::decode(Frame::from_bytes(bytes))
    }
}

impl<S, R> AsFd for Pipe<S, R> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl<S, R> AsRawFd for Pipe<S, R> {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// A pipe endpoint registered with the tokio reactor of the calling thread.
///
/// Methods take `&self` so one actor can receive from a forwarder task while
/// sending from elsewhere; concurrent senders are serialized so records stay
/// whole on the wire.
pub struct AsyncPipe<S, R> {
    io: AsyncFd<UnixStream>,
    send_lock: Mutex<()>,
    _types: PhantomData<fn(S) -> R>,
}

impl<S: Wire, R: Wire> AsyncPipe<S, R> {
    pub fn new(pipe: Pipe<S, R>) -> io::Result<Self> {
        pipe.sock.set_nonblocking(true)?;

        Ok(Self {
            io: AsyncFd::new(pipe.sock)?,
            send_lock: Mutex::new(()),
            _types: PhantomData,
        })
    }

    pub async fn send(&self, msg: S) -> Result<(), PipeError> {
        let _guard = self.send_lock.lock().await;

        let frame = msg.encode();
        let bytes = frame.to_bytes();
        let mut written = 0;

        while written < FRAME_LEN {
            let mut ready = match self.io.writable().await {
                Ok(ready) => ready,
                Err(e) => {
                    reclaim::<S>(frame);
                    return Err(e.into());
                }
            };

            match ready.try_io(|io| {
                let mut sock = io.get_ref();
                sock.write(&bytes[written..])
            }) {
                Ok(Ok(0)) => {
                    reclaim::<S>(frame);
                    return Err(closed().into());
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    reclaim::<S>(frame);
                    return Err(e.into());
                }
                Err(_would_block) => continue,
            }
        }

        Ok(())
    }

    pub async fn recv(&self) -> Result<R, PipeError> {
        let mut bytes = [0; FRAME_LEN];
        let mut filled = 0;

        while filled < FRAME_LEN {
            let mut ready = self.io.readable().await?;

            match ready.try_io(|io| {
                let mut sock = io.get_ref();
                sock.read(&mut bytes[filled..])
            }) {
                Ok(Ok(0)) => return Err(closed().into()),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }

        R::decode(Frame::from_bytes(bytes))
    }
}

/// Drops the payload a frame still owns after a failed send.
///
/// Safe because a record that never fully reached the socket can no longer be
/// decoded by the peer.
fn reclaim<T: Wire>(frame: Frame) {
    let _ = T::decode(frame);
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed")
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Probe {
        Empty,
        Text(String),
    }

    unsafe impl Wire for Probe {
        fn encode(self) -> Frame {
            match self {
                Probe::Empty => Frame::new(0, 0),
                Probe::Text(text) => Frame::new(1, payload_from(Box::new(text))),
            }
        }

        fn decode(frame: Frame) -> Result<Self, PipeError> {
            match frame.tag {
                0 => Ok(Probe::Empty),
                1 => Ok(Probe::Text(*take_payload(frame)?)),
                tag => Err(PipeError::UnknownTag(tag)),
            }
        }
    }

    #[test]
    fn frame_bytes_round_trip() {
        let frame = Frame::new(11, 0xdead_beef_cafe);
        assert_eq!(Frame::from_bytes(frame.to_bytes()), frame);

        let null = Frame::new(0, 0);
        assert_eq!(Frame::from_bytes(null.to_bytes()), null);
    }

    #[test]
    fn records_survive_the_pipe_intact() {
        let (mut actor_end, mut owner_end) = pair::<Probe, Probe>().unwrap();

        owner_end.send(Probe::Empty).unwrap();
        owner_end.send(Probe::Text("15550123".into())).unwrap();

        assert_eq!(actor_end.recv().unwrap(), Probe::Empty);
        assert_eq!(actor_end.recv().unwrap(), Probe::Text("15550123".into()));

        actor_end.send(Probe::Text("pong".into())).unwrap();
        assert_eq!(owner_end.recv().unwrap(), Probe::Text("pong".into()));
    }

    #[test]
    fn dropped_peer_is_reported_on_both_operations() {
        let (actor_end, mut owner_end) = pair::<Probe, Probe>().unwrap();
        drop(actor_end);

        assert!(matches!(
            owner_end.recv(),
            Err(PipeError::PeerGone(_))
        ));
        assert!(matches!(
            owner_end.send(Probe::Text("lost".into())),
            Err(PipeError::PeerGone(_))
        ));
    }

    #[tokio::test]
    async fn async_endpoint_interoperates_with_blocking_peer() {
        let (mut actor_end, owner_end) = pair::<Probe, Probe>().unwrap();
        let owner_end = AsyncPipe::new(owner_end).unwrap();

        let worker = std::thread::spawn(move || {
            let msg = actor_end.recv().unwrap();
            actor_end.send(msg).unwrap();
        });

        owner_end.send(Probe::Text("echo".into())).await.unwrap();
        assert_eq!(
            owner_end.recv().await.unwrap(),
            Probe::Text("echo".into())
        );

        worker.join().unwrap();
    }
}
