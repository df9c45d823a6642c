// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Per-modem SIP actor.
//!
//! Runs on its own OS thread and parks in a single wait over its four
//! sources: the control pipe from the main thread, stack events, the
//! registration refresh timer, and the audio actor's pipe. Owns the SIP
//! stack, the registration and the at-most-one current call.

pub mod sdp;
mod stack;

use crate::audio;
use crate::messages::{AudioCommand, AudioEvent, SipCommand, SipEvent};
use crate::pipe::{self, AsyncPipe, Pipe, PipeError};
use crate::settings::ModemConfig;
use crate::util::Flow;
use anyhow::{Context, Result};
use sip_types::header::typed::Contact;
use stack::{HeldInvite, Registrar, Stack, StackEvent};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// SIP signalling port; all IPv4 interfaces.
pub const SIP_PORT: u16 = 5556;

/// Cadence for re-attempting a registration that has not succeeded yet.
const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct SipActorHandle {
    pub pipe: Arc<AsyncPipe<SipCommand, SipEvent>>,
    thread: JoinHandle<()>,
}

impl SipActorHandle {
    /// Joins the actor thread; send [`SipCommand::Exit`] first.
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("SIP actor thread panicked");
        }
    }
}

/// Starts a SIP actor thread listening on the given port.
pub fn spawn(port: u16) -> Result<SipActorHandle> {
    let (actor_end, owner_end) =
        pipe::pair::<SipEvent, SipCommand>().context("failed to create SIP actor pipe")?;

    let thread = std::thread::Builder::new()
        .name("sip".into())
        .spawn(move || run_thread(actor_end, port))
        .context("failed to spawn SIP actor thread")?;

    Ok(SipActorHandle {
        pipe: Arc::new(AsyncPipe::new(owner_end).context("failed to register SIP actor pipe")?),
        thread,
    })
}

fn run_thread(pipe: Pipe<SipEvent, SipCommand>, port: u16) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to build SIP actor runtime, {e:?}");
            return;
        }
    };

    runtime.block_on(async move {
        let actor = match SipActor::setup(pipe, port).await {
            Ok(actor) => actor,
            Err(e) => {
                log::error!("failed to set up SIP stack, {e:?}");
                return;
            }
        };

        actor.run().await;
    });
}

struct RegistrarState {
    registrar: Registrar,
    contact: Contact,
    config: ModemConfig,
    registered: bool,
}

/// Everything belonging to the one in-flight call. Either all of it exists
/// or none of it does.
struct CurrentCall {
    invite: HeldInvite,
    connection: sdp::RtpConnection,
    dest_number: Option<String>,
    cellular_path: Option<String>,
    local_rtp_port: Option<u16>,
    audio_pipe: AsyncPipe<AudioCommand, AudioEvent>,
    audio_thread: JoinHandle<()>,
}

struct SipActor {
    control: AsyncPipe<SipEvent, SipCommand>,
    stack: Stack,
    stack_events: mpsc::UnboundedReceiver<StackEvent>,
    registrar: Option<RegistrarState>,
    call: Option<CurrentCall>,
}

impl SipActor {
    async fn setup(pipe: Pipe<SipEvent, SipCommand>, port: u16) -> Result<Self> {
        let control = AsyncPipe::new(pipe).context("failed to register control pipe")?;
        let (stack, stack_events) = Stack::bind(port).await?;

        Ok(Self {
            control,
            stack,
            stack_events,
            registrar: None,
            call: None,
        })
    }

    async fn run(mut self) {
        if self.control.send(SipEvent::Ready).await.is_err() {
            log::error!("SIP actor failed to report readiness");
            return;
        }

        loop {
            let step = tokio::select! {
                cmd = self.control.recv() => self.control_message(cmd).await,
                Some(event) = self.stack_events.recv() => self.stack_event(event).await,
                _ = registration_due(&mut self.registrar) => self.refresh_registration().await,
                event = audio_message(&self.call) => self.audio_event(event).await,
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) => {
                    log::error!("SIP actor terminating, {e:?}");
                    break;
                }
            }
        }

        self.shutdown().await;
        log::info!("SIP actor exiting");
    }

    async fn control_message(&mut self, cmd: Result<SipCommand, PipeError>) -> Result<Flow> {
        match cmd.context("control pipe to the main thread failed")? {
            SipCommand::Exit => Ok(Flow::Exit),
            SipCommand::Register(config) => {
                self.configure(*config).await;
                Ok(Flow::Continue)
            }
            SipCommand::CallInProgress(path) => self.call_in_progress(path).await,
            SipCommand::CallTerminated(path) => {
                self.cellular_terminated(path).await;
                Ok(Flow::Continue)
            }
        }
    }

    /// `SIP_CMD_REGISTER`: validate the configuration, install credentials
    /// and send the initial REGISTER.
    async fn configure(&mut self, config: ModemConfig) {
        if !config.is_complete() {
            log::error!("refusing SIP registration with incomplete configuration");
            return;
        }

        if self.registrar.is_some() {
            log::warn!("already configured, ignoring new registration request");
            return;
        }

        let (mut registrar, contact) = match self.stack.setup_registration(&config).await {
            Ok(prepared) => prepared,
            Err(e) => {
                log::error!("failed to prepare SIP registration, {e:?}");
                return;
            }
        };

        let registered = match self.stack.register(&mut registrar, false).await {
            Ok(()) => {
                log::info!("SIP registration successful");
                true
            }
            Err(e) => {
                log::error!("SIP registration failure, {e:?}");
                false
            }
        };

        self.registrar = Some(RegistrarState {
            registrar,
            contact,
            config,
            registered,
        });
    }

    /// Timer arm: refresh the binding (or retry a failed registration).
    async fn refresh_registration(&mut self) -> Result<Flow> {
        let Some(state) = &mut self.registrar else {
            return Ok(Flow::Continue);
        };

        match self.stack.register(&mut state.registrar, false).await {
            Ok(()) => {
                if !state.registered {
                    log::info!("SIP registration successful");
                }
                state.registered = true;
            }
            Err(e) => log::error!("SIP registration failure, {e:?}"),
        }

        Ok(Flow::Continue)
    }

    async fn stack_event(&mut self, event: StackEvent) -> Result<Flow> {
        match event {
            StackEvent::Invite(invite) => self.call_stage0(invite).await,
            StackEvent::CallTerminated { method } => {
                log::info!("call termination event ({method})");
                self.call_end(true).await;
            }
        }

        Ok(Flow::Continue)
    }

    /// Stage 0: vet the INVITE, parse its SDP and spawn the audio actor.
    async fn call_stage0(&mut self, invite: sip_core::IncomingRequest) {
        let Some(registrar) = &self.registrar else {
            log::warn!("dropping INVITE, no registration configured");
            return;
        };

        if self.call.is_some() {
            log::error!("only one incoming call is supported at a time");
            return;
        }

        let Some(from_user) = stack::from_user(&invite) else {
            log::error!("INVITE without a usable From user");
            return;
        };

        if &*from_user != registrar.config.username {
            log::error!("INVITE from unexpected user");
            return;
        }

        let dest_number = stack::request_uri_user(&invite).map(|user| user.to_string());

        let connection = match sdp::parse_offer(invite.body.clone(), &registrar.config.audio_port)
        {
            Ok(connection) => connection,
            Err(e) => {
                log::error!("rejecting INVITE, {e}");
                return;
            }
        };

        log::info!(
            "incoming SIP call, remote RTP at {}:{}",
            connection.remote_addr,
            connection.remote_port
        );

        let contact = registrar.contact.clone();

        let invite = match self.stack.accept_invite(contact, invite).await {
            Ok(invite) => invite,
            Err(e) => {
                log::error!("failed to accept INVITE, {e:?}");
                return;
            }
        };

        let (audio_pipe, audio_thread) = match audio::spawn() {
            Ok(audio) => audio,
            Err(e) => {
                log::error!("failed to spawn audio actor, {e:?}");
                self.stack.decline(invite).await;
                return;
            }
        };

        let audio_pipe = match AsyncPipe::new(audio_pipe) {
            Ok(audio_pipe) => audio_pipe,
            Err(e) => {
                log::error!("failed to register audio actor pipe, {e:?}");
                self.stack.decline(invite).await;
                return;
            }
        };

        self.stack.watch_call(Some(invite.call_id.clone()));

        self.call = Some(CurrentCall {
            invite,
            connection,
            dest_number,
            cellular_path: None,
            local_rtp_port: None,
            audio_pipe,
            audio_thread,
        });
    }

    async fn audio_event(&mut self, event: Result<AudioEvent, PipeError>) -> Result<Flow> {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                log::error!("audio actor pipe failed, {e:?}");
                self.call_end(true).await;
                return Ok(Flow::Continue);
            }
        };

        match event {
            AudioEvent::Ready => {
                let Some(call) = &self.call else {
                    return Ok(Flow::Continue);
                };

                log::debug!("audio actor is up, sending its connection data");
                let init = AudioCommand::Init(Box::new(call.connection.clone()));

                if call.audio_pipe.send(init).await.is_err() {
                    self.call_end(true).await;
                }
            }
            AudioEvent::RtpOk(local_port) => self.audio_ready(local_port).await?,
        }

        Ok(Flow::Continue)
    }

    /// The audio leg is up: remember the RTP port and ask the main thread to
    /// place the cellular call.
    async fn audio_ready(&mut self, local_port: u16) -> Result<()> {
        let Some(call) = &mut self.call else {
            return Ok(());
        };

        call.local_rtp_port = Some(local_port);
        log::info!("audio up, local RTP port {local_port}");

        let Some(number) = call
            .dest_number
            .as_deref()
            .and_then(stack::normalize_number)
        else {
            // nothing sensible to dial; leave the call in early setup
            log::debug!("request URI yielded no usable destination number");
            return Ok(());
        };

        self.control
            .send(SipEvent::IncomingCall(number))
            .await
            .context("control pipe to the main thread failed")?;

        Ok(())
    }

    /// `SIP_CMD_CALL_IN_PROGRESS`: the cellular leg exists, so enable early
    /// media with a 183 + SDP answer.
    async fn call_in_progress(&mut self, path: String) -> Result<Flow> {
        let Some(registrar) = &self.registrar else {
            return Ok(Flow::Continue);
        };

        let Some(call) = &mut self.call else {
            log::warn!("cellular call progress without a SIP call");
            return Ok(Flow::Continue);
        };

        let Some(local_port) = call.local_rtp_port else {
            log::warn!("cellular call progress before audio is up");
            return Ok(Flow::Continue);
        };

        log::info!("cellular call at {path}");
        call.cellular_path = Some(path);

        let answer = sdp::build_answer(registrar.config.local_ip, local_port);

        self.stack
            .send_session_progress(&mut call.invite, answer)
            .await
            .context("failed to send 183 Session Progress")?;

        Ok(Flow::Continue)
    }

    /// `SIP_CMD_CALL_TERMINATED`: the cellular leg died; tear down the SIP
    /// call if it is ours.
    async fn cellular_terminated(&mut self, path: String) {
        let is_current = self
            .call
            .as_ref()
            .and_then(|call| call.cellular_path.as_deref())
            == Some(path.as_str());

        if is_current {
            log::info!("cellular call {path} terminated, ending SIP call");
            self.call_end(false).await;
        }
    }

    /// Tears down the current call: stop and join the audio actor, return
    /// the INVITE to the stack, clear the slot.
    async fn call_end(&mut self, notify_main: bool) {
        let Some(mut call) = self.call.take() else {
            return;
        };

        self.stack.watch_call(None);

        if call.audio_pipe.send(AudioCommand::Exit).await.is_err() {
            log::debug!("audio actor is already gone");
        }
        if call.audio_thread.join().is_err() {
            log::error!("audio actor thread panicked");
        }

        self.stack.decline(call.invite).await;

        if notify_main {
            if let Some(path) = call.cellular_path.take() {
                let _ = self.control.send(SipEvent::CallEnded(path)).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        self.call_end(false).await;

        if let Some(mut state) = self.registrar.take() {
            if state.registered {
                if let Err(e) = self.stack.register(&mut state.registrar, true).await {
                    log::debug!("failed to remove REGISTER binding, {e:?}");
                }
            }
        }
    }
}

async fn registration_due(registrar: &mut Option<RegistrarState>) {
    match registrar {
        Some(state) if state.registered => state.registrar.wait_for_expiry().await,
        Some(_) => tokio::time::sleep(REGISTER_RETRY_INTERVAL).await,
        None => std::future::pending().await,
    }
}

async fn audio_message(call: &Option<CurrentCall>) -> Result<AudioEvent, PipeError> {
    match call {
        Some(call) => call.audio_pipe.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn spawns_and_tears_down_cleanly() {
        let handle = spawn(0).unwrap();

        let ready = timeout(Duration::from_secs(5), handle.pipe.recv())
            .await
            .expect("timed out waiting for the SIP actor")
            .unwrap();
        assert_eq!(ready, SipEvent::Ready);

        handle.pipe.send(SipCommand::Exit).await.unwrap();
        handle.join();
    }

    #[tokio::test]
    async fn incomplete_configuration_is_refused() {
        let handle = spawn(0).unwrap();

        let ready = timeout(Duration::from_secs(5), handle.pipe.recv())
            .await
            .expect("timed out waiting for the SIP actor")
            .unwrap();
        assert_eq!(ready, SipEvent::Ready);

        let config = ModemConfig {
            username: String::new(),
            password: "secret".into(),
            sip_host: "pbx.example.org".into(),
            sip_id: "sip:1001@pbx.example.org".into(),
            audio_port: "/dev/ttyUSB1".into(),
            local_ip: std::net::Ipv4Addr::new(192, 0, 2, 10),
        };

        // refused without touching the network; the actor stays responsive
        handle
            .pipe
            .send(SipCommand::Register(Box::new(config)))
            .await
            .unwrap();

        handle.pipe.send(SipCommand::Exit).await.unwrap();
        handle.join();
    }
}
