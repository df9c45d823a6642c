// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! One entity per tracked modem.
//!
//! Lives on the main thread, owns the modem's D-Bus proxies, its voice
//! subscription, the SIP actor handle, and the table of cellular calls. The
//! SIP actor is only ever alive while the voice sub-interface is subscribed.

use crate::controller::ControllerEvent;
use crate::messages::{SipCommand, SipEvent};
use crate::mm::{self, CallState, ModemState, ModemVoiceProxy};
use crate::settings::ModemConfig;
use crate::sip::{self, SipActorHandle};
use crate::util::AsyncOps;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

pub struct Modem {
    conn: zbus::Connection,
    path: OwnedObjectPath,
    equipment_id: String,
    state: parking_lot::Mutex<ModemState>,
    state_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    inner: parking_lot::Mutex<ModemInner>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    ops: AsyncOps,
}

#[derive(Default)]
struct ModemInner {
    voice: Option<VoiceLink>,
    calls: CallTable,
}

/// Voice subscription plus the SIP actor it feeds.
struct VoiceLink {
    voice: ModemVoiceProxy<'static>,
    sip: SipActorHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Modem {
    /// Creates the entity, reads the modem's identity and subscribes to its
    /// state changes.
    pub async fn attach(
        conn: &zbus::Connection,
        path: OwnedObjectPath,
        events: mpsc::UnboundedSender<ControllerEvent>,
        ops: AsyncOps,
    ) -> Result<Arc<Self>> {
        let proxy = mm::modem_proxy(conn, path.clone())
            .await
            .context("failed to create modem proxy")?;

        let equipment_id = proxy
            .equipment_identifier()
            .await
            .context("failed to read the equipment identifier")?;

        let state = ModemState::from_raw(
            proxy.state().await.context("failed to read modem state")?,
        );

        let modem = Arc::new(Modem {
            conn: conn.clone(),
            path: path.clone(),
            equipment_id,
            state: parking_lot::Mutex::new(state),
            state_task: parking_lot::Mutex::new(None),
            inner: parking_lot::Mutex::new(ModemInner::default()),
            events: events.clone(),
            ops,
        });

        let mut stream = proxy
            .receive_modem_state_changed()
            .await
            .context("failed to subscribe to modem state changes")?;

        let task = tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };

                let _ = events.send(ControllerEvent::ModemState {
                    modem: path.clone(),
                    old: ModemState::from_raw(*args.old()),
                    new: ModemState::from_raw(*args.new()),
                });
            }
        });
        *modem.state_task.lock() = Some(task);

        Ok(modem)
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub fn state(&self) -> ModemState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ModemState) {
        *self.state.lock() = state;
    }

    /// Subscribes the voice sub-interface and spawns the SIP actor.
    pub async fn start_voice(self: &Arc<Self>) {
        if self.inner.lock().voice.is_some() {
            // guard against strange state transitions
            return;
        }

        log::info!("attaching to voice service for {}", self.path);

        let voice = match mm::voice_proxy(&self.conn, self.path.clone()).await {
            Ok(voice) => voice,
            Err(e) => {
                log::error!("unable to get a voice interface for {}, {e:?}", self.path);
                return;
            }
        };

        let mut tasks = Vec::new();

        match voice.receive_call_added().await {
            Ok(mut stream) => {
                let events = self.events.clone();
                let path = self.path.clone();

                tasks.push(tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        let Ok(args) = signal.args() else { continue };
                        let _ = events.send(ControllerEvent::CallAdded {
                            modem: path.clone(),
                            call: args.path().clone(),
                        });
                    }
                }));
            }
            Err(e) => {
                log::error!("failed to subscribe to call additions, {e:?}");
                return;
            }
        }

        match voice.receive_call_deleted().await {
            Ok(mut stream) => {
                let events = self.events.clone();
                let path = self.path.clone();

                tasks.push(tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        let Ok(args) = signal.args() else { continue };
                        let _ = events.send(ControllerEvent::CallDeleted {
                            modem: path.clone(),
                            call: args.path().clone(),
                        });
                    }
                }));
            }
            Err(e) => {
                log::error!("failed to subscribe to call removals, {e:?}");
                for task in tasks {
                    task.abort();
                }
                return;
            }
        }

        let sip = match sip::spawn(sip::SIP_PORT) {
            Ok(sip) => sip,
            Err(e) => {
                log::error!("failed to spawn SIP actor, {e:?}");
                for task in tasks {
                    task.abort();
                }
                return;
            }
        };

        // wire the actor's upstream pipe into the main reactor
        let pipe = sip.pipe.clone();
        let events = self.events.clone();
        let path = self.path.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                match pipe.recv().await {
                    Ok(event) => {
                        let _ = events.send(ControllerEvent::Sip {
                            modem: path.clone(),
                            event,
                        });
                    }
                    Err(e) => {
                        log::warn!("SIP actor for {path} stopped talking to us, {e:?}");
                        break;
                    }
                }
            }
        }));

        self.inner.lock().voice = Some(VoiceLink { voice, sip, tasks });
    }

    /// Tears down calls, the voice subscription and the SIP actor, in that
    /// order.
    pub async fn stop_voice(&self) {
        let link = {
            let mut inner = self.inner.lock();

            if inner.voice.is_some() {
                inner.calls.release_all();
            }

            inner.voice.take()
        };

        let Some(link) = link else { return };

        log::info!("stopping voice handling for {}", self.path);

        if link.sip.pipe.send(SipCommand::Exit).await.is_err() {
            log::debug!("SIP actor is already gone");
        }

        for task in link.tasks {
            task.abort();
        }

        link.sip.join();
        drop(link.voice);
    }

    /// Full dispose path; voice goes down before the modem handle is dropped.
    pub async fn detach(&self) {
        self.stop_voice().await;

        if let Some(task) = self.state_task.lock().take() {
            task.abort();
        }
    }

    /// Handles an event from this modem's SIP actor.
    pub async fn sip_event(self: &Arc<Self>, event: SipEvent) {
        match event {
            SipEvent::Ready => self.send_sip_config().await,
            SipEvent::IncomingCall(number) => self.place_call(number),
            SipEvent::CallEnded(path) => self.drop_cellular_call(path),
        }
    }

    async fn send_sip_config(&self) {
        match ModemConfig::lookup(&self.equipment_id) {
            Ok(Some(config)) => {
                log::info!("sending SIP configuration for {}", self.equipment_id);
                self.send_sip(SipCommand::Register(Box::new(config))).await;
            }
            Ok(None) => log::info!(
                "no configuration for modem {}, not registering",
                self.equipment_id
            ),
            Err(e) => log::error!("failed to read configuration, {e:?}"),
        }
    }

    async fn send_sip(&self, cmd: SipCommand) {
        let pipe = {
            self.inner
                .lock()
                .voice
                .as_ref()
                .map(|link| link.sip.pipe.clone())
        };

        match pipe {
            Some(pipe) => {
                if let Err(e) = pipe.send(cmd).await {
                    log::warn!("failed to send command to the SIP actor, {e:?}");
                }
            }
            None => log::debug!("dropping SIP command, voice is not active"),
        }
    }

    /// Places the cellular leg: CreateCall, Start, then report the call path
    /// back to the SIP actor. The chain holds an async-op guard and a strong
    /// handle on the modem across every leg.
    fn place_call(self: &Arc<Self>, number: String) {
        let modem = self.clone();
        let guard = self.ops.begin();

        tokio::spawn(async move {
            let _guard = guard;

            if let Err(e) = modem.place_call_chain(&number).await {
                log::error!("unable to place cellular call, {e:?}");
            }
        });
    }

    async fn place_call_chain(&self, number: &str) -> Result<()> {
        let voice = self
            .voice_proxy()
            .context("voice interface is not available")?;

        let mut properties = HashMap::new();
        properties.insert("number", Value::from(number));

        let call_path = voice
            .create_call(properties)
            .await
            .context("CreateCall failed")?;

        let call = mm::call_proxy(&self.conn, call_path.clone())
            .await
            .context("failed to create call proxy")?;

        call.start().await.context("failed to start the call")?;

        self.send_sip(SipCommand::CallInProgress(call_path.to_string()))
            .await;

        Ok(())
    }

    /// Hangs up and deletes a cellular call whose SIP leg ended first.
    fn drop_cellular_call(self: &Arc<Self>, path: String) {
        let modem = self.clone();
        let guard = self.ops.begin();

        tokio::spawn(async move {
            let _guard = guard;

            let Ok(call_path) = ObjectPath::try_from(path.as_str()) else {
                log::error!("SIP actor reported a malformed call path {path}");
                return;
            };
            let call_path = OwnedObjectPath::from(call_path);

            match mm::call_proxy(&modem.conn, call_path.clone()).await {
                Ok(call) => {
                    if let Err(e) = call.hangup().await {
                        log::debug!("call hangup failed, {e:?}");
                    }
                }
                Err(e) => log::debug!("failed to create call proxy, {e:?}"),
            }

            if let Some(voice) = modem.voice_proxy() {
                if let Err(e) = voice.delete_call(&call_path).await {
                    log::debug!("failed to delete call object, {e:?}");
                }
            }
        });
    }

    fn voice_proxy(&self) -> Option<ModemVoiceProxy<'static>> {
        self.inner
            .lock()
            .voice
            .as_ref()
            .map(|link| link.voice.clone())
    }

    /// A call object appeared; confirm it against the voice call list, then
    /// subscribe to its state changes.
    pub fn call_added(self: &Arc<Self>, call_path: OwnedObjectPath) {
        log::info!("modem {} got call {}", self.path, call_path);

        let modem = self.clone();
        let guard = self.ops.begin();

        tokio::spawn(async move {
            let _guard = guard;

            if let Err(e) = modem.track_call(call_path).await {
                log::error!("failed to track call, {e:?}");
            }
        });
    }

    async fn track_call(self: &Arc<Self>, call_path: OwnedObjectPath) -> Result<()> {
        let voice = self
            .voice_proxy()
            .context("voice interface is not available")?;

        // the notification only carries a path; look the object up
        let listed = voice.list_calls().await.context("ListCalls failed")?;
        if !listed.contains(&call_path) {
            bail!("call {call_path} is not in the voice call list");
        }

        let call = mm::call_proxy(&self.conn, call_path.clone())
            .await
            .context("failed to create call proxy")?;

        let mut stream = call
            .receive_call_state_changed()
            .await
            .context("failed to subscribe to call state changes")?;

        let events = self.events.clone();
        let modem_path = self.path.clone();
        let watched_path = call_path.clone();

        let watch = tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };

                let _ = events.send(ControllerEvent::CallState {
                    modem: modem_path.clone(),
                    call: watched_path.clone(),
                    state: CallState::from_raw(*args.new()),
                });
            }
        });

        let initial = CallState::from_raw(call.state().await.unwrap_or(0));

        let mut inner = self.inner.lock();
        inner.calls.insert(call_path.clone(), Some(watch));
        inner.calls.observe(&call_path, initial);

        Ok(())
    }

    /// A state change reported for one of this modem's calls.
    pub async fn call_state(&self, call: OwnedObjectPath, state: CallState) {
        log::debug!("call {call} is now {state:?}");

        if state == CallState::Terminated {
            self.send_sip(SipCommand::CallTerminated(call.to_string()))
                .await;
        }

        self.inner.lock().calls.observe(&call, state);
    }

    /// The service removed a call object.
    pub fn call_deleted(&self, call: OwnedObjectPath) {
        log::info!("call {} was removed from {}", call, self.path);
        self.inner.lock().calls.remove(&call);
    }

    #[cfg(test)]
    pub fn tracked_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

struct TrackedCall {
    watch: Option<JoinHandle<()>>,
    counted: bool,
}

/// Cellular calls known to a modem, keyed by bus path.
///
/// A call leaves the table exactly when it is observed terminated (or the
/// service removes it). The active counter gates the modem's audio IO.
#[derive(Default)]
pub struct CallTable {
    calls: HashMap<OwnedObjectPath, TrackedCall>,
    active: u32,
}

impl CallTable {
    pub fn insert(&mut self, path: OwnedObjectPath, watch: Option<JoinHandle<()>>) {
        if self
            .calls
            .insert(path.clone(), TrackedCall { watch, counted: false })
            .is_some()
        {
            log::warn!("BUG: call {path} was already tracked");
        }
    }

    /// Feeds one state observation into the table.
    pub fn observe(&mut self, path: &OwnedObjectPath, state: CallState) {
        if state == CallState::Terminated {
            self.remove(path);
            return;
        }

        let Some(tracked) = self.calls.get_mut(path) else {
            return;
        };

        if state != CallState::Unknown && !tracked.counted {
            tracked.counted = true;
            self.active += 1;

            if self.active == 1 {
                log::info!("activating audio IO");
            }
        }
    }

    pub fn remove(&mut self, path: &OwnedObjectPath) {
        let Some(tracked) = self.calls.remove(path) else {
            return;
        };

        if let Some(watch) = tracked.watch {
            watch.abort();
        }

        if tracked.counted {
            self.active -= 1;

            if self.active == 0 {
                log::info!("deactivating audio IO");
            }
        }
    }

    pub fn release_all(&mut self) {
        let paths: Vec<_> = self.calls.keys().cloned().collect();

        for path in &paths {
            self.remove(path);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub fn active(&self) -> u32 {
        self.active
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(n: u32) -> OwnedObjectPath {
        OwnedObjectPath::from(
            ObjectPath::try_from(format!("/org/freedesktop/ModemManager1/Call/{n}")).unwrap(),
        )
    }

    #[test]
    fn calls_leave_the_table_exactly_on_termination() {
        let mut table = CallTable::default();

        table.insert(path(0), None);
        table.insert(path(1), None);
        assert_eq!(table.len(), 2);

        table.observe(&path(0), CallState::RingingIn);
        table.observe(&path(1), CallState::RingingOut);
        assert_eq!(table.active(), 2);

        table.observe(&path(0), CallState::Active);
        assert_eq!(table.active(), 2);

        table.observe(&path(0), CallState::Terminated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.active(), 1);

        table.observe(&path(1), CallState::Terminated);
        assert_eq!(table.len(), 0);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn unknown_observations_do_not_count() {
        let mut table = CallTable::default();

        table.insert(path(7), None);
        table.observe(&path(7), CallState::Unknown);
        assert_eq!(table.active(), 0);

        table.observe(&path(7), CallState::Waiting);
        assert_eq!(table.active(), 1);
    }

    #[test]
    fn untracked_paths_are_ignored() {
        let mut table = CallTable::default();

        table.observe(&path(3), CallState::RingingIn);
        table.remove(&path(3));
        assert_eq!(table.len(), 0);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn release_drops_everything() {
        let mut table = CallTable::default();

        table.insert(path(0), None);
        table.insert(path(1), None);
        table.observe(&path(0), CallState::RingingIn);

        table.release_all();
        assert_eq!(table.len(), 0);
        assert_eq!(table.active(), 0);
    }
}
