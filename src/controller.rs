// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Process-wide coordinator.
//!
//! Watches the ModemManager name on the system bus, keeps the modem entity
//! table, and runs the main reactor that funnels every notification stream
//! and actor pipe into one event loop. On exit it tears the table down and
//! waits for the async-operation counter to drain.

use crate::messages::SipEvent;
use crate::mm::{self, CallState, ModemState};
use crate::modem::Modem;
use crate::util::AsyncOps;
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::zvariant::OwnedObjectPath;

#[derive(Debug)]
pub enum ControllerEvent {
    ServiceUp,
    ServiceDown,
    ModemAdded(OwnedObjectPath),
    ModemRemoved(OwnedObjectPath),
    ModemState {
        modem: OwnedObjectPath,
        old: ModemState,
        new: ModemState,
    },
    Sip {
        modem: OwnedObjectPath,
        event: SipEvent,
    },
    CallAdded {
        modem: OwnedObjectPath,
        call: OwnedObjectPath,
    },
    CallDeleted {
        modem: OwnedObjectPath,
        call: OwnedObjectPath,
    },
    CallState {
        modem: OwnedObjectPath,
        call: OwnedObjectPath,
        state: CallState,
    },
}

pub struct Controller {
    conn: zbus::Connection,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    modems: Vec<Arc<Modem>>,
    ops: AsyncOps,
    name_watch: Vec<JoinHandle<()>>,
    manager_tasks: Vec<JoinHandle<()>>,
    exiting: bool,
}

impl Controller {
    /// Connects to the system bus and sets up the reactor plumbing.
    pub async fn prepare() -> Result<Self> {
        let conn = zbus::Connection::system()
            .await
            .context("failed to connect to the system bus")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            conn,
            events_tx,
            events_rx,
            modems: Vec::new(),
            ops: AsyncOps::new(),
            name_watch: Vec::new(),
            manager_tasks: Vec::new(),
            exiting: false,
        })
    }

    /// Runs until a clean exit is possible.
    pub async fn run(mut self) -> Result<()> {
        self.start_name_watch().await?;

        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install the SIGINT handler")?;

        loop {
            tokio::select! {
                _ = sigint.recv(), if !self.exiting => {
                    log::info!("got SIGINT");
                    self.exit_requested().await;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = tokio::time::sleep(Duration::from_secs(1)), if self.exiting => {
                    if self.ops.idle() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn start_name_watch(&mut self) -> Result<()> {
        let dbus = zbus::fdo::DBusProxy::new(&self.conn)
            .await
            .context("failed to create the bus proxy")?;

        let mut stream = dbus
            .receive_name_owner_changed()
            .await
            .context("failed to subscribe to name ownership changes")?;

        let events = self.events_tx.clone();

        self.name_watch.push(tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };

                if args.name().as_str() != mm::MM_SERVICE {
                    continue;
                }

                let event = if args.new_owner().is_none() {
                    ControllerEvent::ServiceDown
                } else {
                    ControllerEvent::ServiceUp
                };

                let _ = events.send(event);
            }
        }));

        let name = mm::MM_SERVICE
            .try_into()
            .context("failed to parse the ModemManager bus name")?;
        if dbus.name_has_owner(name).await.unwrap_or(false) {
            let _ = self.events_tx.send(ControllerEvent::ServiceUp);
        }

        log::info!("watching for ModemManager");

        Ok(())
    }

    async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::ServiceUp => self.service_up().await,
            ControllerEvent::ServiceDown => self.service_down().await,
            ControllerEvent::ModemAdded(path) => self.modem_added(path).await,
            ControllerEvent::ModemRemoved(path) => self.modem_removed(path).await,
            ControllerEvent::ModemState { modem, old, new } => {
                self.modem_state_changed(modem, old, new).await;
            }
            ControllerEvent::Sip { modem, event } => {
                if let Some(modem) = self.find_modem(&modem) {
                    modem.sip_event(event).await;
                }
            }
            ControllerEvent::CallAdded { modem, call } => {
                if let Some(modem) = self.find_modem(&modem) {
                    modem.call_added(call);
                }
            }
            ControllerEvent::CallDeleted { modem, call } => {
                if let Some(modem) = self.find_modem(&modem) {
                    modem.call_deleted(call);
                }
            }
            ControllerEvent::CallState { modem, call, state } => {
                if let Some(modem) = self.find_modem(&modem) {
                    modem.call_state(call, state).await;
                }
            }
        }
    }

    /// The service appeared: subscribe the object manager and enumerate the
    /// modems that already exist as if each had just been added.
    async fn service_up(&mut self) {
        if !self.manager_tasks.is_empty() {
            return;
        }

        log::info!("ModemManager is connected");

        let manager = {
            let _guard = self.ops.begin();
            mm::object_manager(&self.conn).await
        };

        let manager = match manager {
            Ok(manager) => manager,
            Err(e) => {
                log::error!("failed to create the object manager proxy, {e:?}");
                return;
            }
        };

        match manager.receive_interfaces_added().await {
            Ok(mut stream) => {
                let events = self.events_tx.clone();

                self.manager_tasks.push(tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        let Ok(args) = signal.args() else { continue };

                        let is_modem = args
                            .interfaces_and_properties()
                            .keys()
                            .any(|interface| interface.as_str() == mm::MODEM_INTERFACE);

                        if is_modem {
                            let _ = events.send(ControllerEvent::ModemAdded(
                                args.object_path().to_owned().into(),
                            ));
                        }
                    }
                }));
            }
            Err(e) => {
                log::error!("failed to subscribe to object additions, {e:?}");
                return;
            }
        }

        match manager.receive_interfaces_removed().await {
            Ok(mut stream) => {
                let events = self.events_tx.clone();

                self.manager_tasks.push(tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        let Ok(args) = signal.args() else { continue };

                        let was_modem = args
                            .interfaces()
                            .iter()
                            .any(|interface| interface.as_str() == mm::MODEM_INTERFACE);

                        if was_modem {
                            let _ = events.send(ControllerEvent::ModemRemoved(
                                args.object_path().to_owned().into(),
                            ));
                        }
                    }
                }));
            }
            Err(e) => {
                log::error!("failed to subscribe to object removals, {e:?}");
                return;
            }
        }

        let objects = {
            let _guard = self.ops.begin();
            manager.get_managed_objects().await
        };

        match objects {
            Ok(objects) => {
                if objects.is_empty() {
                    log::info!("no modems");
                }

                for (path, interfaces) in objects {
                    let is_modem = interfaces
                        .keys()
                        .any(|interface| interface.as_str() == mm::MODEM_INTERFACE);

                    if is_modem {
                        let _ = self.events_tx.send(ControllerEvent::ModemAdded(path));
                    }
                }
            }
            Err(e) => log::error!("failed to enumerate modems, {e:?}"),
        }
    }

    async fn service_down(&mut self) {
        log::info!("ModemManager disconnected from the bus");

        for task in self.manager_tasks.drain(..) {
            task.abort();
        }

        self.drop_modems().await;
    }

    async fn modem_added(&mut self, path: OwnedObjectPath) {
        if self.find_modem(&path).is_some() {
            log::error!("BUG: modem {path} is already tracked");
            return;
        }

        let attached = {
            let _guard = self.ops.begin();
            Modem::attach(&self.conn, path.clone(), self.events_tx.clone(), self.ops.clone()).await
        };

        match attached {
            Ok(modem) => {
                log::info!("{path} added");

                if modem.state().voice_capable() {
                    modem.start_voice().await;
                }

                self.modems.push(modem);
            }
            Err(e) => log::error!("failed to attach modem {path}, {e:?}"),
        }
    }

    async fn modem_removed(&mut self, path: OwnedObjectPath) {
        let Some(index) = self.modems.iter().position(|m| *m.path() == path) else {
            log::error!("BUG: cannot find an entity for {path}");
            return;
        };

        log::info!("{path} is gone");

        let modem = self.modems.remove(index);
        modem.detach().await;
    }

    async fn modem_state_changed(
        &mut self,
        path: OwnedObjectPath,
        old: ModemState,
        new: ModemState,
    ) {
        let Some(modem) = self.find_modem(&path) else {
            return;
        };

        log::debug!("modem {path} went {old:?} -> {new:?}");
        modem.set_state(new);

        if !new.voice_capable() {
            modem.stop_voice().await;
        } else if !old.voice_capable() {
            modem.start_voice().await;
        }
    }

    async fn exit_requested(&mut self) {
        self.exiting = true;

        for task in self.name_watch.drain(..) {
            task.abort();
        }
        for task in self.manager_tasks.drain(..) {
            task.abort();
        }

        self.drop_modems().await;

        log::info!("no longer watching for ModemManager");
    }

    async fn drop_modems(&mut self) {
        for modem in std::mem::take(&mut self.modems) {
            modem.detach().await;
        }
    }

    fn find_modem(&self, path: &OwnedObjectPath) -> Option<Arc<Modem>> {
        self.modems.iter().find(|m| m.path() == path).cloned()
    }
}
