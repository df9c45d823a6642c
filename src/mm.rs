// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Typed client surface of the ModemManager D-Bus service.

use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

pub const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
pub const MM_PATH: &str = "/org/freedesktop/ModemManager1";
pub const MODEM_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem";

/// Coarse modem lifecycle state; voice only makes sense from `Registered` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModemState {
    Failed,
    Unknown,
    Initializing,
    Locked,
    Disabled,
    Disabling,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Disconnecting,
    Connecting,
    Connected,
}

impl ModemState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => ModemState::Failed,
            1 => ModemState::Initializing,
            2 => ModemState::Locked,
            3 => ModemState::Disabled,
            4 => ModemState::Disabling,
            5 => ModemState::Enabling,
            6 => ModemState::Enabled,
            7 => ModemState::Searching,
            8 => ModemState::Registered,
            9 => ModemState::Disconnecting,
            10 => ModemState::Connecting,
            11 => ModemState::Connected,
            _ => ModemState::Unknown,
        }
    }

    pub fn voice_capable(self) -> bool {
        self >= ModemState::Registered
    }
}

/// State of one cellular call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Unknown,
    Dialing,
    RingingOut,
    RingingIn,
    Active,
    Held,
    Waiting,
    Terminated,
}

impl CallState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => CallState::Dialing,
            2 => CallState::RingingOut,
            3 => CallState::RingingIn,
            4 => CallState::Active,
            5 => CallState::Held,
            6 => CallState::Waiting,
            7 => CallState::Terminated,
            _ => CallState::Unknown,
        }
    }
}

mod modem_proxy_mod {
    #[zbus::proxy(
        interface = "org.freedesktop.ModemManager1.Modem",
        default_service = "org.freedesktop.ModemManager1",
        gen_blocking = false
    )]
    pub trait Modem {
        #[zbus(property)]
        fn state(&self) -> zbus::Result<i32>;

        /// Persistent device identity (IMEI on GSM modems); the configuration key.
        #[zbus(property)]
        fn equipment_identifier(&self) -> zbus::Result<String>;

        #[zbus(signal, name = "StateChanged")]
        fn modem_state_changed(&self, old: i32, new: i32, reason: u32) -> zbus::Result<()>;
    }
}
pub use modem_proxy_mod::ModemProxy;

#[zbus::proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Voice",
    default_service = "org.freedesktop.ModemManager1",
    gen_blocking = false
)]
pub trait ModemVoice {
    fn list_calls(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    fn create_call(
        &self,
        properties: std::collections::HashMap<&str, zbus::zvariant::Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn delete_call(&self, path: &zbus::zvariant::ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn call_added(&self, path: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    fn call_deleted(&self, path: OwnedObjectPath) -> zbus::Result<()>;
}

mod call_proxy_mod {
    #[zbus::proxy(
        interface = "org.freedesktop.ModemManager1.Call",
        default_service = "org.freedesktop.ModemManager1",
        gen_blocking = false
    )]
    pub trait Call {
        fn start(&self) -> zbus::Result<()>;

        fn hangup(&self) -> zbus::Result<()>;

        #[zbus(property)]
        fn state(&self) -> zbus::Result<i32>;

        #[zbus(signal, name = "StateChanged")]
        fn call_state_changed(&self, old: i32, new: i32, reason: u32) -> zbus::Result<()>;
    }
}
pub use call_proxy_mod::CallProxy;

pub async fn object_manager(
    conn: &Connection,
) -> zbus::Result<zbus::fdo::ObjectManagerProxy<'static>> {
    zbus::fdo::ObjectManagerProxy::builder(conn)
        .destination(MM_SERVICE)?
        .path(MM_PATH)?
        .build()
        .await
}

pub async fn modem_proxy(
    conn: &Connection,
    path: OwnedObjectPath,
) -> zbus::Result<ModemProxy<'static>> {
    ModemProxy::builder(conn).path(path)?.build().await
}

pub async fn voice_proxy(
    conn: &Connection,
    path: OwnedObjectPath,
) -> zbus::Result<ModemVoiceProxy<'static>> {
    ModemVoiceProxy::builder(conn).path(path)?.build().await
}

pub async fn call_proxy(
    conn: &Connection,
    path: OwnedObjectPath,
) -> zbus::Result<CallProxy<'static>> {
    CallProxy::builder(conn).path(path)?.build().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modem_states_map_from_raw_values() {
        assert_eq!(ModemState::from_raw(-1), ModemState::Failed);
        assert_eq!(ModemState::from_raw(0), ModemState::Unknown);
        assert_eq!(ModemState::from_raw(8), ModemState::Registered);
        assert_eq!(ModemState::from_raw(11), ModemState::Connected);
        assert_eq!(ModemState::from_raw(42), ModemState::Unknown);
    }

    #[test]
    fn voice_needs_at_least_registered() {
        assert!(!ModemState::Searching.voice_capable());
        assert!(ModemState::Registered.voice_capable());
        assert!(ModemState::Connected.voice_capable());
        assert!(ModemState::Disconnecting.voice_capable());
    }

    #[test]
    fn call_states_map_from_raw_values() {
        assert_eq!(CallState::from_raw(3), CallState::RingingIn);
        assert_eq!(CallState::from_raw(7), CallState::Terminated);
        assert_eq!(CallState::from_raw(99), CallState::Unknown);
    }
}
