// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Per-modem configuration, looked up by the modem's equipment identifier.
///
/// `AirVoice.cfg` holds one table per modem, keyed `MM_<equipment id>`. A
/// modem without a table is simply not registered anywhere; a table with a
/// missing key refuses registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModemConfig {
    pub username: String,
    pub password: String,
    pub sip_host: String,
    pub sip_id: String,
    /// Path of the modem's PCM audio serial device.
    pub audio_port: PathBuf,
    pub local_ip: Ipv4Addr,
}

const CONFIG_FILE: &str = "AirVoice.cfg";

impl ModemConfig {
    pub fn lookup(equipment_id: &str) -> Result<Option<Self>, ConfigError> {
        Self::lookup_in(CONFIG_FILE, equipment_id)
    }

    fn lookup_in(file_name: &str, equipment_id: &str) -> Result<Option<Self>, ConfigError> {
        let config = Config::builder()
            .add_source(File::new(file_name, FileFormat::Toml))
            .build()?;

        match config.get::<Self>(&format!("MM_{equipment_id}")) {
            Ok(modem_config) => Ok(Some(modem_config)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every field must be present and non-empty before a REGISTER goes out.
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty()
            && !self.password.is_empty()
            && !self.sip_host.is_empty()
            && !self.sip_id.is_empty()
            && !self.audio_port.as_os_str().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    struct TempConfig(PathBuf);

    impl TempConfig {
        fn write(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "airvoice-test-{}-{name}.cfg",
                std::process::id()
            ));
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            TempConfig(path)
        }

        fn path(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    const EXAMPLE: &str = r#"
[MM_356938035643809]
username = "1001"
password = "secret"
sip_host = "pbx.example.org"
sip_id = "sip:1001@pbx.example.org"
audio_port = "/dev/ttyUSB1"
local_ip = "192.0.2.10"
"#;

    #[test]
    fn present_section_parses() {
        let file = TempConfig::write("present", EXAMPLE);

        let config = ModemConfig::lookup_in(file.path(), "356938035643809")
            .unwrap()
            .unwrap();

        assert_eq!(config.username, "1001");
        assert_eq!(config.sip_host, "pbx.example.org");
        assert_eq!(config.audio_port, PathBuf::from("/dev/ttyUSB1"));
        assert_eq!(config.local_ip, Ipv4Addr::new(192, 0, 2, 10));
        assert!(config.is_complete());
    }

    #[test]
    fn absent_section_is_skipped() {
        let file = TempConfig::write("absent", EXAMPLE);

        assert_eq!(ModemConfig::lookup_in(file.path(), "000000000000000").unwrap(), None);
    }

    #[test]
    fn missing_key_refuses_registration() {
        let file = TempConfig::write(
            "missing-key",
            r#"
[MM_356938035643809]
username = "1001"
password = "secret"
sip_host = "pbx.example.org"
"#,
        );

        assert!(ModemConfig::lookup_in(file.path(), "356938035643809").is_err());
    }

    #[test]
    fn empty_values_are_incomplete() {
        let mut config = ModemConfig {
            username: "1001".into(),
            password: "secret".into(),
            sip_host: "pbx.example.org".into(),
            sip_id: "sip:1001@pbx.example.org".into(),
            audio_port: "/dev/ttyUSB1".into(),
            local_ip: Ipv4Addr::new(192, 0, 2, 10),
        };
        assert!(config.is_complete());

        config.password = String::new();
        assert!(!config.is_complete());
    }
}
