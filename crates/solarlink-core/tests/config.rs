mod common;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use common::{basic_info_payload, bms_reply};
use pretty_assertions::assert_eq;
use solarlink_core::config::{ConfigError, DeviceConfig, TransportConfig};
use solarlink_core::device::BmsDevice;
use solarlink_core::protocol::{BmsFraming, BmsRegister, Family, FramingStrategy, InverterQuery};
use tempfile::TempDir;

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inverter.json");
    std::fs::write(
        &path,
        r#"{
            "name": "shed-inverter",
            "family": "inverter",
            "transport": { "type": "hid_raw", "path": "/dev/hidraw0" },
            "timing": { "min_poll_interval_ms": 1000 }
        }"#,
    )
    .unwrap();

    let config = DeviceConfig::from_file(&path).unwrap();
    assert_eq!(config.family, Family::Inverter);
    assert!(config.transport.is_hid());

    let session = config.session_config();
    assert_eq!(session.name, "shed-inverter");
    assert_eq!(session.min_poll_interval, Duration::from_secs(1));
    assert_eq!(session.attempts, 3);

    // Report id prefix on every request
    let framing = config.framing();
    assert_eq!(framing.encode(&InverterQuery::DeviceMode.into())[0], 0x00);
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bms.json");
    let config = DeviceConfig::from_json_str(
        r#"{"name":"pack-1","family":"bms","transport":{"type":"serial","path":"/dev/ttyUSB0"}}"#,
    )
    .unwrap();

    std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();
    let reloaded = DeviceConfig::from_file(&path).unwrap();
    assert_eq!(reloaded, config);
    assert_eq!(reloaded.serial_settings().baud_rate, 9600);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = DeviceConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_malformed_file_is_json_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"name\": ").unwrap();
    assert!(matches!(
        DeviceConfig::from_file(&path),
        Err(ConfigError::Json(_))
    ));
}

#[test]
fn test_tcp_session_from_config() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut request = [0u8; 7];
        sock.read_exact(&mut request).unwrap();
        sock.write_all(&bms_reply(0x03, &basic_info_payload())).unwrap();
        request
    });

    let config = DeviceConfig {
        name: "bridge".to_string(),
        family: Family::Bms,
        transport: TransportConfig::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        timing: Default::default(),
    };
    let bms = BmsDevice::new(config.open_transport(), config.session_config());

    let info = bms.basic_info().unwrap().expect("basic info");
    assert_eq!(info.state_of_charge, 50);
    assert_eq!(
        server.join().unwrap().to_vec(),
        BmsFraming.encode(&BmsRegister::BasicInfo.into())
    );
    assert_eq!(bms.counters().tx_frames, 1);
}
