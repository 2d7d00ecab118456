#![forbid(unsafe_code)]

//! Packet-capture backends. Both run `tcpdump` writing pcap to stdout, one
//! over `ssh` on a remote router and one on a local monitor interface, and
//! turn every 802.11 probe request into a sighting.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use efferve_engines::capture::{
    parse_global_header, parse_probe_request, PCAP_GLOBAL_HEADER_LEN, PCAP_RECORD_HEADER_LEN,
};
use efferve_kernel_contracts::observation::{
    CanonicalObservation, DeviceAddress, SourceId, SIGNAL_DBM_MIN,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SourceError, SourceExit};
use crate::shutdown::ShutdownSignal;

pub const INTERFACE_NAME_MAX_LEN: usize = 15;
pub const PROBE_REQUEST_FILTER: &str = "type mgt subtype probe-req";
const REMOTE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface names end up in shell command lines, so they are restricted
/// to `[A-Za-z0-9_-]{1,15}`.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= INTERFACE_NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Host names and user names passed to `ssh` must not look like options.
pub fn is_valid_ssh_target_part(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('-')
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCaptureConfig {
    pub source_id: SourceId,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub wifi_interface: String,
    pub monitor_interface: String,
}

impl RemoteCaptureConfig {
    /// Creates the monitor interface when missing, then execs tcpdump.
    pub fn remote_command(&self) -> String {
        let mon = &self.monitor_interface;
        let wifi = &self.wifi_interface;
        format!(
            "iw dev {mon} info >/dev/null 2>&1 || {{ iw dev {wifi} interface add {mon} type monitor && ip link set {mon} up; }} && exec tcpdump -i {mon} -U -w - '{PROBE_REQUEST_FILTER}'"
        )
    }

    pub fn cleanup_command(&self) -> String {
        let mon = &self.monitor_interface;
        format!("ip link set {mon} down; iw dev {mon} del")
    }

    fn ssh(&self, remote: String) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.host))
            .arg(remote);
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioMonitorConfig {
    pub source_id: SourceId,
    pub interface: String,
}

fn spawn_capture(mut cmd: Command, source_id: &SourceId) -> Result<Child, SourceError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn()
        .map_err(|err| SourceError::unavailable(source_id, format!("capture spawn failed: {err}")))
}

async fn run_capture(
    mut child: Child,
    source_id: &SourceId,
    shutdown: &mut ShutdownSignal,
    out: &mpsc::Sender<CanonicalObservation>,
) -> Result<SourceExit, SourceError> {
    let Some(mut stdout) = child.stdout.take() else {
        return Err(SourceError::unavailable(source_id, "capture stdout not piped"));
    };
    let result = stream_probe_requests(&mut stdout, source_id, shutdown, out).await;
    if let Err(err) = child.kill().await {
        debug!(source_id = %source_id, error = %err, "capture process already gone");
    }
    result
}

#[derive(Debug)]
pub struct RemoteCaptureSource {
    config: RemoteCaptureConfig,
}

impl RemoteCaptureSource {
    pub fn new(config: RemoteCaptureConfig) -> Self {
        Self { config }
    }

    pub async fn produce(
        self,
        mut shutdown: ShutdownSignal,
        out: mpsc::Sender<CanonicalObservation>,
    ) -> Result<SourceExit, SourceError> {
        let id = &self.config.source_id;
        info!(
            source_id = %id,
            host = %self.config.host,
            monitor = %self.config.monitor_interface,
            "starting remote capture"
        );
        let child = spawn_capture(self.config.ssh(self.config.remote_command()), id)?;
        let exit = run_capture(child, id, &mut shutdown, &out).await;
        if matches!(exit, Ok(SourceExit::Cancelled)) {
            self.cleanup_monitor_interface().await;
        }
        exit
    }

    async fn cleanup_monitor_interface(&self) {
        let mut cmd = self.config.ssh(self.config.cleanup_command());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(REMOTE_CLEANUP_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                info!(source_id = %self.config.source_id, "monitor interface removed")
            }
            Ok(Ok(status)) => {
                warn!(source_id = %self.config.source_id, %status, "monitor interface cleanup failed")
            }
            Ok(Err(err)) => {
                warn!(source_id = %self.config.source_id, error = %err, "monitor interface cleanup failed")
            }
            Err(_) => warn!(source_id = %self.config.source_id, "monitor interface cleanup timed out"),
        }
    }
}

#[derive(Debug)]
pub struct RadioMonitorSource {
    config: RadioMonitorConfig,
}

impl RadioMonitorSource {
    pub fn new(config: RadioMonitorConfig) -> Self {
        Self { config }
    }

    pub async fn produce(
        self,
        mut shutdown: ShutdownSignal,
        out: mpsc::Sender<CanonicalObservation>,
    ) -> Result<SourceExit, SourceError> {
        let id = &self.config.source_id;
        info!(source_id = %id, interface = %self.config.interface, "starting local monitor capture");
        let mut cmd = Command::new("tcpdump");
        cmd.arg("-i")
            .arg(&self.config.interface)
            .arg("-U")
            .arg("-w")
            .arg("-")
            .arg(PROBE_REQUEST_FILTER);
        let child = spawn_capture(cmd, id)?;
        run_capture(child, id, &mut shutdown, &out).await
    }
}

/// Reads `buf.len()` bytes unless shutdown wins first. `Ok(false)` means cancelled.
async fn read_or_cancel<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    shutdown: &mut ShutdownSignal,
    source_id: &SourceId,
) -> Result<bool, SourceError> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(false),
        read = reader.read_exact(buf) => match read {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(SourceError::unavailable(source_id, "capture stream ended"))
            }
            Err(err) => Err(SourceError::unavailable(source_id, format!("capture read failed: {err}"))),
        },
    }
}

/// Decodes a pcap byte stream into probe-request sightings. Stream-level
/// corruption fails the instance; a bad frame is dropped.
pub async fn stream_probe_requests<R: AsyncRead + Unpin>(
    reader: &mut R,
    source_id: &SourceId,
    shutdown: &mut ShutdownSignal,
    out: &mpsc::Sender<CanonicalObservation>,
) -> Result<SourceExit, SourceError> {
    let mut global = [0u8; PCAP_GLOBAL_HEADER_LEN];
    if !read_or_cancel(reader, &mut global, shutdown, source_id).await? {
        return Ok(SourceExit::Cancelled);
    }
    let header =
        parse_global_header(&global).map_err(|err| SourceError::unavailable(source_id, err))?;

    loop {
        let mut record = [0u8; PCAP_RECORD_HEADER_LEN];
        if !read_or_cancel(reader, &mut record, shutdown, source_id).await? {
            return Ok(SourceExit::Cancelled);
        }
        let record = header
            .parse_record_header(&record)
            .map_err(|err| SourceError::unavailable(source_id, err))?;
        let mut frame = vec![0u8; record.captured_len as usize];
        if !read_or_cancel(reader, &mut frame, shutdown, source_id).await? {
            return Ok(SourceExit::Cancelled);
        }

        let probe = match parse_probe_request(&frame) {
            Ok(probe) => probe,
            Err(err) => {
                debug!(source_id = %source_id, error = %err, "dropping undecodable frame");
                continue;
            }
        };
        // Signal and SSID are ancillary; an implausible value is dropped, never the sighting.
        let signal = probe
            .signal_dbm
            .map(i32::from)
            .filter(|dbm| (SIGNAL_DBM_MIN..0).contains(dbm));
        let parsed = DeviceAddress::parse(&probe.source_address()).and_then(|address| {
            CanonicalObservation::v1(
                address,
                Utc::now(),
                signal,
                probe.ssid.clone(),
                None,
                None,
                source_id.clone(),
            )
        });
        match parsed {
            Ok(obs) => {
                if out.send(obs).await.is_err() {
                    return Ok(SourceExit::Cancelled);
                }
            }
            Err(err) => debug!(source_id = %source_id, error = %err, "dropping malformed probe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;

    #[test]
    fn interface_names_are_restricted() {
        assert!(is_valid_interface_name("wlan0mon"));
        assert!(is_valid_interface_name("phy0-mon_1"));
        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("wlan0;reboot"));
        assert!(!is_valid_interface_name("wlan0 mon"));
        assert!(!is_valid_interface_name("averyveryverylongif"));
    }

    #[test]
    fn ssh_target_parts_cannot_be_options() {
        assert!(is_valid_ssh_target_part("192.168.8.1"));
        assert!(is_valid_ssh_target_part("root"));
        assert!(!is_valid_ssh_target_part("-oProxyCommand=x"));
        assert!(!is_valid_ssh_target_part("host name"));
    }

    #[test]
    fn remote_command_sets_up_monitor_then_captures() {
        let cfg = RemoteCaptureConfig {
            source_id: SourceId::new("remote_capture:router").unwrap(),
            host: "192.168.8.1".to_string(),
            user: "root".to_string(),
            port: 22,
            wifi_interface: "wlan0".to_string(),
            monitor_interface: "wlan0mon".to_string(),
        };
        let cmd = cfg.remote_command();
        assert!(cmd.starts_with("iw dev wlan0mon info"));
        assert!(cmd.contains("iw dev wlan0 interface add wlan0mon type monitor"));
        assert!(cmd.ends_with("exec tcpdump -i wlan0mon -U -w - 'type mgt subtype probe-req'"));
    }

    fn pcap_stream(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        s.extend_from_slice(&2u16.to_le_bytes());
        s.extend_from_slice(&4u16.to_le_bytes());
        s.extend_from_slice(&[0u8; 8]);
        s.extend_from_slice(&65535u32.to_le_bytes());
        s.extend_from_slice(&127u32.to_le_bytes());
        for f in frames {
            s.extend_from_slice(&[0u8; 8]);
            s.extend_from_slice(&(f.len() as u32).to_le_bytes());
            s.extend_from_slice(&(f.len() as u32).to_le_bytes());
            s.extend_from_slice(f);
        }
        s
    }

    fn probe_frame(src: [u8; 6], signal: i8, ssid: &[u8]) -> Vec<u8> {
        let present: u32 = 1 << 5;
        let mut f = vec![0x00, 0x00, 9, 0x00];
        f.extend_from_slice(&present.to_le_bytes());
        f.push(signal as u8);
        f.extend_from_slice(&[0x40, 0x00, 0x00, 0x00]);
        f.extend_from_slice(&[0xff; 6]);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0xff; 6]);
        f.extend_from_slice(&[0x00, 0x00]);
        f.push(0);
        f.push(ssid.len() as u8);
        f.extend_from_slice(ssid);
        f
    }

    #[tokio::test]
    async fn stream_emits_probes_and_skips_garbage() {
        let stream = pcap_stream(&[
            probe_frame([0x00, 0x11, 0x22, 0x33, 0x44, 0x55], -48, b"HomeNetwork"),
            vec![0x01, 0x02, 0x03],
            probe_frame([0xfa, 0x12, 0x34, 0x56, 0x78, 0x9a], -82, b""),
        ]);
        let (_trigger, mut shutdown) = shutdown_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let id = SourceId::new("radio_monitor:wlan0mon").unwrap();
        let mut reader = stream.as_slice();
        let exit = stream_probe_requests(&mut reader, &id, &mut shutdown, &tx).await;
        assert!(matches!(exit, Err(SourceError::Unavailable { .. })));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.device_address.as_str(), "00:11:22:33:44:55");
        assert_eq!(first.signal_strength, Some(-48));
        assert_eq!(first.network_name.as_deref(), Some("HomeNetwork"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.device_address.as_str(), "FA:12:34:56:78:9A");
        assert_eq!(second.network_name, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn odd_ssid_or_signal_never_suppresses_the_sighting() {
        let stream = pcap_stream(&[
            probe_frame([0x00, 0x11, 0x22, 0x33, 0x44, 0x01], -55, &[0xC0; 30]),
            probe_frame([0x00, 0x11, 0x22, 0x33, 0x44, 0x02], -55, &[b'a'; 70]),
            probe_frame([0x00, 0x11, 0x22, 0x33, 0x44, 0x03], 3, b"HomeNetwork"),
        ]);
        let (_trigger, mut shutdown) = shutdown_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let id = SourceId::new("radio_monitor:wlan0mon").unwrap();
        let mut reader = stream.as_slice();
        let exit = stream_probe_requests(&mut reader, &id, &mut shutdown, &tx).await;
        assert!(matches!(exit, Err(SourceError::Unavailable { .. })));

        let garbled = rx.recv().await.unwrap();
        assert_eq!(garbled.device_address.as_str(), "00:11:22:33:44:01");
        assert!(garbled.network_name.unwrap().len() <= 64);
        let long = rx.recv().await.unwrap();
        assert_eq!(long.device_address.as_str(), "00:11:22:33:44:02");
        assert_eq!(long.network_name.unwrap().len(), 64);
        let positive = rx.recv().await.unwrap();
        assert_eq!(positive.device_address.as_str(), "00:11:22:33:44:03");
        assert_eq!(positive.signal_strength, None);
        assert_eq!(positive.network_name.as_deref(), Some("HomeNetwork"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wrong_link_type_fails_the_instance() {
        let mut stream = pcap_stream(&[]);
        stream[20..24].copy_from_slice(&1u32.to_le_bytes());
        let (_trigger, mut shutdown) = shutdown_channel();
        let (tx, _rx) = mpsc::channel(1);
        let id = SourceId::new("radio_monitor:wlan0mon").unwrap();
        let mut reader = stream.as_slice();
        let exit = stream_probe_requests(&mut reader, &id, &mut shutdown, &tx).await;
        assert!(matches!(exit, Err(SourceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn cancelled_before_header_exits_cleanly() {
        let (trigger, mut shutdown) = shutdown_channel();
        trigger.trigger();
        let (tx, _rx) = mpsc::channel(1);
        let id = SourceId::new("radio_monitor:wlan0mon").unwrap();
        let (mut pending_reader, _writer) = tokio::io::duplex(64);
        let exit = stream_probe_requests(&mut pending_reader, &id, &mut shutdown, &tx).await;
        assert_eq!(exit, Ok(SourceExit::Cancelled));
    }
}
