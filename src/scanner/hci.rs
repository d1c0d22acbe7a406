//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges. A busy device (`EBUSY`)
//! is reported as [`ScanError::InProgress`].

use super::{BoxFuture, EVENT_CHANNEL_BUFFER_SIZE, ScanError, ScanFacility, adapter_index};
use crate::advertisement::AdvertisementEvent;
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// RSSI value meaning "not available" in advertising reports.
const RSSI_UNAVAILABLE: i8 = 127;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Map an OS error to a scan error, keeping "device busy" distinguishable.
fn os_error(context: &str, err: io::Error) -> ScanError {
    if err.raw_os_error() == Some(libc::EBUSY) {
        ScanError::InProgress(format!("{context}: {err}"))
    } else {
        ScanError::Bluetooth(format!("{context}: {err}"))
    }
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(os_error(
            "Failed to create HCI socket",
            io::Error::last_os_error(),
        ));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error(
            "Failed to bind HCI socket",
            io::Error::last_os_error(),
        ));
    }

    Ok(())
}

/// Set HCI socket filter to LE meta events only
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error(
            "Failed to set HCI filter",
            io::Error::last_os_error(),
        ));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(os_error(
            "Failed to send HCI command",
            io::Error::last_os_error(),
        ));
    }

    Ok(())
}

/// Parameters for LE Set Scan Parameters: passive scan, 10ms interval, 10ms window.
fn scan_parameters() -> [u8; 7] {
    let interval: u16 = 0x0010; // 0.625ms units
    let window: u16 = 0x0010;
    let [i0, i1] = interval.to_le_bytes();
    let [w0, w1] = window.to_le_bytes();
    [
        LE_SCAN_PASSIVE,
        i0,
        i1,
        w0,
        w1,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Enable or disable LE scanning; duplicates are never filtered.
fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    let packet = hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &[u8::from(enable), 0x00],
    );
    send_hci_command(fd, &packet)
}

/// Configure LE scanning parameters and enable scanning
fn configure_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
    send_hci_command(fd, &packet)?;
    set_scan_enable(fd, true)
}

/// Local name and manufacturer data carried in AD structures.
fn parse_ad_structures(ad_data: &[u8]) -> (Option<String>, HashMap<u16, Vec<u8>>) {
    let mut complete_name = None;
    let mut short_name = None;
    let mut manufacturer_data = HashMap::new();

    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let value = &ad_data[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_COMPLETE_NAME => {
                complete_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_SHORT_NAME => {
                short_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_TYPE_MANUFACTURER_DATA if value.len() >= 2 => {
                // Company ID is little-endian, followed by the vendor payload
                let company = u16::from_le_bytes([value[0], value[1]]);
                manufacturer_data.insert(company, value[2..].to_vec());
            }
            _ => {}
        }

        offset += 1 + len;
    }

    (complete_name.or(short_name), manufacturer_data)
}

/// Parse an LE advertising report event into one advertisement per report.
///
/// Reports follow each other as complete records; parsing stops at the first
/// truncated one.
fn parse_advertising_reports(data: &[u8]) -> Vec<AdvertisementEvent> {
    let mut advertisements = Vec::new();

    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let Some((&num_reports, mut rest)) = data.get(4..).and_then(|params| params.split_first())
    else {
        return advertisements;
    };

    for _ in 0..num_reports {
        // event_type(1) + addr_type(1) + address(6) + data_len(1)
        if rest.len() < 9 {
            break;
        }

        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);

        let data_len = rest[8] as usize;
        // AD data is followed by the RSSI as a signed byte
        let Some(ad_data) = rest.get(9..9 + data_len) else {
            break;
        };
        let Some(&rssi) = rest.get(9 + data_len) else {
            break;
        };
        let rssi = Some(rssi as i8)
            .filter(|rssi| *rssi != RSSI_UNAVAILABLE)
            .map(i16::from);

        let (name, manufacturer_data) = parse_ad_structures(ad_data);
        advertisements.push(AdvertisementEvent {
            address: MacAddress::from_le_bytes(addr),
            name,
            rssi,
            manufacturer_data,
        });

        rest = &rest[10 + data_len..];
    }

    advertisements
}

/// An enabled scan: the command socket plus the task reading reports.
struct ScanSession {
    cmd_fd: OwnedFd,
    reader: JoinHandle<()>,
}

impl ScanSession {
    /// Open sockets on `dev_id`, enable scanning and forward reports to `tx`.
    fn begin(dev_id: u16, tx: mpsc::Sender<AdvertisementEvent>) -> Result<Self, ScanError> {
        // Open and configure HCI socket for receiving events
        let fd = open_hci_socket()?;
        bind_hci_socket(&fd, dev_id)?;
        set_hci_filter(&fd)?;

        // Separate socket for sending commands
        let cmd_fd = open_hci_socket()?;
        bind_hci_socket(&cmd_fd, dev_id)?;
        configure_le_scan(&cmd_fd)?;

        let async_fd = AsyncFd::new(fd)
            .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

        Ok(ScanSession {
            cmd_fd,
            reader: tokio::spawn(read_reports(async_fd, tx)),
        })
    }

    /// Disable scanning and stop the reader.
    async fn end(self) -> Result<(), ScanError> {
        let disabled = set_scan_enable(&self.cmd_fd, false);
        self.reader.abort();
        let _ = self.reader.await;
        disabled
    }
}

/// Read HCI events until the socket fails or the receiver goes away.
async fn read_reports(async_fd: AsyncFd<OwnedFd>, tx: mpsc::Sender<AdvertisementEvent>) {
    let mut buf = [0u8; 258]; // Max HCI event size

    loop {
        // Wait for the socket to be readable
        let mut guard = match async_fd.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => break,  // EOF or empty read
                Ok(Err(_)) => break, // Read error
                Err(_) => break,     // WouldBlock - no more data
            };

            if n >= 4
                && buf[0] == HCI_EVENT_PKT
                && buf[1] == EVT_LE_META_EVENT
                && buf[3] == EVT_LE_ADVERTISING_REPORT
            {
                for advertisement in parse_advertising_reports(&buf[..n]) {
                    if tx.send(advertisement).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Scanning through a raw HCI socket on one device.
pub struct HciScanner {
    dev_id: u16,
    session: Option<ScanSession>,
}

impl HciScanner {
    /// Check that `adapter` (e.g. `hci0`) can be opened and prepare a scanner for it.
    pub fn open(adapter: &str) -> Result<Self, ScanError> {
        let dev_id = adapter_index(adapter)?;
        let socket = open_hci_socket()?;
        bind_hci_socket(&socket, dev_id)?;
        info!(adapter, "using raw HCI socket");

        Ok(HciScanner {
            dev_id,
            session: None,
        })
    }
}

impl ScanFacility for HciScanner {
    fn start(
        &mut self,
        events: mpsc::Sender<AdvertisementEvent>,
    ) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(previous) = self.session.take() {
                previous.end().await?;
            }
            self.session = Some(ScanSession::begin(self.dev_id, events)?);
            Ok(())
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            match self.session.take() {
                Some(session) => session.end().await,
                None => Ok(()),
            }
        })
    }

    fn discover_once(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<AdvertisementEvent>, ScanError>> {
        Box::pin(async move {
            let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            let session = ScanSession::begin(self.dev_id, tx)?;

            // Keep the latest report per device, in first-seen order
            let deadline = Instant::now() + timeout;
            let mut found: Vec<AdvertisementEvent> = Vec::new();
            while let Ok(Some(advertisement)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                match found.iter_mut().find(|seen| seen.address == advertisement.address) {
                    Some(seen) => *seen = advertisement,
                    None => found.push(advertisement),
                }
            }

            if let Err(err) = session.end().await {
                debug!(%err, "failed to disable scanning after sweep");
            }
            Ok(found)
        })
    }
}
