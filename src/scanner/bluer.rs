//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to drive discovery through the BlueZ
//! daemon. It requires the `bluetoothd` daemon to be running. BlueZ reports a
//! discovery that collides with another client's as `org.bluez.Error.InProgress`,
//! which is surfaced as [`ScanError::InProgress`].

use super::{BoxFuture, ScanError, ScanFacility};
use crate::advertisement::AdvertisementEvent;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::InProgress => ScanError::InProgress(err.message),
            _ => ScanError::Bluetooth(err.to_string()),
        }
    }
}

/// Discovery through BlueZ on a single adapter.
pub struct BluerScanner {
    // Keeps the D-Bus connection alive for the adapter handle.
    _session: Session,
    adapter: Adapter,
    discovery: Option<JoinHandle<()>>,
}

impl BluerScanner {
    /// Connect to BlueZ and prepare `adapter_name` (e.g. `hci0`) for LE discovery.
    pub async fn open(adapter_name: &str) -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.adapter(adapter_name)?;
        adapter.set_powered(true).await?;
        adapter.set_discovery_filter(le_discovery_filter()).await?;
        info!(adapter = adapter.name(), "using BlueZ adapter");

        Ok(BluerScanner {
            _session: session,
            adapter,
            discovery: None,
        })
    }
}

/// LE-only discovery that reports every advertisement, not just the first per device.
fn le_discovery_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    }
}

/// Read the advertisement-derived properties BlueZ keeps for `address`.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<AdvertisementEvent, ScanError> {
    let device = adapter.device(address)?;

    Ok(AdvertisementEvent {
        address: address.into(),
        name: device.name().await?,
        rssi: device.rssi().await?,
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
    })
}

impl ScanFacility for BluerScanner {
    fn start(
        &mut self,
        events: mpsc::Sender<AdvertisementEvent>,
    ) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(previous) = self.discovery.take() {
                previous.abort();
            }

            let adapter = self.adapter.clone();
            let (ready_tx, ready_rx) = oneshot::channel();

            // The task owns the discovery stream; dropping it ends the BlueZ session.
            let task = tokio::spawn(async move {
                let stream = match adapter.discover_devices_with_changes().await {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(ScanError::from(err)));
                        return;
                    }
                };
                let mut stream = pin!(stream);

                while let Some(event) = stream.next().await {
                    let AdapterEvent::DeviceAdded(address) = event else {
                        continue;
                    };
                    match read_advertisement(&adapter, address).await {
                        Ok(advertisement) => {
                            if events.send(advertisement).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!(%address, %err, "skipping device"),
                    }
                }
            });
            // Held before waiting so that `stop` reaches the task even when
            // this future is dropped mid-start.
            self.discovery = Some(task);

            let result = match ready_rx.await {
                Ok(result) => result,
                Err(_) => Err(ScanError::Bluetooth(
                    "discovery task ended before starting".to_string(),
                )),
            };
            if result.is_err()
                && let Some(task) = self.discovery.take()
            {
                task.abort();
            }
            result
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), ScanError>> {
        Box::pin(async move {
            if let Some(task) = self.discovery.take() {
                task.abort();
                let _ = task.await;
            }
            Ok(())
        })
    }

    fn discover_once(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<AdvertisementEvent>, ScanError>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            let mut addresses: Vec<Address> = Vec::new();
            {
                let stream = self.adapter.discover_devices().await?;
                let mut stream = pin!(stream);

                while let Ok(Some(event)) = tokio::time::timeout_at(deadline, stream.next()).await {
                    if let AdapterEvent::DeviceAdded(address) = event
                        && !addresses.contains(&address)
                    {
                        addresses.push(address);
                    }
                }
            }

            let mut found = Vec::with_capacity(addresses.len());
            for address in addresses {
                match read_advertisement(&self.adapter, address).await {
                    Ok(advertisement) => found.push(advertisement),
                    Err(err) => debug!(%address, %err, "skipping device"),
                }
            }
            Ok(found)
        })
    }
}
