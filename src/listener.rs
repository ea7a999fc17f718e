//! Accepts TCP connections on the configured downstream port and spawns
//! one [`SessionEngine`] per accepted connection.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::error::ProxyError;
use crate::nmea_log::NmeaLogHandle;
use crate::registry::ConnectionRegistry;
use crate::session::SessionEngine;

pub struct Listener {
    config_store: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    nmea_log: NmeaLogHandle,
    shutdown: broadcast::Sender<()>,
}

impl Listener {
    pub fn new(
        config_store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        nmea_log: NmeaLogHandle,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config_store,
            registry,
            nmea_log,
            shutdown,
        }
    }

    /// Bind and accept connections until a shutdown signal arrives. A bind
    /// failure is fatal and returned to the caller.
    pub async fn run(self) -> Result<(), ProxyError> {
        let config = self.config_store.get();
        let bind_addr = format!("{}:{}", config.interface, config.port);

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            error!("failed to bind NTRIP listener on {}: {}", bind_addr, e);
            ProxyError::Io(e)
        })?;

        info!("NTRIP proxy listening on {}", bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("listener shutting down, no longer accepting connections");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, remote_addr)) => {
                            info!("accepted rover connection from {}", remote_addr);
                            let engine = SessionEngine::new(
                                remote_addr,
                                self.config_store.clone(),
                                self.registry.clone(),
                                self.nmea_log.clone(),
                                self.shutdown.subscribe(),
                            );
                            tokio::spawn(async move {
                                engine.run(socket).await;
                            });
                        },
                        Err(e) => {
                            warn!("accept error: {}", e);
                        },
                    }
                }
            }
        }

        Ok(())
    }
}
