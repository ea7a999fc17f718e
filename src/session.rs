//! The per-rover state machine: owns the downstream socket, the current
//! upstream binding, upstream switching, byte counters, and the
//! registry lifecycle hooks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::geo::{self, GpggaFix};
use crate::nmea_log::NmeaLogHandle;
use crate::registry::{ConnectionRegistry, RoverSessionSnapshot, SessionDelta};
use crate::upstream;

const READ_CHUNK: usize = 4096;
const DRAIN_GRACE: Duration = Duration::from_millis(100);

struct Binding {
    mount_point: String,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

/// Per-rover session. One instance per accepted TCP connection, run to
/// completion on its own task by the listener.
pub struct SessionEngine {
    id: Uuid,
    remote_addr: SocketAddr,
    config_store: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    nmea_log: NmeaLogHandle,
    upstream: Option<Binding>,
    subscribed: bool,
    shutdown: broadcast::Receiver<()>,
}

impl SessionEngine {
    pub fn new(
        remote_addr: SocketAddr,
        config_store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        nmea_log: NmeaLogHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            config_store,
            registry,
            nmea_log,
            upstream: None,
            subscribed: false,
            shutdown,
        }
    }

    /// Drive the session to completion: register with the registry, serve
    /// the rover's request, forward corrections, handle switching, and
    /// finally mark the session closed.
    pub async fn run(mut self, rover: TcpStream) {
        self.registry
            .track(self.id, RoverSessionSnapshot::new(self.id, self.remote_addr));

        if let Err(e) = rover.set_nodelay(true) {
            debug!("could not set TCP_NODELAY for {}: {}", self.remote_addr, e);
        }

        let (mut rover_read, mut rover_write) = rover.into_split();
        let mut rover_buf = Vec::with_capacity(READ_CHUNK);
        let mut upstream_buf = vec![0u8; READ_CHUNK];

        'session: loop {
            let mut read_chunk = [0u8; READ_CHUNK];
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    debug!("session {} exiting on shutdown signal", self.id);
                    break 'session;
                }

                res = rover_read.read(&mut read_chunk) => {
                    match res {
                        Ok(0) => {
                            debug!("rover {} closed connection", self.remote_addr);
                            break 'session;
                        }
                        Ok(n) => {
                            self.registry.update(self.id, SessionDelta {
                                bytes_received_delta: n as u64,
                                ..Default::default()
                            });
                            rover_buf.extend_from_slice(&read_chunk[..n]);

                            match self.drain_rover_lines(&mut rover_buf, &mut rover_write).await {
                                LineOutcome::Continue => {},
                                LineOutcome::Close => break 'session,
                            }
                        }
                        Err(e) => {
                            warn!("rover {} read error: {}", self.remote_addr, e);
                            break 'session;
                        }
                    }
                }

                res = read_upstream(&mut self.upstream, &mut upstream_buf) => {
                    match res {
                        Some(Ok(n)) if n > 0 => {
                            if let Err(e) = rover_write.write_all(&upstream_buf[..n]).await {
                                warn!("failed forwarding upstream bytes to rover {}: {}", self.remote_addr, e);
                                break 'session;
                            }
                            self.registry.update(self.id, SessionDelta {
                                bytes_sent_delta: n as u64,
                                ..Default::default()
                            });
                        }
                        Some(Ok(_)) | Some(Err(_)) => {
                            // Zero-length read or transport error: upstream peer
                            // closed or errored. Unbind; rover stays connected
                            // and the next GPGGA re-dials.
                            info!("upstream for session {} ended; unbinding", self.id);
                            self.upstream = None;
                            self.registry.update(self.id, SessionDelta {
                                bound_mount_point: Some(None),
                                ..Default::default()
                            });
                        }
                        None => unreachable!("pending future never resolves"),
                    }
                }
            }
        }

        self.close_upstream().await;
        self.registry.mark_closed(self.id);
    }

    async fn drain_rover_lines(
        &mut self,
        buf: &mut Vec<u8>,
        rover_write: &mut OwnedWriteHalf,
    ) -> LineOutcome {
        loop {
            let Some(newline_at) = buf.iter().position(|b| *b == b'\n') else {
                return LineOutcome::Continue;
            };

            let line_bytes: Vec<u8> = buf.drain(..=newline_at).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            match self.dispatch_line(line, rover_write).await {
                LineOutcome::Continue => continue,
                LineOutcome::Close => return LineOutcome::Close,
            }
        }
    }

    async fn dispatch_line(&mut self, line: &str, rover_write: &mut OwnedWriteHalf) -> LineOutcome {
        let config = self.config_store.get();

        if line.starts_with("$GPGGA") || line.starts_with("$GNGGA") {
            self.nmea_log.log(self.id, line);
            self.handle_gpgga(line, &config.stations, &config.user_agent).await;
            return LineOutcome::Continue;
        }

        // Once subscribed, the rover's remaining request-header lines
        // (Host:, User-Agent:, ...) and any blank line already sent after
        // the GET are not fresh requests; ignore rather than reparse them.
        if self.subscribed {
            return LineOutcome::Continue;
        }

        if line.starts_with("GET / ") || line == "GET /" {
            let body = format!(
                "SOURCETABLE 200 OK\r\n\
                 Content-Type: text/plain\r\n\
                 \r\n\
                 STR;{};NTRIP Service;RTCM 3;;2;GPS;NTRIP;USA;0;0;1;0;none;none;B;N;0;\r\n\
                 ENDSOURCETABLE\r\n",
                config.mount_point
            );
            if let Err(e) = rover_write.write_all(body.as_bytes()).await {
                warn!("failed writing sourcetable to {}: {}", self.remote_addr, e);
            }
            return LineOutcome::Close;
        }

        if line.starts_with(&format!("GET /{}", config.mount_point)) {
            if let Err(e) = rover_write.write_all(b"ICY 200 OK\r\n\r\n").await {
                warn!("failed writing ICY response to {}: {}", self.remote_addr, e);
                return LineOutcome::Close;
            }
            self.subscribed = true;
            return LineOutcome::Continue;
        }

        let err = crate::error::ProtocolError::UnrecognizedRequest;
        warn!("{} from {}: {}", err, self.remote_addr, line);
        LineOutcome::Close
    }

    async fn handle_gpgga(&mut self, line: &str, stations: &[crate::config::Station], user_agent: &str) {
        let fix: GpggaFix = match geo::parse_gpgga(line) {
            Ok(fix) => fix,
            Err(e) => {
                warn!("ignoring unparseable GPGGA from {}: {}", self.remote_addr, e);
                return;
            },
        };

        self.registry.update(
            self.id,
            SessionDelta {
                last_position: Some((&fix).into()),
                ..Default::default()
            },
        );

        let selection = geo::find_closest_station(fix.latitude, fix.longitude, stations);
        let Some((station, distance)) = selection else {
            debug!("no station qualifies for session {}; keeping current binding", self.id);
            return;
        };

        let already_bound_to_selection = self
            .upstream
            .as_ref()
            .map(|b| b.mount_point == station.mount_point)
            .unwrap_or(false);

        if already_bound_to_selection {
            return;
        }

        if self.upstream.is_some() {
            debug!(
                "session {} switching upstream to {} ({:.1} m away)",
                self.id, station.mount_point, distance
            );
            self.close_upstream().await;
        } else {
            debug!(
                "session {} binding to {} ({:.1} m away)",
                self.id, station.mount_point, distance
            );
        }

        match upstream::dial(
            &station.host,
            station.port,
            &station.mount_point,
            station.username.as_deref(),
            station.password.as_deref(),
            user_agent,
        )
        .await
        {
            Ok(link) => {
                let (read_half, write_half) = link.socket.into_split();
                self.upstream = Some(Binding {
                    mount_point: link.mount_point.clone(),
                    read_half,
                    write_half,
                });
                self.registry.update(
                    self.id,
                    SessionDelta {
                        bound_mount_point: Some(Some(link.mount_point)),
                        ..Default::default()
                    },
                );
            },
            Err(e) => {
                warn!(
                    "upstream dial to {} failed for session {}: {}; remaining unbound",
                    station.mount_point, self.id, e
                );
            },
        }
    }

    async fn close_upstream(&mut self) {
        if let Some(mut binding) = self.upstream.take() {
            let _ = binding.write_half.shutdown().await;
            let mut scratch = [0u8; 1024];
            let _ = tokio::time::timeout(DRAIN_GRACE, binding.read_half.read(&mut scratch)).await;
            self.registry.update(
                self.id,
                SessionDelta {
                    bound_mount_point: Some(None),
                    ..Default::default()
                },
            );
        }
    }
}

enum LineOutcome {
    Continue,
    Close,
}

/// Read from the bound upstream if there is one; otherwise never resolves,
/// so the surrounding `select!` simply waits on the rover side. Mirrors the
/// `select! { n = sock.read_buf(...) => ..., _ = exit_rx.recv() => ... }`
/// shape used for the client-side read loop, generalized to an optional
/// upstream that may come and go across the session's lifetime.
async fn read_upstream(
    upstream: &mut Option<Binding>,
    buf: &mut [u8],
) -> Option<std::io::Result<usize>> {
    match upstream {
        Some(binding) => Some(binding.read_half.read(buf).await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use tokio::net::TcpListener;

    async fn store_with(config: ProxyConfig) -> Arc<ConfigStore> {
        let dir = std::env::temp_dir().join(format!("ntrip-proxy-session-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.json");
        tokio::fs::write(&path, config.to_json_pretty().unwrap())
            .await
            .unwrap();
        Arc::new(ConfigStore::load(&path).await.unwrap())
    }

    #[tokio::test]
    async fn sourcetable_request_closes_connection() {
        let config_store = store_with(ProxyConfig {
            mount_point: "PROXY".to_string(),
            ..ProxyConfig::default()
        })
        .await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (_exit_tx, exit_rx) = broadcast::channel(1);
        let (_log_tx, log_rx) = broadcast::channel(1);
        let nmea_log = crate::nmea_log::spawn_writer(
            std::env::temp_dir().join(format!("nmea-{}.log", Uuid::new_v4())),
            log_rx,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(server_addr).await.unwrap();
            sock.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
            let mut resp = Vec::new();
            sock.read_to_end(&mut resp).await.unwrap();
            resp
        });

        let (sock, peer) = listener.accept().await.unwrap();
        let engine = SessionEngine::new(peer, config_store, registry, nmea_log, exit_rx);
        engine.run(sock).await;

        let resp = client.await.unwrap();
        let text = String::from_utf8_lossy(&resp);
        assert!(text.contains("SOURCETABLE 200 OK"));
        assert!(text.contains("STR;PROXY;"));
        assert!(text.contains("ENDSOURCETABLE"));
    }

    #[tokio::test]
    async fn subscribe_request_gets_icy_ok_and_stays_open() {
        let config_store = store_with(ProxyConfig {
            mount_point: "PROXY".to_string(),
            ..ProxyConfig::default()
        })
        .await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (exit_tx, exit_rx) = broadcast::channel(1);
        let (_log_tx, log_rx) = broadcast::channel(1);
        let nmea_log = crate::nmea_log::spawn_writer(
            std::env::temp_dir().join(format!("nmea-{}.log", Uuid::new_v4())),
            log_rx,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(server_addr).await.unwrap();
            sock.write_all(b"GET /PROXY HTTP/1.0\r\n\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let (sock, peer) = listener.accept().await.unwrap();
        let engine = SessionEngine::new(peer, config_store, registry, nmea_log, exit_rx);
        let handle = tokio::spawn(engine.run(sock));

        let resp = client.await.unwrap();
        assert_eq!(resp, "ICY 200 OK\r\n\r\n");

        let _ = exit_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn header_lines_after_subscribe_do_not_close_the_session() {
        let config_store = store_with(ProxyConfig {
            mount_point: "PROXY".to_string(),
            ..ProxyConfig::default()
        })
        .await;
        let registry = Arc::new(ConnectionRegistry::new());
        let (exit_tx, exit_rx) = broadcast::channel(1);
        let (_log_tx, log_rx) = broadcast::channel(1);
        let nmea_log = crate::nmea_log::spawn_writer(
            std::env::temp_dir().join(format!("nmea-{}.log", Uuid::new_v4())),
            log_rx,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(server_addr).await.unwrap();
            sock.write_all(b"GET /PROXY HTTP/1.1\r\nHost: proxy.example\r\nUser-Agent: NTRIP Client/1.0\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            let icy = String::from_utf8_lossy(&buf[..n]).to_string();

            // A read that would only return Ok(0) once the other side closes
            // the connection; a timeout here proves the header lines above
            // did not tear the session down.
            let mut probe = [0u8; 16];
            let stayed_open = tokio::time::timeout(std::time::Duration::from_millis(50), sock.read(&mut probe))
                .await
                .is_err();

            (icy, stayed_open)
        });

        let (sock, peer) = listener.accept().await.unwrap();
        let engine = SessionEngine::new(peer, config_store, registry, nmea_log, exit_rx);
        let handle = tokio::spawn(engine.run(sock));

        let (icy, stayed_open) = client.await.unwrap();
        assert_eq!(icy, "ICY 200 OK\r\n\r\n");
        assert!(stayed_open);

        let _ = exit_tx.send(());
        let _ = handle.await;
    }
}
