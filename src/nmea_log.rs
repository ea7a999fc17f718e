//! Newline-delimited NMEA log: a single writer task fed by every session
//! over an mpsc channel, keeping line-granularity writes atomic without
//! requiring each session to hold a lock on the file.

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};
use uuid::Uuid;

/// One received GPGGA sentence, tagged with the session that produced it.
#[derive(Clone, Debug)]
pub struct NmeaLogEntry {
    pub session_id: Uuid,
    pub sentence: String,
}

/// Handle sessions use to submit sentences to the writer task.
#[derive(Clone)]
pub struct NmeaLogHandle {
    tx: mpsc::UnboundedSender<NmeaLogEntry>,
}

impl NmeaLogHandle {
    pub fn log(&self, session_id: Uuid, sentence: &str) {
        let entry = NmeaLogEntry {
            session_id,
            sentence: sentence.to_string(),
        };
        if self.tx.send(entry).is_err() {
            warn!("NMEA log writer task has exited; dropping sentence");
        }
    }
}

/// Spawn the writer task, returning a cloneable handle for sessions.
pub fn spawn_writer(
    path: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) -> NmeaLogHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<NmeaLogEntry>();

    tokio::spawn(async move {
        let file = OpenOptions::new().create(true).append(true).open(&path).await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                error!("could not open NMEA log {}: {}", path.display(), e);
                return;
            },
        };

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    match entry {
                        Some(entry) => {
                            let line = format!("{} {}\n", entry.session_id, entry.sentence);
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                error!("failed writing NMEA log line: {}", e);
                            }
                        },
                        None => break,
                    }
                },
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        let _ = file.flush().await;
    });

    NmeaLogHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writer_appends_lines_for_each_entry() {
        let dir = std::env::temp_dir().join(format!("ntrip-proxy-nmea-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("nmea.log");

        let (_exit_tx, exit_rx) = broadcast::channel(1);
        let handle = spawn_writer(path.clone(), exit_rx);

        let id = Uuid::new_v4();
        handle.log(id, "$GNGGA,172814.0,3723.2475,N,12158.3416,W,1,07,1.0,9.0,M,,,,*0B");
        handle.log(id, "$GNGGA,172815.0,3723.2475,N,12158.3416,W,1,07,1.0,9.0,M,,,,*0A");

        // Give the writer task a chance to drain the channel.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().all(|l| l.contains(&id.to_string())));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
