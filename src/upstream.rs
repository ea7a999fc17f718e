//! Dials an upstream NTRIP caster and forwards its byte stream opaquely.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live TCP session to a caster, tagged with the mount-point it serves.
/// Owned exclusively by one rover session; destroyed on session end,
/// station switch, or upstream close/error.
pub struct UpstreamLink {
    pub mount_point: String,
    pub socket: TcpStream,
}

/// Open a TCP session to `host:port` and issue the NTRIP `GET /<mount>`
/// request described by the wire protocol. Does not parse the caster's
/// response; subsequent bytes, including the response header block, are
/// the caller's to forward opaquely.
pub async fn dial(
    host: &str,
    port: u16,
    mount: &str,
    username: Option<&str>,
    password: Option<&str>,
    user_agent: &str,
) -> Result<UpstreamLink, TransportError> {
    if host.is_empty() || mount.is_empty() || port == 0 {
        return Err(TransportError::Config(
            "upstream dial requires a non-empty host, mount and port".into(),
        ));
    }

    debug!("dialing upstream {}:{} mount={}", host, port, mount);

    let addr = format!("{host}:{port}");
    let mut socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout {
            host: host.to_string(),
            port,
            secs: CONNECT_TIMEOUT.as_secs(),
        })??;

    let request = build_request(host, port, mount, username, password, user_agent);
    socket.write_all(request.as_bytes()).await?;
    socket.flush().await?;

    Ok(UpstreamLink {
        mount_point: mount.to_string(),
        socket,
    })
}

fn build_request(
    host: &str,
    port: u16,
    mount: &str,
    username: Option<&str>,
    password: Option<&str>,
    user_agent: &str,
) -> String {
    let mut request = format!(
        "GET /{mount} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Ntrip-Version: Ntrip/2.0\r\n\
         User-Agent: {user_agent}\r\n\
         Connection: keep-alive\r\n"
    );

    let user = username.unwrap_or("");
    let pass = password.unwrap_or("");
    if !user.is_empty() || !pass.is_empty() {
        let auth = general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Authorization: Basic {auth}\r\n"));
    }

    request.push_str("\r\n");
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn request_is_crlf_terminated_and_double_terminated() {
        let req = build_request("caster.example", 2101, "MOUNT", None, None, "NTRIP Client/1.0");
        assert!(req.starts_with("GET /MOUNT HTTP/1.1\r\n"));
        assert!(req.contains("Host: caster.example:2101\r\n"));
        assert!(req.contains("Ntrip-Version: Ntrip/2.0\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_includes_basic_auth_when_credentials_present() {
        let req = build_request(
            "caster.example",
            2101,
            "MOUNT",
            Some("bob"),
            Some("secret"),
            "NTRIP Client/1.0",
        );
        let expected = general_purpose::STANDARD.encode("bob:secret");
        assert!(req.contains(&format!("Authorization: Basic {expected}\r\n")));
    }

    #[test]
    fn request_omits_auth_header_without_credentials() {
        let req = build_request("caster.example", 2101, "MOUNT", None, None, "NTRIP Client/1.0");
        assert!(!req.contains("Authorization"));
    }

    #[tokio::test]
    async fn dial_rejects_empty_mount() {
        let err = dial("caster.example", 2101, "", None, None, "ua").await;
        assert!(matches!(err, Err(TransportError::Config(_))));
    }

    #[tokio::test]
    async fn dial_writes_request_to_accepted_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = sock.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let link = dial(
            &addr.ip().to_string(),
            addr.port(),
            "MOUNT",
            None,
            None,
            "NTRIP Client/1.0",
        )
        .await
        .unwrap();
        assert_eq!(link.mount_point, "MOUNT");

        let received = server.await.unwrap();
        assert!(received.starts_with("GET /MOUNT HTTP/1.1\r\n"));
        assert!(received.ends_with("\r\n\r\n"));
    }
}
