/// Circuit renewal over the Tor control protocol.
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::proxy::ProxyError;

/// Asks the anonymizing network for a fresh route.
#[async_trait]
pub trait CircuitRenewer: Send + Sync {
    async fn new_circuit(&self) -> Result<(), ProxyError>;
}

/// A Tor control port client that sends `SIGNAL NEWNYM`.
#[derive(Debug, Clone)]
pub struct TorControl {
    addr: String,
    password: String,
}

impl TorControl {
    pub fn new(addr: &str, password: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            password: password.to_owned(),
        }
    }
}

#[async_trait]
impl CircuitRenewer for TorControl {
    async fn new_circuit(&self) -> Result<(), ProxyError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let auth = format!("AUTHENTICATE \"{}\"", escape_password(&self.password));
        for command in [auth.as_str(), "SIGNAL NEWNYM", "QUIT"] {
            write_half.write_all(command.as_bytes()).await?;
            write_half.write_all(b"\r\n").await?;
            expect_ok(&mut reader, command).await?;
        }
        info!(control = %self.addr, "tor: requested new circuit");
        Ok(())
    }
}

/// Escape `"` and `\` for a quoted control-protocol string.
fn escape_password(password: &str) -> String {
    password.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Read one reply line and require a `250` status.
async fn expect_ok<R>(reader: &mut R, command: &str) -> Result<(), ProxyError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut reply = String::new();
    if reader.read_line(&mut reply).await? == 0 {
        return Err(ProxyError::Control(format!("connection closed after {}", verb(command))));
    }
    let reply = reply.trim_end();
    debug!(reply, "tor: control reply to {}", verb(command));
    if !reply.starts_with("250") {
        return Err(ProxyError::Control(format!("{} refused: {reply}", verb(command))));
    }
    Ok(())
}

/// First word of a command, so passwords never reach the logs.
fn verb(command: &str) -> &str {
    command.split(' ').next().unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    async fn fake_control(replies: &'static [&'static str]) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = sock.into_split();
            let mut reader = BufReader::new(read_half);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_owned());
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (addr, task)
    }

    #[tokio::test]
    async fn newnym_sequence() {
        let (addr, server) = fake_control(&["250 OK\r\n", "250 OK\r\n", "250 closing connection\r\n"]).await;
        TorControl::new(&addr, "pa\"ss").new_circuit().await.unwrap();
        assert_eq!(
            server.await.unwrap(),
            vec!["AUTHENTICATE \"pa\\\"ss\"", "SIGNAL NEWNYM", "QUIT"]
        );
    }

    #[tokio::test]
    async fn rejected_authentication() {
        let (addr, server) = fake_control(&["515 Authentication failed\r\n"]).await;
        let err = TorControl::new(&addr, "wrong").new_circuit().await.unwrap_err();
        assert!(matches!(err, ProxyError::Control(_)), "{err}");
        assert!(!err.to_string().contains("wrong"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_control_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TorControl::new(&addr, "").new_circuit().await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)), "{err}");
    }
}
