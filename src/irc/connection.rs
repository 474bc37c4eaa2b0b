/// One live IRC session over one non-blocking socket.
///
/// A `Connection` owns its socket plus two byte buffers: outbound bytes that
/// have been queued but not yet written, and the inbound tail of a line that
/// has not been terminated yet. Every protocol sender funnels through
/// [`Connection::queue_send`]; only [`Connection::flush`] touches the socket
/// for writing.
use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::codec::LineCodec;
use super::message::compose;
use crate::config::LivenessPolicy;
use crate::swarm::identity::Identity;

/// Bytes requested from the socket per read attempt.
const READ_CHUNK: usize = 4096;

/// Registry-assigned connection id (the readiness token).
pub type ConnectionId = usize;

/// What the liveness check wants done with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Recently active, or already waiting on a keepalive.
    Alive,
    /// Idle long enough that a keepalive ping should go out.
    NeedsPing,
    /// Idle past the hard limit; drop it regardless of keepalive state.
    Expired,
}

#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    codec: LineCodec,
    outbound: BytesMut,
    inbound: BytesMut,
    last_read: Instant,
    ping_sent: bool,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    channels: Vec<String>,
    /// Last numeric reply code seen from the server (0 before any).
    pub last_status: u16,
}

impl<S> Connection<S> {
    pub fn new(stream: S, identity: Identity) -> Self {
        Self {
            stream,
            codec: LineCodec,
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            last_read: Instant::now(),
            ping_sent: false,
            nickname: identity.nickname,
            username: identity.username,
            realname: identity.realname,
            channels: Vec::new(),
            last_status: 0,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Queue one line for sending. Encodes as UTF-8 and appends `\r\n`.
    pub fn queue_send(&mut self, line: &str) {
        // LineCodec's encoder cannot fail.
        let _ = self.codec.encode(line, &mut self.outbound);
    }

    fn queue_command(&mut self, command: &str, params: &[&str]) {
        self.queue_send(&compose(command, params));
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent
    }

    pub fn is_own_nickname(&self, nickname: &str) -> bool {
        self.nickname == nickname
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn add_channel(&mut self, channel: &str) {
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_owned());
        }
    }

    pub fn remove_channel(&mut self, channel: &str) {
        self.channels.retain(|c| c != channel);
    }

    /// Decide what the idle time at `now` calls for.
    pub fn liveness(&self, now: Instant, policy: &LivenessPolicy) -> Liveness {
        let idle = now.saturating_duration_since(self.last_read);
        if idle > policy.timeout_after {
            Liveness::Expired
        } else if idle > policy.ping_after && !self.ping_sent {
            Liveness::NeedsPing
        } else {
            Liveness::Alive
        }
    }

    /// `<nick (status): #a, #b>`
    pub fn summary(&self) -> String {
        format!(
            "<{} ({}): {}>",
            self.nickname,
            self.last_status,
            self.channels.join(", ")
        )
    }

    // ── Protocol senders ─────────────────────────────────────────

    /// Register with the server under this connection's identity.
    pub fn identify(&mut self) {
        let nickname = self.nickname.clone();
        let username = self.username.clone();
        let realname = self.realname.clone();
        self.send_nick(&nickname);
        self.send_user(&username, &realname);
    }

    pub fn send_nick(&mut self, nickname: &str) {
        self.queue_command("NICK", &[nickname]);
    }

    pub fn send_user(&mut self, ident: &str, realname: &str) {
        self.queue_command("USER", &[ident, "-", "-", realname]);
    }

    /// Send a keepalive ping and mark it outstanding.
    pub fn send_ping(&mut self, token: &str) {
        self.queue_command("PING", &[token]);
        self.ping_sent = true;
    }

    pub fn send_pong(&mut self, token: &str) {
        self.queue_command("PONG", &[token]);
    }

    pub fn send_join(&mut self, channel: &str) {
        self.queue_command("JOIN", &[channel]);
    }

    pub fn send_quit(&mut self, reason: &str) {
        self.queue_command("QUIT", &[reason]);
    }

    pub fn send_privmsg(&mut self, target: &str, text: &str) {
        self.queue_command("PRIVMSG", &[target, text]);
    }

    pub fn send_who(&mut self, channel: &str) {
        self.queue_command("WHO", &[channel]);
    }
}

impl<S: Read + Write> Connection<S> {
    /// One non-blocking write attempt. Drops exactly the written prefix from
    /// the outbound buffer and returns how many bytes went out.
    ///
    /// `WouldBlock` is returned as an error so the caller can wait for the
    /// next writability notification.
    pub fn flush(&mut self) -> io::Result<usize> {
        if self.outbound.is_empty() {
            return Ok(0);
        }
        let written = loop {
            match self.stream.write(&self.outbound) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.outbound.advance(written);
        Ok(written)
    }

    /// One non-blocking read attempt.
    ///
    /// - `Ok(None)`: nothing to read right now.
    /// - `Ok(Some(lines))`: data arrived; `lines` yields every line it
    ///   completed (possibly none, when only the partial tail grew).
    /// - `Err(_)`: the peer closed the connection or the socket failed.
    pub fn read_available(&mut self) -> io::Result<Option<DecodedLines>> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        };

        self.inbound.extend_from_slice(&chunk[..n]);
        // Everything up to the last newline is complete; the rest stays behind.
        let complete = match self.inbound.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.inbound.split_to(pos + 1),
            None => BytesMut::new(),
        };

        self.last_read = Instant::now();
        self.ping_sent = false;

        Ok(Some(DecodedLines {
            codec: self.codec,
            buf: complete,
        }))
    }
}

/// Lines completed by one read, decoded lazily as they are pulled.
#[derive(Debug)]
pub struct DecodedLines {
    codec: LineCodec,
    buf: BytesMut,
}

impl Iterator for DecodedLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.codec.decode(&mut self.buf).ok().flatten()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// In-memory socket with scripted read chunks and per-write byte caps.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedStream {
        pub reads: VecDeque<io::Result<Vec<u8>>>,
        pub write_caps: VecDeque<usize>,
        pub written: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_caps.pop_front() {
                Some(cap) => {
                    let n = cap.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn identity() -> Identity {
        Identity::new("wings", "wings", "Wings Bot")
    }

    fn connection_with_reads(chunks: &[&[u8]]) -> Connection<ScriptedStream> {
        let stream = ScriptedStream {
            reads: chunks.iter().map(|c| Ok(c.to_vec())).collect(),
            ..Default::default()
        };
        Connection::new(stream, identity())
    }

    fn read_all(conn: &mut Connection<ScriptedStream>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(lines) = conn.read_available().unwrap() {
            out.extend(lines);
        }
        out
    }

    // ── Reading ──────────────────────────────────────────────────

    #[test]
    fn split_reads_match_single_read() {
        let stream = b":irc.example 001 wings :Welcome\r\nPING :abc\r\n:n!u@h PRIVMSG #c :hi there\r\n";
        let mut whole = connection_with_reads(&[stream]);
        let expected = read_all(&mut whole);
        assert_eq!(expected.len(), 3);

        for cut in 1..stream.len() {
            let mut split = connection_with_reads(&[&stream[..cut], &stream[cut..]]);
            assert_eq!(read_all(&mut split), expected, "cut at {cut}");
        }
    }

    #[test]
    fn partial_only_read_is_alive() {
        let mut conn = connection_with_reads(&[b"PING :ab"]);
        let lines: Vec<_> = conn.read_available().unwrap().unwrap().collect();
        assert!(lines.is_empty());
        assert!(conn.read_available().unwrap().is_none());
    }

    #[test]
    fn eof_is_an_error() {
        let mut conn = connection_with_reads(&[b""]);
        let err = conn.read_available().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn socket_error_is_an_error() {
        let mut conn = Connection::new(
            ScriptedStream {
                reads: VecDeque::from([Err(io::ErrorKind::ConnectionReset.into())]),
                ..Default::default()
            },
            identity(),
        );
        assert!(conn.read_available().is_err());
    }

    #[test]
    fn read_clears_keepalive_flag() {
        let mut conn = connection_with_reads(&[b"PONG :hello\r\n"]);
        conn.send_ping("hello");
        assert!(conn.ping_outstanding());
        read_all(&mut conn);
        assert!(!conn.ping_outstanding());
    }

    #[test]
    fn undecodable_line_is_skipped() {
        let mut conn = connection_with_reads(&[b"A\r\nB\x00\r\nC\r\n"]);
        assert_eq!(read_all(&mut conn), vec!["A", "C"]);
    }

    // ── Writing ──────────────────────────────────────────────────

    #[test]
    fn partial_write_keeps_unsent_tail() {
        let mut conn = Connection::new(
            ScriptedStream {
                write_caps: VecDeque::from([1500]),
                ..Default::default()
            },
            identity(),
        );
        // 4998 bytes of text + CRLF = 5000 queued.
        conn.queue_send(&"x".repeat(4998));
        assert_eq!(conn.pending_output().len(), 5000);

        assert_eq!(conn.flush().unwrap(), 1500);
        assert_eq!(conn.pending_output().len(), 3500);
        assert!(conn.has_pending_output());

        let err = conn.flush().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(conn.pending_output().len(), 3500);
    }

    #[test]
    fn identify_queues_nick_then_user() {
        let mut conn = Connection::new(ScriptedStream::default(), identity());
        conn.identify();
        assert_eq!(
            conn.pending_output(),
            b"NICK :wings\r\nUSER wings - - :Wings Bot\r\n"
        );
    }

    #[test]
    fn senders_format_lines() {
        let mut conn = Connection::new(ScriptedStream::default(), identity());
        conn.send_pong("tok");
        conn.send_join("#swarm");
        conn.send_privmsg("#swarm", "hi all");
        conn.send_who("#swarm");
        conn.send_quit("bye");
        assert_eq!(
            std::str::from_utf8(conn.pending_output()).unwrap(),
            "PONG :tok\r\nJOIN :#swarm\r\nPRIVMSG #swarm :hi all\r\nWHO :#swarm\r\nQUIT :bye\r\n"
        );
    }

    // ── State ────────────────────────────────────────────────────

    #[test]
    fn channel_membership_is_idempotent() {
        let mut conn = Connection::new(ScriptedStream::default(), identity());
        conn.add_channel("#a");
        conn.add_channel("#a");
        conn.add_channel("#b");
        conn.remove_channel("#zzz");
        conn.remove_channel("#a");
        assert_eq!(conn.channels(), ["#b".to_string()]);
    }

    #[test]
    fn liveness_thresholds() {
        let policy = LivenessPolicy::default();
        let mut conn = Connection::new(ScriptedStream::default(), identity());
        let start = conn.last_read();

        assert_eq!(conn.liveness(start + Duration::from_secs(10), &policy), Liveness::Alive);
        assert_eq!(
            conn.liveness(start + Duration::from_secs(31), &policy),
            Liveness::NeedsPing
        );

        conn.send_ping("hello");
        assert_eq!(conn.liveness(start + Duration::from_secs(31), &policy), Liveness::Alive);
        assert_eq!(
            conn.liveness(start + Duration::from_secs(121), &policy),
            Liveness::Expired
        );
    }

    #[test]
    fn summary_lists_channels() {
        let mut conn = Connection::new(ScriptedStream::default(), identity());
        conn.last_status = 1;
        conn.add_channel("#a");
        conn.add_channel("#b");
        assert_eq!(conn.summary(), "<wings (1): #a, #b>");
    }
}
