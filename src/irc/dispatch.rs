/// Inbound line dispatch: parses each decoded line, runs the built-in
/// handler for its command, and publishes it on the event bus.
///
/// Events are published under two roots: `received/...` when another party
/// acted (or the server spoke), and `self/...` when the acting or affected
/// party is this connection's own nickname.
use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::debug;

use super::connection::{Connection, ConnectionId};
use super::message::{remove_colon, Hostmask, Message, ParseError};
use crate::events::{EventBus, Payload};

/// Reply code a server sends once registration is complete.
const RPL_WELCOME: &str = "001";

/// Channel name sigils.
const CHANNEL_SIGILS: [char; 2] = ['#', '&'];

/// CTCP ACTION framing.
const ACTION_PREFIX: &str = "\x01ACTION ";
const CTCP_DELIM: char = '\x01';

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{command}: missing argument {index}")]
    MissingArgument { command: String, index: usize },
}

/// One parsed inbound line, plus who received it.
#[derive(Debug, Clone)]
pub struct Line {
    pub raw: String,
    pub message: Message,
    pub connection: ConnectionId,
}

impl Line {
    pub fn parse(raw: &str, connection: ConnectionId) -> Result<Self, DispatchError> {
        Ok(Self {
            raw: raw.to_owned(),
            message: Message::parse(raw)?,
            connection,
        })
    }

    pub fn command(&self) -> &str {
        &self.message.command
    }

    pub fn args(&self) -> &[String] {
        &self.message.params
    }

    /// Argument `index`, or a `MissingArgument` error naming the command.
    pub fn arg(&self, index: usize) -> Result<&str, DispatchError> {
        self.message
            .params
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| DispatchError::MissingArgument {
                command: self.message.command.clone(),
                index,
            })
    }

    pub fn source(&self) -> Option<&Hostmask> {
        self.message.source.as_ref()
    }

    /// Nickname of the sender, empty when the line had no prefix.
    pub fn source_nickname(&self) -> String {
        self.source().map(|h| h.nickname.clone()).unwrap_or_default()
    }

    /// Fields every event about this line carries.
    pub fn payload(&self, nickname: &str) -> Payload {
        let prefix_split = match self.source() {
            Some(h) => json!([h.nickname, h.username, h.hostname]),
            None => json!([null, null, null]),
        };
        let mut map = Payload::new();
        map.insert("line".into(), json!(self.raw));
        map.insert("line_split".into(), json!(self.raw.split(' ').collect::<Vec<_>>()));
        map.insert("prefix".into(), json!(self.message.prefix));
        map.insert("command".into(), json!(self.message.command));
        map.insert("args".into(), json!(self.message.params));
        map.insert("is_final".into(), json!(self.message.trailing));
        map.insert("prefix_split".into(), prefix_split);
        map.insert("connection".into(), json!(self.connection));
        map.insert("nickname".into(), json!(nickname));
        map
    }

    /// Base payload plus `extra` fields (extra wins on collision).
    fn payload_with<S>(&self, conn: &Connection<S>, extra: Value) -> Payload {
        let mut map = self.payload(&conn.nickname);
        if let Value::Object(extra) = extra {
            map.extend(extra);
        }
        map
    }
}

/// A built-in command handler.
pub type Handler<S> = fn(&Line, &mut Connection<S>, &mut EventBus) -> Result<(), DispatchError>;

/// One entry in the handler table.
pub struct HandlerSpec<S> {
    pub handler: Handler<S>,
    pub description: &'static str,
    /// Publish the generic `received/<command>` event as well as running the
    /// handler.
    pub always_emit: bool,
}

impl<S> Clone for HandlerSpec<S> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler,
            description: self.description,
            always_emit: self.always_emit,
        }
    }
}

impl<S> std::fmt::Debug for HandlerSpec<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("description", &self.description)
            .field("always_emit", &self.always_emit)
            .finish()
    }
}

/// Command token (uppercase) to handler.
#[derive(Debug, Clone)]
pub struct HandlerTable<S> {
    handlers: HashMap<String, HandlerSpec<S>>,
}

impl<S> Default for HandlerTable<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> HandlerTable<S> {
    /// The built-in handlers.
    pub fn standard() -> Self {
        let mut table = Self::default();
        table
            .register("PING", handle_ping, "reply to a ping", false)
            .register(RPL_WELCOME, handle_welcome, "registration complete", true)
            .register("JOIN", handle_join, "a user joined a channel", false)
            .register("PART", handle_part, "a user left a channel", false)
            .register("KICK", handle_kick, "a user was kicked", false)
            .register("CAP", handle_cap, "server capability negotiation", false)
            .register("AUTHENTICATE", handle_authenticate, "SASL challenge", false)
            .register("NICK", handle_nick, "a nickname changed", false)
            .register("INVITE", handle_invite, "invited to a channel", false)
            .register("PRIVMSG", handle_privmsg, "a message arrived", false);
        table
    }

    pub fn register(
        &mut self,
        command: &str,
        handler: Handler<S>,
        description: &'static str,
        always_emit: bool,
    ) -> &mut Self {
        self.handlers.insert(
            command.to_ascii_uppercase(),
            HandlerSpec {
                handler,
                description,
                always_emit,
            },
        );
        self
    }

    pub fn get(&self, command: &str) -> Option<&HandlerSpec<S>> {
        self.handlers.get(command)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// `(command, description)` pairs, sorted by command.
    pub fn descriptions(&self) -> Vec<(&str, &'static str)> {
        let mut out: Vec<_> = self
            .handlers
            .iter()
            .map(|(command, spec)| (command.as_str(), spec.description))
            .collect();
        out.sort_unstable();
        out
    }
}

/// Routes parsed lines through the handler table and onto the bus.
#[derive(Debug, Clone)]
pub struct Dispatcher<S> {
    table: HandlerTable<S>,
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new(HandlerTable::standard())
    }
}

impl<S> Dispatcher<S> {
    pub fn new(table: HandlerTable<S>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &HandlerTable<S> {
        &self.table
    }

    /// Handle one decoded line received on `conn`.
    pub fn dispatch(
        &self,
        raw: &str,
        id: ConnectionId,
        conn: &mut Connection<S>,
        bus: &mut EventBus,
    ) -> Result<(), DispatchError> {
        let line = Line::parse(raw, id)?;
        let spec = self.table.get(line.command());

        if line.message.is_numeric() {
            if let Ok(code) = line.command().parse() {
                conn.last_status = code;
            }
        }

        if spec.map_or(true, |s| s.always_emit) {
            emit_generic(&line, conn, bus);
        }
        if let Some(spec) = spec {
            debug!(connection = id, command = line.command(), "dispatch: {}", spec.description);
            (spec.handler)(&line, conn, bus)?;
        }
        Ok(())
    }
}

fn emit_generic<S>(line: &Line, conn: &Connection<S>, bus: &mut EventBus) {
    let command = line.command();
    if line.message.is_numeric() {
        let payload = line.payload_with(conn, json!({ "number": command }));
        bus.on("received/numeric").call(payload.clone());
        bus.on("received/numeric").child(command).call(payload);
    } else {
        let payload = line.payload(&conn.nickname);
        bus.on("received").child(&command.to_ascii_lowercase()).call(payload);
    }
}

// ── Built-in handlers ────────────────────────────────────────────

fn handle_ping<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let nonce = line.arg(0)?;
    conn.send_pong(nonce);
    bus.on("received/ping")
        .call(line.payload_with(conn, json!({ "nonce": nonce })));
    Ok(())
}

fn handle_welcome<S>(line: &Line, conn: &mut Connection<S>, _bus: &mut EventBus) -> Result<(), DispatchError> {
    conn.nickname = line.arg(0)?.to_owned();
    Ok(())
}

fn handle_join<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let nickname = line.source_nickname();
    let channel = remove_colon(line.arg(0)?);
    if conn.is_own_nickname(&nickname) {
        conn.add_channel(channel);
        bus.on("self/join")
            .call(line.payload_with(conn, json!({ "channel": channel })));
        conn.send_who(channel);
    } else {
        bus.on("received/join")
            .call(line.payload_with(conn, json!({ "channel": channel, "user": nickname })));
    }
    Ok(())
}

fn handle_part<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let nickname = line.source_nickname();
    let channel = line.arg(0)?;
    let reason = line.args().get(1).map(String::as_str).unwrap_or("");
    if conn.is_own_nickname(&nickname) {
        conn.remove_channel(channel);
        bus.on("self/part")
            .call(line.payload_with(conn, json!({ "channel": channel, "reason": reason })));
    } else {
        bus.on("received/part").call(line.payload_with(
            conn,
            json!({ "channel": channel, "reason": reason, "user": nickname }),
        ));
    }
    Ok(())
}

fn handle_kick<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let channel = line.arg(0)?;
    let target = line.arg(1)?;
    let reason = line.args().get(2).map(String::as_str).unwrap_or("");
    if conn.is_own_nickname(target) {
        conn.remove_channel(channel);
        bus.on("self/kick")
            .call(line.payload_with(conn, json!({ "channel": channel, "reason": reason })));
    } else {
        bus.on("received/kick").call(line.payload_with(
            conn,
            json!({ "channel": channel, "reason": reason, "user": target }),
        ));
    }
    Ok(())
}

fn handle_cap<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let subcommand = line.arg(1)?;
    let capabilities: Vec<&str> = line
        .args()
        .get(2)
        .map(|caps| caps.split_whitespace().collect())
        .unwrap_or_default();
    bus.on("received/cap").call(line.payload_with(
        conn,
        json!({ "subcommand": subcommand, "capabilities": capabilities }),
    ));
    Ok(())
}

fn handle_authenticate<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let message = line.arg(0)?;
    bus.on("received/authenticate")
        .call(line.payload_with(conn, json!({ "message": message })));
    Ok(())
}

fn handle_nick<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let new_nickname = line.arg(0)?.to_owned();
    let old_nickname = line.source_nickname();
    let fields = json!({ "new_nickname": new_nickname, "old_nickname": old_nickname });
    if conn.is_own_nickname(&old_nickname) {
        conn.nickname = new_nickname;
        bus.on("self/nick").call(line.payload_with(conn, fields));
    } else {
        bus.on("received/nick").call(line.payload_with(conn, fields));
    }
    Ok(())
}

fn handle_invite<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let target_channel = remove_colon(line.arg(1)?);
    bus.on("received/invite").call(line.payload_with(
        conn,
        json!({ "user": line.source_nickname(), "target_channel": target_channel }),
    ));
    Ok(())
}

/// Strip CTCP ACTION framing, if the whole message is wrapped in it.
fn strip_action(message: &str) -> Option<&str> {
    message
        .strip_prefix(ACTION_PREFIX)
        .and_then(|rest| rest.strip_suffix(CTCP_DELIM))
}

fn handle_privmsg<S>(line: &Line, conn: &mut Connection<S>, bus: &mut EventBus) -> Result<(), DispatchError> {
    let target = line.arg(0)?;
    let raw_message = line.args().get(1).map(String::as_str).unwrap_or("");
    // Split before unwrapping, so an action's split still shows the framing.
    let message_split: Vec<&str> = raw_message.split(' ').collect();
    let (message, action) = match strip_action(raw_message) {
        Some(inner) => (inner, true),
        None => (raw_message, false),
    };
    let mut fields = json!({
        "user": line.source_nickname(),
        "message": message,
        "message_split": message_split,
        "action": action,
    });

    if target.starts_with(CHANNEL_SIGILS) {
        fields["channel"] = json!(target);
        bus.on("received/message/channel").call(line.payload_with(conn, fields));
    } else if conn.is_own_nickname(target) {
        bus.on("received/message/private").call(line.payload_with(conn, fields));
    } else {
        debug!(connection = line.connection, to = target, "dispatch: dropping message for another target");
    }
    Ok(())
}
