//! Per-connection session.
//!
//! A reader loop decodes one command per line and a writer task drains the
//! bounded outbound queue that both replies and pushed events go through.
//! Closing a session unregisters it first, then closes the queue, flushes
//! whatever was already queued and shuts the socket down.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sprout_config::ServerConfig;
use sprout_database::Message;
use sprout_messaging::{
    ConnectionHandle, JoinOutcome, LeaveOutcome, MessagingError, MessagingResult, MessagingService,
    OutboundFrame,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::protocol::{history_line, split_verb, Command, Reply};

/// Limits applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub outbound_queue_capacity: usize,
    pub max_line_length: usize,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue_capacity: config.outbound_queue_capacity.max(1),
            max_line_length: config.max_line_length,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { user_id: i64 },
    Closed,
}

/// What the reader loop should do after handling one line.
#[derive(Debug, Default)]
pub struct LineOutcome {
    pub lines: Vec<String>,
    pub close: bool,
}

impl LineOutcome {
    fn reply(reply: Reply) -> Self {
        Self {
            lines: vec![reply.to_string()],
            close: false,
        }
    }
}

/// Command handling state of one connection, independent of the transport.
pub struct ConnectionSession {
    connection_id: Uuid,
    service: Arc<MessagingService>,
    outbound: mpsc::Sender<OutboundFrame>,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(
        connection_id: Uuid,
        service: Arc<MessagingService>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            connection_id,
            service,
            outbound,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn user_id(&self) -> Option<i64> {
        match self.state {
            SessionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    /// Handle one protocol line and produce the lines to send back.
    pub async fn handle_line(&mut self, line: &str) -> LineOutcome {
        if self.state == SessionState::Closed || line.trim().is_empty() {
            return LineOutcome::default();
        }

        let (verb, args) = match split_verb(line) {
            Ok(parts) => parts,
            Err(error) => return LineOutcome::reply(error.into()),
        };

        if verb.requires_auth() && self.user_id().is_none() {
            return LineOutcome::reply(MessagingError::NotAuthenticated.into());
        }

        match Command::from_parts(verb, args) {
            Ok(command) => self.dispatch(command).await,
            Err(error) => LineOutcome::reply(error.into()),
        }
    }

    async fn dispatch(&mut self, command: Command) -> LineOutcome {
        let Some(user_id) = self.user_id() else {
            return match command {
                Command::Auth { token } => LineOutcome::reply(self.authenticate(&token).await),
                _ => LineOutcome::reply(MessagingError::NotAuthenticated.into()),
            };
        };

        match command {
            Command::Auth { .. } => LineOutcome::reply(Reply::error("Already authenticated")),
            Command::History {
                user_id: other_id,
                limit,
                offset,
            } => {
                let history = self
                    .service
                    .direct_history(user_id, other_id, limit, offset)
                    .await;
                history_outcome(history)
            }
            Command::HistoryChannel {
                channel_id,
                limit,
                offset,
            } => {
                let history = self
                    .service
                    .channel_history(user_id, channel_id, limit, offset)
                    .await;
                history_outcome(history)
            }
            Command::Quit => LineOutcome {
                lines: vec![Reply::ok("Bye").to_string()],
                close: true,
            },
            other => {
                let reply = match self.execute(user_id, other).await {
                    Ok(reply) => reply,
                    Err(error) => {
                        debug!(user_id, %error, "command failed");
                        error.into()
                    }
                };
                LineOutcome::reply(reply)
            }
        }
    }

    async fn authenticate(&mut self, token: &str) -> Reply {
        let identity = match self.service.authenticate(token).await {
            Ok(identity) => identity,
            Err(MessagingError::NotAuthenticated) => {
                info!(connection_id = %self.connection_id, "authentication rejected");
                return Reply::error("Authentication failed");
            }
            Err(error) => {
                warn!(connection_id = %self.connection_id, %error, "authentication unavailable");
                return error.into();
            }
        };

        let user_id = identity.user_id;
        // Registered before the OK is queued, so events sent after the client
        // sees the reply always reach this connection.
        let handle = ConnectionHandle::new(self.connection_id, self.outbound.clone());
        self.service.registry().register(user_id, handle);
        self.state = SessionState::Authenticated { user_id };
        tracing::Span::current().record("user_id", user_id);

        info!(user_id, display_name = %identity.display_name, "session authenticated");
        Reply::ok(format!("Authenticated as user {user_id}"))
    }

    async fn execute(&self, user_id: i64, command: Command) -> Result<Reply, MessagingError> {
        let service = &self.service;
        let channels = service.channels();

        let reply = match command {
            Command::Send {
                recipient_id,
                attachments,
                content,
            } => {
                service
                    .send_direct(user_id, recipient_id, &content, attachments)
                    .await?;
                Reply::ok("Message sent")
            }
            Command::Channel {
                channel_id,
                attachments,
                content,
            } => {
                service
                    .send_channel(user_id, channel_id, &content, attachments)
                    .await?;
                Reply::ok("Channel message sent")
            }
            Command::Join { channel_id } => {
                channels.join(user_id, channel_id).await?;
                Reply::ok(format!("Joined channel {channel_id}"))
            }
            Command::Leave { channel_id } => {
                let outcome = channels.leave(user_id, channel_id).await?;
                Reply::ok(left_message(channel_id, outcome))
            }
            Command::Create {
                visibility,
                name,
                description,
            } => {
                let channel = channels
                    .create(user_id, &name, &description, visibility)
                    .await?;
                Reply::ok(format!("Channel created {}", channel.id))
            }
            Command::Add {
                channel_id,
                user_id: target,
            } => {
                let outcome = channels.add_member(user_id, channel_id, target).await?;
                Reply::ok(match outcome {
                    JoinOutcome::Joined => format!("Added user {target} to channel {channel_id}"),
                    JoinOutcome::AlreadyMember => {
                        format!("User {target} is already in channel {channel_id}")
                    }
                })
            }
            Command::Remove {
                channel_id,
                user_id: target,
            } => {
                let outcome = channels.remove_member(user_id, channel_id, target).await?;
                Reply::ok(match (target == user_id, outcome) {
                    (true, outcome) => left_message(channel_id, outcome),
                    (false, _) => format!("Removed user {target} from channel {channel_id}"),
                })
            }
            Command::Promote {
                channel_id,
                user_id: target,
            } => {
                channels.promote(user_id, channel_id, target).await?;
                Reply::ok(format!("Promoted user {target} in channel {channel_id}"))
            }
            Command::Demote {
                channel_id,
                user_id: target,
            } => {
                channels.demote(user_id, channel_id, target).await?;
                Reply::ok(format!("Demoted user {target} in channel {channel_id}"))
            }
            Command::Update {
                channel_id,
                field,
                value,
            } => {
                channels
                    .update_metadata(user_id, channel_id, [(field.as_str(), value.as_str())])
                    .await?;
                Reply::ok(format!("Channel {channel_id} updated"))
            }
            Command::Delete { channel_id } => {
                channels.delete(user_id, channel_id).await?;
                Reply::ok(format!("Channel {channel_id} deleted"))
            }
            Command::Members { channel_id } => {
                channels.require_member(user_id, channel_id).await?;
                let members = channels.members(channel_id).await?;
                let listing: Vec<String> = members
                    .iter()
                    .map(|member| format!("{}:{}", member.user_id, member.role))
                    .collect();
                Reply::ok(listing.join(" "))
            }
            Command::Channels => {
                let listing: Vec<String> = channels
                    .channels_for_user(user_id)
                    .await?
                    .iter()
                    .map(|channel| format!("{}:{}", channel.id, channel.name))
                    .collect();
                Reply::ok(listing.join(" "))
            }
            Command::Read { message_id } => {
                service.mark_read(user_id, message_id).await?;
                Reply::ok(format!("Message {message_id} marked read"))
            }
            Command::Unsend { message_id } => {
                service.delete_message(user_id, message_id).await?;
                Reply::ok(format!("Message {message_id} deleted"))
            }
            Command::Ping => Reply::ok("PONG"),
            Command::Auth { .. }
            | Command::History { .. }
            | Command::HistoryChannel { .. }
            | Command::Quit => Reply::error("Unknown command"),
        };
        Ok(reply)
    }

    /// Leave the registry and stop accepting commands.
    pub fn close(&mut self) {
        if let Some(user_id) = self.user_id() {
            self.service
                .registry()
                .unregister(user_id, self.connection_id);
        }
        self.state = SessionState::Closed;
    }
}

fn left_message(channel_id: i64, outcome: LeaveOutcome) -> String {
    match outcome {
        LeaveOutcome::Left => format!("Left channel {channel_id}"),
        LeaveOutcome::ChannelDeleted => format!("Left channel {channel_id} (channel deleted)"),
    }
}

fn history_outcome(history: MessagingResult<Vec<Message>>) -> LineOutcome {
    let messages = match history {
        Ok(messages) => messages,
        Err(error) => return LineOutcome::reply(error.into()),
    };

    let mut lines = Vec::with_capacity(messages.len() + 1);
    for message in &messages {
        match history_line(message) {
            Ok(line) => lines.push(line),
            Err(error) => {
                warn!(message_id = message.id, %error, "unable to encode history entry");
                return LineOutcome::reply(Reply::error("Unable to encode history"));
            }
        }
    }
    lines.push(Reply::ok(format!("{} messages", messages.len())).to_string());

    LineOutcome { lines, close: false }
}

/// Drive one connection until EOF, a transport error, `QUIT`, or shutdown.
pub async fn run_session<S>(
    stream: S,
    service: Arc<MessagingService>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection_id = Uuid::new_v4();
    let span = info_span!("session", %connection_id, user_id = tracing::field::Empty);
    serve(stream, connection_id, service, settings, shutdown)
        .instrument(span)
        .await
}

async fn serve<S>(
    stream: S,
    connection_id: Uuid,
    service: Arc<MessagingService>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(settings.max_line_length),
    );

    let (out_tx, out_rx) = mpsc::channel(settings.outbound_queue_capacity.max(1));
    let session_token = shutdown.child_token();
    let drain = CancellationToken::new();
    let writer_task = tokio::spawn(
        write_loop(write_half, out_rx, drain.clone(), session_token.clone())
            .in_current_span(),
    );

    debug!("session started");
    let mut session = ConnectionSession::new(connection_id, service, out_tx.clone());

    'session: loop {
        let line = tokio::select! {
            _ = session_token.cancelled() => {
                debug!("session cancelled");
                break;
            }
            next = reader.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(error)) => {
                    warn!(%error, "dropping connection after read failure");
                    break;
                }
                None => break,
            },
        };

        let outcome = session.handle_line(&line).await;
        for reply in outcome.lines {
            let queued = tokio::select! {
                _ = session_token.cancelled() => false,
                sent = out_tx.send(OutboundFrame::Reply(reply)) => sent.is_ok(),
            };
            if !queued {
                break 'session;
            }
        }
        if outcome.close {
            break;
        }
    }

    session.close();
    drop(out_tx);
    drain.cancel();
    if let Err(error) = writer_task.await {
        warn!(%error, "session writer task failed");
    }
    info!("session closed");
}

/// Write queued frames until the session drains it, then flush and shut down.
async fn write_loop<W>(
    write_half: W,
    mut rx: mpsc::Receiver<OutboundFrame>,
    drain: CancellationToken,
    session_token: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    if let Err(error) = pump(&mut writer, &mut rx, &drain).await {
        debug!(%error, "session writer stopped");
        session_token.cancel();
        return;
    }

    if let Err(error) = writer.into_inner().shutdown().await {
        debug!(%error, "socket shutdown failed");
    }
}

async fn pump<W>(
    writer: &mut FramedWrite<W, LinesCodec>,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    drain: &CancellationToken,
) -> Result<(), LinesCodecError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => writer.send(frame.as_str()).await?,
                None => return Ok(()),
            },
            _ = drain.cancelled() => {
                rx.close();
                while let Some(frame) = rx.recv().await {
                    writer.feed(frame.as_str()).await?;
                }
                return SinkExt::<&str>::flush(writer).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_auth::StaticIdentityService;
    use sprout_config::MessagingConfig;
    use sprout_database::{MemoryStore, MessageStore};
    use sprout_messaging::ClientRegistry;

    fn session() -> (ConnectionSession, mpsc::Receiver<OutboundFrame>) {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let identity = StaticIdentityService::new().with_user("alice-token", 1, "alice");
        let service = Arc::new(MessagingService::new(
            store,
            Arc::new(identity),
            Arc::new(ClientRegistry::new()),
            MessagingConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(4);
        (ConnectionSession::new(Uuid::new_v4(), service, tx), rx)
    }

    #[tokio::test]
    async fn closed_session_answers_nothing() {
        let (mut session, _rx) = session();
        let outcome = session.handle_line("AUTH alice-token").await;
        assert_eq!(outcome.lines, vec!["OK Authenticated as user 1".to_string()]);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.service.registry().is_online(1));

        for line in ["FROBNICATE", "PING", "AUTH alice-token", "QUIT"] {
            let outcome = session.handle_line(line).await;
            assert!(outcome.lines.is_empty(), "{line} produced {:?}", outcome.lines);
            assert!(!outcome.close);
        }
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let (mut session, _rx) = session();
        assert!(session.handle_line("   ").await.lines.is_empty());
        assert_eq!(
            session.handle_line("PING").await.lines,
            vec!["ERROR Not authenticated".to_string()]
        );
    }
}
