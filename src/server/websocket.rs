//! WebSocket server implementation
//!
//! Listens for relay connections at `/ws/{conversation_id}?token=...` and
//! hands each accepted socket to its own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::handler::handle_connection;
use crate::config::Settings;
use crate::relay::Relay;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound for a single socket write
    pub send_timeout: Duration,
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind: settings.server.bind.clone(),
            port: settings.server.ws_port,
            send_timeout: settings.send_timeout(),
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server feeding the conversation relay
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            relay,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket relay listening on ws://{}/ws/{{conversation_id}}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let relay = Arc::clone(&self.relay);
                            let send_timeout = self.config.send_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, relay, send_timeout).await {
                                    debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping relay");
                    break;
                }
            }
        }

        let open = self.relay.registry().total_connections();
        if open > 0 {
            info!("Closing {} open connections...", open);
        }
        self.relay.shutdown();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use chrono::Utc;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::auth::AuthService;
    use crate::relay::RelayPolicy;
    use crate::server::{ErrorCode, ServerFrame};
    use crate::store::Store;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        addr: SocketAddr,
        store: Store,
        relay: Arc<Relay>,
        server: Arc<RelayServer>,
        alice: String,
        bob: String,
        carol: String,
        /// alice, bob, carol
        uids: Vec<i64>,
        /// alice + bob
        team: i64,
        /// carol only
        other: i64,
    }

    async fn start(echo_to_sender: bool) -> Fixture {
        let policy = RelayPolicy {
            echo_to_sender,
            ..RelayPolicy::default()
        };
        start_with(policy, Duration::from_secs(1)).await
    }

    async fn start_with(policy: RelayPolicy, send_timeout: Duration) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let auth = AuthService::new(store.clone(), Duration::from_secs(3600), 6).with_hash_cost(4);

        let mut tokens = Vec::new();
        let mut uids = Vec::new();
        for name in ["alice", "bob", "carol"] {
            uids.push(auth.register(name, "secret1", None).await.unwrap());
            tokens.push(auth.login(name, "secret1").await.unwrap().token);
        }
        let team = store.create_group(uids[0], "team").await.unwrap();
        store.add_member(uids[0], team, uids[1]).await.unwrap();
        let other = store.create_group(uids[2], "other").await.unwrap();

        let relay = Arc::new(Relay::new(Arc::new(auth), Arc::new(store.clone()), policy));
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            send_timeout,
        };
        let server = Arc::new(RelayServer::new(config, Arc::clone(&relay)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let mut tokens = tokens.into_iter();
        Fixture {
            addr,
            store,
            relay,
            server,
            alice: tokens.next().unwrap(),
            bob: tokens.next().unwrap(),
            carol: tokens.next().unwrap(),
            uids,
            team,
            other,
        }
    }

    impl Fixture {
        async fn join(&self, cid: i64, token: &str) -> Client {
            let url = format!("ws://{}/ws/{}?token={}", self.addr, cid, token);
            let (client, _) = connect_async(url).await.unwrap();
            client
        }

        async fn wait_for_connections(&self, cid: i64, count: usize) {
            tokio::time::timeout(WAIT, async {
                while self.relay.registry().connection_count(cid) != count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    async fn next_frame(client: &mut Client) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(WAIT, client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerFrame::from_json(&text).unwrap();
            }
        }
    }

    async fn next_close_code(client: &mut Client) -> Option<CloseCode> {
        loop {
            match tokio::time::timeout(WAIT, client.next()).await.unwrap() {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    async fn send_text(client: &mut Client, json: &str) {
        client.send(Message::Text(json.to_string())).await.unwrap();
    }

    /// Percent-encode every byte, including ones that need no escaping
    fn escape_all(token: &str) -> String {
        token.bytes().map(|byte| format!("%{:02X}", byte)).collect()
    }

    fn text_of(frame: ServerFrame) -> String {
        match frame {
            ServerFrame::Message(msg) => msg.text,
            other => panic!("Expected Message frame, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::from_settings(&Settings::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.send_timeout, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_message_reaches_everyone_with_echo() {
        let fx = start(true).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        let mut b = fx.join(fx.team, &fx.bob).await;
        fx.wait_for_connections(fx.team, 2).await;

        send_text(&mut a, r#"{"text":"hi"}"#).await;

        assert_eq!(text_of(next_frame(&mut a).await), "hi");
        assert_eq!(text_of(next_frame(&mut b).await), "hi");
    }

    #[tokio::test]
    async fn test_message_skips_sender_without_echo() {
        let fx = start(false).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        let mut b = fx.join(fx.team, &fx.bob).await;
        fx.wait_for_connections(fx.team, 2).await;

        send_text(&mut a, r#"{"text":"hi"}"#).await;
        assert_eq!(text_of(next_frame(&mut b).await), "hi");

        let nothing = tokio::time::timeout(Duration::from_millis(200), a.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_invalid_token_closes_with_policy_violation() {
        let fx = start(true).await;

        let mut client = fx.join(fx.team, "expired-token").await;
        assert_eq!(next_close_code(&mut client).await, Some(CloseCode::Policy));
        assert_eq!(fx.relay.registry().connection_count(fx.team), 0);

        let url = format!("ws://{}/ws/{}", fx.addr, fx.team);
        let (mut client, _) = connect_async(url).await.unwrap();
        assert_eq!(next_close_code(&mut client).await, Some(CloseCode::Policy));
        assert_eq!(fx.relay.registry().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_closes_with_policy_violation() {
        let fx = start(true).await;
        let past = Utc::now() - chrono::Duration::hours(2);
        fx.store
            .create_session(fx.uids[0], "stale-session", past, Some(past + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let mut client = fx.join(fx.team, "stale-session").await;
        assert_eq!(next_close_code(&mut client).await, Some(CloseCode::Policy));
        assert_eq!(fx.relay.registry().connection_count(fx.team), 0);
        assert_eq!(fx.relay.registry().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_url_encoded_token_accepted() {
        let fx = start(true).await;
        let url = format!("ws://{}/ws/{}?v=1&token={}", fx.addr, fx.team, escape_all(&fx.alice));
        let (mut client, _) = connect_async(url).await.unwrap();
        fx.wait_for_connections(fx.team, 1).await;

        send_text(&mut client, r#"{"text":"decoded"}"#).await;
        assert_eq!(text_of(next_frame(&mut client).await), "decoded");
    }

    #[tokio::test]
    async fn test_removed_member_is_disconnected() {
        let fx = start(true).await;
        let (alice, bob) = (fx.uids[0], fx.uids[1]);
        let mut a = fx.join(fx.team, &fx.alice).await;
        let mut b = fx.join(fx.team, &fx.bob).await;
        fx.wait_for_connections(fx.team, 2).await;

        assert!(fx.store.remove_member(alice, fx.team, bob).await.unwrap());
        assert_eq!(fx.relay.evict(fx.team, bob), 1);
        assert_eq!(next_close_code(&mut b).await, Some(CloseCode::Normal));
        fx.wait_for_connections(fx.team, 1).await;

        send_text(&mut a, r#"{"text":"secret after kick"}"#).await;
        assert_eq!(text_of(next_frame(&mut a).await), "secret after kick");
        loop {
            match tokio::time::timeout(WAIT, b.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => panic!("Removed member received {}", text),
                Some(Ok(_)) => continue,
                _ => break,
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_reader_dropped_while_others_receive() {
        let policy = RelayPolicy {
            echo_to_sender: false,
            outbound_queue: 256,
            ..RelayPolicy::default()
        };
        let fx = start_with(policy, Duration::from_millis(200)).await;
        let (alice, carol) = (fx.uids[0], fx.uids[2]);
        fx.store.add_member(alice, fx.team, carol).await.unwrap();

        let mut a = fx.join(fx.team, &fx.alice).await;
        // bob connects and never reads again
        let _b = fx.join(fx.team, &fx.bob).await;
        let mut c = fx.join(fx.team, &fx.carol).await;
        fx.wait_for_connections(fx.team, 3).await;

        let reader = tokio::spawn(async move {
            let mut received = 0usize;
            loop {
                let text = text_of(next_frame(&mut c).await);
                if text == "done" {
                    return received;
                }
                received += 1;
            }
        });

        let payload = serde_json::json!({ "text": "x".repeat(15_000) }).to_string();
        let mut sent = 0usize;
        while fx.relay.registry().connection_count(fx.team) == 3 && sent < 20_000 {
            send_text(&mut a, &payload).await;
            sent += 1;
            if sent % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }
        fx.wait_for_connections(fx.team, 2).await;

        send_text(&mut a, r#"{"text":"done"}"#).await;
        let received = tokio::time::timeout(Duration::from_secs(30), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let fx = start(true).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        let mut c = fx.join(fx.other, &fx.carol).await;
        fx.wait_for_connections(fx.team, 1).await;
        fx.wait_for_connections(fx.other, 1).await;

        send_text(&mut a, r#"{"text":"hi"}"#).await;
        assert_eq!(text_of(next_frame(&mut a).await), "hi");

        let nothing = tokio::time::timeout(Duration::from_millis(200), c.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_malformed_and_non_member_get_error_frames() {
        let fx = start(true).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        // carol holds a valid token but is not in the team
        let mut c = fx.join(fx.team, &fx.carol).await;
        fx.wait_for_connections(fx.team, 2).await;

        send_text(&mut a, "not json").await;
        match next_frame(&mut a).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("Expected Error frame, got {:?}", other),
        }

        send_text(&mut c, r#"{"text":"let me in"}"#).await;
        match next_frame(&mut c).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::NotMember),
            other => panic!("Expected Error frame, got {:?}", other),
        }

        // Both connections stay open and A still receives real messages
        send_text(&mut a, r#"{"text":"still here"}"#).await;
        assert_eq!(text_of(next_frame(&mut a).await), "still here");
        assert_eq!(fx.relay.registry().connection_count(fx.team), 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let fx = start(true).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        let mut b = fx.join(fx.team, &fx.bob).await;
        fx.wait_for_connections(fx.team, 2).await;

        b.close(None).await.unwrap();
        fx.wait_for_connections(fx.team, 1).await;

        send_text(&mut a, r#"{"text":"anyone?"}"#).await;
        assert_eq!(text_of(next_frame(&mut a).await), "anyone?");
    }

    #[tokio::test]
    async fn test_unknown_path_refused() {
        let fx = start(true).await;

        for path in ["/chat/7", "/ws/not-a-number"] {
            let url = format!("ws://{}{}", fx.addr, path);
            match connect_async(url).await {
                Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
                other => panic!("Expected HTTP 404, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let fx = start(true).await;
        let mut a = fx.join(fx.team, &fx.alice).await;
        fx.wait_for_connections(fx.team, 1).await;

        fx.server.shutdown();
        assert_eq!(next_close_code(&mut a).await, Some(CloseCode::Away));
        fx.wait_for_connections(fx.team, 0).await;
    }
}
