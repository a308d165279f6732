//! Listener task: keeps one WebSocket connection to the broker alive and
//! feeds incoming events through the notification gate.
//!
//! All session state lives inside a single task. The outside world talks
//! to it through [`ListenerHandle`], which sends requests over a channel
//! and awaits the reply.

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::future::pending;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::gate::{self, Badge, GateDecision, Notification};
use super::notifier::Notifier;
use super::session::{ClientSession, ConnectionStatus, NotificationRecord};
use super::settings::{KeyValueStore, Settings, CONNECTION_STATUS_KEY};
use crate::app::ListenerConfig;
use crate::notify::protocol::{ClientMessage, ControlMessage, Event, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = BoxFuture<'static, Result<WsStream, tungstenite::Error>>;

/// Reply to a status request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connection_status: ConnectionStatus,
    pub unread_count: usize,
    pub notifications: Vec<NotificationRecord>,
    pub settings: Settings,
}

/// Reply to every other request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    fn ok() -> Self {
        Self { success: true }
    }
}

enum Request {
    GetStatus(oneshot::Sender<StatusResponse>),
    MarkAsRead(oneshot::Sender<Ack>),
    TestNotification(oneshot::Sender<Ack>),
    Reconnect(oneshot::Sender<Ack>),
    ClearNotifications(oneshot::Sender<Ack>),
    RemoveNotification(String, oneshot::Sender<Ack>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point to a running listener
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    tx: mpsc::Sender<Request>,
}

impl ListenerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow!("Listener task has stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Listener task dropped the request"))
    }

    pub async fn get_status(&self) -> Result<StatusResponse> {
        self.call(Request::GetStatus).await
    }

    /// Acknowledge everything shown so far
    pub async fn mark_as_read(&self) -> Result<Ack> {
        self.call(Request::MarkAsRead).await
    }

    pub async fn test_notification(&self) -> Result<Ack> {
        self.call(Request::TestNotification).await
    }

    /// Drop the current connection (if any) and connect again right away
    pub async fn reconnect(&self) -> Result<Ack> {
        self.call(Request::Reconnect).await
    }

    pub async fn clear_notifications(&self) -> Result<Ack> {
        self.call(Request::ClearNotifications).await
    }

    pub async fn remove_notification(&self, id: impl Into<String>) -> Result<Ack> {
        let id = id.into();
        self.call(|reply| Request::RemoveNotification(id, reply))
            .await
    }

    /// Stop the task. Resolves once the socket is closed.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Request::Shutdown).await
    }
}

pub struct Listener;

impl Listener {
    /// Start the listener task. It connects immediately and keeps running
    /// until `shutdown` is requested or every handle is dropped.
    pub fn spawn(
        config: ListenerConfig,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> (ListenerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = ListenerTask {
            session: ClientSession::new(
                config.recent_capacity,
                config.reconnect_floor(),
                config.reconnect_ceiling(),
                Settings::default(),
            ),
            config,
            store,
            notifier,
            requests: rx,
            connect: None,
            socket: None,
            ping: None,
            reconnect_at: None,
            expiries: Vec::new(),
        };
        let join = tokio::spawn(task.run());
        (ListenerHandle { tx }, join)
    }
}

struct ListenerTask {
    config: ListenerConfig,
    session: ClientSession,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    requests: mpsc::Receiver<Request>,
    /// In-flight connect attempt
    connect: Option<ConnectFuture>,
    socket: Option<WsStream>,
    /// Only set while connected
    ping: Option<Interval>,
    /// Only set while waiting to retry
    reconnect_at: Option<Instant>,
    /// Auto-dismiss deadlines of transient notifications
    expiries: Vec<(Instant, String)>,
}

impl ListenerTask {
    async fn run(mut self) {
        self.session.settings = Settings::load(self.store.as_ref()).await;
        self.start_connect().await;

        loop {
            let reconnect_at = self.reconnect_at;
            let next_expiry = self.expiries.iter().map(|(at, _)| *at).min();

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                result = maybe_connect(&mut self.connect) => {
                    self.connect = None;
                    self.on_connect_result(result).await;
                }
                frame = maybe_next(&mut self.socket) => self.on_frame(frame).await,
                _ = maybe_tick(&mut self.ping) => self.send_ping().await,
                _ = maybe_sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect().await;
                }
                _ = maybe_sleep_until(next_expiry) => self.expire_due(),
            }
        }

        self.teardown().await;
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::GetStatus(reply) => {
                self.session.settings = Settings::load(self.store.as_ref()).await;
                let _ = reply.send(StatusResponse {
                    connection_status: self.session.status,
                    unread_count: self.session.unread,
                    notifications: self.session.recent.to_vec(),
                    settings: self.session.settings.clone(),
                });
            }
            Request::MarkAsRead(reply) => {
                self.session.acknowledge();
                self.refresh_badge();
                let _ = reply.send(Ack::ok());
            }
            Request::TestNotification(reply) => {
                let notification = Notification::sample();
                self.show(&notification);
                let _ = reply.send(Ack::ok());
            }
            Request::Reconnect(reply) => {
                tracing::info!("Manual reconnect requested");
                self.session.backoff.reset();
                self.drop_connection().await;
                self.start_connect().await;
                let _ = reply.send(Ack::ok());
            }
            Request::ClearNotifications(reply) => {
                self.session.recent.clear();
                self.session.acknowledge();
                self.refresh_badge();
                let _ = reply.send(Ack::ok());
            }
            Request::RemoveNotification(id, reply) => {
                let removed = self.session.recent.remove(&id);
                if removed {
                    self.expiries.retain(|(_, pending)| *pending != id);
                    self.notifier.dismiss(&id);
                }
                let _ = reply.send(Ack { success: removed });
            }
            // run() で処理済み
            Request::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn start_connect(&mut self) {
        let url = self.config.url.clone();
        tracing::debug!(%url, "Connecting to broker");
        self.connect = Some(
            async move { connect_async(url).await.map(|(socket, _response)| socket) }.boxed(),
        );
        self.set_status(ConnectionStatus::Connecting).await;
    }

    async fn on_connect_result(&mut self, result: Result<WsStream, tungstenite::Error>) {
        match result {
            Ok(socket) => {
                tracing::info!(url = %self.config.url, "Connected to broker");
                self.socket = Some(socket);
                self.session.backoff.reset();

                let period = self.config.ping_interval();
                let mut ping = interval_at(Instant::now() + period, period);
                ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ping = Some(ping);

                self.set_status(ConnectionStatus::Connected).await;
            }
            Err(e) => {
                tracing::warn!(url = %self.config.url, "Failed to connect to broker: {}", e);
                self.set_status(ConnectionStatus::Error).await;
                self.schedule_reconnect();
            }
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Broker closed the connection");
                self.on_disconnect(ConnectionStatus::Disconnected).await;
            }
            // Ping/Pong/Binary は無視
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!("Connection to broker failed: {}", e);
                self.on_disconnect(ConnectionStatus::Error).await;
            }
            None => {
                tracing::info!("Connection to broker ended");
                self.on_disconnect(ConnectionStatus::Disconnected).await;
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Event(event)) => self.deliver(event).await,
            Ok(ServerMessage::Control(ControlMessage::Connected { message, .. })) => {
                tracing::debug!("Broker says: {}", message);
            }
            Ok(ServerMessage::Control(ControlMessage::Pong { .. })) => {
                tracing::trace!("Pong received");
            }
            Err(e) => tracing::debug!("Ignoring unrecognized frame: {}", e),
        }
    }

    async fn deliver(&mut self, event: Event) {
        // UI 側で変更された設定を毎回反映する
        self.session.settings = Settings::load(self.store.as_ref()).await;
        let kind = event.kind;

        match gate::process(&mut self.session, event) {
            GateDecision::Show(notification) => {
                tracing::info!(%kind, id = %notification.id, "Showing notification");
                self.show(&notification);
                self.refresh_badge();
            }
            GateDecision::Suppressed(reason) => {
                tracing::debug!(%kind, ?reason, "Notification suppressed");
            }
        }
    }

    fn show(&mut self, notification: &Notification) {
        self.notifier.show(notification);
        if !notification.persistent {
            let deadline = Instant::now() + self.config.notification_timeout();
            self.expiries.push((deadline, notification.id.clone()));
        }
    }

    fn expire_due(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.expiries.drain(..).partition(|(at, _)| *at <= now);
        self.expiries = pending;
        for (_, id) in due {
            self.notifier.dismiss(&id);
        }
    }

    async fn send_ping(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let payload = match serde_json::to_string(&ClientMessage::Ping) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode ping: {}", e);
                return;
            }
        };
        if let Err(e) = socket.send(Message::Text(payload.into())).await {
            tracing::warn!("Failed to send ping: {}", e);
            self.on_disconnect(ConnectionStatus::Error).await;
        }
    }

    async fn on_disconnect(&mut self, status: ConnectionStatus) {
        self.socket = None;
        self.ping = None;
        self.set_status(status).await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.session.backoff.next();
        tracing::info!("Reconnecting in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Forget the socket, any in-flight attempt and any pending retry
    async fn drop_connection(&mut self) {
        self.connect = None;
        self.reconnect_at = None;
        self.ping = None;
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                tracing::debug!("Error while closing socket: {}", e);
            }
        }
    }

    async fn teardown(&mut self) {
        self.drop_connection().await;
        self.expiries.clear();
        self.set_status(ConnectionStatus::Disconnected).await;
        tracing::info!("Listener stopped");
    }

    async fn set_status(&mut self, status: ConnectionStatus) {
        self.session.status = status;
        if let Err(e) = self
            .store
            .set(CONNECTION_STATUS_KEY, json!(status.as_str()))
            .await
        {
            tracing::warn!("Failed to persist connection status: {:#}", e);
        }
        self.refresh_badge();
    }

    fn refresh_badge(&self) {
        self.notifier.set_badge(&Badge::for_session(&self.session));
    }
}

async fn maybe_connect(
    connect: &mut Option<ConnectFuture>,
) -> Result<WsStream, tungstenite::Error> {
    match connect {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn maybe_next(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}

async fn maybe_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(ping) => {
            ping.tick().await;
        }
        None => pending().await,
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::settings::{MemoryStore, SETTINGS_KEY};
    use crate::notify::protocol::EventKind;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct RecordingNotifier {
        shown: Mutex<Vec<Notification>>,
        dismissed: Mutex<Vec<String>>,
        badges: Mutex<Vec<Badge>>,
    }

    impl Notifier for RecordingNotifier {
        fn show(&self, notification: &Notification) {
            self.shown.lock().push(notification.clone());
        }
        fn dismiss(&self, id: &str) {
            self.dismissed.lock().push(id.to_string());
        }
        fn set_badge(&self, badge: &Badge) {
            self.badges.lock().push(badge.clone());
        }
    }

    fn config(url: String) -> ListenerConfig {
        ListenerConfig {
            url,
            reconnect_floor_ms: 50,
            reconnect_ceiling_ms: 200,
            notification_timeout_secs: 1,
            ..ListenerConfig::default()
        }
    }

    /// Address nothing listens on
    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    async fn wait_for<F>(handle: &ListenerHandle, mut done: F) -> StatusResponse
    where
        F: FnMut(&StatusResponse) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = handle.get_status().await.unwrap();
            if done(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out, last status: {:?}", status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_and_persists_status() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (handle, join) = Listener::spawn(config(dead_url().await), store.clone(), notifier);

        wait_for(&handle, |s| s.connection_status == ConnectionStatus::Error).await;
        assert_eq!(
            store.get(CONNECTION_STATUS_KEY).await.unwrap(),
            Some(json!("error"))
        );

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(handle.get_status().await.is_err());
    }

    #[tokio::test]
    async fn test_requests_work_while_disconnected() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(SETTINGS_KEY, json!({ "enabled": false }))
            .await
            .unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let (handle, _join) =
            Listener::spawn(config(dead_url().await), store, notifier.clone());

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.unread_count, 0);
        assert!(!status.settings.enabled);

        // Test notifications ignore the toggles and leave the session alone
        assert!(handle.test_notification().await.unwrap().success);
        assert_eq!(notifier.shown.lock()[0].title, "Test Notification");
        let status = handle.get_status().await.unwrap();
        assert_eq!(status.unread_count, 0);
        assert!(status.notifications.is_empty());

        assert!(handle.mark_as_read().await.unwrap().success);
        assert!(handle.clear_notifications().await.unwrap().success);
        assert!(!handle.remove_notification("unknown").await.unwrap().success);
        assert!(handle.reconnect().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_receives_events_and_pings() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());

        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let welcome = serde_json::to_string(&ControlMessage::connected()).unwrap();
            ws.send(Message::Text(welcome.into())).await.unwrap();
            for body in [
                r#"{"type":"permission_prompt","timestamp":"2025-01-01T00:00:00.000Z"}"#,
                r#"{"type":"stop","message":"done","timestamp":"2025-01-01T00:00:01.000Z"}"#,
            ] {
                ws.send(Message::Text(body.into())).await.unwrap();
            }
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let _ = ping_tx.send(text.as_str().to_string());
                }
            }
        });

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut cfg = config(url);
        cfg.ping_interval_secs = 1;
        let (handle, _join) = Listener::spawn(cfg, store, notifier.clone());

        let status = wait_for(&handle, |s| s.notifications.len() == 2).await;
        assert_eq!(status.connection_status, ConnectionStatus::Connected);
        assert_eq!(status.unread_count, 2);
        // 新しい順
        assert_eq!(status.notifications[0].event.kind, EventKind::Stop);
        assert_eq!(status.notifications[1].event.kind, EventKind::PermissionPrompt);

        {
            let shown = notifier.shown.lock();
            assert_eq!(shown.len(), 2);
            assert!(shown[0].persistent);
            assert_eq!(shown[1].message, "done");
        }
        let badge = notifier.badges.lock().last().cloned().unwrap();
        assert_eq!(badge.text, "2");
        assert_eq!(badge.color, "#4CAF50");

        let ping = tokio::time::timeout(Duration::from_secs(3), ping_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);

        handle.mark_as_read().await.unwrap();
        let status = handle.get_status().await.unwrap();
        assert_eq!(status.unread_count, 0);
        assert_eq!(status.notifications.len(), 2);

        // Only the transient stop notification expires
        let stop_id = status.notifications[0].id.clone();
        let deadline = Instant::now() + Duration::from_secs(3);
        while notifier.dismissed.lock().is_empty() {
            assert!(Instant::now() < deadline, "stop notification never expired");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(*notifier.dismissed.lock(), vec![stop_id]);

        let permission_id = status.notifications[1].id.clone();
        assert!(handle.remove_notification(&permission_id).await.unwrap().success);
        assert_eq!(handle.get_status().await.unwrap().notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drops() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());

        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = server.accept().await {
                let Ok(mut ws) = accept_async(stream).await else {
                    continue;
                };
                let _ = accepted_tx.send(());
                // 接続を受けたらすぐ閉じる
                let _ = ws.close(None).await;
                while ws.next().await.is_some() {}
            }
        });

        let notifier = Arc::new(RecordingNotifier::default());
        let (handle, _join) =
            Listener::spawn(config(url), Arc::new(MemoryStore::new()), notifier);

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        handle.shutdown().await.unwrap();
    }

    /// Accepts WebSocket clients and reports each accept; connections stay
    /// open until the peer leaves
    fn counting_server(server: TcpListener) -> mpsc::UnboundedReceiver<()> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = server.accept().await {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let _ = accepted_tx.send(());
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        accepted_rx
    }

    #[tokio::test]
    async fn test_manual_reconnect_replaces_live_connection_at_once() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config(format!("ws://{}", server.local_addr().unwrap()));
        // 手動再接続はバックオフを待たない
        cfg.reconnect_floor_ms = 10_000;
        cfg.reconnect_ceiling_ms = 60_000;
        let mut accepted = counting_server(server);

        let (handle, _join) = Listener::spawn(
            cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::default()),
        );
        tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for(&handle, |s| s.connection_status == ConnectionStatus::Connected).await;

        assert!(handle.reconnect().await.unwrap().success);
        tokio::time::timeout(Duration::from_secs(1), accepted.recv())
            .await
            .expect("no new connection after manual reconnect")
            .unwrap();
        wait_for(&handle, |s| s.connection_status == ConnectionStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_manual_reconnect_resets_backoff_to_floor() {
        let url = dead_url().await;
        let addr = url.trim_start_matches("ws://").to_string();
        let mut cfg = config(url);
        cfg.reconnect_floor_ms = 200;
        cfg.reconnect_ceiling_ms = 60_000;

        let (handle, _join) = Listener::spawn(
            cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::default()),
        );

        // Attempts at roughly 0, 0.2, 0.6, 1.4 and 3.0s; the next one waits 3.2s
        tokio::time::sleep(Duration::from_millis(3300)).await;
        assert_ne!(
            handle.get_status().await.unwrap().connection_status,
            ConnectionStatus::Connected
        );

        // Reconnect while the broker is still down: that attempt fails too
        handle.reconnect().await.unwrap();
        wait_for(&handle, |s| s.connection_status == ConnectionStatus::Error).await;

        // The retry after it uses the floor again, well before the old 3.2s delay
        let server = TcpListener::bind(&addr).await.unwrap();
        let mut accepted = counting_server(server);
        let started = Instant::now();
        tokio::time::timeout(Duration::from_millis(1500), accepted.recv())
            .await
            .expect("retry did not restart from the floor delay")
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
        wait_for(&handle, |s| s.connection_status == ConnectionStatus::Connected).await;
    }
}
