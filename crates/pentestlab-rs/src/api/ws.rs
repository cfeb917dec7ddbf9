use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    hub::{Received, Subscription},
    AppState,
};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let subscription = state.hub.subscribe();
    debug!(subscribers = state.hub.subscriber_count(), "websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

/// Text frame for one hub delivery. Lag is surfaced so clients know to re-poll.
fn encode(received: &Received) -> Option<String> {
    match received {
        Received::Event(frame) => match serde_json::to_string(&frame.event) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, scan_id = frame.event.scan_id(), sequence = frame.sequence, "could not encode hub event");
                None
            }
        },
        Received::Missed(count) => {
            Some(json!({"type": "missed", "data": {"count": count}}).to_string())
        }
    }
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let conn_id = Uuid::new_v4();
    debug!(%conn_id, "websocket subscriber connected");
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                received = subscription.recv() => match received {
                    Some(received) => match encode(&received) {
                        Some(text) => text,
                        None => continue,
                    },
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) if text.as_str().trim() == "ping" => {
                    let pong = json!({"type": "pong"}).to_string();
                    if reply_tx.send(pong).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(%conn_id, "websocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use serde_json::Value;
    use tokio::{net::TcpStream, time::timeout};
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    use super::*;
    use crate::{
        api::router,
        config::AppConfig,
        db::memory_pool,
        hub::{HubEvent, HubFrame},
        models::{NewScan, ScanStatus, ScanType},
        test_support::fake_tools,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(config: AppConfig) -> (AppState, SocketAddr) {
        let state = AppState::build(config, memory_pool().await).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr)
    }

    fn config(subscriber_buffer: usize) -> AppConfig {
        AppConfig {
            tools: fake_tools().config(),
            tool_timeout_secs: 5,
            subscriber_buffer,
            ..AppConfig::default()
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        client
    }

    /// Next text frame as JSON; fails the test after five quiet seconds.
    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no frame within 5s")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn ping(client: &mut Client) {
        client
            .send(WsMessage::Text("ping".to_string().into()))
            .await
            .unwrap();
        loop {
            if next_json(client).await["type"] == "pong" {
                return;
            }
        }
    }

    #[tokio::test]
    async fn connected_client_follows_a_scan_to_completion() {
        let (state, addr) = serve(config(256)).await;
        let mut client = connect(addr).await;
        ping(&mut client).await;

        let scan = state
            .scheduler
            .submit(NewScan {
                name: "web1".into(),
                target: "10.0.0.5".into(),
                scan_type: ScanType::NetworkPortScan,
            })
            .await
            .unwrap();

        let mut statuses = vec![];
        let mut saw_output = false;
        while statuses.last().map(String::as_str) != Some("completed") {
            let frame = next_json(&mut client).await;
            assert_eq!(frame["data"]["scan_id"], scan.id);
            match frame["type"].as_str() {
                Some("scan_update") => {
                    statuses.push(frame["data"]["status"].as_str().unwrap().to_string());
                }
                Some("tool_output") => saw_output = true,
                other => panic!("unexpected frame type {other:?}"),
            }
        }
        assert!(saw_output);
        assert_eq!(statuses, vec!["pending", "running", "completed"]);
        assert_eq!(next_json(&mut client).await["type"], "recommendations");
    }

    #[tokio::test]
    async fn client_close_releases_the_subscription() {
        let (state, addr) = serve(config(256)).await;
        let mut client = connect(addr).await;
        ping(&mut client).await;
        assert_eq!(state.hub.subscriber_count(), 1);

        client.close(None).await.unwrap();
        for _ in 0..100 {
            if state.hub.subscriber_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("subscription still held after the client closed");
    }

    #[tokio::test]
    async fn lagging_client_is_told_how_much_it_missed() {
        let (state, addr) = serve(config(4)).await;
        let mut client = connect(addr).await;
        ping(&mut client).await;

        // no await in between, so the socket task cannot keep up
        for i in 0..50 {
            state
                .hub
                .publish(HubEvent::scan_update(i, ScanStatus::Running, "scan started"));
        }

        let notice = next_json(&mut client).await;
        assert_eq!(notice["type"], "missed");
        assert!(notice["data"]["count"].as_u64().unwrap() > 0);
        let after = next_json(&mut client).await;
        assert_eq!(after["type"], "scan_update");
    }

    #[test]
    fn events_are_sent_as_type_and_data() {
        let frame = Received::Event(HubFrame {
            sequence: 1,
            event: HubEvent::scan_update(4, ScanStatus::Completed, "scan completed"),
        });
        let text = encode(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "scan_update");
        assert_eq!(value["data"]["status"], "completed");
    }

    #[test]
    fn lag_becomes_a_missed_notice() {
        let value: Value = serde_json::from_str(&encode(&Received::Missed(12)).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "missed", "data": {"count": 12}}));
    }
}
