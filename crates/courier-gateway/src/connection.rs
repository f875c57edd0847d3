use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use courier_types::events::{FeedCommand, FeedEvent};
use courier_types::models::AccountId;

use crate::dispatcher::{Dispatcher, FeedFrame};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Subscriptions = Arc<RwLock<HashSet<AccountId>>>;

/// Handle a feed connection. Authentication already happened at the HTTP
/// upgrade, so the listener gets `Ready` straight away.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (mut sender, receiver) = socket.split();
    let listener = dispatcher.register_listener().await;
    let conn_id = listener.connection_id;
    // Subscribe before Ready so nothing committed after Ready is missed.
    let broadcast_rx = dispatcher.subscribe();

    info!("Feed listener {} connected", conn_id);

    let ready = FeedEvent::Ready {
        connection_id: conn_id.to_string(),
    };
    let sent = match serde_json::to_string(&ready) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize Ready event: {}", e);
            false
        }
    };

    if sent {
        run_connection_loop(sender, receiver, broadcast_rx, conn_id).await;
    }

    dispatcher.unregister_listener(conn_id).await;
    info!("Feed listener {} disconnected", conn_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<FeedFrame>,
    conn_id: Uuid,
) {
    // Empty set means every account.
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let frame = match result {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Feed listener {} lagged by {} events", conn_id, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if !wants(&send_subscriptions, frame.account_id.as_ref()) {
                        continue;
                    }

                    if sender.send(Message::Text(frame.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping listener {}",
                                missed_heartbeats, conn_id
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_subscriptions = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<FeedCommand>(&text) {
                    Ok(cmd) => handle_command(conn_id, cmd, &recv_subscriptions),
                    Err(e) => {
                        warn!(
                            "Feed listener {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

fn handle_command(conn_id: Uuid, cmd: FeedCommand, subscriptions: &Subscriptions) {
    match cmd {
        FeedCommand::Subscribe { account_ids } => {
            info!(
                "Feed listener {} subscribing to {} accounts",
                conn_id,
                account_ids.len()
            );
            match subscriptions.write() {
                Ok(mut subs) => {
                    subs.clear();
                    subs.extend(account_ids);
                }
                Err(_) => warn!("Subscription lock poisoned for listener {}", conn_id),
            }
        }
    }
}

/// Whether a frame scoped to `account` should reach this listener.
fn wants(subscriptions: &Subscriptions, account: Option<&AccountId>) -> bool {
    let Some(account) = account else {
        return true;
    };
    match subscriptions.read() {
        Ok(subs) => subs.is_empty() || subs.contains(account),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs(ids: &[&str]) -> Subscriptions {
        Arc::new(RwLock::new(ids.iter().map(|id| AccountId::new(*id)).collect()))
    }

    #[test]
    fn empty_subscription_receives_everything() {
        let all = subs(&[]);
        assert!(wants(&all, Some(&AccountId::new("acc_1"))));
        assert!(wants(&all, None));
    }

    #[test]
    fn subscription_filters_by_account() {
        let one = subs(&["acc_1"]);
        assert!(wants(&one, Some(&AccountId::new("acc_1"))));
        assert!(!wants(&one, Some(&AccountId::new("acc_2"))));
        assert!(wants(&one, None));
    }

    #[test]
    fn subscribe_replaces_previous_filter() {
        let current = subs(&["acc_1"]);
        handle_command(
            Uuid::new_v4(),
            FeedCommand::Subscribe {
                account_ids: vec![AccountId::new("acc_2")],
            },
            &current,
        );
        assert!(!wants(&current, Some(&AccountId::new("acc_1"))));
        assert!(wants(&current, Some(&AccountId::new("acc_2"))));
    }
}
