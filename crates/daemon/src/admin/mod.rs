//! Management channel
//!
//! A second NIP-46-style endpoint bound to the bunker's admin
//! identity. It serves management RPCs for whitelisted admins, relays
//! `acl` queries from the authorization broker, and keeps a heartbeat:
//! a self-addressed ping every 20 s. Fifty seconds of silence means
//! the relay path is wedged, and the process exits non-zero so a
//! supervisor restarts it instead of leaving a deaf bunker running.

mod provision;
pub mod rpc;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nostr_sdk::prelude::*;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use common::nip46::{Request, Response};

use crate::broker::AclQuery;
use crate::signer::{Cipher, Responder, SignerError};
use crate::state::State;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(50);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// acl queries the admins never answered get pruned after this long
const ACL_QUERY_MAX_AGE: Duration = Duration::from_secs(30);

pub struct AdminChannel {
    state: State,
    keys: Keys,
    relays: Vec<String>,
    acl_rx: mpsc::UnboundedReceiver<AclQuery>,
}

impl AdminChannel {
    pub fn new(state: State, relays: Vec<String>, acl_rx: mpsc::UnboundedReceiver<AclQuery>) -> Self {
        let keys = state.admin_keys().clone();
        Self {
            state,
            keys,
            relays,
            acl_rx,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) -> Result<(), SignerError> {
        let client = Client::new(&self.keys);
        for relay in &self.relays {
            client.add_relay(relay.clone()).await?;
        }
        client.connect().await;

        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .pubkey(self.keys.public_key())
            .since(Timestamp::now());
        let _ = client.subscribe(vec![filter], None).await;

        self.emit_descriptor(&client).await;

        tracing::info!(pubkey = %self.keys.public_key(), "admin channel listening");

        let mut pending_acl: HashMap<String, (tokio::sync::oneshot::Sender<String>, Instant)> =
            HashMap::new();
        let mut last_ping = Instant::now();
        let mut acl_open = true;

        let mut ping_ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut check_ticker = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        let mut notifications = client.notifications();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                _ = ping_ticker.tick() => {
                    if let Err(e) = self.publish_self_ping(&client).await {
                        tracing::warn!("failed to publish heartbeat: {}", e);
                    }
                }

                _ = check_ticker.tick() => {
                    if last_ping.elapsed() > HEARTBEAT_TIMEOUT {
                        tracing::error!(
                            "no heartbeat observed for {}s; relay path is wedged",
                            last_ping.elapsed().as_secs()
                        );
                        std::process::exit(1);
                    }
                    pending_acl.retain(|_, (_, at)| at.elapsed() < ACL_QUERY_MAX_AGE);
                }

                query = self.acl_rx.recv(), if acl_open => {
                    match query {
                        Some(query) => {
                            self.dispatch_acl_query(&client, &mut pending_acl, query).await;
                        }
                        None => acl_open = false,
                    }
                }

                notification = notifications.recv() => {
                    let event = match notification {
                        Ok(RelayPoolNotification::Event { event, .. }) => event,
                        Ok(_) => continue,
                        Err(_) => break,
                    };
                    if event.kind != Kind::NostrConnect {
                        continue;
                    }

                    if event.pubkey == self.keys.public_key() {
                        if self.is_self_ping(&event) {
                            last_ping = Instant::now();
                        }
                        continue;
                    }

                    self.handle_inbound(&client, &mut pending_acl, &event).await;
                }
            }
        }

        let _ = client.disconnect().await;
        tracing::info!("admin channel stopped");
        Ok(())
    }

    /// Write the `bunker://` descriptor next to the config file and,
    /// when configured, DM it to each whitelisted admin.
    async fn emit_descriptor(&self, client: &Client) {
        let uri = self
            .state
            .bunker_uri(&self.keys.public_key(), true)
            .await
            .to_string();

        let path = self.state.connection_file().await;
        if let Err(e) = std::fs::write(&path, format!("{}\n", uri)) {
            tracing::warn!("failed to write {}: {}", path.display(), e);
        } else {
            tracing::info!("connection descriptor written to {}", path.display());
        }

        if self.state.app_config().await.admin.notify_admins_on_boot {
            for admin in self.state.admin_allowlist() {
                let dm = EventBuilder::encrypted_direct_msg(
                    &self.keys,
                    *admin,
                    format!("bunker online: {}", uri),
                    None,
                );
                match dm {
                    Ok(builder) => match builder.to_event(&self.keys) {
                        Ok(event) => {
                            if let Err(e) = client.send_event(event).await {
                                tracing::warn!("failed to DM admin {}: {}", admin, e);
                            }
                        }
                        Err(e) => tracing::warn!("failed to sign admin DM: {}", e),
                    },
                    Err(e) => tracing::warn!("failed to build admin DM: {}", e),
                }
            }
        }
    }

    async fn publish_self_ping(&self, client: &Client) -> Result<(), SignerError> {
        let me = self.keys.public_key();
        let request = Request::new(Uuid::new_v4().to_string(), "ping", vec![]);
        let content = nip04::encrypt(self.keys.secret_key()?, &me, request.as_json())?;
        let event = EventBuilder::new(Kind::NostrConnect, content, [Tag::public_key(me)])
            .to_event(&self.keys)?;
        client.send_event(event).await?;
        Ok(())
    }

    fn is_self_ping(&self, event: &Event) -> bool {
        let secret_key = match self.keys.secret_key() {
            Ok(sk) => sk,
            Err(_) => return false,
        };
        let plaintext = match nip04::decrypt(secret_key, &self.keys.public_key(), &event.content) {
            Ok(pt) => pt,
            Err(_) => return false,
        };
        matches!(Request::from_json(&plaintext), Ok(req) if req.method == "ping")
    }

    /// Forward an `acl` query to every whitelisted admin. The first
    /// response wins; routing happens in [`Self::handle_inbound`].
    async fn dispatch_acl_query(
        &self,
        client: &Client,
        pending_acl: &mut HashMap<String, (tokio::sync::oneshot::Sender<String>, Instant)>,
        query: AclQuery,
    ) {
        let admins = self.state.admin_allowlist().to_vec();
        if admins.is_empty() {
            // nobody to ask; the broker's timer will deny
            return;
        }

        let id = Uuid::new_v4().to_string();
        let payload = serde_json::json!({
            "keyName": query.key_name,
            "remotePubkey": query.remote_pubkey,
            "method": query.method,
            "param": query.param,
            "description": query.description,
        })
        .to_string();
        let request = Request::new(id.clone(), "acl", vec![payload]);

        pending_acl.insert(id, (query.reply, Instant::now()));

        let secret_key = match self.keys.secret_key() {
            Ok(sk) => sk,
            Err(e) => {
                tracing::error!("admin key unavailable: {}", e);
                return;
            }
        };
        for admin in admins {
            let content = match nip04::encrypt(secret_key, &admin, request.as_json()) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("failed to encrypt acl query for {}: {}", admin, e);
                    continue;
                }
            };
            let event = EventBuilder::new(Kind::NostrConnect, content, [Tag::public_key(admin)])
                .to_event(&self.keys);
            match event {
                Ok(event) => {
                    if let Err(e) = client.send_event(event).await {
                        tracing::warn!("failed to send acl query to {}: {}", admin, e);
                    }
                }
                Err(e) => tracing::warn!("failed to sign acl query: {}", e),
            }
        }
    }

    /// Decrypt an inbound event and route it: either an admin's
    /// verdict on an outstanding `acl` query, or a management RPC.
    async fn handle_inbound(
        &self,
        client: &Client,
        pending_acl: &mut HashMap<String, (tokio::sync::oneshot::Sender<String>, Instant)>,
        event: &Event,
    ) {
        let secret_key = match self.keys.secret_key() {
            Ok(sk) => sk,
            Err(_) => return,
        };

        let (plaintext, cipher) =
            if let Ok(pt) = nip04::decrypt(secret_key, &event.pubkey, &event.content) {
                (pt, Cipher::Nip04)
            } else if let Ok(pt) = nip44::decrypt(secret_key, &event.pubkey, &event.content) {
                (pt, Cipher::Nip44)
            } else {
                tracing::debug!("dropping undecryptable admin event");
                return;
            };

        if let Ok(request) = Request::from_json(&plaintext) {
            let responder =
                Responder::new(client.clone(), self.keys.clone(), event.pubkey, cipher);
            let state = self.state.clone();
            let requester = event.pubkey;
            // an RPC may suspend on an approval for up to a minute;
            // the heartbeat must not wait behind it
            tokio::spawn(async move {
                let response = rpc::handle_rpc(&state, &responder, requester, &request).await;
                if let Err(e) = responder.send(&response).await {
                    tracing::warn!("failed to publish admin response: {}", e);
                }
            });
            return;
        }

        if let Ok(response) = Response::from_json(&plaintext) {
            if let Some((reply, _)) = pending_acl.remove(&response.id) {
                let _ = reply.send(response.result);
            }
            return;
        }

        tracing::debug!("dropping unparseable admin payload");
    }
}
