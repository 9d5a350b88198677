//! Per-user-key protocol termination
//!
//! One endpoint per unlocked key: subscribe to kind-24133 events
//! addressed to the key's pubkey, decrypt, dispatch, encrypt the
//! reply, publish it back with the client as the `#p` tag.
//!
//! Requests from one client are processed in arrival order through a
//! per-client worker; clients never order against each other. An
//! undecryptable or unparseable event is dropped without a reply so
//! unauthenticated origins learn nothing.

mod handler;

use std::collections::HashMap;

use nostr_sdk::prelude::*;
use tokio::sync::{mpsc, watch};

use common::nip46::Response;

use crate::state::State;

/// Which payload encryption the client spoke; replies mirror it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Nip04,
    Nip44,
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),
    #[error("relay client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),
    #[error("event build error: {0}")]
    EventBuilder(#[from] nostr_sdk::event::builder::Error),
    #[error("encrypt error: {0}")]
    Nip04(#[from] nostr_sdk::nips::nip04::Error),
    #[error("encrypt error: {0}")]
    Nip44(#[from] nostr_sdk::nips::nip44::Error),
}

/// Sends encrypted protocol responses back to one client.
#[derive(Clone)]
pub struct Responder {
    client: Client,
    keys: Keys,
    peer: PublicKey,
    cipher: Cipher,
}

impl Responder {
    pub fn new(client: Client, keys: Keys, peer: PublicKey, cipher: Cipher) -> Self {
        Self {
            client,
            keys,
            peer,
            cipher,
        }
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub async fn send(&self, response: &Response) -> Result<(), SignerError> {
        let payload = response.as_json();
        let secret_key = self.keys.secret_key()?;
        let content = match self.cipher {
            Cipher::Nip04 => nip04::encrypt(secret_key, &self.peer, payload)?,
            Cipher::Nip44 => {
                nip44::encrypt(secret_key, &self.peer, payload, nip44::Version::V2)?
            }
        };

        let event = EventBuilder::new(
            Kind::NostrConnect,
            content,
            [Tag::public_key(self.peer)],
        )
        .to_event(&self.keys)?;

        self.client.send_event(event).await?;
        Ok(())
    }
}

/// A running NIP-46 endpoint for one unlocked key.
pub struct SignerEndpoint {
    key_name: String,
    keys: Keys,
    relays: Vec<String>,
    state: State,
}

impl SignerEndpoint {
    pub fn new(key_name: String, keys: Keys, relays: Vec<String>, state: State) -> Self {
        Self {
            key_name,
            keys,
            relays,
            state,
        }
    }

    /// Subscribe and serve until shutdown. Inbound events are fanned
    /// out to per-client workers so one stalled approval cannot block
    /// another client.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<()>) -> Result<(), SignerError> {
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

        tracing::info!(
            key = %self.key_name,
            pubkey = %self.keys.public_key(),
            "signer endpoint listening"
        );

        let mut workers: HashMap<PublicKey, mpsc::UnboundedSender<Box<Event>>> = HashMap::new();
        let mut notifications = client.notifications();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                notification = notifications.recv() => {
                    let event = match notification {
                        Ok(RelayPoolNotification::Event { event, .. }) => event,
                        Ok(_) => continue,
                        Err(_) => break,
                    };
                    if event.kind != Kind::NostrConnect {
                        continue;
                    }

                    let peer = event.pubkey;
                    let sender = workers.entry(peer).or_insert_with(|| {
                        spawn_client_worker(
                            self.key_name.clone(),
                            self.keys.clone(),
                            client.clone(),
                            self.state.clone(),
                            peer,
                        )
                    });
                    if sender.send(event).is_err() {
                        // worker died; next event from this client respawns it
                        workers.remove(&peer);
                    }
                }
            }
        }

        let _ = client.disconnect().await;
        tracing::info!(key = %self.key_name, "signer endpoint stopped");
        Ok(())
    }
}

/// One ordered queue per client pubkey.
fn spawn_client_worker(
    key_name: String,
    keys: Keys,
    client: Client,
    state: State,
    peer: PublicKey,
) -> mpsc::UnboundedSender<Box<Event>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Box<Event>>();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_event(&key_name, &keys, &client, &state, peer, &event).await;
        }
    });

    tx
}

async fn handle_event(
    key_name: &str,
    keys: &Keys,
    client: &Client,
    state: &State,
    peer: PublicKey,
    event: &Event,
) {
    let (plaintext, cipher) = match decrypt_payload(keys, &peer, &event.content) {
        Some(decrypted) => decrypted,
        None => {
            tracing::debug!(key = key_name, "dropping undecryptable event");
            return;
        }
    };

    let request = match common::nip46::Request::from_json(&plaintext) {
        Ok(request) => request,
        Err(_) => {
            tracing::debug!(key = key_name, "dropping unparseable envelope");
            return;
        }
    };

    let responder = Responder::new(client.clone(), keys.clone(), peer, cipher);
    let response = handler::handle_request(state, key_name, keys, &responder, &request).await;

    if let Err(e) = responder.send(&response).await {
        tracing::warn!(key = key_name, "failed to publish response: {}", e);
    }
}

fn decrypt_payload(keys: &Keys, peer: &PublicKey, content: &str) -> Option<(String, Cipher)> {
    let secret_key = keys.secret_key().ok()?;
    if let Ok(plaintext) = nip04::decrypt(secret_key, peer, content) {
        return Some((plaintext, Cipher::Nip04));
    }
    if let Ok(plaintext) = nip44::decrypt(secret_key, peer, content) {
        return Some((plaintext, Cipher::Nip44));
    }
    None
}
