//! Authorization broker
//!
//! Routes "unknown" ACL decisions to an administrator and hands the
//! outcome back to the waiting request. Two paths:
//!
//! - With a public `base_url`, the client receives an `auth_url`
//!   response and the request suspends on a waiter keyed by the
//!   pending-request id. The HTTP approval handler (or the reaper)
//!   wakes it.
//! - Without one, an `acl` RPC goes out to every whitelisted admin
//!   over the admin channel; the first response wins.
//!
//! Every pending request is an independent wait; nothing here
//! serialises across requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::acl;
use crate::database::models::{PendingRequest, PENDING_REQUEST_TTL_SECS};
use crate::database::Database;

/// How long the relay admin path waits for the first verdict.
const ADMIN_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace on top of the reaper TTL before a waiter gives up on its own.
const WAITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied,
}

/// An `acl` query forwarded to the admin channel for relay delivery.
#[derive(Debug)]
pub struct AclQuery {
    pub key_name: Option<String>,
    pub remote_pubkey: String,
    pub method: String,
    pub param: Option<String>,
    pub description: Option<String>,
    /// first verdict string wins; the rest are discarded
    pub reply: oneshot::Sender<String>,
}

/// An open pending request: the row id, the approval URL when the
/// HTTP path applies, and the waiter the decision arrives on.
pub struct Ticket {
    pub pending_id: String,
    pub auth_url: Option<String>,
    rx: oneshot::Receiver<Verdict>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("request denied")]
    Denied,
    #[error("authorization timed out")]
    Timeout,
    #[error("no admin reachable for authorization")]
    NoDecisionPath,
    #[error("policy store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub struct Broker {
    database: Database,
    base_url: Option<String>,
    acl_tx: mpsc::UnboundedSender<AclQuery>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Verdict>>>,
}

impl Broker {
    pub fn new(
        database: Database,
        base_url: Option<String>,
        acl_tx: mpsc::UnboundedSender<AclQuery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            base_url,
            acl_tx,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Persist a pending request, register its waiter, and schedule
    /// the 60 s reaper.
    pub async fn open(
        self: &Arc<Self>,
        key_name: Option<&str>,
        request_id: &str,
        remote_pubkey: &str,
        method: &str,
        params: &[String],
    ) -> Result<Ticket, BrokerError> {
        let row = PendingRequest::create(
            request_id,
            key_name,
            remote_pubkey,
            method,
            params,
            &self.database,
        )
        .await?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(row.id.clone(), tx);

        let broker = Arc::clone(self);
        let pending_id = row.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(PENDING_REQUEST_TTL_SECS as u64)).await;
            broker.expire(&pending_id).await;
        });

        let auth_url = self
            .base_url
            .as_ref()
            .map(|base| format!("{}/requests/{}", base.trim_end_matches('/'), row.id));

        Ok(Ticket {
            pending_id: row.id,
            auth_url,
            rx,
        })
    }

    /// Suspend until the administrator decides over HTTP or the reaper
    /// fires. On approval, returns the stored params, which the
    /// admin's form may have rewritten.
    pub async fn wait(self: &Arc<Self>, ticket: Ticket) -> Result<Vec<String>, BrokerError> {
        let ttl = Duration::from_secs(PENDING_REQUEST_TTL_SECS as u64) + WAITER_GRACE;
        let verdict = tokio::time::timeout(ttl, ticket.rx).await;

        self.waiters.lock().await.remove(&ticket.pending_id);

        match verdict {
            Ok(Ok(Verdict::Approved)) => {
                let row = PendingRequest::get(&ticket.pending_id, &self.database).await?;
                match row {
                    Some(row) => Ok(row.params_vec()),
                    // approved but already reaped; params are gone
                    None => Err(BrokerError::Timeout),
                }
            }
            Ok(Ok(Verdict::Denied)) | Ok(Err(_)) => Err(BrokerError::Denied),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    /// Relay fallback: forward an `acl` query to the admin channel and
    /// act on the first verdict within 10 s.
    ///
    /// `always` and `never` persist a signing condition before
    /// resolving; `allow` and `deny` are transient.
    pub async fn ask_admins(
        self: &Arc<Self>,
        ticket: Ticket,
        key_name: Option<&str>,
        remote_pubkey: &str,
        method: &str,
        params: &[String],
        description: Option<&str>,
    ) -> Result<Vec<String>, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let query = AclQuery {
            key_name: key_name.map(str::to_string),
            remote_pubkey: remote_pubkey.to_string(),
            method: method.to_string(),
            param: params.first().cloned(),
            description: description.map(str::to_string),
            reply: reply_tx,
        };
        if self.acl_tx.send(query).is_err() {
            self.finish(&ticket.pending_id, false).await?;
            return Err(BrokerError::NoDecisionPath);
        }

        let verdict = tokio::time::timeout(ADMIN_RPC_TIMEOUT, reply_rx).await;
        self.waiters.lock().await.remove(&ticket.pending_id);

        let verdict = match verdict {
            Ok(Ok(v)) => v,
            Ok(Err(_)) | Err(_) => {
                self.finish(&ticket.pending_id, false).await?;
                return Err(BrokerError::Timeout);
            }
        };

        match verdict.as_str() {
            "allow" | "true" => {
                self.finish(&ticket.pending_id, true).await?;
                Ok(params.to_vec())
            }
            "always" => {
                if let Some(key_name) = key_name {
                    acl::permit_all_requests(
                        key_name,
                        remote_pubkey,
                        method,
                        None,
                        description,
                        &self.database,
                    )
                    .await?;
                }
                self.finish(&ticket.pending_id, true).await?;
                Ok(params.to_vec())
            }
            "never" => {
                if let Some(key_name) = key_name {
                    acl::reject_all_requests(key_name, remote_pubkey, description, &self.database)
                        .await?;
                }
                self.finish(&ticket.pending_id, false).await?;
                Err(BrokerError::Denied)
            }
            // "deny" | "false" and anything unrecognised
            _ => {
                self.finish(&ticket.pending_id, false).await?;
                Err(BrokerError::Denied)
            }
        }
    }

    /// Wake the waiter for a decided request. Idempotent: a missing
    /// waiter (already woken, already reaped) is a no-op.
    pub async fn resolve(&self, pending_id: &str, verdict: Verdict) {
        if let Some(tx) = self.waiters.lock().await.remove(pending_id) {
            let _ = tx.send(verdict);
        }
    }

    /// Reaper entry point: remove the row and, when it was still
    /// undecided, signal expiry to any waiter.
    pub async fn expire(&self, pending_id: &str) {
        match PendingRequest::reap(pending_id, &self.database).await {
            Ok(true) => {
                tracing::debug!(pending_id, "pending request expired undecided");
                self.resolve(pending_id, Verdict::Denied).await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(pending_id, "failed to reap pending request: {}", e);
            }
        }
    }

    async fn finish(&self, pending_id: &str, allowed: bool) -> Result<(), sqlx::Error> {
        PendingRequest::decide(pending_id, allowed, None, &self.database).await?;
        Ok(())
    }
}
