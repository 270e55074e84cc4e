//! Per-request decision: reject, or relay to the target socket.
//!
//! ```text
//!  Received ──(method not relayable)──────────────▶ BadRequest
//!     │
//!     ▼
//!  MethodChecked ──(rule table miss)──────────────▶ Unauthorized / NotFound
//!     │
//!     ▼
//!  BodyRead ──(malformed or over 8 MiB)───────────▶ BadRequest
//!     │
//!     ▼
//!  ConstructingUpstream ──(cannot build)──────────▶ InternalError
//!     │
//!     ▼
//!  relay ──(deadline, connect or backend failure)─▶ RequestTimeout
//!     │
//!     ▼
//!  Relayed
//! ```
//!
//! A rejected request never opens a connection to the target socket. The
//! first two checks only need the request head; when the body has not fully
//! arrived yet they run before it is read, and a rejection closes the
//! connection instead of draining the body.

use crate::http::request::Request;
use crate::proxy::rejection::Rejection;
use crate::proxy::upstream::{RelayClient, UpstreamResponse};
use crate::rules::{Decision, RoutingMode, RuleTable};

/// Terminal outcome of dispatching one request.
#[derive(Debug)]
pub enum Verdict {
    /// The backend answered; its response still has to be streamed back.
    Relayed(UpstreamResponse),
    /// A fixed error body is sent instead.
    Rejected(Rejection),
}

/// Shared by every connection task. Holds no mutable state.
#[derive(Debug)]
pub struct Dispatcher {
    rules: RuleTable,
    routing: RoutingMode,
    relay: RelayClient,
}

impl Dispatcher {
    pub fn new(rules: RuleTable, routing: RoutingMode, relay: RelayClient) -> Self {
        Self {
            rules,
            routing,
            relay,
        }
    }

    /// Method and allowlist checks, without touching the network.
    pub fn check(&self, request: &Request) -> Result<(), Rejection> {
        if !request.method.is_relayable() {
            return Err(Rejection::BadRequest);
        }

        match self.rules.decide(
            self.routing,
            request.method.as_str(),
            request.resource_path(),
        ) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Rejection::Unauthorized),
            Decision::Unrouted => Err(Rejection::NotFound),
        }
    }

    /// [`check`](Self::check), logging the rejection if there is one.
    ///
    /// Only needs the request head, so it can run while the body is still
    /// in flight.
    pub fn screen(&self, request: &Request) -> Result<(), Rejection> {
        self.check(request).inspect_err(|rejection| {
            tracing::info!(
                method = %request.method,
                path = %request.path,
                status = rejection.status().as_u16(),
                "Request rejected"
            );
        })
    }

    pub async fn dispatch(&self, request: &Request) -> Verdict {
        if let Err(rejection) = self.screen(request) {
            return Verdict::Rejected(rejection);
        }

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            body_len = request.body.len(),
            "Relaying request"
        );

        match self.relay.send(request).await {
            Ok(response) => {
                tracing::info!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status(),
                    "Request relayed"
                );
                Verdict::Relayed(response)
            }
            Err(e) if e.is_construction() => {
                tracing::error!(
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Failed to build upstream request"
                );
                Verdict::Rejected(Rejection::InternalError)
            }
            Err(e) => {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    socket = %self.relay.socket_path().display(),
                    error = %e,
                    "Upstream request failed"
                );
                Verdict::Rejected(Rejection::RequestTimeout)
            }
        }
    }
}
