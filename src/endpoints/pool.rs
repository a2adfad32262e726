use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::runtime::ChainRuntime;
use crate::indexer::span::SpanBounds;
use crate::rpc::{EndpointHealth, RpcClient, RpcClientOptions};

/// One row of `chain_endpoints`. Edited by the admin surface, read-only here.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainEndpoint {
    pub id: i64,
    pub chain_id: i64,
    pub url: String,
    pub label: Option<String>,
    pub is_primary: bool,
    pub enabled: bool,
    pub qps: Option<f64>,
    pub min_span: Option<i64>,
    pub max_span: Option<i64>,
    pub weight: i32,
    pub order_index: i32,
    pub last_health: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ChainEndpoint {
    /// Span bounds with this endpoint's overrides applied over the chain's.
    pub fn bounds(&self, chain: SpanBounds) -> SpanBounds {
        let min = self.min_span.map(|v| v.max(1) as u64).unwrap_or(chain.min);
        let max = self.max_span.map(|v| v.max(1) as u64).unwrap_or(chain.max);
        SpanBounds::new(min, max)
    }
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    at: DateTime<Utc>,
    health: EndpointHealth,
}

/// Endpoints excluded from selection after an unauthorized or malformed
/// response.
///
/// An entry lapses after `window`, or as soon as the endpoint row is edited
/// after the failure so an admin fix takes effect on the next cycle.
#[derive(Debug)]
pub struct EndpointCooldowns {
    window: chrono::Duration,
    entries: Mutex<HashMap<i64, Cooldown>>,
}

impl EndpointCooldowns {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, endpoint_id: i64, health: EndpointHealth, at: DateTime<Utc>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint_id, Cooldown { at, health });
    }

    pub fn clear(&self, endpoint_id: i64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint_id);
    }

    /// The health that put `endpoint` in cooldown, if it is still cooling.
    /// Lapsed entries are dropped on the way.
    pub fn cooling(&self, endpoint: &ChainEndpoint, now: DateTime<Utc>) -> Option<EndpointHealth> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = *entries.get(&endpoint.id)?;
        if now - entry.at >= self.window || endpoint.updated_at > entry.at {
            entries.remove(&endpoint.id);
            return None;
        }
        Some(entry.health)
    }
}

/// Enabled, non-cooling endpoints, best first: primary, then lowest order
/// index, then highest weight, then lowest id.
pub fn rank_endpoints<'a>(
    endpoints: &'a [ChainEndpoint],
    cooldowns: &EndpointCooldowns,
    now: DateTime<Utc>,
) -> Vec<&'a ChainEndpoint> {
    let mut candidates: Vec<&ChainEndpoint> = endpoints
        .iter()
        .filter(|e| e.enabled && cooldowns.cooling(e, now).is_none())
        .collect();
    candidates.sort_by(|a, b| {
        b.is_primary
            .cmp(&a.is_primary)
            .then(a.order_index.cmp(&b.order_index))
            .then(b.weight.cmp(&a.weight))
            .then(a.id.cmp(&b.id))
    });
    candidates
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcSource {
    Endpoint,
    ChainOverride,
    Default,
}

/// The connection parameters a poller uses for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRpc {
    pub url: String,
    pub endpoint_id: Option<i64>,
    pub qps: Option<f64>,
    pub bounds: SpanBounds,
    pub source: RpcSource,
}

/// Pick the RPC for a chain: the best usable endpoint, else (only when the
/// chain has no enabled endpoints at all) the chain's explicit `rpc_url`, else
/// the environment default. `None` means the chain is not ready, which
/// includes every enabled endpoint cooling down.
pub fn resolve_rpc(
    runtime: &ChainRuntime,
    cooldowns: &EndpointCooldowns,
    now: DateTime<Utc>,
) -> Option<ResolvedRpc> {
    if let Some(best) = rank_endpoints(&runtime.endpoints, cooldowns, now).first() {
        return Some(ResolvedRpc {
            url: best.url.clone(),
            endpoint_id: Some(best.id),
            qps: best.qps.or(runtime.qps),
            bounds: best.bounds(runtime.bounds),
            source: RpcSource::Endpoint,
        });
    }
    if runtime.endpoints.iter().any(|e| e.enabled) {
        return None;
    }

    let (url, source) = match (&runtime.rpc_override, &runtime.default_rpc) {
        (Some(url), _) => (url.clone(), RpcSource::ChainOverride),
        (None, Some(url)) => (url.clone(), RpcSource::Default),
        (None, None) => return None,
    };

    Some(ResolvedRpc {
        url,
        endpoint_id: None,
        qps: runtime.qps,
        bounds: runtime.bounds,
        source,
    })
}

#[derive(Debug, Clone, PartialEq)]
struct SlotKey {
    endpoint_id: Option<i64>,
    url: String,
    qps: Option<f64>,
}

/// The RPC client a poller is currently using.
///
/// The client is kept across cycles while the resolved endpoint stays the
/// same, so its pacing state and "block receipts unsupported" memory survive.
/// Switching endpoint (or editing its url/qps) builds a fresh client.
#[derive(Default)]
pub struct ClientSlot {
    current: Option<(SlotKey, Arc<RpcClient>)>,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_for(
        &mut self,
        resolved: &ResolvedRpc,
        options: &RpcClientOptions,
    ) -> eyre::Result<Arc<RpcClient>> {
        let key = SlotKey {
            endpoint_id: resolved.endpoint_id,
            url: resolved.url.clone(),
            qps: resolved.qps,
        };
        if let Some((current, client)) = &self.current {
            if *current == key {
                return Ok(client.clone());
            }
        }

        let options = RpcClientOptions {
            qps: resolved.qps,
            ..options.clone()
        };
        let client = Arc::new(RpcClient::new(resolved.url.clone(), options)?);
        self.current = Some((key, client.clone()));
        Ok(client)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
