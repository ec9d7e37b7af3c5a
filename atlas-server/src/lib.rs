//! Central config server for atlas
//!
//! Responsibilities:
//! - Accept each agent's full rule snapshot (init exchange)
//! - Accept incremental rule deltas (update exchange)
//! - Hand every agent the deltas other agents published since its last sync
//!
//! Rules are last-write-wins per (node IP, public port). Deltas are kept only
//! while some agent still needs them, and never longer than the retention
//! window; an agent that fell behind the kept history is asked to init again.

pub mod http;

use atlas_common::{Rule, RuleKey, RuleMap, SyncRequest, SyncResponse};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on how long a delta is kept
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// One accepted batch of rules, as published by a single agent
#[derive(Debug, Clone)]
struct UpdateBatch {
    host_ip: String,
    rules: Vec<Rule>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct CenterState {
    rules: RuleMap,
    /// Hosts that completed an init since the last reset, with the timestamp
    /// each was last answered with
    cursors: HashMap<String, i64>,
    /// Ordered by timestamp; complete from `history_floor` on
    history: Vec<UpdateBatch>,
    history_floor: i64,
    last_timestamp: i64,
}

impl CenterState {
    /// Millisecond wall clock that never goes backwards
    fn tick(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp);
        self.last_timestamp
    }

    /// Drop batches every agent has already seen, and any older than
    /// `retention`
    fn prune(&mut self, now: i64, retention: i64) {
        let oldest_cursor = self.cursors.values().copied().min().unwrap_or(now);
        let cutoff = oldest_cursor.max(now.saturating_sub(retention));
        if cutoff <= self.history_floor {
            return;
        }
        let end = self.history.partition_point(|batch| batch.timestamp < cutoff);
        self.history.drain(..end);
        self.history_floor = cutoff;
    }
}

/// In-memory rule authority shared by every agent
#[derive(Debug)]
pub struct RuleCenter {
    state: Mutex<CenterState>,
    /// Milliseconds
    retention: i64,
}

impl Default for RuleCenter {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl RuleCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Mutex::new(CenterState::default()),
            retention: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Treat the payload as the caller's complete state
    ///
    /// Returns the merged view of every other node.
    pub fn init(&self, req: &SyncRequest) -> Result<SyncResponse, ServerError> {
        validate(req)?;
        let mut state = self.state.lock();
        let timestamp = state.tick();

        let results = state
            .rules
            .to_rules()
            .into_iter()
            .filter(|rule| rule.key.node_ip != req.host_ip)
            .collect();

        // Deltas seen by other agents must also carry what the snapshot dropped.
        let mut batch: Vec<Rule> = state
            .rules
            .node(&req.host_ip)
            .map(|ports| {
                ports
                    .keys()
                    .filter(|port| {
                        !own_rules(req)
                            .any(|r| r.key.public_port == **port && !r.container.is_deleted)
                    })
                    .map(|port| Rule::deletion(RuleKey::new(req.host_ip.clone(), *port)))
                    .collect()
            })
            .unwrap_or_default();
        batch.extend(own_rules(req).cloned());

        state.rules.replace_node(
            &req.host_ip,
            own_rules(req).map(|rule| (rule.key.public_port, rule.container.clone())),
        );
        state.cursors.insert(req.host_ip.clone(), timestamp);
        state.history.push(UpdateBatch {
            host_ip: req.host_ip.clone(),
            rules: batch,
            timestamp,
        });
        state.prune(timestamp, self.retention);

        debug!(
            "init from {}: {} rules accepted, {} nodes known, {} batches kept",
            req.host_ip,
            req.update_rule.len(),
            state.cursors.len(),
            state.history.len()
        );

        Ok(SyncResponse {
            results,
            need_init: false,
            update_timestamp: timestamp,
        })
    }

    /// Record the caller's delta and return other nodes' recent deltas
    pub fn update(&self, req: &SyncRequest) -> Result<SyncResponse, ServerError> {
        validate(req)?;
        let mut state = self.state.lock();
        let timestamp = state.tick();

        if !state.cursors.contains_key(&req.host_ip) {
            debug!("update from unknown host {}, asking for init", req.host_ip);
            return Ok(need_init(timestamp));
        }
        if req.last_update_timestamp < state.history_floor {
            debug!(
                "update from {} predates the kept history ({} < {}), asking for init",
                req.host_ip, req.last_update_timestamp, state.history_floor
            );
            return Ok(need_init(timestamp));
        }

        let start = state
            .history
            .partition_point(|batch| batch.timestamp < req.last_update_timestamp);
        let mut window: BTreeMap<RuleKey, Rule> = BTreeMap::new();
        for batch in &state.history[start..] {
            if batch.host_ip == req.host_ip {
                continue;
            }
            for rule in &batch.rules {
                window.insert(rule.key.clone(), rule.clone());
            }
        }

        let delta: Vec<Rule> = own_rules(req).cloned().collect();
        if !delta.is_empty() {
            for rule in &delta {
                state.rules.accept(&rule.key, rule.container.clone());
            }
            state.history.push(UpdateBatch {
                host_ip: req.host_ip.clone(),
                rules: delta,
                timestamp,
            });
        }
        state.cursors.insert(req.host_ip.clone(), timestamp);
        state.prune(timestamp, self.retention);

        Ok(SyncResponse {
            results: window.into_values().collect(),
            need_init: false,
            update_timestamp: timestamp,
        })
    }

    /// Forget every node, as if the server restarted
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let last_timestamp = state.last_timestamp;
        *state = CenterState {
            last_timestamp,
            ..Default::default()
        };
    }

    /// Copy of the merged view
    pub fn snapshot(&self) -> RuleMap {
        self.state.lock().rules.clone()
    }

    /// Number of delta batches currently kept
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }
}

fn need_init(timestamp: i64) -> SyncResponse {
    SyncResponse {
        results: Vec::new(),
        need_init: true,
        update_timestamp: timestamp,
    }
}

/// Rules a node may publish: only keys on its own IP
fn own_rules(req: &SyncRequest) -> impl Iterator<Item = &Rule> {
    req.update_rule
        .iter()
        .filter(move |rule| rule.key.node_ip == req.host_ip)
}

fn validate(req: &SyncRequest) -> Result<(), ServerError> {
    if req.host_ip.is_empty() {
        return Err(ServerError::InvalidRequest("hostIp is empty".to_string()));
    }
    Ok(())
}
