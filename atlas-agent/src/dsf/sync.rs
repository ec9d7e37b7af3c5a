use super::{ConfigServer, DsfRuleMap};
use crate::error::Result;
use atlas_common::SyncRequest;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Rounds between two dumps of the merged view in debug mode
const DEBUG_DUMP_ROUNDS: u32 = 4;

/// Periodic exchange of rule changes with the config server
///
/// Starts out asking for a full resync. Any failed round falls back to a
/// full resync on the next one, since the server may or may not have seen the
/// changes that round carried.
pub struct RuleSynchronizer<S> {
    rules: Arc<DsfRuleMap>,
    server: S,
    remote_need_init: bool,
    last_update_timestamp: i64,
    debug: bool,
}

impl<S: ConfigServer> RuleSynchronizer<S> {
    pub fn new(rules: Arc<DsfRuleMap>, server: S) -> Self {
        Self {
            rules,
            server,
            remote_need_init: true,
            last_update_timestamp: 0,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn remote_need_init(&self) -> bool {
        self.remote_need_init
    }

    pub fn last_update_timestamp(&self) -> i64 {
        self.last_update_timestamp
    }

    /// One init or update exchange
    ///
    /// Rules returned by the server are queued, not yet applied, when this
    /// returns.
    pub async fn sync_once(&mut self) -> Result<()> {
        let init = self.remote_need_init;
        let request = SyncRequest {
            host_ip: self.rules.host_ip().to_string(),
            update_rule: self.rules.drain_outgoing(init),
            last_update_timestamp: self.last_update_timestamp,
        };
        debug!(
            "DSF {} with {} rules since {}",
            if init { "init" } else { "update" },
            request.update_rule.len(),
            request.last_update_timestamp
        );

        let result = if init {
            self.server.init(&request).await
        } else {
            self.server.update(&request).await
        };

        match result {
            Ok(response) => {
                if init {
                    info!(
                        "DSF rules initialized with config server, {} remote rules",
                        response.results.len()
                    );
                }
                self.rules.update_remote(response.results).await;
                self.remote_need_init = response.need_init;
                self.last_update_timestamp = response.update_timestamp;
                Ok(())
            }
            Err(e) => {
                self.remote_need_init = true;
                Err(e)
            }
        }
    }

    /// Sync every `interval` until cancelled, the first time one interval
    /// after start
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!("Starting DSF sync every {:?}", interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rounds = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.debug {
                rounds += 1;
                if rounds >= DEBUG_DUMP_ROUNDS {
                    rounds = 0;
                    info!("DSF rules:\n{}", self.rules.dump());
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sync_once() => result,
            };
            if let Err(e) = result {
                warn!("DSF sync failed, resending all local rules next round: {}", e);
            }
        }

        info!("DSF sync stopped");
    }
}
