//! Background refresh of the rule cache.
use crate::cache::RuleCache;
use crate::client::{RuleSource, TargetSource};
use crate::error::{XraySamplerError, XraySamplerResult};
use crate::rule::{Rule, SUPPORTED_RULE_VERSION};
use futures_executor::block_on;
use opentelemetry::{otel_debug, otel_error, otel_warn};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Keeps a [`RuleCache`] up to date with a remote source.
///
/// Rules are refreshed every `rule_interval` and targets every
/// `target_interval` by a dedicated background thread. Failed refreshes are
/// logged and the previously cached rules and targets stay in effect.
///
/// The poller stops when dropped.
#[derive(Debug)]
pub struct Poller<C> {
    shared: Arc<Shared<C>>,
    stop: Mutex<Option<SyncSender<()>>>,
}

#[derive(Debug)]
struct Shared<C> {
    source: C,
    cache: Arc<RuleCache>,
    rule_interval: Duration,
    target_interval: Duration,
}

impl<C> Poller<C>
where
    C: RuleSource + TargetSource + 'static,
{
    /// Creates a stopped poller feeding `cache` from `source`.
    pub fn new(
        source: C,
        cache: Arc<RuleCache>,
        rule_interval: Duration,
        target_interval: Duration,
    ) -> Self {
        Poller {
            shared: Arc::new(Shared {
                source,
                cache,
                rule_interval,
                target_interval,
            }),
            stop: Mutex::new(None),
        }
    }

    /// The cache this poller refreshes.
    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.shared.cache
    }

    /// Starts polling. Does nothing if the poller is already running.
    ///
    /// Rules are fetched once before this returns, so that sampling decisions
    /// made right after start up can already use them.
    pub fn start(&self) -> XraySamplerResult<()> {
        let mut stop = self.stop.lock()?;
        if stop.is_some() {
            return Ok(());
        }

        self.shared.refresh_rules();

        let (stop_sender, stop_receiver) = sync_channel(1);
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("XraySamplerPoller".to_string())
            .spawn(move || shared.run(stop_receiver))
            .map_err(|err| {
                otel_error!(name: "XraySamplerPoller.ThreadSpawnFailed", reason = err.to_string());
                XraySamplerError::Other(format!("failed to spawn poller thread: {err}"))
            })?;
        *stop = Some(stop_sender);

        otel_debug!(
            name: "XraySamplerPoller.Started",
            rule_interval_secs = self.shared.rule_interval.as_secs(),
            target_interval_secs = self.shared.target_interval.as_secs()
        );
        Ok(())
    }

    /// Stops polling.
    ///
    /// The background thread exits at its next wake-up. A refresh already in
    /// flight runs to completion.
    pub fn stop(&self) {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.try_send(());
            otel_debug!(name: "XraySamplerPoller.Stopped");
        }
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[cfg(test)]
    fn refresh_rules(&self) {
        self.shared.refresh_rules()
    }

    #[cfg(test)]
    fn refresh_targets(&self) {
        self.shared.refresh_targets()
    }
}

impl<C> Drop for Poller<C> {
    fn drop(&mut self) {
        let stop = self
            .stop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.try_send(());
        }
    }
}

impl<C> Shared<C>
where
    C: RuleSource + TargetSource,
{
    fn run(&self, stop: Receiver<()>) {
        let mut since_rule_refresh = Duration::ZERO;
        loop {
            match stop.recv_timeout(self.target_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                // stop requested or poller dropped
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            since_rule_refresh += self.target_interval;
            self.refresh_targets();
            if since_rule_refresh >= self.rule_interval {
                self.refresh_rules();
                since_rule_refresh = Duration::ZERO;
            }
        }
    }

    fn refresh_rules(&self) {
        let definitions = match block_on(self.source.fetch_rules()) {
            Ok(definitions) => definitions,
            Err(err) => {
                otel_warn!(name: "XraySamplerPoller.RuleRefreshFailed", reason = err.to_string());
                return;
            }
        };

        let rules: Vec<Rule> = definitions
            .into_iter()
            .filter(|definition| {
                let supported = definition.version == SUPPORTED_RULE_VERSION;
                if !supported {
                    otel_debug!(
                        name: "XraySamplerPoller.UnsupportedRuleVersion",
                        rule_name = definition.rule_name.as_str(),
                        version = definition.version
                    );
                }
                supported
            })
            .map(Rule::new)
            .collect();

        otel_debug!(name: "XraySamplerPoller.RulesRefreshed", rule_count = rules.len());
        self.cache.update_rules(rules);
    }

    fn refresh_targets(&self) {
        let reports = self.cache.matched_statistics();
        if reports.is_empty() {
            otel_debug!(name: "XraySamplerPoller.TargetRefreshSkipped");
            return;
        }

        let statistics: Vec<_> = reports.iter().map(|(_, report)| report.clone()).collect();
        match block_on(self.source.fetch_targets(&statistics)) {
            Ok(targets) => {
                otel_debug!(name: "XraySamplerPoller.TargetsRefreshed", target_count = targets.len());
                // counters are only dropped once reported, a failure keeps them
                for (rule, report) in &reports {
                    rule.discount_statistics(report);
                }
                self.cache.update_targets(&targets);
            }
            Err(err) => {
                otel_warn!(name: "XraySamplerPoller.TargetRefreshFailed", reason = err.to_string());
            }
        }
    }
}
