pub mod rule;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{error, info};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::automation::rule::{AutomationRule, RuleAction, RuleBook};
use crate::control_interface::{ControlInterface, DeviceTarget};

/// How often the scheduler looks at the clock.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies one firing of one rule: its position, the day, and the minute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiredKey {
    pub rule_index: usize,
    pub date: NaiveDate,
    pub minute: String,
}

/// The set of firings already attempted.
///
/// Keys from earlier days can never match again, so they are pruned as the
/// date advances and the set holds at most one day of firings.
#[derive(Debug, Default)]
pub struct FiredLog {
    keys: HashSet<FiredKey>,
}

impl FiredLog {
    pub fn contains(&self, key: &FiredKey) -> bool {
        self.keys.contains(key)
    }

    /// Returns false if `key` was already recorded.
    pub fn record(&mut self, key: FiredKey) -> bool {
        self.keys.insert(key)
    }

    pub fn prune_before(&mut self, date: NaiveDate) {
        self.keys.retain(|key| key.date >= date);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/**
Evaluates rules against a point in time and dispatches the ones that are due.

Separated from [`Scheduler`] so a tick can be driven with any timestamp.
 */
#[derive(Debug, Clone)]
pub struct AutomationEngine {
    client: ControlInterface,
    rules: RuleBook,
    fired: Arc<Mutex<FiredLog>>,
}

impl AutomationEngine {
    pub fn new(client: ControlInterface, rules: RuleBook) -> Self {
        Self::with_fired_log(client, rules, Arc::new(Mutex::new(FiredLog::default())))
    }

    fn with_fired_log(client: ControlInterface, rules: RuleBook, fired: Arc<Mutex<FiredLog>>) -> Self {
        AutomationEngine {
            client,
            rules,
            fired,
        }
    }

    fn fired(&self) -> MutexGuard<'_, FiredLog> {
        self.fired.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fired_count(&self) -> usize {
        self.fired().len()
    }

    /**
    Runs one poll tick at `now` and returns the indices of the rules that
    were dispatched, in rule order.

    A due rule is recorded as fired before it is attempted, so it counts as
    fired whether the device answered, the send degraded to no reply, or the
    rule itself was invalid. A failing rule is logged and the remaining rules still run.
     */
    pub async fn tick(&self, now: NaiveDateTime) -> Vec<usize> {
        let minute = now.format("%H:%M").to_string();
        let date = now.date();
        self.fired().prune_before(date);

        let rules = self.rules.snapshot();
        let mut dispatched = Vec::new();
        for (rule_index, rule) in rules.iter().enumerate() {
            if rule.time != minute {
                continue;
            }
            let key = FiredKey {
                rule_index,
                date,
                minute: minute.clone(),
            };
            // Claimed before the send, so a second worker sharing this log
            // skips the rule even while this dispatch is still in flight.
            if !self.fired().record(key) {
                continue;
            }

            match self.dispatch(rule).await {
                Ok(action) => info!("Rule #{} ({}): {}", rule_index + 1, minute, action),
                Err(e) => error!("Rule #{} ({}) failed: {:#}", rule_index + 1, minute, e),
            }
            dispatched.push(rule_index);
        }
        dispatched
    }

    async fn dispatch(&self, rule: &AutomationRule) -> anyhow::Result<RuleAction> {
        let action = rule.to_action()?;
        match action {
            RuleAction::PowerOn => self.client.turn_on().await,
            RuleAction::PowerOff => self.client.turn_off().await,
            RuleAction::Brightness(value) => self.client.set_brightness(value).await,
            RuleAction::Rgb(r, g, b) => self.client.set_rgb(r, g, b).await,
        };
        Ok(action)
    }

    async fn run(self, running: Arc<AtomicBool>, poll_interval: Duration) {
        info!(
            "Automation started for {} at {}",
            self.client.target().snapshot(),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        while running.load(Ordering::SeqCst) {
            self.tick(Local::now().naive_local()).await;
            sleep(poll_interval).await;
        }
        info!("Automation stopped");
    }
}

/// Result of [`Scheduler::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/**
Runs an [`AutomationEngine`] on a background task.

The scheduler is either idle or running. Stopping is cooperative: the worker
notices the cleared flag after its current sleep, so it exits within one poll
interval. Firing history survives a stop and restart.
 */
pub struct Scheduler {
    client: ControlInterface,
    fired: Arc<Mutex<FiredLog>>,
    poll_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    pub fn new(client: ControlInterface) -> Self {
        Scheduler {
            client,
            fired: Arc::new(Mutex::new(FiredLog::default())),
            poll_interval: POLL_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Points the client at `target` and starts polling `rules`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, target: DeviceTarget, rules: RuleBook) -> StartStatus {
        let mut worker = self.worker();
        if worker
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::SeqCst))
        {
            return StartStatus::AlreadyRunning;
        }

        self.client.target().replace(target);
        let running = Arc::new(AtomicBool::new(true));
        let engine =
            AutomationEngine::with_fired_log(self.client.clone(), rules, self.fired.clone());
        let handle = tokio::spawn(engine.run(running.clone(), self.poll_interval));
        *worker = Some(Worker { running, handle });
        StartStatus::Started
    }

    /// Asks the worker to stop. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        match self.worker().as_ref() {
            Some(w) => w.running.swap(false, Ordering::SeqCst),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::SeqCst))
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(&self) {
        let worker = self.worker().take();
        if let Some(worker) = worker {
            worker.running.store(false, Ordering::SeqCst);
            if let Err(e) = worker.handle.await {
                error!("Automation worker ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_interface::SharedTarget;
    use crate::util::packet_monitor::PacketMonitor;
    use crate::util::traits::DatagramTransport;
    use async_trait::async_trait;
    use chrono::{NaiveTime, Timelike};
    use serde_json::Value;
    use std::io;

    /// Accepts every datagram, after `delay`, and remembers the decoded payloads.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Value>>,
        delay: Duration,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DatagramTransport for RecordingTransport {
        async fn exchange(
            &self,
            _host: &str,
            _port: u16,
            payload: &[u8],
            _expect_reply: bool,
            _timeout: Duration,
        ) -> io::Result<Option<Vec<u8>>> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_slice(payload).unwrap());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            Ok(None)
        }
    }

    fn engine(rules: Vec<AutomationRule>) -> (AutomationEngine, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let client = ControlInterface::with_transport(
            SharedTarget::new(DeviceTarget::new("10.0.0.5")),
            transport.clone(),
            Arc::new(PacketMonitor::default()),
        );
        (AutomationEngine::new(client, RuleBook::new(rules)), transport)
    }

    fn client_for(transport: Arc<RecordingTransport>) -> ControlInterface {
        ControlInterface::with_transport(
            SharedTarget::new(DeviceTarget::new("10.0.0.5")),
            transport,
            Arc::new(PacketMonitor::default()),
        )
    }

    /// The current local `HH:MM`, waiting for the next minute when fewer
    /// than three seconds of this one are left.
    async fn current_minute() -> String {
        let now = Local::now();
        if now.second() >= 57 {
            sleep(Duration::from_secs(61 - u64::from(now.second()))).await;
        }
        Local::now().format("%H:%M").to_string()
    }

    fn at(date: (i32, u32, u32), h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, m, s).unwrap())
    }

    #[tokio::test]
    async fn test_rule_fires_once_per_minute_and_again_next_day() {
        let (engine, transport) =
            engine(vec![AutomationRule::new("18:00", RuleAction::PowerOn).unwrap()]);

        let mut fired = 0;
        for second in 0..60 {
            fired += engine.tick(at((2026, 3, 14), 18, 0, second)).await.len();
        }
        assert_eq!(fired, 1);
        assert_eq!(transport.sent().len(), 1);

        assert!(engine.tick(at((2026, 3, 14), 18, 1, 0)).await.is_empty());

        let mut next_day = 0;
        for second in 0..60 {
            next_day += engine.tick(at((2026, 3, 15), 18, 0, second)).await.len();
        }
        assert_eq!(next_day, 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_due_rules_dispatch_in_order() {
        let (engine, transport) = engine(vec![
            AutomationRule::new("07:30", RuleAction::Brightness(150)).unwrap(),
            AutomationRule::new("08:00", RuleAction::PowerOff).unwrap(),
            AutomationRule::new("07:30", RuleAction::Rgb(10, 20, 30)).unwrap(),
        ]);

        let dispatched = engine.tick(at((2026, 1, 1), 7, 30, 12)).await;

        assert_eq!(dispatched, vec![0, 2]);
        let sent = transport.sent();
        assert_eq!(sent[0]["msg"]["cmd"], "brightness");
        assert_eq!(sent[0]["msg"]["data"]["value"], 100);
        assert_eq!(sent[1]["msg"]["cmd"], "colorwc");
        assert_eq!(sent[1]["msg"]["data"]["color"]["g"], 20);
    }

    #[tokio::test]
    async fn test_invalid_rule_does_not_block_others() {
        let broken = AutomationRule {
            time: "12:00".to_string(),
            action: "brightness".to_string(),
            ..AutomationRule::default()
        };
        let (engine, transport) = engine(vec![
            broken,
            AutomationRule::new("12:00", RuleAction::PowerOn).unwrap(),
        ]);

        let dispatched = engine.tick(at((2026, 1, 1), 12, 0, 0)).await;
        assert_eq!(dispatched, vec![0, 1]);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0]["msg"]["cmd"], "turn");

        // Both firings are recorded, so nothing is retried within the minute.
        assert!(engine.tick(at((2026, 1, 1), 12, 0, 1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_old_firings_are_pruned() {
        let (engine, _transport) = engine(vec![
            AutomationRule::new("06:00", RuleAction::PowerOn).unwrap(),
            AutomationRule::new("06:01", RuleAction::PowerOff).unwrap(),
        ]);

        engine.tick(at((2026, 5, 1), 6, 0, 0)).await;
        engine.tick(at((2026, 5, 1), 6, 1, 0)).await;
        assert_eq!(engine.fired_count(), 2);

        engine.tick(at((2026, 5, 2), 0, 0, 0)).await;
        assert_eq!(engine.fired_count(), 0);
    }

    #[tokio::test]
    async fn test_rule_position_is_part_of_identity() {
        let rules = RuleBook::new(vec![AutomationRule::new("09:00", RuleAction::PowerOn).unwrap()]);
        let transport = Arc::new(RecordingTransport::default());
        let client = ControlInterface::with_transport(
            SharedTarget::new(DeviceTarget::new("10.0.0.5")),
            transport.clone(),
            Arc::new(PacketMonitor::default()),
        );
        let engine = AutomationEngine::new(client, rules.clone());

        engine.tick(at((2026, 5, 1), 9, 0, 0)).await;
        rules.push(AutomationRule::new("09:00", RuleAction::PowerOff).unwrap());
        let dispatched = engine.tick(at((2026, 5, 1), 9, 0, 5)).await;

        assert_eq!(dispatched, vec![1]);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_scheduler_state_machine() {
        let transport = Arc::new(RecordingTransport::default());
        let client = ControlInterface::with_transport(
            SharedTarget::new(DeviceTarget::new("10.0.0.5")),
            transport,
            Arc::new(PacketMonitor::default()),
        );
        let scheduler = Scheduler::new(client.clone()).with_poll_interval(Duration::from_millis(10));

        assert!(!scheduler.is_running());
        assert!(!scheduler.stop());

        let target = DeviceTarget::new("10.0.0.9");
        assert_eq!(
            scheduler.start(target.clone(), RuleBook::default()),
            StartStatus::Started
        );
        assert!(scheduler.is_running());
        assert_eq!(client.target().snapshot(), target);
        assert_eq!(
            scheduler.start(target.clone(), RuleBook::default()),
            StartStatus::AlreadyRunning
        );

        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        assert_eq!(
            scheduler.start(target, RuleBook::default()),
            StartStatus::Started
        );

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_ticks_dispatch_once() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_millis(100),
            ..RecordingTransport::default()
        });
        let fired = Arc::new(Mutex::new(FiredLog::default()));
        let rules = RuleBook::new(vec![AutomationRule::new("21:15", RuleAction::PowerOff).unwrap()]);
        let first =
            AutomationEngine::with_fired_log(client_for(transport.clone()), rules.clone(), fired.clone());
        let second = AutomationEngine::with_fired_log(client_for(transport.clone()), rules, fired);

        let now = at((2026, 6, 1), 21, 15, 0);
        let (a, b) = tokio::join!(first.tick(now), second.tick(now));

        assert_eq!(a.len() + b.len(), 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_running_scheduler_fires_due_rule_once() {
        let transport = Arc::new(RecordingTransport::default());
        let scheduler =
            Scheduler::new(client_for(transport.clone())).with_poll_interval(Duration::from_millis(10));
        let minute = current_minute().await;
        let rules = RuleBook::new(vec![AutomationRule::new(&minute, RuleAction::Brightness(30)).unwrap()]);

        scheduler.start(DeviceTarget::new("10.0.0.5"), rules);
        sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["msg"]["cmd"], "brightness");
        assert_eq!(sent[0]["msg"]["data"]["value"], 30);
    }

    #[tokio::test]
    async fn test_restart_during_slow_dispatch_fires_once() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_millis(300),
            ..RecordingTransport::default()
        });
        let scheduler =
            Scheduler::new(client_for(transport.clone())).with_poll_interval(Duration::from_millis(10));
        let minute = current_minute().await;
        let rules = RuleBook::new(vec![AutomationRule::new(&minute, RuleAction::PowerOn).unwrap()]);
        let target = DeviceTarget::new("10.0.0.5");

        assert_eq!(scheduler.start(target.clone(), rules.clone()), StartStatus::Started);
        sleep(Duration::from_millis(50)).await;
        assert!(scheduler.stop());
        assert_eq!(scheduler.start(target, rules), StartStatus::Started);
        sleep(Duration::from_millis(800)).await;
        scheduler.shutdown().await;

        assert_eq!(transport.sent().len(), 1);
    }
}
