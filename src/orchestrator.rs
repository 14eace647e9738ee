//! Scan orchestration: the Idle → Scanning → Idle loop.
//!
//! Timer ticks, manual requests, and wake events all funnel into `scan()`,
//! which enforces single-flight with a busy flag — overlapping triggers are
//! dropped, not queued. The cursor is read once at scan start and written
//! once at scan end; a classifier failure aborts the scan without advancing
//! it, so the whole batch retries next cycle. Nothing in here may terminate
//! the process: every failure is logged, emitted, and survived.

use chrono::{Local, NaiveDateTime};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::classifier::{Classify, LlmClassifier};
use crate::config::WatcherConfig;
use crate::cursor::CursorStore;
use crate::dispatch::Dispatcher;
use crate::errors::StoreError;
use crate::message_store::MessageStore;
use crate::sinks::{
    AppleCalendar, AppleReminders, CalendarSink, NtfyPush, PushSink, TaskSink, UrlSchemeReminder,
};
use crate::transcript::build_transcript;

/// Most-recent actions kept for operator display.
const ACTION_HISTORY_LIMIT: usize = 50;

/// External triggers funneled into the scan entry point.
#[derive(Debug, Clone)]
pub enum ScanTrigger {
    Manual,
    /// Wake-from-sleep notification relayed by the platform layer.
    Wake,
    /// Reprocess the last N contact messages.
    Rewind(usize),
}

/// Plain events for the presentation layer. The core never touches a
/// display primitive; subscribers render these however they like.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started,
    Finished {
        new_messages: usize,
        items: usize,
        actions: usize,
    },
    ActionTaken {
        title: String,
    },
    /// The message store could not be opened; shown once per process so the
    /// user can grant Full Disk Access.
    PermissionHint(String),
    Error(String),
}

/// Result of one scan attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// A scan was already in flight; this trigger was dropped.
    Busy,
    /// No contact configured; nothing to do.
    NotConfigured,
    StoreUnavailable,
    NoNewMessages,
    /// Classifier call failed whole; batch retries next cycle.
    ClassifierFailed,
    /// Store query or cursor persistence failed mid-scan.
    Failed(String),
    Completed {
        new_messages: usize,
        items: usize,
        actions: usize,
    },
}

/// One entry in the rolling action history.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub id: Uuid,
    pub title: String,
    pub timestamp: NaiveDateTime,
}

pub struct Scanner {
    config: Arc<RwLock<WatcherConfig>>,
    cursor: RwLock<CursorStore>,
    classifier: RwLock<Arc<dyn Classify>>,
    dispatcher: RwLock<Dispatcher>,
    event_tx: flume::Sender<ScanEvent>,
    scanning: AtomicBool,
    history: Mutex<VecDeque<ActionRecord>>,
    unseen_actions: AtomicBool,
    permission_hinted: AtomicBool,
}

impl Scanner {
    /// Build a scanner with explicit parts. Production code goes through
    /// `from_config`; tests inject scripted classifiers and mock sinks here.
    pub fn new(
        config: WatcherConfig,
        classifier: Arc<dyn Classify>,
        dispatcher: Dispatcher,
        event_tx: flume::Sender<ScanEvent>,
    ) -> Self {
        let cursor = CursorStore::new(config.cursor_path.clone());
        Self {
            config: Arc::new(RwLock::new(config)),
            cursor: RwLock::new(cursor),
            classifier: RwLock::new(classifier),
            dispatcher: RwLock::new(dispatcher),
            event_tx,
            scanning: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            unseen_actions: AtomicBool::new(false),
            permission_hinted: AtomicBool::new(false),
        }
    }

    /// Build the production scanner from configuration.
    pub fn from_config(config: WatcherConfig, event_tx: flume::Sender<ScanEvent>) -> Self {
        let classifier = build_classifier(&config);
        let dispatcher = build_dispatcher(&config);
        Self::new(config, classifier, dispatcher, event_tx)
    }

    /// Swap in a new configuration and rebuild the components derived from
    /// it. Takes effect from the next scan.
    pub async fn reload_config(&self, new_config: WatcherConfig) {
        tracing::info!("Reloading watcher configuration...");
        *self.classifier.write().await = build_classifier(&new_config);
        *self.dispatcher.write().await = build_dispatcher(&new_config);
        *self.cursor.write().await = CursorStore::new(new_config.cursor_path.clone());
        *self.config.write().await = new_config;
        tracing::info!("Configuration reloaded");
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run one scan. Refused (no-op) while another scan is in flight or when
    /// no contact is configured.
    pub async fn scan(&self) -> ScanOutcome {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Scan already in flight, dropping trigger");
            return ScanOutcome::Busy;
        }

        let outcome = self.scan_inner().await;
        self.scanning.store(false, Ordering::SeqCst);

        if let ScanOutcome::Failed(reason) = &outcome {
            tracing::error!("Scan failed: {}", reason);
        }
        outcome
    }

    async fn scan_inner(&self) -> ScanOutcome {
        let config = self.config.read().await.clone();
        if config.contact.trim().is_empty() {
            tracing::debug!("No contact configured, skipping scan");
            return ScanOutcome::NotConfigured;
        }

        self.emit(ScanEvent::Started);

        let store = match MessageStore::open(&config.message_db_path) {
            Ok(store) => store,
            Err(StoreError::Unavailable(msg)) => {
                self.hint_permission(&msg);
                return ScanOutcome::StoreUnavailable;
            }
            Err(e) => {
                self.emit(ScanEvent::Error(e.to_string()));
                return ScanOutcome::Failed(e.to_string());
            }
        };

        let cursor_store = self.cursor.read().await;
        let cursor = match cursor_store.load() {
            Some(value) => value,
            None => match cursor_store.baseline(&store) {
                Ok(value) => value,
                Err(e) => {
                    self.emit(ScanEvent::Error(e.to_string()));
                    return ScanOutcome::Failed(e.to_string());
                }
            },
        };

        let fresh = match store.fetch_after(cursor, &config.contact, true) {
            Ok(rows) => rows,
            Err(e) => {
                self.emit(ScanEvent::Error(e.to_string()));
                return ScanOutcome::Failed(e.to_string());
            }
        };

        if fresh.is_empty() {
            self.emit(ScanEvent::Finished {
                new_messages: 0,
                items: 0,
                actions: 0,
            });
            return ScanOutcome::NoNewMessages;
        }

        tracing::info!("Scanning {} new message(s) after row {}", fresh.len(), cursor);

        // Context is best-effort: a failed fetch degrades prompt quality,
        // not correctness.
        let context = store
            .fetch_before(fresh[0].row_id, &config.contact, true, config.context_count)
            .unwrap_or_else(|e| {
                tracing::warn!("Context fetch failed: {}", e);
                Vec::new()
            });

        let transcript = build_transcript(&context, &fresh);
        let now = Local::now().naive_local();

        let items = match self.classifier.read().await.classify(&transcript, now).await {
            Ok(items) => items,
            Err(e) => {
                // Cursor untouched: the whole batch retries next cycle.
                tracing::warn!("Classification failed, batch will retry: {}", e);
                self.emit(ScanEvent::Error(e.to_string()));
                return ScanOutcome::ClassifierFailed;
            }
        };

        let results = self.dispatcher.read().await.dispatch_batch(&items, now).await;
        let mut actions = 0;
        for result in &results {
            if result.succeeded() {
                actions += 1;
                self.record_action(&result.title, now);
                self.emit(ScanEvent::ActionTaken {
                    title: result.title.clone(),
                });
            }
        }

        // Advance exactly once per non-empty scan, after every item in the
        // batch has been attempted. Individual dispatch failures do not hold
        // the batch back; messages are never retried item-by-item.
        let last_row = fresh.last().map(|m| m.row_id).unwrap_or(cursor);
        if let Err(e) = cursor_store.save(last_row) {
            self.emit(ScanEvent::Error(e.to_string()));
            return ScanOutcome::Failed(e.to_string());
        }

        let outcome = ScanOutcome::Completed {
            new_messages: fresh.len(),
            items: items.len(),
            actions,
        };
        self.emit(ScanEvent::Finished {
            new_messages: fresh.len(),
            items: items.len(),
            actions,
        });
        outcome
    }

    /// Manual "reprocess last N": rewinds the cursor to just before the
    /// oldest of the last N contact messages, then scans immediately. The
    /// one sanctioned backward cursor movement.
    pub async fn rewind(&self, count: usize) -> ScanOutcome {
        if self.scanning.load(Ordering::SeqCst) {
            tracing::debug!("Rewind requested mid-scan, dropping");
            return ScanOutcome::Busy;
        }

        let config = self.config.read().await.clone();
        if config.contact.trim().is_empty() {
            return ScanOutcome::NotConfigured;
        }

        let store = match MessageStore::open(&config.message_db_path) {
            Ok(store) => store,
            Err(StoreError::Unavailable(msg)) => {
                self.hint_permission(&msg);
                return ScanOutcome::StoreUnavailable;
            }
            Err(e) => return ScanOutcome::Failed(e.to_string()),
        };

        let recent = match store.fetch_before(i64::MAX, &config.contact, false, count) {
            Ok(rows) => rows,
            Err(e) => return ScanOutcome::Failed(e.to_string()),
        };
        let Some(oldest) = recent.iter().map(|m| m.row_id).min() else {
            tracing::info!("Nothing to reprocess");
            return ScanOutcome::NoNewMessages;
        };

        let rewound = oldest - 1;
        if let Err(e) = self.cursor.read().await.save(rewound) {
            return ScanOutcome::Failed(e.to_string());
        }
        tracing::info!("Cursor rewound to {} to reprocess last {}", rewound, count);

        self.scan().await
    }

    /// Long-running driver: periodic timer plus ad-hoc triggers, all feeding
    /// the same single-flight entry point. Returns only when every trigger
    /// sender is gone (process shutdown).
    pub async fn run_loop(self: Arc<Self>, triggers: flume::Receiver<ScanTrigger>) {
        tracing::info!("Scan loop starting...");
        loop {
            let poll_interval = {
                let config = self.config.read().await;
                config.poll_interval_secs
            };

            tokio::select! {
                _ = sleep(Duration::from_secs(poll_interval)) => {
                    let outcome = self.scan().await;
                    tracing::debug!("Timer scan: {:?}", outcome);
                }
                trigger = triggers.recv_async() => match trigger {
                    Ok(ScanTrigger::Manual) | Ok(ScanTrigger::Wake) => {
                        let outcome = self.scan().await;
                        tracing::debug!("Triggered scan: {:?}", outcome);
                    }
                    Ok(ScanTrigger::Rewind(count)) => {
                        let outcome = self.rewind(count).await;
                        tracing::debug!("Rewind: {:?}", outcome);
                    }
                    Err(_) => {
                        tracing::info!("Trigger channel closed, stopping scan loop");
                        break;
                    }
                },
            }
        }
    }

    fn hint_permission(&self, msg: &str) {
        tracing::warn!("Message store unavailable: {}", msg);
        if !self.permission_hinted.swap(true, Ordering::SeqCst) {
            self.emit(ScanEvent::PermissionHint(msg.to_string()));
        }
    }

    fn record_action(&self, title: &str, timestamp: NaiveDateTime) {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(ActionRecord {
            id: Uuid::new_v4(),
            title: title.to_string(),
            timestamp,
        });
        while history.len() > ACTION_HISTORY_LIMIT {
            history.pop_front();
        }
        self.unseen_actions.store(true, Ordering::SeqCst);
    }

    /// Most recent actions, oldest first.
    pub fn action_history(&self) -> Vec<ActionRecord> {
        match self.history.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn has_unseen_actions(&self) -> bool {
        self.unseen_actions.load(Ordering::SeqCst)
    }

    pub fn mark_actions_seen(&self) {
        self.unseen_actions.store(false, Ordering::SeqCst);
    }
}

fn build_classifier(config: &WatcherConfig) -> Arc<dyn Classify> {
    Arc::new(LlmClassifier::new(
        config.llm_api_url.clone(),
        config.llm_model.clone(),
        std::time::Duration::from_secs(config.llm_timeout_secs),
    ))
}

fn build_dispatcher(config: &WatcherConfig) -> Dispatcher {
    let calendar: Option<Arc<dyn CalendarSink>> = if config.enable_calendar {
        Some(Arc::new(AppleCalendar::new(config.calendar_name.clone())))
    } else {
        None
    };

    let mut task_sinks: Vec<Arc<dyn TaskSink>> = Vec::new();
    if config.enable_url_reminders {
        task_sinks.push(Arc::new(UrlSchemeReminder::new(
            config.reminder_url_scheme.clone(),
        )));
    }
    if config.enable_native_reminders {
        task_sinks.push(Arc::new(AppleReminders::new(config.reminders_list.clone())));
    }

    let push: Option<Arc<dyn PushSink>> = if config.enable_push && !config.ntfy_topic.trim().is_empty()
    {
        Some(Arc::new(NtfyPush::new(
            config.ntfy_server.clone(),
            config.ntfy_topic.clone(),
        )))
    } else {
        None
    };

    Dispatcher::new(calendar, task_sinks, push)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{parse_items, validate_items, ClassifiedItem, EventItem, TaskItem};
    use crate::errors::{ClassifyError, SinkError};
    use crate::sinks::ExistingEvent;
    use crate::transcript::BOUNDARY_MARKER;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rusqlite::{params, Connection};
    use std::path::PathBuf;

    const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("chatwatch_scan_{}_{}", name, Uuid::new_v4()));
        path
    }

    struct Fixture {
        db_path: PathBuf,
        cursor_path: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let db_path = temp_path(&format!("{}_db", name));
            let conn = Connection::open(&db_path).expect("create db");
            conn.execute_batch(
                "CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);
                 CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, guid TEXT);
                 CREATE TABLE message (
                     ROWID INTEGER PRIMARY KEY,
                     text TEXT,
                     date INTEGER,
                     is_from_me INTEGER DEFAULT 0,
                     item_type INTEGER DEFAULT 0,
                     associated_message_type INTEGER DEFAULT 0
                 );
                 CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
                 CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
                 INSERT INTO handle (ROWID, id) VALUES (1, '+15551234567');
                 INSERT INTO chat (ROWID, guid) VALUES (1, 'chat-main');
                 INSERT INTO chat_handle_join VALUES (1, 1);",
            )
            .expect("schema");
            Self {
                db_path,
                cursor_path: temp_path(&format!("{}_cursor", name)),
            }
        }

        fn insert(&self, row_id: i64, text: &str, from_me: bool) {
            let conn = Connection::open(&self.db_path).expect("open");
            conn.execute(
                "INSERT INTO message (ROWID, text, date, is_from_me) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row_id,
                    text,
                    (1_700_000_000 + row_id - APPLE_EPOCH_OFFSET) * 1_000_000_000,
                    from_me as i64
                ],
            )
            .expect("insert");
            conn.execute(
                "INSERT INTO chat_message_join VALUES (1, ?1)",
                params![row_id],
            )
            .expect("join");
        }

        fn config(&self) -> WatcherConfig {
            let mut config = WatcherConfig::default();
            config.contact = "+15551234567".to_string();
            config.message_db_path = self.db_path.to_string_lossy().into_owned();
            config.cursor_path = self.cursor_path.to_string_lossy().into_owned();
            config
        }

        fn cursor(&self) -> CursorStore {
            CursorStore::new(self.cursor_path.clone())
        }
    }

    /// Classifier scripted with canned responses; records the transcripts
    /// it was asked to classify.
    struct ScriptedClassifier {
        responses: Mutex<VecDeque<Result<Vec<ClassifiedItem>, ClassifyError>>>,
        transcripts: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedClassifier {
        fn new(responses: Vec<Result<Vec<ClassifiedItem>, ClassifyError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                transcripts: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn slow(responses: Vec<Result<Vec<ClassifiedItem>, ClassifyError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                transcripts: Mutex::new(Vec::new()),
                delay: Some(Duration::from_millis(300)),
            })
        }

        fn transcripts(&self) -> Vec<String> {
            self.transcripts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Classify for ScriptedClassifier {
        async fn classify(
            &self,
            transcript: &str,
            _now: NaiveDateTime,
        ) -> Result<Vec<ClassifiedItem>, ClassifyError> {
            self.transcripts.lock().unwrap().push(transcript.to_string());
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Classifier that runs the real parse + validate pipeline over a canned
    /// model response, with a fixed "now".
    struct ModelShapedClassifier {
        content: String,
        fixed_now: NaiveDateTime,
    }

    #[async_trait]
    impl Classify for ModelShapedClassifier {
        async fn classify(
            &self,
            _transcript: &str,
            _now: NaiveDateTime,
        ) -> Result<Vec<ClassifiedItem>, ClassifyError> {
            let raw = parse_items(&self.content)?;
            let (valid, _) = validate_items(raw, self.fixed_now);
            Ok(valid)
        }
    }

    struct CollectingCalendar {
        created: Mutex<Vec<EventItem>>,
    }

    impl CollectingCalendar {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CalendarSink for CollectingCalendar {
        async fn events_on_day(&self, _day: NaiveDate) -> Result<Vec<ExistingEvent>, SinkError> {
            Ok(Vec::new())
        }

        async fn create_event(&self, event: &EventItem) -> Result<(), SinkError> {
            self.created.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingTaskSink;

    #[async_trait]
    impl TaskSink for FailingTaskSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn create_task(&self, _title: &str, _due: NaiveDateTime) -> Result<(), SinkError> {
            Err(SinkError::WriteFailed("down".into()))
        }
    }

    struct CollectingTaskSink {
        created: Mutex<Vec<(String, NaiveDateTime)>>,
    }

    impl CollectingTaskSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskSink for CollectingTaskSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn create_task(&self, title: &str, due: NaiveDateTime) -> Result<(), SinkError> {
            self.created.lock().unwrap().push((title.to_string(), due));
            Ok(())
        }
    }

    fn no_sinks() -> Dispatcher {
        Dispatcher::new(None, vec![], None)
    }

    fn task(title: &str) -> ClassifiedItem {
        ClassifiedItem::Task(TaskItem {
            title: title.to_string(),
            due_minutes: 30,
        })
    }

    #[tokio::test]
    async fn classifier_failure_leaves_cursor_unchanged() {
        let fx = Fixture::new("classify_fail");
        fx.insert(101, "dinner friday at 7", false);
        fx.cursor().save(100).unwrap();

        let classifier = ScriptedClassifier::new(vec![Err(ClassifyError::Network(
            "connection refused".into(),
        ))]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier, no_sinks(), tx);

        assert_eq!(scanner.scan().await, ScanOutcome::ClassifierFailed);
        assert_eq!(fx.cursor().load(), Some(100));
    }

    #[tokio::test]
    async fn successful_scan_advances_cursor_despite_dispatch_failures() {
        let fx = Fixture::new("advance");
        fx.insert(101, "dinner friday", false);
        fx.insert(102, "and grab milk", false);
        fx.cursor().save(100).unwrap();

        let classifier = ScriptedClassifier::new(vec![Ok(vec![task("grab milk")])]);
        let dispatcher = Dispatcher::new(None, vec![Arc::new(FailingTaskSink)], None);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier, dispatcher, tx);

        let outcome = scanner.scan().await;
        assert_eq!(
            outcome,
            ScanOutcome::Completed {
                new_messages: 2,
                items: 1,
                actions: 0,
            }
        );
        assert_eq!(fx.cursor().load(), Some(102));
    }

    #[tokio::test]
    async fn empty_scan_changes_nothing_and_skips_classification() {
        let fx = Fixture::new("empty");
        fx.insert(50, "old news", false);
        fx.cursor().save(50).unwrap();

        let classifier = ScriptedClassifier::new(vec![]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier.clone(), no_sinks(), tx);

        assert_eq!(scanner.scan().await, ScanOutcome::NoNewMessages);
        assert_eq!(fx.cursor().load(), Some(50));
        assert!(classifier.transcripts().is_empty());
    }

    #[tokio::test]
    async fn first_run_baselines_without_replaying_history() {
        let fx = Fixture::new("baseline");
        fx.insert(1, "ancient plan: dinner monday", false);
        fx.insert(2, "another old one", false);

        let classifier = ScriptedClassifier::new(vec![]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier.clone(), no_sinks(), tx);

        assert_eq!(scanner.scan().await, ScanOutcome::NoNewMessages);
        assert_eq!(fx.cursor().load(), Some(2));
        assert!(classifier.transcripts().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_contact_refuses_to_scan() {
        let fx = Fixture::new("no_contact");
        let mut config = fx.config();
        config.contact = String::new();

        let (tx, rx) = flume::unbounded();
        let scanner = Scanner::new(config, ScriptedClassifier::new(vec![]), no_sinks(), tx);
        assert_eq!(scanner.scan().await, ScanOutcome::NotConfigured);
        assert!(rx.try_iter().next().is_none());
    }

    #[tokio::test]
    async fn missing_store_hints_permission_once() {
        let fx = Fixture::new("no_store");
        let mut config = fx.config();
        config.message_db_path = temp_path("nonexistent_db").to_string_lossy().into_owned();

        let (tx, rx) = flume::unbounded();
        let scanner = Scanner::new(config, ScriptedClassifier::new(vec![]), no_sinks(), tx);

        assert_eq!(scanner.scan().await, ScanOutcome::StoreUnavailable);
        assert_eq!(scanner.scan().await, ScanOutcome::StoreUnavailable);

        let hints = rx
            .try_iter()
            .filter(|e| matches!(e, ScanEvent::PermissionHint(_)))
            .count();
        assert_eq!(hints, 1);
    }

    #[tokio::test]
    async fn rewind_sets_cursor_to_min_minus_one() {
        let fx = Fixture::new("rewind");
        // Last five contact messages: 96-99 and 101 (100 is from me).
        for id in [96, 97, 98, 99] {
            fx.insert(id, &format!("them {}", id), false);
        }
        fx.insert(100, "me in between", true);
        fx.insert(101, "them 101", false);
        fx.cursor().save(101).unwrap();

        // Classifier failure keeps the rewound cursor observable.
        let classifier =
            ScriptedClassifier::new(vec![Err(ClassifyError::Network("down".into()))]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier, no_sinks(), tx);

        assert_eq!(scanner.rewind(5).await, ScanOutcome::ClassifierFailed);
        assert_eq!(fx.cursor().load(), Some(95));
    }

    #[tokio::test]
    async fn rewind_reprocesses_the_window() {
        let fx = Fixture::new("rewind_scan");
        for id in [96, 97, 98, 99] {
            fx.insert(id, &format!("them {}", id), false);
        }
        fx.insert(100, "me in between", true);
        fx.insert(101, "them 101", false);
        fx.cursor().save(101).unwrap();

        let classifier = ScriptedClassifier::new(vec![Ok(vec![])]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier.clone(), no_sinks(), tx);

        assert_eq!(
            scanner.rewind(5).await,
            ScanOutcome::Completed {
                new_messages: 6,
                items: 0,
                actions: 0,
            }
        );
        assert_eq!(fx.cursor().load(), Some(101));

        // All six rows, own message included, sit after the boundary.
        let transcripts = classifier.transcripts();
        let after_boundary = transcripts[0]
            .split(BOUNDARY_MARKER)
            .nth(1)
            .unwrap()
            .to_string();
        for id in [96, 97, 98, 99, 101] {
            assert!(after_boundary.contains(&format!("them {}", id)));
        }
        assert!(after_boundary.contains("[me] me in between"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_scan_is_dropped() {
        let fx = Fixture::new("single_flight");
        fx.insert(101, "dinner friday", false);
        fx.cursor().save(100).unwrap();

        let classifier = ScriptedClassifier::slow(vec![Ok(vec![])]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Arc::new(Scanner::new(fx.config(), classifier, no_sinks(), tx));

        let first = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan().await })
        };
        sleep(Duration::from_millis(100)).await;
        assert_eq!(scanner.scan().await, ScanOutcome::Busy);
        assert!(matches!(
            first.await.unwrap(),
            ScanOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn dinner_message_becomes_friday_event() {
        let fx = Fixture::new("e2e_event");
        fx.insert(10, "how was your day", false);
        fx.cursor().save(10).unwrap();
        fx.insert(11, "dinner at 7 friday", false);

        // Fixed "now": Monday 2026-08-24. The model resolves "friday" to the
        // upcoming one; validation fills in the one-hour end.
        let fixed_now = NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let classifier = Arc::new(ModelShapedClassifier {
            content: r#"{"items":[{"type":"event","title":"dinner","start":"2026-08-28T19:00:00","all_day":false}]}"#
                .to_string(),
            fixed_now,
        });

        let calendar = CollectingCalendar::new();
        let dispatcher = Dispatcher::new(Some(calendar.clone()), vec![], None);
        let (tx, rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier, dispatcher, tx);

        let outcome = scanner.scan().await;
        assert_eq!(
            outcome,
            ScanOutcome::Completed {
                new_messages: 1,
                items: 1,
                actions: 1,
            }
        );

        let created = calendar.created.lock().unwrap();
        let friday_7pm = NaiveDate::from_ymd_opt(2026, 8, 28)
            .unwrap()
            .and_hms_opt(19, 0, 0)
            .unwrap();
        assert_eq!(created[0].start, friday_7pm);
        assert_eq!(created[0].end, friday_7pm + chrono::Duration::hours(1));
        assert!(!created[0].all_day);
        drop(created);

        assert!(rx
            .try_iter()
            .any(|e| matches!(e, ScanEvent::ActionTaken { ref title } if title == "dinner")));
        assert_eq!(scanner.action_history().len(), 1);
        assert!(scanner.has_unseen_actions());
        scanner.mark_actions_seen();
        assert!(!scanner.has_unseen_actions());
    }

    #[tokio::test]
    async fn milk_request_becomes_default_task() {
        let fx = Fixture::new("e2e_task");
        fx.cursor().save(10).unwrap();
        fx.insert(11, "can you grab milk", false);

        let fixed_now = NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let classifier = Arc::new(ModelShapedClassifier {
            content: r#"{"items":[{"type":"task","title":"grab milk"}]}"#.to_string(),
            fixed_now,
        });

        let tasks = CollectingTaskSink::new();
        let calendar = CollectingCalendar::new();
        let dispatcher = Dispatcher::new(Some(calendar.clone()), vec![tasks.clone()], None);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier, dispatcher, tx);

        let outcome = scanner.scan().await;
        assert_eq!(
            outcome,
            ScanOutcome::Completed {
                new_messages: 1,
                items: 1,
                actions: 1,
            }
        );

        // Task only: no event was produced for a question-phrased request.
        assert!(calendar.created.lock().unwrap().is_empty());
        let created = tasks.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].0.contains("milk"));
        // Default 30-minute offset from the scan's "now".
        let offset = created[0].1 - Local::now().naive_local();
        assert!(offset <= chrono::Duration::minutes(30));
        assert!(offset > chrono::Duration::minutes(28));
    }

    #[tokio::test]
    async fn context_stays_before_the_boundary() {
        let fx = Fixture::new("boundary");
        fx.insert(9, "lunch tomorrow at noon?", false);
        fx.insert(10, "maybe!", true);
        fx.cursor().save(10).unwrap();
        fx.insert(11, "ok see you", false);

        let classifier = ScriptedClassifier::new(vec![Ok(vec![])]);
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), classifier.clone(), no_sinks(), tx);
        scanner.scan().await;

        let transcripts = classifier.transcripts();
        let (before, after) = transcripts[0].split_once(BOUNDARY_MARKER).unwrap();
        assert!(before.contains("lunch tomorrow at noon?"));
        assert!(before.contains("[me] maybe!"));
        assert!(!after.contains("lunch tomorrow"));
        assert!(after.contains("[them] ok see you"));
    }

    #[tokio::test]
    async fn action_history_is_bounded() {
        let fx = Fixture::new("history");
        let (tx, _rx) = flume::unbounded();
        let scanner = Scanner::new(fx.config(), ScriptedClassifier::new(vec![]), no_sinks(), tx);

        let now = Local::now().naive_local();
        for i in 0..60 {
            scanner.record_action(&format!("action {}", i), now);
        }
        let history = scanner.action_history();
        assert_eq!(history.len(), ACTION_HISTORY_LIMIT);
        assert_eq!(history[0].title, "action 10");
        assert_eq!(history.last().unwrap().title, "action 59");
    }
}
