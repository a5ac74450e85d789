//! Scripted fakes for engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    domain::{
        AccountName, ChatId, ContentKind, MessageId, MessageRecord, MessageRef, Source, WatchRef,
    },
    errors::Error,
    messaging::{
        port::{EventSubscription, SessionConnector, SessionHandle},
        types::{OutgoingMessage, RawEvent, RawPayload, Sender},
    },
    registry::Account,
    Result,
};

pub(crate) enum FeedItem {
    Event(RawEvent),
    Fail(Error),
    Close,
}

pub(crate) type SentLog = Arc<Mutex<Vec<(ChatId, OutgoingMessage)>>>;

/// In-memory session. Clones share all state, so a test can keep one clone
/// for scripting while the engine owns another.
#[derive(Clone)]
pub(crate) struct FakeSession {
    account: AccountName,
    sources: Arc<Mutex<HashMap<String, Source>>>,
    resolve_calls: Arc<AtomicUsize>,
    connect_script: Arc<Mutex<VecDeque<Result<()>>>>,
    connect_calls: Arc<AtomicUsize>,
    subscribe_calls: Arc<AtomicUsize>,
    disconnect_calls: Arc<AtomicUsize>,
    feed_tx: mpsc::UnboundedSender<FeedItem>,
    feed_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FeedItem>>>,
    send_script: Arc<Mutex<VecDeque<Result<()>>>>,
    send_delay: Arc<Mutex<Duration>>,
    sent: SentLog,
    next_id: Arc<AtomicI32>,
}

impl FakeSession {
    pub(crate) fn new(account: &str) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            account: AccountName::new(account),
            sources: Arc::default(),
            resolve_calls: Arc::default(),
            connect_script: Arc::default(),
            connect_calls: Arc::default(),
            subscribe_calls: Arc::default(),
            disconnect_calls: Arc::default(),
            feed_tx,
            feed_rx: Arc::new(tokio::sync::Mutex::new(feed_rx)),
            send_script: Arc::default(),
            send_delay: Arc::default(),
            sent: Arc::default(),
            next_id: Arc::new(AtomicI32::new(1)),
        }
    }

    /// `key` is the handle without `@`, or the numeric id as text.
    pub(crate) fn add_source(&self, key: &str, chat_id: ChatId, handle: Option<&str>, title: &str) {
        self.sources.lock().unwrap().insert(
            key.to_string(),
            Source {
                chat_id,
                handle: handle.map(str::to_string),
                title: title.to_string(),
            },
        );
    }

    pub(crate) fn resolve_calls(&self) -> Arc<AtomicUsize> {
        self.resolve_calls.clone()
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Queue an outcome for the next `connect` call; unscripted calls succeed.
    pub(crate) fn script_connect(&self, outcome: Result<()>) {
        self.connect_script.lock().unwrap().push_back(outcome);
    }

    /// Queue an outcome for the next `send` call; unscripted calls succeed.
    pub(crate) fn script_send(&self, outcome: Result<()>) {
        self.send_script.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub(crate) fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.text.clone())
            .collect()
    }

    pub(crate) fn push_event(&self, event: RawEvent) {
        let _ = self.feed_tx.send(FeedItem::Event(event));
    }

    pub(crate) fn push_text(&self, chat: i64, seq: i32, text: &str) {
        self.push_event(text_event(chat, seq, text));
    }

    pub(crate) fn fail_stream(&self, err: Error) {
        let _ = self.feed_tx.send(FeedItem::Fail(err));
    }

    pub(crate) fn close_stream(&self) {
        let _ = self.feed_tx.send(FeedItem::Close);
    }
}

fn reference_key(reference: &WatchRef) -> String {
    match reference {
        WatchRef::Id(id) => id.to_string(),
        WatchRef::Handle(h) => h.clone(),
    }
}

#[async_trait]
impl SessionHandle for FakeSession {
    fn account(&self) -> &AccountName {
        &self.account
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.connect_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn resolve(&self, reference: &WatchRef) -> Result<Source> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.sources
            .lock()
            .unwrap()
            .get(&reference_key(reference))
            .cloned()
            .ok_or_else(|| Error::Resolution {
                reference: reference.to_string(),
                reason: "chat not found".into(),
            })
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSubscription {
            feed: self.feed_rx.clone(),
        }))
    }

    async fn send(&self, to: ChatId, message: &OutgoingMessage) -> Result<MessageRef> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.send_script.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }
        self.sent.lock().unwrap().push((to, message.clone()));
        Ok(MessageRef {
            chat_id: to,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
        })
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSubscription {
    feed: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FeedItem>>>,
}

#[async_trait]
impl EventSubscription for FakeSubscription {
    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        let mut feed = self.feed.lock().await;
        match feed.recv().await {
            Some(FeedItem::Event(ev)) => Ok(Some(ev)),
            Some(FeedItem::Fail(e)) => Err(e),
            Some(FeedItem::Close) | None => Ok(None),
        }
    }
}

/// Hands out pre-registered [`FakeSession`]s by account name.
#[derive(Default)]
pub(crate) struct FakeConnector {
    sessions: Mutex<HashMap<AccountName, FakeSession>>,
    open_failures: Mutex<HashMap<AccountName, VecDeque<Error>>>,
    open_calls: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, session: FakeSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.account.clone(), session);
    }

    pub(crate) fn fail_open(&self, account: &str, err: Error) {
        self.open_failures
            .lock()
            .unwrap()
            .entry(AccountName::new(account))
            .or_default()
            .push_back(err);
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(&self, account: &Account) -> Result<Box<dyn SessionHandle>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .open_failures
            .lock()
            .unwrap()
            .get_mut(&account.name)
            .and_then(VecDeque::pop_front);
        if let Some(e) = scripted {
            return Err(e);
        }
        let session = self.sessions.lock().unwrap().get(&account.name).cloned();
        match session {
            Some(s) => Ok(Box::new(s)),
            None => Err(Error::AuthExpired(format!("no session for '{}'", account.name))),
        }
    }
}

pub(crate) fn text_event(chat: i64, seq: i32, text: &str) -> RawEvent {
    RawEvent {
        chat_id: ChatId(chat),
        message_id: MessageId(seq),
        sender: Some(Sender::User {
            first_name: "Tester".into(),
            last_name: None,
            username: None,
        }),
        payload: RawPayload::Text(text.to_string()),
    }
}

/// A text record from a public source named after the account.
pub(crate) fn record_for(account: &str, seq: i32) -> MessageRecord {
    MessageRecord {
        account: AccountName::new(account),
        source: Arc::new(Source {
            chat_id: ChatId(-100),
            handle: Some(format!("{account}_news")),
            title: "News".into(),
        }),
        sender_name: "Tester".into(),
        kind: ContentKind::Text,
        text: Some(format!("msg {seq}")),
        media: None,
        seq: MessageId(seq),
        arrived_at: Utc::now(),
    }
}
