//! Event subscriptions: at most one callback per category per session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use haggle_core::{Command, DataObject, EventCategory, Interest};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::session::SessionHandle;

/// An event as handed to a callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DaemonShutdown,
    NeighborUpdate(DataObject),
    NewDataObject(DataObject),
    /// The session's full interest set, possibly empty.
    InterestList(Vec<Interest>),
}

impl Event {
    pub fn category(&self) -> EventCategory {
        match self {
            Event::DaemonShutdown => EventCategory::DaemonShutdown,
            Event::NeighborUpdate(_) => EventCategory::NeighborUpdate,
            Event::NewDataObject(_) => EventCategory::NewDataObject,
            Event::InterestList(_) => EventCategory::InterestList,
        }
    }

    /// Build the callback argument. Data-object events without a usable payload yield `None`.
    pub(crate) fn from_wire(category: EventCategory, payload: Option<DataObject>) -> Option<Event> {
        match category {
            EventCategory::DaemonShutdown => Some(Event::DaemonShutdown),
            EventCategory::NeighborUpdate => payload
                .filter(|d| !d.is_empty())
                .map(Event::NeighborUpdate),
            EventCategory::NewDataObject => payload
                .filter(|d| !d.is_empty())
                .map(Event::NewDataObject),
            EventCategory::InterestList => Some(Event::InterestList(
                payload.map(|d| d.interests()).unwrap_or_default(),
            )),
        }
    }

    /// The data object carried, if any.
    pub fn data_object(&self) -> Option<&DataObject> {
        match self {
            Event::NeighborUpdate(d) | Event::NewDataObject(d) => Some(d),
            _ => None,
        }
    }
}

pub type Callback = Box<dyn FnMut(Event) + Send + 'static>;

struct Entry {
    id: u64,
    callback: Arc<Mutex<Callback>>,
}

/// Per-session callback table. Callbacks run outside the table lock, so a callback may
/// subscribe, cancel or close the session.
pub(crate) struct SubscriptionTable {
    entries: Mutex<HashMap<EventCategory, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, category: EventCategory, callback: Callback) -> Result<u64> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&category) {
            return Err(Error::AlreadySubscribed(category));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            category,
            Entry {
                id,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Ok(id)
    }

    pub fn remove(&self, category: EventCategory, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&category) {
            Some(e) if e.id == id => {
                entries.remove(&category);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, category: EventCategory, id: u64) -> bool {
        self.entries
            .lock()
            .get(&category)
            .map_or(false, |e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Deliver one wire event to its callback, if any.
    pub fn dispatch(&self, code: u8, payload: Option<DataObject>) {
        let category = match EventCategory::try_from(code) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "dropping event");
                return;
            }
        };
        let callback = match self.entries.lock().get(&category) {
            Some(e) => e.callback.clone(),
            None => {
                trace!(%category, "no subscription, event dropped");
                return;
            }
        };
        let Some(event) = Event::from_wire(category, payload) else {
            debug!(%category, "event without data object skipped");
            return;
        };
        let mut cb = callback.lock();
        (*cb)(event);
    }
}

/// A registered callback. Dropping it leaves the callback registered; `cancel` removes it.
#[derive(Debug)]
pub struct Subscription {
    category: EventCategory,
    id: u64,
    session: SessionHandle,
    table: Weak<SubscriptionTable>,
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Callback registered and its session open.
    pub fn is_active(&self) -> bool {
        self.session.is_open()
            && self
                .table
                .upgrade()
                .map_or(false, |t| t.contains(self.category, self.id))
    }

    /// Stop invoking the callback. Later events of this category are dropped locally.
    pub fn cancel(self) {
        if let Some(t) = self.table.upgrade() {
            if t.remove(self.category, self.id) {
                debug!(category = %self.category, "subscription cancelled");
            }
        }
    }
}

impl SessionHandle {
    /// Register `callback` for `category` and ask the daemon to route those events here.
    pub fn subscribe<F>(&self, category: EventCategory, callback: F) -> Result<Subscription>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let shared = self.shared()?;
        let table = shared.subscriptions.clone();
        let id = table.insert(category, Box::new(callback))?;
        if let Err(e) = shared.conn.call(Command::SubscribeEvent {
            category: category.code(),
        }) {
            table.remove(category, id);
            return Err(e);
        }
        debug!(session = %self.name(), %category, "subscribed");
        Ok(Subscription {
            category,
            id,
            session: self.clone(),
            table: Arc::downgrade(&table),
        })
    }

    /// `subscribe` with a raw category code; out-of-range codes fail before contacting the daemon.
    pub fn subscribe_code<F>(&self, code: i32, callback: F) -> Result<Subscription>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let category = EventCategory::try_from(code)?;
        self.subscribe(category, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn table_with(category: EventCategory) -> (SubscriptionTable, mpsc::Receiver<Event>) {
        let table = SubscriptionTable::new();
        let (tx, rx) = mpsc::channel();
        table
            .insert(
                category,
                Box::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();
        (table, rx)
    }

    #[test]
    fn duplicate_category_rejected() {
        let (table, _rx) = table_with(EventCategory::NewDataObject);
        let err = table
            .insert(EventCategory::NewDataObject, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySubscribed(EventCategory::NewDataObject)));
        assert!(table.insert(EventCategory::InterestList, Box::new(|_| {})).is_ok());
    }

    #[test]
    fn missing_or_empty_payload_skipped() {
        let (table, rx) = table_with(EventCategory::NewDataObject);
        table.dispatch(EventCategory::NewDataObject.code(), None);
        table.dispatch(EventCategory::NewDataObject.code(), Some(DataObject::new()));
        assert!(rx.try_recv().is_err());
        let cat = DataObject::new().with_attribute("Picture", "cat");
        table.dispatch(EventCategory::NewDataObject.code(), Some(cat.clone()));
        assert_eq!(rx.try_recv().unwrap(), Event::NewDataObject(cat));
    }

    #[test]
    fn interest_list_may_be_empty() {
        let (table, rx) = table_with(EventCategory::InterestList);
        table.dispatch(EventCategory::InterestList.code(), None);
        assert_eq!(rx.try_recv().unwrap(), Event::InterestList(Vec::new()));
    }

    #[test]
    fn shutdown_has_no_payload() {
        let (table, rx) = table_with(EventCategory::DaemonShutdown);
        table.dispatch(EventCategory::DaemonShutdown.code(), None);
        let event = rx.try_recv().unwrap();
        assert_eq!(event, Event::DaemonShutdown);
        assert!(event.data_object().is_none());
    }

    #[test]
    fn unknown_code_and_unsubscribed_category_dropped() {
        let (table, rx) = table_with(EventCategory::NewDataObject);
        table.dispatch(9, Some(DataObject::new().with_attribute("a", "b")));
        table.dispatch(
            EventCategory::NeighborUpdate.code(),
            Some(DataObject::new().with_attribute("a", "b")),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_code_never_reaches_daemon() {
        let (bg, cfg) = crate::session::tests::daemon();
        let session = crate::Session::register(&cfg, "PhotoShare").unwrap();
        let served = bg.requests_served();
        let err = session.subscribe_code(4, |_| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(c) if c.0 == 4));
        assert!(session.subscribe_code(-1, |_| {}).is_err());
        assert_eq!(bg.requests_served(), served);
    }

    #[test]
    fn duplicate_subscription_and_cancel() {
        let (_bg, cfg) = crate::session::tests::daemon();
        let session = crate::Session::register(&cfg, "a").unwrap();
        let sub = session.subscribe_code(2, |_| {}).unwrap();
        assert!(sub.is_active());
        assert!(matches!(
            session.subscribe(EventCategory::NewDataObject, |_| {}),
            Err(Error::AlreadySubscribed(EventCategory::NewDataObject))
        ));
        let other = session.subscribe(EventCategory::NeighborUpdate, |_| {}).unwrap();
        sub.cancel();
        assert!(session.subscribe(EventCategory::NewDataObject, |_| {}).is_ok());
        let handle = session.handle();
        session.close();
        assert!(!other.is_active());
        assert!(matches!(
            handle.subscribe(EventCategory::InterestList, |_| {}),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn empty_neighbor_update_skipped_end_to_end() {
        let (bg, cfg) = crate::session::tests::daemon();
        let session = crate::Session::register(&cfg, "a").unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .subscribe(EventCategory::NeighborUpdate, move |e| {
                let _ = tx.send(e);
            })
            .unwrap();
        session.run_detached().unwrap();
        bg.announce_neighbors(DataObject::new());
        let neighbors = DataObject::new().with_attribute("Neighbor", "node-2");
        bg.announce_neighbors(neighbors.clone());
        let first = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(first, Event::NeighborUpdate(neighbors));
    }

    #[test]
    fn remove_only_matching_entry() {
        let table = SubscriptionTable::new();
        let first = table.insert(EventCategory::NeighborUpdate, Box::new(|_| {})).unwrap();
        assert!(table.remove(EventCategory::NeighborUpdate, first));
        let second = table.insert(EventCategory::NeighborUpdate, Box::new(|_| {})).unwrap();
        assert!(!table.remove(EventCategory::NeighborUpdate, first));
        assert!(table.contains(EventCategory::NeighborUpdate, second));
    }
}
