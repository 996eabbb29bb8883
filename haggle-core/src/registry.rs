//! Host-driven application registry: the daemon passes requests in, the registry returns outbound actions.
//! Owns registrations, per-application interests and event routing, and the local data-object store.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::dataobject::{DataObject, DataObjectId, Interest};
use crate::event::EventCategory;
use crate::identity::ApplicationId;
use crate::protocol::{Command, Message, PROTOCOL_VERSION};
use crate::status;

/// Connection identifier assigned by the host.
pub type ConnId = u64;

/// What the host must do after feeding the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Write `Message` to connection.
    Send(ConnId, Message),
    /// Drop the connection (its registration was taken over).
    Close(ConnId),
    /// Stop accepting and exit once queued messages are flushed.
    Shutdown,
}

/// A registered application.
struct Application {
    name: String,
    session_id: u32,
    conn: ConnId,
    interests: Vec<Interest>,
    events: HashSet<EventCategory>,
    /// Objects already handed to this application.
    delivered: HashSet<DataObjectId>,
}

impl Application {
    fn wants(&self, dobj: &DataObject) -> bool {
        self.interests.iter().any(|i| i.matches_object(dobj))
    }
}

/// Application manager state. One per daemon.
pub struct ApplicationRegistry {
    apps: HashMap<ApplicationId, Application>,
    bound: HashMap<ConnId, ApplicationId>,
    /// Insertion-ordered store; delivery follows publish order.
    store: Vec<(DataObjectId, DataObject)>,
    next_session_id: u32,
    storage_dir: String,
    shutting_down: bool,
}

impl ApplicationRegistry {
    pub fn new(storage_dir: impl Into<String>) -> Self {
        Self {
            apps: HashMap::new(),
            bound: HashMap::new(),
            store: Vec::new(),
            next_session_id: 1,
            storage_dir: storage_dir.into(),
            shutting_down: false,
        }
    }

    pub fn application_count(&self) -> usize {
        self.apps.len()
    }

    pub fn stored_count(&self) -> usize {
        self.store.len()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.apps.contains_key(&ApplicationId::from_name(name))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Process one request from `conn`. The reply is always the first action.
    pub fn on_request(&mut self, conn: ConnId, seq: u64, command: Command) -> Vec<Outbound> {
        debug!(conn, seq, command = command.name(), "application request");
        if self.shutting_down {
            return vec![reply(conn, seq, status::SHUTTING_DOWN)];
        }
        match command {
            Command::Register {
                protocol_version,
                name,
            } => self.register(conn, seq, protocol_version, name),
            Command::Unregister { name } => self.unregister(conn, seq, &name),
            other => {
                let Some(app_id) = self.bound.get(&conn).copied() else {
                    return vec![reply(conn, seq, status::NOT_REGISTERED)];
                };
                self.on_bound_request(conn, seq, app_id, other)
            }
        }
    }

    fn on_bound_request(
        &mut self,
        conn: ConnId,
        seq: u64,
        app_id: ApplicationId,
        command: Command,
    ) -> Vec<Outbound> {
        match command {
            Command::Deregister => {
                self.remove_app(&app_id);
                vec![reply(conn, seq, status::NO_ERROR)]
            }
            Command::SubscribeEvent { category } => match EventCategory::try_from(category) {
                Ok(category) => {
                    if let Some(app) = self.apps.get_mut(&app_id) {
                        app.events.insert(category);
                    }
                    vec![reply(conn, seq, status::NO_ERROR)]
                }
                Err(_) => vec![reply(conn, seq, status::PARAM_ERROR)],
            },
            Command::Publish { object } => self.publish(conn, seq, app_id, object),
            Command::AddInterests { interests } => self.add_interests(conn, seq, app_id, interests),
            Command::RemoveInterests { interests } => {
                if interests.is_empty() {
                    return vec![reply(conn, seq, status::PARAM_ERROR)];
                }
                if let Some(app) = self.apps.get_mut(&app_id) {
                    app.interests
                        .retain(|have| !interests.iter().any(|i| i.same_key(have)));
                }
                vec![reply(conn, seq, status::NO_ERROR)]
            }
            Command::GetInterests => {
                let interests = self
                    .apps
                    .get(&app_id)
                    .map(|a| a.interests.clone())
                    .unwrap_or_default();
                vec![
                    reply(conn, seq, status::NO_ERROR),
                    event(
                        conn,
                        EventCategory::InterestList,
                        Some(DataObject::from_interests(&interests)),
                    ),
                ]
            }
            Command::GetDataObjects => {
                let mut out = vec![reply(conn, seq, status::NO_ERROR)];
                if let Some(app) = self.apps.get_mut(&app_id) {
                    app.delivered.clear();
                }
                out.extend(self.deliver_stored(&app_id));
                out
            }
            Command::DeleteDataObject { id } => {
                let before = self.store.len();
                self.store.retain(|(have, _)| *have != id);
                if self.store.len() == before {
                    return vec![reply(conn, seq, status::NOT_FOUND)];
                }
                for app in self.apps.values_mut() {
                    app.delivered.remove(&id);
                }
                debug!(%id, "data object deleted");
                vec![reply(conn, seq, status::NO_ERROR)]
            }
            Command::Shutdown => self.shutdown(conn, seq),
            Command::Register { .. } | Command::Unregister { .. } => {
                vec![reply(conn, seq, status::INTERNAL_ERROR)]
            }
        }
    }

    fn register(&mut self, conn: ConnId, seq: u64, version: u8, name: String) -> Vec<Outbound> {
        if version != PROTOCOL_VERSION {
            return vec![reply(conn, seq, status::PROTOCOL_ERROR)];
        }
        if name.is_empty() {
            return vec![reply(conn, seq, status::PARAM_ERROR)];
        }
        if self.bound.contains_key(&conn) {
            return vec![reply(conn, seq, status::REGISTRATION_ERROR)];
        }
        let app_id = ApplicationId::from_name(&name);
        if self.apps.contains_key(&app_id) {
            info!(name = %name, "application already registered");
            return vec![reply(conn, seq, status::BUSY_ERROR)];
        }
        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        info!(name = %name, %app_id, session_id, "application registered");
        self.apps.insert(
            app_id,
            Application {
                name,
                session_id,
                conn,
                interests: Vec::new(),
                events: HashSet::new(),
                delivered: HashSet::new(),
            },
        );
        self.bound.insert(conn, app_id);
        vec![Outbound::Send(
            conn,
            Message::Registered {
                seq,
                session_id,
                storage_dir: self.storage_dir.clone(),
            },
        )]
    }

    fn unregister(&mut self, conn: ConnId, seq: u64, name: &str) -> Vec<Outbound> {
        let app_id = ApplicationId::from_name(name);
        match self.remove_app(&app_id) {
            Some(app) => {
                info!(name, session_id = app.session_id, "application force-unregistered");
                let mut out = vec![reply(conn, seq, status::NO_ERROR)];
                if app.conn != conn {
                    out.push(Outbound::Close(app.conn));
                }
                out
            }
            None => vec![reply(conn, seq, status::NOT_REGISTERED)],
        }
    }

    fn publish(
        &mut self,
        conn: ConnId,
        seq: u64,
        publisher: ApplicationId,
        object: DataObject,
    ) -> Vec<Outbound> {
        if object.is_empty() {
            return vec![reply(conn, seq, status::PARAM_ERROR)];
        }
        let id = object.id();
        let mut out = vec![reply(conn, seq, status::NO_ERROR)];
        if let Some(app) = self.apps.get_mut(&publisher) {
            app.delivered.insert(id);
        }
        if self.store.iter().any(|(have, _)| *have == id) {
            debug!(%id, "data object already stored");
            return out;
        }
        debug!(%id, "data object stored");
        for app in self.apps.values_mut() {
            if app.delivered.contains(&id)
                || !app.events.contains(&EventCategory::NewDataObject)
                || !app.wants(&object)
            {
                continue;
            }
            app.delivered.insert(id);
            out.push(event(app.conn, EventCategory::NewDataObject, Some(object.clone())));
        }
        self.store.push((id, object));
        out
    }

    fn add_interests(
        &mut self,
        conn: ConnId,
        seq: u64,
        app_id: ApplicationId,
        interests: Vec<Interest>,
    ) -> Vec<Outbound> {
        if interests.is_empty() {
            return vec![reply(conn, seq, status::PARAM_ERROR)];
        }
        let mut out = vec![reply(conn, seq, status::NO_ERROR)];
        if let Some(app) = self.apps.get_mut(&app_id) {
            for interest in interests {
                match app.interests.iter_mut().find(|have| have.same_key(&interest)) {
                    Some(have) => have.weight = interest.weight,
                    None => app.interests.push(interest),
                }
            }
        }
        out.extend(self.deliver_stored(&app_id));
        out
    }

    /// New-data-object events for stored objects the application wants and has not seen.
    fn deliver_stored(&mut self, app_id: &ApplicationId) -> Vec<Outbound> {
        let Some(app) = self.apps.get_mut(app_id) else {
            return Vec::new();
        };
        if !app.events.contains(&EventCategory::NewDataObject) {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (id, dobj) in &self.store {
            if app.delivered.contains(id) || !app.wants(dobj) {
                continue;
            }
            app.delivered.insert(*id);
            out.push(event(app.conn, EventCategory::NewDataObject, Some(dobj.clone())));
        }
        out
    }

    fn shutdown(&mut self, conn: ConnId, seq: u64) -> Vec<Outbound> {
        info!("shutdown requested by application");
        self.shutting_down = true;
        let mut out = vec![reply(conn, seq, status::NO_ERROR)];
        for app in self.apps.values() {
            if app.events.contains(&EventCategory::DaemonShutdown) {
                out.push(event(app.conn, EventCategory::DaemonShutdown, None));
            }
        }
        out.push(Outbound::Shutdown);
        out
    }

    /// Host learned a new neighbor set. Fan out to neighbor-update subscribers.
    pub fn on_neighbor_update(&mut self, neighbors: DataObject) -> Vec<Outbound> {
        self.apps
            .values()
            .filter(|app| app.events.contains(&EventCategory::NeighborUpdate))
            .map(|app| event(app.conn, EventCategory::NeighborUpdate, Some(neighbors.clone())))
            .collect()
    }

    /// Connection gone: its registration is no longer live.
    pub fn on_disconnected(&mut self, conn: ConnId) {
        if let Some(app_id) = self.bound.get(&conn).copied() {
            if let Some(app) = self.remove_app(&app_id) {
                debug!(name = %app.name, conn, "application connection closed");
            }
        }
    }

    fn remove_app(&mut self, app_id: &ApplicationId) -> Option<Application> {
        let app = self.apps.remove(app_id)?;
        self.bound.remove(&app.conn);
        Some(app)
    }
}

fn reply(conn: ConnId, seq: u64, status: i32) -> Outbound {
    Outbound::Send(conn, Message::Reply { seq, status })
}

fn event(conn: ConnId, category: EventCategory, payload: Option<DataObject>) -> Outbound {
    Outbound::Send(
        conn,
        Message::Event {
            category: category.code(),
            payload,
        },
    )
}
