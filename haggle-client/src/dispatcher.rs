//! Commands a session sends to the daemon. Each is one request/reply round trip; a negative
//! status comes back as `Error::Daemon` with the code untouched.

use haggle_core::{Command, DataObject, DataObjectId, Interest};
use tracing::debug;

use crate::error::Result;
use crate::session::SessionHandle;

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        let shared = self.shared()?;
        debug!(session = %self.name(), command = command.name(), "command");
        shared.conn.call(command)
    }

    pub fn publish(&self, dobj: &DataObject) -> Result<()> {
        self.send(Command::Publish {
            object: dobj.clone(),
        })
    }

    /// Add one interest; `None` weight means the daemon default.
    pub fn add_interest(&self, name: &str, value: &str, weight: Option<u32>) -> Result<()> {
        let interest = match weight {
            Some(w) => Interest::weighted(name, value, w),
            None => Interest::new(name, value),
        };
        self.add_interests(&[interest])
    }

    pub fn add_interests(&self, interests: &[Interest]) -> Result<()> {
        self.send(Command::AddInterests {
            interests: interests.to_vec(),
        })
    }

    pub fn delete_interest(&self, name: &str, value: &str) -> Result<()> {
        self.delete_interests(&[Interest::new(name, value)])
    }

    pub fn delete_interests(&self, interests: &[Interest]) -> Result<()> {
        self.send(Command::RemoveInterests {
            interests: interests.to_vec(),
        })
    }

    /// The interest set arrives later as an interest-list event.
    pub fn request_interests(&self) -> Result<()> {
        self.send(Command::GetInterests)
    }

    /// Every stored object matching the current interests arrives again as new-data-object events.
    pub fn request_data_objects(&self) -> Result<()> {
        self.send(Command::GetDataObjects)
    }

    pub fn delete_data_object(&self, dobj: &DataObject) -> Result<()> {
        self.delete_data_object_by_id(dobj.id())
    }

    pub fn delete_data_object_by_id(&self, id: DataObjectId) -> Result<()> {
        self.send(Command::DeleteDataObject { id })
    }

    /// Stop the daemon. Subscribers of daemon-shutdown hear about it first.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::session::tests::daemon;
    use crate::session::Session;
    use crate::subscription::Event;
    use haggle_core::{DataObject, EventCategory, Interest};
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn publish_reaches_interested_session() {
        let (_bg, cfg) = daemon();
        let reader = Session::register(&cfg, "reader").unwrap();
        let (tx, rx) = mpsc::channel();
        reader
            .subscribe(EventCategory::NewDataObject, move |e| {
                let _ = tx.send(e);
            })
            .unwrap();
        reader.add_interest("Picture", "cat", None).unwrap();
        reader.run_detached().unwrap();

        let writer = Session::register(&cfg, "writer").unwrap();
        let cat = DataObject::new().with_attribute("Picture", "cat");
        writer.publish(&cat).unwrap();
        writer
            .publish(&DataObject::new().with_attribute("Picture", "dog"))
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::NewDataObject(cat));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn request_interests_returns_full_set() {
        let (_bg, cfg) = daemon();
        let session = Session::register(&cfg, "PhotoShare").unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .subscribe(EventCategory::InterestList, move |e| {
                let _ = tx.send(e);
            })
            .unwrap();
        session.run_detached().unwrap();
        session.add_interest("Picture", "cat", Some(5)).unwrap();
        session
            .add_interests(&[Interest::new("Owner", "alice"), Interest::new("Owner", "bob")])
            .unwrap();
        session.delete_interest("Owner", "bob").unwrap();
        session.request_interests().unwrap();
        let Event::InterestList(mut interests) = rx.recv_timeout(WAIT).unwrap() else {
            panic!("expected interest list");
        };
        interests.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            interests,
            vec![Interest::weighted("Owner", "alice", 1), Interest::weighted("Picture", "cat", 5)]
        );
    }

    #[test]
    fn request_data_objects_redelivers() {
        let (_bg, cfg) = daemon();
        let session = Session::register(&cfg, "a").unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .subscribe(EventCategory::NewDataObject, move |e| {
                let _ = tx.send(e);
            })
            .unwrap();
        let cat = DataObject::new().with_attribute("Picture", "cat");
        session.publish(&cat).unwrap();
        session.add_interest("Picture", "*", None).unwrap();
        session.run_detached().unwrap();
        session.request_data_objects().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::NewDataObject(cat.clone()));
        session.request_data_objects().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::NewDataObject(cat));
    }

    #[test]
    fn delete_reports_daemon_status_verbatim() {
        let (_bg, cfg) = daemon();
        let session = Session::register(&cfg, "a").unwrap();
        let cat = DataObject::new().with_attribute("Picture", "cat");
        session.publish(&cat).unwrap();
        session.delete_data_object(&cat).unwrap();
        let err = session.delete_data_object_by_id(cat.id()).unwrap_err();
        assert!(matches!(err, Error::Daemon(s) if s.code() == -7));
        let err = session.add_interests(&[]).unwrap_err();
        assert!(matches!(err, Error::Daemon(s) if s.code() == -2));
    }

    #[test]
    fn shutdown_notifies_subscribers() {
        let (bg, cfg) = daemon();
        let watcher = Session::register(&cfg, "watcher").unwrap();
        let (tx, rx) = mpsc::channel();
        watcher
            .subscribe(EventCategory::DaemonShutdown, move |e| {
                let _ = tx.send(e);
            })
            .unwrap();
        watcher.run_detached().unwrap();
        let admin = Session::register(&cfg, "admin").unwrap();
        admin.shutdown().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::DaemonShutdown);
        bg.join();
        let deadline = std::time::Instant::now() + WAIT;
        while watcher.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!watcher.is_open());
    }
}
