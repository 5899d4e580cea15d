//! In-crate stand-in for the library, used by unit tests.

use super::*;
use crate::shim::condition::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MockState {
    pub(crate) finalize_calls: usize,
    pub(crate) next_id: usize,
    pub(crate) in_flight: usize,
    pub(crate) max_in_flight: usize,
    pub(crate) handlers: Vec<(Vec<EventCode>, Vec<Info>, EventHandler)>,
    pub(crate) notified: Vec<(EventCode, Vec<Info>)>,
}

#[derive(Default)]
pub(crate) struct MockPmix {
    pub(crate) fail_init: bool,
    pub(crate) fail_registration: Option<Status>,
    pub(crate) query_result: Vec<Info>,
    pub(crate) state: Arc<Mutex<MockState>>,
    pub(crate) acked: Arc<AtomicUsize>,
}

impl MockPmix {
    pub(crate) fn finalize_calls(&self) -> usize {
        lock(&self.state).finalize_calls
    }

    pub(crate) fn max_registrations_in_flight(&self) -> usize {
        lock(&self.state).max_in_flight
    }

    pub(crate) fn last_registration(&self) -> Option<(Vec<EventCode>, Vec<Info>)> {
        lock(&self.state)
            .handlers
            .last()
            .map(|(codes, attrs, _)| (codes.clone(), attrs.clone()))
    }

    pub(crate) fn notified(&self) -> Vec<(EventCode, Vec<Info>)> {
        lock(&self.state).notified.clone()
    }

    pub(crate) fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Deliver a notification on the calling thread to every matching handler.
    pub(crate) fn deliver(&self, n: Notification) {
        let handlers = lock(&self.state)
            .handlers
            .iter()
            .filter(|(codes, _, _)| codes.is_empty() || codes.contains(&n.code))
            .map(|(_, _, handler)| handler.clone())
            .collect::<Vec<_>>();

        for handler in handlers {
            let acked = self.acked.clone();
            handler(
                n.clone(),
                EventAck::new(move || {
                    acked.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
    }
}

impl ProcessControl for MockPmix {
    fn tool_init(&self, _: &[Info]) -> Result<Proc, Status> {
        if self.fail_init {
            return Err(Status(-1));
        }
        Ok(Proc::new("mpir.tool", Rank::Index(0)))
    }

    fn tool_finalize(&self) -> Result<(), Status> {
        lock(&self.state).finalize_calls += 1;
        Ok(())
    }

    fn connect_to_server(&self, _: &Proc, _: &[Info]) -> Result<(), Status> {
        Ok(())
    }

    fn register_event_handler(
        &self,
        codes: &[EventCode],
        attrs: &[Info],
        handler: EventHandler,
        on_registered: OnRegistered,
    ) {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            if self.fail_registration.is_none() {
                state.handlers.push((codes.to_vec(), attrs.to_vec(), handler));
            }
            state.next_id
        };

        let fail = self.fail_registration;
        let state = self.state.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            lock(&state).in_flight -= 1;
            match fail {
                Some(status) => on_registered(Err(status)),
                None => on_registered(Ok(HandlerId(id))),
            }
        });
    }

    fn deregister_event_handler(&self, _: HandlerId) -> Result<(), Status> {
        Ok(())
    }

    fn notify_event(&self, code: EventCode, attrs: &[Info]) -> Result<(), Status> {
        lock(&self.state).notified.push((code, attrs.to_vec()));
        Ok(())
    }

    fn query(&self, _: &[Query]) -> Result<Vec<Info>, Status> {
        Ok(self.query_result.clone())
    }

    fn spawn(&self, _: &[Info], _: &[App]) -> Result<String, Status> {
        Ok("prte.host.1".to_string())
    }

    fn get(&self, _: &Proc, key: &Key) -> Result<Value, Status> {
        match key {
            Key::ServerNspace => Ok(Value::Str("prte.host.1".to_string())),
            Key::ServerRank => Ok(Value::Rank(Rank::Index(0))),
            _ => Err(Status(-46)),
        }
    }

    fn error_string(&self, status: Status) -> String {
        format!("MOCK_STATUS({status})")
    }
}
