use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::UserId;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Waiting,
    Active,
    Ended,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_id: String,
    pub client_user_id: UserId,
    pub specialist_user_id: UserId,
    pub appointment_id: Option<i64>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(call_id: String, client_user_id: UserId, specialist_user_id: UserId, appointment_id: Option<i64>) -> Self {
        Self {
            call_id,
            client_user_id,
            specialist_user_id,
            appointment_id,
            status: CallStatus::Waiting,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, CallStatus::Waiting | CallStatus::Active)
    }

    /// Pair membership is unordered.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.client_user_id == a && self.specialist_user_id == b)
            || (self.client_user_id == b && self.specialist_user_id == a)
    }

    /// waiting -> active. Returns false if the session was not waiting.
    pub fn activate(&mut self) -> bool {
        if self.status != CallStatus::Waiting {
            return false;
        }
        self.status = CallStatus::Active;
        true
    }

    /// Any live state -> ended. Ending twice keeps the first `ended_at`.
    pub fn end(&mut self, at: DateTime<Utc>) -> bool {
        if self.status == CallStatus::Ended {
            return false;
        }
        self.status = CallStatus::Ended;
        self.ended_at = Some(at);
        true
    }
}

/// In-memory table of call sessions keyed by call id. Owned by the hub's
/// dispatch loop; not synchronized.
#[derive(Debug, Default)]
pub struct CallTable {
    sessions: HashMap<String, CallSession>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<&CallSession> {
        self.sessions.get(call_id)
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut CallSession> {
        self.sessions.get_mut(call_id)
    }

    /// Inserts a fresh waiting session, first ending any other live session
    /// for the same pair. Returns the call ids that were ended.
    pub fn open(&mut self, session: CallSession) -> Vec<String> {
        let now = Utc::now();
        let mut superseded = Vec::new();
        for existing in self.sessions.values_mut() {
            if existing.call_id != session.call_id
                && existing.is_live()
                && existing.is_between(session.client_user_id, session.specialist_user_id)
            {
                existing.end(now);
                superseded.push(existing.call_id.clone());
            }
        }
        self.sessions.insert(session.call_id.clone(), session);
        superseded
    }

    /// The live session between two users, if any.
    pub fn live_between(&self, a: UserId, b: UserId) -> Option<&CallSession> {
        self.sessions
            .values()
            .filter(|s| s.is_live() && s.is_between(a, b))
            .max_by_key(|s| s.created_at)
    }

    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ends live sessions for which `reachable` holds for neither participant,
    /// then drops ended sessions older than `retention`. Returns
    /// `(abandoned, evicted)` counts.
    pub fn sweep(&mut self, reachable: impl Fn(UserId) -> bool, retention: ChronoDuration) -> (usize, usize) {
        let now = Utc::now();
        let mut abandoned = 0;
        for session in self.sessions.values_mut() {
            if session.is_live() && !reachable(session.client_user_id) && !reachable(session.specialist_user_id) {
                session.end(now);
                abandoned += 1;
            }
        }

        let before = self.sessions.len();
        self.sessions.retain(|_, s| match s.ended_at {
            Some(ended_at) if s.status == CallStatus::Ended => now - ended_at < retention,
            _ => true,
        });
        (abandoned, before - self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(call_id: &str, client: UserId, specialist: UserId) -> CallSession {
        CallSession::new(call_id.to_string(), client, specialist, None)
    }

    #[test]
    fn follows_waiting_active_ended() {
        let mut s = session("abc", 100, 200);
        assert_eq!(s.status, CallStatus::Waiting);
        assert!(s.activate());
        assert_eq!(s.status, CallStatus::Active);
        assert!(!s.activate());

        assert!(s.end(Utc::now()));
        assert_eq!(s.status, CallStatus::Ended);
        assert!(s.ended_at.is_some());
        assert!(!s.is_live());
    }

    #[test]
    fn ended_is_terminal() {
        let mut s = session("abc", 100, 200);
        let first = Utc::now();
        s.end(first);
        assert!(!s.activate());
        assert!(!s.end(first + ChronoDuration::seconds(5)));
        assert_eq!(s.ended_at, Some(first));
    }

    #[test]
    fn pair_lookup_is_unordered() {
        let mut table = CallTable::new();
        table.open(session("abc", 100, 200));
        assert!(table.live_between(100, 200).is_some());
        assert!(table.live_between(200, 100).is_some());
        assert!(table.live_between(100, 300).is_none());
    }

    #[test]
    fn new_offer_for_same_pair_ends_previous() {
        let mut table = CallTable::new();
        table.open(session("first", 100, 200));
        let superseded = table.open(session("second", 200, 100));

        assert_eq!(superseded, vec!["first".to_string()]);
        assert_eq!(table.get("first").unwrap().status, CallStatus::Ended);
        assert_eq!(table.live_between(100, 200).unwrap().call_id, "second");
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn sweep_ends_abandoned_and_evicts_expired() {
        let mut table = CallTable::new();
        table.open(session("abandoned", 1, 2));
        table.open(session("half", 3, 4));
        table.open(session("old", 5, 6));
        table.get_mut("old").unwrap().end(Utc::now() - ChronoDuration::minutes(10));

        let (abandoned, evicted) = table.sweep(|u| u == 3, ChronoDuration::minutes(5));

        assert_eq!((abandoned, evicted), (1, 1));
        assert_eq!(table.get("abandoned").unwrap().status, CallStatus::Ended);
        assert!(table.get("half").unwrap().is_live());
        assert!(table.get("old").is_none());
    }
}
