use crate::error::{RpcError, RpcResult};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::oneshot;

/// What a call asks the other side to do.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Payload {
    pub name: String,
    pub args: Vec<Value>,
}

/// Receiving half of a [`Call`]. Yields the single settlement.
pub type Settled = oneshot::Receiver<RpcResult>;

/// A pending invocation awaiting exactly one settlement.
///
/// `resolve` and `reject` race freely (timer vs. transport); only the first
/// one reaches the caller.
#[derive(Debug)]
pub struct Call {
    id: String,
    payload: Payload,
    settle: Mutex<Option<oneshot::Sender<RpcResult>>>,
}

impl Call {
    pub fn new(payload: Payload) -> (Arc<Self>, Settled) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(Self {
            id: generate_id(),
            payload,
            settle: Mutex::new(Some(tx)),
        });
        (call, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.payload.name
    }

    pub fn args(&self) -> &[Value] {
        &self.payload.args
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_resolved(&self) -> bool {
        self.settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Returns `false` if the call had already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    /// Returns `false` if the call had already settled.
    pub fn reject(&self, error: RpcError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: RpcResult) -> bool {
        let sender = self
            .settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The caller may have stopped waiting; the call still counts as settled.
                _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

struct Clock {
    last_ms: u64,
    seq: u32,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock { last_ms: 0, seq: 0 });

/// Timestamp, intra-millisecond sequence and a random suffix.
///
/// The timestamp never moves backwards within a process, so ids sort by
/// creation order even if the wall clock is adjusted.
pub fn generate_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let (ms, seq) = {
        let mut clock = CLOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if now > clock.last_ms {
            clock.last_ms = now;
            clock.seq = 0;
        } else {
            clock.seq = clock.seq.wrapping_add(1);
        }
        (clock.last_ms, clock.seq)
    };
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{ms:x}-{seq:x}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn multiply() -> Payload {
        Payload {
            name: "multiply".into(),
            args: vec![json!(3), json!(4)],
        }
    }

    #[tokio::test]
    async fn settles_once() {
        let (call, settled) = Call::new(multiply());
        assert!(!call.is_resolved());
        assert!(call.resolve(json!(12)));
        assert!(call.is_resolved());

        assert!(!call.resolve(json!(13)));
        assert!(!call.reject(RpcError::InvalidArguments));

        assert_eq!(settled.await.unwrap(), Ok(json!(12)));
    }

    #[tokio::test]
    async fn rejection_wins_when_first() {
        let (call, settled) = Call::new(multiply());
        assert!(call.reject(RpcError::TransportNotFound));
        assert!(!call.resolve(json!(12)));
        assert_eq!(settled.await.unwrap(), Err(RpcError::TransportNotFound));
    }

    #[test]
    fn settling_after_receiver_dropped() {
        let (call, settled) = Call::new(multiply());
        drop(settled);
        assert!(call.resolve(json!(1)));
        assert!(!call.resolve(json!(2)));
    }

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn ids_carry_payload_identity() {
        let (call, _settled) = Call::new(multiply());
        assert_eq!(call.name(), "multiply");
        assert_eq!(call.args(), &[json!(3), json!(4)]);
        assert_eq!(call.id().split('-').count(), 3);
    }
}
