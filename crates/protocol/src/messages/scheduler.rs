use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tessera_core::{Arg, TaskKey, WorkerId};

use crate::message::Message;

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub key: TaskKey,
    pub function: String,
    pub args: Vec<Arg>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Arg>,
    /// Current holders of each dependency.
    #[serde(default)]
    pub who_has: BTreeMap<TaskKey, Vec<WorkerId>>,
    /// Size of each dependency, for fetch accounting.
    #[serde(default)]
    pub nbytes: BTreeMap<TaskKey, u64>,
    #[serde(default = "default_pure")]
    pub pure: bool,
    #[serde(default)]
    pub priority: u64,
}

fn default_pure() -> bool {
    true
}

/// Scheduler → worker instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum SchedulerMessage {
    Compute(ComputeRequest),
    /// Drop these keys from the store and acknowledge with `keys-released`.
    ReleaseKeys { keys: Vec<TaskKey> },
    /// Give `key` up if it has not started executing.
    StealRequest { key: TaskKey },
    /// Best-effort cancellation of a queued or running task.
    Cancel { key: TaskKey },
    Close { restart: bool },
}

impl SchedulerMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Compute(_) => "compute",
            Self::ReleaseKeys { .. } => "release-keys",
            Self::StealRequest { .. } => "steal-request",
            Self::Cancel { .. } => "cancel",
            Self::Close { .. } => "close",
        }
    }

    pub fn to_message(&self) -> Result<Message, rmp_serde::encode::Error> {
        Message::new(self.op(), self)
    }

    pub fn from_message(msg: &Message) -> Result<Self, rmp_serde::decode::Error> {
        msg.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Blob;

    #[test]
    fn compute_request_roundtrips_with_literals() {
        let mut who_has = BTreeMap::new();
        who_has.insert(TaskKey::from("a"), vec![WorkerId::from("w1")]);
        let req = ComputeRequest {
            key: TaskKey::from("add-1"),
            function: "add".into(),
            args: vec![
                Arg::Key(TaskKey::from("a")),
                Arg::Literal(Blob::encode(&5i64).unwrap()),
            ],
            kwargs: BTreeMap::new(),
            who_has,
            nbytes: BTreeMap::new(),
            pure: true,
            priority: 7,
        };
        let msg = SchedulerMessage::Compute(req.clone());
        let envelope = msg.to_message().unwrap();
        assert_eq!(envelope.op, "compute");

        match SchedulerMessage::from_message(&envelope).unwrap() {
            SchedulerMessage::Compute(decoded) => {
                assert_eq!(decoded, req);
                let Arg::Literal(blob) = &decoded.args[1] else {
                    panic!("expected literal");
                };
                assert_eq!(blob.decode::<i64>().unwrap(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_carries_restart_flag() {
        let msg = SchedulerMessage::Close { restart: true };
        let decoded = SchedulerMessage::from_message(&msg.to_message().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
